//! Batch Normalization Node
//!
//! Inference-mode `BatchNormalization(X, scale, B, mean, var)` using the
//! stored global statistics.
//!
//! @version 0.1.0
//! @author AutomataNexus Development Team

use fusegraph_core::{Arg, PrimitiveDesc, PrimitiveKind};

use super::{bind_output, copy_input_dims, push_primitive, reorder_to_plain};
use crate::accumulator::PrimitiveAccumulator;
use crate::error::GraphResult;
use crate::node::{AttrReader, LoweringContext, Node, PrimitiveNode};
use crate::tensor::TensorArena;

/// Default variance epsilon.
pub const DEFAULT_EPSILON: f32 = 1e-5;

/// An inference batch normalization.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BatchNormNode {
    /// Variance epsilon.
    pub epsilon: f32,
}

impl BatchNormNode {
    pub(crate) fn from_attrs(attrs: &AttrReader<'_>) -> GraphResult<Self> {
        Ok(Self {
            epsilon: attrs.float("epsilon")?.unwrap_or(DEFAULT_EPSILON),
        })
    }
}

impl PrimitiveNode for BatchNormNode {
    fn primitive_kind(&self) -> PrimitiveKind {
        PrimitiveKind::BatchNormalization
    }

    fn calculate_output_dims(&self, node: &Node, arena: &mut TensorArena) -> GraphResult<()> {
        copy_input_dims(node, arena)
    }

    fn generate_primitive(
        &self,
        node: &Node,
        acc: &mut PrimitiveAccumulator,
        cx: &mut LoweringContext<'_>,
    ) -> GraphResult<()> {
        let src = reorder_to_plain(cx, node.input_slot(0)?)?;
        let out_slot = node.output_slot(0)?;
        let dst_type = acc.dst_type(cx.arena.get(out_slot).dtype());
        let desc = PrimitiveDesc::batch_normalization(src.desc().clone(), dst_type, self.epsilon)?;

        let mut args = std::mem::take(&mut acc.args);
        for (index, arg) in [(1, Arg::Scale), (2, Arg::Shift), (3, Arg::Mean), (4, Arg::Variance)] {
            args.insert(arg, node.input(cx.arena, index)?.bound_memory()?.clone());
        }
        args.insert(Arg::Src, src);
        args.insert(Arg::Dst, bind_output(cx, out_slot, desc.dst_desc().clone())?);
        push_primitive(cx, desc, acc.attr(), args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{AttributeValue, Attributes};

    #[test]
    fn test_epsilon_default() {
        let attributes = Attributes::default();
        let node = BatchNormNode::from_attrs(&AttrReader::new("bn", &attributes)).unwrap();
        assert_eq!(node.epsilon, DEFAULT_EPSILON);

        let mut attributes = Attributes::default();
        attributes.insert("epsilon".to_string(), AttributeValue::Float(1e-3));
        let node = BatchNormNode::from_attrs(&AttrReader::new("bn", &attributes)).unwrap();
        assert_eq!(node.epsilon, 1e-3);
    }
}
