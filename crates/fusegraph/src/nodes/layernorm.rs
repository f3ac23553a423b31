//! Layer Normalization Node
//!
//! Normalizes over the last axis with a scale and an optional shift
//! (`LayerNormalization(X, Scale, B?)`). May write into its input.
//!
//! @version 0.1.0
//! @author AutomataNexus Development Team

use fusegraph_core::{Arg, MemoryDesc, PrimitiveDesc, PrimitiveKind};

use super::{bind_output, copy_input_dims, push_primitive, reorder_to_plain, try_in_place};
use crate::accumulator::PrimitiveAccumulator;
use crate::error::{GraphError, GraphResult};
use crate::node::{AttrReader, LoweringContext, Node, PrimitiveNode};
use crate::tensor::TensorArena;

/// A layer normalization.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LayerNormNode {
    /// Variance epsilon.
    pub epsilon: f32,
}

impl LayerNormNode {
    pub(crate) fn from_attrs(name: &str, attrs: &AttrReader<'_>) -> GraphResult<Self> {
        let epsilon = attrs
            .float("epsilon")?
            .ok_or_else(|| GraphError::missing_attribute(name, "epsilon"))?;
        Ok(Self { epsilon })
    }
}

impl PrimitiveNode for LayerNormNode {
    fn primitive_kind(&self) -> PrimitiveKind {
        PrimitiveKind::LayerNormalization
    }

    fn calculate_output_dims(&self, node: &Node, arena: &mut TensorArena) -> GraphResult<()> {
        copy_input_dims(node, arena)
    }

    fn build_in_place(
        &self,
        node: &Node,
        acc: &mut PrimitiveAccumulator,
        cx: &mut LoweringContext<'_>,
    ) -> GraphResult<bool> {
        try_in_place(node, acc, cx)
    }

    fn generate_primitive(
        &self,
        node: &Node,
        acc: &mut PrimitiveAccumulator,
        cx: &mut LoweringContext<'_>,
    ) -> GraphResult<()> {
        let src = reorder_to_plain(cx, node.input_slot(0)?)?;
        let scale = node.input(cx.arena, 1)?.bound_memory()?.clone();
        let shift = if node.has_input(cx.arena, 2) {
            Some(node.input(cx.arena, 2)?.bound_memory()?.clone())
        } else {
            None
        };

        let out_slot = node.output_slot(0)?;
        let dst_desc = if acc.in_place {
            None
        } else {
            let output = cx.arena.get(out_slot);
            Some(MemoryDesc::any(
                &output.concrete_dims()?,
                acc.dst_type(output.dtype()),
            ))
        };
        let desc = PrimitiveDesc::layer_normalization(
            src.desc().clone(),
            dst_desc,
            self.epsilon,
            shift.is_some(),
        )?;
        let dst = if acc.in_place {
            src.clone()
        } else {
            bind_output(cx, out_slot, desc.dst_desc().clone())?
        };

        let mut args = std::mem::take(&mut acc.args);
        args.insert(Arg::Src, src);
        args.insert(Arg::Scale, scale);
        if let Some(shift) = shift {
            args.insert(Arg::Shift, shift);
        }
        args.insert(Arg::Dst, dst);
        push_primitive(cx, desc, acc.attr(), args)
    }
}
