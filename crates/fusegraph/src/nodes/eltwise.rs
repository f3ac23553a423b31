//! Eltwise Node
//!
//! Elementwise unary operators. The destination keeps the source layout.
//!
//! @version 0.1.0
//! @author AutomataNexus Development Team

use fusegraph_core::{Algorithm, Arg, PrimitiveDesc, PrimitiveKind};

use super::{bind_output, copy_input_dims, push_primitive};
use crate::accumulator::PrimitiveAccumulator;
use crate::error::{GraphError, GraphResult};
use crate::node::{AttrReader, LoweringContext, Node, PrimitiveNode};
use crate::tables::PrimitiveTables;
use crate::tensor::TensorArena;

/// An elementwise unary operator.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EltwiseNode {
    /// Eltwise algorithm.
    pub algorithm: Algorithm,
    /// First algorithm parameter.
    pub alpha: f32,
    /// Second algorithm parameter; read from input 1 for `Pow`.
    pub beta: f32,
}

impl EltwiseNode {
    pub(crate) fn from_attrs(
        op_type: &str,
        algorithm: Algorithm,
        attrs: &AttrReader<'_>,
    ) -> GraphResult<Self> {
        let default_alpha = match op_type {
            "Elu" => 1.0,
            "LeakyRelu" => 0.01,
            _ => 0.0,
        };
        let alpha = if algorithm == Algorithm::EltwisePow {
            1.0
        } else {
            attrs.float("alpha")?.unwrap_or(default_alpha)
        };
        Ok(Self {
            algorithm,
            alpha,
            beta: attrs.float("beta")?.unwrap_or(0.0),
        })
    }

    /// Alpha and beta for the current bindings.
    fn parameters(&self, node: &Node, arena: &TensorArena) -> GraphResult<(f32, f32)> {
        if self.algorithm != Algorithm::EltwisePow {
            return Ok((self.alpha, self.beta));
        }
        let exponent = node.input(arena, 1)?.bound_memory()?.load()?;
        let beta = exponent.first().copied().ok_or_else(|| {
            GraphError::InvalidGraph(format!("{}: empty exponent tensor", node.name))
        })?;
        Ok((self.alpha, beta))
    }
}

impl PrimitiveNode for EltwiseNode {
    fn primitive_kind(&self) -> PrimitiveKind {
        PrimitiveKind::Eltwise
    }

    fn calculate_output_dims(&self, node: &Node, arena: &mut TensorArena) -> GraphResult<()> {
        copy_input_dims(node, arena)
    }

    fn is_post_op_compatible(
        &self,
        node: &Node,
        acc: &PrimitiveAccumulator,
        _arena: &TensorArena,
        tables: &PrimitiveTables,
    ) -> bool {
        if !tables.accepts_post_op(acc.src_primitive, PrimitiveKind::Eltwise) {
            return false;
        }
        if acc.input_idx != Some(0) {
            return false;
        }
        acc.src_primitive != PrimitiveKind::BatchNormalization || node.op_type == "Relu"
    }

    fn generate_post_op(
        &self,
        node: &Node,
        acc: &mut PrimitiveAccumulator,
        cx: &mut LoweringContext<'_>,
    ) -> GraphResult<()> {
        let (alpha, beta) = self.parameters(node, cx.arena)?;
        acc.post_ops.append_eltwise(self.algorithm, alpha, beta);
        acc.num_post_ops += 1;
        Ok(())
    }

    fn generate_primitive(
        &self,
        node: &Node,
        acc: &mut PrimitiveAccumulator,
        cx: &mut LoweringContext<'_>,
    ) -> GraphResult<()> {
        let (alpha, beta) = self.parameters(node, cx.arena)?;
        let input = node.input(cx.arena, 0)?;
        let scalar = input.is_scalar;
        let src = input.bound_memory()?.clone();
        let desc = PrimitiveDesc::eltwise(self.algorithm, alpha, beta, src.desc().clone())?;

        let out_slot = node.output_slot(0)?;
        let dst = bind_output(cx, out_slot, desc.dst_desc().clone())?;
        cx.arena.get_mut(out_slot).is_scalar = scalar;

        let mut args = std::mem::take(&mut acc.args);
        args.insert(Arg::Src, src);
        args.insert(Arg::Dst, dst);
        push_primitive(cx, desc, acc.attr(), args)
    }
}
