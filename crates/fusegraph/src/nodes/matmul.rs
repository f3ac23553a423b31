//! MatMul Node
//!
//! Batched matrix multiplication, including the quantized `MatMulInteger`
//! form whose optional inputs 2 and 3 are the zero points of `A` and `B`.
//!
//! @version 0.1.0
//! @author AutomataNexus Development Team

use fusegraph_core::{
    Arg, ArgMap, DataType, MemoryDesc, PrimitiveAttr, PrimitiveDesc, PrimitiveKind, ZeroPoint,
};

use super::{bind_output, pad_front, push_primitive, reorder_to};
use crate::accumulator::PrimitiveAccumulator;
use crate::error::{GraphError, GraphResult};
use crate::node::{LoweringContext, Node, PrimitiveNode};
use crate::tensor::{Dim, TensorArena};

/// A matrix multiplication.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatMulNode {
    /// True for `MatMulInteger`.
    pub integer: bool,
}

impl MatMulNode {
    /// Creates a matmul node.
    #[must_use]
    pub const fn new(integer: bool) -> Self {
        Self { integer }
    }
}

/// Output dims: padded `a` with its last dim from `b`; unit batch dims take `b`'s.
pub(crate) fn matmul_output_dims(a: &[Dim], b: &[Dim]) -> Vec<Dim> {
    let rank = a.len().max(b.len());
    let a = pad_front(a, rank);
    let b = pad_front(b, rank);
    let mut dims = a.clone();
    if rank == 0 {
        return dims;
    }
    dims[rank - 1] = b[rank - 1];
    for axis in 0..rank.saturating_sub(2) {
        if a[axis] == Dim::Fixed(1) {
            dims[axis] = b[axis];
        }
    }
    dims
}

/// Binds the zero point at `input` to `arg` as a constant or runtime value.
fn bind_zero_point(
    node: &Node,
    input: usize,
    arg: Arg,
    runtime_arg: Arg,
    attr: &mut PrimitiveAttr,
    args: &mut ArgMap,
    cx: &mut LoweringContext<'_>,
) -> GraphResult<()> {
    if !node.has_input(cx.arena, input) {
        return Ok(());
    }
    let slot = node.input_slot(input)?;
    let tensor = cx.arena.get(slot);
    if !tensor.is_constant && tensor.dtype() != DataType::S32 {
        let desc = MemoryDesc::plain(tensor.desc()?.dims(), DataType::S32);
        reorder_to(cx, slot, &desc)?;
    }

    let tensor = cx.arena.get(slot);
    let memory = tensor.bound_memory()?.clone();
    if tensor.is_constant && memory.desc().dims() == [1] {
        let value = memory.load()?.first().copied().ok_or_else(|| {
            GraphError::InvalidGraph(format!("{}: empty zero point {}", node.name, tensor.name()))
        })?;
        attr.set_zero_point(arg, ZeroPoint::Constant(value.round() as i32))?;
    } else {
        attr.set_zero_point(arg, ZeroPoint::Runtime)?;
        args.insert(runtime_arg, memory);
    }
    Ok(())
}

impl PrimitiveNode for MatMulNode {
    fn primitive_kind(&self) -> PrimitiveKind {
        PrimitiveKind::MatMul
    }

    fn calculate_output_dims(&self, node: &Node, arena: &mut TensorArena) -> GraphResult<()> {
        let dims = matmul_output_dims(node.input(arena, 0)?.dims(), node.input(arena, 1)?.dims());
        let output = node.output_slot(0)?;
        arena.get_mut(output).set_dims(dims);
        Ok(())
    }

    fn generate_primitive(
        &self,
        node: &Node,
        acc: &mut PrimitiveAccumulator,
        cx: &mut LoweringContext<'_>,
    ) -> GraphResult<()> {
        let (a_slot, b_slot) = (node.input_slot(0)?, node.input_slot(1)?);
        let a = cx.arena.get(a_slot).input_desc()?;
        let b = cx.arena.get(b_slot).input_desc()?;
        let rank = a.ndims().max(b.ndims());
        let src_desc = a.padded(rank - a.ndims(), 0);
        let weights_desc = b.padded(rank - b.ndims(), 0);

        let out_slot = node.output_slot(0)?;
        let output = cx.arena.get(out_slot);
        let dst_desc = MemoryDesc::any(&output.concrete_dims()?, acc.dst_type(output.dtype()));
        let desc = PrimitiveDesc::matmul(src_desc, weights_desc, dst_desc)?;

        let mut attr = acc.attr();
        let mut args = std::mem::take(&mut acc.args);
        if self.integer {
            bind_zero_point(node, 2, Arg::Src, Arg::SrcZeroPoint, &mut attr, &mut args, cx)?;
            bind_zero_point(node, 3, Arg::Weights, Arg::WeightsZeroPoint, &mut attr, &mut args, cx)?;
        }

        let weights_desc = desc
            .weights_desc()
            .cloned()
            .ok_or_else(|| GraphError::InvalidGraph(format!("{}: matmul without weights", node.name)))?;
        let src = reorder_to(cx, a_slot, desc.src_desc())?;
        let weights = reorder_to(cx, b_slot, &weights_desc)?;
        let dst = bind_output(cx, out_slot, desc.dst_desc().clone())?;

        args.insert(Arg::Src, src);
        args.insert(Arg::Weights, weights);
        args.insert(Arg::Dst, dst);
        push_primitive(cx, desc, attr, args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::fixed_dims;

    #[test]
    fn test_output_dims() {
        let dims = matmul_output_dims(&fixed_dims(&[2, 3]), &fixed_dims(&[3, 5]));
        assert_eq!(dims, fixed_dims(&[2, 5]));

        let dims = matmul_output_dims(&fixed_dims(&[1, 4, 3]), &fixed_dims(&[6, 3, 5]));
        assert_eq!(dims, fixed_dims(&[6, 4, 5]));

        let dims = matmul_output_dims(&fixed_dims(&[4, 3]), &fixed_dims(&[2, 3, 5]));
        assert_eq!(dims, fixed_dims(&[2, 4, 5]));
    }

    #[test]
    fn test_output_dims_keep_dynamic_rows() {
        let dims = matmul_output_dims(&[Dim::Dynamic, Dim::Fixed(3)], &fixed_dims(&[3, 5]));
        assert_eq!(dims, vec![Dim::Dynamic, Dim::Fixed(5)]);
    }
}
