//! Binary Node
//!
//! Broadcasting elementwise binary operators (`Add`, `Sub`, `Mul`, `Div`
//! and comparisons). As a source primitive both operands are made dense and
//! padded to a common rank. As a post-op the accumulated value occupies one
//! operand slot and the other operand must broadcast trivially: all ones, or
//! per-channel.
//!
//! @version 0.1.0
//! @author AutomataNexus Development Team

use fusegraph_core::memory::pad_to_equal_rank;
use fusegraph_core::{Algorithm, Arg, MemoryDesc, PrimitiveDesc, PrimitiveKind};

use super::{bind_output, pad_front, push_primitive, reorder_to_plain, try_in_place};
use crate::accumulator::PrimitiveAccumulator;
use crate::error::GraphResult;
use crate::node::{LoweringContext, Node, PrimitiveNode};
use crate::tables::PrimitiveTables;
use crate::tensor::{Dim, TensorArena};

/// A broadcasting binary operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BinaryNode {
    /// Binary algorithm.
    pub algorithm: Algorithm,
}

impl BinaryNode {
    /// Creates a binary node.
    #[must_use]
    pub const fn new(algorithm: Algorithm) -> Self {
        Self { algorithm }
    }

    fn is_order_sensitive(self) -> bool {
        matches!(self.algorithm, Algorithm::BinarySub | Algorithm::BinaryDiv)
    }
}

/// Broadcast output dims: after front padding, a unit dim of `a` takes `b`'s dim.
pub(crate) fn broadcast_output_dims(a: &[Dim], b: &[Dim]) -> Vec<Dim> {
    let rank = a.len().max(b.len());
    let a = pad_front(a, rank);
    let b = pad_front(b, rank);
    a.iter()
        .zip(b.iter())
        .map(|(&x, &y)| if x == Dim::Fixed(1) { y } else { x })
        .collect()
}

fn is_all_ones(dims: &[Dim]) -> bool {
    dims.iter().all(|&d| d == Dim::Fixed(1))
}

/// Every dim is 1 except index 1, which is a known extent other than 1.
fn is_per_channel(dims: &[Dim]) -> bool {
    dims.len() >= 2
        && matches!(dims[1], Dim::Fixed(c) if c != 1)
        && dims
            .iter()
            .enumerate()
            .all(|(i, &d)| i == 1 || d == Dim::Fixed(1))
}

impl PrimitiveNode for BinaryNode {
    fn primitive_kind(&self) -> PrimitiveKind {
        PrimitiveKind::Binary
    }

    fn calculate_output_dims(&self, node: &Node, arena: &mut TensorArena) -> GraphResult<()> {
        let dims = broadcast_output_dims(node.input(arena, 0)?.dims(), node.input(arena, 1)?.dims());
        let output = node.output_slot(0)?;
        arena.get_mut(output).set_dims(dims);
        Ok(())
    }

    fn is_post_op_compatible(
        &self,
        node: &Node,
        acc: &PrimitiveAccumulator,
        arena: &TensorArena,
        tables: &PrimitiveTables,
    ) -> bool {
        if !tables.accepts_post_op(acc.src_primitive, PrimitiveKind::Binary) {
            return false;
        }
        let Some(slot) = acc.input_idx.filter(|&slot| slot <= 1) else {
            return false;
        };
        if self.is_order_sensitive() && slot != 1 {
            return false;
        }
        let other_index = 1 - slot;
        if !node.has_input(arena, other_index) {
            return false;
        }
        let other = arena.get(node.inputs[other_index]).dims();
        if other.len() > acc.rank() {
            return false;
        }
        if is_all_ones(other) {
            return true;
        }
        if !is_per_channel(other) {
            return false;
        }
        let channel_axis = acc.rank() - other.len() + 1;
        matches!(acc.src_out_shape.get(channel_axis), Some(&Dim::Fixed(c)) if Dim::Fixed(c) == other[1])
    }

    fn build_in_place(
        &self,
        node: &Node,
        acc: &mut PrimitiveAccumulator,
        cx: &mut LoweringContext<'_>,
    ) -> GraphResult<bool> {
        try_in_place(node, acc, cx)
    }

    fn generate_post_op(
        &self,
        node: &Node,
        acc: &mut PrimitiveAccumulator,
        cx: &mut LoweringContext<'_>,
    ) -> GraphResult<()> {
        let slot = acc.input_idx.unwrap_or(0);
        let other = reorder_to_plain(cx, node.input_slot(1 - slot.min(1))?)?;
        let front = acc.rank().saturating_sub(other.desc().ndims());
        acc.post_ops
            .append_binary(self.algorithm, other.desc().padded(front, 0), slot == 1);
        acc.args.insert(Arg::PostOpSrc1(acc.num_post_ops), other);
        acc.num_post_ops += 1;
        Ok(())
    }

    fn generate_primitive(
        &self,
        node: &Node,
        acc: &mut PrimitiveAccumulator,
        cx: &mut LoweringContext<'_>,
    ) -> GraphResult<()> {
        let src0 = reorder_to_plain(cx, node.input_slot(0)?)?;
        let src1 = reorder_to_plain(cx, node.input_slot(1)?)?;
        let (desc0, desc1) = pad_to_equal_rank(src0.desc(), src1.desc());

        let scalar = node.input(cx.arena, 0)?.is_scalar && node.input(cx.arena, 1)?.is_scalar;
        let out_slot = node.output_slot(0)?;
        let output = cx.arena.get(out_slot);
        let dst_desc = if acc.in_place {
            desc0.clone()
        } else {
            MemoryDesc::any(&output.concrete_dims()?, acc.dst_type(output.dtype()))
        };

        let desc = PrimitiveDesc::binary(self.algorithm, desc0, desc1, dst_desc)?;
        let dst = if acc.in_place {
            src0.clone()
        } else {
            bind_output(cx, out_slot, desc.dst_desc().clone())?
        };
        cx.arena.get_mut(out_slot).is_scalar = scalar;

        let mut args = std::mem::take(&mut acc.args);
        args.insert(Arg::Src, src0);
        args.insert(Arg::Src1, src1);
        args.insert(Arg::Dst, dst);
        push_primitive(cx, desc, acc.attr(), args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::NodeId;
    use crate::nodes::NodeKind;
    use crate::source::Attributes;
    use crate::tensor::{fixed_dims, SlotId, Tensor};
    use fusegraph_core::DataType;

    fn acc(shape: &[usize]) -> PrimitiveAccumulator {
        let dims = shape.iter().map(|&d| Dim::Fixed(d)).collect();
        PrimitiveAccumulator::new(PrimitiveKind::Convolution, dims, DataType::F32)
    }

    #[test]
    fn test_broadcast_output_dims() {
        let a = [Dim::Fixed(2), Dim::Fixed(1), Dim::Fixed(4)];
        let b = [Dim::Fixed(3), Dim::Fixed(4)];
        assert_eq!(
            broadcast_output_dims(&a, &b),
            vec![Dim::Fixed(2), Dim::Fixed(3), Dim::Fixed(4)]
        );
    }

    #[test]
    fn test_broadcast_patterns() {
        assert!(is_all_ones(&[Dim::Fixed(1), Dim::Fixed(1)]));
        assert!(is_per_channel(&[Dim::Fixed(1), Dim::Fixed(8), Dim::Fixed(1), Dim::Fixed(1)]));
        assert!(!is_per_channel(&[Dim::Fixed(8)]));
        assert!(!is_per_channel(&[Dim::Fixed(2), Dim::Fixed(8)]));
        assert!(!is_per_channel(&[Dim::Fixed(1), Dim::Dynamic]));
    }

    #[test]
    fn test_post_op_compatibility() {
        let mut arena = TensorArena::new();
        let x = arena.intern(Tensor::new("x", fixed_dims(&[1, 8, 4, 4]), DataType::F32));
        let per_channel = arena.intern(Tensor::new("b", fixed_dims(&[1, 8, 1, 1]), DataType::F32));
        let wrong_channel = arena.intern(Tensor::new("c", fixed_dims(&[1, 4, 1, 1]), DataType::F32));
        let row = arena.intern(Tensor::new("r", fixed_dims(&[4]), DataType::F32));
        let y = arena.intern(Tensor::new("y", fixed_dims(&[1, 8, 4, 4]), DataType::F32));
        let tables = PrimitiveTables::new();

        let node = |algorithm, inputs: Vec<SlotId>| Node {
            id: NodeId(1),
            name: "bin".to_string(),
            op_type: "Add".to_string(),
            since_version: 1,
            attributes: Attributes::default(),
            inputs,
            outputs: vec![y],
            kind: NodeKind::Binary(BinaryNode::new(algorithm)),
        };
        let mut acc = acc(&[1, 8, 4, 4]);

        acc.input_idx = Some(0);
        assert!(node(Algorithm::BinaryAdd, vec![x, per_channel]).is_post_op_compatible(&acc, &arena, &tables));
        assert!(!node(Algorithm::BinaryAdd, vec![x, wrong_channel]).is_post_op_compatible(&acc, &arena, &tables));
        assert!(!node(Algorithm::BinaryAdd, vec![x, row]).is_post_op_compatible(&acc, &arena, &tables));
        assert!(!node(Algorithm::BinarySub, vec![x, per_channel]).is_post_op_compatible(&acc, &arena, &tables));

        acc.input_idx = Some(1);
        assert!(node(Algorithm::BinarySub, vec![per_channel, x]).is_post_op_compatible(&acc, &arena, &tables));
        assert!(node(Algorithm::BinaryDiv, vec![per_channel, x]).is_post_op_compatible(&acc, &arena, &tables));

        acc.src_primitive = PrimitiveKind::Softmax;
        assert!(!node(Algorithm::BinaryAdd, vec![per_channel, x]).is_post_op_compatible(&acc, &arena, &tables));
    }
}
