//! Primitive Accumulator
//!
//! State threaded through one fused sequence: the source primitive's kind,
//! output shape and element types, the post-op chain built so far and the
//! extra arguments the chain needs at execution.
//!
//! @version 0.1.0
//! @author AutomataNexus Development Team

use fusegraph_core::{ArgMap, DataType, PostOps, PrimitiveAttr, PrimitiveKind};

use crate::tensor::Dim;

/// Maximum number of post-ops fused onto one source primitive.
pub const MAX_POST_OPS: usize = 32;

/// Post-op accumulation state for one fused sequence.
#[derive(Debug, Clone)]
pub struct PrimitiveAccumulator {
    /// Kind of the source primitive.
    pub src_primitive: PrimitiveKind,
    /// Output dims of the source primitive.
    pub src_out_shape: Vec<Dim>,
    /// Element type of the source's first input.
    pub src_in_type: DataType,
    /// Destination type forced by a fused cast.
    pub src_out_type: Option<DataType>,
    /// Post-op chain.
    pub post_ops: PostOps,
    /// Number of post-ops counted against [`MAX_POST_OPS`].
    pub num_post_ops: usize,
    /// Operand of the current post-op node fed by the accumulated value.
    pub input_idx: Option<usize>,
    /// Extra execution arguments of the chain.
    pub args: ArgMap,
    /// True once the source writes into its first input.
    pub in_place: bool,
}

impl PrimitiveAccumulator {
    /// Creates an empty accumulator for a source primitive.
    #[must_use]
    pub fn new(src_primitive: PrimitiveKind, src_out_shape: Vec<Dim>, src_in_type: DataType) -> Self {
        Self {
            src_primitive,
            src_out_shape,
            src_in_type,
            src_out_type: None,
            post_ops: PostOps::new(),
            num_post_ops: 0,
            input_idx: None,
            args: ArgMap::default(),
            in_place: false,
        }
    }

    /// True while another counted post-op fits.
    #[must_use]
    pub fn has_capacity(&self) -> bool {
        self.num_post_ops < MAX_POST_OPS
    }

    /// Destination type: the fused cast's target, else `default`.
    #[must_use]
    pub fn dst_type(&self, default: DataType) -> DataType {
        self.src_out_type.unwrap_or(default)
    }

    /// Rank of the source output.
    #[must_use]
    pub fn rank(&self) -> usize {
        self.src_out_shape.len()
    }

    /// Primitive attributes carrying the post-op chain.
    #[must_use]
    pub fn attr(&self) -> PrimitiveAttr {
        let mut attr = PrimitiveAttr::new();
        attr.set_post_ops(self.post_ops.clone());
        attr
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capacity() {
        let mut acc = PrimitiveAccumulator::new(PrimitiveKind::MatMul, vec![Dim::Fixed(2)], DataType::F32);
        assert!(acc.has_capacity());
        acc.num_post_ops = MAX_POST_OPS;
        assert!(!acc.has_capacity());
    }

    #[test]
    fn test_dst_type() {
        let mut acc = PrimitiveAccumulator::new(PrimitiveKind::Binary, Vec::new(), DataType::F32);
        assert_eq!(acc.dst_type(DataType::F32), DataType::F32);
        acc.src_out_type = Some(DataType::BF16);
        assert_eq!(acc.dst_type(DataType::F32), DataType::BF16);
    }
}
