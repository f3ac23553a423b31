//! Reorder Node
//!
//! `Cast` converts the element type while keeping the source strides;
//! `Transpose` reads a permuted strided view of the source into a dense
//! destination. Only `Cast` can fuse, and only as an implicit conversion of
//! the source primitive's destination.
//!
//! @version 0.1.0
//! @author AutomataNexus Development Team

use fusegraph_core::{Arg, ArgMap, DataType, MemoryDesc, Primitive, PrimitiveKind};

use super::{bind_output, reorder_to_plain};
use crate::accumulator::PrimitiveAccumulator;
use crate::error::{GraphError, GraphResult};
use crate::node::{AttrReader, LoweringContext, Node, PrimitiveNode};
use crate::tables::PrimitiveTables;
use crate::tensor::TensorArena;

/// A layout or type conversion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReorderNode {
    /// Element type conversion.
    Cast {
        /// Target element type.
        to: DataType,
    },
    /// Axis permutation; `None` reverses the axes.
    Transpose {
        /// Output axis `i` reads input axis `perm[i]`.
        perm: Option<Vec<usize>>,
    },
}

/// Maps a host element type code of the `to` attribute.
fn cast_target(code: i64) -> Option<DataType> {
    match code {
        1 => Some(DataType::F32),
        10 => Some(DataType::F16),
        16 => Some(DataType::BF16),
        6 => Some(DataType::S32),
        3 => Some(DataType::S8),
        2 => Some(DataType::U8),
        _ => None,
    }
}

impl ReorderNode {
    pub(crate) fn cast(name: &str, attrs: &AttrReader<'_>) -> GraphResult<Self> {
        let code = attrs
            .int("to")?
            .ok_or_else(|| GraphError::missing_attribute(name, "to"))?;
        let to = cast_target(code).ok_or_else(|| {
            GraphError::invalid_attribute(name, "to", format!("unsupported element type code {code}"))
        })?;
        Ok(Self::Cast { to })
    }

    pub(crate) fn transpose(name: &str, attrs: &AttrReader<'_>) -> GraphResult<Self> {
        let perm = attrs
            .ints("perm")?
            .map(|perm| {
                perm.into_iter()
                    .map(|axis| {
                        usize::try_from(axis).map_err(|_| {
                            GraphError::invalid_attribute(name, "perm", format!("negative axis {axis}"))
                        })
                    })
                    .collect::<GraphResult<Vec<_>>>()
            })
            .transpose()?;
        Ok(Self::Transpose { perm })
    }

    /// Resolves the permutation for a given rank.
    fn permutation(&self, node: &Node, rank: usize) -> GraphResult<Vec<usize>> {
        let perm = match self {
            Self::Transpose { perm: Some(perm) } => perm.clone(),
            _ => (0..rank).rev().collect(),
        };
        let mut seen = vec![false; rank];
        let valid = perm.len() == rank
            && perm.iter().all(|&axis| {
                axis < rank && !std::mem::replace(&mut seen[axis], true)
            });
        if !valid {
            return Err(GraphError::invalid_attribute(
                &node.name,
                "perm",
                format!("{perm:?} is not a permutation of {rank} axes"),
            ));
        }
        Ok(perm)
    }
}

impl PrimitiveNode for ReorderNode {
    fn primitive_kind(&self) -> PrimitiveKind {
        PrimitiveKind::Reorder
    }

    fn calculate_output_dims(&self, node: &Node, arena: &mut TensorArena) -> GraphResult<()> {
        let input = node.input(arena, 0)?.dims().to_vec();
        let dims = match self {
            Self::Cast { .. } => input,
            Self::Transpose { .. } => self
                .permutation(node, input.len())?
                .into_iter()
                .map(|axis| input[axis])
                .collect(),
        };
        let output = node.output_slot(0)?;
        arena.get_mut(output).set_dims(dims);
        Ok(())
    }

    fn is_post_op_compatible(
        &self,
        _node: &Node,
        acc: &PrimitiveAccumulator,
        _arena: &TensorArena,
        tables: &PrimitiveTables,
    ) -> bool {
        let Self::Cast { to } = self else {
            return false;
        };
        tables.accepts_post_op(acc.src_primitive, PrimitiveKind::Reorder)
            && tables.is_implicit_cast_compatible(acc.src_primitive, acc.src_in_type, *to)
    }

    fn generate_post_op(
        &self,
        node: &Node,
        acc: &mut PrimitiveAccumulator,
        _cx: &mut LoweringContext<'_>,
    ) -> GraphResult<()> {
        match self {
            Self::Cast { to } => {
                acc.src_out_type = Some(*to);
                Ok(())
            }
            Self::Transpose { .. } => Err(GraphError::InvalidGraph(format!(
                "{}: transpose cannot be fused",
                node.name
            ))),
        }
    }

    fn generate_primitive(
        &self,
        node: &Node,
        _acc: &mut PrimitiveAccumulator,
        cx: &mut LoweringContext<'_>,
    ) -> GraphResult<()> {
        let in_slot = node.input_slot(0)?;
        let scalar = cx.arena.get(in_slot).is_scalar;
        let (src, src_desc, dst_desc) = match self {
            Self::Cast { to } => {
                let src = cx.arena.get(in_slot).bound_memory()?.clone();
                let desc = src.desc().clone();
                let dst = MemoryDesc::strided(desc.dims(), *to, desc.strides())?;
                (src, desc, dst)
            }
            Self::Transpose { .. } => {
                let src = reorder_to_plain(cx, in_slot)?;
                let desc = src.desc();
                let perm = self.permutation(node, desc.ndims())?;
                let dims: Vec<usize> = perm.iter().map(|&axis| desc.dims()[axis]).collect();
                let strides: Vec<usize> = perm.iter().map(|&axis| desc.strides()[axis]).collect();
                let view = MemoryDesc::strided(&dims, desc.dtype(), &strides)?;
                let dst = MemoryDesc::plain(&dims, desc.dtype());
                (src, view, dst)
            }
        };

        let out_slot = node.output_slot(0)?;
        let dst = bind_output(cx, out_slot, dst_desc.clone())?;
        cx.arena.get_mut(out_slot).is_scalar = scalar;

        let primitive = Primitive::reorder(&src_desc, &dst_desc, &cx.engine)?;
        let mut args = ArgMap::default();
        args.insert(Arg::Src, src);
        args.insert(Arg::Dst, dst);
        cx.primitives.push((primitive, args));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{AttributeValue, Attributes};

    #[test]
    fn test_cast_targets() {
        assert_eq!(cast_target(1), Some(DataType::F32));
        assert_eq!(cast_target(16), Some(DataType::BF16));
        assert_eq!(cast_target(2), Some(DataType::U8));
        assert_eq!(cast_target(7), None);
    }

    #[test]
    fn test_transpose_rejects_negative_axes() {
        let mut attributes = Attributes::default();
        attributes.insert("perm".to_string(), AttributeValue::Ints(vec![1, -1]));
        let attrs = AttrReader::new("t", &attributes);
        assert!(ReorderNode::transpose("t", &attrs).is_err());
    }
}
