//! Node Kinds
//!
//! The closed set of operator kinds the compiler lowers. Each kind parses
//! its attributes once at build time and implements `PrimitiveNode`.
//!
//! @version 0.1.0
//! @author AutomataNexus Development Team

mod batchnorm;
mod binary;
mod conv;
mod eltwise;
mod layernorm;
mod matmul;
mod reorder;

pub use batchnorm::BatchNormNode;
pub use binary::BinaryNode;
pub use conv::{AutoPad, ConvNode};
pub use eltwise::EltwiseNode;
pub use layernorm::LayerNormNode;
pub use matmul::MatMulNode;
pub use reorder::ReorderNode;

use fusegraph_core::{
    ArgMap, Format, Memory, MemoryDesc, Primitive, PrimitiveAttr, PrimitiveDesc, PrimitiveKind,
};
use tracing::debug;

use crate::accumulator::PrimitiveAccumulator;
use crate::error::{GraphError, GraphResult};
use crate::node::{AttrReader, LoweringContext, Node, PrimitiveNode};
use crate::source::Attributes;
use crate::tables::PrimitiveTables;
use crate::tensor::{Dim, SlotId, TensorArena};

// =============================================================================
// Node Kind
// =============================================================================

/// Lowering behaviour of a node.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeKind {
    /// Broadcasting binary operation.
    Binary(BinaryNode),
    /// Elementwise unary operation.
    Eltwise(EltwiseNode),
    /// Matrix multiplication, optionally quantized.
    MatMul(MatMulNode),
    /// Cast or transpose.
    Reorder(ReorderNode),
    /// Layer normalization.
    LayerNormalization(LayerNormNode),
    /// 2-D convolution.
    Convolution(ConvNode),
    /// Inference batch normalization.
    BatchNormalization(BatchNormNode),
}

impl NodeKind {
    /// Builds the kind of a 1:1 operator, validating arity and attributes.
    pub fn build(
        name: &str,
        op_type: &str,
        attributes: &Attributes,
        num_inputs: usize,
        num_outputs: usize,
        tables: &PrimitiveTables,
    ) -> GraphResult<Self> {
        let unsupported = || GraphError::unsupported_operator(op_type, name);
        let primitive = tables.primitive_kind(op_type).ok_or_else(unsupported)?;
        let attrs = AttrReader::new(name, attributes);
        let arity = |inputs: usize| {
            check_arity(name, op_type, "inputs", inputs, num_inputs)?;
            check_arity(name, op_type, "outputs", 1, num_outputs)
        };

        let kind = match primitive {
            PrimitiveKind::Binary => {
                arity(2)?;
                let algorithm = tables.algorithm(op_type).ok_or_else(unsupported)?;
                Self::Binary(BinaryNode::new(algorithm))
            }
            PrimitiveKind::Eltwise => {
                arity(if op_type == "Pow" { 2 } else { 1 })?;
                let algorithm = tables.algorithm(op_type).ok_or_else(unsupported)?;
                Self::Eltwise(EltwiseNode::from_attrs(op_type, algorithm, &attrs)?)
            }
            PrimitiveKind::MatMul => {
                arity(2)?;
                Self::MatMul(MatMulNode::new(op_type == "MatMulInteger"))
            }
            PrimitiveKind::Reorder => {
                arity(1)?;
                match op_type {
                    "Cast" => Self::Reorder(ReorderNode::cast(name, &attrs)?),
                    "Transpose" => Self::Reorder(ReorderNode::transpose(name, &attrs)?),
                    _ => return Err(unsupported()),
                }
            }
            PrimitiveKind::LayerNormalization => {
                arity(2)?;
                Self::LayerNormalization(LayerNormNode::from_attrs(name, &attrs)?)
            }
            PrimitiveKind::Convolution => {
                arity(2)?;
                Self::Convolution(ConvNode::from_attrs(name, &attrs)?)
            }
            PrimitiveKind::BatchNormalization => {
                arity(5)?;
                Self::BatchNormalization(BatchNormNode::from_attrs(&attrs)?)
            }
            _ => return Err(unsupported()),
        };
        Ok(kind)
    }

    /// Returns the capability interface of this kind.
    pub fn as_primitive_node(&self) -> &dyn PrimitiveNode {
        match self {
            Self::Binary(node) => node,
            Self::Eltwise(node) => node,
            Self::MatMul(node) => node,
            Self::Reorder(node) => node,
            Self::LayerNormalization(node) => node,
            Self::Convolution(node) => node,
            Self::BatchNormalization(node) => node,
        }
    }
}

fn check_arity(
    node: &str,
    op_type: &str,
    role: &'static str,
    expected: usize,
    actual: usize,
) -> GraphResult<()> {
    if actual < expected {
        return Err(GraphError::ArityMismatch {
            node: node.to_string(),
            op_type: op_type.to_string(),
            role,
            expected,
            actual,
        });
    }
    Ok(())
}

// =============================================================================
// Shared lowering helpers
// =============================================================================

/// Prepends unit dims up to `rank`.
pub(crate) fn pad_front(dims: &[Dim], rank: usize) -> Vec<Dim> {
    let mut padded = vec![Dim::Fixed(1); rank.saturating_sub(dims.len())];
    padded.extend_from_slice(dims);
    padded
}

/// Output dims of a node that preserves its first input's shape.
pub(crate) fn copy_input_dims(node: &Node, arena: &mut TensorArena) -> GraphResult<()> {
    let dims = node.input(arena, 0)?.dims().to_vec();
    let output = node.output_slot(0)?;
    arena.get_mut(output).set_dims(dims);
    Ok(())
}

/// Converts the tensor behind `slot` to `desc` and returns its memory.
pub(crate) fn reorder_to(
    cx: &mut LoweringContext<'_>,
    slot: SlotId,
    desc: &MemoryDesc,
) -> GraphResult<Memory> {
    let engine = cx.engine;
    let tensor = cx.arena.get_mut(slot);
    tensor.reorder_memory(desc, cx.primitives, &engine)?;
    Ok(tensor.bound_memory()?.clone())
}

/// Converts the tensor behind `slot` to a dense row-major layout.
pub(crate) fn reorder_to_plain(cx: &mut LoweringContext<'_>, slot: SlotId) -> GraphResult<Memory> {
    let desc = cx.arena.get(slot).desc()?.clone();
    if desc.format() == Format::Plain {
        return Ok(cx.arena.get(slot).bound_memory()?.clone());
    }
    reorder_to(cx, slot, &MemoryDesc::plain(desc.dims(), desc.dtype()))
}

/// Allocates memory for `desc` and binds it to the tensor behind `slot`.
pub(crate) fn bind_output(
    cx: &mut LoweringContext<'_>,
    slot: SlotId,
    desc: MemoryDesc,
) -> GraphResult<Memory> {
    let memory = Memory::new(desc, &cx.engine)?;
    cx.arena.get_mut(slot).set_memory(memory.clone());
    Ok(memory)
}

/// Creates a primitive and appends it with its arguments.
pub(crate) fn push_primitive(
    cx: &mut LoweringContext<'_>,
    desc: PrimitiveDesc,
    attr: PrimitiveAttr,
    args: ArgMap,
) -> GraphResult<()> {
    let primitive = Primitive::new(desc, attr, &cx.engine)?;
    cx.primitives.push((primitive, args));
    Ok(())
}

/// Aliases the node's output to its first input when that is safe.
///
/// Declined when a fused cast or the node itself changes the element type,
/// when the output is a graph output, when input 0 is a graph input, a
/// constant or shared with another consumer, when shapes differ, or when
/// input 0 is not in a dense row-major layout.
pub(crate) fn try_in_place(
    node: &Node,
    acc: &mut PrimitiveAccumulator,
    cx: &mut LoweringContext<'_>,
) -> GraphResult<bool> {
    let (Ok(src_slot), Ok(dst_slot)) = (node.input_slot(0), node.output_slot(0)) else {
        return Ok(false);
    };
    let src = cx.arena.get(src_slot);
    let dst = cx.arena.get(dst_slot);
    let legal = src.exists()
        && acc.src_out_type.map_or(true, |t| t == src.dtype())
        && src.dtype() == dst.dtype()
        && !dst.is_graph_output
        && !src.is_graph_input
        && !src.is_constant
        && src.consumers() <= 1
        && src.dims() == dst.dims()
        && src.memory().is_some_and(|m| m.desc().is_plain());
    if !legal {
        return Ok(false);
    }
    debug!(node = %node.name, tensor = %src.name(), "writing output in place");
    cx.arena.alias(dst_slot, src_slot);
    acc.in_place = true;
    Ok(true)
}
