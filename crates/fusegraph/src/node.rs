//! Operation Nodes
//!
//! A `Node` is one lowered operator: its identity, attributes, operand slots
//! and the `NodeKind` implementing the lowering contract. Every kind answers
//! the same capability interface, `PrimitiveNode`:
//! - output dims for the bound input shapes;
//! - whether it can join a source primitive as a post-op;
//! - whether the source may write into its first input;
//! - appending itself as a post-op;
//! - emitting its own primitives as a sequence source.
//!
//! @version 0.1.0
//! @author AutomataNexus Development Team

use fusegraph_core::{Engine, PrimitiveKind};

use crate::accumulator::PrimitiveAccumulator;
use crate::error::{GraphError, GraphResult};
use crate::nodes::NodeKind;
use crate::source::{AttributeValue, Attributes};
use crate::tables::PrimitiveTables;
use crate::tensor::{CompiledPrimitive, SlotId, Tensor, TensorArena, EMPTY_SLOT};

// =============================================================================
// Node
// =============================================================================

/// Index of a node in build order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub usize);

/// One lowered operator.
#[derive(Debug, Clone)]
pub struct Node {
    /// Position in build order.
    pub id: NodeId,
    /// Node name.
    pub name: String,
    /// Operator type.
    pub op_type: String,
    /// Operator set version.
    pub since_version: i32,
    /// Attributes.
    pub attributes: Attributes,
    /// Input slots; absent operands use [`EMPTY_SLOT`].
    pub inputs: Vec<SlotId>,
    /// Output slots.
    pub outputs: Vec<SlotId>,
    /// Lowering behaviour.
    pub kind: NodeKind,
}

impl Node {
    /// Returns the slot of input `index`.
    pub fn input_slot(&self, index: usize) -> GraphResult<SlotId> {
        self.inputs
            .get(index)
            .copied()
            .ok_or_else(|| GraphError::IndexOutOfRange {
                node: self.name.clone(),
                index,
                count: self.inputs.len(),
            })
    }

    /// Returns the slot of output `index`.
    pub fn output_slot(&self, index: usize) -> GraphResult<SlotId> {
        self.outputs
            .get(index)
            .copied()
            .ok_or_else(|| GraphError::IndexOutOfRange {
                node: self.name.clone(),
                index,
                count: self.outputs.len(),
            })
    }

    /// Returns input `index`.
    pub fn input<'a>(&self, arena: &'a TensorArena, index: usize) -> GraphResult<&'a Tensor> {
        Ok(arena.get(self.input_slot(index)?))
    }

    /// Returns output `index`.
    pub fn output<'a>(&self, arena: &'a TensorArena, index: usize) -> GraphResult<&'a Tensor> {
        Ok(arena.get(self.output_slot(index)?))
    }

    /// True if input `index` is present and not the empty sentinel.
    #[must_use]
    pub fn has_input(&self, arena: &TensorArena, index: usize) -> bool {
        self.inputs
            .get(index)
            .is_some_and(|&slot| slot != EMPTY_SLOT && arena.get(slot).exists())
    }

    // -------------------------------------------------------------------------
    // Capability dispatch
    // -------------------------------------------------------------------------

    /// Primitive kind this node lowers to.
    #[must_use]
    pub fn primitive_kind(&self) -> PrimitiveKind {
        self.kind.as_primitive_node().primitive_kind()
    }

    /// Computes and records the output dims from the current input dims.
    pub fn calculate_output_dims(&self, arena: &mut TensorArena) -> GraphResult<()> {
        self.kind.as_primitive_node().calculate_output_dims(self, arena)
    }

    /// True if this node can be appended to `acc` as a post-op.
    #[must_use]
    pub fn is_post_op_compatible(
        &self,
        acc: &PrimitiveAccumulator,
        arena: &TensorArena,
        tables: &PrimitiveTables,
    ) -> bool {
        self.kind
            .as_primitive_node()
            .is_post_op_compatible(self, acc, arena, tables)
    }

    /// Tries to make this source write into its first input.
    pub fn build_in_place(
        &self,
        acc: &mut PrimitiveAccumulator,
        cx: &mut LoweringContext<'_>,
    ) -> GraphResult<bool> {
        self.kind.as_primitive_node().build_in_place(self, acc, cx)
    }

    /// Appends this node to the accumulator's post-op chain.
    pub fn generate_post_op(
        &self,
        acc: &mut PrimitiveAccumulator,
        cx: &mut LoweringContext<'_>,
    ) -> GraphResult<()> {
        self.kind.as_primitive_node().generate_post_op(self, acc, cx)
    }

    /// Emits this node's primitives as the source of a sequence.
    pub fn generate_primitive(
        &self,
        acc: &mut PrimitiveAccumulator,
        cx: &mut LoweringContext<'_>,
    ) -> GraphResult<()> {
        self.kind.as_primitive_node().generate_primitive(self, acc, cx)
    }
}

// =============================================================================
// Attribute access
// =============================================================================

/// Typed attribute lookup; string values are parsed.
pub(crate) struct AttrReader<'a> {
    node: &'a str,
    attributes: &'a Attributes,
}

impl<'a> AttrReader<'a> {
    pub(crate) fn new(node: &'a str, attributes: &'a Attributes) -> Self {
        Self { node, attributes }
    }

    fn invalid(&self, name: &str, value: &AttributeValue, expected: &str) -> GraphError {
        GraphError::invalid_attribute(self.node, name, format!("expected {expected}, got {value:?}"))
    }

    pub(crate) fn float(&self, name: &str) -> GraphResult<Option<f32>> {
        match self.attributes.get(name) {
            None => Ok(None),
            Some(AttributeValue::Float(v)) => Ok(Some(*v)),
            Some(AttributeValue::Int(v)) => Ok(Some(*v as f32)),
            Some(value @ AttributeValue::String(s)) => s
                .trim()
                .parse()
                .map(Some)
                .map_err(|_| self.invalid(name, value, "a float")),
            Some(value) => Err(self.invalid(name, value, "a float")),
        }
    }

    /// Like [`AttrReader::float`] but only accepts a float-typed value.
    pub(crate) fn strict_float(&self, name: &str) -> GraphResult<Option<f32>> {
        match self.attributes.get(name) {
            None => Ok(None),
            Some(AttributeValue::Float(v)) => Ok(Some(*v)),
            Some(value) => Err(self.invalid(name, value, "a FLOAT attribute")),
        }
    }

    pub(crate) fn int(&self, name: &str) -> GraphResult<Option<i64>> {
        match self.attributes.get(name) {
            None => Ok(None),
            Some(AttributeValue::Int(v)) => Ok(Some(*v)),
            Some(value @ AttributeValue::String(s)) => s
                .trim()
                .parse()
                .map(Some)
                .map_err(|_| self.invalid(name, value, "an integer")),
            Some(value) => Err(self.invalid(name, value, "an integer")),
        }
    }

    pub(crate) fn ints(&self, name: &str) -> GraphResult<Option<Vec<i64>>> {
        match self.attributes.get(name) {
            None => Ok(None),
            Some(AttributeValue::Ints(v)) => Ok(Some(v.clone())),
            Some(AttributeValue::Int(v)) => Ok(Some(vec![*v])),
            Some(value) => Err(self.invalid(name, value, "an integer list")),
        }
    }

    pub(crate) fn string(&self, name: &str) -> GraphResult<Option<String>> {
        match self.attributes.get(name) {
            None => Ok(None),
            Some(AttributeValue::String(s)) => Ok(Some(s.clone())),
            Some(value) => Err(self.invalid(name, value, "a string")),
        }
    }
}

// =============================================================================
// Lowering contract
// =============================================================================

/// Mutable state shared by every node while one compilation lowers.
#[derive(Debug)]
pub struct LoweringContext<'a> {
    /// Tensor arena.
    pub arena: &'a mut TensorArena,
    /// Operator tables.
    pub tables: &'a PrimitiveTables,
    /// Engine primitives and memories are created on.
    pub engine: Engine,
    /// Primitive list being built.
    pub primitives: &'a mut Vec<CompiledPrimitive>,
}

/// Capability interface every node kind implements.
pub trait PrimitiveNode {
    /// Primitive kind the node lowers to.
    fn primitive_kind(&self) -> PrimitiveKind;

    /// Computes and records the output dims.
    fn calculate_output_dims(&self, node: &Node, arena: &mut TensorArena) -> GraphResult<()>;

    /// True if the node can join `acc` as a post-op through `acc.input_idx`.
    fn is_post_op_compatible(
        &self,
        _node: &Node,
        _acc: &PrimitiveAccumulator,
        _arena: &TensorArena,
        _tables: &PrimitiveTables,
    ) -> bool {
        false
    }

    /// Aliases the output to input 0 when legal; returns whether it did.
    fn build_in_place(
        &self,
        _node: &Node,
        _acc: &mut PrimitiveAccumulator,
        _cx: &mut LoweringContext<'_>,
    ) -> GraphResult<bool> {
        Ok(false)
    }

    /// Appends the node to the accumulator's post-op chain.
    fn generate_post_op(
        &self,
        node: &Node,
        _acc: &mut PrimitiveAccumulator,
        _cx: &mut LoweringContext<'_>,
    ) -> GraphResult<()> {
        Err(GraphError::InvalidGraph(format!(
            "{} ({}) cannot be lowered as a post-op",
            node.name, node.op_type
        )))
    }

    /// Emits the node's primitives as a sequence source.
    fn generate_primitive(
        &self,
        node: &Node,
        acc: &mut PrimitiveAccumulator,
        cx: &mut LoweringContext<'_>,
    ) -> GraphResult<()>;
}
