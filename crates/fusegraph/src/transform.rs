//! Graph Transformer - Rewrites and Post-op Fusion
//!
//! Two passes over the built node graph. The rewrite pass drops quantized
//! matmul weight zero points that are constant zero. The fusion pass walks
//! the nodes once in order and greedily grows each sequence while the next
//! node directly consumes the last fused node's single output and accepts
//! being appended as a post-op. There is no backtracking.
//!
//! @version 0.1.0
//! @author AutomataNexus Development Team

use fusegraph_core::DataType;
use tracing::{debug, info, warn};

use crate::accumulator::PrimitiveAccumulator;
use crate::node::{Node, NodeId};
use crate::nodes::{NodeKind, ReorderNode};
use crate::source::SourceGraph;
use crate::tables::PrimitiveTables;
use crate::tensor::{TensorArena, EMPTY_SLOT};

// =============================================================================
// Fused Sequences
// =============================================================================

/// One post-op appended to a sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PostOpEntry {
    /// The post-op node.
    pub node: NodeId,
    /// Operand of the node fed by the accumulated value.
    pub slot: usize,
}

/// A source node and the post-ops fused onto it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FusedSequence {
    /// Node emitting the primitive.
    pub source: NodeId,
    /// Post-ops in execution order.
    pub post_ops: Vec<PostOpEntry>,
}

impl FusedSequence {
    fn new(source: NodeId) -> Self {
        Self {
            source,
            post_ops: Vec::new(),
        }
    }

    /// Node whose output is the sequence output.
    #[must_use]
    pub fn last(&self) -> NodeId {
        self.post_ops.last().map_or(self.source, |entry| entry.node)
    }
}

// =============================================================================
// Transformer
// =============================================================================

/// Runs the rewrite and fusion passes.
#[derive(Debug)]
pub struct GraphTransformer<'a> {
    tables: &'a PrimitiveTables,
    enable_fusion: bool,
}

impl<'a> GraphTransformer<'a> {
    /// Creates a transformer.
    #[must_use]
    pub fn new(tables: &'a PrimitiveTables, enable_fusion: bool) -> Self {
        Self {
            tables,
            enable_fusion,
        }
    }

    /// Removes all-zero constant weight zero points from `MatMulInteger`.
    ///
    /// Returns the number of operands removed.
    pub fn eliminate_zero_points(
        &self,
        nodes: &mut [Node],
        arena: &TensorArena,
        source: &SourceGraph,
    ) -> usize {
        let mut removed = 0;
        for node in nodes.iter_mut().filter(|n| n.op_type == "MatMulInteger") {
            if !node.has_input(arena, 3) {
                continue;
            }
            let name = arena.get(node.inputs[3]).name();
            let Some(init) = source.initializer(name) else {
                continue;
            };
            match init.unpack_i8() {
                Some(values) if values.iter().all(|&v| v == 0) => {
                    info!(node = %node.name, zero_point = %name, "eliding zero weight zero point");
                    node.inputs[3] = EMPTY_SLOT;
                    removed += 1;
                }
                Some(_) => {}
                None => warn!(
                    node = %node.name,
                    zero_point = %name,
                    elem_type = ?init.elem_type,
                    "could not decode weight zero point"
                ),
            }
        }
        removed
    }

    /// Partitions `nodes` into fused sequences.
    ///
    /// A closed sequence with post-ops takes over the outputs of its last
    /// node, so the source writes the sequence result directly.
    pub fn fuse(&self, nodes: &mut [Node], arena: &TensorArena) -> Vec<FusedSequence> {
        let mut sequences = Vec::new();
        let mut index = 0;
        while index < nodes.len() {
            let source = &nodes[index];
            let mut sequence = FusedSequence::new(source.id);
            let mut acc = accumulator(source, arena);
            index += 1;

            while self.enable_fusion && index < nodes.len() {
                let last = &nodes[sequence.last().0];
                let candidate = &nodes[index];
                let Some(slot) = self.fusion_slot(last, candidate, &acc, arena) else {
                    break;
                };
                acc.input_idx = Some(slot);
                let compatible = candidate.is_post_op_compatible(&acc, arena, self.tables);
                acc.input_idx = None;
                if !compatible {
                    debug!(
                        source = %nodes[sequence.source.0].name,
                        candidate = %candidate.name,
                        slot,
                        "post-op not compatible"
                    );
                    break;
                }
                match &candidate.kind {
                    NodeKind::Reorder(ReorderNode::Cast { to }) => acc.src_out_type = Some(*to),
                    _ => acc.num_post_ops += 1,
                }
                debug!(
                    source = %nodes[sequence.source.0].name,
                    post_op = %candidate.name,
                    slot,
                    "fused post-op"
                );
                sequence.post_ops.push(PostOpEntry {
                    node: candidate.id,
                    slot,
                });
                index += 1;
            }

            let last = sequence.last();
            if last != sequence.source {
                nodes[sequence.source.0].outputs = nodes[last.0].outputs.clone();
            }
            sequences.push(sequence);
        }
        sequences
    }

    /// Operand of `candidate` fed by `last`, if fusing them is structurally legal.
    fn fusion_slot(
        &self,
        last: &Node,
        candidate: &Node,
        acc: &PrimitiveAccumulator,
        arena: &TensorArena,
    ) -> Option<usize> {
        let slot = candidate.inputs.iter().position(|&input| {
            input != EMPTY_SLOT
                && last
                    .outputs
                    .iter()
                    .any(|&output| output != EMPTY_SLOT && arena.same_tensor(input, output))
        })?;
        let [output] = last.outputs.as_slice() else {
            return None;
        };
        let output = arena.get(*output);
        if output.consumers() != 1 || output.is_graph_output {
            debug!(node = %last.name, tensor = %output.name(), "output is shared, closing sequence");
            return None;
        }
        if !acc.has_capacity() {
            debug!(node = %last.name, "post-op limit reached, closing sequence");
            return None;
        }
        Some(slot)
    }
}

/// Accumulator describing `source` with its build-time shapes.
fn accumulator(source: &Node, arena: &TensorArena) -> PrimitiveAccumulator {
    let out_shape = source
        .output(arena, 0)
        .map(|t| t.dims().to_vec())
        .unwrap_or_default();
    let in_type = source.input(arena, 0).map_or(DataType::Undef, |t| t.dtype());
    PrimitiveAccumulator::new(source.primitive_kind(), out_shape, in_type)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::GraphBuilder;
    use crate::source::{ElementType, Initializer, OperandDesc, SourceNode};

    fn operand(name: &str, dims: &[i64]) -> OperandDesc {
        OperandDesc::new(name, dims, ElementType::Float)
    }

    fn relu_chain(len: usize) -> SourceGraph {
        let mut graph = SourceGraph::new("chain");
        graph.add_node(
            SourceNode::new("MatMul", "mm")
                .input(operand("a", &[2, 3]))
                .input(operand("b", &[3, 4]))
                .output(operand("t0", &[2, 4])),
        );
        for i in 0..len {
            graph.add_node(
                SourceNode::new("Relu", &format!("relu{i}"))
                    .input(operand(&format!("t{i}"), &[2, 4]))
                    .output(operand(&format!("t{}", i + 1), &[2, 4])),
            );
        }
        graph.add_input("a");
        graph.add_input("b");
        graph.add_output(&format!("t{len}"));
        graph
    }

    fn fuse(graph: &SourceGraph, enable: bool) -> (Vec<Node>, TensorArena, Vec<FusedSequence>) {
        let tables = PrimitiveTables::new();
        let mut built = GraphBuilder::new(&tables).build(graph).unwrap();
        let sequences = GraphTransformer::new(&tables, enable).fuse(&mut built.nodes, &built.arena);
        (built.nodes, built.arena, sequences)
    }

    #[test]
    fn test_chain_fuses_into_one_sequence() {
        let (nodes, arena, sequences) = fuse(&relu_chain(3), true);
        assert_eq!(sequences.len(), 1);
        assert_eq!(sequences[0].post_ops.len(), 3);
        assert!(sequences[0].post_ops.iter().all(|e| e.slot == 0));
        assert_eq!(arena.get(nodes[0].outputs[0]).name(), "t3");
    }

    #[test]
    fn test_post_op_limit() {
        let (nodes, _, sequences) = fuse(&relu_chain(40), true);
        assert!(sequences.len() >= 2);
        assert_eq!(sequences[0].post_ops.len(), 32);
        // eltwise sources take no eltwise post-ops, so the rest stay unfused
        assert_eq!(nodes[sequences[1].source.0].name, "relu32");
        assert_eq!(sequences.len(), 9);
    }

    #[test]
    fn test_fusion_disabled() {
        let (_, _, sequences) = fuse(&relu_chain(3), false);
        assert_eq!(sequences.len(), 4);
        assert!(sequences.iter().all(|s| s.post_ops.is_empty()));
    }

    #[test]
    fn test_shared_output_closes_sequence() {
        let mut graph = relu_chain(1);
        graph.add_output("t0");
        let (_, _, sequences) = fuse(&graph, true);
        assert_eq!(sequences.len(), 2);
    }

    #[test]
    fn test_zero_point_elision() {
        let mut graph = SourceGraph::new("q");
        graph.add_node(
            SourceNode::new("MatMulInteger", "mmi")
                .input(OperandDesc::new("a", &[2, 3], ElementType::Uint8))
                .input(OperandDesc::new("b", &[3, 4], ElementType::Int8).constant())
                .input(OperandDesc::new("a_zp", &[1], ElementType::Uint8).constant())
                .input(OperandDesc::new("b_zp", &[1], ElementType::Int8).constant())
                .output(OperandDesc::new("y", &[2, 4], ElementType::Int32)),
        );
        graph.add_initializer(Initializer::int8("b", &[3, 4], &[1; 12]));
        graph.add_initializer(Initializer::uint8("a_zp", &[1], &[3]));
        graph.add_initializer(Initializer::int8("b_zp", &[1], &[0]));
        graph.add_input("a");
        graph.add_output("y");

        let tables = PrimitiveTables::new();
        let mut built = GraphBuilder::new(&tables).build(&graph).unwrap();
        let transformer = GraphTransformer::new(&tables, true);
        assert_eq!(transformer.eliminate_zero_points(&mut built.nodes, &built.arena, &graph), 1);
        assert_eq!(built.nodes[0].inputs[3], EMPTY_SLOT);
        assert!(built.nodes[0].has_input(&built.arena, 2));
    }

    #[test]
    fn test_undecodable_zero_point_is_kept() {
        let mut graph = SourceGraph::new("q");
        graph.add_node(
            SourceNode::new("MatMulInteger", "mmi")
                .input(OperandDesc::new("a", &[2, 3], ElementType::Uint8))
                .input(OperandDesc::new("b", &[3, 4], ElementType::Int8))
                .input(OperandDesc::absent())
                .input(OperandDesc::new("b_zp", &[1], ElementType::Int8).constant())
                .output(OperandDesc::new("y", &[2, 4], ElementType::Int32)),
        );
        graph.add_initializer(Initializer::raw("b_zp", &[1], ElementType::Int8, vec![0, 0]));
        let tables = PrimitiveTables::new();
        let mut built = GraphBuilder::new(&tables).build(&graph).unwrap();
        let transformer = GraphTransformer::new(&tables, true);
        assert_eq!(transformer.eliminate_zero_points(&mut built.nodes, &built.arena, &graph), 0);
        assert!(built.nodes[0].has_input(&built.arena, 3));
    }
}
