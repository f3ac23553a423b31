//! Graph Builder - Source Graph to Node Graph
//!
//! Walks the source graph in topological order and builds one `Node` per
//! 1:1 operator, interning every operand in a shared `TensorArena` keyed by
//! name. Hyper operators are decomposed into chains of simple nodes joined
//! by synthetic intermediate tensors.
//!
//! # Key Features
//! - `SkipLayerNormalization` -> `Add` -> optional bias `Add` -> `LayerNormalization`
//! - `BiasGelu` -> `Add` -> `Gelu`
//! - Initializer data captured for automatic binding
//! - Graph input/output flags and the dynamic-input flag
//!
//! @version 0.1.0
//! @author AutomataNexus Development Team

use fusegraph_core::Buffer;
use rustc_hash::FxHashMap;
use tracing::{debug, warn};

use crate::error::{GraphError, GraphResult};
use crate::node::{AttrReader, Node, NodeId};
use crate::nodes::NodeKind;
use crate::source::{AttributeValue, Attributes, OperandDesc, SourceGraph, SourceNode, TensorData};
use crate::tables::PrimitiveTables;
use crate::tensor::{fixed_dims, SlotId, Tensor, TensorArena, EMPTY_SLOT};

// =============================================================================
// Built Graph
// =============================================================================

/// The node graph produced by [`GraphBuilder::build`].
#[derive(Debug, Clone)]
pub struct BuiltGraph {
    /// Graph name.
    pub name: String,
    /// Every tensor referenced by a node.
    pub arena: TensorArena,
    /// Nodes in topological order.
    pub nodes: Vec<Node>,
    /// Graph inputs, declared inputs first, then initializers.
    pub inputs: Vec<SlotId>,
    /// Graph outputs in declaration order.
    pub outputs: Vec<SlotId>,
    /// True if any non-constant graph input has an unknown dim.
    pub has_dynamic_inputs: bool,
    /// Initializer data keyed by tensor name.
    pub initializers: FxHashMap<String, TensorData>,
}

// =============================================================================
// Graph Builder
// =============================================================================

/// Builds the node graph of a source graph.
pub struct GraphBuilder<'a> {
    tables: &'a PrimitiveTables,
    arena: TensorArena,
    nodes: Vec<Node>,
}

impl<'a> GraphBuilder<'a> {
    /// Creates a builder using `tables` for operator lookup.
    #[must_use]
    pub fn new(tables: &'a PrimitiveTables) -> Self {
        Self {
            tables,
            arena: TensorArena::new(),
            nodes: Vec::new(),
        }
    }

    /// Builds `source` into a node graph.
    pub fn build(mut self, source: &SourceGraph) -> GraphResult<BuiltGraph> {
        for node in &source.nodes {
            if self.tables.is_hyper_op(&node.op_type) {
                self.decompose(node)?;
            } else {
                self.build_simple(node)?;
            }
        }

        let initializers = self.mark_initializers(source);

        let mut inputs = Vec::new();
        for name in source.inputs_including_initializers() {
            if let Some(slot) = self.arena.lookup(&name) {
                self.arena.get_mut(slot).is_graph_input = true;
                inputs.push(slot);
            }
        }
        let mut outputs = Vec::with_capacity(source.outputs.len());
        for name in &source.outputs {
            let slot = self
                .arena
                .lookup(name)
                .ok_or_else(|| GraphError::TensorNotFound(name.clone()))?;
            self.arena.get_mut(slot).is_graph_output = true;
            outputs.push(slot);
        }
        let has_dynamic_inputs = inputs.iter().any(|&slot| {
            let tensor = self.arena.get(slot);
            !tensor.is_constant && tensor.has_dynamic_dims()
        });

        debug!(
            graph = %source.name,
            nodes = self.nodes.len(),
            tensors = self.arena.len() - 1,
            dynamic = has_dynamic_inputs,
            "built node graph"
        );

        Ok(BuiltGraph {
            name: source.name.clone(),
            arena: self.arena,
            nodes: self.nodes,
            inputs,
            outputs,
            has_dynamic_inputs,
            initializers,
        })
    }

    // -------------------------------------------------------------------------
    // Tensors
    // -------------------------------------------------------------------------

    fn operand(&mut self, operand: &OperandDesc) -> GraphResult<SlotId> {
        let slot = self.arena.intern(Tensor::from_operand(operand)?);
        if operand.is_constant && slot != EMPTY_SLOT {
            self.arena.get_mut(slot).is_constant = true;
        }
        Ok(slot)
    }

    fn operands(&mut self, operands: &[OperandDesc]) -> GraphResult<Vec<SlotId>> {
        operands.iter().map(|operand| self.operand(operand)).collect()
    }

    /// Interns a synthetic tensor shaped and typed like the tensor behind `base`.
    fn intermediate(&mut self, base: SlotId, name: &str) -> SlotId {
        let tensor = Tensor::derived(self.arena.get(base), name);
        self.arena.intern(tensor)
    }

    /// Flags initializer tensors constant and captures their data.
    fn mark_initializers(&mut self, source: &SourceGraph) -> FxHashMap<String, TensorData> {
        let mut data = FxHashMap::default();
        for init in &source.initializers {
            let Some(slot) = self.arena.lookup(&init.name) else {
                continue;
            };
            let tensor = self.arena.get_mut(slot);
            tensor.is_constant = true;
            let dims: Vec<usize> = init.dims.iter().map(|&d| d.max(0) as usize).collect();
            if dims.is_empty() {
                tensor.set_declared_dims(fixed_dims(&[1]));
            } else {
                tensor.set_declared_dims(fixed_dims(&dims));
            }
            let dtype = tensor.dtype();
            match init.to_bytes() {
                Ok(bytes) => {
                    data.insert(
                        init.name.clone(),
                        TensorData::new(dtype, &dims, Buffer::from_bytes(bytes)),
                    );
                }
                Err(err) => warn!(initializer = %init.name, error = %err, "initializer data not captured"),
            }
        }
        data
    }

    // -------------------------------------------------------------------------
    // Nodes
    // -------------------------------------------------------------------------

    fn push_node(
        &mut self,
        name: &str,
        op_type: &str,
        since_version: i32,
        attributes: Attributes,
        inputs: Vec<SlotId>,
        outputs: Vec<SlotId>,
    ) -> GraphResult<()> {
        let kind = NodeKind::build(
            name,
            op_type,
            &attributes,
            inputs.len(),
            outputs.len(),
            self.tables,
        )?;
        for &slot in &inputs {
            if slot != EMPTY_SLOT {
                self.arena.get_mut(slot).consume();
            }
        }
        self.nodes.push(Node {
            id: NodeId(self.nodes.len()),
            name: name.to_string(),
            op_type: op_type.to_string(),
            since_version,
            attributes,
            inputs,
            outputs,
            kind,
        });
        Ok(())
    }

    fn build_simple(&mut self, node: &SourceNode) -> GraphResult<()> {
        let inputs = self.operands(&node.inputs)?;
        let outputs = self.operands(&node.outputs)?;
        self.push_node(
            &node.name,
            &node.op_type,
            node.since_version,
            node.attributes.clone(),
            inputs,
            outputs,
        )
    }

    fn decompose(&mut self, node: &SourceNode) -> GraphResult<()> {
        match node.op_type.as_str() {
            "SkipLayerNormalization" => self.decompose_skip_layer_norm(node),
            "BiasGelu" => self.decompose_bias_gelu(node),
            _ => Err(GraphError::unsupported_operator(&node.op_type, &node.name)),
        }
    }

    /// `SkipLayerNormalization(x, skip, gamma, beta?, bias?)`.
    fn decompose_skip_layer_norm(&mut self, node: &SourceNode) -> GraphResult<()> {
        let epsilon = AttrReader::new(&node.name, &node.attributes)
            .strict_float("epsilon")?
            .ok_or_else(|| GraphError::missing_attribute(&node.name, "epsilon"))?;
        let inputs = self.operands(&node.inputs)?;
        let outputs = self.operands(&node.outputs)?;
        let input = |index: usize| inputs.get(index).copied().unwrap_or(EMPTY_SLOT);
        if input(0) == EMPTY_SLOT || input(1) == EMPTY_SLOT || input(2) == EMPTY_SLOT {
            return Err(GraphError::ArityMismatch {
                node: node.name.clone(),
                op_type: node.op_type.clone(),
                role: "inputs",
                expected: 3,
                actual: inputs.iter().filter(|&&slot| slot != EMPTY_SLOT).count(),
            });
        }
        let output = outputs.first().copied().ok_or_else(|| GraphError::ArityMismatch {
            node: node.name.clone(),
            op_type: node.op_type.clone(),
            role: "outputs",
            expected: 1,
            actual: 0,
        })?;
        if outputs.len() > 1 {
            debug!(node = %node.name, "only the normalized output is produced");
        }

        let add_name = format!("{}_Decomposed_0_Add", node.name);
        let mut current = self.intermediate(input(0), &format!("{add_name}_out"));
        self.push_node(
            &add_name,
            "Add",
            node.since_version,
            Attributes::default(),
            vec![input(0), input(1)],
            vec![current],
        )?;

        if input(4) != EMPTY_SLOT {
            let bias_name = format!("{}_Decomposed_1_Bias", node.name);
            let biased = self.intermediate(current, &format!("{bias_name}_out"));
            self.push_node(
                &bias_name,
                "Add",
                node.since_version,
                Attributes::default(),
                vec![current, input(4)],
                vec![biased],
            )?;
            current = biased;
        }

        let mut attributes = Attributes::default();
        attributes.insert("epsilon".to_string(), AttributeValue::Float(epsilon));
        let mut ln_inputs = vec![current, input(2)];
        if input(3) != EMPTY_SLOT {
            ln_inputs.push(input(3));
        }
        self.push_node(
            &format!("{}_Decomposed_2_LayerNorm", node.name),
            "LayerNormalization",
            node.since_version,
            attributes,
            ln_inputs,
            vec![output],
        )
    }

    /// `BiasGelu(a, b)`.
    fn decompose_bias_gelu(&mut self, node: &SourceNode) -> GraphResult<()> {
        let inputs = self.operands(&node.inputs)?;
        let outputs = self.operands(&node.outputs)?;
        let add_name = format!("{}_Decomposed_0_Bias", node.name);
        let base = inputs.first().copied().unwrap_or(EMPTY_SLOT);
        let sum = self.intermediate(base, &format!("{add_name}_out"));
        self.push_node(
            &add_name,
            "Add",
            node.since_version,
            Attributes::default(),
            inputs,
            vec![sum],
        )?;
        self.push_node(
            &format!("{}_Decomposed_1_GeLU", node.name),
            "Gelu",
            node.since_version,
            Attributes::default(),
            vec![sum],
            outputs,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{ElementType, Initializer};

    fn operand(name: &str, dims: &[i64]) -> OperandDesc {
        OperandDesc::new(name, dims, ElementType::Float)
    }

    fn skip_layer_norm(with_bias: bool) -> SourceGraph {
        let mut graph = SourceGraph::new("sln");
        let mut node = SourceNode::new("SkipLayerNormalization", "sln")
            .input(operand("x", &[2, 4]))
            .input(operand("skip", &[2, 4]))
            .input(operand("gamma", &[4]).constant())
            .input(operand("beta", &[4]).constant());
        if with_bias {
            node = node.input(operand("bias", &[4]).constant());
        }
        node = node
            .output(operand("y", &[2, 4]))
            .attr("epsilon", AttributeValue::Float(1e-5));
        graph.add_node(node);
        graph.add_input("x");
        graph.add_input("skip");
        graph.add_output("y");
        graph.add_initializer(Initializer::float("gamma", &[4], vec![1.0; 4]));
        graph.add_initializer(Initializer::float("beta", &[4], vec![0.0; 4]));
        graph
    }

    #[test]
    fn test_shared_tensor_table() {
        let mut graph = SourceGraph::new("g");
        graph.add_node(
            SourceNode::new("Relu", "r0")
                .input(operand("x", &[4]))
                .output(operand("h", &[4])),
        );
        graph.add_node(
            SourceNode::new("Add", "a0")
                .input(operand("h", &[4]))
                .input(operand("h", &[4]))
                .output(operand("y", &[4])),
        );
        graph.add_input("x");
        graph.add_output("y");
        let tables = PrimitiveTables::new();
        let built = GraphBuilder::new(&tables).build(&graph).unwrap();

        assert_eq!(built.nodes.len(), 2);
        assert_eq!(built.nodes[0].outputs[0], built.nodes[1].inputs[0]);
        let h = built.arena.get(built.nodes[1].inputs[0]);
        assert_eq!(h.consumers(), 2);
        assert!(built.arena.get(built.inputs[0]).is_graph_input);
        assert!(built.arena.get(built.outputs[0]).is_graph_output);
        assert!(!built.has_dynamic_inputs);
    }

    #[test]
    fn test_skip_layer_norm_decomposition() {
        let tables = PrimitiveTables::new();
        let built = GraphBuilder::new(&tables).build(&skip_layer_norm(true)).unwrap();
        let names: Vec<&str> = built.nodes.iter().map(|n| n.name.as_str()).collect();
        assert_eq!(
            names,
            ["sln_Decomposed_0_Add", "sln_Decomposed_1_Bias", "sln_Decomposed_2_LayerNorm"]
        );
        let out0 = built.arena.get(built.nodes[0].outputs[0]);
        assert_eq!(out0.name(), "sln_Decomposed_0_Add_out");
        let out1 = built.arena.get(built.nodes[1].outputs[0]);
        assert_eq!(out1.name(), "sln_Decomposed_1_Bias_out");
        assert_eq!(built.nodes[2].inputs[0], built.nodes[1].outputs[0]);
        assert_eq!(built.arena.get(built.nodes[2].outputs[0]).name(), "y");
        assert_eq!(built.nodes[2].inputs.len(), 3);
    }

    #[test]
    fn test_skip_layer_norm_without_bias() {
        let tables = PrimitiveTables::new();
        let built = GraphBuilder::new(&tables).build(&skip_layer_norm(false)).unwrap();
        assert_eq!(built.nodes.len(), 2);
        assert_eq!(built.nodes[1].op_type, "LayerNormalization");
        assert_eq!(built.nodes[1].inputs[0], built.nodes[0].outputs[0]);
    }

    #[test]
    fn test_skip_layer_norm_requires_float_epsilon() {
        let mut graph = skip_layer_norm(false);
        graph.nodes[0].attributes.clear();
        let tables = PrimitiveTables::new();
        let err = GraphBuilder::new(&tables).build(&graph).unwrap_err();
        assert!(matches!(err, GraphError::MissingAttribute { .. }));

        graph.nodes[0]
            .attributes
            .insert("epsilon".to_string(), AttributeValue::Int(1));
        assert!(GraphBuilder::new(&tables).build(&graph).is_err());
    }

    #[test]
    fn test_bias_gelu_decomposition() {
        let mut graph = SourceGraph::new("g");
        graph.add_node(
            SourceNode::new("BiasGelu", "bg")
                .input(operand("a", &[2, 8]))
                .input(operand("b", &[8]))
                .output(operand("y", &[2, 8])),
        );
        graph.add_input("a");
        graph.add_input("b");
        graph.add_output("y");
        let tables = PrimitiveTables::new();
        let built = GraphBuilder::new(&tables).build(&graph).unwrap();
        assert_eq!(built.nodes[0].name, "bg_Decomposed_0_Bias");
        assert_eq!(built.nodes[1].name, "bg_Decomposed_1_GeLU");
        assert_eq!(built.arena.get(built.nodes[0].outputs[0]).name(), "bg_Decomposed_0_Bias_out");
    }

    #[test]
    fn test_unsupported_operators() {
        let tables = PrimitiveTables::new();
        for op in ["QAttention", "NotAnOp"] {
            let mut graph = SourceGraph::new("g");
            graph.add_node(
                SourceNode::new(op, "n")
                    .input(operand("x", &[4]))
                    .output(operand("y", &[4])),
            );
            let err = GraphBuilder::new(&tables).build(&graph).unwrap_err();
            assert!(matches!(err, GraphError::UnsupportedOperator { .. }), "{op}");
        }
    }

    #[test]
    fn test_dynamic_inputs_and_initializers() {
        let mut graph = SourceGraph::new("g");
        graph.add_node(
            SourceNode::new("Add", "add")
                .input(OperandDesc::with_shape("x", vec![None, Some(4)], ElementType::Float))
                .input(operand("w", &[-1]).constant())
                .output(OperandDesc::unknown_shape("y", ElementType::Float)),
        );
        graph.add_input("x");
        graph.add_output("y");
        graph.add_initializer(Initializer::float("w", &[4], vec![1.0, 2.0, 3.0, 4.0]));
        let tables = PrimitiveTables::new();
        let built = GraphBuilder::new(&tables).build(&graph).unwrap();

        assert!(built.has_dynamic_inputs);
        assert_eq!(built.inputs.len(), 2);
        let w = built.arena.get(built.inputs[1]);
        assert!(w.is_constant && w.is_graph_input);
        assert_eq!(w.dims(), fixed_dims(&[4]).as_slice());
        assert_eq!(built.initializers["w"].to_f32_vec(), vec![1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_declared_scalar_input_is_static() {
        let mut graph = SourceGraph::new("g");
        graph.add_node(
            SourceNode::new("Add", "add")
                .input(operand("x", &[4]))
                .input(operand("s", &[]))
                .output(operand("y", &[4])),
        );
        graph.add_input("x");
        graph.add_input("s");
        graph.add_output("y");
        let tables = PrimitiveTables::new();
        let built = GraphBuilder::new(&tables).build(&graph).unwrap();

        assert!(!built.has_dynamic_inputs);
        assert_eq!(built.arena.get(built.inputs[1]).dims(), fixed_dims(&[1]).as_slice());
    }

    #[test]
    fn test_missing_graph_output() {
        let mut graph = SourceGraph::new("g");
        graph.add_node(
            SourceNode::new("Relu", "r")
                .input(operand("x", &[4]))
                .output(operand("y", &[4])),
        );
        graph.add_output("z");
        let tables = PrimitiveTables::new();
        let err = GraphBuilder::new(&tables).build(&graph).unwrap_err();
        assert_eq!(err, GraphError::TensorNotFound("z".to_string()));
    }
}
