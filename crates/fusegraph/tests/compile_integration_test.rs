//! Integration tests for shape-keyed compilation and execution.
//!
//! Covers the compile cache of static and dynamic graphs, host buffer
//! binding, hyper operator decomposition, quantized matmul rewrites and
//! graphs loaded from JSON.
//!
//! @version 0.1.0
//! @author AutomataNexus Development Team

use std::sync::Arc;

use fusegraph::prelude::*;
use fusegraph_core::{Arg, ZeroPoint};

// =============================================================================
// Test Helpers
// =============================================================================

fn f32_operand(name: &str, dims: &[i64]) -> OperandDesc {
    OperandDesc::new(name, dims, ElementType::Float)
}

fn compile(graph: &SourceGraph) -> CompiledGraph {
    CompiledGraph::new(graph, GraphConfig::default(), Arc::new(PrimitiveTables::new())).unwrap()
}

fn tensors(entries: &[(&str, TensorData)]) -> TensorMap {
    entries
        .iter()
        .map(|(name, data)| ((*name).to_string(), data.clone()))
        .collect()
}

fn assert_close(actual: &[f32], expected: &[f32]) {
    assert_eq!(actual.len(), expected.len());
    for (a, e) in actual.iter().zip(expected) {
        assert!((a - e).abs() < 1e-4, "{actual:?} != {expected:?}");
    }
}

/// Static `MatMul(x, w) -> Relu` with `w` an initializer.
fn static_matmul() -> SourceGraph {
    let mut graph = SourceGraph::new("static_matmul");
    graph.add_node(
        SourceNode::new("MatMul", "mm")
            .input(f32_operand("x", &[2, 3]))
            .input(f32_operand("w", &[3, 2]).constant())
            .output(f32_operand("h", &[2, 2])),
    );
    graph.add_node(
        SourceNode::new("Relu", "act")
            .input(f32_operand("h", &[2, 2]))
            .output(f32_operand("y", &[2, 2])),
    );
    graph.add_initializer(Initializer::float(
        "w",
        &[3, 2],
        vec![1.0, -1.0, 1.0, -1.0, 1.0, -1.0],
    ));
    graph.add_input("x");
    graph.add_output("y");
    graph
}

/// `Conv -> Relu` whose spatial input dims are unknown.
fn dynamic_conv() -> SourceGraph {
    let mut graph = SourceGraph::new("dynamic_conv");
    graph.add_node(
        SourceNode::new("Conv", "conv")
            .input(OperandDesc::with_shape(
                "x",
                vec![Some(1), Some(3), None, None],
                ElementType::Float,
            ))
            .input(f32_operand("w", &[4, 3, 3, 3]).constant())
            .output(OperandDesc::unknown_shape("c", ElementType::Float)),
    );
    graph.add_node(
        SourceNode::new("Relu", "act")
            .input(OperandDesc::unknown_shape("c", ElementType::Float))
            .output(OperandDesc::unknown_shape("y", ElementType::Float)),
    );
    graph.add_initializer(Initializer::float("w", &[4, 3, 3, 3], vec![0.5; 108]));
    graph.add_input("x");
    graph.add_output("y");
    graph
}

fn image(side: usize) -> TensorMap {
    tensors(&[("x", TensorData::zeros(DataType::F32, &[1, 3, side, side]))])
}

// =============================================================================
// Test 1: Compile Cache
// =============================================================================

#[test]
fn test_static_graph_compiles_once() {
    let compiled = compile(&static_matmul());
    assert!(!compiled.has_dynamic_inputs());

    let inputs = tensors(&[("x", TensorData::zeros(DataType::F32, &[2, 3]))]);
    compiled.compile(&inputs).unwrap();
    let first = compiled.primitives();
    compiled.compile(&inputs).unwrap();
    let second = compiled.primitives();

    assert!(Arc::ptr_eq(&first, &second));
    let stats = compiled.stats();
    assert_eq!(stats.compilations, 1);
    assert_eq!(stats.cache_hits, 1);
    assert_eq!(compiled.shape_key().as_deref(), Some("2,3,|"));
}

#[test]
fn test_dynamic_graph_recompiles_on_shape_change() {
    let compiled = compile(&dynamic_conv());
    assert!(compiled.has_dynamic_inputs());

    compiled.compile(&image(224)).unwrap();
    let large = compiled.primitives();
    assert_eq!(compiled.output_shape("y").unwrap(), vec![1, 4, 222, 222]);

    compiled.compile(&image(224)).unwrap();
    assert!(Arc::ptr_eq(&large, &compiled.primitives()));

    compiled.compile(&image(112)).unwrap();
    let small = compiled.primitives();
    assert!(!Arc::ptr_eq(&large, &small));
    assert_eq!(compiled.output_shape("y").unwrap(), vec![1, 4, 110, 110]);

    let stats = compiled.stats();
    assert_eq!(stats.compilations, 2);
    assert_eq!(stats.cache_hits, 1);
    assert_eq!(stats.fused_post_ops, 1);
}

#[test]
fn test_recompiled_graph_computes_new_shape() {
    let compiled = compile(&dynamic_conv());
    for side in [5usize, 4] {
        let x = TensorData::from_f32(&[1, 3, side, side], &vec![1.0; 3 * side * side]);
        let out = side - 2;
        let y = TensorData::zeros(DataType::F32, &[1, 4, out, out]);
        compiled
            .run(&tensors(&[("x", x)]), &tensors(&[("y", y.clone())]))
            .unwrap();
        // 27 taps of 0.5
        assert_eq!(y.to_f32_vec(), vec![13.5; 4 * out * out]);
    }
}

#[test]
fn test_missing_input_is_fatal() {
    let compiled = compile(&static_matmul());
    let err = compiled.compile(&TensorMap::default()).unwrap_err();
    assert!(matches!(err, GraphError::InputNotFound(name) if name == "x"));
    assert!(compiled.shape_key().is_none());
}

// =============================================================================
// Test 2: Binding and Execution
// =============================================================================

#[test]
fn test_rebinding_handles_reuses_primitives() {
    let compiled = compile(&static_matmul());
    let x = TensorData::from_f32(&[2, 3], &[1.0, 2.0, 3.0, -4.0, 5.0, 6.0]);
    let y = TensorData::zeros(DataType::F32, &[2, 2]);
    let outputs = tensors(&[("y", y.clone())]);

    compiled.compile(&tensors(&[("x", x.clone())])).unwrap();
    compiled.set_data_handles(&tensors(&[("x", x)]), &outputs).unwrap();
    compiled.predict().unwrap();
    // column 0 is the row sum, column 1 its negation
    assert_eq!(y.to_f32_vec(), vec![6.0, 0.0, 7.0, 0.0]);

    let x = TensorData::from_f32(&[2, 3], &[-1.0, 0.0, 0.0, 0.0, 0.0, 7.0]);
    compiled.set_data_handles(&tensors(&[("x", x)]), &outputs).unwrap();
    compiled.predict().unwrap();
    assert_eq!(y.to_f32_vec(), vec![0.0, 1.0, 7.0, 0.0]);
    assert_eq!(compiled.stats().compilations, 1);
}

#[test]
fn test_scalar_input_broadcasts() {
    let mut graph = SourceGraph::new("scalar");
    graph.add_node(
        SourceNode::new("Add", "add")
            .input(f32_operand("x", &[2, 2]))
            .input(f32_operand("s", &[]))
            .output(f32_operand("y", &[2, 2])),
    );
    graph.add_input("x");
    graph.add_input("s");
    graph.add_output("y");

    let compiled = compile(&graph);
    let y = TensorData::zeros(DataType::F32, &[2, 2]);
    let inputs = tensors(&[
        ("x", TensorData::from_f32(&[2, 2], &[1.0, 2.0, 3.0, 4.0])),
        ("s", TensorData::from_f32(&[], &[10.0])),
    ]);
    assert!(!compiled.has_dynamic_inputs());
    compiled.run(&inputs, &tensors(&[("y", y.clone())])).unwrap();
    assert_eq!(y.to_f32_vec(), vec![11.0, 12.0, 13.0, 14.0]);
    assert_eq!(compiled.output_shape("y").unwrap(), vec![2, 2]);
    assert_eq!(compiled.output_shape("s").unwrap(), vec![1]);
}

/// `Relu(x) -> y` where `y` is both a graph output and the rank-padded
/// left operand of a batched matmul.
fn output_feeding_matmul() -> SourceGraph {
    let mut graph = SourceGraph::new("output_feeding_matmul");
    graph.add_node(
        SourceNode::new("Relu", "act")
            .input(f32_operand("x", &[4, 3]))
            .output(f32_operand("y", &[4, 3])),
    );
    graph.add_node(
        SourceNode::new("MatMul", "mm")
            .input(f32_operand("y", &[4, 3]))
            .input(f32_operand("w", &[2, 3, 1]).constant())
            .output(f32_operand("z", &[2, 4, 1])),
    );
    graph.add_initializer(Initializer::float("w", &[2, 3, 1], vec![1.0; 6]));
    graph.add_input("x");
    graph.add_output("y");
    graph.add_output("z");
    graph
}

#[test]
fn test_output_reshaped_by_consumer_is_written_to_host() {
    let compiled = compile(&output_feeding_matmul());
    let values: Vec<f32> = (0..12).map(|v| v as f32).collect();
    let y = TensorData::zeros(DataType::F32, &[4, 3]);
    let z = TensorData::zeros(DataType::F32, &[2, 4, 1]);
    compiled
        .run(
            &tensors(&[("x", TensorData::from_f32(&[4, 3], &values))]),
            &tensors(&[("y", y.clone()), ("z", z.clone())]),
        )
        .unwrap();

    assert_eq!(compiled.output_shape("y").unwrap(), vec![4, 3]);
    assert_eq!(compiled.output_shape("z").unwrap(), vec![2, 4, 1]);
    assert_eq!(y.to_f32_vec(), values);
    assert_eq!(z.to_f32_vec(), vec![3.0, 12.0, 21.0, 30.0, 3.0, 12.0, 21.0, 30.0]);
    assert!(compiled.output_memory("y").unwrap().desc().is_plain());

    // fresh host buffers must be followed by the reshaped view
    let y = TensorData::zeros(DataType::F32, &[4, 3]);
    let z = TensorData::zeros(DataType::F32, &[2, 4, 1]);
    let mut shifted = values.clone();
    shifted[0] = 5.0;
    compiled
        .set_data_handles(
            &tensors(&[("x", TensorData::from_f32(&[4, 3], &shifted))]),
            &tensors(&[("y", y.clone()), ("z", z.clone())]),
        )
        .unwrap();
    compiled.predict().unwrap();
    assert_eq!(y.to_f32_vec(), shifted);
    assert_eq!(z.to_f32_vec(), vec![8.0, 12.0, 21.0, 30.0, 8.0, 12.0, 21.0, 30.0]);
    assert_eq!(compiled.stats().compilations, 1);
}

#[test]
fn test_compiled_graph_runs_from_threads() {
    let compiled = Arc::new(compile(&static_matmul()));
    let handles: Vec<_> = (0..4)
        .map(|i| {
            let compiled = Arc::clone(&compiled);
            std::thread::spawn(move || {
                let value = i as f32;
                let x = TensorData::from_f32(&[2, 3], &[value; 6]);
                let y = TensorData::zeros(DataType::F32, &[2, 2]);
                compiled
                    .run(&tensors(&[("x", x)]), &tensors(&[("y", y.clone())]))
                    .unwrap();
                y.to_f32_vec()
            })
        })
        .collect();
    for (i, handle) in handles.into_iter().enumerate() {
        let sum = 3.0 * i as f32;
        assert_eq!(handle.join().unwrap(), vec![sum, 0.0, sum, 0.0]);
    }
    assert_eq!(compiled.stats().compilations, 1);
}

// =============================================================================
// Test 3: Hyper Operators
// =============================================================================

fn skip_layer_norm() -> SourceGraph {
    let mut graph = SourceGraph::new("encoder");
    graph.add_node(
        SourceNode::new("SkipLayerNormalization", "sln")
            .input(f32_operand("x", &[2, 4]))
            .input(f32_operand("skip", &[2, 4]))
            .input(f32_operand("gamma", &[4]).constant())
            .input(f32_operand("beta", &[4]).constant())
            .input(f32_operand("bias", &[4]).constant())
            .output(f32_operand("y", &[2, 4]))
            .attr("epsilon", AttributeValue::Float(1e-5)),
    );
    graph.add_initializer(Initializer::float("gamma", &[4], vec![1.0; 4]));
    graph.add_initializer(Initializer::float("beta", &[4], vec![0.0; 4]));
    graph.add_initializer(Initializer::float("bias", &[4], vec![0.0; 4]));
    graph.add_input("x");
    graph.add_input("skip");
    graph.add_output("y");
    graph
}

#[test]
fn test_skip_layer_norm_decomposes_into_named_nodes() {
    let compiled = compile(&skip_layer_norm());
    let names: Vec<_> = compiled
        .sequences()
        .into_iter()
        .map(|s| (s.source, s.op_type))
        .collect();
    assert_eq!(
        names,
        vec![
            ("sln_Decomposed_0_Add".to_string(), "Add".to_string()),
            ("sln_Decomposed_1_Bias".to_string(), "Add".to_string()),
            (
                "sln_Decomposed_2_LayerNorm".to_string(),
                "LayerNormalization".to_string()
            ),
        ]
    );
}

#[test]
fn test_skip_layer_norm_normalizes_rows() {
    let compiled = compile(&skip_layer_norm());
    let y = TensorData::zeros(DataType::F32, &[2, 4]);
    let inputs = tensors(&[
        ("x", TensorData::zeros(DataType::F32, &[2, 4])),
        (
            "skip",
            TensorData::from_f32(&[2, 4], &[1.0, 2.0, 3.0, 4.0, 1.0, 2.0, 3.0, 4.0]),
        ),
    ]);
    compiled.run(&inputs, &tensors(&[("y", y.clone())])).unwrap();

    let std = (1.25f32 + 1e-5).sqrt();
    let row: Vec<f32> = [1.0f32, 2.0, 3.0, 4.0].iter().map(|v| (v - 2.5) / std).collect();
    let expected: Vec<f32> = row.iter().chain(row.iter()).copied().collect();
    assert_close(&y.to_f32_vec(), &expected);
    // the bias add writes over the skip sum
    assert_eq!(compiled.stats().in_place_aliases, 1);
}

#[test]
fn test_bias_gelu_adds_bias_then_applies_erf_gelu() {
    let mut graph = SourceGraph::new("bias_gelu");
    graph.add_node(
        SourceNode::new("BiasGelu", "bg")
            .input(f32_operand("a", &[2, 4]))
            .input(f32_operand("b", &[4]).constant())
            .output(f32_operand("y", &[2, 4])),
    );
    graph.add_initializer(Initializer::float("b", &[4], vec![1.0, 0.0, -1.0, 0.0]));
    graph.add_input("a");
    graph.add_output("y");

    let compiled = compile(&graph);
    let sequences = compiled.sequences();
    assert_eq!(sequences.len(), 1);
    assert_eq!(sequences[0].source, "bg_Decomposed_0_Bias");
    assert_eq!(sequences[0].post_ops[0].name, "bg_Decomposed_1_GeLU");

    let a = TensorData::from_f32(&[2, 4], &[-1.0, 1.0, 0.0, 2.0, 0.0, -1.0, 3.0, 1.0]);
    let y = TensorData::zeros(DataType::F32, &[2, 4]);
    compiled
        .run(&tensors(&[("a", a)]), &tensors(&[("y", y.clone())]))
        .unwrap();
    // a + b is [0, 1, -1, 2 | 1, -1, 2, 1]
    let (g1, gm1, g2) = (0.841_344_7, -0.158_655_3, 1.954_499_7);
    assert_close(&y.to_f32_vec(), &[0.0, g1, gm1, g2, g1, gm1, g2, g1]);
}

// =============================================================================
// Test 4: Quantized MatMul
// =============================================================================

#[test]
fn test_zero_weight_zero_point_is_dropped_before_lowering() {
    let mut graph = SourceGraph::new("quantized");
    graph.add_node(
        SourceNode::new("MatMulInteger", "mmi")
            .input(OperandDesc::new("a", &[2, 3], ElementType::Uint8))
            .input(OperandDesc::new("b", &[3, 2], ElementType::Int8).constant())
            .input(OperandDesc::new("a_zp", &[1], ElementType::Uint8).constant())
            .input(OperandDesc::new("b_zp", &[1], ElementType::Int8).constant())
            .output(OperandDesc::new("y", &[2, 2], ElementType::Int32)),
    );
    graph.add_initializer(Initializer::int8("b", &[3, 2], &[1; 6]));
    graph.add_initializer(Initializer::uint8("a_zp", &[1], &[1]));
    graph.add_initializer(Initializer::int8("b_zp", &[1], &[0]));
    graph.add_input("a");
    graph.add_output("y");

    let compiled = compile(&graph);
    let a = TensorData::new(
        DataType::U8,
        &[2, 3],
        fusegraph_core::Buffer::from_bytes(vec![3; 6]),
    );
    let y = TensorData::zeros(DataType::S32, &[2, 2]);
    compiled
        .run(&tensors(&[("a", a)]), &tensors(&[("y", y.clone())]))
        .unwrap();

    let primitives = compiled.primitives();
    let (matmul, args) = primitives
        .iter()
        .find(|(p, _)| p.kind() == fusegraph_core::PrimitiveKind::MatMul)
        .unwrap();
    assert!(!args.contains_key(&Arg::WeightsZeroPoint));
    assert_eq!(matmul.attr().zero_point(Arg::Weights), None);
    assert_eq!(matmul.attr().zero_point(Arg::Src), Some(ZeroPoint::Constant(1)));

    assert_eq!(compiled.output_data_type("y").unwrap(), DataType::S32);
    assert_eq!(y.to_f32_vec(), vec![6.0; 4]);
}

// =============================================================================
// Test 5: Serialized Graphs
// =============================================================================

const MLP_JSON: &str = r#"{
  "name": "mlp",
  "inputs": ["x"],
  "outputs": ["y"],
  "nodes": [
    {
      "name": "fc",
      "op_type": "MatMul",
      "inputs": [
        {"name": "x", "elem_type": "Float", "shape": [1, 2]},
        {"name": "w", "elem_type": "Float", "shape": [2, 2], "is_constant": true}
      ],
      "outputs": [{"name": "h", "elem_type": "Float", "shape": [1, 2]}]
    },
    {
      "name": "gate",
      "op_type": "Sigmoid",
      "inputs": [{"name": "h", "elem_type": "Float", "shape": [1, 2]}],
      "outputs": [{"name": "y", "elem_type": "Float", "shape": [1, 2]}]
    }
  ],
  "initializers": [
    {"name": "w", "dims": [2, 2], "elem_type": "Float", "float_data": [1.0, 0.0, 0.0, -1.0]}
  ]
}"#;

#[test]
fn test_graph_from_json_compiles_and_runs() {
    let graph = SourceGraph::from_json(MLP_JSON).unwrap();
    assert_eq!(graph.nodes[1].index, 1);

    let compiled = compile(&graph);
    assert_eq!(compiled.name(), "mlp");
    assert_eq!(compiled.sequences().len(), 1);

    let y = TensorData::zeros(DataType::F32, &[1, 2]);
    let x = TensorData::from_f32(&[1, 2], &[0.0, 0.0]);
    compiled
        .run(&tensors(&[("x", x)]), &tensors(&[("y", y.clone())]))
        .unwrap();
    assert_close(&y.to_f32_vec(), &[0.5, 0.5]);
}

#[test]
fn test_unsupported_operator_is_rejected() {
    let json = MLP_JSON.replace("\"Sigmoid\"", "\"Hardmax\"");
    let graph = SourceGraph::from_json(&json).unwrap();
    let err = CompiledGraph::new(&graph, GraphConfig::default(), Arc::new(PrimitiveTables::new()))
        .unwrap_err();
    assert!(matches!(err, GraphError::UnsupportedOperator { .. }));
}
