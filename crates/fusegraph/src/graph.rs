//! Compiled Graph - Shape-keyed Lowering and Execution
//!
//! A `CompiledGraph` owns the node graph, its fused sequences and the
//! primitive list lowered for the most recent input shapes. Compilation is
//! keyed on the bound input shapes: a static graph lowers once, a dynamic
//! graph lowers again whenever the shape signature changes. Every graph
//! output is normalized to a dense layout on the host CPU engine.
//!
//! All mutable state sits behind one `parking_lot::Mutex`, so a compiled
//! graph can be shared between threads; `run` holds the lock across
//! compile, binding and execution.
//!
//! # Example
//! ```rust
//! use std::sync::Arc;
//! use fusegraph::{CompiledGraph, GraphConfig, PrimitiveTables, TensorData, TensorMap};
//! use fusegraph::source::{ElementType, OperandDesc, SourceGraph, SourceNode};
//!
//! let mut graph = SourceGraph::new("relu");
//! graph.add_node(
//!     SourceNode::new("Relu", "r")
//!         .input(OperandDesc::new("x", &[4], ElementType::Float))
//!         .output(OperandDesc::new("y", &[4], ElementType::Float)),
//! );
//! graph.add_input("x");
//! graph.add_output("y");
//!
//! let compiled = CompiledGraph::new(&graph, GraphConfig::default(), Arc::new(PrimitiveTables::new())).unwrap();
//! let mut inputs = TensorMap::default();
//! inputs.insert("x".to_string(), TensorData::from_f32(&[4], &[-1.0, 2.0, -3.0, 4.0]));
//! let y = TensorData::zeros(fusegraph_core::DataType::F32, &[4]);
//! let mut outputs = TensorMap::default();
//! outputs.insert("y".to_string(), y.clone());
//!
//! compiled.run(&inputs, &outputs).unwrap();
//! assert_eq!(y.to_f32_vec(), vec![0.0, 2.0, 0.0, 4.0]);
//! ```
//!
//! @version 0.1.0
//! @author AutomataNexus Development Team

use std::fmt::Write as _;
use std::sync::Arc;

use fusegraph_core::{Arg, ArgMap, DataType, Memory, MemoryDesc, Primitive};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::accumulator::PrimitiveAccumulator;
use crate::builder::GraphBuilder;
use crate::config::GraphConfig;
use crate::error::{GraphError, GraphResult};
use crate::handler::EngineHandler;
use crate::node::{LoweringContext, Node};
use crate::source::{SourceGraph, TensorData, TensorMap};
use crate::tables::PrimitiveTables;
use crate::tensor::{CompiledPrimitive, SlotId, Tensor, TensorArena};
use crate::transform::{FusedSequence, GraphTransformer};

// =============================================================================
// Reporting Types
// =============================================================================

/// Counters describing a compiled graph.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompileStats {
    /// Lowerings performed.
    pub compilations: usize,
    /// `compile` calls answered by the current primitive list.
    pub cache_hits: usize,
    /// Primitives in the current list.
    pub primitives: usize,
    /// Post-op slots used in the current list; fused casts take none.
    pub fused_post_ops: usize,
    /// Outputs written in place in the current list.
    pub in_place_aliases: usize,
    /// Reorders appended to normalize outputs in the current list.
    pub output_reorders: usize,
}

/// A post-op of a [`SequenceInfo`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostOpInfo {
    /// Node name.
    pub name: String,
    /// Operator type.
    pub op_type: String,
    /// Operand fed by the accumulated value.
    pub slot: usize,
}

/// Named view of a fused sequence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceInfo {
    /// Source node name.
    pub source: String,
    /// Source operator type.
    pub op_type: String,
    /// Fused post-ops in order.
    pub post_ops: Vec<PostOpInfo>,
}

/// Shape signature: each dim followed by `,`, each input closed by `|`.
#[must_use]
pub fn shape_signature<'a>(shapes: impl IntoIterator<Item = &'a [usize]>) -> String {
    let mut key = String::new();
    for shape in shapes {
        for dim in shape {
            let _ = write!(key, "{dim},");
        }
        key.push('|');
    }
    key
}

// =============================================================================
// Compiled Graph
// =============================================================================

#[derive(Debug)]
struct GraphState {
    arena: TensorArena,
    nodes: Vec<Node>,
    sequences: Vec<FusedSequence>,
    input_slots: Vec<SlotId>,
    output_slots: Vec<SlotId>,
    initializers: FxHashMap<String, TensorData>,
    primitives: Arc<Vec<CompiledPrimitive>>,
    shape_key: Option<String>,
    stats: CompileStats,
}

/// A built, fused graph lowered on demand for concrete input shapes.
#[derive(Debug)]
pub struct CompiledGraph {
    name: String,
    config: GraphConfig,
    tables: Arc<PrimitiveTables>,
    handler: EngineHandler,
    has_dynamic_inputs: bool,
    state: Mutex<GraphState>,
}

impl CompiledGraph {
    /// Builds and transforms `source`. Lowering waits for [`CompiledGraph::compile`].
    pub fn new(
        source: &SourceGraph,
        config: GraphConfig,
        tables: Arc<PrimitiveTables>,
    ) -> GraphResult<Self> {
        let mut built = GraphBuilder::new(&tables).build(source)?;
        let transformer = GraphTransformer::new(&tables, config.enable_fusion);
        transformer.eliminate_zero_points(&mut built.nodes, &built.arena, source);
        let sequences = transformer.fuse(&mut built.nodes, &built.arena);
        built.arena.snapshot_slots();

        debug!(
            graph = %built.name,
            nodes = built.nodes.len(),
            sequences = sequences.len(),
            "transformed graph"
        );

        Ok(Self {
            name: built.name,
            config,
            handler: EngineHandler::new(config.engine),
            has_dynamic_inputs: built.has_dynamic_inputs,
            tables,
            state: Mutex::new(GraphState {
                arena: built.arena,
                nodes: built.nodes,
                sequences,
                input_slots: built.inputs,
                output_slots: built.outputs,
                initializers: built.initializers,
                primitives: Arc::new(Vec::new()),
                shape_key: None,
                stats: CompileStats::default(),
            }),
        })
    }

    /// Graph name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Configuration the graph was created with.
    #[must_use]
    pub const fn config(&self) -> &GraphConfig {
        &self.config
    }

    /// True if any non-constant graph input has an unknown dim.
    #[must_use]
    pub const fn has_dynamic_inputs(&self) -> bool {
        self.has_dynamic_inputs
    }

    // -------------------------------------------------------------------------
    // Core surface
    // -------------------------------------------------------------------------

    /// Lowers the graph for the shapes of `inputs` unless the current list fits.
    pub fn compile(&self, inputs: &TensorMap) -> GraphResult<()> {
        let mut state = self.state.lock();
        self.compile_locked(&mut state, inputs)
    }

    /// Binds host buffers to graph inputs and outputs.
    pub fn set_data_handles(&self, inputs: &TensorMap, outputs: &TensorMap) -> GraphResult<()> {
        let mut state = self.state.lock();
        self.bind_locked(&mut state, inputs, outputs)
    }

    /// Executes the primitive list in order.
    pub fn predict(&self) -> GraphResult<()> {
        let state = self.state.lock();
        self.predict_locked(&state)
    }

    /// Compiles, binds and executes under one lock.
    pub fn run(&self, inputs: &TensorMap, outputs: &TensorMap) -> GraphResult<()> {
        let mut state = self.state.lock();
        self.compile_locked(&mut state, inputs)?;
        self.bind_locked(&mut state, inputs, outputs)?;
        self.predict_locked(&state)
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    /// Dims of a tensor after the last compilation.
    pub fn output_shape(&self, name: &str) -> GraphResult<Vec<usize>> {
        let state = self.state.lock();
        Ok(named(&state.arena, name)?.concrete_dims()?.to_vec())
    }

    /// Element type of a tensor.
    pub fn output_data_type(&self, name: &str) -> GraphResult<DataType> {
        let state = self.state.lock();
        Ok(named(&state.arena, name)?.dtype())
    }

    /// Memory a tensor exchanges with the host.
    pub fn output_memory(&self, name: &str) -> GraphResult<Memory> {
        let state = self.state.lock();
        Ok(named(&state.arena, name)?.host_memory()?.clone())
    }

    /// The fused sequences by node name.
    #[must_use]
    pub fn sequences(&self) -> Vec<SequenceInfo> {
        let state = self.state.lock();
        state
            .sequences
            .iter()
            .map(|sequence| {
                let source = &state.nodes[sequence.source.0];
                SequenceInfo {
                    source: source.name.clone(),
                    op_type: source.op_type.clone(),
                    post_ops: sequence
                        .post_ops
                        .iter()
                        .map(|entry| {
                            let node = &state.nodes[entry.node.0];
                            PostOpInfo {
                                name: node.name.clone(),
                                op_type: node.op_type.clone(),
                                slot: entry.slot,
                            }
                        })
                        .collect(),
                }
            })
            .collect()
    }

    /// Shared handle to the current primitive list.
    #[must_use]
    pub fn primitives(&self) -> Arc<Vec<CompiledPrimitive>> {
        Arc::clone(&self.state.lock().primitives)
    }

    /// Compilation counters.
    #[must_use]
    pub fn stats(&self) -> CompileStats {
        self.state.lock().stats
    }

    /// Shape signature of the current primitive list.
    #[must_use]
    pub fn shape_key(&self) -> Option<String> {
        self.state.lock().shape_key.clone()
    }

    // -------------------------------------------------------------------------
    // Locked operations
    // -------------------------------------------------------------------------

    fn compile_locked(&self, state: &mut GraphState, inputs: &TensorMap) -> GraphResult<()> {
        let key = shape_signature(
            state
                .input_slots
                .iter()
                .filter_map(|&slot| inputs.get(state.arena.get(slot).name()))
                .map(|data| data.shape.as_slice()),
        );
        if let Some(previous) = &state.shape_key {
            if !self.has_dynamic_inputs || *previous == key {
                state.stats.cache_hits += 1;
                return Ok(());
            }
        }

        info!(
            graph = %self.name,
            dynamic = self.has_dynamic_inputs,
            shapes = %key,
            "compiling graph"
        );
        state.shape_key = None;
        state.arena.restore_slots();
        state.arena.reset_all();
        self.bind_inputs(state, inputs)?;

        let mut primitives = Vec::new();
        let (fused_post_ops, in_place_aliases) = self.lower(state, &mut primitives)?;
        let output_reorders = self.normalize_outputs(state, &mut primitives)?;

        let count = primitives.len();
        state.primitives = Arc::new(primitives);
        state.shape_key = Some(key);
        state.stats = CompileStats {
            compilations: state.stats.compilations + 1,
            cache_hits: state.stats.cache_hits,
            primitives: count,
            fused_post_ops,
            in_place_aliases,
            output_reorders,
        };
        info!(graph = %self.name, primitives = count, "compiled graph");
        Ok(())
    }

    /// Binds every graph input to memory of the supplied shape.
    fn bind_inputs(&self, state: &mut GraphState, inputs: &TensorMap) -> GraphResult<()> {
        let engine = self.handler.engine();
        for &slot in &state.input_slots {
            let tensor = state.arena.get_mut(slot);
            let data = match inputs.get(tensor.name()) {
                Some(data) => data,
                None if self.config.bind_initializers => state
                    .initializers
                    .get(tensor.name())
                    .ok_or_else(|| GraphError::InputNotFound(tensor.name().to_string()))?,
                None => return Err(GraphError::InputNotFound(tensor.name().to_string())),
            };
            let scalar = data.shape.is_empty();
            let dims = if scalar { vec![1] } else { data.shape.clone() };
            let desc = MemoryDesc::plain(&dims, tensor.dtype());
            tensor.set_memory(Memory::from_buffer(desc, &engine, data.buffer.clone())?);
            tensor.is_scalar = scalar;
        }
        Ok(())
    }

    /// Lowers every fused sequence; returns the post-op slot and in-place counts.
    fn lower(
        &self,
        state: &mut GraphState,
        primitives: &mut Vec<CompiledPrimitive>,
    ) -> GraphResult<(usize, usize)> {
        let GraphState {
            arena,
            nodes,
            sequences,
            ..
        } = state;
        let (mut fused, mut in_place) = (0, 0);
        for sequence in sequences.iter() {
            let source = &nodes[sequence.source.0];
            source.calculate_output_dims(arena)?;
            let mut acc = PrimitiveAccumulator::new(
                source.primitive_kind(),
                source.output(arena, 0)?.dims().to_vec(),
                source.input(arena, 0)?.dtype(),
            );
            let mut cx = LoweringContext {
                arena: &mut *arena,
                tables: &self.tables,
                engine: self.handler.engine(),
                primitives: &mut *primitives,
            };
            for entry in &sequence.post_ops {
                acc.input_idx = Some(entry.slot);
                nodes[entry.node.0].generate_post_op(&mut acc, &mut cx)?;
            }
            acc.input_idx = None;
            // fused casts only retype the destination
            fused += acc.num_post_ops;
            if self.config.enable_in_place && source.build_in_place(&mut acc, &mut cx)? {
                in_place += 1;
            }
            let before = cx.primitives.len();
            source.generate_primitive(&mut acc, &mut cx)?;
            debug!(
                source = %source.name,
                op_type = %source.op_type,
                post_ops = sequence.post_ops.len(),
                primitives = primitives.len() - before,
                in_place = acc.in_place,
                "lowered sequence"
            );
        }
        Ok((fused, in_place))
    }

    /// Appends a reorder for each output whose producer does not write a
    /// plain layout on the host engine.
    fn normalize_outputs(
        &self,
        state: &mut GraphState,
        primitives: &mut Vec<CompiledPrimitive>,
    ) -> GraphResult<usize> {
        let cpu = self.handler.cpu_engine();
        let mut reorders = 0;
        for &slot in &state.output_slots {
            let tensor = state.arena.get_mut(slot);
            let memory = tensor.host_memory()?.clone();
            if memory.desc().is_plain() && memory.engine().is_cpu() {
                continue;
            }
            let plain = MemoryDesc::plain(memory.desc().dims(), memory.desc().dtype());
            let target = Memory::new(plain.clone(), &cpu)?;
            let reorder = Primitive::reorder(memory.desc(), &plain, &cpu)?;
            let mut args = ArgMap::default();
            args.insert(Arg::Src, memory);
            args.insert(Arg::Dst, target.clone());
            primitives.push((reorder, args));
            tensor.set_host_memory(target);
            reorders += 1;
            debug!(tensor = %tensor.name(), "reordering output to plain layout");
        }
        Ok(reorders)
    }

    fn bind_locked(
        &self,
        state: &mut GraphState,
        inputs: &TensorMap,
        outputs: &TensorMap,
    ) -> GraphResult<()> {
        let stream = self.handler.stream();
        let bindings = state
            .input_slots
            .iter()
            .map(|&slot| (slot, inputs))
            .chain(state.output_slots.iter().map(|&slot| (slot, outputs)));
        for (slot, map) in bindings {
            let tensor = state.arena.get_mut(slot);
            if let Some(data) = map.get(tensor.name()) {
                tensor.set_data_handle(data.buffer.clone())?;
                stream.wait()?;
            }
        }
        Ok(())
    }

    fn predict_locked(&self, state: &GraphState) -> GraphResult<()> {
        let stream = self.handler.stream();
        for (primitive, args) in state.primitives.iter() {
            primitive.execute(&stream, args)?;
            stream.wait()?;
        }
        Ok(())
    }
}

fn named<'a>(arena: &'a TensorArena, name: &str) -> GraphResult<&'a Tensor> {
    arena
        .lookup(name)
        .map(|slot| arena.get(slot))
        .ok_or_else(|| GraphError::TensorNotFound(name.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shape_signature() {
        let a = [1usize, 3, 224, 224];
        let b = [4usize];
        assert_eq!(shape_signature([&a[..], &b[..]]), "1,3,224,224,|4,|");
        let scalar: [usize; 0] = [];
        assert_eq!(shape_signature([&scalar[..]]), "|");
    }

    #[test]
    fn test_compiled_graph_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<CompiledGraph>();
    }
}
