//! fusegraph - Tensor Graph Compiler
//!
//! Compiles a topologically ordered graph of tensor operators into a list of
//! backend primitives. Each supported operator lowers to one primitive;
//! chains of compatible successors fuse onto it as post-ops, layouts are
//! reconciled with reorders, and outputs may alias their inputs. The list is
//! rebuilt only when the bound input shapes change.
//!
//! # Pipeline
//! 1. [`GraphBuilder`] builds nodes and the tensor arena, decomposing hyper
//!    operators.
//! 2. [`GraphTransformer`] elides zero weight zero points and partitions the
//!    nodes into fused sequences.
//! 3. [`CompiledGraph`] lowers each sequence for the bound shapes and runs
//!    the resulting primitives in order on one stream.
//!
//! # Example
//! ```rust
//! use std::sync::Arc;
//! use fusegraph::source::{ElementType, OperandDesc, SourceGraph, SourceNode};
//! use fusegraph::{CompiledGraph, GraphConfig, PrimitiveTables};
//!
//! let f = |name: &str, dims: &[i64]| OperandDesc::new(name, dims, ElementType::Float);
//! let mut graph = SourceGraph::new("block");
//! graph.add_node(SourceNode::new("MatMul", "mm").input(f("x", &[2, 3])).input(f("w", &[3, 4])).output(f("h", &[2, 4])));
//! graph.add_node(SourceNode::new("Relu", "act").input(f("h", &[2, 4])).output(f("y", &[2, 4])));
//! graph.add_input("x");
//! graph.add_input("w");
//! graph.add_output("y");
//!
//! let compiled = CompiledGraph::new(&graph, GraphConfig::default(), Arc::new(PrimitiveTables::new())).unwrap();
//! let sequences = compiled.sequences();
//! assert_eq!(sequences.len(), 1);
//! assert_eq!(sequences[0].post_ops[0].name, "act");
//! ```
//!
//! @version 0.1.0
//! @author AutomataNexus Development Team

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_wrap)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::too_many_arguments)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::float_cmp)]

pub mod accumulator;
pub mod builder;
pub mod config;
pub mod error;
pub mod graph;
pub mod handler;
pub mod node;
pub mod nodes;
pub mod source;
pub mod tables;
pub mod tensor;
pub mod transform;

// =============================================================================
// Re-exports
// =============================================================================

pub use accumulator::{PrimitiveAccumulator, MAX_POST_OPS};
pub use builder::{BuiltGraph, GraphBuilder};
pub use config::GraphConfig;
pub use error::{GraphError, GraphResult};
pub use graph::{shape_signature, CompileStats, CompiledGraph, PostOpInfo, SequenceInfo};
pub use handler::EngineHandler;
pub use node::{LoweringContext, Node, NodeId, PrimitiveNode};
pub use nodes::NodeKind;
pub use source::{SourceGraph, TensorData, TensorMap};
pub use tables::PrimitiveTables;
pub use tensor::{Dim, SlotId, Tensor, TensorArena, TensorState, EMPTY_SLOT};
pub use transform::{FusedSequence, GraphTransformer, PostOpEntry};

/// Commonly used types.
pub mod prelude {
    pub use crate::source::{AttributeValue, ElementType, Initializer, OperandDesc, SourceNode};
    pub use crate::{CompiledGraph, GraphConfig, GraphError, PrimitiveTables, SourceGraph, TensorData, TensorMap};
    pub use fusegraph_core::DataType;
}
