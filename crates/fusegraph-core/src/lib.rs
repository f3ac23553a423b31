//! fusegraph Core - Backend Layer for the fusegraph Compiler
//!
//! This crate provides the execution backend the graph compiler lowers to:
//! element types, engines and streams, memory descriptors and memory objects,
//! primitive descriptors with post-op attributes, and a reference CPU
//! executor.
//!
//! # Key Features
//! - Element type system (f32, f16, bf16, s32, s8, u8)
//! - Plain, channels-last and strided memory layouts
//! - Rebindable data handles shared between memory clones
//! - Post-op chains and zero-point attributes
//! - Pluggable backend architecture
//!
//! # Example
//! ```rust
//! use fusegraph_core::{Algorithm, Arg, ArgMap, DataType, Engine, Memory, MemoryDesc};
//! use fusegraph_core::{Primitive, PrimitiveAttr, PrimitiveDesc, Stream};
//!
//! let engine = Engine::cpu();
//! let desc = MemoryDesc::plain(&[4], DataType::F32);
//! let pd = PrimitiveDesc::eltwise(Algorithm::EltwiseRelu, 0.0, 0.0, desc.clone()).unwrap();
//! let relu = Primitive::new(pd, PrimitiveAttr::new(), &engine).unwrap();
//!
//! let src = Memory::new(desc.clone(), &engine).unwrap();
//! src.store(&[-1.0, 2.0, -3.0, 4.0]).unwrap();
//! let dst = Memory::new(desc, &engine).unwrap();
//!
//! let mut args = ArgMap::default();
//! args.insert(Arg::Src, src);
//! args.insert(Arg::Dst, dst.clone());
//! relu.execute(&Stream::new(&engine), &args).unwrap();
//! assert_eq!(dst.load().unwrap(), vec![0.0, 2.0, 0.0, 4.0]);
//! ```
//!
//! @version 0.1.0
//! @author AutomataNexus Development Team

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
// Numeric-kernel allowances
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_wrap)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::similar_names)]
#![allow(clippy::many_single_char_names)]
#![allow(clippy::too_many_arguments)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::cast_lossless)]
#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::items_after_statements)]
#![allow(clippy::unreadable_literal)]
#![allow(clippy::needless_range_loop)]
#![allow(clippy::match_same_arms)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::float_cmp)]

pub mod backends;
pub mod dtype;
pub mod engine;
pub mod error;
pub mod memory;
pub mod primitive;

// =============================================================================
// Re-exports
// =============================================================================

pub use backends::{Backend, CpuBackend};
pub use dtype::DataType;
pub use engine::{Engine, EngineCapabilities, EngineKind, Stream};
pub use error::{Error, Result};
pub use memory::{Buffer, Dims, Format, Memory, MemoryDesc, Strides};
pub use primitive::{
    Algorithm, Arg, ArgMap, ConvolutionParams, PostOp, PostOps, Primitive, PrimitiveAttr,
    PrimitiveDesc, PrimitiveKind, ZeroPoint,
};
