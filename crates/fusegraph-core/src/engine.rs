//! Engines and Streams - Execution Targets
//!
//! An `Engine` names the hardware a memory object lives on and a primitive
//! runs on. A `Stream` is an in-order execution queue on one engine; every
//! primitive submitted to it completes before `wait` returns.
//!
//! # Key Features
//! - CPU engine (always available)
//! - GPU engine kind, reported unavailable by this build
//! - Capability queries backed by `sysinfo`
//!
//! # Example
//! ```rust
//! use fusegraph_core::{Engine, EngineKind, Stream};
//!
//! let engine = Engine::cpu();
//! assert!(engine.is_cpu());
//! let stream = Stream::new(&engine);
//! stream.wait().unwrap();
//! ```
//!
//! @version 0.1.0
//! @author AutomataNexus Development Team

use core::fmt;

use serde::{Deserialize, Serialize};
use sysinfo::System;

use crate::error::{Error, Result};

// =============================================================================
// Engine Kind
// =============================================================================

/// Kind of hardware an engine drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum EngineKind {
    /// Host CPU.
    #[default]
    Cpu,
    /// Accelerator device.
    Gpu,
}

impl EngineKind {
    /// Number of engines of this kind present in this build.
    #[must_use]
    pub const fn count(self) -> usize {
        match self {
            Self::Cpu => 1,
            Self::Gpu => 0,
        }
    }
}

// =============================================================================
// Engine
// =============================================================================

/// A hardware execution target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Engine {
    kind: EngineKind,
    index: usize,
}

impl Engine {
    /// Opens engine `index` of the given kind.
    pub fn new(kind: EngineKind, index: usize) -> Result<Self> {
        if index >= kind.count() {
            return Err(Error::EngineNotAvailable { kind, index });
        }
        Ok(Self { kind, index })
    }

    /// Returns the host CPU engine.
    #[must_use]
    pub const fn cpu() -> Self {
        Self {
            kind: EngineKind::Cpu,
            index: 0,
        }
    }

    /// Returns the engine kind.
    #[must_use]
    pub const fn kind(&self) -> EngineKind {
        self.kind
    }

    /// Returns the engine index within its kind.
    #[must_use]
    pub const fn index(&self) -> usize {
        self.index
    }

    /// Returns true if this is a CPU engine.
    #[must_use]
    pub const fn is_cpu(&self) -> bool {
        matches!(self.kind, EngineKind::Cpu)
    }

    /// Returns the capabilities of this engine.
    #[must_use]
    pub fn capabilities(&self) -> EngineCapabilities {
        match self.kind {
            EngineKind::Cpu => EngineCapabilities {
                name: "CPU".to_string(),
                total_memory: get_system_memory(),
                available_memory: get_available_memory(),
                threads: num_cpus(),
            },
            EngineKind::Gpu => EngineCapabilities {
                name: format!("GPU {}", self.index),
                total_memory: 0,
                available_memory: 0,
                threads: 0,
            },
        }
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::cpu()
    }
}

impl fmt::Display for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            EngineKind::Cpu => write!(f, "cpu"),
            EngineKind::Gpu => write!(f, "gpu:{}", self.index),
        }
    }
}

// =============================================================================
// Engine Capabilities
// =============================================================================

/// Information about an engine's resources.
#[derive(Debug, Clone)]
pub struct EngineCapabilities {
    /// Name of the engine.
    pub name: String,
    /// Total memory in bytes.
    pub total_memory: usize,
    /// Available memory in bytes.
    pub available_memory: usize,
    /// Worker threads the engine can use.
    pub threads: usize,
}

fn get_system_memory() -> usize {
    let sys = System::new_all();
    sys.total_memory() as usize
}

fn get_available_memory() -> usize {
    let sys = System::new_all();
    sys.available_memory() as usize
}

fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(std::num::NonZeroUsize::get)
        .unwrap_or(1)
}

// =============================================================================
// Stream
// =============================================================================

/// In-order execution queue on one engine.
///
/// The reference backend executes primitives synchronously, so a submitted
/// primitive has completed by the time `execute` returns and `wait` only
/// reports success.
#[derive(Debug, Clone)]
pub struct Stream {
    engine: Engine,
}

impl Stream {
    /// Creates a stream on `engine`.
    #[must_use]
    pub fn new(engine: &Engine) -> Self {
        Self { engine: *engine }
    }

    /// Returns the engine this stream executes on.
    #[must_use]
    pub const fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Blocks until every submitted primitive has completed.
    pub fn wait(&self) -> Result<()> {
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
