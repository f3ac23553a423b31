//! Backends - Engine-Specific Primitive Execution
//!
//! Each backend executes primitive descriptors against bound memory objects
//! for one engine kind.
//!
//! # Available Backends
//! - `cpu` - reference CPU backend (always available)
//!
//! # Backend Trait
//!
//! All backends implement the `Backend` trait, which lets `Primitive` stay
//! engine-agnostic.
//!
//! @version 0.1.0
//! @author AutomataNexus Development Team

use crate::engine::{Engine, EngineKind};
use crate::error::{Error, Result};
use crate::primitive::{ArgMap, PrimitiveAttr, PrimitiveDesc};

// =============================================================================
// Backend Modules
// =============================================================================

pub mod cpu;

// =============================================================================
// Re-exports
// =============================================================================

pub use cpu::CpuBackend;

// =============================================================================
// Backend Trait
// =============================================================================

/// Common interface for primitive execution backends.
pub trait Backend: Send + Sync {
    /// Returns the name of this backend.
    fn name(&self) -> &'static str;

    /// Returns true if this backend is available on the current system.
    fn is_available(&self) -> bool;

    /// Executes `desc` with `attr` on the memory objects in `args`.
    ///
    /// Completion is synchronous: all destination writes are visible on return.
    fn execute(&self, desc: &PrimitiveDesc, attr: &PrimitiveAttr, args: &ArgMap) -> Result<()>;
}

static CPU_BACKEND: CpuBackend = CpuBackend::new();

/// Returns the backend that executes primitives for `engine`.
pub fn backend_for(engine: &Engine) -> Result<&'static dyn Backend> {
    match engine.kind() {
        EngineKind::Cpu => Ok(&CPU_BACKEND),
        kind => Err(Error::EngineNotAvailable {
            kind,
            index: engine.index(),
        }),
    }
}
