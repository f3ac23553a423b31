//! Engine Handler
//!
//! Selects the engine a compiled graph lowers onto and keeps the host CPU
//! engine at hand for host-visible outputs.
//!
//! @version 0.1.0
//! @author AutomataNexus Development Team

use fusegraph_core::{Engine, EngineKind, Stream};
use tracing::warn;

/// Preferred engine plus the host CPU engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineHandler {
    engine: Engine,
    cpu: Engine,
}

impl EngineHandler {
    /// Opens the first engine of `kind`, falling back to the CPU when none exists.
    #[must_use]
    pub fn new(kind: EngineKind) -> Self {
        let engine = match Engine::new(kind, 0) {
            Ok(engine) => engine,
            Err(err) => {
                warn!(?kind, error = %err, "engine unavailable, using cpu");
                Engine::cpu()
            }
        };
        Self {
            engine,
            cpu: Engine::cpu(),
        }
    }

    /// Engine primitives run on.
    #[must_use]
    pub const fn engine(&self) -> Engine {
        self.engine
    }

    /// Host CPU engine.
    #[must_use]
    pub const fn cpu_engine(&self) -> Engine {
        self.cpu
    }

    /// Creates a stream on the preferred engine.
    #[must_use]
    pub fn stream(&self) -> Stream {
        Stream::new(&self.engine)
    }
}

impl Default for EngineHandler {
    fn default() -> Self {
        Self::new(EngineKind::Cpu)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gpu_falls_back_to_cpu() {
        let handler = EngineHandler::new(EngineKind::Gpu);
        assert!(handler.engine().is_cpu());
        assert!(handler.cpu_engine().is_cpu());
        assert_eq!(handler.stream().engine(), &handler.engine());
    }
}
