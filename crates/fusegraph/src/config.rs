//! Graph Configuration
//!
//! Knobs controlling fusion, in-place aliasing, initializer binding and
//! engine selection for a compiled graph.
//!
//! @version 0.1.0
//! @author AutomataNexus Development Team

use fusegraph_core::EngineKind;
use serde::{Deserialize, Serialize};

// =============================================================================
// Graph Configuration
// =============================================================================

/// Configuration for building and compiling a graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GraphConfig {
    /// Fuse compatible successors into post-op chains.
    pub enable_fusion: bool,
    /// Let binary and layer normalization sources write into their first input.
    pub enable_in_place: bool,
    /// Bind initializer data from the source graph when the host omits it.
    pub bind_initializers: bool,
    /// Preferred engine kind; falls back to CPU when unavailable.
    pub engine: EngineKind,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            enable_fusion: true,
            enable_in_place: true,
            bind_initializers: true,
            engine: EngineKind::Cpu,
        }
    }
}

impl GraphConfig {
    /// Creates a configuration with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a configuration with no fusion and no aliasing.
    ///
    /// Every node becomes its own primitive and writes its own buffer.
    #[must_use]
    pub fn conservative() -> Self {
        Self {
            enable_fusion: false,
            enable_in_place: false,
            ..Self::default()
        }
    }

    /// Builder: enable or disable post-op fusion.
    #[must_use]
    pub fn fusion(mut self, enabled: bool) -> Self {
        self.enable_fusion = enabled;
        self
    }

    /// Builder: enable or disable in-place aliasing.
    #[must_use]
    pub fn in_place(mut self, enabled: bool) -> Self {
        self.enable_in_place = enabled;
        self
    }

    /// Builder: enable or disable automatic initializer binding.
    #[must_use]
    pub fn bind_initializers(mut self, enabled: bool) -> Self {
        self.bind_initializers = enabled;
        self
    }

    /// Builder: set the preferred engine kind.
    #[must_use]
    pub fn engine(mut self, engine: EngineKind) -> Self {
        self.engine = engine;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = GraphConfig::default();
        assert!(config.enable_fusion);
        assert!(config.enable_in_place);
        assert!(config.bind_initializers);
        assert_eq!(config.engine, EngineKind::Cpu);
    }

    #[test]
    fn test_builder_and_presets() {
        let config = GraphConfig::new().fusion(false).engine(EngineKind::Gpu);
        assert!(!config.enable_fusion);
        assert_eq!(config.engine, EngineKind::Gpu);

        let conservative = GraphConfig::conservative();
        assert!(!conservative.enable_fusion);
        assert!(!conservative.enable_in_place);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: GraphConfig = serde_json::from_str(r#"{"enable_in_place": false}"#).unwrap();
        assert!(config.enable_fusion);
        assert!(!config.enable_in_place);
    }
}
