//! Graph Error Types
//!
//! Error handling for graph building, transformation, lowering and execution.
//!
//! @version 0.1.0
//! @author AutomataNexus Development Team

use thiserror::Error;

use crate::source::ElementType;

/// Errors raised by the graph compiler.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GraphError {
    /// Operator type with no mapping or no node implementation.
    #[error("Unsupported operator {op_type} on node {node}")]
    UnsupportedOperator {
        /// The operator type.
        op_type: String,
        /// The node carrying it.
        node: String,
    },

    /// A required attribute is absent.
    #[error("Missing attribute '{attribute}' on node {node}")]
    MissingAttribute {
        /// The node missing the attribute.
        node: String,
        /// Attribute name.
        attribute: String,
    },

    /// An attribute is present but unusable.
    #[error("Invalid attribute '{attribute}' on node {node}: {reason}")]
    InvalidAttribute {
        /// The node carrying the attribute.
        node: String,
        /// Attribute name.
        attribute: String,
        /// Why it is rejected.
        reason: String,
    },

    /// A node has fewer operands than its operator requires.
    #[error("Node {node} ({op_type}) requires {expected} {role}, got {actual}")]
    ArityMismatch {
        /// The node.
        node: String,
        /// Its operator type.
        op_type: String,
        /// "inputs" or "outputs".
        role: &'static str,
        /// Required count.
        expected: usize,
        /// Count present.
        actual: usize,
    },

    /// Operand access past the end of a node's operand list.
    #[error("Operand index {index} out of range for node {node} with {count} operands")]
    IndexOutOfRange {
        /// The node.
        node: String,
        /// Requested index.
        index: usize,
        /// Operands available.
        count: usize,
    },

    /// Element type with no backend equivalent.
    #[error("Unsupported element type {0:?}")]
    UnsupportedElementType(ElementType),

    /// A graph input was not supplied at compile time.
    #[error("Input not found: {0}")]
    InputNotFound(String),

    /// A named tensor does not exist in the graph.
    #[error("Tensor not found: {0}")]
    TensorNotFound(String),

    /// A tensor still has unknown dims where concrete ones are required.
    #[error("Tensor {tensor} has unresolved dims {dims}")]
    DynamicShape {
        /// The tensor.
        tensor: String,
        /// Its dims, rendered.
        dims: String,
    },

    /// A tensor has no bound memory where one is required.
    #[error("Tensor {0} has no bound memory")]
    UnboundTensor(String),

    /// Structurally invalid source graph.
    #[error("Invalid graph: {0}")]
    InvalidGraph(String),

    /// Source graph (de)serialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Backend failure while creating or executing primitives.
    #[error(transparent)]
    Backend(#[from] fusegraph_core::Error),
}

/// Result type for graph operations.
pub type GraphResult<T> = Result<T, GraphError>;

impl GraphError {
    /// Creates an unsupported operator error.
    #[must_use]
    pub fn unsupported_operator(op_type: &str, node: &str) -> Self {
        Self::UnsupportedOperator {
            op_type: op_type.to_string(),
            node: node.to_string(),
        }
    }

    /// Creates a missing attribute error.
    #[must_use]
    pub fn missing_attribute(node: &str, attribute: &str) -> Self {
        Self::MissingAttribute {
            node: node.to_string(),
            attribute: attribute.to_string(),
        }
    }

    /// Creates an invalid attribute error.
    #[must_use]
    pub fn invalid_attribute(node: &str, attribute: &str, reason: impl Into<String>) -> Self {
        Self::InvalidAttribute {
            node: node.to_string(),
            attribute: attribute.to_string(),
            reason: reason.into(),
        }
    }
}

impl From<serde_json::Error> for GraphError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = GraphError::unsupported_operator("Foo", "n0");
        assert_eq!(err.to_string(), "Unsupported operator Foo on node n0");

        let err = GraphError::missing_attribute("sln", "epsilon");
        assert!(err.to_string().contains("epsilon"));
    }

    #[test]
    fn test_backend_error_is_transparent() {
        let err: GraphError = fusegraph_core::Error::ElementCountMismatch { from: 6, to: 4 }.into();
        assert_eq!(
            err.to_string(),
            "Element count mismatch: 6 elements cannot be reordered into 4"
        );
    }
}
