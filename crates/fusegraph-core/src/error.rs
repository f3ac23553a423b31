//! Error Types - Backend Error Handling
//!
//! Error type shared by every backend operation: memory descriptor algebra,
//! primitive descriptor creation, data handle binding and primitive
//! execution.
//!
//! @version 0.1.0
//! @author AutomataNexus Development Team

use thiserror::Error;

use crate::dtype::DataType;
use crate::engine::EngineKind;

// =============================================================================
// Error Types
// =============================================================================

/// The main error type for backend operations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    /// Shape mismatch between memory descriptors.
    #[error("Shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        /// The expected dims.
        expected: Vec<usize>,
        /// The actual dims.
        actual: Vec<usize>,
    },

    /// Element count mismatch between two descriptors of a reorder.
    #[error("Element count mismatch: {from} elements cannot be reordered into {to}")]
    ElementCountMismatch {
        /// Elements in the source descriptor.
        from: usize,
        /// Elements in the target descriptor.
        to: usize,
    },

    /// Data type not supported by a primitive.
    #[error("Unsupported data type {dtype} for {primitive}")]
    UnsupportedDataType {
        /// The offending data type.
        dtype: DataType,
        /// The primitive that rejected it.
        primitive: String,
    },

    /// Requested engine is not available in this build.
    #[error("Engine not available: {kind:?} {index}")]
    EngineNotAvailable {
        /// Engine kind requested.
        kind: EngineKind,
        /// Engine index requested.
        index: usize,
    },

    /// A memory object has no data handle bound.
    #[error("Memory has no data handle bound")]
    NullDataHandle,

    /// A buffer is too small for the descriptor it is bound to.
    #[error("Buffer too small: descriptor needs {required} bytes, buffer has {actual}")]
    BufferTooSmall {
        /// Bytes the descriptor spans.
        required: usize,
        /// Bytes the buffer provides.
        actual: usize,
    },

    /// An argument required by a primitive is missing from the argument map.
    #[error("Missing argument {arg} for {primitive}")]
    MissingArgument {
        /// Argument slot name.
        arg: String,
        /// Primitive being executed.
        primitive: String,
    },

    /// Descriptor cannot be reshaped.
    #[error("Invalid reshape: {message}")]
    InvalidReshape {
        /// Why the reshape is invalid.
        message: String,
    },

    /// Invalid operation for the given descriptors.
    #[error("Invalid operation: {message}")]
    InvalidOperation {
        /// Description of why the operation is invalid.
        message: String,
    },

    /// Internal error (should not happen).
    #[error("Internal error: {message}")]
    InternalError {
        /// Description of the internal error.
        message: String,
    },
}

// =============================================================================
// Result Type
// =============================================================================

/// A specialized Result type for backend operations.
pub type Result<T> = core::result::Result<T, Error>;

// =============================================================================
// Helper Functions
// =============================================================================

impl Error {
    /// Creates a new shape mismatch error.
    #[must_use]
    pub fn shape_mismatch(expected: &[usize], actual: &[usize]) -> Self {
        Self::ShapeMismatch {
            expected: expected.to_vec(),
            actual: actual.to_vec(),
        }
    }

    /// Creates a new missing argument error.
    #[must_use]
    pub fn missing_argument(arg: impl ToString, primitive: impl ToString) -> Self {
        Self::MissingArgument {
            arg: arg.to_string(),
            primitive: primitive.to_string(),
        }
    }

    /// Creates a new unsupported data type error.
    #[must_use]
    pub fn unsupported_dtype(dtype: DataType, primitive: impl ToString) -> Self {
        Self::UnsupportedDataType {
            dtype,
            primitive: primitive.to_string(),
        }
    }

    /// Creates a new invalid operation error.
    #[must_use]
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }

    /// Creates a new internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::InternalError {
            message: message.into(),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::shape_mismatch(&[2, 3], &[3, 2]);
        assert!(err.to_string().contains("Shape mismatch"));

        let err = Error::ElementCountMismatch { from: 6, to: 8 };
        assert_eq!(
            err.to_string(),
            "Element count mismatch: 6 elements cannot be reordered into 8"
        );
    }

    #[test]
    fn test_missing_argument() {
        let err = Error::missing_argument("SRC_1", "binary");
        assert_eq!(err.to_string(), "Missing argument SRC_1 for binary");
    }
}
