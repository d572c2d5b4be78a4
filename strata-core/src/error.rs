//! Error types for STRATA operations
//!
//! All error types are `Clone`: a single refresh failure is delivered to
//! every waiter parked on the key lock, so errors must be duplicable.

use thiserror::Error;

/// Input validation errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Cache key must not be empty")]
    EmptyKey,

    #[error("Cache stack requires at least one layer")]
    NoLayers,

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

/// Lifecycle errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StateError {
    #[error("Operation '{operation}' invoked on a disposed cache stack")]
    Disposed { operation: &'static str },
}

/// Cache layer errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LayerError {
    /// Raised by a layer implementation; the stack does not know about
    /// backend internals beyond the failure message.
    #[error("Layer backend failed during {operation}: {reason}")]
    Backend { operation: &'static str, reason: String },

    /// Raised by the stack, attributing a layer failure to its position.
    #[error("Layer {layer_index} failed during {operation}: {reason}")]
    OperationFailed {
        layer_index: usize,
        operation: &'static str,
        reason: String,
    },
}

/// Refresh errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RefreshError {
    #[error("Value factory failed for key '{key}': {reason}")]
    FactoryFailed { key: String, reason: String },

    #[error("Refresh for key '{key}' was cancelled before completion")]
    Cancelled { key: String },
}

/// Extension hook errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ExtensionError {
    #[error("Extension '{extension}' failed during {hook}: {reason}")]
    HookFailed {
        extension: String,
        hook: &'static str,
        reason: String,
    },
}

/// Master error type for all STRATA errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StrataError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("State error: {0}")]
    State(#[from] StateError),

    #[error("Layer error: {0}")]
    Layer(#[from] LayerError),

    #[error("Refresh error: {0}")]
    Refresh(#[from] RefreshError),

    #[error("Extension error: {0}")]
    Extension(#[from] ExtensionError),
}

/// Result type alias for STRATA operations.
pub type StrataResult<T> = Result<T, StrataError>;
