//! Store error types.

use thiserror::Error;

/// Store error type.
#[derive(Debug, Error)]
pub enum StoreError {
    /// No definition registered under the given uri or id.
    #[error("component def not found: {0}")]
    DefNotFound(String),

    /// A definition description could not be normalized.
    #[error("invalid component def: {0}")]
    InvalidDef(String),

    /// A component record is malformed.
    #[error("invalid component: {0}")]
    InvalidComponent(String),

    /// A component id string is not of the form `[entity,def]`.
    #[error("invalid component id: {0:?}")]
    InvalidComponentId(String),

    /// An attribute reference or filter node could not be interpreted.
    #[error("invalid filter: {0}")]
    InvalidFilter(String),

    /// JSON (de)serialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;
