//! Query error types.

use ents_store::StoreError;
use thiserror::Error;

/// Query error type.
///
/// Every variant aborts the running program. Reads never leave the store
/// modified; a failed write may leave staged records behind.
#[derive(Debug, Error)]
pub enum QueryError {
    /// No overload of a word accepts the values on top of the stack.
    #[error("stack error: {0}")]
    Stack(String),

    /// Not enough values on the stack for any overload of a word.
    #[error("`{word}` needs {needed} value(s), stack has {found}")]
    Arg {
        word: String,
        needed: usize,
        found: usize,
    },

    /// A store operation failed (unknown def, malformed record, ...).
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A closing bracket without its opener, or an opener never closed.
    #[error("unbalanced `{0}`")]
    UnbalancedQuote(String),
}

impl QueryError {
    pub(crate) fn stack(msg: impl Into<String>) -> Self {
        Self::Stack(msg.into())
    }
}

/// Result type for query operations.
pub type QueryResult<T> = Result<T, QueryError>;
