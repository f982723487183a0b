use thiserror::Error;

/// Error taxonomy for the retrieval-and-generation pipeline.
///
/// Retrieval consumers treat `StoreUnreachable` and `DeadlineExceeded` as
/// degradable (empty result for that source); `Invariant` is always fatal
/// for the turn.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),
    #[error("transient provider error: {0}")]
    Transient(String),
    #[error("permanent provider error: {0}")]
    Permanent(String),
    #[error("store unreachable: {0}")]
    StoreUnreachable(String),
    #[error("deadline exceeded: {0}")]
    DeadlineExceeded(String),
    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),
    #[error("invariant violated: {0}")]
    Invariant(String),
}

impl CoreError {
    pub fn transient<E: std::fmt::Display>(err: E) -> Self {
        CoreError::Transient(err.to_string())
    }

    pub fn permanent<E: std::fmt::Display>(err: E) -> Self {
        CoreError::Permanent(err.to_string())
    }

    pub fn unreachable<E: std::fmt::Display>(err: E) -> Self {
        CoreError::StoreUnreachable(err.to_string())
    }

    /// Whether the call site should retry with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, CoreError::Transient(_) | CoreError::StoreUnreachable(_))
    }
}
