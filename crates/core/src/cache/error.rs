use thiserror::Error;

/// Errors that can occur during cache operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CacheError {
    /// Transport-level failure. The connection that produced it is discarded.
    #[error("Cache connection fault: {0}")]
    ConnectionFault(String),
    #[error("Connection pool exhausted for {endpoint} after {waited_ms}ms")]
    PoolExhausted { endpoint: String, waited_ms: u64 },
    #[error("Cache operation timed out after {0}ms")]
    Timeout(u64),
    /// A watched key changed before the transaction committed.
    #[error("Transaction conflict on watched keys: {0}")]
    TransactionConflict(String),
    #[error("Corrupt record for {type_name}: {reason}")]
    CorruptRecord { type_name: String, reason: String },
    #[error("Registration conflict: {0}")]
    RegistrationConflict(String),
    #[error("Backing load failed for {key}: {reason}")]
    LoadFailure { key: String, reason: String },
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Cache operation failed: {0}")]
    OperationFailed(String),
}

impl CacheError {
    /// Returns true when the connection that produced this error must not be
    /// handed back to its pool.
    pub fn is_connection_fault(&self) -> bool {
        matches!(self, CacheError::ConnectionFault(_) | CacheError::Timeout(_))
    }

    /// Returns true when retrying the whole operation may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CacheError::ConnectionFault(_)
                | CacheError::PoolExhausted { .. }
                | CacheError::Timeout(_)
                | CacheError::TransactionConflict(_)
                | CacheError::LoadFailure { .. }
        )
    }
}

/// Result type for cache operations.
pub type Result<T> = std::result::Result<T, CacheError>;
