//! Error taxonomy for the SOC runtime
//!
//! Recoverable conditions are plain `Result` values handled at the nearest
//! boundary; only validation and integrity errors surface to callers.

use thiserror::Error;

pub type SocResult<T> = Result<T, SocError>;

#[derive(Debug, Error)]
pub enum SocError {
    /// Schema failure, malformed IP, oversized input. Surfaced to the caller.
    #[error("validation failed: {0}")]
    Validation(String),

    /// A detector backend is unavailable. The pipeline continues degraded.
    #[error("detection degraded: {0}")]
    Detection(String),

    /// Persistent store failure after retries.
    #[error("database error: {0}")]
    Database(String),

    /// LLM adapter failure (timeout, rate limit, malformed response).
    #[error("llm error: {0}")]
    Llm(String),

    /// An effector call failed after retries.
    #[error("effector '{effector}' failed: {reason}")]
    Effector { effector: String, reason: String },

    /// Circuit breaker is open for an effector.
    #[error("circuit open for effector '{0}'")]
    CircuitOpen(String),

    /// Approval attempted by a principal without the required capability.
    #[error("unauthorized: {0}")]
    Authorization(String),

    /// The audit chain no longer verifies. Fatal: approvals halt.
    #[error("audit integrity violated at entry {index}: {reason}")]
    Integrity { index: usize, reason: String },

    #[error("operation timed out after {0} ms")]
    Timeout(u64),

    #[error("component is shutting down")]
    Shutdown,
}

impl From<rusqlite::Error> for SocError {
    fn from(err: rusqlite::Error) -> Self {
        SocError::Database(err.to_string())
    }
}

impl SocError {
    /// Transient errors are worth retrying; the rest fail fast.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SocError::Database(_) | SocError::Timeout(_) | SocError::Effector { .. }
        )
    }
}
