//! Error taxonomy shared by every pipeline stage.
//!
//! Workers retry `TransientIo` with backoff; every other kind bubbles out,
//! marks the owning ingestion run failed and is surfaced on the next
//! scheduled run. The API layer maps each kind to a stable string code.

use thiserror::Error;

pub type CoreResult<T> = Result<T, CoreError>;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("transient io error: {0}")]
    TransientIo(String),

    #[error("source payload does not match declared schema: {0}")]
    SourceSchema(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("rate limited: retry after {wait_secs}s")]
    RateLimit { wait_secs: i64 },

    #[error("{0} not found")]
    NotFound(String),

    #[error("upsert conflict: {0}")]
    Conflict(String),

    #[error("forbidden: {0}")]
    Forbidden(String),
}

impl CoreError {
    /// Stable string code exposed over the API. Never leaks internals.
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::Config(_) => "config_error",
            CoreError::TransientIo(_) => "transient_io",
            CoreError::SourceSchema(_) => "source_schema",
            CoreError::Auth(_) => "auth_failed",
            CoreError::RateLimit { .. } => "rate_limited",
            CoreError::NotFound(_) => "not_found",
            CoreError::Conflict(_) => "conflict",
            CoreError::Forbidden(_) => "forbidden",
        }
    }

    /// Whether a job handler failing with this error should be retried.
    /// `Conflict` gets a single retry; the queue layer enforces the cap.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CoreError::TransientIo(_) | CoreError::Conflict(_)
        )
    }

    pub fn transient(err: impl std::fmt::Display) -> Self {
        CoreError::TransientIo(err.to_string())
    }

    pub fn schema(err: impl std::fmt::Display) -> Self {
        CoreError::SourceSchema(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(CoreError::Config("x".into()).code(), "config_error");
        assert_eq!(CoreError::RateLimit { wait_secs: 10 }.code(), "rate_limited");
        assert_eq!(CoreError::NotFound("bill".into()).code(), "not_found");
    }

    #[test]
    fn only_transient_and_conflict_retry() {
        assert!(CoreError::TransientIo("net".into()).is_retryable());
        assert!(CoreError::Conflict("dup".into()).is_retryable());
        assert!(!CoreError::SourceSchema("bad".into()).is_retryable());
        assert!(!CoreError::Auth("sig".into()).is_retryable());
        assert!(!CoreError::Forbidden("plan".into()).is_retryable());
    }
}
