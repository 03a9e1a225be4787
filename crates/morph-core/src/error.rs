//! Error taxonomy for the core. The gateway maps these onto HTTP statuses;
//! everything recoverable is absorbed before it gets here.

use crate::shared::VariantRecord;
use thiserror::Error;

/// Errors surfaced by the core to the HTTP layer.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Missing or unknown API key.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Request origin not in the tenant's allow-list.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Monthly ingest ceiling reached; counter untouched.
    #[error("quota exceeded: {used}/{limit} events this month")]
    QuotaExceeded { used: u64, limit: u64 },

    /// Malformed request or event payload.
    #[error("validation: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// Optimistic concurrency lost twice on the same variant record. Carries
    /// the authoritative record so the caller can resynchronize.
    #[error("variant record conflict")]
    Conflict { current: Box<VariantRecord> },

    /// Storage still failing after internal retries.
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("rate limited")]
    RateLimited { retry_after_secs: u64 },

    /// Soft deadline elapsed before the pipeline finished.
    #[error("deadline exceeded after {elapsed_ms} ms")]
    DeadlineExceeded { elapsed_ms: u64 },

    /// Language-model call failed or timed out. Never reaches clients; the
    /// regeneration engine absorbs it into the audit trail.
    #[error("llm: {0}")]
    Llm(String),
}

impl CoreError {
    /// Short machine-readable code used in the JSON error envelope.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Unauthorized(_) => "unauthorized",
            Self::Forbidden(_) => "forbidden",
            Self::QuotaExceeded { .. } => "quota_exceeded",
            Self::Validation(_) => "validation",
            Self::NotFound(_) => "not_found",
            Self::Conflict { .. } => "conflict",
            Self::StorageUnavailable(_) => "storage_unavailable",
            Self::RateLimited { .. } => "rate_limited",
            Self::DeadlineExceeded { .. } => "deadline_exceeded",
            Self::Llm(_) => "llm_error",
        }
    }
}

impl From<sled::Error> for CoreError {
    fn from(e: sled::Error) -> Self {
        Self::StorageUnavailable(e.to_string())
    }
}

/// Convenience alias used throughout the core.
pub type CoreResult<T> = Result<T, CoreError>;
