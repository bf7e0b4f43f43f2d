//! Error taxonomy shared by every component.
//!
//! Each variant maps onto one HTTP status in the application's server
//! layer; see the `palm-rag` crate's `error` module.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PalmError {
    /// Missing or malformed request fields.
    #[error("{0}")]
    Validation(String),
    /// Admission refused by the rate limiter.
    #[error("rate limit exceeded, retry after {retry_after_secs}s")]
    RateLimited {
        retry_after_secs: u64,
        /// Unix timestamp (milliseconds) at which the current window ends.
        reset_at: i64,
    },
    /// A hosted AI service (embeddings, chat model) failed or returned garbage.
    #[error("{0}")]
    Provider(String),
    #[error("{0}")]
    NotFound(String),
    #[error("unauthorized")]
    Unauthorized,
    /// Storage or other infrastructure failure.
    #[error("{0}")]
    Internal(String),
}

impl PalmError {
    pub fn provider<E: std::fmt::Display>(err: E) -> Self {
        PalmError::Provider(err.to_string())
    }

    pub fn internal<E: std::fmt::Display>(err: E) -> Self {
        PalmError::Internal(err.to_string())
    }

    /// Machine-readable kind, used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            PalmError::Validation(_) => "validation",
            PalmError::RateLimited { .. } => "rate_limited",
            PalmError::Provider(_) => "provider",
            PalmError::NotFound(_) => "not_found",
            PalmError::Unauthorized => "unauthorized",
            PalmError::Internal(_) => "internal",
        }
    }
}

pub type Result<T> = std::result::Result<T, PalmError>;
