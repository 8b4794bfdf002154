//! Router Errors
//!
//! One error type for every engine operation. Variants map to the four
//! request-level failure classes (not found, budget, backend, validation)
//! plus the infrastructure errors that bubble up from storage and transport.

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Engine errors
#[derive(Error, Debug)]
pub enum RouterError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Token budget exceeded: {remaining_tokens} tokens remaining, resets at {resets_at}")]
    BudgetExceeded {
        remaining_tokens: u64,
        resets_at: DateTime<Utc>,
    },

    #[error("Backend unavailable ({backend}): {reason}")]
    BackendUnavailable { backend: String, reason: String },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl RouterError {
    pub fn backend(backend: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::BackendUnavailable {
            backend: backend.into(),
            reason: reason.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Short machine-readable kind, used in API error bodies and logs
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::BudgetExceeded { .. } => "budget_exceeded",
            Self::BackendUnavailable { .. } => "backend_unavailable",
            Self::Validation(_) => "validation_error",
            Self::Storage(_) => "storage_error",
            Self::Serialization(_) => "serialization_error",
            Self::Http(_) => "http_error",
        }
    }

    /// Whether the embedding path may retry this error
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::BackendUnavailable { .. } | Self::Http(_))
    }
}

pub type Result<T> = std::result::Result<T, RouterError>;
