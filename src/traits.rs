use crate::model::{HarvestCursor, RawPage, SchemaVersion};
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

/// Whether a failed fetch is worth repeating.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Retryable,
    Fatal,
}

#[derive(Error, Debug)]
pub enum FetchError {
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),
    #[error("Rate limited by API (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },
    #[error("Server error: HTTP {status}")]
    Server { status: u16 },
    #[error("Authentication rejected: HTTP {status}")]
    Auth { status: u16 },
    #[error("Unexpected status: HTTP {status}")]
    UnexpectedStatus { status: u16 },
    #[error("Malformed response: {0}")]
    MalformedResponse(String),
    #[error("Response exceeds {limit} bytes")]
    ResponseTooLarge { limit: u64 },
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl FetchError {
    /// Maps a non-2xx HTTP status onto the error taxonomy.
    pub fn from_status(status: u16, retry_after: Option<Duration>) -> Self {
        match status {
            429 => FetchError::RateLimited { retry_after },
            500 | 502 | 503 => FetchError::Server { status },
            401 | 403 => FetchError::Auth { status },
            _ => FetchError::UnexpectedStatus { status },
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            FetchError::Transport(_)
            | FetchError::Timeout(_)
            | FetchError::RateLimited { .. }
            | FetchError::Server { .. } => ErrorClass::Retryable,
            FetchError::Auth { .. }
            | FetchError::UnexpectedStatus { .. }
            | FetchError::MalformedResponse(_)
            | FetchError::ResponseTooLarge { .. }
            | FetchError::InvalidRequest(_) => ErrorClass::Fatal,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Retryable
    }
}

#[async_trait]
pub trait PageSource: Send + Sync {
    /// Fetches the page the cursor points at. Never mutates the cursor.
    async fn fetch(
        &self,
        cursor: &HarvestCursor,
        schema: SchemaVersion,
    ) -> Result<RawPage, FetchError>;
}
