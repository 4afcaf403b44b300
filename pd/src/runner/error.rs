//! Runner error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("runner call timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("environment variable {0} not set")]
    MissingApiKey(String),

    #[error("script runner failed: {0}")]
    Script(String),
}

impl RunnerError {
    /// Whether a retry might succeed (routed through AutoRecovery).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RunnerError::Timeout(_) | RunnerError::Network(_) | RunnerError::RateLimited { .. }
        ) || matches!(self, RunnerError::Api { status, .. } if *status >= 500)
    }
}
