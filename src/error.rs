use std::path::PathBuf;
use std::time::Duration;

/// Errors surfaced by a remote job gateway
#[derive(thiserror::Error, Debug, Clone)]
pub enum GatewayError {
    /// The request was rejected before or by the service as invalid. Never retried.
    #[error("validation error: {0}")]
    Validation(String),

    /// Timeout, connection failure, 5xx or 429. Retried with backoff.
    #[error("transport error{}: {message}", http_status_suffix(.status))]
    Transport {
        status: Option<u16>,
        message: String,
        retry_after: Option<Duration>,
    },

    /// The remote service reported the job itself as failed.
    #[error("remote job failed: {0}")]
    RemoteFailure(String),

    /// The response could not be normalised into the gateway shape.
    #[error("malformed response: {0}")]
    Malformed(String),
}

fn http_status_suffix(status: &Option<u16>) -> String {
    status.map(|s| format!(" (HTTP {s})")).unwrap_or_default()
}

impl GatewayError {
    pub fn transport(message: impl Into<String>) -> Self {
        GatewayError::Transport {
            status: None,
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, GatewayError::Transport { .. })
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            GatewayError::Transport { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        let status = err.status().map(|s| s.as_u16());
        match status {
            Some(code) if code != 429 && (400..500).contains(&code) => {
                GatewayError::Validation(err.to_string())
            }
            _ if err.is_decode() => GatewayError::Malformed(err.to_string()),
            _ => GatewayError::Transport {
                status,
                message: err.to_string(),
                retry_after: None,
            },
        }
    }
}

/// Errors from the on-disk status ledger
#[derive(thiserror::Error, Debug)]
pub enum LedgerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("ledger encoding error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("inconsistent work item {id}: {reason}")]
    Inconsistent { id: String, reason: String },

    #[error("work item not found: {0}")]
    NotFound(String),

    #[error("invalid transition for {id}: {reason}")]
    InvalidTransition { id: String, reason: String },
}

/// Errors from the external media tool
#[derive(thiserror::Error, Debug)]
pub enum RenderError {
    #[error("missing input file: {}", .0.display())]
    MissingInput(PathBuf),

    #[error("{step} failed (exit code {code:?}): {stderr_tail}")]
    Tool {
        step: String,
        code: Option<i32>,
        stderr_tail: String,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Top-level error for pipeline operations
#[derive(thiserror::Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Render(#[from] RenderError),

    #[error("local IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("planning error: {0}")]
    Planning(String),
}

pub type Result<T> = std::result::Result<T, PipelineError>;
