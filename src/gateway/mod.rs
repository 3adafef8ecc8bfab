pub mod kie;
pub mod retry;
pub mod speech;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::config::Config;
use crate::error::GatewayError;
use crate::state::JobKind;

pub use kie::KieGateway;
pub use retry::{RetryPolicy, RetryingGateway};
pub use speech::SpeechGateway;

/// Normalised remote job status
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PollStatus {
    Pending,
    Done,
    Failed,
}

/// Result of a single status poll
#[derive(Debug, Clone, PartialEq)]
pub struct PollResult {
    pub status: PollStatus,
    pub output_ref: Option<String>,
    pub error: Option<String>,
}

impl PollResult {
    pub fn pending() -> Self {
        Self {
            status: PollStatus::Pending,
            output_ref: None,
            error: None,
        }
    }

    pub fn done(output_ref: impl Into<String>) -> Self {
        Self {
            status: PollStatus::Done,
            output_ref: Some(output_ref.into()),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: PollStatus::Failed,
            output_ref: None,
            error: Some(error.into()),
        }
    }
}

/// A remote service that runs long jobs: submit, poll, fetch
#[async_trait]
pub trait JobGateway: Send + Sync {
    async fn submit(&self, kind: JobKind, spec: &serde_json::Value) -> Result<String, GatewayError>;
    async fn poll(&self, job_id: &str) -> Result<PollResult, GatewayError>;
    async fn fetch(&self, output_ref: &str) -> Result<Bytes, GatewayError>;

    /// Drop anything held for `output_ref` once its artifact is on disk
    async fn release(&self, _output_ref: &str) -> Result<(), GatewayError> {
        Ok(())
    }

    fn name(&self) -> &'static str;
}

#[async_trait]
impl<G: JobGateway + ?Sized> JobGateway for Arc<G> {
    async fn submit(&self, kind: JobKind, spec: &serde_json::Value) -> Result<String, GatewayError> {
        (**self).submit(kind, spec).await
    }

    async fn poll(&self, job_id: &str) -> Result<PollResult, GatewayError> {
        (**self).poll(job_id).await
    }

    async fn fetch(&self, output_ref: &str) -> Result<Bytes, GatewayError> {
        (**self).fetch(output_ref).await
    }

    async fn release(&self, output_ref: &str) -> Result<(), GatewayError> {
        (**self).release(output_ref).await
    }

    fn name(&self) -> &'static str {
        (**self).name()
    }
}

/// Build the retry-wrapped production gateway for a job kind
pub fn create_gateway(kind: JobKind, config: &Config) -> anyhow::Result<Arc<dyn JobGateway>> {
    let policy = RetryPolicy::from_config(&config.retry);
    match kind {
        JobKind::Image | JobKind::Video => {
            let gateway = KieGateway::new(&config.gateway)?;
            Ok(Arc::new(RetryingGateway::new(gateway, policy)))
        }
        JobKind::Speech => {
            let spool = config.output.base_dir.join("speech").join(".pending");
            let gateway = SpeechGateway::new(&config.gateway, &config.speech, spool)?;
            Ok(Arc::new(RetryingGateway::new(gateway, policy)))
        }
    }
}

/// Parse a `Retry-After` header given in seconds
pub(crate) fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<std::time::Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<f64>().ok())
        .filter(|secs| secs.is_finite() && *secs >= 0.0)
        .map(std::time::Duration::from_secs_f64)
}

/// Map a non-success HTTP response into the gateway error taxonomy
pub(crate) async fn error_from_response(response: reqwest::Response) -> GatewayError {
    let status = response.status();
    let retry_after = parse_retry_after(response.headers());
    let body = response.text().await.unwrap_or_default();
    let message: String = body.chars().take(500).collect();

    if status.as_u16() == 429 || status.is_server_error() {
        GatewayError::Transport {
            status: Some(status.as_u16()),
            message,
            retry_after,
        }
    } else {
        GatewayError::Validation(format!("HTTP {}: {}", status.as_u16(), message))
    }
}
