use async_trait::async_trait;
use bytes::Bytes;
use rand::Rng;
use std::future::Future;
use tokio::time::Duration;
use tracing::{debug, warn};

use super::{JobGateway, PollResult};
use crate::config::RetryConfig;
use crate::error::GatewayError;
use crate::state::JobKind;

/// Bounded exponential backoff for transport failures
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,

    /// Fractional jitter; the delay is scaled by a factor in `[1 - jitter, 1 + jitter]`
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: config.base_delay(),
            max_delay: config.max_delay(),
            jitter: config.jitter.clamp(0.0, 1.0),
        }
    }

    /// Delay before the retry that follows failed attempt `attempt` (0-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(31));
        let exponential = self.base_delay.saturating_mul(factor).min(self.max_delay);

        if self.jitter <= 0.0 {
            return exponential;
        }

        let scale = rand::thread_rng().gen_range((1.0 - self.jitter)..=(1.0 + self.jitter));
        exponential.mul_f64(scale)
    }

    fn delay_after(&self, attempt: u32, err: &GatewayError) -> Duration {
        match err.retry_after() {
            Some(server_hint) => server_hint.min(self.max_delay),
            None => self.delay_for(attempt),
        }
    }

    /// Run `f` until it succeeds, fails non-retryably, or attempts run out
    pub async fn run<T, F, Fut>(&self, operation: &str, mut f: F) -> Result<T, GatewayError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, GatewayError>>,
    {
        let mut attempt = 0;
        loop {
            match f().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && attempt + 1 < self.max_attempts => {
                    let delay = self.delay_after(attempt, &err);
                    warn!(
                        "{} attempt {}/{} failed, retrying in {:?}: {}",
                        operation,
                        attempt + 1,
                        self.max_attempts,
                        delay,
                        err
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => {
                    if err.is_retryable() {
                        debug!("{} gave up after {} attempts", operation, attempt + 1);
                    }
                    return Err(err);
                }
            }
        }
    }
}

/// Applies a [`RetryPolicy`] to every call of the wrapped gateway
pub struct RetryingGateway<G> {
    inner: G,
    policy: RetryPolicy,
}

impl<G: JobGateway> RetryingGateway<G> {
    pub fn new(inner: G, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    pub fn inner(&self) -> &G {
        &self.inner
    }
}

#[async_trait]
impl<G: JobGateway> JobGateway for RetryingGateway<G> {
    async fn submit(&self, kind: JobKind, spec: &serde_json::Value) -> Result<String, GatewayError> {
        let inner = &self.inner;
        self.policy.run("submit", move || inner.submit(kind, spec)).await
    }

    async fn poll(&self, job_id: &str) -> Result<PollResult, GatewayError> {
        let inner = &self.inner;
        self.policy.run("poll", move || inner.poll(job_id)).await
    }

    async fn fetch(&self, output_ref: &str) -> Result<Bytes, GatewayError> {
        let inner = &self.inner;
        self.policy.run("fetch", move || inner.fetch(output_ref)).await
    }

    async fn release(&self, output_ref: &str) -> Result<(), GatewayError> {
        self.inner.release(output_ref).await
    }

    fn name(&self) -> &'static str {
        self.inner.name()
    }
}
