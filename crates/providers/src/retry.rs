//! Retry with exponential backoff for transient provider failures.
//!
//! A turn is retried only while nothing has been delivered to the caller:
//! on a failed stream open, or when the very first item of a stream is a
//! transient error. Once a chunk has been forwarded, errors surface as-is so
//! text is never duplicated.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};
use weft_core::error::ProviderError;
use weft_core::provider::*;

/// Wraps a provider and retries transient failures.
pub struct RetryingProvider {
    inner: Arc<dyn weft_core::Provider>,
    max_retries: u32,
    base_delay: Duration,
    max_delay: Duration,
}

impl RetryingProvider {
    pub fn new(inner: Arc<dyn weft_core::Provider>) -> Self {
        Self {
            inner,
            max_retries: 2,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    /// Delay before retry number `attempt` (1-based). Rate limits use the
    /// provider's hint when it is longer.
    fn delay_for(&self, attempt: u32, error: &ProviderError) -> Duration {
        let exp = self.base_delay.saturating_mul(1u32 << (attempt - 1).min(16));
        let delay = match error {
            ProviderError::RateLimited { retry_after_secs } => {
                exp.max(Duration::from_secs(*retry_after_secs))
            }
            _ => exp,
        };
        delay.min(self.max_delay)
    }

    async fn open(&self, request: ProviderRequest) -> Result<ChunkReceiver, ProviderError> {
        let mut rx = self.inner.stream(request).await?;

        match rx.recv().await {
            Some(Err(e)) => Err(e),
            Some(Ok(first)) => {
                let (tx, out) = mpsc::channel(64);
                tokio::spawn(async move {
                    if tx.send(Ok(first)).await.is_err() {
                        return;
                    }
                    while let Some(item) = rx.recv().await {
                        if tx.send(item).await.is_err() {
                            return;
                        }
                    }
                });
                Ok(out)
            }
            None => Err(ProviderError::StreamInterrupted("stream closed before first chunk".into())),
        }
    }
}

#[async_trait]
impl weft_core::Provider for RetryingProvider {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn stream(&self, request: ProviderRequest) -> std::result::Result<ChunkReceiver, ProviderError> {
        let mut attempt = 0;
        loop {
            match self.open(request.clone()).await {
                Ok(rx) => return Ok(rx),
                Err(e) if e.is_transient() && attempt < self.max_retries => {
                    attempt += 1;
                    let delay = self.delay_for(attempt, &e);
                    warn!(
                        provider = %self.inner.name(),
                        error = %e,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "Transient provider error, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    if attempt > 0 {
                        info!(provider = %self.inner.name(), attempts = attempt + 1, "Giving up after retries");
                    }
                    return Err(e);
                }
            }
        }
    }

    async fn health_check(&self) -> std::result::Result<bool, ProviderError> {
        self.inner.health_check().await
    }
}
