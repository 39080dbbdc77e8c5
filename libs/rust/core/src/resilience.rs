//! Caller-side retry with exponential backoff and jitter.
//!
//! The engine itself never retries; callers wrap IO-prone calls (first predict on a cold
//! version, registry writes to a remote store) with [`retry_retriable`].

use std::future::Future;
use std::time::Duration;

use rand::{thread_rng, Rng};
use serde::Deserialize;
use tracing::debug;

use crate::error::LifecycleResult;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: usize,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// 0.0 - 1.0
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self { Self { max_retries: 3, base_delay_ms: 50, max_delay_ms: 1500, jitter: 0.25 } }
}

impl RetryConfig {
    fn delay(&self, attempt: usize) -> Duration {
        let exp = (self.base_delay_ms as f64 * 2f64.powi(attempt as i32)).min(self.max_delay_ms as f64);
        let jitter = exp * self.jitter.clamp(0.0, 1.0);
        let ms = if jitter > 0.0 { exp + thread_rng().gen_range(-jitter..=jitter) } else { exp };
        Duration::from_millis(ms.max(0.0) as u64)
    }
}

/// Retry `op` while it fails with an `is_retriable()` error, up to `max_retries` times.
/// Non-retriable errors return immediately.
pub async fn retry_retriable<F, Fut, T>(cfg: &RetryConfig, mut op: F) -> LifecycleResult<T>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = LifecycleResult<T>>,
{
    let mut attempt = 0;
    loop {
        match op(attempt).await {
            Ok(v) => return Ok(v),
            Err(e) if !e.is_retriable() || attempt >= cfg.max_retries => return Err(e),
            Err(e) => {
                let delay = cfg.delay(attempt);
                debug!(attempt, delay_ms = delay.as_millis() as u64, error = %e, "retrying after transient failure");
                tokio::time::sleep(delay).await;
            }
        }
        attempt += 1;
    }
}
