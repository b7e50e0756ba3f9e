//! Backoff for the parent-node RPC link
//!
//! The full node dropping its socket around a restart or reindex is
//! routine. Calls ride it out behind a growing pause; the miner-facing
//! side never learns it happened.

use std::time::Duration;

use tokio::time::sleep;
use tracing::debug;

/// Backoff schedule
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// Total tries before the error is surfaced to the caller
    pub max_attempts: u32,
    /// First pause after a failure
    pub initial_delay: Duration,
    /// Pause ceiling
    pub max_delay: Duration,
    /// Pause multiplier per consecutive failure
    pub growth: f64,
}

impl BackoffPolicy {
    /// Schedule for the parent full node: patient enough to ride out a
    /// restart, capped so template polling recovers promptly afterwards
    pub fn parent_rpc() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(60),
            growth: 2.0,
        }
    }
}

/// Run `call` until it succeeds or the policy is exhausted; the final
/// error is returned as-is.
pub async fn with_backoff<F, Fut, T, E>(policy: &BackoffPolicy, mut call: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut pause = policy.initial_delay;
    let mut attempt = 1u32;
    loop {
        match call().await {
            Ok(value) => return Ok(value),
            Err(error) if attempt >= policy.max_attempts => return Err(error),
            Err(error) => {
                debug!(
                    attempt,
                    max_attempts = policy.max_attempts,
                    pause_ms = pause.as_millis() as u64,
                    %error,
                    "parent RPC attempt failed, backing off"
                );
                sleep(pause).await;
                pause = pause.mul_f64(policy.growth).min(policy.max_delay);
                attempt += 1;
            }
        }
    }
}
