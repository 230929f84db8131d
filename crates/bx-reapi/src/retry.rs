//! Exponential backoff for remote calls.
//!
//! Retries the codes remote execution backends document as transient,
//! with jittered exponential backoff. Auth failures are retried at most
//! once: the next call succeeds after a credential refresh or not at
//! all.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::RpcError;

const MAX_RETRIES: u32 = 10;
const MULTIPLIER: f64 = 2.0;
const BASE_DELAY: Duration = Duration::from_millis(200);
const MAX_DELAY: Duration = Duration::from_secs(10);
const BACKOFF_RANGE: f64 = 0.4;

/// Exponential backoff state for one logical call.
#[derive(Default)]
pub struct ExponentialBackoff {
    retries: u32,
    delay: Duration,
    auth_retried: bool,
}

impl ExponentialBackoff {
    pub fn new() -> Self {
        Self::default()
    }

    fn retriable(&mut self, err: &RpcError) -> bool {
        if err.is_retriable() {
            return true;
        }
        if err.is_auth_error() {
            // Allow one retry; the credential layer refreshes between
            // calls. More retries cannot help a genuine permission
            // problem.
            let retry = !self.auth_retried;
            self.auth_retried = true;
            return retry;
        }
        false
    }

    /// Next backoff delay for `err`, or `Err` when the call should not
    /// be retried any more.
    pub fn next(&mut self, err: RpcError) -> Result<Duration, RpcError> {
        if !self.retriable(&err) {
            return Err(err);
        }
        if self.retries >= MAX_RETRIES {
            return Err(RpcError::new(
                err.code,
                format!("too many retries ({}): {}", self.retries, err.message),
            ));
        }
        self.retries += 1;
        if self.delay.is_zero() {
            self.delay = BASE_DELAY;
        }
        let mut backoff = self.delay.as_secs_f64() * MULTIPLIER;
        backoff = backoff.min(MAX_DELAY.as_secs_f64());
        backoff -= backoff * BACKOFF_RANGE * jitter();
        self.delay = Duration::from_secs_f64(backoff).max(BASE_DELAY);
        Ok(self.delay)
    }
}

/// A uniform value in [0, 1), without pulling in an RNG dependency for
/// jitter alone.
fn jitter() -> f64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos() as u64;
    let mut x = nanos ^ (std::process::id() as u64).rotate_left(32) ^ 0x9e37_79b9_7f4a_7c15;
    x ^= x << 13;
    x ^= x >> 7;
    x ^= x << 17;
    (x % 1_000_000) as f64 / 1_000_000.0
}

/// Call `f`, retrying transient failures with exponential backoff until
/// success, a terminal error, retry exhaustion, or cancellation.
pub async fn call<T, F, Fut>(cancel: &CancellationToken, mut f: F) -> Result<T, RpcError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, RpcError>>,
{
    let mut backoff = ExponentialBackoff::new();
    loop {
        match f().await {
            Ok(v) => return Ok(v),
            Err(err) => {
                let delay = backoff.next(err)?;
                warn!(delay = ?delay, "retrying remote call");
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => {
                        return Err(RpcError::new(
                            crate::RpcCode::Canceled,
                            "canceled during retry backoff",
                        ));
                    }
                }
            }
        }
    }
}
