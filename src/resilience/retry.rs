use crate::error::{ErrorKind, Result, StoreError};
use std::future::Future;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

/// Backoff policy between attempts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RetryPolicy {
    /// Retry with no delay
    Immediate,
    /// Constant delay between attempts
    Fixed(Duration),
    /// Delay grows by `base` each attempt
    Linear(Duration),
    /// Delay multiplies by `factor` each attempt, capped at `max`
    Exponential {
        base: Duration,
        factor: f64,
        max: Duration,
    },
}

impl RetryPolicy {
    fn delay_for(&self, attempt: u32) -> Duration {
        match self {
            RetryPolicy::Immediate => Duration::ZERO,
            RetryPolicy::Fixed(d) => *d,
            RetryPolicy::Linear(base) => base.saturating_mul(attempt),
            RetryPolicy::Exponential { base, factor, max } => {
                let scaled = base.as_millis() as f64 * factor.powi(attempt.saturating_sub(1) as i32);
                Duration::from_millis(scaled.round() as u64).min(*max)
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub policy: RetryPolicy,
    pub max_attempts: u32,
    /// Randomize each delay by up to ±25% to avoid thundering herds
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            policy: RetryPolicy::Exponential {
                base: Duration::from_millis(50),
                factor: 2.0,
                max: Duration::from_secs(5),
            },
            max_attempts: 3,
            jitter: true,
        }
    }
}

impl RetryConfig {
    pub fn fixed(delay: Duration, max_attempts: u32) -> Self {
        Self {
            policy: RetryPolicy::Fixed(delay),
            max_attempts,
            jitter: false,
        }
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        let delay = self.policy.delay_for(attempt);
        if self.jitter && !delay.is_zero() {
            apply_jitter(delay)
        } else {
            delay
        }
    }
}

// xorshift over a clock seed; good enough for backoff spreading and keeps
// the dependency set unchanged.
fn apply_jitter(delay: Duration) -> Duration {
    let mut seed = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos() as u64 | 1)
        .unwrap_or(1);
    seed ^= seed << 13;
    seed ^= seed >> 7;
    seed ^= seed << 17;
    let ms = delay.as_millis() as i64;
    let spread = ms / 4;
    let offset = if spread > 0 {
        (seed % (2 * spread as u64 + 1)) as i64 - spread
    } else {
        0
    };
    Duration::from_millis((ms + offset).max(0) as u64)
}

/// Validation, constraint, and migration failures never retry regardless of
/// message contents.
fn should_retry(err: &StoreError) -> bool {
    match err.kind() {
        ErrorKind::ConstraintViolation | ErrorKind::Configuration | ErrorKind::MigrationFailed => {
            false
        }
        _ => err.is_retryable(),
    }
}

/// Cooperative retry loop; sleeps with the tokio timer between attempts.
pub async fn retry_async<F, Fut, T>(config: &RetryConfig, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if attempt < config.max_attempts && should_retry(&err) => {
                let delay = config.delay_for(attempt);
                debug!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "retrying after transient failure"
                );
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
            }
            Err(err) => {
                if attempt > 1 {
                    warn!(attempts = attempt, error = %err, "giving up after retries");
                }
                return Err(err);
            }
        }
    }
}

/// Blocking retry loop for use inside a transaction callback, where async
/// suspension is not permitted on the active handle. Waits are a bounded
/// busy-wait in small sleep slices.
pub fn retry_blocking<F, T>(config: &RetryConfig, mut op: F) -> Result<T>
where
    F: FnMut() -> Result<T>,
{
    const SLICE: Duration = Duration::from_millis(5);
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op() {
            Ok(value) => return Ok(value),
            Err(err) if attempt < config.max_attempts && should_retry(&err) => {
                let mut remaining = config.delay_for(attempt);
                debug!(
                    attempt,
                    delay_ms = remaining.as_millis() as u64,
                    error = %err,
                    "retrying (blocking) after transient failure"
                );
                while !remaining.is_zero() {
                    let step = remaining.min(SLICE);
                    std::thread::sleep(step);
                    remaining = remaining.saturating_sub(step);
                }
            }
            Err(err) => return Err(err),
        }
    }
}
