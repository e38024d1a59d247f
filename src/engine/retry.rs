//! Bounded exponential backoff.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::config::AgentSection;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl From<&AgentSection> for RetryPolicy {
    fn from(section: &AgentSection) -> Self {
        Self {
            max_attempts: section.max_attempts.max(1),
            base_delay: Duration::from_millis(section.base_delay_ms),
            max_delay: Duration::from_millis(section.max_delay_ms),
        }
    }
}

impl RetryPolicy {
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn with_delays(mut self, base: Duration, max: Duration) -> Self {
        self.base_delay = base;
        self.max_delay = max;
        self
    }

    /// Delay after the given (1-based) failed attempt: `base * 2^(n-1)`, capped.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(1u32 << exp)
            .min(self.max_delay)
    }
}

/// Sleep for `delay` unless `cancel` fires first. Returns `false` on cancellation.
pub async fn backoff(delay: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

/// Outcome of a retried call.
#[derive(Debug)]
pub enum Retried<T, E> {
    Ok { value: T, attempts: u32 },
    Failed { error: E, attempts: u32 },
    Cancelled { attempts: u32 },
}

/// Call `op` until it succeeds, fails permanently, exhausts `policy`, or
/// `cancel` fires. Cancellation is checked between attempts only.
pub async fn with_retry<T, E, F, Fut, R>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    is_transient: R,
    mut op: F,
) -> Retried<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    R: Fn(&E) -> bool,
{
    let mut attempt = 0;
    loop {
        if cancel.is_cancelled() {
            return Retried::Cancelled { attempts: attempt };
        }
        attempt += 1;
        match op(attempt).await {
            Ok(value) => {
                return Retried::Ok {
                    value,
                    attempts: attempt,
                };
            }
            Err(error) if is_transient(&error) && attempt < policy.max_attempts => {
                if !backoff(policy.delay_after(attempt), cancel).await {
                    return Retried::Cancelled { attempts: attempt };
                }
            }
            Err(error) => {
                return Retried::Failed {
                    error,
                    attempts: attempt,
                };
            }
        }
    }
}
