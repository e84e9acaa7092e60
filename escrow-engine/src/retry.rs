//! Retry policy and pluggable sleeping
//!
//! Delays grow geometrically: round `i` (0-based) waits `delay * backoff^i`.
//! The sleep itself goes through [`Sleeper`] so tests observe the schedule
//! without waiting it out.

use std::{
    fmt,
    future::Future,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Exponential backoff parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Extra rounds after the first
    pub retries: u32,
    pub delay: Duration,
    pub backoff: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 0,
            delay: Duration::from_secs(5),
            backoff: 2.0,
        }
    }
}

impl RetryPolicy {
    pub fn new(retries: u32, delay: Duration, backoff: f64) -> Self {
        Self {
            retries,
            delay,
            backoff,
        }
    }

    /// Policy that never retries
    pub fn none() -> Self {
        Self {
            retries: 0,
            ..Self::default()
        }
    }

    /// Wait before retry round `round + 1`
    pub fn delay_for(&self, round: u32) -> Duration {
        let factor = self.backoff.powi(round.min(i32::MAX as u32) as i32);
        Duration::try_from_secs_f64(self.delay.as_secs_f64() * factor).unwrap_or(Duration::MAX)
    }

    /// Full schedule of waits for an operation that never succeeds
    pub fn schedule(&self) -> Vec<Duration> {
        (0..self.retries).map(|round| self.delay_for(round)).collect()
    }
}

/// Something that can wait
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

/// Sleeps on the tokio timer
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Records requested sleeps and returns immediately
#[derive(Debug, Clone, Default)]
pub struct RecordingSleeper {
    slept: Arc<Mutex<Vec<Duration>>>,
}

impl RecordingSleeper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn recorded(&self) -> Vec<Duration> {
        self.slept
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl Sleeper for RecordingSleeper {
    async fn sleep(&self, duration: Duration) {
        self.slept
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(duration);
    }
}

/// Run `op` until it succeeds or the policy's retries run out
pub async fn with_backoff<T, E, F, Fut>(
    policy: &RetryPolicy,
    sleeper: &dyn Sleeper,
    label: &str,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: fmt::Display,
{
    let mut round = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if round < policy.retries => {
                let delay = policy.delay_for(round);
                warn!(
                    "(x{}) {} failed: {}. Retrying in {:?}",
                    round + 1,
                    label,
                    e,
                    delay
                );
                sleeper.sleep(delay).await;
                round += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_delay_schedule() {
        let policy = RetryPolicy::new(4, Duration::from_millis(100), 2.0);
        assert_eq!(
            policy.schedule(),
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(400),
                Duration::from_millis(800),
            ]
        );
        assert!(RetryPolicy::none().schedule().is_empty());
    }

    #[test]
    fn test_huge_delay_saturates() {
        let policy = RetryPolicy::new(1, Duration::from_secs(u64::MAX / 2), 1e300);
        assert_eq!(policy.delay_for(3), Duration::MAX);
    }

    #[tokio::test]
    async fn test_with_backoff_recovers() {
        let sleeper = RecordingSleeper::new();
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(3, Duration::from_secs(1), 3.0);

        let result: Result<u32, String> = with_backoff(&policy, &sleeper, "flaky", || async {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            if n < 2 {
                Err(format!("failure {}", n))
            } else {
                Ok(n)
            }
        })
        .await;

        assert_eq!(result, Ok(2));
        assert_eq!(
            sleeper.recorded(),
            vec![Duration::from_secs(1), Duration::from_secs(3)]
        );
    }

    #[tokio::test]
    async fn test_with_backoff_gives_up() {
        let sleeper = RecordingSleeper::new();
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(2, Duration::from_secs(1), 2.0);

        let result: Result<(), &str> = with_backoff(&policy, &sleeper, "broken", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err("down")
        })
        .await;

        assert_eq!(result, Err("down"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(sleeper.recorded().len(), 2);
    }
}
