//! Bounded-retry polling for readiness checks.
//!
//! Every retry loop in shardpilot goes through [`HealthPoller`]: a check is
//! invoked at a fixed interval until it succeeds, the attempt budget is
//! spent, or the wall-clock timeout elapses. Transient failures keep the
//! poll going; permanent failures abort immediately without waiting for the
//! timeout. The poller always sleeps between attempts and never after the
//! last one.

use crate::error::{PilotError, Result};
use std::future::Future;
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tracing::debug;

/// How a failed check should be treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Keep polling.
    Transient,
    /// Stop immediately; the condition cannot resolve on its own.
    Permanent,
}

/// Polling parameters.
#[derive(Debug, Clone)]
pub struct PollConfig {
    /// Fixed sleep between attempts.
    pub interval: Duration,
    /// Wall-clock budget for the whole poll.
    pub timeout: Duration,
    /// Maximum number of attempts. The poller makes exactly this many
    /// attempts against an always-failing check, never more.
    pub max_attempts: u32,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(2),
            timeout: Duration::from_secs(60),
            max_attempts: 30,
        }
    }
}

impl PollConfig {
    pub fn new(interval: Duration, timeout: Duration, max_attempts: u32) -> Self {
        Self {
            interval,
            timeout,
            max_attempts,
        }
    }

    /// Attempt-bounded config with an effectively unlimited wall clock.
    pub fn attempts(max_attempts: u32, interval: Duration) -> Self {
        Self {
            interval,
            timeout: Duration::from_secs(24 * 60 * 60),
            max_attempts,
        }
    }

    /// Timeout-bounded config with an effectively unlimited attempt budget.
    pub fn deadline(timeout: Duration, interval: Duration) -> Self {
        Self {
            interval,
            timeout,
            max_attempts: u32::MAX,
        }
    }
}

/// Outcome of a poll.
#[derive(Debug)]
pub enum PollOutcome<T> {
    /// The check succeeded.
    Success {
        value: T,
        attempts: u32,
        elapsed: Duration,
    },
    /// The attempt budget or wall clock ran out on transient failures.
    TimedOut {
        attempts: u32,
        elapsed: Duration,
        last_error: Option<PilotError>,
    },
    /// A permanent failure aborted the poll before the budget was spent.
    Aborted { error: PilotError, attempts: u32 },
}

impl<T> PollOutcome<T> {
    /// Convert into a `Result`, mapping timeouts to [`PilotError::Timeout`].
    pub fn into_result(self) -> Result<T> {
        match self {
            PollOutcome::Success { value, .. } => Ok(value),
            PollOutcome::TimedOut {
                elapsed,
                last_error,
                ..
            } => Err(last_error.unwrap_or(PilotError::Timeout(elapsed.as_millis() as u64))),
            PollOutcome::Aborted { error, .. } => Err(error),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, PollOutcome::Success { .. })
    }
}

/// Fixed-interval, bounded poller.
#[derive(Debug, Clone)]
pub struct HealthPoller {
    config: PollConfig,
}

impl HealthPoller {
    pub fn new(config: PollConfig) -> Self {
        Self { config }
    }

    /// Poll with the default classification: [`PilotError::is_transient`].
    pub async fn poll<T, F, Fut>(&self, check: F) -> PollOutcome<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.poll_with(check, |e: &PilotError| {
            if e.is_transient() {
                FailureClass::Transient
            } else {
                FailureClass::Permanent
            }
        })
        .await
    }

    /// Poll with an explicit failure-classification callback.
    pub async fn poll_with<T, F, Fut, C>(&self, mut check: F, classify: C) -> PollOutcome<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
        C: Fn(&PilotError) -> FailureClass,
    {
        let start = Instant::now();
        let mut attempts = 0u32;

        loop {
            attempts += 1;

            let error = match check().await {
                Ok(value) => {
                    return PollOutcome::Success {
                        value,
                        attempts,
                        elapsed: start.elapsed(),
                    };
                }
                Err(e) => {
                    if classify(&e) == FailureClass::Permanent {
                        debug!(attempts, error = %e, "Poll aborted on permanent failure");
                        return PollOutcome::Aborted { error: e, attempts };
                    }

                    debug!(
                        attempts,
                        max_attempts = self.config.max_attempts,
                        error = %e,
                        "Poll attempt failed"
                    );
                    e
                }
            };

            let elapsed = start.elapsed();
            if attempts >= self.config.max_attempts
                || elapsed + self.config.interval > self.config.timeout
            {
                return PollOutcome::TimedOut {
                    attempts,
                    elapsed,
                    last_error: Some(error),
                };
            }

            sleep(self.config.interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast(max_attempts: u32) -> HealthPoller {
        HealthPoller::new(PollConfig::new(
            Duration::from_millis(1),
            Duration::from_secs(60),
            max_attempts,
        ))
    }

    #[tokio::test]
    async fn test_immediate_success() {
        let outcome = fast(5).poll(|| async { Ok(42u32) }).await;
        match outcome {
            PollOutcome::Success { value, attempts, .. } => {
                assert_eq!(value, 42);
                assert_eq!(attempts, 1);
            }
            other => panic!("expected success, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_exactly_n_attempts_on_transient_failure() {
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = Arc::clone(&counter);

        let outcome: PollOutcome<()> = fast(4)
            .poll(move || {
                let counter = Arc::clone(&counter_clone);
                async move {
                    counter.fetch_add(1, Ordering::Relaxed);
                    Err(PilotError::NotReady("still starting".into()))
                }
            })
            .await;

        assert_eq!(counter.load(Ordering::Relaxed), 4);
        match outcome {
            PollOutcome::TimedOut { attempts, last_error, .. } => {
                assert_eq!(attempts, 4);
                assert!(matches!(last_error, Some(PilotError::NotReady(_))));
            }
            other => panic!("expected timeout, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_eventual_success() {
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = Arc::clone(&counter);

        let outcome = fast(5)
            .poll(move || {
                let counter = Arc::clone(&counter_clone);
                async move {
                    if counter.fetch_add(1, Ordering::Relaxed) < 2 {
                        Err(PilotError::ConnectionRefused("db".into()))
                    } else {
                        Ok("up")
                    }
                }
            })
            .await;

        match outcome {
            PollOutcome::Success { attempts, .. } => assert_eq!(attempts, 3),
            other => panic!("expected success, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_permanent_failure_aborts_without_retry() {
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = Arc::clone(&counter);

        let outcome: PollOutcome<()> = fast(10)
            .poll(move || {
                let counter = Arc::clone(&counter_clone);
                async move {
                    counter.fetch_add(1, Ordering::Relaxed);
                    Err(PilotError::InvalidHostname("h$st".into()))
                }
            })
            .await;

        assert_eq!(counter.load(Ordering::Relaxed), 1);
        assert!(matches!(
            outcome,
            PollOutcome::Aborted {
                error: PilotError::InvalidHostname(_),
                attempts: 1
            }
        ));
    }

    #[tokio::test]
    async fn test_wall_clock_timeout() {
        let poller = HealthPoller::new(PollConfig::new(
            Duration::from_millis(20),
            Duration::from_millis(50),
            u32::MAX,
        ));

        let outcome: PollOutcome<()> = poller
            .poll(|| async { Err(PilotError::NotReady("never".into())) })
            .await;

        match outcome {
            PollOutcome::TimedOut { attempts, .. } => {
                // 20ms interval inside a 50ms budget allows only a few attempts.
                assert!(attempts < 5);
            }
            other => panic!("expected timeout, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_into_result() {
        let ok = fast(1).poll(|| async { Ok(7u8) }).await.into_result();
        assert_eq!(ok.unwrap(), 7);

        let err: Result<()> = fast(1)
            .poll(|| async { Err(PilotError::NotReady("x".into())) })
            .await
            .into_result();
        assert!(matches!(err, Err(PilotError::NotReady(_))));
    }
}
