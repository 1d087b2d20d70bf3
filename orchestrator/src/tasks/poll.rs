//! Bounded polling for state that is only observable by re-reading it

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tracing::trace;

/// Result of one probe
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome<T> {
    /// Condition met, stop polling
    Ready(T),
    /// Not yet, try again after the interval
    Pending,
    /// Terminal failure, stop polling
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PollError {
    #[error("{0}")]
    Failed(String),

    #[error("condition not met after {attempts} attempts")]
    Exhausted { attempts: u32 },
}

/// Fixed-interval retry with an attempt ceiling
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub interval: Duration,
    pub max_attempts: u32,
}

impl PollPolicy {
    pub fn new(interval: Duration, max_attempts: u32) -> Self {
        Self {
            interval,
            max_attempts,
        }
    }

    /// Total time the policy may wait before giving up
    pub fn ceiling(&self) -> Duration {
        self.interval * self.max_attempts
    }

    /// Sleep one interval, then probe; repeat until the probe is ready,
    /// fails, or the attempt ceiling is reached
    ///
    /// The probe receives the 1-based attempt number.
    pub async fn poll_until<T, F, Fut>(&self, mut probe: F) -> Result<T, PollError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = PollOutcome<T>>,
    {
        for attempt in 1..=self.max_attempts {
            tokio::time::sleep(self.interval).await;

            match probe(attempt).await {
                PollOutcome::Ready(value) => return Ok(value),
                PollOutcome::Failed(message) => return Err(PollError::Failed(message)),
                PollOutcome::Pending => {
                    trace!(attempt, max_attempts = self.max_attempts, "Condition pending");
                }
            }
        }

        Err(PollError::Exhausted {
            attempts: self.max_attempts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy(max_attempts: u32) -> PollPolicy {
        PollPolicy::new(Duration::from_millis(1), max_attempts)
    }

    #[tokio::test]
    async fn test_ready_on_third_attempt() {
        let calls = AtomicU32::new(0);
        let value = policy(5)
            .poll_until(|attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt == 3 {
                        PollOutcome::Ready("done")
                    } else {
                        PollOutcome::Pending
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(value, "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_failure_stops_immediately() {
        let calls = AtomicU32::new(0);
        let err = policy(5)
            .poll_until(|_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { PollOutcome::<()>::Failed("boom".to_string()) }
            })
            .await
            .unwrap_err();

        assert_eq!(err, PollError::Failed("boom".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_exhaustion() {
        let err = policy(4)
            .poll_until(|_| async { PollOutcome::<()>::Pending })
            .await
            .unwrap_err();
        assert_eq!(err, PollError::Exhausted { attempts: 4 });
    }

    #[test]
    fn test_ceiling() {
        let policy = PollPolicy::new(Duration::from_secs(2), 15);
        assert_eq!(policy.ceiling(), Duration::from_secs(30));
    }
}
