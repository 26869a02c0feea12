//! Bounded retry with exponential backoff.
//!
//! Every wait in the crate goes through [`Backoff`]: ledger lookups that lag
//! behind a create, policy version propagation, and function update waiters.
//! [`retry_until`] wraps it for probes that can be expressed as a closure.

use std::future::Future;
use std::time::Duration;

use serde::Deserialize;
use tracing::debug;

use crate::error::{DeployError, DeployResult};

/// Retry budget and backoff schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct RetryPolicy {
    /// Total number of probes before giving up.
    #[serde(default = "default_attempts")]
    pub attempts: u32,

    /// Delay before the second probe, in milliseconds.
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,

    /// Ceiling for the doubling delay, in milliseconds.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

const fn default_attempts() -> u32 {
    10
}

const fn default_initial_delay_ms() -> u64 {
    250
}

const fn default_max_delay_ms() -> u64 {
    5_000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: default_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl RetryPolicy {
    /// Create a policy from explicit values.
    #[must_use]
    pub fn new(attempts: u32, initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            attempts,
            initial_delay_ms: u64::try_from(initial_delay.as_millis()).unwrap_or(u64::MAX),
            max_delay_ms: u64::try_from(max_delay.as_millis()).unwrap_or(u64::MAX),
        }
    }

    /// Delay to sleep after the given zero-based failed attempt.
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let initial = Duration::from_millis(self.initial_delay_ms);
        let max = Duration::from_millis(self.max_delay_ms);
        let multiplier = 2u32.saturating_pow(attempt);
        initial.saturating_mul(multiplier).min(max)
    }

    /// Start a fresh backoff sequence.
    #[must_use]
    pub fn backoff(&self, waiting_for: impl Into<String>) -> Backoff {
        Backoff {
            policy: *self,
            probes: 0,
            waiting_for: waiting_for.into(),
        }
    }
}

/// Outcome of a single probe.
#[derive(Debug)]
pub enum Probe<T> {
    /// The condition holds.
    Ready(T),
    /// Not yet; carries a description of what was observed.
    Pending(String),
}

/// One in-flight backoff sequence.
#[derive(Debug)]
pub struct Backoff {
    policy: RetryPolicy,
    probes: u32,
    waiting_for: String,
}

impl Backoff {
    /// Record a failed probe and sleep before the next one.
    ///
    /// Fails with [`DeployError::WaitExhausted`] once the budget is spent.
    pub async fn pause(&mut self, last_observed: impl Into<String>) -> DeployResult<()> {
        self.probes += 1;
        if self.probes >= self.policy.attempts {
            return Err(DeployError::WaitExhausted {
                waiting_for: self.waiting_for.clone(),
                attempts: self.probes,
                last_observed: last_observed.into(),
            });
        }

        let delay = self.policy.delay(self.probes - 1);
        debug!(
            attempt = self.probes,
            delay_ms = delay.as_millis(),
            "Waiting for {}",
            self.waiting_for
        );
        tokio::time::sleep(delay).await;
        Ok(())
    }

    /// Number of failed probes so far.
    #[must_use]
    pub const fn probes(&self) -> u32 {
        self.probes
    }
}

/// Probe until the condition holds or the budget is exhausted.
pub async fn retry_until<T, F, Fut>(
    policy: &RetryPolicy,
    waiting_for: &str,
    mut probe: F,
) -> DeployResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = DeployResult<Probe<T>>>,
{
    let mut backoff = policy.backoff(waiting_for);
    loop {
        match probe().await? {
            Probe::Ready(value) => return Ok(value),
            Probe::Pending(observed) => backoff.pause(observed).await?,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;

    #[test]
    fn delay_doubles_up_to_ceiling() {
        let policy = RetryPolicy::new(5, Duration::from_millis(100), Duration::from_millis(350));
        assert_eq!(policy.delay(0), Duration::from_millis(100));
        assert_eq!(policy.delay(1), Duration::from_millis(200));
        assert_eq!(policy.delay(2), Duration::from_millis(350));
        assert_eq!(policy.delay(40), Duration::from_millis(350));
    }

    #[tokio::test(start_paused = true)]
    async fn retry_until_returns_once_ready() {
        let calls = Cell::new(0);
        let policy = RetryPolicy::default();

        let value = retry_until(&policy, "the answer", || {
            calls.set(calls.get() + 1);
            let n = calls.get();
            async move {
                if n < 3 {
                    Ok(Probe::Pending(format!("probe {n}")))
                } else {
                    Ok(Probe::Ready(42))
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(value, 42);
        assert_eq!(calls.get(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_budget_reports_last_observation() {
        let policy = RetryPolicy::new(3, Duration::from_millis(10), Duration::from_millis(20));

        let err = retry_until::<(), _, _>(&policy, "nothing", || async {
            Ok(Probe::Pending("InProgress".to_owned()))
        })
        .await
        .unwrap_err();

        match err {
            DeployError::WaitExhausted {
                attempts,
                last_observed,
                ..
            } => {
                assert_eq!(attempts, 3);
                assert_eq!(last_observed, "InProgress");
            }
            other => panic!("expected WaitExhausted, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn probe_errors_abort_immediately() {
        let policy = RetryPolicy::default();
        let err = retry_until::<(), _, _>(&policy, "boom", || async {
            Err(DeployError::configuration("broken"))
        })
        .await
        .unwrap_err();
        assert!(matches!(err, DeployError::Configuration(_)));
    }
}
