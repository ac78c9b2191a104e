//! Generic bounded wait for eventually-consistent external state
//!
//! Every phase that waits on an external system (node capacity, workload
//! replicas, load-balancer addresses, network-interface release) goes through
//! [`wait_for`] or [`wait_for_value`]. The poller reports what happened and
//! never decides severity: a timeout is fatal for cluster capacity, a warning
//! for workload readiness, and best-effort for teardown ordering.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::{Error, Result};

/// What is being waited for, how often to check, and for how long.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WaitCondition {
    description: String,
    interval: Duration,
    timeout: Duration,
}

impl WaitCondition {
    /// Create a wait condition.
    ///
    /// The interval must be non-zero and the timeout must exceed one interval.
    pub fn new(
        description: impl Into<String>,
        interval: Duration,
        timeout: Duration,
    ) -> Result<Self> {
        let description = description.into();
        if interval.is_zero() {
            return Err(Error::configuration(format!(
                "poll interval for '{}' must be non-zero",
                description
            )));
        }
        if timeout <= interval {
            return Err(Error::configuration(format!(
                "timeout for '{}' ({:?}) must exceed its poll interval ({:?})",
                description, timeout, interval
            )));
        }
        Ok(Self {
            description,
            interval,
            timeout,
        })
    }

    /// Human-readable description of the awaited condition
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Time between evaluations
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Maximum time to wait
    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

/// How a wait resolved. Exactly one of these per wait.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitOutcome<T = ()> {
    /// The predicate held; carries the value it produced
    Satisfied(T),
    /// The timeout elapsed without the predicate holding
    TimedOut,
    /// The cancellation token fired
    Cancelled,
}

impl<T> WaitOutcome<T> {
    /// Whether the condition was met
    pub fn is_satisfied(&self) -> bool {
        matches!(self, WaitOutcome::Satisfied(_))
    }
}

/// Wait until `predicate` returns `Ok(true)`.
///
/// Errors from the predicate count as "not yet" and are logged at debug level.
pub async fn wait_for<F, Fut, E>(
    condition: &WaitCondition,
    cancel: &CancellationToken,
    mut predicate: F,
) -> WaitOutcome
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<bool, E>>,
    E: Display,
{
    wait_for_value(condition, cancel, || {
        let check = predicate();
        async move { check.await.map(|done| done.then_some(())) }
    })
    .await
}

/// Wait until `check` returns `Ok(Some(value))` and hand back the value.
///
/// The check runs immediately and then once per interval. The last sleep is
/// shortened so that a check which never succeeds is evaluated one final time
/// at the deadline and then reports [`WaitOutcome::TimedOut`]. Cancellation
/// interrupts both sleeps and in-flight checks.
pub async fn wait_for_value<T, F, Fut, E>(
    condition: &WaitCondition,
    cancel: &CancellationToken,
    mut check: F,
) -> WaitOutcome<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<Option<T>, E>>,
    E: Display,
{
    let start = Instant::now();
    let deadline = start + condition.timeout;
    let mut attempts = 0u32;

    loop {
        if cancel.is_cancelled() {
            debug!(condition = %condition.description, attempts, "Wait cancelled");
            return WaitOutcome::Cancelled;
        }

        attempts += 1;
        let result = tokio::select! {
            result = check() => result,
            _ = cancel.cancelled() => {
                debug!(condition = %condition.description, attempts, "Wait cancelled during check");
                return WaitOutcome::Cancelled;
            }
        };

        match result {
            Ok(Some(value)) => {
                debug!(
                    condition = %condition.description,
                    attempts,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "Condition satisfied"
                );
                return WaitOutcome::Satisfied(value);
            }
            Ok(None) => trace!(
                condition = %condition.description,
                attempts,
                "Condition not met yet"
            ),
            Err(e) => debug!(
                condition = %condition.description,
                attempts,
                error = %e,
                "Check failed, treating as not yet satisfied"
            ),
        }

        let now = Instant::now();
        if now >= deadline {
            debug!(condition = %condition.description, attempts, "Wait timed out");
            return WaitOutcome::TimedOut;
        }

        let pause = condition.interval.min(deadline - now);
        tokio::select! {
            _ = tokio::time::sleep(pause) => {}
            _ = cancel.cancelled() => {
                debug!(condition = %condition.description, attempts, "Wait cancelled during sleep");
                return WaitOutcome::Cancelled;
            }
        }
    }
}
