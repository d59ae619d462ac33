//! Polling waiter for eventually-consistent daemon state.
//!
//! Every long-running step funnels through [`Waiter::wait_for`], which polls
//! a refresh function until it reports one of the target state labels, the
//! deadline passes, or the shared cancellation token fires.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Wall-clock limit for each convergence wait.
pub const CONVERGENCE_TIMEOUT: Duration = Duration::from_secs(180);
/// Minimum pause between two polls in production.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_secs(3);

const BACKOFF_START: Duration = Duration::from_millis(100);
const BACKOFF_CAP: Duration = Duration::from_secs(10);

/// Timing parameters for one wait.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct WaitPolicy {
    /// Overall deadline measured from the start of the wait.
    pub timeout: Duration,
    /// Pause before the first poll.
    pub initial_delay: Duration,
    /// Lower bound on the pause between polls.
    pub min_interval: Duration,
}

impl WaitPolicy {
    /// Policy used for start, stop, network and file-readiness waits.
    #[must_use]
    pub const fn convergence(refresh_interval: Duration) -> Self {
        Self {
            timeout: CONVERGENCE_TIMEOUT,
            initial_delay: refresh_interval,
            min_interval: MIN_POLL_INTERVAL,
        }
    }
}

/// Outcome of a wait that did not reach a target state.
#[derive(Debug, Error)]
pub enum WaitError<E> {
    /// The deadline passed before a target state was observed.
    #[error(
        "timed out after {}s waiting for {action} (wanted {}, last state '{last_state}')",
        elapsed.as_secs(),
        targets.join("|")
    )]
    Timeout {
        /// What was being waited on.
        action: String,
        /// Acceptable state labels.
        targets: Vec<String>,
        /// Last label reported by the refresh function.
        last_state: String,
        /// Time spent waiting.
        elapsed: Duration,
    },
    /// The refresh function failed.
    #[error("{0}")]
    Fatal(E),
    /// The host cancelled the operation.
    #[error("wait for {action} cancelled")]
    Cancelled {
        /// What was being waited on.
        action: String,
    },
}

/// Polls until a target state is reached.
#[derive(Clone, Debug)]
pub struct Waiter {
    policy: WaitPolicy,
    cancel: CancellationToken,
}

impl Waiter {
    /// Creates a waiter bound to the host's cancellation token.
    #[must_use]
    pub const fn new(policy: WaitPolicy, cancel: CancellationToken) -> Self {
        Self { policy, cancel }
    }

    /// Returns the policy in effect.
    #[must_use]
    pub const fn policy(&self) -> WaitPolicy {
        self.policy
    }

    /// Polls `refresh` until it reports a label contained in `targets`.
    ///
    /// `refresh` returns an observation and its state label; an error from
    /// it ends the wait immediately.
    ///
    /// # Errors
    ///
    /// Returns [`WaitError::Fatal`] when `refresh` fails,
    /// [`WaitError::Timeout`] when the deadline passes and
    /// [`WaitError::Cancelled`] when the cancellation token fires.
    pub async fn wait_for<T, E, F, Fut>(
        &self,
        action: &str,
        targets: &[&str],
        mut refresh: F,
    ) -> Result<T, WaitError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<(T, String), E>>,
    {
        let started = Instant::now();
        let deadline = started + self.policy.timeout;
        self.pause(action, self.policy.initial_delay).await?;

        let mut interval = BACKOFF_START.max(self.policy.min_interval);
        loop {
            if self.cancel.is_cancelled() {
                return Err(self.cancelled(action));
            }
            let (observation, state) = refresh().await.map_err(WaitError::Fatal)?;
            debug!(action, state = %state, "polled state");
            if targets.contains(&state.as_str()) {
                return Ok(observation);
            }

            let now = Instant::now();
            if now >= deadline {
                let elapsed = now.duration_since(started);
                warn!(action, last_state = %state, elapsed_secs = elapsed.as_secs(), "wait timed out");
                return Err(WaitError::Timeout {
                    action: action.to_owned(),
                    targets: targets.iter().map(|target| (*target).to_owned()).collect(),
                    last_state: state,
                    elapsed,
                });
            }

            self.pause(action, interval.min(deadline - now)).await?;
            interval = (interval * 2).min(BACKOFF_CAP).max(self.policy.min_interval);
        }
    }

    async fn pause<E>(&self, action: &str, duration: Duration) -> Result<(), WaitError<E>> {
        if duration.is_zero() {
            return Ok(());
        }
        tokio::select! {
            () = self.cancel.cancelled() => Err(self.cancelled(action)),
            () = sleep(duration) => Ok(()),
        }
    }

    fn cancelled<E>(&self, action: &str) -> WaitError<E> {
        debug!(action, cancelled = self.cancel.is_cancelled(), "wait aborted");
        WaitError::Cancelled {
            action: action.to_owned(),
        }
    }
}
