//! Completion waiting
//!
//! A wait observes the downstream run's state and settles it against the
//! configured allowed and failed sets. Two suspend strategies exist:
//! - Blocking: the caller's task polls until the run settles
//! - Deferred: the caller hands a serializable [`DeferredWait`] to the
//!   scheduling layer and returns; see [`deferred`]

pub mod deferred;

pub use deferred::{complete_deferred, DeferredWait, ResumptionKey, RunStateEvent, RunStateWatcher};

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::errors::{Result, TriggerError};
use crate::store::RunStore;
use crate::types::*;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SuspendStrategy {
    #[default]
    Blocking,
    Deferred,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaitPolicy {
    pub allowed_states: StateSet,
    pub failed_states: StateSet,
    pub poll_interval: Duration,
    pub timeout: Option<Duration>,
    pub strategy: SuspendStrategy,
}

impl Default for WaitPolicy {
    fn default() -> Self {
        Self {
            allowed_states: StateSet::new([RunState::Success]),
            failed_states: StateSet::new([RunState::Failed]),
            poll_interval: Duration::from_secs(60),
            timeout: None,
            strategy: SuspendStrategy::Blocking,
        }
    }
}

/// Result of checking one observed state against a policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Complete,
    Failed(RunState),
    /// Terminal, but in neither configured set.
    Unexpected(RunState),
    Pending,
}

impl WaitPolicy {
    pub fn validate(&self) -> Result<()> {
        if self.poll_interval.is_zero() {
            return Err(TriggerError::configuration(
                "poll_interval must be greater than zero",
            ));
        }
        if self.allowed_states.is_empty() {
            return Err(TriggerError::configuration(
                "allowed_states must name at least one state",
            ));
        }
        let overlap = self.allowed_states.intersection(&self.failed_states);
        if !overlap.is_empty() {
            return Err(TriggerError::configuration(format!(
                "States {} appear in both allowed_states and failed_states",
                overlap
            )));
        }

        check_range("poll_interval", self.poll_interval)?;
        if let Some(timeout) = self.timeout {
            check_range("timeout", timeout)?;
        }
        Ok(())
    }

    /// Failed states are checked before allowed states.
    pub fn evaluate(&self, state: RunState) -> Verdict {
        if self.failed_states.contains(state) {
            Verdict::Failed(state)
        } else if self.allowed_states.contains(state) {
            Verdict::Complete
        } else if state.is_terminal() {
            Verdict::Unexpected(state)
        } else {
            Verdict::Pending
        }
    }

    /// Map a settled verdict for `run` onto the controller's result type.
    /// `Pending` yields `Ok(None)`.
    pub(crate) fn settle(&self, run: RunRecord) -> Result<Option<RunRecord>> {
        match self.evaluate(run.state) {
            Verdict::Complete => Ok(Some(run)),
            Verdict::Pending => Ok(None),
            Verdict::Failed(state) => Err(TriggerError::DownstreamFailed {
                workflow_id: run.workflow_id,
                run_id: run.run_id,
                state,
            }),
            Verdict::Unexpected(state) => Err(TriggerError::UnexpectedTerminalState {
                workflow_id: run.workflow_id,
                run_id: run.run_id,
                state,
                allowed: self.allowed_states.clone(),
            }),
        }
    }
}

/// Durations must fit both the tokio clock and a wall-clock deadline.
fn check_range(field: &str, duration: Duration) -> Result<()> {
    let fits_clock = Instant::now().checked_add(duration).is_some();
    let fits_wall_clock = chrono::Duration::from_std(duration)
        .ok()
        .and_then(|d| chrono::Utc::now().checked_add_signed(d))
        .is_some();

    if fits_clock && fits_wall_clock {
        Ok(())
    } else {
        Err(TriggerError::configuration(format!(
            "{} {}s is out of range",
            field,
            duration.as_secs()
        )))
    }
}

/// Next wake-up: one poll interval from `now`, capped at the deadline.
pub(crate) fn next_wake(now: Instant, interval: Duration, deadline: Option<Instant>) -> Result<Instant> {
    let next = now.checked_add(interval).ok_or_else(|| {
        TriggerError::configuration(format!("poll_interval {}s is out of range", interval.as_secs()))
    })?;
    Ok(deadline.map_or(next, |deadline| deadline.min(next)))
}

/// Blocking waiter. Reads only; never mutates the observed run.
pub struct CompletionWaiter<S: RunStore> {
    store: Arc<S>,
    policy: WaitPolicy,
}

impl<S: RunStore> CompletionWaiter<S> {
    pub fn new(store: Arc<S>, policy: WaitPolicy) -> Self {
        Self { store, policy }
    }

    pub fn policy(&self) -> &WaitPolicy {
        &self.policy
    }

    /// Poll `identity` until it settles, the timeout passes, or `cancel` fires.
    pub async fn wait_blocking(
        &self,
        identity: &RunIdentity,
        cancel: &CancellationToken,
    ) -> Result<RunRecord> {
        let started = Instant::now();
        let deadline = match self.policy.timeout {
            Some(timeout) => Some(started.checked_add(timeout).ok_or_else(|| {
                TriggerError::configuration(format!("timeout {}s is out of range", timeout.as_secs()))
            })?),
            None => None,
        };

        info!(
            workflow_id = %identity.workflow_id,
            run_id = %identity.run_id,
            allowed = %self.policy.allowed_states,
            failed = %self.policy.failed_states,
            "Waiting on run"
        );

        loop {
            let run = self
                .store
                .get_run(&identity.workflow_id, &identity.run_id)
                .await?
                .ok_or_else(|| TriggerError::RunNotFound {
                    workflow_id: identity.workflow_id.clone(),
                    logical_timestamp: identity.logical_timestamp,
                })?;

            debug!(
                workflow_id = %run.workflow_id,
                run_id = %run.run_id,
                state = %run.state,
                "Observed run state"
            );

            if let Some(run) = self.policy.settle(run)? {
                info!(
                    workflow_id = %run.workflow_id,
                    run_id = %run.run_id,
                    state = %run.state,
                    "Run reached an allowed state"
                );
                return Ok(run);
            }

            let now = Instant::now();
            if deadline.is_some_and(|deadline| now >= deadline) {
                return Err(TriggerError::Timeout {
                    workflow_id: identity.workflow_id.clone(),
                    run_id: identity.run_id.clone(),
                    waited: now - started,
                });
            }
            let wake_at = next_wake(now, self.policy.poll_interval, deadline)?;

            tokio::select! {
                _ = cancel.cancelled() => {
                    info!(
                        workflow_id = %identity.workflow_id,
                        run_id = %identity.run_id,
                        "Wait cancelled"
                    );
                    return Err(TriggerError::Cancelled {
                        workflow_id: identity.workflow_id.clone(),
                        run_id: identity.run_id.clone(),
                    });
                }
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }
}
