//! Deferred waits
//!
//! A deferred wait carries everything needed to resume: the resumption key
//! and the state sets. The scheduling layer watches the run with a
//! [`RunStateWatcher`] and, once the run settles, hands the resulting
//! [`RunStateEvent`] to [`complete_deferred`]. The resuming process need not
//! be the one that started the wait.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{next_wake, Verdict, WaitPolicy};
use crate::errors::{Result, TriggerError};
use crate::store::RunStore;
use crate::types::*;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResumptionKey {
    pub workflow_id: String,
    pub run_id: String,
    pub logical_timestamp: DateTime<Utc>,
}

impl From<&RunIdentity> for ResumptionKey {
    fn from(identity: &RunIdentity) -> Self {
        Self {
            workflow_id: identity.workflow_id.clone(),
            run_id: identity.run_id.clone(),
            logical_timestamp: identity.logical_timestamp,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeferredWait {
    pub key: ResumptionKey,
    pub allowed_states: StateSet,
    pub failed_states: StateSet,
    pub poll_interval: Duration,
    /// Wall-clock deadline, when the policy carries a timeout.
    pub deadline: Option<DateTime<Utc>>,
}

impl DeferredWait {
    pub fn new(identity: &RunIdentity, policy: &WaitPolicy, now: DateTime<Utc>) -> Result<Self> {
        let deadline = match policy.timeout {
            Some(timeout) => Some(
                chrono::Duration::from_std(timeout)
                    .ok()
                    .and_then(|d| now.checked_add_signed(d))
                    .ok_or_else(|| {
                        TriggerError::configuration(format!("timeout {}s is out of range", timeout.as_secs()))
                    })?,
            ),
            None => None,
        };

        Ok(Self {
            key: ResumptionKey::from(identity),
            allowed_states: policy.allowed_states.clone(),
            failed_states: policy.failed_states.clone(),
            poll_interval: policy.poll_interval,
            deadline,
        })
    }

    pub fn policy(&self) -> WaitPolicy {
        WaitPolicy {
            allowed_states: self.allowed_states.clone(),
            failed_states: self.failed_states.clone(),
            poll_interval: self.poll_interval,
            timeout: None,
            strategy: super::SuspendStrategy::Deferred,
        }
    }

    /// Whether the run has settled as far as the watcher is concerned.
    fn is_settled(&self, state: RunState) -> bool {
        self.allowed_states.contains(state) || self.failed_states.contains(state) || state.is_terminal()
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.deadline.is_some_and(|deadline| now >= deadline)
    }

    pub fn timeout_error(&self, waited: Duration) -> TriggerError {
        TriggerError::Timeout {
            workflow_id: self.key.workflow_id.clone(),
            run_id: self.key.run_id.clone(),
            waited,
        }
    }
}

/// Payload emitted by the watcher once the watched runs settle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunStateEvent {
    pub workflow_id: String,
    pub logical_timestamps: Vec<DateTime<Utc>>,
    pub states: Vec<RunState>,
    pub poll_interval: Duration,
}

pub struct RunStateWatcher<S: RunStore> {
    store: Arc<S>,
}

impl<S: RunStore> RunStateWatcher<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Single observation. `None` while the run is still in flight.
    pub async fn observe(&self, wait: &DeferredWait) -> Result<Option<RunStateEvent>> {
        let run = self
            .store
            .get_run_by_logical_timestamp(&wait.key.workflow_id, wait.key.logical_timestamp)
            .await?
            .ok_or_else(|| TriggerError::RunNotFound {
                workflow_id: wait.key.workflow_id.clone(),
                logical_timestamp: wait.key.logical_timestamp,
            })?;

        debug!(
            workflow_id = %run.workflow_id,
            run_id = %run.run_id,
            state = %run.state,
            "Watcher observed run state"
        );

        if !wait.is_settled(run.state) {
            return Ok(None);
        }

        Ok(Some(RunStateEvent {
            workflow_id: run.workflow_id,
            logical_timestamps: vec![run.logical_timestamp],
            states: vec![run.state],
            poll_interval: wait.poll_interval,
        }))
    }

    /// Observe every `poll_interval` until the run settles or the wait's deadline passes.
    pub async fn watch(&self, wait: &DeferredWait, cancel: &CancellationToken) -> Result<RunStateEvent> {
        let started = Instant::now();
        // Wall-clock deadline mapped onto the tokio clock once
        let deadline = match wait.deadline {
            Some(deadline) => {
                let remaining = (deadline - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                Some(started.checked_add(remaining).ok_or_else(|| {
                    TriggerError::configuration(format!("deadline {} is out of range", deadline))
                })?)
            }
            None => None,
        };

        loop {
            if let Some(event) = self.observe(wait).await? {
                return Ok(event);
            }

            let now = Instant::now();
            if deadline.is_some_and(|deadline| now >= deadline) {
                warn!(
                    workflow_id = %wait.key.workflow_id,
                    run_id = %wait.key.run_id,
                    "Deferred wait passed its deadline"
                );
                return Err(wait.timeout_error(now - started));
            }
            let wake_at = next_wake(now, wait.poll_interval, deadline)?;

            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(TriggerError::Cancelled {
                        workflow_id: wait.key.workflow_id.clone(),
                        run_id: wait.key.run_id.clone(),
                    });
                }
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }
}

/// Completion handler for a deferred wait.
///
/// The target workflow comes from the wait, not the event; the run is
/// re-read at the event's first logical timestamp. Anything that is neither
/// failed nor allowed at this point is an unexpected state.
pub async fn complete_deferred<S: RunStore>(
    store: &S,
    wait: &DeferredWait,
    event: &RunStateEvent,
) -> Result<RunRecord> {
    let logical_timestamp = event
        .logical_timestamps
        .first()
        .copied()
        .unwrap_or(wait.key.logical_timestamp);

    let run = store
        .get_run_by_logical_timestamp(&wait.key.workflow_id, logical_timestamp)
        .await?
        .ok_or_else(|| TriggerError::RunNotFound {
            workflow_id: wait.key.workflow_id.clone(),
            logical_timestamp,
        })?;

    let policy = wait.policy();
    match policy.evaluate(run.state) {
        Verdict::Complete => {
            info!(
                workflow_id = %run.workflow_id,
                run_id = %run.run_id,
                state = %run.state,
                "Deferred wait completed"
            );
            Ok(run)
        }
        Verdict::Failed(state) => Err(TriggerError::DownstreamFailed {
            workflow_id: run.workflow_id,
            run_id: run.run_id,
            state,
        }),
        Verdict::Unexpected(_) | Verdict::Pending => Err(TriggerError::UnexpectedTerminalState {
            workflow_id: run.workflow_id,
            run_id: run.run_id,
            state: run.state,
            allowed: wait.allowed_states.clone(),
        }),
    }
}
