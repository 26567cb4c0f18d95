//! Trigger controller
//!
//! Entry point for triggering a downstream workflow run and optionally
//! waiting on it:
//! 1. Validate the request and check the target workflow is known
//! 2. Resolve the run identity
//! 3. Create the run, or reset the colliding one
//! 4. Return, wait in place, or park a deferred wait with the scheduler

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

use crate::creator::{ConfPayload, CreatedRun, RunCreator};
use crate::errors::{Result, TriggerError};
use crate::identity::resolve_identity;
use crate::scheduler::ResumptionScheduler;
use crate::store::RunStore;
use crate::types::*;
use crate::waiter::{
    complete_deferred, CompletionWaiter, DeferredWait, RunStateEvent, SuspendStrategy, WaitPolicy,
};

/// Audit source recorded when a request does not name one.
pub const DEFAULT_TRIGGER_SOURCE: &str = "relay";

const EXTRA_LINK_LABEL: &str = "Triggered Workflow";

#[derive(Debug, Clone)]
pub struct TriggerRequest {
    pub workflow_id: String,
    pub run_id: Option<String>,
    pub logical_timestamp: Option<DateTime<Utc>>,
    pub conf: ConfPayload,
    pub reset: bool,
    pub wait_for_completion: bool,
    pub policy: WaitPolicy,
    /// Workflow or operator recorded as the audit source.
    pub triggered_by: String,
}

impl TriggerRequest {
    pub fn new(workflow_id: impl Into<String>) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            run_id: None,
            logical_timestamp: None,
            conf: ConfPayload::Empty,
            reset: false,
            wait_for_completion: false,
            policy: WaitPolicy::default(),
            triggered_by: DEFAULT_TRIGGER_SOURCE.to_string(),
        }
    }

    pub fn run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }

    pub fn logical_timestamp(mut self, ts: DateTime<Utc>) -> Self {
        self.logical_timestamp = Some(ts);
        self
    }

    /// Attach a conf payload. Values that do not serialize to a JSON object
    /// are rejected when the request is triggered.
    pub fn conf<T: Serialize + ?Sized>(mut self, conf: &T) -> Self {
        self.conf = ConfPayload::from_serializable(conf);
        self
    }

    pub fn reset(mut self, reset: bool) -> Self {
        self.reset = reset;
        self
    }

    pub fn wait_for_completion(mut self, wait: bool) -> Self {
        self.wait_for_completion = wait;
        self
    }

    pub fn policy(mut self, policy: WaitPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.policy.poll_interval = interval;
        self
    }

    pub fn allowed_states(mut self, states: impl IntoIterator<Item = RunState>) -> Self {
        self.policy.allowed_states = StateSet::new(states);
        self
    }

    pub fn failed_states(mut self, states: impl IntoIterator<Item = RunState>) -> Self {
        self.policy.failed_states = StateSet::new(states);
        self
    }

    pub fn deferred(mut self, deferred: bool) -> Self {
        self.policy.strategy = if deferred {
            SuspendStrategy::Deferred
        } else {
            SuspendStrategy::Blocking
        };
        self
    }

    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.policy.timeout = timeout;
        self
    }

    pub fn triggered_by(mut self, source: impl Into<String>) -> Self {
        self.triggered_by = source.into();
        self
    }
}

#[derive(Debug, Clone)]
pub enum Outcome {
    /// Run created or reset; nobody waits on it.
    Triggered(RunRecord),
    /// Run reached an allowed state.
    Completed(RunRecord),
    /// Wait parked with the scheduler under `wait_id`.
    Deferred { wait_id: Uuid, wait: DeferredWait },
}

impl Outcome {
    pub fn run(&self) -> Option<&RunRecord> {
        match self {
            Outcome::Triggered(run) | Outcome::Completed(run) => Some(run),
            Outcome::Deferred { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExtraLink {
    pub label: String,
    pub url: String,
}

pub struct TriggerController<S: RunStore> {
    store: Arc<S>,
    scheduler: Option<Arc<dyn ResumptionScheduler>>,
    ui_base_url: String,
}

impl<S: RunStore> TriggerController<S> {
    pub fn new(store: Arc<S>, ui_base_url: impl Into<String>) -> Self {
        Self {
            store,
            scheduler: None,
            ui_base_url: ui_base_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// Scheduler that receives deferred waits.
    pub fn with_scheduler(mut self, scheduler: Arc<dyn ResumptionScheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub async fn trigger(&self, request: TriggerRequest) -> Result<Outcome> {
        self.trigger_with_cancel(request, &CancellationToken::new()).await
    }

    /// Like [`trigger`](Self::trigger); a blocking wait ends with `Cancelled`
    /// once `cancel` fires. The downstream run is left as it is.
    pub async fn trigger_with_cancel(
        &self,
        request: TriggerRequest,
        cancel: &CancellationToken,
    ) -> Result<Outcome> {
        let deferred = request.wait_for_completion && request.policy.strategy == SuspendStrategy::Deferred;
        if request.wait_for_completion {
            request.policy.validate()?;
        }
        if deferred && self.scheduler.is_none() {
            return Err(TriggerError::configuration(
                "Deferred waits require a resumption scheduler",
            ));
        }

        if !self.store.workflow_exists(&request.workflow_id).await? {
            return Err(TriggerError::WorkflowNotFound {
                workflow_id: request.workflow_id,
            });
        }

        let identity = resolve_identity(
            &request.workflow_id,
            request.run_id.as_deref(),
            request.logical_timestamp,
            Utc::now(),
        );

        let CreatedRun { record, disposition } = RunCreator::new(self.store.clone())
            .ensure_run(&identity, &request.conf, request.reset, &request.triggered_by)
            .await?;

        info!(
            workflow_id = %record.workflow_id,
            run_id = %record.run_id,
            ?disposition,
            wait = request.wait_for_completion,
            "Trigger accepted"
        );

        if !request.wait_for_completion {
            return Ok(Outcome::Triggered(record));
        }

        // A reset may have kept a different run id than the one resolved
        let identity = record.identity();

        match (request.policy.strategy, &self.scheduler) {
            (SuspendStrategy::Deferred, Some(scheduler)) => {
                let wait = DeferredWait::new(&identity, &request.policy, Utc::now())?;
                let wait_id = scheduler.register_resumption(wait.clone()).await?;
                Ok(Outcome::Deferred { wait_id, wait })
            }
            _ => {
                let waiter = CompletionWaiter::new(self.store.clone(), request.policy);
                let run = waiter.wait_blocking(&identity, cancel).await?;
                Ok(Outcome::Completed(run))
            }
        }
    }

    /// Completion handler for a deferred wait resumed by the scheduling layer.
    pub async fn on_resumption_event(
        &self,
        wait: &DeferredWait,
        event: &RunStateEvent,
    ) -> Result<Outcome> {
        let run = complete_deferred(self.store.as_ref(), wait, event).await?;
        Ok(Outcome::Completed(run))
    }

    /// Link to the triggered run in the UI. Depends on the identity only.
    pub fn extra_link(&self, identity: &RunIdentity) -> ExtraLink {
        ExtraLink {
            label: EXTRA_LINK_LABEL.to_string(),
            url: format!(
                "{}/workflows/{}/grid?run_id={}",
                self.ui_base_url,
                encode_component(&identity.workflow_id),
                encode_component(&identity.run_id)
            ),
        }
    }
}

/// Percent-encode everything outside the RFC 3986 unreserved set.
fn encode_component(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => out.push(byte as char),
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }
    out
}
