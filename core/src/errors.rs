//! Error conditions surfaced by the trigger controller.

use chrono::{DateTime, Utc};
use std::time::Duration;

use crate::types::{RunState, StateSet};

pub type Result<T> = std::result::Result<T, TriggerError>;

#[derive(Debug, thiserror::Error)]
pub enum TriggerError {
    /// The resolved identity collides with an existing run and reset is disabled.
    #[error(
        "A run already exists for workflow '{workflow_id}' with run id '{run_id}' (existing run: '{existing_run_id}')"
    )]
    RunAlreadyExists {
        workflow_id: String,
        run_id: String,
        existing_run_id: String,
    },

    #[error("{message}")]
    ConfigurationError { message: String },

    #[error("{workflow_id} failed with failed state {state} (run '{run_id}')")]
    DownstreamFailed {
        workflow_id: String,
        run_id: String,
        state: RunState,
    },

    #[error("{workflow_id} return {state} which is not in {allowed} (run '{run_id}')")]
    UnexpectedTerminalState {
        workflow_id: String,
        run_id: String,
        state: RunState,
        allowed: StateSet,
    },

    #[error("Timed out after {waited:?} waiting for run '{run_id}' of workflow '{workflow_id}'")]
    Timeout {
        workflow_id: String,
        run_id: String,
        waited: Duration,
    },

    #[error("Workflow '{workflow_id}' not found")]
    WorkflowNotFound { workflow_id: String },

    #[error("No run of workflow '{workflow_id}' at logical timestamp {logical_timestamp}")]
    RunNotFound {
        workflow_id: String,
        logical_timestamp: DateTime<Utc>,
    },

    #[error("Wait for run '{run_id}' of workflow '{workflow_id}' was cancelled")]
    Cancelled { workflow_id: String, run_id: String },

    #[error("Template rendering failed: {message}")]
    Template { message: String },

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

impl TriggerError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::ConfigurationError {
            message: message.into(),
        }
    }

    /// Only storage failures may succeed on a later attempt; every domain
    /// condition is final.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Store(_))
    }
}
