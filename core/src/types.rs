use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// Conf payload attached to a run. Always a JSON object.
pub type RunConf = Map<String, JsonValue>;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq, Hash)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum RunKind {
    Manual,
    Scheduled,
    Triggered,
}

impl RunKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunKind::Manual => "manual",
            RunKind::Scheduled => "scheduled",
            RunKind::Triggered => "triggered",
        }
    }
}

impl fmt::Display for RunKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    Queued,
    Running,
    Success,
    Failed,
}

impl RunState {
    pub const ALL: [RunState; 4] = [
        RunState::Queued,
        RunState::Running,
        RunState::Success,
        RunState::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::Queued => "queued",
            RunState::Running => "running",
            RunState::Success => "success",
            RunState::Failed => "failed",
        }
    }

    /// No transition leaves a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Success | RunState::Failed)
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "queued" => Ok(RunState::Queued),
            "running" => Ok(RunState::Running),
            "success" => Ok(RunState::Success),
            "failed" => Ok(RunState::Failed),
            other => Err(format!(
                "Invalid state: {}. Must be one of: queued, running, success, failed",
                other
            )),
        }
    }
}

/// Ordered set of run states, rendered as `[queued, success]`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StateSet(BTreeSet<RunState>);

impl StateSet {
    pub fn new(states: impl IntoIterator<Item = RunState>) -> Self {
        Self(states.into_iter().collect())
    }

    pub fn contains(&self, state: RunState) -> bool {
        self.0.contains(&state)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = RunState> + '_ {
        self.0.iter().copied()
    }

    pub fn union(&self, other: &StateSet) -> StateSet {
        Self(self.0.union(&other.0).copied().collect())
    }

    pub fn intersection(&self, other: &StateSet) -> StateSet {
        Self(self.0.intersection(&other.0).copied().collect())
    }
}

impl FromIterator<RunState> for StateSet {
    fn from_iter<I: IntoIterator<Item = RunState>>(iter: I) -> Self {
        Self::new(iter)
    }
}

impl fmt::Display for StateSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.0.iter().map(RunState::as_str).collect();
        write!(f, "[{}]", names.join(", "))
    }
}

/// Identity of a run: `(workflow_id, run_id)` plus its logical timestamp.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunIdentity {
    pub workflow_id: String,
    pub run_id: String,
    pub logical_timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub workflow_id: String,
    pub run_id: String,
    pub logical_timestamp: DateTime<Utc>,
    pub run_kind: RunKind,
    pub state: RunState,
    pub external_trigger: bool,
    pub conf: RunConf,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RunRecord {
    pub fn identity(&self) -> RunIdentity {
        RunIdentity {
            workflow_id: self.workflow_id.clone(),
            run_id: self.run_id.clone(),
            logical_timestamp: self.logical_timestamp,
        }
    }
}

/// Insert parameters for a run record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewRun {
    pub workflow_id: String,
    pub run_id: String,
    pub logical_timestamp: DateTime<Utc>,
    pub run_kind: RunKind,
    pub state: RunState,
    pub external_trigger: bool,
    pub conf: RunConf,
}

impl NewRun {
    /// A queued, externally triggered manual run for `identity`.
    pub fn triggered(identity: &RunIdentity, conf: RunConf) -> Self {
        Self {
            workflow_id: identity.workflow_id.clone(),
            run_id: identity.run_id.clone(),
            logical_timestamp: identity.logical_timestamp,
            run_kind: RunKind::Manual,
            state: RunState::Queued,
            external_trigger: true,
            conf,
        }
    }
}

/// One task attempt inside a run. Reset clears these.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskInstance {
    pub workflow_id: String,
    pub run_id: String,
    pub task_id: String,
    pub state: RunState,
    pub try_number: i32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum AuditEvent {
    Triggered,
    Reset,
}

impl AuditEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditEvent::Triggered => "triggered",
            AuditEvent::Reset => "reset",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub event: AuditEvent,
    /// Workflow (or operator) that caused the trigger.
    pub source: String,
    /// Workflow that was triggered.
    pub target: String,
    pub run_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunListFilter {
    pub workflow_id: String,
    pub state: Option<RunState>,
    pub limit: Option<i64>,
}
