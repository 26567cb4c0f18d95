// Run persistence
//
// This module defines the storage seams the trigger controller works against:
// - RunStore: read-mostly access plus the engine-side mutations
// - RunTransaction: an explicit transactional handle used by the run creator
//
// Two implementations are provided: Postgres (sqlx) and an in-memory store.

mod memory;
mod postgres;

pub use memory::{MemoryRunStore, MemoryTransaction};
pub use postgres::PgRunStore;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::types::*;

/// Outcome of an insert attempt. `Conflict` means the store's uniqueness
/// constraints rejected the row.
#[derive(Debug, Clone)]
pub enum InsertOutcome {
    Inserted(RunRecord),
    Conflict,
}

/// Transaction handle. Dropping it without `commit` discards every change.
#[async_trait]
pub trait RunTransaction: Send {
    /// Run colliding with `run_id` or `logical_timestamp` inside `workflow_id`.
    /// A run-id match wins over a timestamp match.
    async fn find_conflicting(
        &mut self,
        workflow_id: &str,
        run_id: &str,
        logical_timestamp: DateTime<Utc>,
    ) -> Result<Option<RunRecord>>;

    async fn insert_run(&mut self, run: &NewRun) -> Result<InsertOutcome>;

    /// Delete the run's task history and requeue it under the same run id.
    async fn reset_run(&mut self, run: &RunRecord, conf: &RunConf) -> Result<RunRecord>;

    async fn record_audit(&mut self, entry: &AuditEntry) -> Result<()>;

    async fn commit(self) -> Result<()>;
}

#[async_trait]
pub trait RunStore: Send + Sync + 'static {
    type Tx: RunTransaction + 'static;

    async fn begin(&self) -> Result<Self::Tx>;

    async fn workflow_exists(&self, workflow_id: &str) -> Result<bool>;

    async fn register_workflow(&self, workflow_id: &str) -> Result<()>;

    async fn get_run(&self, workflow_id: &str, run_id: &str) -> Result<Option<RunRecord>>;

    async fn get_run_by_logical_timestamp(
        &self,
        workflow_id: &str,
        logical_timestamp: DateTime<Utc>,
    ) -> Result<Option<RunRecord>>;

    async fn list_runs(&self, filter: RunListFilter) -> Result<Vec<RunRecord>>;

    /// State transition performed by the downstream workflow's execution engine.
    async fn set_state(&self, workflow_id: &str, run_id: &str, state: RunState) -> Result<bool>;

    async fn record_task_instance(&self, task: &TaskInstance) -> Result<()>;

    async fn task_instances(&self, workflow_id: &str, run_id: &str) -> Result<Vec<TaskInstance>>;

    async fn audit_entries(&self, target: &str) -> Result<Vec<AuditEntry>>;
}
