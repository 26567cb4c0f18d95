//! In-memory run store
//!
//! Transactions are serialized behind an owned async mutex and work on a
//! staged copy of the committed state. Readers only touch the committed
//! snapshot and never wait on an open transaction. Engine-side writes
//! queue behind open transactions so a commit cannot overwrite them.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, RwLock, RwLockReadGuard};
use tokio::sync::{Mutex, OwnedMutexGuard};

use super::{InsertOutcome, RunStore, RunTransaction};
use crate::types::*;

#[derive(Debug, Clone, Default)]
struct MemoryState {
    workflows: HashSet<String>,
    /// Keyed by `(workflow_id, run_id)`.
    runs: BTreeMap<(String, String), RunRecord>,
    task_instances: Vec<TaskInstance>,
    audit_log: Vec<AuditEntry>,
}

impl MemoryState {
    fn find_conflicting(
        &self,
        workflow_id: &str,
        run_id: &str,
        logical_timestamp: DateTime<Utc>,
    ) -> Option<RunRecord> {
        self.runs
            .get(&(workflow_id.to_string(), run_id.to_string()))
            .or_else(|| {
                self.runs.values().find(|r| {
                    r.workflow_id == workflow_id && r.logical_timestamp == logical_timestamp
                })
            })
            .cloned()
    }
}

#[derive(Clone, Default)]
pub struct MemoryRunStore {
    committed: Arc<RwLock<MemoryState>>,
    tx_lock: Arc<Mutex<()>>,
}

impl MemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a run as-is, bypassing the trigger path. Used to seed runs
    /// created by other producers (e.g. the time-based scheduler).
    pub async fn seed_run(&self, run: NewRun) -> Result<RunRecord> {
        let _guard = self.tx_lock.lock().await;
        let mut state = self.write()?;
        let now = Utc::now();
        let record = RunRecord {
            workflow_id: run.workflow_id,
            run_id: run.run_id,
            logical_timestamp: run.logical_timestamp,
            run_kind: run.run_kind,
            state: run.state,
            external_trigger: run.external_trigger,
            conf: run.conf,
            created_at: now,
            updated_at: now,
        };
        state.workflows.insert(record.workflow_id.clone());
        state.runs.insert(
            (record.workflow_id.clone(), record.run_id.clone()),
            record.clone(),
        );
        Ok(record)
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, MemoryState>> {
        self.committed
            .read()
            .map_err(|_| anyhow!("Memory store lock poisoned"))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, MemoryState>> {
        self.committed
            .write()
            .map_err(|_| anyhow!("Memory store lock poisoned"))
    }
}

pub struct MemoryTransaction {
    _guard: OwnedMutexGuard<()>,
    committed: Arc<RwLock<MemoryState>>,
    staged: MemoryState,
}

#[async_trait]
impl RunTransaction for MemoryTransaction {
    async fn find_conflicting(
        &mut self,
        workflow_id: &str,
        run_id: &str,
        logical_timestamp: DateTime<Utc>,
    ) -> Result<Option<RunRecord>> {
        Ok(self
            .staged
            .find_conflicting(workflow_id, run_id, logical_timestamp))
    }

    async fn insert_run(&mut self, run: &NewRun) -> Result<InsertOutcome> {
        if self
            .staged
            .find_conflicting(&run.workflow_id, &run.run_id, run.logical_timestamp)
            .is_some()
        {
            return Ok(InsertOutcome::Conflict);
        }

        let now = Utc::now();
        let record = RunRecord {
            workflow_id: run.workflow_id.clone(),
            run_id: run.run_id.clone(),
            logical_timestamp: run.logical_timestamp,
            run_kind: run.run_kind,
            state: run.state,
            external_trigger: run.external_trigger,
            conf: run.conf.clone(),
            created_at: now,
            updated_at: now,
        };
        self.staged.runs.insert(
            (record.workflow_id.clone(), record.run_id.clone()),
            record.clone(),
        );
        Ok(InsertOutcome::Inserted(record))
    }

    async fn reset_run(&mut self, run: &RunRecord, conf: &RunConf) -> Result<RunRecord> {
        self.staged
            .task_instances
            .retain(|t| !(t.workflow_id == run.workflow_id && t.run_id == run.run_id));

        let record = self
            .staged
            .runs
            .get_mut(&(run.workflow_id.clone(), run.run_id.clone()))
            .ok_or_else(|| anyhow!("Run '{}' vanished during reset", run.run_id))?;
        record.state = RunState::Queued;
        record.external_trigger = true;
        record.conf = conf.clone();
        record.updated_at = Utc::now();
        Ok(record.clone())
    }

    async fn record_audit(&mut self, entry: &AuditEntry) -> Result<()> {
        self.staged.audit_log.push(entry.clone());
        Ok(())
    }

    async fn commit(self) -> Result<()> {
        let mut committed = self
            .committed
            .write()
            .map_err(|_| anyhow!("Memory store lock poisoned"))?;
        *committed = self.staged;
        Ok(())
    }
}

#[async_trait]
impl RunStore for MemoryRunStore {
    type Tx = MemoryTransaction;

    async fn begin(&self) -> Result<MemoryTransaction> {
        let guard = self.tx_lock.clone().lock_owned().await;
        let staged = self.read()?.clone();
        Ok(MemoryTransaction {
            _guard: guard,
            committed: self.committed.clone(),
            staged,
        })
    }

    async fn workflow_exists(&self, workflow_id: &str) -> Result<bool> {
        Ok(self.read()?.workflows.contains(workflow_id))
    }

    async fn register_workflow(&self, workflow_id: &str) -> Result<()> {
        let _guard = self.tx_lock.lock().await;
        self.write()?.workflows.insert(workflow_id.to_string());
        Ok(())
    }

    async fn get_run(&self, workflow_id: &str, run_id: &str) -> Result<Option<RunRecord>> {
        Ok(self
            .read()?
            .runs
            .get(&(workflow_id.to_string(), run_id.to_string()))
            .cloned())
    }

    async fn get_run_by_logical_timestamp(
        &self,
        workflow_id: &str,
        logical_timestamp: DateTime<Utc>,
    ) -> Result<Option<RunRecord>> {
        Ok(self
            .read()?
            .runs
            .values()
            .find(|r| r.workflow_id == workflow_id && r.logical_timestamp == logical_timestamp)
            .cloned())
    }

    async fn list_runs(&self, filter: RunListFilter) -> Result<Vec<RunRecord>> {
        let state = self.read()?;
        let mut runs: Vec<RunRecord> = state
            .runs
            .values()
            .filter(|r| r.workflow_id == filter.workflow_id)
            .filter(|r| filter.state.map_or(true, |s| r.state == s))
            .cloned()
            .collect();
        runs.sort_by_key(|r| r.logical_timestamp);
        if let Some(limit) = filter.limit {
            runs.truncate(limit.max(0) as usize);
        }
        Ok(runs)
    }

    async fn set_state(&self, workflow_id: &str, run_id: &str, state: RunState) -> Result<bool> {
        let _guard = self.tx_lock.lock().await;
        let mut committed = self.write()?;
        match committed
            .runs
            .get_mut(&(workflow_id.to_string(), run_id.to_string()))
        {
            Some(record) => {
                record.state = state;
                record.updated_at = Utc::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn record_task_instance(&self, task: &TaskInstance) -> Result<()> {
        let _guard = self.tx_lock.lock().await;
        self.write()?.task_instances.push(task.clone());
        Ok(())
    }

    async fn task_instances(&self, workflow_id: &str, run_id: &str) -> Result<Vec<TaskInstance>> {
        Ok(self
            .read()?
            .task_instances
            .iter()
            .filter(|t| t.workflow_id == workflow_id && t.run_id == run_id)
            .cloned()
            .collect())
    }

    async fn audit_entries(&self, target: &str) -> Result<Vec<AuditEntry>> {
        Ok(self
            .read()?
            .audit_log
            .iter()
            .filter(|e| e.target == target)
            .cloned()
            .collect())
    }
}
