//! Run creation with collision handling
//!
//! Ensures exactly one run exists for a resolved identity. The lookup,
//! insert and optional reset happen inside one explicit transaction; the
//! store's uniqueness constraints decide races, and a lost race is reported
//! as a collision rather than a storage failure.

use serde::Serialize;
use serde_json::Value as JsonValue;
use std::sync::Arc;
use tracing::{debug, info};

use crate::errors::{Result, TriggerError};
use crate::store::{InsertOutcome, RunStore, RunTransaction};
use crate::types::*;

const CONF_NOT_SERIALIZABLE: &str = "conf parameter should be JSON Serializable";

/// Conf payload as handed to the controller, converted to JSON up front so
/// a non-serializable value is caught before anything is written.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum ConfPayload {
    #[default]
    Empty,
    Resolved(RunConf),
    Invalid(String),
}

impl ConfPayload {
    pub fn from_serializable<T: Serialize + ?Sized>(value: &T) -> Self {
        match serde_json::to_value(value) {
            Ok(JsonValue::Object(map)) => ConfPayload::Resolved(map),
            Ok(JsonValue::Null) => ConfPayload::Empty,
            Ok(other) => ConfPayload::Invalid(format!("expected a JSON object, got {}", other)),
            Err(e) => ConfPayload::Invalid(e.to_string()),
        }
    }

    /// Dry-run serialization of the payload.
    pub fn validate(&self) -> Result<RunConf> {
        match self {
            ConfPayload::Empty => Ok(RunConf::new()),
            ConfPayload::Resolved(map) => {
                serde_json::to_string(map).map_err(|e| {
                    debug!(reason = %e, "Conf failed dry-run serialization");
                    TriggerError::configuration(CONF_NOT_SERIALIZABLE)
                })?;
                Ok(map.clone())
            }
            ConfPayload::Invalid(reason) => {
                debug!(%reason, "Conf is not a JSON object");
                Err(TriggerError::configuration(CONF_NOT_SERIALIZABLE))
            }
        }
    }
}

impl From<RunConf> for ConfPayload {
    fn from(map: RunConf) -> Self {
        ConfPayload::Resolved(map)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Created,
    Reset,
}

#[derive(Debug, Clone)]
pub struct CreatedRun {
    pub record: RunRecord,
    pub disposition: Disposition,
}

pub struct RunCreator<S: RunStore> {
    store: Arc<S>,
}

impl<S: RunStore> RunCreator<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Create the run for `identity`, or reset the colliding run when `reset` is set.
    ///
    /// `triggered_by` names the workflow (or operator) recorded in the audit log.
    pub async fn ensure_run(
        &self,
        identity: &RunIdentity,
        conf: &ConfPayload,
        reset: bool,
        triggered_by: &str,
    ) -> Result<CreatedRun> {
        let conf = conf.validate()?;

        let mut tx = self.store.begin().await?;

        let existing = tx
            .find_conflicting(
                &identity.workflow_id,
                &identity.run_id,
                identity.logical_timestamp,
            )
            .await?;

        let existing = match existing {
            Some(run) => run,
            None => match tx.insert_run(&NewRun::triggered(identity, conf.clone())).await? {
                InsertOutcome::Inserted(record) => {
                    tx.record_audit(&AuditEntry {
                        event: AuditEvent::Triggered,
                        source: triggered_by.to_string(),
                        target: identity.workflow_id.clone(),
                        run_id: record.run_id.clone(),
                    })
                    .await?;
                    tx.commit().await?;

                    info!(
                        workflow_id = %record.workflow_id,
                        run_id = %record.run_id,
                        triggered_by,
                        "Triggered run"
                    );
                    return Ok(CreatedRun {
                        record,
                        disposition: Disposition::Created,
                    });
                }
                InsertOutcome::Conflict => {
                    // A concurrent trigger committed first
                    debug!(run_id = %identity.run_id, "Insert lost race, re-reading conflicting run");
                    tx.find_conflicting(
                        &identity.workflow_id,
                        &identity.run_id,
                        identity.logical_timestamp,
                    )
                    .await?
                    .ok_or_else(|| {
                        anyhow::anyhow!(
                            "Run '{}' conflicted on insert but could not be found",
                            identity.run_id
                        )
                    })?
                }
            },
        };

        if !reset {
            // Dropping the transaction rolls it back
            return Err(TriggerError::RunAlreadyExists {
                workflow_id: identity.workflow_id.clone(),
                run_id: identity.run_id.clone(),
                existing_run_id: existing.run_id,
            });
        }

        let record = tx.reset_run(&existing, &conf).await?;
        tx.record_audit(&AuditEntry {
            event: AuditEvent::Reset,
            source: triggered_by.to_string(),
            target: identity.workflow_id.clone(),
            run_id: record.run_id.clone(),
        })
        .await?;
        tx.commit().await?;

        info!(
            workflow_id = %record.workflow_id,
            run_id = %record.run_id,
            previous_state = %existing.state,
            "Reset existing run"
        );

        Ok(CreatedRun {
            record,
            disposition: Disposition::Reset,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::resolve_identity;
    use crate::store::{MemoryRunStore, MemoryTransaction};
    use crate::test_helpers::*;
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use serde::Serializer;
    use serde_json::json;

    struct OpaqueHandle;

    impl Serialize for OpaqueHandle {
        fn serialize<S: Serializer>(&self, _serializer: S) -> std::result::Result<S::Ok, S::Error> {
            Err(serde::ser::Error::custom("opaque handle cannot be serialized"))
        }
    }

    #[derive(Serialize)]
    struct ConfWithHandle {
        foo: OpaqueHandle,
    }

    fn identity_at_default_date() -> RunIdentity {
        resolve_identity(TRIGGERED_WORKFLOW, None, Some(default_date()), default_date())
    }

    #[tokio::test]
    async fn test_creates_queued_external_run_with_audit_entry() {
        let store = Arc::new(memory_store().await);
        let creator = RunCreator::new(store.clone());

        let conf = ConfPayload::from_serializable(&json!({"foo": "bar"}));
        let created = creator
            .ensure_run(&identity_at_default_date(), &conf, false, TRIGGERING_WORKFLOW)
            .await
            .unwrap();

        assert_eq!(created.disposition, Disposition::Created);
        assert_eq!(created.record.state, RunState::Queued);
        assert!(created.record.external_trigger);
        assert_eq!(created.record.conf.get("foo"), Some(&json!("bar")));

        let audit = store.audit_entries(TRIGGERED_WORKFLOW).await.unwrap();
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].event, AuditEvent::Triggered);
        assert_eq!(audit[0].source, TRIGGERING_WORKFLOW);
    }

    #[tokio::test]
    async fn test_unserializable_conf_fails_before_any_write() {
        let store = Arc::new(memory_store().await);
        let creator = RunCreator::new(store.clone());

        let conf = ConfPayload::from_serializable(&ConfWithHandle { foo: OpaqueHandle });
        let err = creator
            .ensure_run(&identity_at_default_date(), &conf, false, TRIGGERING_WORKFLOW)
            .await
            .unwrap_err();

        assert!(matches!(err, TriggerError::ConfigurationError { .. }));
        assert_eq!(err.to_string(), "conf parameter should be JSON Serializable");
        let runs = store
            .list_runs(RunListFilter {
                workflow_id: TRIGGERED_WORKFLOW.to_string(),
                state: None,
                limit: None,
            })
            .await
            .unwrap();
        assert!(runs.is_empty());
    }

    #[tokio::test]
    async fn test_non_object_conf_is_rejected() {
        let conf = ConfPayload::from_serializable(&json!(["a", "b"]));
        assert!(matches!(
            conf.validate(),
            Err(TriggerError::ConfigurationError { .. })
        ));
    }

    #[tokio::test]
    async fn test_collision_without_reset_leaves_existing_run() {
        let store = Arc::new(memory_store().await);
        let creator = RunCreator::new(store.clone());
        let identity = identity_at_default_date();

        creator
            .ensure_run(&identity, &ConfPayload::Empty, false, TRIGGERING_WORKFLOW)
            .await
            .unwrap();
        store
            .set_state(TRIGGERED_WORKFLOW, &identity.run_id, RunState::Running)
            .await
            .unwrap();

        let err = creator
            .ensure_run(&identity, &ConfPayload::Empty, false, TRIGGERING_WORKFLOW)
            .await
            .unwrap_err();
        assert!(matches!(err, TriggerError::RunAlreadyExists { .. }));

        let run = store
            .get_run(TRIGGERED_WORKFLOW, &identity.run_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(run.state, RunState::Running);
        assert_eq!(store.audit_entries(TRIGGERED_WORKFLOW).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_reset_requeues_and_clears_history() {
        let store = Arc::new(memory_store().await);
        let creator = RunCreator::new(store.clone());
        let identity = identity_at_default_date();

        creator
            .ensure_run(&identity, &ConfPayload::Empty, true, TRIGGERING_WORKFLOW)
            .await
            .unwrap();
        store
            .record_task_instance(&TaskInstance {
                workflow_id: TRIGGERED_WORKFLOW.to_string(),
                run_id: identity.run_id.clone(),
                task_id: "test".to_string(),
                state: RunState::Success,
                try_number: 1,
            })
            .await
            .unwrap();
        store
            .set_state(TRIGGERED_WORKFLOW, &identity.run_id, RunState::Success)
            .await
            .unwrap();

        let created = creator
            .ensure_run(&identity, &ConfPayload::Empty, true, TRIGGERING_WORKFLOW)
            .await
            .unwrap();

        assert_eq!(created.disposition, Disposition::Reset);
        assert_eq!(created.record.run_id, identity.run_id);
        assert_eq!(created.record.state, RunState::Queued);
        assert!(store
            .task_instances(TRIGGERED_WORKFLOW, &identity.run_id)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_triggers_yield_one_run() {
        let store = Arc::new(memory_store().await);
        let identity = identity_at_default_date();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let creator = RunCreator::new(store.clone());
            let identity = identity.clone();
            handles.push(tokio::spawn(async move {
                creator
                    .ensure_run(&identity, &ConfPayload::Empty, false, TRIGGERING_WORKFLOW)
                    .await
            }));
        }

        let mut created = 0;
        let mut collisions = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => created += 1,
                Err(TriggerError::RunAlreadyExists { .. }) => collisions += 1,
                Err(other) => panic!("unexpected error: {other}"),
            }
        }

        assert_eq!(created, 1);
        assert_eq!(collisions, 7);
    }

    /// Store whose first conflict lookup misses, as when a concurrent
    /// trigger commits between the lookup and the insert.
    struct RacingStore {
        inner: MemoryRunStore,
    }

    struct RacingTransaction {
        inner: MemoryTransaction,
        lookups: usize,
    }

    #[async_trait]
    impl RunTransaction for RacingTransaction {
        async fn find_conflicting(
            &mut self,
            workflow_id: &str,
            run_id: &str,
            logical_timestamp: DateTime<Utc>,
        ) -> anyhow::Result<Option<RunRecord>> {
            self.lookups += 1;
            if self.lookups == 1 {
                return Ok(None);
            }
            self.inner
                .find_conflicting(workflow_id, run_id, logical_timestamp)
                .await
        }

        async fn insert_run(&mut self, run: &NewRun) -> anyhow::Result<InsertOutcome> {
            self.inner.insert_run(run).await
        }

        async fn reset_run(&mut self, run: &RunRecord, conf: &RunConf) -> anyhow::Result<RunRecord> {
            self.inner.reset_run(run, conf).await
        }

        async fn record_audit(&mut self, entry: &AuditEntry) -> anyhow::Result<()> {
            self.inner.record_audit(entry).await
        }

        async fn commit(self) -> anyhow::Result<()> {
            self.inner.commit().await
        }
    }

    #[async_trait]
    impl RunStore for RacingStore {
        type Tx = RacingTransaction;

        async fn begin(&self) -> anyhow::Result<RacingTransaction> {
            Ok(RacingTransaction {
                inner: self.inner.begin().await?,
                lookups: 0,
            })
        }

        async fn workflow_exists(&self, workflow_id: &str) -> anyhow::Result<bool> {
            self.inner.workflow_exists(workflow_id).await
        }

        async fn register_workflow(&self, workflow_id: &str) -> anyhow::Result<()> {
            self.inner.register_workflow(workflow_id).await
        }

        async fn get_run(&self, workflow_id: &str, run_id: &str) -> anyhow::Result<Option<RunRecord>> {
            self.inner.get_run(workflow_id, run_id).await
        }

        async fn get_run_by_logical_timestamp(
            &self,
            workflow_id: &str,
            logical_timestamp: DateTime<Utc>,
        ) -> anyhow::Result<Option<RunRecord>> {
            self.inner
                .get_run_by_logical_timestamp(workflow_id, logical_timestamp)
                .await
        }

        async fn list_runs(&self, filter: RunListFilter) -> anyhow::Result<Vec<RunRecord>> {
            self.inner.list_runs(filter).await
        }

        async fn set_state(&self, workflow_id: &str, run_id: &str, state: RunState) -> anyhow::Result<bool> {
            self.inner.set_state(workflow_id, run_id, state).await
        }

        async fn record_task_instance(&self, task: &TaskInstance) -> anyhow::Result<()> {
            self.inner.record_task_instance(task).await
        }

        async fn task_instances(&self, workflow_id: &str, run_id: &str) -> anyhow::Result<Vec<TaskInstance>> {
            self.inner.task_instances(workflow_id, run_id).await
        }

        async fn audit_entries(&self, target: &str) -> anyhow::Result<Vec<AuditEntry>> {
            self.inner.audit_entries(target).await
        }
    }

    /// A scheduled run already holds the default date; the first lookup misses it.
    async fn racing_store() -> Arc<RacingStore> {
        let inner = memory_store().await;
        seed_run(
            &inner,
            TRIGGERED_WORKFLOW,
            "scheduled__2019-01-01T00:00:00+00:00",
            RunKind::Scheduled,
            default_date(),
            RunState::Running,
        )
        .await;
        Arc::new(RacingStore { inner })
    }

    #[tokio::test]
    async fn test_lost_insert_race_is_a_collision() {
        let store = racing_store().await;
        let creator = RunCreator::new(store.clone());

        let err = creator
            .ensure_run(&identity_at_default_date(), &ConfPayload::Empty, false, TRIGGERING_WORKFLOW)
            .await
            .unwrap_err();

        match err {
            TriggerError::RunAlreadyExists { existing_run_id, .. } => {
                assert_eq!(existing_run_id, "scheduled__2019-01-01T00:00:00+00:00");
            }
            other => panic!("expected RunAlreadyExists, got {other}"),
        }
        assert!(store.audit_entries(TRIGGERED_WORKFLOW).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_lost_insert_race_with_reset_resets_winner() {
        let store = racing_store().await;
        let creator = RunCreator::new(store.clone());

        let created = creator
            .ensure_run(&identity_at_default_date(), &ConfPayload::Empty, true, TRIGGERING_WORKFLOW)
            .await
            .unwrap();

        assert_eq!(created.disposition, Disposition::Reset);
        assert_eq!(created.record.run_id, "scheduled__2019-01-01T00:00:00+00:00");
        assert_eq!(created.record.state, RunState::Queued);

        let audit = store.audit_entries(TRIGGERED_WORKFLOW).await.unwrap();
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].event, AuditEvent::Reset);
    }
}
