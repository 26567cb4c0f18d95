//! Shared fixtures for unit tests

use chrono::{DateTime, TimeZone, Utc};
use sqlx::PgPool;
use std::ops::Deref;
use std::sync::OnceLock;
use tokio::sync::{Mutex, MutexGuard};

use crate::config::Config;
use crate::store::{MemoryRunStore, RunStore};
use crate::types::*;

pub const TRIGGERING_WORKFLOW: &str = "upstream";
pub const TRIGGERED_WORKFLOW: &str = "downstream";

pub fn default_date() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2019, 1, 1, 0, 0, 0).unwrap()
}

/// Memory store with both test workflows registered.
pub async fn memory_store() -> MemoryRunStore {
    let store = MemoryRunStore::new();
    store.register_workflow(TRIGGERING_WORKFLOW).await.unwrap();
    store.register_workflow(TRIGGERED_WORKFLOW).await.unwrap();
    store
}

/// Seed a run the way a non-trigger producer would have created it.
pub async fn seed_run(
    store: &MemoryRunStore,
    workflow_id: &str,
    run_id: &str,
    kind: RunKind,
    logical_timestamp: DateTime<Utc>,
    state: RunState,
) -> RunRecord {
    store
        .seed_run(NewRun {
            workflow_id: workflow_id.to_string(),
            run_id: run_id.to_string(),
            logical_timestamp,
            run_kind: kind,
            state,
            external_trigger: false,
            conf: RunConf::new(),
        })
        .await
        .unwrap()
}

/// Database tests share one schema and run one at a time.
static DB_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

/// Test database pool holding the database lock until dropped
pub struct TestPool {
    pool: PgPool,
    _guard: MutexGuard<'static, ()>,
}

impl Deref for TestPool {
    type Target = PgPool;

    fn deref(&self) -> &Self::Target {
        &self.pool
    }
}

/// Connect to the test database (RELAY_DATABASE_URL), migrate, and empty
/// every table.
pub async fn with_test_pool() -> TestPool {
    let _guard = DB_LOCK.get_or_init(|| Mutex::new(())).lock().await;

    let config = Config::builder()
        .require_database(true)
        .build()
        .expect("RELAY_DATABASE_URL must be set for database tests");
    let pool = crate::db::create_pool(&config.database)
        .await
        .expect("Failed to connect to test database");
    crate::db::migrate(&pool)
        .await
        .expect("Failed to migrate test database");

    sqlx::query(
        "TRUNCATE TABLE deferred_waits, audit_log, task_instances, workflow_runs, workflows CASCADE",
    )
    .execute(&pool)
    .await
    .expect("Failed to reset test database");

    TestPool { pool, _guard }
}
