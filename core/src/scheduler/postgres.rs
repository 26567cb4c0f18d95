use anyhow::{Context, Result as AnyResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::{PgPool, Row};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::ResumptionScheduler;
use crate::config::ResumptionConfig;
use crate::errors::{Result, TriggerError};
use crate::store::PgRunStore;
use crate::waiter::{complete_deferred, DeferredWait, RunStateWatcher};

/// Persists deferred waits into `deferred_waits` for a [`ResumptionWorker`].
#[derive(Clone)]
pub struct PgResumptionScheduler {
    pool: PgPool,
}

/// Row of `deferred_waits` as seen by status queries.
#[derive(Debug, Clone)]
pub struct ParkedWait {
    pub id: Uuid,
    pub wait: DeferredWait,
    pub status: String,
    pub error: Option<String>,
}

impl PgResumptionScheduler {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn park(&self, wait: &DeferredWait) -> AnyResult<Uuid> {
        let id = Uuid::new_v4();
        let state = serde_json::to_value(wait).context("Failed to serialize deferred wait")?;

        sqlx::query(
            r#"
            INSERT INTO deferred_waits (id, workflow_id, run_id, logical_timestamp, wait_state)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(id)
        .bind(&wait.key.workflow_id)
        .bind(&wait.key.run_id)
        .bind(wait.key.logical_timestamp)
        .bind(state)
        .execute(&self.pool)
        .await
        .context("Failed to park deferred wait")?;

        info!(
            wait_id = %id,
            workflow_id = %wait.key.workflow_id,
            run_id = %wait.key.run_id,
            "Parked deferred wait"
        );
        Ok(id)
    }

    pub async fn status(&self, id: Uuid) -> AnyResult<Option<ParkedWait>> {
        let row = sqlx::query("SELECT id, wait_state, status, error FROM deferred_waits WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch deferred wait")?;

        row.map(|row| -> AnyResult<ParkedWait> {
            let state: JsonValue = row.get("wait_state");
            Ok(ParkedWait {
                id: row.get("id"),
                wait: serde_json::from_value(state).context("Corrupt deferred wait state")?,
                status: row.get("status"),
                error: row.get("error"),
            })
        })
        .transpose()
    }
}

#[async_trait]
impl ResumptionScheduler for PgResumptionScheduler {
    async fn register_resumption(&self, wait: DeferredWait) -> Result<Uuid> {
        Ok(self.park(&wait).await?)
    }
}

/// Resumes parked waits. Any number of workers may run against the same
/// database; a claimed wait is leased by moving its `next_check_at` forward,
/// so no connection is held while the run is read.
pub struct ResumptionWorker {
    store: Arc<PgRunStore>,
    watcher: RunStateWatcher<PgRunStore>,
    batch_size: i64,
    idle_interval: Duration,
    claim_lease: Duration,
}

enum Resolution {
    Pending,
    Resolved,
    Failed(String),
}

impl ResumptionWorker {
    pub fn new(store: Arc<PgRunStore>, config: &ResumptionConfig) -> Self {
        Self {
            watcher: RunStateWatcher::new(store.clone()),
            store,
            batch_size: config.batch_size,
            idle_interval: Duration::from_millis(config.worker_poll_interval_ms),
            claim_lease: Duration::from_secs(config.claim_lease_secs),
        }
    }

    /// Check every due wait once. Returns how many waits were settled.
    pub async fn run_once(&self) -> AnyResult<usize> {
        let rows = sqlx::query(
            r#"
            UPDATE deferred_waits
            SET next_check_at = NOW() + ($2::bigint * INTERVAL '1 second')
            WHERE id IN (
                SELECT id FROM deferred_waits
                WHERE status = 'waiting'
                  AND next_check_at <= NOW()
                ORDER BY next_check_at ASC
                FOR UPDATE SKIP LOCKED
                LIMIT $1
            )
            RETURNING id, wait_state, created_at
            "#,
        )
        .bind(self.batch_size)
        .bind(i64::try_from(self.claim_lease.as_secs()).context("claim lease is out of range")?)
        .fetch_all(self.store.pool())
        .await
        .context("Failed to claim deferred waits")?;

        let mut settled = 0;
        for row in rows {
            let id: Uuid = row.get("id");
            let state: JsonValue = row.get("wait_state");
            let created_at: DateTime<Utc> = row.get("created_at");

            let (resolution, recheck) = match serde_json::from_value::<DeferredWait>(state) {
                Ok(wait) => (self.check(&wait, created_at).await, wait.poll_interval),
                Err(e) => (
                    Resolution::Failed(format!("Corrupt deferred wait state: {}", e)),
                    self.idle_interval,
                ),
            };

            match resolution {
                Resolution::Pending => match i64::try_from(recheck.as_millis()) {
                    Ok(millis) => self.reschedule(id, millis).await?,
                    Err(_) => {
                        settled += 1;
                        let message = format!("poll_interval {}s is out of range", recheck.as_secs());
                        self.fail(id, message).await?;
                    }
                },
                Resolution::Resolved => {
                    settled += 1;
                    sqlx::query(
                        "UPDATE deferred_waits SET status = 'resolved', resolved_at = NOW() WHERE id = $1",
                    )
                    .bind(id)
                    .execute(self.store.pool())
                    .await
                    .context("Failed to resolve deferred wait")?;
                }
                Resolution::Failed(message) => {
                    settled += 1;
                    self.fail(id, message).await?;
                }
            }
        }

        Ok(settled)
    }

    async fn reschedule(&self, id: Uuid, recheck_millis: i64) -> AnyResult<()> {
        sqlx::query(
            r#"
            UPDATE deferred_waits
            SET next_check_at = NOW() + ($2::bigint * INTERVAL '1 millisecond')
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(recheck_millis)
        .execute(self.store.pool())
        .await
        .context("Failed to reschedule deferred wait")?;
        Ok(())
    }

    async fn fail(&self, id: Uuid, message: String) -> AnyResult<()> {
        warn!(wait_id = %id, error = %message, "Deferred wait failed");
        sqlx::query(
            r#"
            UPDATE deferred_waits
            SET status = 'failed', error = $2, resolved_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(message)
        .execute(self.store.pool())
        .await
        .context("Failed to record deferred wait failure")?;
        Ok(())
    }

    /// Loop over [`run_once`](Self::run_once) until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) -> AnyResult<()> {
        info!("Resumption worker started");

        loop {
            if cancel.is_cancelled() {
                break;
            }

            match self.run_once().await {
                Ok(0) => {}
                Ok(settled) => {
                    debug!(settled, "Resumption pass complete");
                    continue;
                }
                Err(e) => error!("Resumption pass failed: {:#}", e),
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.idle_interval) => {}
            }
        }

        info!("Resumption worker stopped");
        Ok(())
    }

    async fn check(&self, wait: &DeferredWait, parked_at: DateTime<Utc>) -> Resolution {
        let now = Utc::now();
        if wait.is_expired(now) {
            let waited = (now - parked_at).to_std().unwrap_or_default();
            return Resolution::Failed(wait.timeout_error(waited).to_string());
        }

        let event = match self.watcher.observe(wait).await {
            Ok(Some(event)) => event,
            Ok(None) => return Resolution::Pending,
            // Storage trouble: try again on the next pass
            Err(TriggerError::Store(e)) => {
                warn!(run_id = %wait.key.run_id, "Failed to observe run: {:#}", e);
                return Resolution::Pending;
            }
            Err(e) => return Resolution::Failed(e.to_string()),
        };

        match complete_deferred(self.store.as_ref(), wait, &event).await {
            Ok(run) => {
                info!(
                    workflow_id = %run.workflow_id,
                    run_id = %run.run_id,
                    state = %run.state,
                    "Deferred wait resolved"
                );
                Resolution::Resolved
            }
            Err(TriggerError::Store(e)) => {
                warn!(run_id = %wait.key.run_id, "Failed to complete wait: {:#}", e);
                Resolution::Pending
            }
            Err(e) => Resolution::Failed(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{RunStore, RunTransaction};
    use crate::test_helpers::with_test_pool;
    use crate::types::*;
    use crate::waiter::WaitPolicy;
    use chrono::TimeZone;

    async fn parked_wait(pool: &PgPool, policy: WaitPolicy) -> (Arc<PgRunStore>, Uuid, RunIdentity) {
        let store = Arc::new(PgRunStore::new(pool.clone()));
        store.register_workflow("downstream").await.unwrap();

        let identity = RunIdentity {
            workflow_id: "downstream".to_string(),
            run_id: "manual__2019-01-01T00:00:00+00:00".to_string(),
            logical_timestamp: Utc.with_ymd_and_hms(2019, 1, 1, 0, 0, 0).unwrap(),
        };
        let mut tx = store.begin().await.unwrap();
        tx.insert_run(&NewRun::triggered(&identity, RunConf::new()))
            .await
            .unwrap();
        tx.commit().await.unwrap();

        let scheduler = PgResumptionScheduler::new(pool.clone());
        let wait = DeferredWait::new(&identity, &policy, Utc::now()).unwrap();
        let id = scheduler.register_resumption(wait).await.unwrap();
        (store, id, identity)
    }

    #[tokio::test(flavor = "multi_thread")]
    #[ignore] // Requires database
    async fn test_worker_resolves_settled_wait() {
        let pool = with_test_pool().await;
        let (store, id, identity) = parked_wait(&pool, WaitPolicy::default()).await;
        let worker = ResumptionWorker::new(store.clone(), &crate::config::Config::default().resumption);

        // Still queued: wait stays parked
        assert_eq!(worker.run_once().await.unwrap(), 0);

        store
            .set_state("downstream", &identity.run_id, RunState::Success)
            .await
            .unwrap();
        sqlx::query("UPDATE deferred_waits SET next_check_at = NOW()")
            .execute(&*pool)
            .await
            .unwrap();

        assert_eq!(worker.run_once().await.unwrap(), 1);
        let parked = PgResumptionScheduler::new(pool.clone())
            .status(id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(parked.status, "resolved");
    }

    #[tokio::test(flavor = "multi_thread")]
    #[ignore] // Requires database
    async fn test_worker_records_downstream_failure() {
        let pool = with_test_pool().await;
        let (store, id, identity) = parked_wait(&pool, WaitPolicy::default()).await;
        store
            .set_state("downstream", &identity.run_id, RunState::Failed)
            .await
            .unwrap();

        let worker = ResumptionWorker::new(store, &crate::config::Config::default().resumption);
        assert_eq!(worker.run_once().await.unwrap(), 1);

        let parked = PgResumptionScheduler::new(pool.clone())
            .status(id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(parked.status, "failed");
        assert!(parked
            .error
            .unwrap()
            .contains("failed with failed state failed"));
    }

    #[tokio::test(flavor = "multi_thread")]
    #[ignore] // Requires database
    async fn test_worker_runs_on_a_single_connection() {
        use sqlx::postgres::PgPoolOptions;

        let pool = with_test_pool().await;
        let (_, id, identity) = parked_wait(&pool, WaitPolicy::default()).await;
        PgRunStore::new(pool.clone())
            .set_state("downstream", &identity.run_id, RunState::Success)
            .await
            .unwrap();

        let config = crate::config::Config::builder()
            .require_database(true)
            .build()
            .unwrap();
        let single = PgPoolOptions::new()
            .max_connections(1)
            .acquire_timeout(Duration::from_secs(5))
            .connect(config.database_url().unwrap())
            .await
            .unwrap();

        let worker = ResumptionWorker::new(Arc::new(PgRunStore::new(single)), &config.resumption);
        assert_eq!(worker.run_once().await.unwrap(), 1);

        let parked = PgResumptionScheduler::new(pool.clone())
            .status(id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(parked.status, "resolved");
    }

    #[tokio::test(flavor = "multi_thread")]
    #[ignore] // Requires database
    async fn test_claimed_wait_is_leased() {
        let pool = with_test_pool().await;
        let (store, id, _) = parked_wait(&pool, WaitPolicy::default()).await;
        let worker = ResumptionWorker::new(store, &crate::config::Config::default().resumption);

        // Still queued: rescheduled one poll interval out, not due again
        assert_eq!(worker.run_once().await.unwrap(), 0);
        let (due,): (bool,) = sqlx::query_as("SELECT next_check_at <= NOW() FROM deferred_waits WHERE id = $1")
            .bind(id)
            .fetch_one(&*pool)
            .await
            .unwrap();
        assert!(!due);
    }
}
