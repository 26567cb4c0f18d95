use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};

use super::{InsertOutcome, RunStore, RunTransaction};
use crate::types::*;

/// Postgres-backed run store. Uniqueness of `(workflow_id, run_id)` and
/// `(workflow_id, logical_timestamp)` is enforced by unique indexes.
#[derive(Clone)]
pub struct PgRunStore {
    pool: PgPool,
}

impl PgRunStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

pub struct PgRunTransaction {
    tx: Transaction<'static, Postgres>,
}

fn run_from_row(row: &PgRow) -> Result<RunRecord> {
    let conf: JsonValue = row.get("conf");
    let conf = match conf {
        JsonValue::Object(map) => map,
        JsonValue::Null => RunConf::new(),
        other => anyhow::bail!("Stored conf is not a JSON object: {}", other),
    };

    Ok(RunRecord {
        workflow_id: row.get("workflow_id"),
        run_id: row.get("run_id"),
        logical_timestamp: row.get("logical_timestamp"),
        run_kind: row.get("run_kind"),
        state: row.get("state"),
        external_trigger: row.get("external_trigger"),
        conf,
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

#[async_trait]
impl RunTransaction for PgRunTransaction {
    async fn find_conflicting(
        &mut self,
        workflow_id: &str,
        run_id: &str,
        logical_timestamp: DateTime<Utc>,
    ) -> Result<Option<RunRecord>> {
        // Lock the row so a concurrent reset cannot interleave with ours
        let row = sqlx::query(
            r#"
            SELECT * FROM workflow_runs
            WHERE workflow_id = $1
              AND (run_id = $2 OR logical_timestamp = $3)
            ORDER BY (run_id = $2) DESC
            LIMIT 1
            FOR UPDATE
            "#,
        )
        .bind(workflow_id)
        .bind(run_id)
        .bind(logical_timestamp)
        .fetch_optional(&mut *self.tx)
        .await
        .context("Failed to look up existing run")?;

        row.as_ref().map(run_from_row).transpose()
    }

    async fn insert_run(&mut self, run: &NewRun) -> Result<InsertOutcome> {
        // Either unique index rejecting the row yields no RETURNING row
        let row = sqlx::query(
            r#"
            INSERT INTO workflow_runs (
                workflow_id, run_id, logical_timestamp, run_kind,
                state, external_trigger, conf
            ) VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT DO NOTHING
            RETURNING *
            "#,
        )
        .bind(&run.workflow_id)
        .bind(&run.run_id)
        .bind(run.logical_timestamp)
        .bind(run.run_kind)
        .bind(run.state)
        .bind(run.external_trigger)
        .bind(JsonValue::Object(run.conf.clone()))
        .fetch_optional(&mut *self.tx)
        .await
        .context("Failed to create run")?;

        match row {
            Some(row) => Ok(InsertOutcome::Inserted(run_from_row(&row)?)),
            None => Ok(InsertOutcome::Conflict),
        }
    }

    async fn reset_run(&mut self, run: &RunRecord, conf: &RunConf) -> Result<RunRecord> {
        sqlx::query("DELETE FROM task_instances WHERE workflow_id = $1 AND run_id = $2")
            .bind(&run.workflow_id)
            .bind(&run.run_id)
            .execute(&mut *self.tx)
            .await
            .context("Failed to clear task instance history")?;

        let row = sqlx::query(
            r#"
            UPDATE workflow_runs
            SET state = 'queued',
                external_trigger = TRUE,
                conf = $3,
                updated_at = NOW()
            WHERE workflow_id = $1 AND run_id = $2
            RETURNING *
            "#,
        )
        .bind(&run.workflow_id)
        .bind(&run.run_id)
        .bind(JsonValue::Object(conf.clone()))
        .fetch_one(&mut *self.tx)
        .await
        .context("Failed to reset run")?;

        run_from_row(&row)
    }

    async fn record_audit(&mut self, entry: &AuditEntry) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO audit_log (event, source, target, run_id)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(entry.event)
        .bind(&entry.source)
        .bind(&entry.target)
        .bind(&entry.run_id)
        .execute(&mut *self.tx)
        .await
        .context("Failed to write audit log entry")?;

        Ok(())
    }

    async fn commit(self) -> Result<()> {
        self.tx.commit().await.context("Failed to commit transaction")
    }
}

#[async_trait]
impl RunStore for PgRunStore {
    type Tx = PgRunTransaction;

    async fn begin(&self) -> Result<PgRunTransaction> {
        let tx = self
            .pool
            .begin()
            .await
            .context("Failed to begin transaction")?;
        Ok(PgRunTransaction { tx })
    }

    async fn workflow_exists(&self, workflow_id: &str) -> Result<bool> {
        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM workflows WHERE workflow_id = $1)")
                .bind(workflow_id)
                .fetch_one(&self.pool)
                .await
                .context("Failed to check workflow existence")?;
        Ok(exists)
    }

    async fn register_workflow(&self, workflow_id: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO workflows (workflow_id)
            VALUES ($1)
            ON CONFLICT (workflow_id) DO NOTHING
            "#,
        )
        .bind(workflow_id)
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to register workflow '{}'", workflow_id))?;
        Ok(())
    }

    async fn get_run(&self, workflow_id: &str, run_id: &str) -> Result<Option<RunRecord>> {
        let row = sqlx::query("SELECT * FROM workflow_runs WHERE workflow_id = $1 AND run_id = $2")
            .bind(workflow_id)
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to get run")?;

        row.as_ref().map(run_from_row).transpose()
    }

    async fn get_run_by_logical_timestamp(
        &self,
        workflow_id: &str,
        logical_timestamp: DateTime<Utc>,
    ) -> Result<Option<RunRecord>> {
        let row = sqlx::query(
            "SELECT * FROM workflow_runs WHERE workflow_id = $1 AND logical_timestamp = $2",
        )
        .bind(workflow_id)
        .bind(logical_timestamp)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to get run by logical timestamp")?;

        row.as_ref().map(run_from_row).transpose()
    }

    async fn list_runs(&self, filter: RunListFilter) -> Result<Vec<RunRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM workflow_runs
            WHERE workflow_id = $1
              AND ($2::text IS NULL OR state = $2)
            ORDER BY logical_timestamp ASC
            LIMIT $3
            "#,
        )
        .bind(&filter.workflow_id)
        .bind(filter.state.map(|s| s.as_str()))
        .bind(filter.limit)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list runs")?;

        rows.iter().map(run_from_row).collect()
    }

    async fn set_state(&self, workflow_id: &str, run_id: &str, state: RunState) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE workflow_runs
            SET state = $3, updated_at = NOW()
            WHERE workflow_id = $1 AND run_id = $2
            "#,
        )
        .bind(workflow_id)
        .bind(run_id)
        .bind(state)
        .execute(&self.pool)
        .await
        .context("Failed to update run state")?;

        Ok(result.rows_affected() > 0)
    }

    async fn record_task_instance(&self, task: &TaskInstance) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO task_instances (workflow_id, run_id, task_id, state, try_number)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (workflow_id, run_id, task_id, try_number)
            DO UPDATE SET state = EXCLUDED.state
            "#,
        )
        .bind(&task.workflow_id)
        .bind(&task.run_id)
        .bind(&task.task_id)
        .bind(task.state)
        .bind(task.try_number)
        .execute(&self.pool)
        .await
        .context("Failed to record task instance")?;
        Ok(())
    }

    async fn task_instances(&self, workflow_id: &str, run_id: &str) -> Result<Vec<TaskInstance>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM task_instances
            WHERE workflow_id = $1 AND run_id = $2
            ORDER BY task_id ASC, try_number ASC
            "#,
        )
        .bind(workflow_id)
        .bind(run_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to get task instances")?;

        Ok(rows
            .iter()
            .map(|row| TaskInstance {
                workflow_id: row.get("workflow_id"),
                run_id: row.get("run_id"),
                task_id: row.get("task_id"),
                state: row.get("state"),
                try_number: row.get("try_number"),
            })
            .collect())
    }

    async fn audit_entries(&self, target: &str) -> Result<Vec<AuditEntry>> {
        let rows = sqlx::query(
            "SELECT event, source, target, run_id FROM audit_log WHERE target = $1 ORDER BY id ASC",
        )
        .bind(target)
        .fetch_all(&self.pool)
        .await
        .context("Failed to get audit log entries")?;

        Ok(rows
            .iter()
            .map(|row| AuditEntry {
                event: row.get("event"),
                source: row.get("source"),
                target: row.get("target"),
                run_id: row.get("run_id"),
            })
            .collect())
    }
}
