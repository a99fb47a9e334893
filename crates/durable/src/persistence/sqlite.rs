//! SQLite implementation of ExecutionStore
//!
//! Covers single-node deployments and the minimal SQL dialect: no
//! skip-locking, so claiming relies solely on the timestamp-and-lock-guarded
//! `UPDATE … RETURNING` form. SQLite serializes writers, which makes that
//! single statement atomic between concurrent finders.
//!
//! IDs are stored as hyphenated UUID text, JSON values as text.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::types::Json;
use sqlx::{Row, SqlitePool};
use tracing::{debug, error, instrument};
use uuid::Uuid;

use super::store::*;
use crate::workflow::{execution_backoff, EventType, ExecutionEvent, NewEvent};

/// SQLite implementation of ExecutionStore
///
/// # Example
///
/// ```ignore
/// use windlass_durable::persistence::SqliteExecutionStore;
/// use sqlx::SqlitePool;
///
/// let pool = SqlitePool::connect("sqlite::memory:").await?;
/// let store = SqliteExecutionStore::new(pool);
/// store.migrate().await?;
/// ```
#[derive(Clone)]
pub struct SqliteExecutionStore {
    pool: SqlitePool,
    backoff_base_ms: u64,
    backoff_cap_ms: u64,
}

impl SqliteExecutionStore {
    /// Create a new SQLite store with the given connection pool
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            backoff_base_ms: 1_000,
            backoff_cap_ms: 300_000,
        }
    }

    /// Override the default retry backoff
    pub fn with_backoff(mut self, base_ms: u64, cap_ms: u64) -> Self {
        self.backoff_base_ms = base_ms;
        self.backoff_cap_ms = cap_ms;
        self
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Apply the engine schema
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations/sqlite")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))
    }
}

fn db_err(e: sqlx::Error) -> StoreError {
    StoreError::Database(e.to_string())
}

fn parse_uuid(text: &str) -> Result<Uuid, StoreError> {
    Uuid::parse_str(text).map_err(|e| StoreError::Database(e.to_string()))
}

fn get_uuid(row: &SqliteRow, column: &str) -> Result<Uuid, StoreError> {
    parse_uuid(&row.get::<String, _>(column))
}

fn get_opt_uuid(row: &SqliteRow, column: &str) -> Result<Option<Uuid>, StoreError> {
    row.get::<Option<String>, _>(column)
        .map(|s| parse_uuid(&s))
        .transpose()
}

fn map_execution(row: &SqliteRow) -> Result<Execution, StoreError> {
    let status: String = row.get("status");
    Ok(Execution {
        id: get_uuid(row, "id")?,
        workflow_id: row.get("workflow_id"),
        status: status.parse()?,
        input: row.get::<Json<serde_json::Value>, _>("input").0,
        output: row
            .get::<Option<Json<serde_json::Value>>, _>("output")
            .map(|j| j.0),
        error: row.get("error"),
        retry_count: row.get::<i64, _>("retry_count") as u32,
        max_retries: row.get::<i64, _>("max_retries") as u32,
        lock_id: get_opt_uuid(row, "lock_id")?,
        locked_until_epoch_ms: row.get("locked_until_epoch_ms"),
        next_run_at_epoch_ms: row.get("next_run_at_epoch_ms"),
        started_at_epoch_ms: row.get("started_at_epoch_ms"),
        completed_at_epoch_ms: row.get("completed_at_epoch_ms"),
        parent_execution_id: get_opt_uuid(row, "parent_execution_id")?,
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn map_event(row: &SqliteRow) -> Result<ExecutionEvent, StoreError> {
    let event_type: String = row.get("event_type");
    Ok(ExecutionEvent {
        id: get_uuid(row, "id")?,
        execution_id: get_uuid(row, "execution_id")?,
        event_type: event_type
            .parse()
            .map_err(|e: String| StoreError::Database(e))?,
        name: row.get("name"),
        payload: row
            .get::<Option<Json<serde_json::Value>>, _>("payload")
            .map(|j| j.0),
        created_at: row.get("created_at"),
        visible_at: row.get("visible_at"),
        consumed_at: row.get("consumed_at"),
    })
}

#[async_trait]
impl ExecutionStore for SqliteExecutionStore {
    #[instrument(skip(self, new))]
    async fn create_execution(&self, new: NewExecution) -> Result<Execution, StoreError> {
        let id = Uuid::now_v7();
        let now = Utc::now();
        let row = sqlx::query(
            r#"
            INSERT INTO workflow_executions
                (id, workflow_id, status, input, max_retries, parent_execution_id, created_at, updated_at)
            VALUES (?, ?, 'pending', ?, ?, ?, ?, ?)
            RETURNING *
            "#,
        )
        .bind(id.to_string())
        .bind(&new.workflow_id)
        .bind(Json(&new.input))
        .bind(new.max_retries as i64)
        .bind(new.parent_execution_id.map(|p| p.to_string()))
        .bind(now)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            error!("failed to create execution: {}", e);
            db_err(e)
        })?;

        debug!(%id, workflow_id = %new.workflow_id, "created execution");
        map_execution(&row)
    }

    #[instrument(skip(self))]
    async fn get_execution(&self, id: Uuid) -> Result<Option<Execution>, StoreError> {
        let row = sqlx::query("SELECT * FROM workflow_executions WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;

        row.as_ref().map(map_execution).transpose()
    }

    #[instrument(skip(self))]
    async fn acquire_lease(
        &self,
        id: Uuid,
        lease: Duration,
    ) -> Result<Option<LeasedExecution>, StoreError> {
        let now = Utc::now();
        let now_ms = epoch_ms(now);
        let lock_id = Uuid::new_v4();

        let row = sqlx::query(
            r#"
            UPDATE workflow_executions
            SET lock_id = ?,
                locked_until_epoch_ms = ?,
                status = 'running',
                started_at_epoch_ms = COALESCE(started_at_epoch_ms, ?),
                updated_at = ?
            WHERE id = ?
              AND status IN ('pending', 'running')
              AND retry_count < max_retries
              AND (locked_until_epoch_ms IS NULL OR locked_until_epoch_ms < ?)
            RETURNING *
            "#,
        )
        .bind(lock_id.to_string())
        .bind(now_ms + lease.as_millis() as i64)
        .bind(now_ms)
        .bind(now)
        .bind(id.to_string())
        .bind(now_ms)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            error!("failed to acquire lease: {}", e);
            db_err(e)
        })?;

        match row {
            Some(row) => Ok(Some(LeasedExecution {
                execution: map_execution(&row)?,
                lock_id,
            })),
            None => Ok(None),
        }
    }

    #[instrument(skip(self))]
    async fn release_lease(&self, id: Uuid, lock_id: Uuid) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE workflow_executions
            SET lock_id = NULL, locked_until_epoch_ms = NULL, updated_at = ?
            WHERE id = ? AND lock_id = ?
            "#,
        )
        .bind(Utc::now())
        .bind(id.to_string())
        .bind(lock_id.to_string())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn find_pending(
        &self,
        limit: usize,
        lease: Duration,
        scheduled_before: DateTime<Utc>,
    ) -> Result<Vec<LeasedExecution>, StoreError> {
        let now = Utc::now();
        let now_ms = epoch_ms(now);
        let lock_id = Uuid::new_v4();

        // No SKIP LOCKED on this dialect; SQLite's single-writer model makes
        // the guarded UPDATE atomic between concurrent finders.
        let rows = sqlx::query(
            r#"
            UPDATE workflow_executions
            SET lock_id = ?,
                locked_until_epoch_ms = ?,
                status = 'running',
                started_at_epoch_ms = COALESCE(started_at_epoch_ms, ?),
                updated_at = ?
            WHERE id IN (
                SELECT id FROM workflow_executions
                WHERE status IN ('pending', 'running')
                  AND retry_count < max_retries
                  AND (locked_until_epoch_ms IS NULL OR locked_until_epoch_ms < ?)
                  AND (next_run_at_epoch_ms IS NULL OR next_run_at_epoch_ms <= ?)
                ORDER BY created_at
                LIMIT ?
            )
            RETURNING *
            "#,
        )
        .bind(lock_id.to_string())
        .bind(now_ms + lease.as_millis() as i64)
        .bind(now_ms)
        .bind(now)
        .bind(now_ms)
        .bind(epoch_ms(scheduled_before))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("failed to claim executions: {}", e);
            db_err(e)
        })?;

        let mut leased = Vec::with_capacity(rows.len());
        for row in &rows {
            leased.push(LeasedExecution {
                execution: map_execution(row)?,
                lock_id,
            });
        }
        leased.sort_by_key(|l| l.execution.created_at);
        Ok(leased)
    }

    #[instrument(skip(self, output))]
    async fn complete_execution(
        &self,
        id: Uuid,
        lock_id: Uuid,
        output: serde_json::Value,
    ) -> Result<bool, StoreError> {
        let now = Utc::now();
        let row = sqlx::query(
            r#"
            UPDATE workflow_executions
            SET status = 'completed',
                output = ?,
                error = NULL,
                completed_at_epoch_ms = ?,
                lock_id = NULL,
                locked_until_epoch_ms = NULL,
                updated_at = ?
            WHERE id = ? AND lock_id = ?
              AND status NOT IN ('completed', 'failed', 'cancelled')
            RETURNING id
            "#,
        )
        .bind(Json(&output))
        .bind(epoch_ms(now))
        .bind(now)
        .bind(id.to_string())
        .bind(lock_id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(row.is_some())
    }

    #[instrument(skip(self))]
    async fn fail_execution(
        &self,
        id: Uuid,
        lock_id: Uuid,
        error_text: &str,
        retryable: bool,
        retry_delay: Option<Duration>,
    ) -> Result<FailureOutcome, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT retry_count, max_retries FROM workflow_executions
            WHERE id = ? AND lock_id = ?
              AND status NOT IN ('completed', 'failed', 'cancelled')
            "#,
        )
        .bind(id.to_string())
        .bind(lock_id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        let Some(row) = row else {
            return Ok(FailureOutcome::Lost);
        };

        let retry_count: i64 = row.get("retry_count");
        let max_retries: i64 = row.get("max_retries");
        let now = Utc::now();

        if retryable && retry_count + 1 < max_retries {
            let delay = retry_delay.unwrap_or_else(|| {
                execution_backoff(self.backoff_base_ms, retry_count as u32, self.backoff_cap_ms)
            });
            let next_run_at = now + chrono::Duration::from_std(delay).unwrap_or_default();

            let updated = sqlx::query(
                r#"
                UPDATE workflow_executions
                SET status = 'pending',
                    retry_count = retry_count + 1,
                    error = ?,
                    next_run_at_epoch_ms = ?,
                    lock_id = NULL,
                    locked_until_epoch_ms = NULL,
                    updated_at = ?
                WHERE id = ? AND lock_id = ?
                "#,
            )
            .bind(error_text)
            .bind(epoch_ms(next_run_at))
            .bind(now)
            .bind(id.to_string())
            .bind(lock_id.to_string())
            .execute(&self.pool)
            .await
            .map_err(db_err)?;

            if updated.rows_affected() == 0 {
                return Ok(FailureOutcome::Lost);
            }
            Ok(FailureOutcome::WillRetry { next_run_at })
        } else {
            let updated = sqlx::query(
                r#"
                UPDATE workflow_executions
                SET status = 'failed',
                    error = ?,
                    completed_at_epoch_ms = ?,
                    lock_id = NULL,
                    locked_until_epoch_ms = NULL,
                    updated_at = ?
                WHERE id = ? AND lock_id = ?
                "#,
            )
            .bind(error_text)
            .bind(epoch_ms(now))
            .bind(now)
            .bind(id.to_string())
            .bind(lock_id.to_string())
            .execute(&self.pool)
            .await
            .map_err(db_err)?;

            if updated.rows_affected() == 0 {
                return Ok(FailureOutcome::Lost);
            }
            Ok(FailureOutcome::Terminal)
        }
    }

    #[instrument(skip(self))]
    async fn set_sleeping(
        &self,
        id: Uuid,
        lock_id: Uuid,
        _step: &str,
        _wake_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let row = sqlx::query(
            r#"
            UPDATE workflow_executions
            SET status = 'sleeping',
                lock_id = NULL,
                locked_until_epoch_ms = NULL,
                next_run_at_epoch_ms = NULL,
                updated_at = ?
            WHERE id = ? AND lock_id = ? AND status = 'running'
            RETURNING id
            "#,
        )
        .bind(Utc::now())
        .bind(id.to_string())
        .bind(lock_id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(row.is_some())
    }

    #[instrument(skip(self))]
    async fn set_waiting(
        &self,
        id: Uuid,
        lock_id: Uuid,
        _step: &str,
        _signal_name: &str,
        _timeout_at: Option<DateTime<Utc>>,
    ) -> Result<bool, StoreError> {
        let row = sqlx::query(
            r#"
            UPDATE workflow_executions
            SET status = 'waiting_for_signal',
                lock_id = NULL,
                locked_until_epoch_ms = NULL,
                next_run_at_epoch_ms = NULL,
                updated_at = ?
            WHERE id = ? AND lock_id = ? AND status = 'running'
            RETURNING id
            "#,
        )
        .bind(Utc::now())
        .bind(id.to_string())
        .bind(lock_id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(row.is_some())
    }

    #[instrument(skip(self))]
    async fn cancel_execution(&self, id: Uuid) -> Result<CancelOutcome, StoreError> {
        let now = Utc::now();
        let row = sqlx::query(
            r#"
            UPDATE workflow_executions
            SET status = 'cancelled',
                completed_at_epoch_ms = ?,
                lock_id = NULL,
                locked_until_epoch_ms = NULL,
                updated_at = ?
            WHERE id = ? AND status IN ('pending', 'running', 'sleeping', 'waiting_for_signal')
            RETURNING id
            "#,
        )
        .bind(epoch_ms(now))
        .bind(now)
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        if row.is_some() {
            return Ok(CancelOutcome::Cancelled);
        }

        match self.get_execution(id).await? {
            None => Ok(CancelOutcome::NotFound),
            Some(e) if e.status == ExecutionStatus::Cancelled => Ok(CancelOutcome::AlreadyCancelled),
            Some(_) => Ok(CancelOutcome::NotCancellable),
        }
    }

    #[instrument(skip(self))]
    async fn resume_execution(
        &self,
        id: Uuid,
        reset_retries: bool,
    ) -> Result<ResumeOutcome, StoreError> {
        let row = sqlx::query(
            r#"
            UPDATE workflow_executions
            SET status = 'pending',
                error = NULL,
                completed_at_epoch_ms = NULL,
                retry_count = CASE WHEN ? THEN 0 ELSE retry_count END,
                next_run_at_epoch_ms = NULL,
                lock_id = NULL,
                locked_until_epoch_ms = NULL,
                updated_at = ?
            WHERE id = ? AND status IN ('cancelled', 'failed')
            RETURNING id
            "#,
        )
        .bind(reset_retries)
        .bind(Utc::now())
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        if row.is_some() {
            return Ok(ResumeOutcome::Resumed);
        }

        match self.get_execution(id).await? {
            None => Ok(ResumeOutcome::NotFound),
            Some(_) => Ok(ResumeOutcome::NotResumable),
        }
    }

    #[instrument(skip(self))]
    async fn reschedule(&self, id: Uuid, run_at: DateTime<Utc>) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE workflow_executions
            SET next_run_at_epoch_ms = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(epoch_ms(run_at))
        .bind(Utc::now())
        .bind(id.to_string())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::ExecutionNotFound(id));
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn wake_due(&self, now: DateTime<Utc>, limit: usize) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE workflow_executions
            SET status = 'pending', next_run_at_epoch_ms = NULL, updated_at = ?
            WHERE id IN (
                SELECT e.id
                FROM workflow_executions e
                WHERE e.status IN ('sleeping', 'waiting_for_signal')
                  AND EXISTS (
                      SELECT 1 FROM workflow_events ev
                      WHERE ev.execution_id = e.id
                        AND ev.event_type = 'timer'
                        AND ev.consumed_at IS NULL
                        AND ev.visible_at <= ?
                  )
                LIMIT ?
            )
            "#,
        )
        .bind(now)
        .bind(now)
        .bind(limit as i64)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(result.rows_affected())
    }

    #[instrument(skip(self))]
    async fn wake_for_signal(&self, id: Uuid) -> Result<bool, StoreError> {
        let row = sqlx::query(
            r#"
            UPDATE workflow_executions
            SET status = 'pending', next_run_at_epoch_ms = NULL, updated_at = ?
            WHERE id = ? AND status = 'waiting_for_signal'
            RETURNING id
            "#,
        )
        .bind(Utc::now())
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(row.is_some())
    }

    #[instrument(skip(self, patch))]
    async fn upsert_step_result(
        &self,
        execution_id: Uuid,
        step_id: &str,
        patch: StepResultPatch,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO execution_step_results
                (execution_id, step_id, attempt, started_at, completed_at, output, error)
            VALUES (?1, ?2, COALESCE(?3, 0), ?4, ?5, ?6, ?7)
            ON CONFLICT (execution_id, step_id) DO UPDATE SET
                attempt = COALESCE(?3, attempt),
                started_at = COALESCE(started_at, ?4),
                completed_at = COALESCE(?5, completed_at),
                output = COALESCE(?6, output),
                error = CASE WHEN ?8 THEN NULL ELSE COALESCE(?7, error) END
            "#,
        )
        .bind(execution_id.to_string())
        .bind(step_id)
        .bind(patch.attempt.map(|a| a as i64))
        .bind(patch.started_at)
        .bind(patch.completed_at)
        .bind(patch.output.as_ref().map(Json))
        .bind(&patch.error)
        .bind(patch.clear_error)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("failed to upsert step result: {}", e);
            db_err(e)
        })?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn step_results(&self, execution_id: Uuid) -> Result<Vec<StepResult>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT execution_id, step_id, attempt, started_at, completed_at, output, error
            FROM execution_step_results
            WHERE execution_id = ?
            ORDER BY started_at
            "#,
        )
        .bind(execution_id.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        let mut results = Vec::with_capacity(rows.len());
        for row in &rows {
            results.push(StepResult {
                execution_id: get_uuid(row, "execution_id")?,
                step_id: row.get("step_id"),
                attempt: row.get::<i64, _>("attempt") as u32,
                started_at: row.get("started_at"),
                completed_at: row.get("completed_at"),
                output: row
                    .get::<Option<Json<serde_json::Value>>, _>("output")
                    .map(|j| j.0),
                error: row.get("error"),
            });
        }
        Ok(results)
    }

    #[instrument(skip(self, event))]
    async fn append_event(
        &self,
        execution_id: Uuid,
        event: NewEvent,
    ) -> Result<ExecutionEvent, StoreError> {
        if event.event_type == EventType::Timer {
            let step = event.name.clone().unwrap_or_default();
            let wake_at = event.visible_at.unwrap_or_else(Utc::now);
            self.schedule_timer(execution_id, &step, wake_at).await?;
            return self
                .timer_row(execution_id, &step)
                .await?
                .ok_or(StoreError::ExecutionNotFound(execution_id));
        }

        let id = Uuid::now_v7();
        let event_type = event.event_type.to_string();

        if event.event_type == EventType::Output {
            sqlx::query(
                r#"
                INSERT INTO workflow_events (id, execution_id, event_type, name, payload, created_at)
                VALUES (?, ?, 'output', ?, ?, ?)
                ON CONFLICT (execution_id, name) WHERE event_type = 'output' DO NOTHING
                "#,
            )
            .bind(id.to_string())
            .bind(execution_id.to_string())
            .bind(&event.name)
            .bind(event.payload.as_ref().map(Json))
            .bind(Utc::now())
            .execute(&self.pool)
            .await
            .map_err(db_err)?;

            let row = sqlx::query(
                r#"
                SELECT * FROM workflow_events
                WHERE execution_id = ? AND event_type = 'output' AND name = ?
                "#,
            )
            .bind(execution_id.to_string())
            .bind(&event.name)
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)?;
            return map_event(&row);
        }

        let row = sqlx::query(
            r#"
            INSERT INTO workflow_events (id, execution_id, event_type, name, payload, created_at, visible_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            RETURNING *
            "#,
        )
        .bind(id.to_string())
        .bind(execution_id.to_string())
        .bind(&event_type)
        .bind(&event.name)
        .bind(event.payload.as_ref().map(Json))
        .bind(Utc::now())
        .bind(event.visible_at)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;

        map_event(&row)
    }

    #[instrument(skip(self))]
    async fn events(&self, execution_id: Uuid) -> Result<Vec<ExecutionEvent>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM workflow_events
            WHERE execution_id = ?
            ORDER BY created_at, id
            "#,
        )
        .bind(execution_id.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter().map(map_event).collect()
    }

    #[instrument(skip(self))]
    async fn pending_signals(
        &self,
        execution_id: Uuid,
    ) -> Result<Vec<ExecutionEvent>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM workflow_events
            WHERE execution_id = ? AND event_type = 'signal' AND consumed_at IS NULL
            ORDER BY created_at, id
            "#,
        )
        .bind(execution_id.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter().map(map_event).collect()
    }

    #[instrument(skip(self))]
    async fn consume_event(&self, event_id: Uuid) -> Result<bool, StoreError> {
        let row = sqlx::query(
            r#"
            UPDATE workflow_events
            SET consumed_at = ?
            WHERE id = ? AND consumed_at IS NULL
            RETURNING id
            "#,
        )
        .bind(Utc::now())
        .bind(event_id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(row.is_some())
    }

    #[instrument(skip(self))]
    async fn check_timer(
        &self,
        execution_id: Uuid,
        step: &str,
    ) -> Result<Option<ExecutionEvent>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT * FROM workflow_events
            WHERE execution_id = ?
              AND event_type = 'timer'
              AND name = ?
              AND consumed_at IS NULL
              AND visible_at <= ?
            "#,
        )
        .bind(execution_id.to_string())
        .bind(step)
        .bind(Utc::now())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        row.as_ref().map(map_event).transpose()
    }

    #[instrument(skip(self))]
    async fn schedule_timer(
        &self,
        execution_id: Uuid,
        step: &str,
        wake_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO workflow_events (id, execution_id, event_type, name, created_at, visible_at)
            VALUES (?, ?, 'timer', ?, ?, ?)
            ON CONFLICT (execution_id, name) WHERE event_type = 'timer' DO NOTHING
            "#,
        )
        .bind(Uuid::now_v7().to_string())
        .bind(execution_id.to_string())
        .bind(step)
        .bind(Utc::now())
        .bind(wake_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn cancel_timer(&self, execution_id: Uuid, step: &str) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE workflow_events
            SET consumed_at = ?
            WHERE execution_id = ? AND event_type = 'timer' AND name = ? AND consumed_at IS NULL
            "#,
        )
        .bind(Utc::now())
        .bind(execution_id.to_string())
        .bind(step)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    #[instrument(skip(self, data))]
    async fn append_stream_chunk(
        &self,
        execution_id: Uuid,
        step_id: &str,
        chunk_index: u32,
        data: serde_json::Value,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO step_stream_chunks (execution_id, step_id, chunk_index, data, created_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT (execution_id, step_id, chunk_index) DO NOTHING
            "#,
        )
        .bind(execution_id.to_string())
        .bind(step_id)
        .bind(chunk_index as i64)
        .bind(Json(&data))
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn stream_chunks(
        &self,
        execution_id: Uuid,
        step_id: &str,
    ) -> Result<Vec<StepStreamChunk>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT execution_id, step_id, chunk_index, data
            FROM step_stream_chunks
            WHERE execution_id = ? AND step_id = ?
            ORDER BY chunk_index
            "#,
        )
        .bind(execution_id.to_string())
        .bind(step_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        let mut chunks = Vec::with_capacity(rows.len());
        for row in &rows {
            chunks.push(StepStreamChunk {
                execution_id: get_uuid(row, "execution_id")?,
                step_id: row.get("step_id"),
                chunk_index: row.get::<i64, _>("chunk_index") as u32,
                data: row.get::<Json<serde_json::Value>, _>("data").0,
            });
        }
        Ok(chunks)
    }

    #[instrument(skip(self))]
    async fn clear_stream_chunks(
        &self,
        execution_id: Uuid,
        step_id: &str,
    ) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM step_stream_chunks WHERE execution_id = ? AND step_id = ?")
            .bind(execution_id.to_string())
            .bind(step_id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }
}

impl SqliteExecutionStore {
    async fn timer_row(
        &self,
        execution_id: Uuid,
        step: &str,
    ) -> Result<Option<ExecutionEvent>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT * FROM workflow_events
            WHERE execution_id = ? AND event_type = 'timer' AND name = ?
            "#,
        )
        .bind(execution_id.to_string())
        .bind(step)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        row.as_ref().map(map_event).transpose()
    }
}
