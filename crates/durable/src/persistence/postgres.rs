//! PostgreSQL implementation of ExecutionStore
//!
//! Production persistence using PostgreSQL with:
//! - Optimistic leases via guarded single-statement updates
//! - Batch claiming with FOR UPDATE SKIP LOCKED
//! - Idempotent timer and output events via partial unique indices

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::{debug, error, instrument};
use uuid::Uuid;

use super::store::*;
use crate::workflow::{execution_backoff, EventType, ExecutionEvent, NewEvent};

/// PostgreSQL implementation of ExecutionStore
///
/// Uses a connection pool for efficient access; safe to clone and share
/// between schedulers and workers.
///
/// # Example
///
/// ```ignore
/// use windlass_durable::persistence::PostgresExecutionStore;
/// use sqlx::PgPool;
///
/// let pool = PgPool::connect("postgres://localhost/windlass").await?;
/// let store = PostgresExecutionStore::new(pool);
/// store.migrate().await?;
/// ```
#[derive(Clone)]
pub struct PostgresExecutionStore {
    pool: PgPool,
    backoff_base_ms: u64,
    backoff_cap_ms: u64,
}

impl PostgresExecutionStore {
    /// Create a new PostgreSQL store with the given connection pool
    pub fn new(pool: PgPool) -> Self {
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
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the engine schema
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations/postgres")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))
    }
}

fn db_err(e: sqlx::Error) -> StoreError {
    StoreError::Database(e.to_string())
}

fn map_execution(row: &PgRow) -> Result<Execution, StoreError> {
    let status: String = row.get("status");
    Ok(Execution {
        id: row.get("id"),
        workflow_id: row.get("workflow_id"),
        status: status.parse()?,
        input: row.get("input"),
        output: row.get("output"),
        error: row.get("error"),
        retry_count: row.get::<i32, _>("retry_count") as u32,
        max_retries: row.get::<i32, _>("max_retries") as u32,
        lock_id: row.get("lock_id"),
        locked_until_epoch_ms: row.get("locked_until_epoch_ms"),
        next_run_at_epoch_ms: row.get("next_run_at_epoch_ms"),
        started_at_epoch_ms: row.get("started_at_epoch_ms"),
        completed_at_epoch_ms: row.get("completed_at_epoch_ms"),
        parent_execution_id: row.get("parent_execution_id"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn map_event(row: &PgRow) -> Result<ExecutionEvent, StoreError> {
    let event_type: String = row.get("event_type");
    Ok(ExecutionEvent {
        id: row.get("id"),
        execution_id: row.get("execution_id"),
        event_type: event_type
            .parse()
            .map_err(|e: String| StoreError::Database(e))?,
        name: row.get("name"),
        payload: row.get("payload"),
        created_at: row.get("created_at"),
        visible_at: row.get("visible_at"),
        consumed_at: row.get("consumed_at"),
    })
}

const TERMINAL: &str = "('completed', 'failed', 'cancelled')";

#[async_trait]
impl ExecutionStore for PostgresExecutionStore {
    #[instrument(skip(self, new))]
    async fn create_execution(&self, new: NewExecution) -> Result<Execution, StoreError> {
        let id = Uuid::now_v7();
        let row = sqlx::query(
            r#"
            INSERT INTO workflow_executions (id, workflow_id, status, input, max_retries, parent_execution_id)
            VALUES ($1, $2, 'pending', $3, $4, $5)
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(&new.workflow_id)
        .bind(&new.input)
        .bind(new.max_retries as i32)
        .bind(new.parent_execution_id)
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
        let row = sqlx::query("SELECT * FROM workflow_executions WHERE id = $1")
            .bind(id)
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
        let now_ms = epoch_ms(Utc::now());
        let lock_id = Uuid::new_v4();

        let row = sqlx::query(
            r#"
            UPDATE workflow_executions
            SET lock_id = $2,
                locked_until_epoch_ms = $3,
                status = 'running',
                started_at_epoch_ms = COALESCE(started_at_epoch_ms, $4),
                updated_at = NOW()
            WHERE id = $1
              AND status IN ('pending', 'running')
              AND retry_count < max_retries
              AND (locked_until_epoch_ms IS NULL OR locked_until_epoch_ms < $4)
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(lock_id)
        .bind(now_ms + lease.as_millis() as i64)
        .bind(now_ms)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            error!("failed to acquire lease: {}", e);
            db_err(e)
        })?;

        match row {
            Some(row) => {
                debug!(%id, %lock_id, "acquired lease");
                Ok(Some(LeasedExecution {
                    execution: map_execution(&row)?,
                    lock_id,
                }))
            }
            None => Ok(None),
        }
    }

    #[instrument(skip(self))]
    async fn release_lease(&self, id: Uuid, lock_id: Uuid) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE workflow_executions
            SET lock_id = NULL, locked_until_epoch_ms = NULL, updated_at = NOW()
            WHERE id = $1 AND lock_id = $2
            "#,
        )
        .bind(id)
        .bind(lock_id)
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
        let now_ms = epoch_ms(Utc::now());
        let lock_id = Uuid::new_v4();

        // SKIP LOCKED keeps concurrent finders from observing the same row;
        // the claiming UPDATE is the same guarded form as acquire_lease.
        let rows = sqlx::query(
            r#"
            WITH claimable AS (
                SELECT id
                FROM workflow_executions
                WHERE status IN ('pending', 'running')
                  AND retry_count < max_retries
                  AND (locked_until_epoch_ms IS NULL OR locked_until_epoch_ms < $1)
                  AND (next_run_at_epoch_ms IS NULL OR next_run_at_epoch_ms <= $2)
                ORDER BY created_at
                LIMIT $3
                FOR UPDATE SKIP LOCKED
            )
            UPDATE workflow_executions e
            SET lock_id = $4,
                locked_until_epoch_ms = $5,
                status = 'running',
                started_at_epoch_ms = COALESCE(e.started_at_epoch_ms, $1),
                updated_at = NOW()
            FROM claimable c
            WHERE e.id = c.id
            RETURNING e.*
            "#,
        )
        .bind(now_ms)
        .bind(epoch_ms(scheduled_before))
        .bind(limit as i64)
        .bind(lock_id)
        .bind(now_ms + lease.as_millis() as i64)
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

        if !leased.is_empty() {
            debug!(count = leased.len(), "claimed executions");
        }
        Ok(leased)
    }

    #[instrument(skip(self, output))]
    async fn complete_execution(
        &self,
        id: Uuid,
        lock_id: Uuid,
        output: serde_json::Value,
    ) -> Result<bool, StoreError> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE workflow_executions
            SET status = 'completed',
                output = $3,
                error = NULL,
                completed_at_epoch_ms = $4,
                lock_id = NULL,
                locked_until_epoch_ms = NULL,
                updated_at = NOW()
            WHERE id = $1 AND lock_id = $2 AND status NOT IN {TERMINAL}
            RETURNING id
            "#
        ))
        .bind(id)
        .bind(lock_id)
        .bind(&output)
        .bind(epoch_ms(Utc::now()))
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        if row.is_some() {
            debug!(%id, "completed execution");
        }
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
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let row = sqlx::query(&format!(
            r#"
            SELECT retry_count, max_retries FROM workflow_executions
            WHERE id = $1 AND lock_id = $2 AND status NOT IN {TERMINAL}
            FOR UPDATE
            "#
        ))
        .bind(id)
        .bind(lock_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?;

        let Some(row) = row else {
            // Another owner took over; the write is absorbed
            return Ok(FailureOutcome::Lost);
        };

        let retry_count: i32 = row.get("retry_count");
        let max_retries: i32 = row.get("max_retries");
        let now = Utc::now();

        let outcome = if retryable && retry_count + 1 < max_retries {
            let delay = retry_delay.unwrap_or_else(|| {
                execution_backoff(self.backoff_base_ms, retry_count as u32, self.backoff_cap_ms)
            });
            let next_run_at = now + chrono::Duration::from_std(delay).unwrap_or_default();

            sqlx::query(
                r#"
                UPDATE workflow_executions
                SET status = 'pending',
                    retry_count = retry_count + 1,
                    error = $2,
                    next_run_at_epoch_ms = $3,
                    lock_id = NULL,
                    locked_until_epoch_ms = NULL,
                    updated_at = NOW()
                WHERE id = $1
                "#,
            )
            .bind(id)
            .bind(error_text)
            .bind(epoch_ms(next_run_at))
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

            debug!(%id, next_attempt = retry_count + 1, "execution will retry");
            FailureOutcome::WillRetry { next_run_at }
        } else {
            sqlx::query(
                r#"
                UPDATE workflow_executions
                SET status = 'failed',
                    error = $2,
                    completed_at_epoch_ms = $3,
                    lock_id = NULL,
                    locked_until_epoch_ms = NULL,
                    updated_at = NOW()
                WHERE id = $1
                "#,
            )
            .bind(id)
            .bind(error_text)
            .bind(epoch_ms(now))
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

            debug!(%id, "execution terminally failed");
            FailureOutcome::Terminal
        };

        tx.commit().await.map_err(db_err)?;
        Ok(outcome)
    }

    #[instrument(skip(self))]
    async fn set_sleeping(
        &self,
        id: Uuid,
        lock_id: Uuid,
        step: &str,
        _wake_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let row = sqlx::query(
            r#"
            UPDATE workflow_executions
            SET status = 'sleeping',
                lock_id = NULL,
                locked_until_epoch_ms = NULL,
                next_run_at_epoch_ms = NULL,
                updated_at = NOW()
            WHERE id = $1 AND lock_id = $2 AND status = 'running'
            RETURNING id
            "#,
        )
        .bind(id)
        .bind(lock_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        if row.is_some() {
            debug!(%id, step, "execution sleeping");
        }
        Ok(row.is_some())
    }

    #[instrument(skip(self))]
    async fn set_waiting(
        &self,
        id: Uuid,
        lock_id: Uuid,
        step: &str,
        signal_name: &str,
        _timeout_at: Option<DateTime<Utc>>,
    ) -> Result<bool, StoreError> {
        let row = sqlx::query(
            r#"
            UPDATE workflow_executions
            SET status = 'waiting_for_signal',
                lock_id = NULL,
                locked_until_epoch_ms = NULL,
                next_run_at_epoch_ms = NULL,
                updated_at = NOW()
            WHERE id = $1 AND lock_id = $2 AND status = 'running'
            RETURNING id
            "#,
        )
        .bind(id)
        .bind(lock_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        if row.is_some() {
            debug!(%id, step, signal_name, "execution waiting for signal");
        }
        Ok(row.is_some())
    }

    #[instrument(skip(self))]
    async fn cancel_execution(&self, id: Uuid) -> Result<CancelOutcome, StoreError> {
        let row = sqlx::query(
            r#"
            UPDATE workflow_executions
            SET status = 'cancelled',
                completed_at_epoch_ms = $2,
                lock_id = NULL,
                locked_until_epoch_ms = NULL,
                updated_at = NOW()
            WHERE id = $1 AND status IN ('pending', 'running', 'sleeping', 'waiting_for_signal')
            RETURNING id
            "#,
        )
        .bind(id)
        .bind(epoch_ms(Utc::now()))
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        if row.is_some() {
            debug!(%id, "cancelled execution");
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
                retry_count = CASE WHEN $2 THEN 0 ELSE retry_count END,
                next_run_at_epoch_ms = NULL,
                lock_id = NULL,
                locked_until_epoch_ms = NULL,
                updated_at = NOW()
            WHERE id = $1 AND status IN ('cancelled', 'failed')
            RETURNING id
            "#,
        )
        .bind(id)
        .bind(reset_retries)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        if row.is_some() {
            debug!(%id, reset_retries, "resumed execution");
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
            SET next_run_at_epoch_ms = $2, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(epoch_ms(run_at))
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
            SET status = 'pending', next_run_at_epoch_ms = NULL, updated_at = NOW()
            WHERE id IN (
                SELECT e.id
                FROM workflow_executions e
                WHERE e.status IN ('sleeping', 'waiting_for_signal')
                  AND EXISTS (
                      SELECT 1 FROM workflow_events ev
                      WHERE ev.execution_id = e.id
                        AND ev.event_type = 'timer'
                        AND ev.consumed_at IS NULL
                        AND ev.visible_at <= $1
                  )
                LIMIT $2
            )
            "#,
        )
        .bind(now)
        .bind(limit as i64)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("failed to wake due executions: {}", e);
            db_err(e)
        })?;

        let woken = result.rows_affected();
        if woken > 0 {
            debug!(woken, "woke suspended executions");
        }
        Ok(woken)
    }

    #[instrument(skip(self))]
    async fn wake_for_signal(&self, id: Uuid) -> Result<bool, StoreError> {
        let row = sqlx::query(
            r#"
            UPDATE workflow_executions
            SET status = 'pending', next_run_at_epoch_ms = NULL, updated_at = NOW()
            WHERE id = $1 AND status = 'waiting_for_signal'
            RETURNING id
            "#,
        )
        .bind(id)
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
            VALUES ($1, $2, COALESCE($3, 0), $4, $5, $6, $7)
            ON CONFLICT (execution_id, step_id) DO UPDATE SET
                attempt = COALESCE($3, execution_step_results.attempt),
                started_at = COALESCE(execution_step_results.started_at, $4),
                completed_at = COALESCE($5, execution_step_results.completed_at),
                output = COALESCE($6, execution_step_results.output),
                error = CASE
                    WHEN $8 THEN NULL
                    ELSE COALESCE($7, execution_step_results.error)
                END
            "#,
        )
        .bind(execution_id)
        .bind(step_id)
        .bind(patch.attempt.map(|a| a as i32))
        .bind(patch.started_at)
        .bind(patch.completed_at)
        .bind(&patch.output)
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
            WHERE execution_id = $1
            ORDER BY started_at
            "#,
        )
        .bind(execution_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(rows
            .into_iter()
            .map(|row| StepResult {
                execution_id: row.get("execution_id"),
                step_id: row.get("step_id"),
                attempt: row.get::<i32, _>("attempt") as u32,
                started_at: row.get("started_at"),
                completed_at: row.get("completed_at"),
                output: row.get("output"),
                error: row.get("error"),
            })
            .collect())
    }

    #[instrument(skip(self, event))]
    async fn append_event(
        &self,
        execution_id: Uuid,
        event: NewEvent,
    ) -> Result<ExecutionEvent, StoreError> {
        if event.event_type == EventType::Timer {
            // Timers have their own idempotent path
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
            let row = sqlx::query(
                r#"
                INSERT INTO workflow_events (id, execution_id, event_type, name, payload, visible_at)
                VALUES ($1, $2, 'output', $3, $4, NULL)
                ON CONFLICT (execution_id, name) WHERE event_type = 'output' DO NOTHING
                RETURNING *
                "#,
            )
            .bind(id)
            .bind(execution_id)
            .bind(&event.name)
            .bind(&event.payload)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;

            if let Some(row) = row {
                return map_event(&row);
            }

            // Lost the race or a replayed append: return the existing row
            let row = sqlx::query(
                r#"
                SELECT * FROM workflow_events
                WHERE execution_id = $1 AND event_type = 'output' AND name = $2
                "#,
            )
            .bind(execution_id)
            .bind(&event.name)
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)?;
            return map_event(&row);
        }

        let row = sqlx::query(
            r#"
            INSERT INTO workflow_events (id, execution_id, event_type, name, payload, visible_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(execution_id)
        .bind(&event_type)
        .bind(&event.name)
        .bind(&event.payload)
        .bind(event.visible_at)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            error!("failed to append event: {}", e);
            db_err(e)
        })?;

        map_event(&row)
    }

    #[instrument(skip(self))]
    async fn events(&self, execution_id: Uuid) -> Result<Vec<ExecutionEvent>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM workflow_events
            WHERE execution_id = $1
            ORDER BY created_at, id
            "#,
        )
        .bind(execution_id)
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
            WHERE execution_id = $1 AND event_type = 'signal' AND consumed_at IS NULL
            ORDER BY created_at, id
            "#,
        )
        .bind(execution_id)
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
            SET consumed_at = NOW()
            WHERE id = $1 AND consumed_at IS NULL
            RETURNING id
            "#,
        )
        .bind(event_id)
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
            WHERE execution_id = $1
              AND event_type = 'timer'
              AND name = $2
              AND consumed_at IS NULL
              AND visible_at <= NOW()
            "#,
        )
        .bind(execution_id)
        .bind(step)
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
            INSERT INTO workflow_events (id, execution_id, event_type, name, visible_at)
            VALUES ($1, $2, 'timer', $3, $4)
            ON CONFLICT (execution_id, name) WHERE event_type = 'timer' DO NOTHING
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(execution_id)
        .bind(step)
        .bind(wake_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("failed to schedule timer: {}", e);
            db_err(e)
        })?;

        debug!(%execution_id, step, %wake_at, "scheduled timer");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn cancel_timer(&self, execution_id: Uuid, step: &str) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE workflow_events
            SET consumed_at = NOW()
            WHERE execution_id = $1 AND event_type = 'timer' AND name = $2 AND consumed_at IS NULL
            "#,
        )
        .bind(execution_id)
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
            INSERT INTO step_stream_chunks (execution_id, step_id, chunk_index, data)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (execution_id, step_id, chunk_index) DO NOTHING
            "#,
        )
        .bind(execution_id)
        .bind(step_id)
        .bind(chunk_index as i32)
        .bind(&data)
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
            WHERE execution_id = $1 AND step_id = $2
            ORDER BY chunk_index
            "#,
        )
        .bind(execution_id)
        .bind(step_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(rows
            .into_iter()
            .map(|row| StepStreamChunk {
                execution_id: row.get("execution_id"),
                step_id: row.get("step_id"),
                chunk_index: row.get::<i32, _>("chunk_index") as u32,
                data: row.get("data"),
            })
            .collect())
    }

    #[instrument(skip(self))]
    async fn clear_stream_chunks(
        &self,
        execution_id: Uuid,
        step_id: &str,
    ) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM step_stream_chunks WHERE execution_id = $1 AND step_id = $2")
            .bind(execution_id)
            .bind(step_id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }
}

impl PostgresExecutionStore {
    async fn timer_row(
        &self,
        execution_id: Uuid,
        step: &str,
    ) -> Result<Option<ExecutionEvent>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT * FROM workflow_events
            WHERE execution_id = $1 AND event_type = 'timer' AND name = $2
            "#,
        )
        .bind(execution_id)
        .bind(step)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        row.as_ref().map(map_event).transpose()
    }
}
