//! Postgres-backed outbox.
//!
//! ## Claiming
//!
//! `claim_batch` is a single statement:
//!
//! ```sql
//! UPDATE domain_events SET status = 'PROCESSING' ...
//! WHERE id IN (SELECT id ... FOR UPDATE SKIP LOCKED LIMIT $n)
//! RETURNING ...
//! ```
//!
//! Rows locked by a concurrent claimer are skipped rather than waited on, so
//! any number of relay workers can poll the same table without handing out
//! the same event twice.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL code | OutboxStoreError |
//! |------------|-----------------|------------------|
//! | Database (unique violation) | `23505` | `AlreadyExists` |
//! | Database (other) | any | `Storage` |
//! | PoolClosed / other | n/a | `Storage` |

use chrono::{DateTime, Utc};
use sqlx::Row;
use sqlx::postgres::PgRow;
use tracing::instrument;

use orderflow_core::SnowflakeId;
use orderflow_events::{DomainEvent, EventStatus, EventType};

use super::store::{DomainEventStore, OutboxStats, OutboxStoreError};
use crate::db::Database;

const COLUMNS: &str = "id, event_type, aggregate_id, payload, status, retry_count, next_run_at, \
                       error_message, created_at, updated_at";

#[derive(Debug, Clone)]
pub struct PostgresDomainEventStore {
    db: Database,
}

impl PostgresDomainEventStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    #[instrument(skip(self, event), fields(event_id = %event.id, event_type = %event.event_type), err)]
    pub async fn append_async(&self, event: &DomainEvent) -> Result<(), OutboxStoreError> {
        sqlx::query(
            r#"
            INSERT INTO domain_events
                (id, event_type, aggregate_id, payload, status, retry_count,
                 next_run_at, error_message, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(event.id.as_i64())
        .bind(event.event_type.as_str())
        .bind(event.aggregate_id.as_deref())
        .bind(&event.payload)
        .bind(event.status.as_str())
        .bind(event.retry_count as i32)
        .bind(event.next_run_at)
        .bind(event.error_message.as_deref())
        .bind(event.created_at)
        .bind(event.updated_at)
        .execute(self.db.pool())
        .await
        .map_err(|e| map_sqlx_error("append", event.id, e))?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    pub async fn claim_batch_async(
        &self,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<DomainEvent>, OutboxStoreError> {
        let sql = format!(
            r#"
            UPDATE domain_events
               SET status = 'PROCESSING', updated_at = $2
             WHERE id IN (
                   SELECT id FROM domain_events
                    WHERE status = 'PENDING'
                      AND (next_run_at IS NULL OR next_run_at <= $2)
                    ORDER BY id
                    LIMIT $1
                    FOR UPDATE SKIP LOCKED)
            RETURNING {COLUMNS}
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(limit as i64)
            .bind(now)
            .fetch_all(self.db.pool())
            .await
            .map_err(|e| storage("claim_batch", e))?;

        let mut events = rows
            .iter()
            .map(event_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        // RETURNING does not preserve the subquery order.
        events.sort_by_key(|e| e.id);
        Ok(events)
    }

    #[instrument(skip(self), fields(event_id = %id), err)]
    pub async fn mark_completed_async(
        &self,
        id: SnowflakeId,
        now: DateTime<Utc>,
    ) -> Result<(), OutboxStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE domain_events
               SET status = 'COMPLETED', error_message = NULL, next_run_at = NULL, updated_at = $2
             WHERE id = $1 AND status = 'PROCESSING'
            "#,
        )
        .bind(id.as_i64())
        .bind(now)
        .execute(self.db.pool())
        .await
        .map_err(|e| storage("mark_completed", e))?;
        self.expect_one(result.rows_affected(), id, "COMPLETED").await
    }

    #[instrument(skip(self, error), fields(event_id = %id), err)]
    pub async fn mark_failed_async(
        &self,
        id: SnowflakeId,
        error: &str,
        next_run_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<(), OutboxStoreError> {
        let result = match next_run_at {
            Some(at) => {
                sqlx::query(
                    r#"
                    UPDATE domain_events
                       SET status = 'PENDING', retry_count = retry_count + 1,
                           next_run_at = $3, error_message = $2, updated_at = $4
                     WHERE id = $1 AND status = 'PROCESSING'
                    "#,
                )
                .bind(id.as_i64())
                .bind(error)
                .bind(at)
                .bind(now)
                .execute(self.db.pool())
                .await
            }
            None => {
                sqlx::query(
                    r#"
                    UPDATE domain_events
                       SET status = 'FAILED', error_message = $2, updated_at = $3
                     WHERE id = $1 AND status = 'PROCESSING'
                    "#,
                )
                .bind(id.as_i64())
                .bind(error)
                .bind(now)
                .execute(self.db.pool())
                .await
            }
        }
        .map_err(|e| storage("mark_failed", e))?;
        self.expect_one(result.rows_affected(), id, "FAILED").await
    }

    #[instrument(skip(self), fields(event_id = %id), err)]
    pub async fn release_async(
        &self,
        id: SnowflakeId,
        now: DateTime<Utc>,
    ) -> Result<(), OutboxStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE domain_events
               SET status = 'PENDING', updated_at = $2
             WHERE id = $1 AND status = 'PROCESSING'
            "#,
        )
        .bind(id.as_i64())
        .bind(now)
        .execute(self.db.pool())
        .await
        .map_err(|e| storage("release", e))?;
        self.expect_one(result.rows_affected(), id, "PENDING").await
    }

    pub async fn find_by_id_async(
        &self,
        id: SnowflakeId,
    ) -> Result<Option<DomainEvent>, OutboxStoreError> {
        let sql = format!("SELECT {COLUMNS} FROM domain_events WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id.as_i64())
            .fetch_optional(self.db.pool())
            .await
            .map_err(|e| storage("find_by_id", e))?;
        row.as_ref().map(event_from_row).transpose()
    }

    pub async fn list_by_status_async(
        &self,
        status: EventStatus,
        limit: usize,
    ) -> Result<Vec<DomainEvent>, OutboxStoreError> {
        let sql =
            format!("SELECT {COLUMNS} FROM domain_events WHERE status = $1 ORDER BY id LIMIT $2");
        let rows = sqlx::query(&sql)
            .bind(status.as_str())
            .bind(limit as i64)
            .fetch_all(self.db.pool())
            .await
            .map_err(|e| storage("list_by_status", e))?;
        rows.iter().map(event_from_row).collect()
    }

    #[instrument(skip(self), err)]
    pub async fn release_stale_async(
        &self,
        older_than: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<usize, OutboxStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE domain_events
               SET status = 'PENDING', updated_at = $2
             WHERE status = 'PROCESSING' AND updated_at < $1
            "#,
        )
        .bind(older_than)
        .bind(now)
        .execute(self.db.pool())
        .await
        .map_err(|e| storage("release_stale", e))?;
        Ok(result.rows_affected() as usize)
    }

    #[instrument(skip(self), err)]
    pub async fn purge_completed_before_async(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<usize, OutboxStoreError> {
        let result =
            sqlx::query("DELETE FROM domain_events WHERE status = 'COMPLETED' AND updated_at < $1")
                .bind(cutoff)
                .execute(self.db.pool())
                .await
                .map_err(|e| storage("purge_completed_before", e))?;
        Ok(result.rows_affected() as usize)
    }

    pub async fn stats_async(&self) -> Result<OutboxStats, OutboxStoreError> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM domain_events GROUP BY status")
            .fetch_all(self.db.pool())
            .await
            .map_err(|e| storage("stats", e))?;

        let mut stats = OutboxStats::default();
        for row in rows {
            let status: String = row.try_get("status").map_err(|e| storage("stats", e))?;
            let n: i64 = row.try_get("n").map_err(|e| storage("stats", e))?;
            let n = n as usize;
            match status.parse::<EventStatus>() {
                Ok(EventStatus::Pending) => stats.pending = n,
                Ok(EventStatus::Processing) => stats.processing = n,
                Ok(EventStatus::Completed) => stats.completed = n,
                Ok(EventStatus::Failed) => stats.failed = n,
                Err(e) => return Err(OutboxStoreError::Storage(e.to_string())),
            }
        }
        Ok(stats)
    }

    /// Distinguish "no such row" from "row in the wrong state" after a guarded update.
    async fn expect_one(
        &self,
        affected: u64,
        id: SnowflakeId,
        target: &str,
    ) -> Result<(), OutboxStoreError> {
        if affected == 1 {
            return Ok(());
        }
        match self.find_by_id_async(id).await? {
            None => Err(OutboxStoreError::NotFound(id)),
            Some(current) => Err(OutboxStoreError::InvalidTransition(format!(
                "event {id}: cannot move from {} to {target}",
                current.status
            ))),
        }
    }
}

impl DomainEventStore for PostgresDomainEventStore {
    fn append(&self, event: &DomainEvent) -> Result<(), OutboxStoreError> {
        self.db.block_on(self.append_async(event))
    }

    fn claim_batch(
        &self,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<DomainEvent>, OutboxStoreError> {
        self.db.block_on(self.claim_batch_async(limit, now))
    }

    fn mark_completed(&self, id: SnowflakeId, now: DateTime<Utc>) -> Result<(), OutboxStoreError> {
        self.db.block_on(self.mark_completed_async(id, now))
    }

    fn mark_failed(
        &self,
        id: SnowflakeId,
        error: &str,
        next_run_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<(), OutboxStoreError> {
        self.db
            .block_on(self.mark_failed_async(id, error, next_run_at, now))
    }

    fn release(&self, id: SnowflakeId, now: DateTime<Utc>) -> Result<(), OutboxStoreError> {
        self.db.block_on(self.release_async(id, now))
    }

    fn find_by_id(&self, id: SnowflakeId) -> Result<Option<DomainEvent>, OutboxStoreError> {
        self.db.block_on(self.find_by_id_async(id))
    }

    fn list_by_status(
        &self,
        status: EventStatus,
        limit: usize,
    ) -> Result<Vec<DomainEvent>, OutboxStoreError> {
        self.db.block_on(self.list_by_status_async(status, limit))
    }

    fn release_stale(
        &self,
        older_than: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<usize, OutboxStoreError> {
        self.db.block_on(self.release_stale_async(older_than, now))
    }

    fn purge_completed_before(&self, cutoff: DateTime<Utc>) -> Result<usize, OutboxStoreError> {
        self.db.block_on(self.purge_completed_before_async(cutoff))
    }

    fn stats(&self) -> Result<OutboxStats, OutboxStoreError> {
        self.db.block_on(self.stats_async())
    }
}

fn event_from_row(row: &PgRow) -> Result<DomainEvent, OutboxStoreError> {
    let decode = |e: sqlx::Error| OutboxStoreError::Storage(format!("failed to decode event row: {e}"));

    let status: String = row.try_get("status").map_err(decode)?;
    let status = status
        .parse::<EventStatus>()
        .map_err(|e| OutboxStoreError::Storage(e.to_string()))?;
    let event_type: String = row.try_get("event_type").map_err(decode)?;
    let retry_count: i32 = row.try_get("retry_count").map_err(decode)?;

    Ok(DomainEvent {
        id: SnowflakeId::from_raw(row.try_get("id").map_err(decode)?),
        event_type: EventType::from(event_type),
        aggregate_id: row.try_get("aggregate_id").map_err(decode)?,
        payload: row.try_get("payload").map_err(decode)?,
        status,
        retry_count: retry_count.max(0) as u32,
        next_run_at: row.try_get("next_run_at").map_err(decode)?,
        error_message: row.try_get("error_message").map_err(decode)?,
        created_at: row.try_get("created_at").map_err(decode)?,
        updated_at: row.try_get("updated_at").map_err(decode)?,
    })
}

fn map_sqlx_error(operation: &str, id: SnowflakeId, err: sqlx::Error) -> OutboxStoreError {
    if let sqlx::Error::Database(db_err) = &err {
        if db_err.code().as_deref() == Some("23505") {
            return OutboxStoreError::AlreadyExists(id);
        }
    }
    storage(operation, err)
}

fn storage(operation: &str, err: sqlx::Error) -> OutboxStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            OutboxStoreError::Storage(format!("database error in {operation}: {}", db_err.message()))
        }
        sqlx::Error::PoolClosed => {
            OutboxStoreError::Storage(format!("connection pool closed in {operation}"))
        }
        other => OutboxStoreError::Storage(format!("sqlx error in {operation}: {other}")),
    }
}
