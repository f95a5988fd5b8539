//! Postgres-backed reconciliation storage.
//!
//! ## The RUNNING guard
//!
//! `uq_reconciliation_tasks_running` is a partial unique index over
//! `status` restricted to `status = 'RUNNING'`, so the database itself refuses
//! a second RUNNING row. Guard operations run in a transaction that first
//! looks for a RUNNING task (cheap, common case) and then relies on the index
//! for the race: a unique violation on that index is reported as "guard
//! held" (`Ok(None)`), not as an error.

use chrono::{DateTime, NaiveDate, Utc};
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{Postgres, QueryBuilder, Row};
use tracing::{debug, instrument};

use orderflow_reconciliation::{
    Discrepancy, DiscrepancyId, DiscrepancyRepository, RecordDetails, ReconciliationReport,
    ReconciliationTask, ReportRepository, RepositoryError, TaskId, TaskRepository, TaskStatus,
};

use crate::db::Database;

const RUNNING_INDEX: &str = "uq_reconciliation_tasks_running";

const TASK_COLUMNS: &str = "task_id, task_type, status, target_date, total_records, \
                            matched_records, unmatched_records, error_message, created_at, \
                            started_at, completed_at, updated_at";

const DISCREPANCY_COLUMNS: &str = "id, task_id, discrepancy_type, source_system, status, \
                                   record_key, expected_value, actual_value, record_details, \
                                   detected_at, resolved_at, resolved_by, resolution_notes";

#[derive(Debug, Clone)]
pub struct PostgresReconciliationStore {
    db: Database,
}

impl PostgresReconciliationStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    async fn any_running(
        &self,
        tx: &mut sqlx::Transaction<'_, Postgres>,
    ) -> Result<bool, RepositoryError> {
        let row = sqlx::query("SELECT 1 FROM reconciliation_tasks WHERE status = 'RUNNING' LIMIT 1")
            .fetch_optional(&mut **tx)
            .await
            .map_err(|e| storage("any_running", e))?;
        Ok(row.is_some())
    }

    #[instrument(skip(self, task), fields(task_id = %task.task_id, task_type = %task.task_type), err)]
    async fn create_running_async(
        &self,
        mut task: ReconciliationTask,
        now: DateTime<Utc>,
    ) -> Result<Option<ReconciliationTask>, RepositoryError> {
        let mut tx = self.db.pool().begin().await.map_err(|e| storage("begin", e))?;
        if self.any_running(&mut tx).await? {
            debug!("guard held, task not created");
            return Ok(None);
        }

        task.start(now)
            .map_err(|e| RepositoryError::Conflict(e.to_string()))?;
        match insert_task(&mut tx, &task).await {
            Ok(()) => {}
            Err(e) if violates(&e, RUNNING_INDEX) => return Ok(None),
            Err(e) => return Err(map_insert_error("create_running", e)),
        }
        tx.commit().await.map_err(|e| storage("commit", e))?;
        Ok(Some(task))
    }

    #[instrument(skip(self), fields(task_id = %task_id), err)]
    async fn try_start_async(
        &self,
        task_id: TaskId,
        now: DateTime<Utc>,
    ) -> Result<Option<ReconciliationTask>, RepositoryError> {
        let mut tx = self.db.pool().begin().await.map_err(|e| storage("begin", e))?;
        if self.any_running(&mut tx).await? {
            return Ok(None);
        }

        let sql = format!("SELECT {TASK_COLUMNS} FROM reconciliation_tasks WHERE task_id = $1 FOR UPDATE");
        let row = sqlx::query(&sql)
            .bind(task_id.as_i64())
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| storage("try_start", e))?
            .ok_or_else(|| RepositoryError::NotFound(format!("task {task_id}")))?;
        let mut task = task_from_row(&row)?;
        task.start(now)
            .map_err(|e| RepositoryError::Conflict(e.to_string()))?;

        let updated = sqlx::query(
            r#"
            UPDATE reconciliation_tasks
               SET status = 'RUNNING', started_at = $2, updated_at = $2
             WHERE task_id = $1 AND status = 'PENDING'
            "#,
        )
        .bind(task_id.as_i64())
        .bind(now)
        .execute(&mut *tx)
        .await;
        match updated {
            Ok(_) => {}
            Err(e) if violates(&e, RUNNING_INDEX) => return Ok(None),
            Err(e) => return Err(storage("try_start", e)),
        }
        tx.commit().await.map_err(|e| storage("commit", e))?;
        Ok(Some(task))
    }

    async fn insert_async(&self, task: &ReconciliationTask) -> Result<(), RepositoryError> {
        let mut tx = self.db.pool().begin().await.map_err(|e| storage("begin", e))?;
        insert_task(&mut tx, task)
            .await
            .map_err(|e| map_insert_error("insert", e))?;
        tx.commit().await.map_err(|e| storage("commit", e))
    }

    async fn get_task_async(&self, task_id: TaskId) -> Result<Option<ReconciliationTask>, RepositoryError> {
        let sql = format!("SELECT {TASK_COLUMNS} FROM reconciliation_tasks WHERE task_id = $1");
        let row = sqlx::query(&sql)
            .bind(task_id.as_i64())
            .fetch_optional(self.db.pool())
            .await
            .map_err(|e| storage("get_task", e))?;
        row.as_ref().map(task_from_row).transpose()
    }

    async fn has_running_async(&self) -> Result<bool, RepositoryError> {
        let row = sqlx::query("SELECT 1 FROM reconciliation_tasks WHERE status = 'RUNNING' LIMIT 1")
            .fetch_optional(self.db.pool())
            .await
            .map_err(|e| storage("has_running", e))?;
        Ok(row.is_some())
    }

    #[instrument(skip(self, task), fields(task_id = %task.task_id, status = %task.status), err)]
    async fn finish_async(&self, task: &ReconciliationTask) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            r#"
            UPDATE reconciliation_tasks
               SET status = $2, total_records = $3, matched_records = $4,
                   unmatched_records = $5, error_message = $6, completed_at = $7,
                   updated_at = $8
             WHERE task_id = $1 AND status = 'RUNNING'
            "#,
        )
        .bind(task.task_id.as_i64())
        .bind(task.status.as_str())
        .bind(task.total_records as i64)
        .bind(task.matched_records as i64)
        .bind(task.unmatched_records as i64)
        .bind(task.error_message.as_deref())
        .bind(task.completed_at)
        .bind(task.updated_at)
        .execute(self.db.pool())
        .await
        .map_err(|e| storage("finish", e))?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }
        match self.get_task_async(task.task_id).await? {
            Some(_) => Ok(false),
            None => Err(RepositoryError::NotFound(format!("task {}", task.task_id))),
        }
    }

    async fn list_between_async(
        &self,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<ReconciliationTask>, RepositoryError> {
        let sql = format!(
            "SELECT {TASK_COLUMNS} FROM reconciliation_tasks \
             WHERE target_date BETWEEN $1 AND $2 ORDER BY task_id"
        );
        let rows = sqlx::query(&sql)
            .bind(from)
            .bind(to)
            .fetch_all(self.db.pool())
            .await
            .map_err(|e| storage("list_between", e))?;
        rows.iter().map(task_from_row).collect()
    }

    #[instrument(skip(self), err)]
    async fn delete_closed_before_async(&self, cutoff: DateTime<Utc>) -> Result<usize, RepositoryError> {
        let result = sqlx::query(
            r#"
            DELETE FROM reconciliation_tasks t
             WHERE t.status IN ('SUCCESS', 'FAILED')
               AND t.created_at < $1
               AND NOT EXISTS (
                   SELECT 1 FROM reconciliation_discrepancies d WHERE d.task_id = t.task_id)
            "#,
        )
        .bind(cutoff)
        .execute(self.db.pool())
        .await
        .map_err(|e| storage("delete_closed_before", e))?;
        Ok(result.rows_affected() as usize)
    }

    #[instrument(skip(self, items), fields(count = items.len()), err)]
    async fn insert_discrepancies_async(&self, items: &[Discrepancy]) -> Result<(), RepositoryError> {
        if items.is_empty() {
            return Ok(());
        }
        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(format!(
            "INSERT INTO reconciliation_discrepancies ({DISCREPANCY_COLUMNS}) "
        ));
        builder.push_values(items, |mut b, d| {
            b.push_bind(*d.id.as_uuid())
                .push_bind(d.task_id.as_i64())
                .push_bind(d.discrepancy_type.as_str())
                .push_bind(d.source_system.as_str())
                .push_bind(d.status.as_str())
                .push_bind(d.record_key.clone())
                .push_bind(d.expected_value.clone())
                .push_bind(d.actual_value.clone())
                .push_bind(Json(d.details.clone()))
                .push_bind(d.detected_at)
                .push_bind(d.resolved_at)
                .push_bind(d.resolved_by.clone())
                .push_bind(d.resolution_notes.clone());
        });
        builder
            .build()
            .execute(self.db.pool())
            .await
            .map_err(|e| map_insert_error("insert_discrepancies", e))?;
        Ok(())
    }

    async fn get_discrepancy_async(&self, id: DiscrepancyId) -> Result<Option<Discrepancy>, RepositoryError> {
        let sql = format!("SELECT {DISCREPANCY_COLUMNS} FROM reconciliation_discrepancies WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(*id.as_uuid())
            .fetch_optional(self.db.pool())
            .await
            .map_err(|e| storage("get_discrepancy", e))?;
        row.as_ref().map(discrepancy_from_row).transpose()
    }

    async fn list_by_task_async(&self, task_id: TaskId) -> Result<Vec<Discrepancy>, RepositoryError> {
        let sql = format!(
            "SELECT {DISCREPANCY_COLUMNS} FROM reconciliation_discrepancies \
             WHERE task_id = $1 ORDER BY record_key"
        );
        let rows = sqlx::query(&sql)
            .bind(task_id.as_i64())
            .fetch_all(self.db.pool())
            .await
            .map_err(|e| storage("list_by_task", e))?;
        rows.iter().map(discrepancy_from_row).collect()
    }

    async fn list_unresolved_async(&self, limit: usize) -> Result<Vec<Discrepancy>, RepositoryError> {
        let sql = format!(
            "SELECT {DISCREPANCY_COLUMNS} FROM reconciliation_discrepancies \
             WHERE status = 'UNRESOLVED' ORDER BY detected_at, id LIMIT $1"
        );
        let rows = sqlx::query(&sql)
            .bind(limit as i64)
            .fetch_all(self.db.pool())
            .await
            .map_err(|e| storage("list_unresolved", e))?;
        rows.iter().map(discrepancy_from_row).collect()
    }

    #[instrument(skip(self, item), fields(discrepancy_id = %item.id), err)]
    async fn mark_resolved_async(&self, item: &Discrepancy) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            r#"
            UPDATE reconciliation_discrepancies
               SET status = $2, resolved_at = $3, resolved_by = $4, resolution_notes = $5
             WHERE id = $1 AND status = 'UNRESOLVED'
            "#,
        )
        .bind(*item.id.as_uuid())
        .bind(item.status.as_str())
        .bind(item.resolved_at)
        .bind(item.resolved_by.as_deref())
        .bind(item.resolution_notes.as_deref())
        .execute(self.db.pool())
        .await
        .map_err(|e| storage("mark_resolved", e))?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }
        match self.get_discrepancy_async(item.id).await? {
            Some(_) => Ok(false),
            None => Err(RepositoryError::NotFound(format!("discrepancy {}", item.id))),
        }
    }

    async fn delete_resolved_before_async(&self, cutoff: DateTime<Utc>) -> Result<usize, RepositoryError> {
        let result = sqlx::query(
            "DELETE FROM reconciliation_discrepancies WHERE status = 'RESOLVED' AND detected_at < $1",
        )
        .bind(cutoff)
        .execute(self.db.pool())
        .await
        .map_err(|e| storage("delete_resolved_before", e))?;
        Ok(result.rows_affected() as usize)
    }

    async fn save_report_async(&self, report: &ReconciliationReport) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"
            INSERT INTO reconciliation_reports (task_id, report, created_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (task_id) DO UPDATE SET report = EXCLUDED.report, created_at = EXCLUDED.created_at
            "#,
        )
        .bind(report.task_id.as_i64())
        .bind(Json(report))
        .bind(report.created_at)
        .execute(self.db.pool())
        .await
        .map_err(|e| storage("save_report", e))?;
        Ok(())
    }

    async fn get_report_async(&self, task_id: TaskId) -> Result<Option<ReconciliationReport>, RepositoryError> {
        let row = sqlx::query("SELECT report FROM reconciliation_reports WHERE task_id = $1")
            .bind(task_id.as_i64())
            .fetch_optional(self.db.pool())
            .await
            .map_err(|e| storage("get_report", e))?;
        row.map(|r| {
            r.try_get::<Json<ReconciliationReport>, _>("report")
                .map(|json| json.0)
                .map_err(|e| storage("get_report", e))
        })
        .transpose()
    }

    async fn delete_reports_before_async(&self, cutoff: DateTime<Utc>) -> Result<usize, RepositoryError> {
        let result = sqlx::query("DELETE FROM reconciliation_reports WHERE created_at < $1")
            .bind(cutoff)
            .execute(self.db.pool())
            .await
            .map_err(|e| storage("delete_reports_before", e))?;
        Ok(result.rows_affected() as usize)
    }
}

impl TaskRepository for PostgresReconciliationStore {
    fn insert(&self, task: &ReconciliationTask) -> Result<(), RepositoryError> {
        self.db.block_on(self.insert_async(task))
    }

    fn get(&self, task_id: TaskId) -> Result<Option<ReconciliationTask>, RepositoryError> {
        self.db.block_on(self.get_task_async(task_id))
    }

    fn has_running(&self) -> Result<bool, RepositoryError> {
        self.db.block_on(self.has_running_async())
    }

    fn create_running(
        &self,
        task: ReconciliationTask,
        now: DateTime<Utc>,
    ) -> Result<Option<ReconciliationTask>, RepositoryError> {
        self.db.block_on(self.create_running_async(task, now))
    }

    fn try_start(
        &self,
        task_id: TaskId,
        now: DateTime<Utc>,
    ) -> Result<Option<ReconciliationTask>, RepositoryError> {
        self.db.block_on(self.try_start_async(task_id, now))
    }

    fn finish(&self, task: &ReconciliationTask) -> Result<bool, RepositoryError> {
        self.db.block_on(self.finish_async(task))
    }

    fn list_between(
        &self,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<ReconciliationTask>, RepositoryError> {
        self.db.block_on(self.list_between_async(from, to))
    }

    fn delete_closed_before(&self, cutoff: DateTime<Utc>) -> Result<usize, RepositoryError> {
        self.db.block_on(self.delete_closed_before_async(cutoff))
    }
}

impl DiscrepancyRepository for PostgresReconciliationStore {
    fn insert_batch(&self, items: &[Discrepancy]) -> Result<(), RepositoryError> {
        self.db.block_on(self.insert_discrepancies_async(items))
    }

    fn get(&self, id: DiscrepancyId) -> Result<Option<Discrepancy>, RepositoryError> {
        self.db.block_on(self.get_discrepancy_async(id))
    }

    fn list_by_task(&self, task_id: TaskId) -> Result<Vec<Discrepancy>, RepositoryError> {
        self.db.block_on(self.list_by_task_async(task_id))
    }

    fn list_unresolved(&self, limit: usize) -> Result<Vec<Discrepancy>, RepositoryError> {
        self.db.block_on(self.list_unresolved_async(limit))
    }

    fn mark_resolved(&self, item: &Discrepancy) -> Result<bool, RepositoryError> {
        self.db.block_on(self.mark_resolved_async(item))
    }

    fn delete_resolved_before(&self, cutoff: DateTime<Utc>) -> Result<usize, RepositoryError> {
        self.db.block_on(self.delete_resolved_before_async(cutoff))
    }
}

impl ReportRepository for PostgresReconciliationStore {
    fn save(&self, report: &ReconciliationReport) -> Result<(), RepositoryError> {
        self.db.block_on(self.save_report_async(report))
    }

    fn get_by_task(&self, task_id: TaskId) -> Result<Option<ReconciliationReport>, RepositoryError> {
        self.db.block_on(self.get_report_async(task_id))
    }

    fn delete_before(&self, cutoff: DateTime<Utc>) -> Result<usize, RepositoryError> {
        self.db.block_on(self.delete_reports_before_async(cutoff))
    }
}

async fn insert_task(
    tx: &mut sqlx::Transaction<'_, Postgres>,
    task: &ReconciliationTask,
) -> Result<(), sqlx::Error> {
    let sql = format!(
        "INSERT INTO reconciliation_tasks ({TASK_COLUMNS}) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)"
    );
    sqlx::query(&sql)
        .bind(task.task_id.as_i64())
        .bind(task.task_type.as_str())
        .bind(task.status.as_str())
        .bind(task.target_date)
        .bind(task.total_records as i64)
        .bind(task.matched_records as i64)
        .bind(task.unmatched_records as i64)
        .bind(task.error_message.as_deref())
        .bind(task.created_at)
        .bind(task.started_at)
        .bind(task.completed_at)
        .bind(task.updated_at)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

fn decode_err(e: impl std::fmt::Display) -> RepositoryError {
    RepositoryError::Storage(format!("failed to decode row: {e}"))
}

fn task_from_row(row: &PgRow) -> Result<ReconciliationTask, RepositoryError> {
    let task_type: String = row.try_get("task_type").map_err(decode_err)?;
    let status: String = row.try_get("status").map_err(decode_err)?;
    let count = |column: &str| -> Result<u64, RepositoryError> {
        let v: i64 = row.try_get(column).map_err(decode_err)?;
        Ok(v.max(0) as u64)
    };

    Ok(ReconciliationTask {
        task_id: TaskId::from_i64(row.try_get("task_id").map_err(decode_err)?),
        task_type: task_type.parse().map_err(decode_err)?,
        status: status.parse::<TaskStatus>().map_err(decode_err)?,
        target_date: row.try_get("target_date").map_err(decode_err)?,
        total_records: count("total_records")?,
        matched_records: count("matched_records")?,
        unmatched_records: count("unmatched_records")?,
        error_message: row.try_get("error_message").map_err(decode_err)?,
        created_at: row.try_get("created_at").map_err(decode_err)?,
        started_at: row.try_get("started_at").map_err(decode_err)?,
        completed_at: row.try_get("completed_at").map_err(decode_err)?,
        updated_at: row.try_get("updated_at").map_err(decode_err)?,
    })
}

fn discrepancy_from_row(row: &PgRow) -> Result<Discrepancy, RepositoryError> {
    let discrepancy_type: String = row.try_get("discrepancy_type").map_err(decode_err)?;
    let source_system: String = row.try_get("source_system").map_err(decode_err)?;
    let status: String = row.try_get("status").map_err(decode_err)?;
    let details: Json<RecordDetails> = row.try_get("record_details").map_err(decode_err)?;

    Ok(Discrepancy {
        id: DiscrepancyId::from_uuid(row.try_get("id").map_err(decode_err)?),
        task_id: TaskId::from_i64(row.try_get("task_id").map_err(decode_err)?),
        discrepancy_type: discrepancy_type.parse().map_err(decode_err)?,
        source_system: source_system.parse().map_err(decode_err)?,
        status: status.parse().map_err(decode_err)?,
        record_key: row.try_get("record_key").map_err(decode_err)?,
        expected_value: row.try_get("expected_value").map_err(decode_err)?,
        actual_value: row.try_get("actual_value").map_err(decode_err)?,
        details: details.0,
        detected_at: row.try_get("detected_at").map_err(decode_err)?,
        resolved_at: row.try_get("resolved_at").map_err(decode_err)?,
        resolved_by: row.try_get("resolved_by").map_err(decode_err)?,
        resolution_notes: row.try_get("resolution_notes").map_err(decode_err)?,
    })
}

fn violates(err: &sqlx::Error, constraint: &str) -> bool {
    match err {
        sqlx::Error::Database(db_err) => {
            db_err.code().as_deref() == Some("23505") && db_err.constraint() == Some(constraint)
        }
        _ => false,
    }
}

fn map_insert_error(operation: &str, err: sqlx::Error) -> RepositoryError {
    if let sqlx::Error::Database(db_err) = &err {
        if db_err.code().as_deref() == Some("23505") {
            return RepositoryError::Conflict(format!("{operation}: {}", db_err.message()));
        }
    }
    storage(operation, err)
}

fn storage(operation: &str, err: sqlx::Error) -> RepositoryError {
    match err {
        sqlx::Error::Database(db_err) => {
            RepositoryError::Storage(format!("database error in {operation}: {}", db_err.message()))
        }
        sqlx::Error::PoolClosed => {
            RepositoryError::Storage(format!("connection pool closed in {operation}"))
        }
        other => RepositoryError::Storage(format!("sqlx error in {operation}: {other}")),
    }
}
