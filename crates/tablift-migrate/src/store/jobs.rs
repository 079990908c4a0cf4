//! Job and job-sheet persistence.
//!
//! Job creation is a plain transactional INSERT; the primary key on
//! `migration_job` and the unique `(job_id, sheet_name)` constraint on
//! `migration_job_sheet` are what make creation atomic. A constraint hit
//! surfaces as `UniqueConflict`, never as a blind retry. Status updates
//! go through the ordered-chain check in `JobStatus`.

use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tracing::{info, warn};

use tablift_common::types::{JobStatus, Phase};
use tablift_common::{Result, TabliftError};

use super::map_db_error;

/// One `migration_job` row
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct JobRecord {
    pub job_id: String,
    pub file_name: String,
    pub status: String,
    pub current_phase: Option<String>,
    pub progress_percent: f64,
    pub total_rows: i64,
    pub processed_rows: i64,
    pub valid_rows: i64,
    pub error_rows: i64,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub created_by: Option<String>,
}

impl JobRecord {
    pub fn status(&self) -> JobStatus {
        JobStatus::from(self.status.clone())
    }
}

/// One `migration_job_sheet` row
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct JobSheetRecord {
    pub job_id: String,
    pub sheet_name: String,
    pub sheet_order: i32,
    pub status: String,
    pub current_phase: Option<String>,
    pub total_rows: i64,
    pub ingested_rows: i64,
    pub valid_rows: i64,
    pub error_rows: i64,
    pub inserted_rows: i64,
    pub error_message: Option<String>,
}

/// Persistence operations for jobs and their sheets
#[derive(Clone)]
pub struct JobStore {
    pool: PgPool,
}

impl JobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create a job. Fails with `UniqueConflict` when the id is taken;
    /// enforcement is the primary key, not a pre-check.
    pub async fn create_job(
        &self,
        job_id: &str,
        file_name: &str,
        created_by: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO migration_job (job_id, file_name, status, created_by)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(job_id)
        .bind(file_name)
        .bind(JobStatus::Started.as_str())
        .bind(created_by)
        .execute(&self.pool)
        .await
        .map_err(|e| map_db_error("create migration job", "migration_job.job_id", e))?;

        info!(job_id, file_name, "Migration job created");
        Ok(())
    }

    /// Create the per-sheet row. The unique `(job_id, sheet_name)`
    /// constraint makes concurrent duplicates fail atomically here.
    pub async fn create_job_sheet(
        &self,
        job_id: &str,
        sheet_name: &str,
        sheet_order: i32,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO migration_job_sheet (job_id, sheet_name, sheet_order, status)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(job_id)
        .bind(sheet_name)
        .bind(sheet_order)
        .bind(JobStatus::Started.as_str())
        .execute(&self.pool)
        .await
        .map_err(|e| {
            map_db_error(
                "create migration job sheet",
                "migration_job_sheet(job_id, sheet_name)",
                e,
            )
        })?;

        Ok(())
    }

    pub async fn get_job(&self, job_id: &str) -> Result<Option<JobRecord>> {
        let job = sqlx::query_as::<_, JobRecord>(
            r#"
            SELECT job_id, file_name, status, current_phase, progress_percent,
                   total_rows, processed_rows, valid_rows, error_rows,
                   started_at, ended_at, error_message, created_by
            FROM migration_job
            WHERE job_id = $1
            "#,
        )
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| TabliftError::Persistence(format!("fetch migration job: {e}")))?;
        Ok(job)
    }

    pub async fn get_sheet(
        &self,
        job_id: &str,
        sheet_name: &str,
    ) -> Result<Option<JobSheetRecord>> {
        let sheet = sqlx::query_as::<_, JobSheetRecord>(
            r#"
            SELECT job_id, sheet_name, sheet_order, status, current_phase,
                   total_rows, ingested_rows, valid_rows, error_rows,
                   inserted_rows, error_message
            FROM migration_job_sheet
            WHERE job_id = $1 AND sheet_name = $2
            "#,
        )
        .bind(job_id)
        .bind(sheet_name)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| TabliftError::Persistence(format!("fetch job sheet: {e}")))?;
        Ok(sheet)
    }

    pub async fn get_sheets(&self, job_id: &str) -> Result<Vec<JobSheetRecord>> {
        let sheets = sqlx::query_as::<_, JobSheetRecord>(
            r#"
            SELECT job_id, sheet_name, sheet_order, status, current_phase,
                   total_rows, ingested_rows, valid_rows, error_rows,
                   inserted_rows, error_message
            FROM migration_job_sheet
            WHERE job_id = $1
            ORDER BY sheet_order
            "#,
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| TabliftError::Persistence(format!("fetch job sheets: {e}")))?;
        Ok(sheets)
    }

    /// Advance the job along the status chain. Backward transitions are
    /// rejected inside the same transaction that reads the current value.
    pub async fn advance_status(&self, job_id: &str, next: JobStatus) -> Result<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| TabliftError::Persistence(format!("begin status update: {e}")))?;

        let current: String =
            sqlx::query_scalar("SELECT status FROM migration_job WHERE job_id = $1 FOR UPDATE")
                .bind(job_id)
                .fetch_one(&mut *tx)
                .await
                .map_err(|e| TabliftError::Persistence(format!("lock job status: {e}")))?;

        let current = JobStatus::from(current);
        if !current.can_transition_to(next) {
            return Err(TabliftError::Validation(format!(
                "job {job_id} cannot move from {current} to {next}"
            )));
        }

        sqlx::query(
            r#"
            UPDATE migration_job
            SET status = $1,
                current_phase = $2,
                ended_at = CASE WHEN $3 THEN now() ELSE ended_at END
            WHERE job_id = $4
            "#,
        )
        .bind(next.as_str())
        .bind(phase_of(next).map(|p| p.as_str()))
        .bind(next.is_terminal())
        .bind(job_id)
        .execute(&mut *tx)
        .await
        .map_err(|e| TabliftError::Persistence(format!("update job status: {e}")))?;

        tx.commit()
            .await
            .map_err(|e| TabliftError::Persistence(format!("commit status update: {e}")))?;

        info!(job_id, status = next.as_str(), "Job status advanced");
        Ok(())
    }

    /// Add to the processed counter and recompute the percentage.
    pub async fn add_progress(&self, job_id: &str, processed_delta: i64) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE migration_job
            SET processed_rows = processed_rows + $1,
                progress_percent = CASE
                    WHEN total_rows > 0
                    THEN LEAST(100, (processed_rows + $1)::float8 / total_rows * 100)
                    ELSE progress_percent
                END
            WHERE job_id = $2
            "#,
        )
        .bind(processed_delta)
        .bind(job_id)
        .execute(&self.pool)
        .await
        .map_err(|e| TabliftError::Persistence(format!("update job progress: {e}")))?;
        Ok(())
    }

    /// Populate `total_rows` once it is known (end of Ingest) so progress
    /// percentages mean something from Validate onward.
    pub async fn set_total_rows(&self, job_id: &str, total_rows: i64) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE migration_job
            SET total_rows = $1,
                progress_percent = CASE
                    WHEN $1 > 0 THEN LEAST(100, processed_rows::float8 / $1 * 100)
                    ELSE progress_percent
                END
            WHERE job_id = $2
            "#,
        )
        .bind(total_rows)
        .bind(job_id)
        .execute(&self.pool)
        .await
        .map_err(|e| TabliftError::Persistence(format!("set job total rows: {e}")))?;
        Ok(())
    }

    pub async fn set_job_totals(
        &self,
        job_id: &str,
        total_rows: i64,
        valid_rows: i64,
        error_rows: i64,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE migration_job
            SET total_rows = $1,
                valid_rows = $2,
                error_rows = $3,
                progress_percent = CASE
                    WHEN $1 > 0 THEN LEAST(100, processed_rows::float8 / $1 * 100)
                    ELSE progress_percent
                END
            WHERE job_id = $4
            "#,
        )
        .bind(total_rows)
        .bind(valid_rows)
        .bind(error_rows)
        .bind(job_id)
        .execute(&self.pool)
        .await
        .map_err(|e| TabliftError::Persistence(format!("update job totals: {e}")))?;
        Ok(())
    }

    /// Mark the job failed with its first fatal cause.
    pub async fn fail_job(&self, job_id: &str, error_message: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE migration_job
            SET status = $1, ended_at = now(), error_message = $2
            WHERE job_id = $3
            "#,
        )
        .bind(JobStatus::Failed.as_str())
        .bind(error_message)
        .bind(job_id)
        .execute(&self.pool)
        .await
        .map_err(|e| TabliftError::Persistence(format!("mark job failed: {e}")))?;

        warn!(job_id, error = error_message, "Job marked failed");
        Ok(())
    }

    /// Re-arm a failed job for an explicit resume. The ordered status
    /// chain has no backward edges, so re-entry goes through this narrow
    /// gate instead of `advance_status`; it only touches jobs that
    /// actually failed.
    pub async fn reset_for_resume(&self, job_id: &str) -> Result<()> {
        let updated = sqlx::query(
            r#"
            UPDATE migration_job
            SET status = $1, error_message = NULL, ended_at = NULL
            WHERE job_id = $2 AND status = $3
            "#,
        )
        .bind(JobStatus::Started.as_str())
        .bind(job_id)
        .bind(JobStatus::Failed.as_str())
        .execute(&self.pool)
        .await
        .map_err(|e| TabliftError::Persistence(format!("reset job for resume: {e}")))?
        .rows_affected();

        if updated == 0 {
            return Err(TabliftError::UniqueConflict {
                constraint: "migration_job.job_id".into(),
                detail: format!("job {job_id} exists and is not in a resumable state"),
            });
        }

        sqlx::query(
            r#"
            UPDATE migration_job_sheet
            SET status = $1, error_message = NULL
            WHERE job_id = $2 AND status = $3
            "#,
        )
        .bind(JobStatus::Started.as_str())
        .bind(job_id)
        .bind(JobStatus::Failed.as_str())
        .execute(&self.pool)
        .await
        .map_err(|e| TabliftError::Persistence(format!("reset job sheets for resume: {e}")))?;

        Ok(())
    }

    /// Per-day sequence for the dated job-id format.
    pub async fn next_dated_sequence(&self, day_prefix: &str) -> Result<u32> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM migration_job WHERE job_id LIKE $1 || '%'",
        )
        .bind(day_prefix)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| TabliftError::Persistence(format!("count dated jobs: {e}")))?;
        Ok(count as u32 + 1)
    }

    // --- sheet-level updates ------------------------------------------------

    pub async fn sheet_phase_started(
        &self,
        job_id: &str,
        sheet_name: &str,
        phase: Phase,
        status: JobStatus,
    ) -> Result<()> {
        let column = phase_started_column(phase);
        let sql = format!(
            "UPDATE migration_job_sheet
             SET status = $1, current_phase = $2, {column} = now()
             WHERE job_id = $3 AND sheet_name = $4"
        );
        sqlx::query(&sql)
            .bind(status.as_str())
            .bind(phase.as_str())
            .bind(job_id)
            .bind(sheet_name)
            .execute(&self.pool)
            .await
            .map_err(|e| TabliftError::Persistence(format!("mark sheet phase start: {e}")))?;
        Ok(())
    }

    pub async fn sheet_phase_ended(
        &self,
        job_id: &str,
        sheet_name: &str,
        phase: Phase,
        status: JobStatus,
    ) -> Result<()> {
        let column = phase_ended_column(phase);
        let sql = format!(
            "UPDATE migration_job_sheet
             SET status = $1, {column} = now()
             WHERE job_id = $2 AND sheet_name = $3"
        );
        sqlx::query(&sql)
            .bind(status.as_str())
            .bind(job_id)
            .bind(sheet_name)
            .execute(&self.pool)
            .await
            .map_err(|e| TabliftError::Persistence(format!("mark sheet phase end: {e}")))?;
        Ok(())
    }

    pub async fn add_sheet_ingested(
        &self,
        job_id: &str,
        sheet_name: &str,
        delta: i64,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE migration_job_sheet
            SET ingested_rows = ingested_rows + $1
            WHERE job_id = $2 AND sheet_name = $3
            "#,
        )
        .bind(delta)
        .bind(job_id)
        .bind(sheet_name)
        .execute(&self.pool)
        .await
        .map_err(|e| TabliftError::Persistence(format!("update sheet ingested: {e}")))?;
        Ok(())
    }

    pub async fn set_sheet_counters(
        &self,
        job_id: &str,
        sheet_name: &str,
        total_rows: i64,
        valid_rows: i64,
        error_rows: i64,
        inserted_rows: i64,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE migration_job_sheet
            SET total_rows = $1, valid_rows = $2, error_rows = $3, inserted_rows = $4
            WHERE job_id = $5 AND sheet_name = $6
            "#,
        )
        .bind(total_rows)
        .bind(valid_rows)
        .bind(error_rows)
        .bind(inserted_rows)
        .bind(job_id)
        .bind(sheet_name)
        .execute(&self.pool)
        .await
        .map_err(|e| TabliftError::Persistence(format!("update sheet counters: {e}")))?;
        Ok(())
    }

    pub async fn fail_sheet(
        &self,
        job_id: &str,
        sheet_name: &str,
        error_message: &str,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE migration_job_sheet
            SET status = $1, error_message = $2
            WHERE job_id = $3 AND sheet_name = $4
            "#,
        )
        .bind(JobStatus::Failed.as_str())
        .bind(error_message)
        .bind(job_id)
        .bind(sheet_name)
        .execute(&self.pool)
        .await
        .map_err(|e| TabliftError::Persistence(format!("mark sheet failed: {e}")))?;
        Ok(())
    }

    // --- checkpoint mirror --------------------------------------------------

    /// Durable mirror of the file checkpoint, flushed at phase boundaries.
    pub async fn upsert_checkpoint(
        &self,
        session_id: &str,
        payload: &serde_json::Value,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO checkpoints (session_id, payload, updated_at)
            VALUES ($1, $2, now())
            ON CONFLICT (session_id)
            DO UPDATE SET payload = EXCLUDED.payload, updated_at = now()
            "#,
        )
        .bind(session_id)
        .bind(payload)
        .execute(&self.pool)
        .await
        .map_err(|e| TabliftError::Persistence(format!("upsert checkpoint: {e}")))?;
        Ok(())
    }

    pub async fn load_checkpoint(&self, session_id: &str) -> Result<Option<serde_json::Value>> {
        let row = sqlx::query("SELECT payload FROM checkpoints WHERE session_id = $1")
            .bind(session_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| TabliftError::Persistence(format!("load checkpoint: {e}")))?;
        Ok(row.map(|r| r.get("payload")))
    }
}

fn phase_of(status: JobStatus) -> Option<Phase> {
    match status {
        JobStatus::Ingesting | JobStatus::IngestCompleted => Some(Phase::Ingest),
        JobStatus::Validating | JobStatus::Validated => Some(Phase::Validate),
        JobStatus::Applying | JobStatus::Applied => Some(Phase::Apply),
        JobStatus::Reconciling | JobStatus::Completed => Some(Phase::Reconcile),
        JobStatus::Started | JobStatus::Failed => None,
    }
}

fn phase_started_column(phase: Phase) -> &'static str {
    match phase {
        Phase::Ingest => "ingest_started_at",
        Phase::Validate => "validate_started_at",
        Phase::Apply => "apply_started_at",
        Phase::Reconcile => "reconcile_started_at",
    }
}

fn phase_ended_column(phase: Phase) -> &'static str {
    match phase {
        Phase::Ingest => "ingest_ended_at",
        Phase::Validate => "validate_ended_at",
        Phase::Apply => "apply_ended_at",
        Phase::Reconcile => "reconcile_ended_at",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_columns_are_fixed_identifiers() {
        for phase in Phase::all() {
            assert!(phase_started_column(phase).ends_with("_started_at"));
            assert!(phase_ended_column(phase).ends_with("_ended_at"));
        }
    }

    #[test]
    fn status_maps_to_its_phase() {
        assert_eq!(phase_of(JobStatus::Ingesting), Some(Phase::Ingest));
        assert_eq!(phase_of(JobStatus::Validated), Some(Phase::Validate));
        assert_eq!(phase_of(JobStatus::Completed), Some(Phase::Reconcile));
        assert_eq!(phase_of(JobStatus::Started), None);
    }
}
