//! Staging relations: `staging_raw_<sheet>`, `staging_valid_<sheet>`,
//! and the shared `staging_error`.
//!
//! Every insert path rides the `(job_id, sheet_name, row_num)` uniqueness:
//! batch inserts use `ON CONFLICT DO NOTHING`, so re-running an ingest over
//! the same input is a no-op and two sequential runs leave identical
//! staging contents. One batch = one transaction. Transient insert
//! failures retry up to three times with exponential backoff before the
//! batch is reported failed.

use std::time::Duration;

use sqlx::{PgPool, Postgres, QueryBuilder};
use tracing::{debug, warn};

use tablift_common::{Result, TabliftError};
use tablift_ingest::binding::{BindingSet, ParsedRow};

use super::{raw_table, valid_table};

const INSERT_ATTEMPTS: u32 = 3;
const BACKOFF_BASE_MS: u64 = 200;

/// Staging-table operations for one database
#[derive(Clone)]
pub struct StagingStore {
    pool: PgPool,
}

impl StagingStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create the raw and valid staging relations for a sheet when they do
    /// not exist yet. The unique triple lives on both.
    pub async fn ensure_sheet_tables(&self, sheet_name: &str) -> Result<()> {
        for table in [raw_table(sheet_name), valid_table(sheet_name)] {
            let ddl = format!(
                r#"
                CREATE TABLE IF NOT EXISTS {table} (
                    job_id       TEXT NOT NULL,
                    sheet_name   TEXT NOT NULL,
                    row_num      BIGINT NOT NULL,
                    business_key TEXT,
                    payload      JSONB NOT NULL,
                    created_at   TIMESTAMPTZ NOT NULL DEFAULT now(),
                    UNIQUE (job_id, sheet_name, row_num)
                )
                "#
            );
            sqlx::query(&ddl)
                .execute(&self.pool)
                .await
                .map_err(|e| TabliftError::Persistence(format!("create {table}: {e}")))?;
        }
        Ok(())
    }

    /// Insert one parsed batch into `staging_raw_<sheet>`, one transaction
    /// per batch. Returns the number of rows actually inserted (conflicts
    /// from a retried run insert nothing).
    pub async fn insert_raw_batch(
        &self,
        job_id: &str,
        sheet_name: &str,
        bindings: &BindingSet,
        business_key_field: Option<&str>,
        batch: &[ParsedRow],
    ) -> Result<u64> {
        if batch.is_empty() {
            return Ok(0);
        }
        let table = raw_table(sheet_name);
        let key_slot = business_key_field.and_then(|f| bindings.field_slot(f));

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self
                .try_insert_raw(&table, job_id, sheet_name, bindings, key_slot, batch)
                .await
            {
                Ok(inserted) => {
                    debug!(
                        job_id,
                        sheet = sheet_name,
                        rows = batch.len(),
                        inserted,
                        "Raw batch staged"
                    );
                    return Ok(inserted);
                }
                Err(e) if attempt < INSERT_ATTEMPTS => {
                    let backoff = Duration::from_millis(BACKOFF_BASE_MS * 2u64.pow(attempt - 1));
                    warn!(
                        job_id,
                        sheet = sheet_name,
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "Raw batch insert failed, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => {
                    return Err(TabliftError::Persistence(format!(
                        "staging insert failed after {attempt} attempts: {e}"
                    )))
                }
            }
        }
    }

    async fn try_insert_raw(
        &self,
        table: &str,
        job_id: &str,
        sheet_name: &str,
        bindings: &BindingSet,
        key_slot: Option<usize>,
        batch: &[ParsedRow],
    ) -> Result<u64> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| TabliftError::Persistence(format!("begin staging tx: {e}")))?;

        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(format!(
            "INSERT INTO {table} (job_id, sheet_name, row_num, business_key, payload) "
        ));
        builder.push_values(batch, |mut b, row| {
            let business_key = key_slot
                .and_then(|slot| row.get(slot))
                .map(|v| v.canonical());
            b.push_bind(job_id)
                .push_bind(sheet_name)
                .push_bind(row.source_row_index as i64)
                .push_bind(business_key)
                .push_bind(row.to_payload(bindings));
        });
        builder.push(" ON CONFLICT (job_id, sheet_name, row_num) DO NOTHING");

        let inserted = builder
            .build()
            .execute(&mut *tx)
            .await
            .map_err(|e| TabliftError::Persistence(format!("insert into {table}: {e}")))?
            .rows_affected();

        tx.commit()
            .await
            .map_err(|e| TabliftError::Persistence(format!("commit staging tx: {e}")))?;

        Ok(inserted)
    }

    /// Copy rows with no validation findings into `staging_valid_<sheet>`.
    /// Idempotent through the same uniqueness triple.
    pub async fn promote_valid_rows(&self, job_id: &str, sheet_name: &str) -> Result<u64> {
        let raw = raw_table(sheet_name);
        let valid = valid_table(sheet_name);
        let sql = format!(
            r#"
            INSERT INTO {valid} (job_id, sheet_name, row_num, business_key, payload)
            SELECT r.job_id, r.sheet_name, r.row_num, r.business_key, r.payload
            FROM {raw} r
            LEFT JOIN (
                SELECT DISTINCT job_id, sheet_name, row_num
                FROM staging_error
                WHERE job_id = $1 AND sheet_name = $2
            ) e
              ON e.job_id = r.job_id
             AND e.sheet_name = r.sheet_name
             AND e.row_num = r.row_num
            WHERE r.job_id = $1 AND r.sheet_name = $2
              AND e.row_num IS NULL
            ON CONFLICT (job_id, sheet_name, row_num) DO NOTHING
            "#
        );
        let promoted = sqlx::query(&sql)
            .bind(job_id)
            .bind(sheet_name)
            .execute(&self.pool)
            .await
            .map_err(|e| TabliftError::Persistence(format!("promote valid rows: {e}")))?
            .rows_affected();
        Ok(promoted)
    }

    pub async fn count_raw(&self, job_id: &str, sheet_name: &str) -> Result<i64> {
        self.count_in(&raw_table(sheet_name), job_id, sheet_name).await
    }

    pub async fn count_valid(&self, job_id: &str, sheet_name: &str) -> Result<i64> {
        self.count_in(&valid_table(sheet_name), job_id, sheet_name).await
    }

    /// Distinct rows with at least one validation finding.
    pub async fn count_error_rows(&self, job_id: &str, sheet_name: &str) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(DISTINCT row_num) FROM staging_error
            WHERE job_id = $1 AND sheet_name = $2
            "#,
        )
        .bind(job_id)
        .bind(sheet_name)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| TabliftError::Persistence(format!("count error rows: {e}")))?;
        Ok(count)
    }

    async fn count_in(&self, table: &str, job_id: &str, sheet_name: &str) -> Result<i64> {
        let sql = format!(
            "SELECT COUNT(*) FROM {table} WHERE job_id = $1 AND sheet_name = $2"
        );
        let count: i64 = sqlx::query_scalar(&sql)
            .bind(job_id)
            .bind(sheet_name)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| TabliftError::Persistence(format!("count {table}: {e}")))?;
        Ok(count)
    }

    /// Drop a job's staging rows, used when releasing transient resources
    /// after a terminal failure is acknowledged by the caller.
    pub async fn clear_job(&self, job_id: &str, sheet_name: &str) -> Result<()> {
        for table in [raw_table(sheet_name), valid_table(sheet_name)] {
            let sql = format!("DELETE FROM {table} WHERE job_id = $1 AND sheet_name = $2");
            sqlx::query(&sql)
                .bind(job_id)
                .bind(sheet_name)
                .execute(&self.pool)
                .await
                .map_err(|e| TabliftError::Persistence(format!("clear {table}: {e}")))?;
        }
        sqlx::query("DELETE FROM staging_error WHERE job_id = $1 AND sheet_name = $2")
            .bind(job_id)
            .bind(sheet_name)
            .execute(&self.pool)
            .await
            .map_err(|e| TabliftError::Persistence(format!("clear staging_error: {e}")))?;
        Ok(())
    }
}
