//! Four-phase migration driver.
//!
//! One job runs Ingest -> Validate -> Apply -> Reconcile; phases are
//! sequential, sheets inside a phase run in parallel, each advancing its
//! own `migration_job_sheet` state machine. A failure anywhere marks the
//! job and the failing sheet FAILED with the first fatal cause persisted,
//! then surfaces the error. Retrying the same job id leans on the staging
//! uniqueness triple: already-ingested rows insert as no-ops, so resume
//! just replays from the checkpoint offset.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use sqlx::PgPool;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use tablift_common::types::{
    dated_job_id, timestamped_job_id, JobIdFormat, JobStatus, MigrationResult, Phase,
    RecoverableProcessingResult,
};
use tablift_common::{ImportConfig, Result, TabliftError};
use tablift_ingest::binding::BindingSet;
use tablift_ingest::checkpoint::{Checkpoint, CheckpointStore};
use tablift_ingest::executor::BatchExecutor;
use tablift_ingest::parser::StreamParser;
use tablift_ingest::workbook::Workbook;

use crate::apply::{apply_sheet, ApplyTarget};
use crate::store::{JobStore, StagingStore};
use crate::validation::{ValidationEngine, ValidationRule};

/// Everything the pipeline needs to know about one sheet
#[derive(Clone)]
pub struct SheetPlan {
    pub sheet_name: String,
    pub bindings: Arc<BindingSet>,
    /// Payload field copied into the staging `business_key` column
    pub business_key_field: Option<String>,
    pub rules: Vec<ValidationRule>,
    /// Sheets without a target are staged and validated but not applied
    pub apply: Option<ApplyTarget>,
}

/// One migration request
pub struct MigrationRequest {
    pub file_path: PathBuf,
    /// Explicit job id; generated in `id_format` when absent
    pub job_id: Option<String>,
    pub id_format: JobIdFormat,
    pub created_by: Option<String>,
    pub sheets: Vec<SheetPlan>,
    /// Resume an interrupted session instead of starting clean
    pub resume_session: Option<String>,
}

/// Phase driver for migration jobs
pub struct MigrationOrchestrator {
    jobs: JobStore,
    staging: StagingStore,
    validation: ValidationEngine,
    checkpoints: Arc<CheckpointStore>,
    config: ImportConfig,
}

/// Apply the schema migrations bundled with this crate.
pub async fn prepare_schema(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| TabliftError::Persistence(format!("run schema migrations: {e}")))?;
    Ok(())
}

#[derive(Default)]
struct PhaseTimes {
    ingest_ms: u64,
    validate_ms: u64,
    apply_ms: u64,
    reconcile_ms: u64,
}

impl MigrationOrchestrator {
    pub fn new(
        pool: PgPool,
        config: ImportConfig,
        checkpoints: CheckpointStore,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            jobs: JobStore::new(pool.clone()),
            staging: StagingStore::new(pool.clone()),
            validation: ValidationEngine::new(pool, config.step_timeout()),
            checkpoints: Arc::new(checkpoints),
            config,
        })
    }

    pub fn jobs(&self) -> &JobStore {
        &self.jobs
    }

    /// Run one migration to completion (or failure). The job record always
    /// reflects the ultimate state; on failure the first fatal cause is
    /// persisted before the error is returned.
    pub async fn migrate(&self, request: MigrationRequest) -> Result<MigrationResult> {
        if request.sheets.is_empty() {
            return Err(TabliftError::Configuration(
                "migration request names no sheets".into(),
            ));
        }

        let job_id = self.resolve_job_id(&request).await?;
        let file_name = request
            .file_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| request.file_path.display().to_string());

        // Atomic creation: the primary key decides, not a pre-check. A
        // conflict is reported as a duplicate job, never retried blindly.
        // The one exception is an explicit resume, which re-enters its own
        // job and relies on the idempotent stages below.
        let resuming = request.resume_session.is_some();
        match self
            .jobs
            .create_job(&job_id, &file_name, request.created_by.as_deref())
            .await
        {
            Ok(()) => {}
            Err(TabliftError::UniqueConflict { .. }) if resuming => {
                self.jobs.reset_for_resume(&job_id).await?;
                info!(%job_id, "Re-entering existing job for resume");
            }
            Err(e) => return Err(e),
        }

        let session_id = request
            .resume_session
            .clone()
            .unwrap_or_else(|| job_id.clone());
        let checkpoint = self.load_or_create_checkpoint(&session_id, &file_name)?;
        if resuming {
            let cp = checkpoint.lock().await;
            if !cp.can_resume() {
                return Err(TabliftError::Configuration(format!(
                    "session '{session_id}' cannot resume (status {}, {}/{} rows)",
                    cp.status.as_str(),
                    cp.processed_rows,
                    cp.total_rows
                )));
            }
            info!(
                %session_id,
                processed_rows = cp.processed_rows,
                "Resuming from checkpoint; each sheet continues after its staged offset"
            );
        }

        let started = Instant::now();
        let outcome = tokio::time::timeout(
            self.config.job_timeout(),
            self.run_phases(&job_id, &request, Arc::clone(&checkpoint), resuming),
        )
        .await;

        match outcome {
            Ok(Ok(times)) => {
                self.finish_checkpoint(&checkpoint, &session_id, true).await;
                self.assemble_result(&job_id, times).await
            }
            Ok(Err(e)) => {
                self.jobs.fail_job(&job_id, &e.to_string()).await.ok();
                // The checkpoint stays ACTIVE so the session can resume,
                // unless the failure is one no retry can fix.
                if matches!(
                    e,
                    TabliftError::Configuration(_)
                        | TabliftError::SchemaMismatch(_)
                        | TabliftError::SourceFormat(_)
                        | TabliftError::EmptyDataSet
                        | TabliftError::RowLimitExceeded { .. }
                ) {
                    self.finish_checkpoint(&checkpoint, &session_id, false).await;
                }
                Err(e)
            }
            Err(_) => {
                let elapsed_ms = started.elapsed().as_millis() as u64;
                let message = format!(
                    "job exceeded the {}s timeout",
                    self.config.job_timeout_secs
                );
                error!(%job_id, elapsed_ms, "Job timed out, cancelling outstanding work");
                self.jobs.fail_job(&job_id, &message).await.ok();
                Err(TabliftError::Timeout {
                    operation: format!("migration job {job_id}"),
                    elapsed_ms,
                })
            }
        }
    }

    async fn run_phases(
        &self,
        job_id: &str,
        request: &MigrationRequest,
        checkpoint: Arc<Mutex<Checkpoint>>,
        resuming: bool,
    ) -> Result<PhaseTimes> {
        let mut times = PhaseTimes::default();

        let phase = Instant::now();
        self.ingest_phase(job_id, request, Arc::clone(&checkpoint), resuming)
            .await?;
        times.ingest_ms = phase.elapsed().as_millis() as u64;
        self.flush_checkpoint(&checkpoint).await?;

        let phase = Instant::now();
        self.validate_phase(job_id, &request.sheets).await?;
        times.validate_ms = phase.elapsed().as_millis() as u64;

        let phase = Instant::now();
        self.apply_phase(job_id, &request.sheets).await?;
        times.apply_ms = phase.elapsed().as_millis() as u64;

        let phase = Instant::now();
        self.reconcile_phase(job_id, &request.sheets).await?;
        times.reconcile_ms = phase.elapsed().as_millis() as u64;

        Ok(times)
    }

    // --- Ingest -------------------------------------------------------------

    async fn ingest_phase(
        &self,
        job_id: &str,
        request: &MigrationRequest,
        checkpoint: Arc<Mutex<Checkpoint>>,
        resuming: bool,
    ) -> Result<()> {
        self.jobs.advance_status(job_id, JobStatus::Ingesting).await?;
        info!(
            %job_id,
            sheets = request.sheets.len(),
            batch_size = self.config.batch_size,
            parallelism = self.config.effective_parallelism(),
            memory_threshold_mb = self.config.memory_threshold_mb,
            "Ingest phase started"
        );

        let file_path = request.file_path.clone();
        let base = tokio::task::spawn_blocking(move || Workbook::open(&file_path))
            .await
            .map_err(|e| TabliftError::Cancelled(format!("workbook open task: {e}")))??;

        let rows_since_save = Arc::new(AtomicU64::new(0));
        let mut tasks: JoinSet<Result<()>> = JoinSet::new();

        for (order, plan) in request.sheets.iter().enumerate() {
            // Unique (job_id, sheet_name) makes concurrent duplicates fail
            // right here, atomically. A resume re-enters its own rows.
            match self
                .jobs
                .create_job_sheet(job_id, &plan.sheet_name, order as i32)
                .await
            {
                Ok(()) => {}
                Err(TabliftError::UniqueConflict { .. }) if resuming => {}
                Err(e) => return Err(e),
            }
            self.staging.ensure_sheet_tables(&plan.sheet_name).await?;

            // Resume re-invokes Ingest from the row after the sheet's
            // persisted offset; the parser skips everything at or below
            // it without re-running coercion or validation.
            let resume_offset = if resuming {
                self.jobs
                    .get_sheet(job_id, &plan.sheet_name)
                    .await?
                    .map(|s| s.ingested_rows.max(0) as u64)
                    .unwrap_or(0)
            } else {
                0
            };
            if resume_offset > 0 {
                info!(
                    %job_id,
                    sheet = %plan.sheet_name,
                    resume_offset,
                    "Resuming sheet ingest past staged offset"
                );
            }

            self.jobs
                .sheet_phase_started(job_id, &plan.sheet_name, Phase::Ingest, JobStatus::Ingesting)
                .await?;

            let workbook = base.reopen()?;
            tasks.spawn(self.ingest_sheet_task(
                job_id.to_string(),
                plan.clone(),
                workbook,
                Arc::clone(&checkpoint),
                Arc::clone(&rows_since_save),
                resume_offset,
            ));
        }

        let mut first_error: Option<TabliftError> = None;
        while let Some(joined) = tasks.join_next().await {
            let result = joined
                .map_err(|e| TabliftError::Cancelled(format!("ingest task: {e}")))?;
            if let Err(e) = result {
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }
        if let Some(e) = first_error {
            return Err(e);
        }

        // Totals are known now that every sheet has streamed through.
        let mut total = 0i64;
        for plan in &request.sheets {
            total += self.staging.count_raw(job_id, &plan.sheet_name).await?;
        }
        {
            let mut cp = checkpoint.lock().await;
            cp.total_rows = total as u64;
        }
        self.jobs.set_total_rows(job_id, total).await?;
        self.jobs
            .advance_status(job_id, JobStatus::IngestCompleted)
            .await?;
        Ok(())
    }

    /// The per-sheet ingest pipeline: a blocking parser task feeding the
    /// batch executor through a bounded channel; workers stage batches,
    /// bump counters, and advance the shared checkpoint.
    fn ingest_sheet_task(
        &self,
        job_id: String,
        plan: SheetPlan,
        mut workbook: Workbook,
        checkpoint: Arc<Mutex<Checkpoint>>,
        rows_since_save: Arc<AtomicU64>,
        resume_offset: u64,
    ) -> impl std::future::Future<Output = Result<()>> + Send + 'static {
        let jobs = self.jobs.clone();
        let staging = self.staging.clone();
        let checkpoints = Arc::clone(&self.checkpoints);
        let config = self.config.clone();

        async move {
            let sheet = plan.sheet_name.clone();
            let executor = BatchExecutor::new(
                config.effective_parallelism(),
                config.drain_timeout(),
            );
            let (tx, rx) = executor.channel();

            let parser_config = config.clone();
            let parser_bindings = Arc::clone(&plan.bindings);
            let parser_sheet = sheet.clone();
            let parser_handle = tokio::task::spawn_blocking(move || {
                let parser = StreamParser::new(parser_config)?.with_resume_offset(resume_offset);
                parser.process_sheet(
                    &mut workbook,
                    &parser_sheet,
                    &parser_bindings,
                    |batch| {
                        tx.blocking_send(batch)
                            .map_err(|_| TabliftError::Cancelled("batch workers stopped".into()))
                    },
                )
            });

            let process = {
                let jobs = jobs.clone();
                let staging = staging.clone();
                let checkpoints = Arc::clone(&checkpoints);
                let checkpoint = Arc::clone(&checkpoint);
                let rows_since_save = Arc::clone(&rows_since_save);
                let job_id = job_id.clone();
                let sheet = sheet.clone();
                let bindings = Arc::clone(&plan.bindings);
                let business_key = plan.business_key_field.clone();
                let interval = config.checkpoint_interval;

                move |_batch_number: u64, batch: Vec<tablift_ingest::binding::ParsedRow>| {
                    let jobs = jobs.clone();
                    let staging = staging.clone();
                    let checkpoints = Arc::clone(&checkpoints);
                    let checkpoint = Arc::clone(&checkpoint);
                    let rows_since_save = Arc::clone(&rows_since_save);
                    let job_id = job_id.clone();
                    let sheet = sheet.clone();
                    let bindings = Arc::clone(&bindings);
                    let business_key = business_key.clone();

                    async move {
                        let rows = batch.len() as u64;
                        staging
                            .insert_raw_batch(
                                &job_id,
                                &sheet,
                                &bindings,
                                business_key.as_deref(),
                                &batch,
                            )
                            .await?;
                        jobs.add_sheet_ingested(&job_id, &sheet, rows as i64).await?;
                        jobs.add_progress(&job_id, rows as i64).await?;

                        let pending = rows_since_save.fetch_add(rows, Ordering::Relaxed) + rows;
                        if pending >= interval {
                            rows_since_save.store(0, Ordering::Relaxed);
                            let snapshot = {
                                let mut cp = checkpoint.lock().await;
                                let processed = cp.processed_rows + pending;
                                cp.advance(processed);
                                cp.clone()
                            };
                            // Persisted off the worker; record processing
                            // never waits on checkpoint latency. Phase
                            // boundaries flush synchronously.
                            let store = Arc::clone(&checkpoints);
                            tokio::task::spawn_blocking(move || {
                                if let Err(e) = store.save(&snapshot) {
                                    warn!(error = %e, "Checkpoint save failed, continuing");
                                }
                            });
                        }
                        Ok(())
                    }
                }
            };

            let drain = executor.run(rx, process).await;
            let parse = parser_handle
                .await
                .map_err(|e| TabliftError::Cancelled(format!("parser task: {e}")))?;

            let result = match (parse, drain) {
                (Err(parse_err), _) => Err(parse_err),
                (Ok(_), Err(drain_err)) => Err(drain_err),
                (Ok(processing), Ok(stats)) => {
                    info!(
                        %job_id,
                        %sheet,
                        processed_rows = processing.processed_rows,
                        parse_errors = processing.error_count,
                        staged_records = stats.total_records,
                        "Sheet ingest complete"
                    );
                    Ok(())
                }
            };

            match result {
                Ok(()) => {
                    jobs.sheet_phase_ended(
                        &job_id,
                        &sheet,
                        Phase::Ingest,
                        JobStatus::IngestCompleted,
                    )
                    .await?;
                    Ok(())
                }
                Err(e) => {
                    jobs.fail_sheet(&job_id, &sheet, &e.to_string()).await.ok();
                    Err(e)
                }
            }
        }
    }

    // --- Validate -----------------------------------------------------------

    async fn validate_phase(&self, job_id: &str, sheets: &[SheetPlan]) -> Result<()> {
        self.jobs.advance_status(job_id, JobStatus::Validating).await?;

        for plan in sheets {
            let sheet = &plan.sheet_name;
            self.jobs
                .sheet_phase_started(job_id, sheet, Phase::Validate, JobStatus::Validating)
                .await?;

            let report = self.validation.run(job_id, sheet, &plan.rules).await?;
            if !report.all_succeeded() {
                let failed: Vec<&str> = report
                    .metrics
                    .iter()
                    .filter(|m| !m.success)
                    .map(|m| m.step_name.as_str())
                    .collect();
                let message = format!("validation steps failed: {}", failed.join(", "));
                self.jobs.fail_sheet(job_id, sheet, &message).await.ok();
                return Err(TabliftError::Validation(message));
            }

            let promoted = self.staging.promote_valid_rows(job_id, sheet).await?;
            info!(%job_id, %sheet, promoted, findings = report.total_findings(), "Sheet validated");

            self.jobs
                .sheet_phase_ended(job_id, sheet, Phase::Validate, JobStatus::Validated)
                .await?;
        }

        self.jobs.advance_status(job_id, JobStatus::Validated).await?;
        Ok(())
    }

    // --- Apply --------------------------------------------------------------

    async fn apply_phase(&self, job_id: &str, sheets: &[SheetPlan]) -> Result<()> {
        self.jobs.advance_status(job_id, JobStatus::Applying).await?;

        for plan in sheets {
            let sheet = &plan.sheet_name;
            self.jobs
                .sheet_phase_started(job_id, sheet, Phase::Apply, JobStatus::Applying)
                .await?;

            if let Some(target) = &plan.apply {
                match apply_sheet(self.jobs.pool(), job_id, sheet, target).await {
                    Ok(inserted) => info!(%job_id, %sheet, inserted, "Sheet applied"),
                    Err(e) => {
                        self.jobs.fail_sheet(job_id, sheet, &e.to_string()).await.ok();
                        return Err(e);
                    }
                }
            }

            self.jobs
                .sheet_phase_ended(job_id, sheet, Phase::Apply, JobStatus::Applied)
                .await?;
        }

        self.jobs.advance_status(job_id, JobStatus::Applied).await?;
        Ok(())
    }

    // --- Reconcile ----------------------------------------------------------

    async fn reconcile_phase(&self, job_id: &str, sheets: &[SheetPlan]) -> Result<()> {
        self.jobs
            .advance_status(job_id, JobStatus::Reconciling)
            .await?;

        let mut job_valid = 0i64;
        let mut job_errors = 0i64;
        let mut job_total = 0i64;

        for plan in sheets {
            let sheet = &plan.sheet_name;
            self.jobs
                .sheet_phase_started(job_id, sheet, Phase::Reconcile, JobStatus::Reconciling)
                .await?;

            let total = self.staging.count_raw(job_id, sheet).await?;
            let valid = self.staging.count_valid(job_id, sheet).await?;
            let errors = self.staging.count_error_rows(job_id, sheet).await?;
            let inserted = match &plan.apply {
                Some(target) => {
                    count_applied(self.jobs.pool(), job_id, sheet, target).await?
                }
                None => 0,
            };

            self.jobs
                .set_sheet_counters(job_id, sheet, total, valid, errors, inserted)
                .await?;
            self.jobs
                .sheet_phase_ended(job_id, sheet, Phase::Reconcile, JobStatus::Completed)
                .await?;

            info!(%job_id, %sheet, total, valid, errors, inserted, "Sheet reconciled");
            job_total += total;
            job_valid += valid;
            job_errors += errors;
        }

        self.jobs
            .set_job_totals(job_id, job_total, job_valid, job_errors)
            .await?;
        self.jobs.advance_status(job_id, JobStatus::Completed).await?;
        Ok(())
    }

    /// Resume-state snapshot of a session: how far it got, whether it can
    /// continue, and the raw checkpoint payload.
    pub async fn session_status(
        &self,
        session_id: &str,
    ) -> Result<RecoverableProcessingResult> {
        let checkpoint = self.checkpoints.load(session_id)?;
        let payload = match &checkpoint {
            Some(cp) => Some(serde_json::to_value(cp)?),
            None => self.jobs.load_checkpoint(session_id).await?,
        };

        Ok(match checkpoint {
            Some(cp) => RecoverableProcessingResult {
                session_id: cp.session_id.clone(),
                success: !cp.can_resume() && cp.processed_rows >= cp.total_rows,
                processed_batches: cp.processed_rows / self.config.batch_size.max(1) as u64,
                processed_rows: cp.processed_rows,
                progress_percent: cp.progress_percent(),
                checkpoint: payload,
            },
            None => RecoverableProcessingResult {
                session_id: session_id.to_string(),
                success: false,
                processed_batches: 0,
                processed_rows: 0,
                progress_percent: 0.0,
                checkpoint: payload,
            },
        })
    }

    // --- helpers ------------------------------------------------------------

    async fn resolve_job_id(&self, request: &MigrationRequest) -> Result<String> {
        if let Some(id) = &request.job_id {
            return Ok(id.clone());
        }
        let now = chrono::Utc::now();
        Ok(match request.id_format {
            JobIdFormat::Timestamped => timestamped_job_id(now),
            JobIdFormat::Dated => {
                let prefix = format!("JOB-{}-", now.format("%Y%m%d"));
                let sequence = self.jobs.next_dated_sequence(&prefix).await?;
                dated_job_id(now, sequence)
            }
        })
    }

    fn load_or_create_checkpoint(
        &self,
        session_id: &str,
        file_name: &str,
    ) -> Result<Arc<Mutex<Checkpoint>>> {
        let checkpoint = match self.checkpoints.load(session_id)? {
            Some(existing) => existing,
            None => Checkpoint::new(session_id, file_name, 0),
        };
        Ok(Arc::new(Mutex::new(checkpoint)))
    }

    /// Persist the current checkpoint to the file store and its durable
    /// mirror. Called at phase boundaries; never skipped.
    async fn flush_checkpoint(&self, checkpoint: &Arc<Mutex<Checkpoint>>) -> Result<()> {
        let snapshot = { checkpoint.lock().await.clone() };
        self.checkpoints.save(&snapshot)?;
        self.jobs
            .upsert_checkpoint(&snapshot.session_id, &serde_json::to_value(&snapshot)?)
            .await?;
        Ok(())
    }

    async fn finish_checkpoint(
        &self,
        checkpoint: &Arc<Mutex<Checkpoint>>,
        session_id: &str,
        success: bool,
    ) {
        let snapshot = {
            let mut cp = checkpoint.lock().await;
            if success {
                cp.complete();
            } else {
                cp.fail();
            }
            cp.clone()
        };
        if let Err(e) = self.checkpoints.save(&snapshot) {
            warn!(%session_id, error = %e, "Final checkpoint save failed");
        }
        if let Ok(payload) = serde_json::to_value(&snapshot) {
            self.jobs.upsert_checkpoint(session_id, &payload).await.ok();
        }
    }

    async fn assemble_result(&self, job_id: &str, times: PhaseTimes) -> Result<MigrationResult> {
        let job = self
            .jobs
            .get_job(job_id)
            .await?
            .ok_or_else(|| TabliftError::Persistence(format!("job {job_id} vanished")))?;
        let sheets = self.jobs.get_sheets(job_id).await?;
        let inserted: i64 = sheets.iter().map(|s| s.inserted_rows).sum();

        Ok(MigrationResult {
            job_id: job.job_id.clone(),
            status: job.status(),
            file_name: job.file_name,
            total_rows: job.total_rows,
            processed_rows: job.processed_rows,
            valid_rows: job.valid_rows,
            error_rows: job.error_rows,
            inserted_rows: inserted,
            phase: Phase::Reconcile,
            progress_percent: job.progress_percent,
            ingest_time_ms: times.ingest_ms,
            validate_time_ms: times.validate_ms,
            apply_time_ms: times.apply_ms,
            reconcile_time_ms: times.reconcile_ms,
            error_message: job.error_message,
        })
    }
}

/// How many of this job's valid rows are present in the master table.
async fn count_applied(
    pool: &PgPool,
    job_id: &str,
    sheet_name: &str,
    target: &ApplyTarget,
) -> Result<i64> {
    let valid = crate::store::valid_table(sheet_name);
    let sql = format!(
        r#"
        SELECT COUNT(*)
        FROM {valid} v
        JOIN {master} m ON m.{key} = v.payload->>'{field}'
        WHERE v.job_id = $1 AND v.sheet_name = $2
        "#,
        master = crate::apply::identifier(&target.master_table)?,
        key = crate::apply::identifier(&target.key_column)?,
        field = target.key_field.replace('\'', "''"),
    );
    let count: i64 = sqlx::query_scalar(&sql)
        .bind(job_id)
        .bind(sheet_name)
        .fetch_one(pool)
        .await
        .map_err(|e| TabliftError::Persistence(format!("count applied rows: {e}")))?;
    Ok(count)
}
