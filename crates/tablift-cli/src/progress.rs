//! Progress indicators for long-running migrations.

use indicatif::{ProgressBar, ProgressStyle};

/// Spinner for the whole migration run.
pub fn migration_spinner(message: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.green} [{elapsed_precise}] {msg}")
            .expect("Invalid spinner template"),
    );
    pb.set_message(message.to_string());
    pb.enable_steady_tick(std::time::Duration::from_millis(100));
    pb
}

/// One-line summary of a finished migration.
pub fn format_summary(result: &tablift_common::types::MigrationResult) -> String {
    format!(
        "{} {} | {} rows ({} valid, {} errors, {} inserted) | ingest {}ms, validate {}ms, apply {}ms, reconcile {}ms",
        result.job_id,
        result.status,
        result.total_rows,
        result.valid_rows,
        result.error_rows,
        result.inserted_rows,
        result.ingest_time_ms,
        result.validate_time_ms,
        result.apply_time_ms,
        result.reconcile_time_ms,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tablift_common::types::{JobStatus, MigrationResult, Phase};

    #[test]
    fn summary_names_the_job_and_counts() {
        let result = MigrationResult {
            job_id: "JOB-20260801-001".into(),
            status: JobStatus::Completed,
            file_name: "payroll.xlsx".into(),
            total_rows: 100,
            processed_rows: 100,
            valid_rows: 98,
            error_rows: 2,
            inserted_rows: 98,
            phase: Phase::Reconcile,
            progress_percent: 100.0,
            ingest_time_ms: 1200,
            validate_time_ms: 300,
            apply_time_ms: 150,
            reconcile_time_ms: 20,
            error_message: None,
        };
        let summary = format_summary(&result);
        assert!(summary.contains("JOB-20260801-001"));
        assert!(summary.contains("COMPLETED"));
        assert!(summary.contains("98 inserted"));
    }
}
