//! Tablift - workbook migration tool

use std::process;

use clap::Parser;
use sqlx::postgres::PgPoolOptions;
use tracing::{error, info};

use tablift_cli::mapping::MappingSpec;
use tablift_cli::{progress, Cli, Commands};
use tablift_common::logging::{init_logging, LogConfig, LogLevel};
use tablift_common::types::JobIdFormat;
use tablift_common::{ImportConfig, TabliftError};
use tablift_ingest::checkpoint::{CheckpointEncoding, CheckpointStore};
use tablift_migrate::orchestrator::{prepare_schema, MigrationOrchestrator, MigrationRequest};

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let mut log_config = LogConfig::from_env().unwrap_or_default();
    if cli.verbose {
        log_config.level = LogLevel::Debug;
    }
    log_config.log_file_prefix = "tablift".to_string();
    let _log_guard = init_logging(&log_config);

    let result = run(cli).await;
    if let Err(e) = result {
        error!(error = %e, "Migration failed");
        eprintln!("Error: {e}");
        process::exit(e.exit_code());
    }
}

async fn run(cli: Cli) -> Result<(), TabliftError> {
    match cli.command {
        Commands::Migrate {
            file,
            mapping,
            job_id,
            dated_id,
            max_rows,
            created_by,
            parallelism,
            database_url,
            checkpoint_dir,
            compress_checkpoints,
            resume,
        } => {
            let mut config = ImportConfig::from_env()?;
            config.max_rows = max_rows;
            if parallelism > 0 {
                config.parallelism = parallelism;
            }
            config.validate()?;

            let plans = MappingSpec::load(&mapping)?.into_plans()?;

            let pool = PgPoolOptions::new()
                .max_connections(config.effective_parallelism() as u32 + 4)
                .connect(&database_url)
                .await
                .map_err(|e| TabliftError::Persistence(format!("connect to database: {e}")))?;
            prepare_schema(&pool).await?;

            let encoding = if compress_checkpoints {
                CheckpointEncoding::GzipJson
            } else {
                CheckpointEncoding::Json
            };
            let checkpoints = CheckpointStore::open(&checkpoint_dir, encoding)?;
            let orchestrator = MigrationOrchestrator::new(pool, config, checkpoints)?;

            if let Some(session) = &resume {
                let status = orchestrator.session_status(session).await?;
                info!(
                    session_id = %status.session_id,
                    processed_rows = status.processed_rows,
                    progress = format!("{:.1}%", status.progress_percent),
                    "Resuming session"
                );
            }

            let request = MigrationRequest {
                file_path: file.clone(),
                job_id,
                id_format: if dated_id {
                    JobIdFormat::Dated
                } else {
                    JobIdFormat::Timestamped
                },
                created_by,
                sheets: plans,
                resume_session: resume,
            };

            let spinner =
                progress::migration_spinner(&format!("Migrating {}", file.display()));
            let result = orchestrator.migrate(request).await;
            spinner.finish_and_clear();

            let result = result?;
            info!(
                job_id = %result.job_id,
                status = %result.status,
                total_rows = result.total_rows,
                "Migration finished"
            );
            println!("{}", progress::format_summary(&result));
            Ok(())
        }
    }
}
