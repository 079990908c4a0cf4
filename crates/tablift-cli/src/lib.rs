//! Command-line surface for workbook migrations.

pub mod mapping;
pub mod progress;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Workbook-to-database migration tool
#[derive(Parser, Debug)]
#[command(name = "tablift")]
#[command(author, version, about = "Stream spreadsheet workbooks into a relational store")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Verbose output
    #[arg(short, long)]
    pub verbose: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a staged, resumable migration of one workbook
    Migrate {
        /// Workbook file to migrate
        #[arg(long)]
        file: PathBuf,

        /// Sheet mapping specification (JSON)
        #[arg(long)]
        mapping: PathBuf,

        /// Explicit job id; generated when omitted
        #[arg(long)]
        job_id: Option<String>,

        /// Generate a JOB-YYYYMMDD-NNN id instead of JOB_<ts>_<rand>
        #[arg(long)]
        dated_id: bool,

        /// Upper bound on data rows; 0 = unlimited
        #[arg(long, default_value_t = 0)]
        max_rows: u64,

        /// Recorded as the job's creator
        #[arg(long)]
        created_by: Option<String>,

        /// Batch worker pool size; 0 = one per CPU
        #[arg(long, default_value_t = 0)]
        parallelism: usize,

        /// Postgres connection string
        #[arg(long, env = "DATABASE_URL")]
        database_url: String,

        /// Directory for checkpoint files
        #[arg(long, default_value = "./checkpoints")]
        checkpoint_dir: PathBuf,

        /// Compress checkpoint files
        #[arg(long)]
        compress_checkpoints: bool,

        /// Resume this interrupted session id
        #[arg(long)]
        resume: Option<String>,
    },
}
