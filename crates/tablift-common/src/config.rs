//! Runtime configuration for workbook migration runs

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{Result, TabliftError};

/// Configuration bundle for one migration run
///
/// Every recognized option of the pipeline lives here. Validator closures
/// are not part of the bundle; they are registered on the parser builder
/// because they are code, not data. `validate()` rejects out-of-range
/// options before any work starts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportConfig {
    /// Records per emitted batch
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Upper bound on data rows; 0 = unlimited. Enforced inline during
    /// streaming, never after buffering.
    #[serde(default)]
    pub max_rows: u64,

    /// Advisory ceiling for in-flight memory
    #[serde(default = "default_memory_threshold_mb")]
    pub memory_threshold_mb: usize,

    /// Enables the concurrent batch executor
    #[serde(default = "default_true")]
    pub parallel_processing: bool,

    /// Batch worker pool size; 0 = one per CPU
    #[serde(default)]
    pub parallelism: usize,

    /// Emits progress metrics at `progress_report_interval`
    #[serde(default = "default_true")]
    pub enable_progress_tracking: bool,

    /// Records between progress emissions
    #[serde(default = "default_progress_interval")]
    pub progress_report_interval: u64,

    /// A validation error aborts the row/sheet instead of accumulating
    #[serde(default)]
    pub strict_validation: bool,

    /// Abort the whole job on the first error
    #[serde(default)]
    pub fail_on_first_error: bool,

    /// Fields that must be non-null (and non-blank for strings)
    #[serde(default)]
    pub required_fields: Vec<String>,

    /// Fields checked for in-file duplicates during the parse
    #[serde(default)]
    pub unique_fields: Vec<String>,

    /// Zero-based index of the header row
    #[serde(default)]
    pub header_row_index: u32,

    /// Zero-based index of the first data row
    #[serde(default = "default_data_start")]
    pub data_start_row_index: u32,

    /// Ordered sheet names for multi-sheet runs; empty = first sheet only
    #[serde(default)]
    pub sheet_names: Vec<String>,

    /// Records between checkpoint persists
    #[serde(default = "default_checkpoint_interval")]
    pub checkpoint_interval: u64,

    /// Per validation step timeout in seconds
    #[serde(default = "default_step_timeout")]
    pub step_timeout_secs: u64,

    /// Whole-job timeout in seconds
    #[serde(default = "default_job_timeout")]
    pub job_timeout_secs: u64,

    /// Batch executor drain timeout in seconds
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout_secs: u64,
}

fn default_batch_size() -> usize {
    5000
}

fn default_memory_threshold_mb() -> usize {
    512
}

fn default_progress_interval() -> u64 {
    10_000
}

fn default_data_start() -> u32 {
    1
}

fn default_checkpoint_interval() -> u64 {
    10_000
}

fn default_step_timeout() -> u64 {
    300
}

fn default_job_timeout() -> u64 {
    1800
}

fn default_drain_timeout() -> u64 {
    600
}

fn default_true() -> bool {
    true
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            max_rows: 0,
            memory_threshold_mb: default_memory_threshold_mb(),
            parallel_processing: true,
            parallelism: 0,
            enable_progress_tracking: true,
            progress_report_interval: default_progress_interval(),
            strict_validation: false,
            fail_on_first_error: false,
            required_fields: Vec::new(),
            unique_fields: Vec::new(),
            header_row_index: 0,
            data_start_row_index: default_data_start(),
            sheet_names: Vec::new(),
            checkpoint_interval: default_checkpoint_interval(),
            step_timeout_secs: default_step_timeout(),
            job_timeout_secs: default_job_timeout(),
            drain_timeout_secs: default_drain_timeout(),
        }
    }
}

impl ImportConfig {
    /// Load configuration from environment variables, falling back to the
    /// defaults above for anything unset.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(v) = std::env::var("TABLIFT_BATCH_SIZE") {
            config.batch_size = v
                .parse()
                .map_err(|_| TabliftError::Configuration(format!("TABLIFT_BATCH_SIZE: {v}")))?;
        }
        if let Ok(v) = std::env::var("TABLIFT_MAX_ROWS") {
            config.max_rows = v
                .parse()
                .map_err(|_| TabliftError::Configuration(format!("TABLIFT_MAX_ROWS: {v}")))?;
        }
        if let Ok(v) = std::env::var("TABLIFT_PARALLELISM") {
            config.parallelism = v
                .parse()
                .map_err(|_| TabliftError::Configuration(format!("TABLIFT_PARALLELISM: {v}")))?;
        }
        if let Ok(v) = std::env::var("TABLIFT_PARALLEL_PROCESSING") {
            config.parallel_processing = v.parse().unwrap_or(true);
        }
        if let Ok(v) = std::env::var("TABLIFT_PROGRESS_INTERVAL") {
            config.progress_report_interval = v.parse().unwrap_or(default_progress_interval());
        }
        if let Ok(v) = std::env::var("TABLIFT_STRICT_VALIDATION") {
            config.strict_validation = v.parse().unwrap_or(false);
        }
        if let Ok(v) = std::env::var("TABLIFT_CHECKPOINT_INTERVAL") {
            config.checkpoint_interval = v.parse().unwrap_or(default_checkpoint_interval());
        }
        if let Ok(v) = std::env::var("TABLIFT_STEP_TIMEOUT_SECS") {
            config.step_timeout_secs = v.parse().unwrap_or(default_step_timeout());
        }
        if let Ok(v) = std::env::var("TABLIFT_JOB_TIMEOUT_SECS") {
            config.job_timeout_secs = v.parse().unwrap_or(default_job_timeout());
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(TabliftError::Configuration(
                "batch_size must be greater than 0".into(),
            ));
        }
        if self.data_start_row_index <= self.header_row_index {
            return Err(TabliftError::Configuration(format!(
                "data_start_row_index ({}) must be after header_row_index ({})",
                self.data_start_row_index, self.header_row_index
            )));
        }
        if self.step_timeout_secs == 0 || self.job_timeout_secs == 0 || self.drain_timeout_secs == 0
        {
            return Err(TabliftError::Configuration(
                "timeouts must be greater than 0".into(),
            ));
        }
        Ok(())
    }

    /// Effective worker pool size
    pub fn effective_parallelism(&self) -> usize {
        if !self.parallel_processing {
            return 1;
        }
        if self.parallelism > 0 {
            self.parallelism
        } else {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4)
        }
    }

    pub fn step_timeout(&self) -> Duration {
        Duration::from_secs(self.step_timeout_secs)
    }

    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_secs)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = ImportConfig::default();
        assert_eq!(config.batch_size, 5000);
        assert_eq!(config.max_rows, 0);
        assert_eq!(config.progress_report_interval, 10_000);
        assert_eq!(config.header_row_index, 0);
        assert_eq!(config.data_start_row_index, 1);
        assert_eq!(config.step_timeout_secs, 300);
        assert_eq!(config.job_timeout_secs, 1800);
        assert_eq!(config.drain_timeout_secs, 600);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn zero_batch_size_is_rejected() {
        let config = ImportConfig {
            batch_size: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn header_after_data_start_is_rejected() {
        let config = ImportConfig {
            header_row_index: 3,
            data_start_row_index: 2,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn effective_parallelism_honors_flag() {
        let serial = ImportConfig {
            parallel_processing: false,
            parallelism: 8,
            ..Default::default()
        };
        assert_eq!(serial.effective_parallelism(), 1);

        let explicit = ImportConfig {
            parallelism: 3,
            ..Default::default()
        };
        assert_eq!(explicit.effective_parallelism(), 3);
    }
}
