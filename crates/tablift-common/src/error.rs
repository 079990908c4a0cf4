//! Error types for tablift

use thiserror::Error;

/// Result type alias for tablift operations
pub type Result<T> = std::result::Result<T, TabliftError>;

/// Main error type for tablift
///
/// Per-row coercion and validation failures are recovered locally and
/// counted; the variants here surface when an operation as a whole has to
/// stop. `UniqueConflict` and `RowLimitExceeded` carry structured fields
/// because callers branch on them rather than just printing them.
#[derive(Error, Debug)]
pub enum TabliftError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Source format error: {0}")]
    SourceFormat(String),

    #[error("Workbook contains no data rows after the header")]
    EmptyDataSet,

    #[error("Header row missing or no column matched a declared binding: {0}")]
    SchemaMismatch(String),

    #[error("Row limit of {limit} exceeded at data row {row}")]
    RowLimitExceeded { limit: u64, row: u64 },

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Coercion failed for field '{field}' at row {row}: {message}")]
    Coercion {
        field: String,
        row: u64,
        message: String,
    },

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Duplicate entry: {constraint} already holds ({detail})")]
    UniqueConflict { constraint: String, detail: String },

    #[error("Timed out after {elapsed_ms} ms: {operation}")]
    Timeout { operation: String, elapsed_ms: u64 },

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Archive error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("XML error: {0}")]
    Xml(#[from] quick_xml::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl TabliftError {
    /// Exit code for the CLI surface.
    ///
    /// 0 success, 1 validation/config error, 2 row-limit exceeded,
    /// 3 runtime/IO failure, 4 timeout.
    pub fn exit_code(&self) -> i32 {
        match self {
            TabliftError::Configuration(_)
            | TabliftError::Validation(_)
            | TabliftError::SchemaMismatch(_)
            | TabliftError::EmptyDataSet => 1,
            TabliftError::RowLimitExceeded { .. } => 2,
            TabliftError::Timeout { .. } => 4,
            _ => 3,
        }
    }

    /// True when the error is a storage-layer unique constraint firing.
    pub fn is_unique_conflict(&self) -> bool {
        matches!(self, TabliftError::UniqueConflict { .. })
    }
}
