//! Persistence layer for jobs, sheets, and staging relations.

pub mod jobs;
pub mod staging;

pub use jobs::{JobRecord, JobSheetRecord, JobStore};
pub use staging::StagingStore;

use tablift_common::TabliftError;

/// Postgres unique-violation SQLSTATE.
const UNIQUE_VIOLATION: &str = "23505";

/// Map a sqlx error, surfacing unique-constraint hits as the distinct
/// `UniqueConflict` the orchestrator branches on instead of retrying.
pub(crate) fn map_db_error(operation: &str, constraint: &str, e: sqlx::Error) -> TabliftError {
    if let Some(db_err) = e.as_database_error() {
        if db_err.code().as_deref() == Some(UNIQUE_VIOLATION) {
            return TabliftError::UniqueConflict {
                constraint: constraint.to_string(),
                detail: db_err.message().to_string(),
            };
        }
    }
    TabliftError::Persistence(format!("{operation}: {e}"))
}

/// Reduce a sheet name to a safe SQL identifier suffix. Staging relation
/// names are built from these, never from raw input.
pub fn sheet_identifier(sheet_name: &str) -> String {
    let mut out = String::with_capacity(sheet_name.len());
    for c in sheet_name.chars() {
        let folded = tablift_ingest::binding::coerce::fold_diacritic(c);
        if folded.is_ascii_alphanumeric() {
            out.extend(folded.to_lowercase());
        } else {
            out.push('_');
        }
    }
    if out.is_empty() || out.starts_with(|c: char| c.is_ascii_digit()) {
        out.insert(0, 's');
    }
    out
}

/// `staging_raw_<sheet>` relation name
pub fn raw_table(sheet_name: &str) -> String {
    format!("staging_raw_{}", sheet_identifier(sheet_name))
}

/// `staging_valid_<sheet>` relation name
pub fn valid_table(sheet_name: &str) -> String {
    format!("staging_valid_{}", sheet_identifier(sheet_name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sheet_identifiers_are_safe() {
        assert_eq!(sheet_identifier("Employees"), "employees");
        assert_eq!(sheet_identifier("Nhân Viên"), "nhan_vien");
        assert_eq!(sheet_identifier("2024 Data"), "s2024_data");
        assert_eq!(sheet_identifier("a;DROP TABLE x"), "a_drop_table_x");
        assert_eq!(sheet_identifier(""), "s");
    }

    #[test]
    fn staging_table_names() {
        assert_eq!(raw_table("Employees"), "staging_raw_employees");
        assert_eq!(valid_table("Nhân Viên"), "staging_valid_nhan_vien");
    }
}
