//! Apply phase: bulk movement from `staging_valid_<sheet>` into master
//! tables.
//!
//! One `INSERT ... SELECT` per sheet with a LEFT JOIN on the business key
//! to suppress rows a previous attempt already applied, which keeps
//! retries idempotent without reading the master first.

use sqlx::PgPool;
use tracing::info;

use tablift_common::{Result, TabliftError};

use crate::store::valid_table;

/// One payload-field to master-column mapping
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ColumnMap {
    pub master_column: String,
    pub payload_field: String,
    /// SQL type the text payload value is cast to, when the master column
    /// is not text
    #[serde(default)]
    pub cast: Option<String>,
}

/// Destination description for one sheet's apply step
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ApplyTarget {
    pub master_table: String,
    /// Master column used to recognize already-applied rows
    pub key_column: String,
    /// Payload field feeding the key column
    pub key_field: String,
    pub columns: Vec<ColumnMap>,
}

impl ApplyTarget {
    pub fn new(master_table: &str, key_column: &str, key_field: &str) -> Self {
        Self {
            master_table: master_table.to_string(),
            key_column: key_column.to_string(),
            key_field: key_field.to_string(),
            columns: Vec::new(),
        }
    }

    pub fn column(mut self, master_column: &str, payload_field: &str) -> Self {
        self.columns.push(ColumnMap {
            master_column: master_column.to_string(),
            payload_field: payload_field.to_string(),
            cast: None,
        });
        self
    }

    pub fn column_as(mut self, master_column: &str, payload_field: &str, cast: &str) -> Self {
        self.columns.push(ColumnMap {
            master_column: master_column.to_string(),
            payload_field: payload_field.to_string(),
            cast: Some(cast.to_string()),
        });
        self
    }

    /// The idempotent bulk-insert statement. `$1` = job id, `$2` = sheet
    /// name.
    pub fn insert_sql(&self, sheet_name: &str) -> Result<String> {
        if self.columns.is_empty() {
            return Err(TabliftError::Configuration(format!(
                "apply target '{}' maps no columns",
                self.master_table
            )));
        }
        let master = identifier(&self.master_table)?;
        let key_column = identifier(&self.key_column)?;

        let mut column_list = Vec::with_capacity(self.columns.len());
        let mut select_list = Vec::with_capacity(self.columns.len());
        for map in &self.columns {
            column_list.push(identifier(&map.master_column)?.to_string());
            let value = format!("v.payload->>'{}'", map.payload_field.replace('\'', "''"));
            let expr = match &map.cast {
                Some(cast) => format!("({value})::{}", identifier(cast)?),
                None => value,
            };
            select_list.push(expr);
        }

        let valid = valid_table(sheet_name);
        let key_value = format!("v.payload->>'{}'", self.key_field.replace('\'', "''"));

        Ok(format!(
            r#"
            INSERT INTO {master} ({columns})
            SELECT {selects}
            FROM {valid} v
            LEFT JOIN {master} m ON m.{key_column} = {key_value}
            WHERE v.job_id = $1 AND v.sheet_name = $2
              AND m.{key_column} IS NULL
            "#,
            columns = column_list.join(", "),
            selects = select_list.join(", "),
        ))
    }
}

/// Run the apply step for one sheet. Returns rows inserted; rows already
/// present in the master are suppressed by the join.
pub async fn apply_sheet(
    pool: &PgPool,
    job_id: &str,
    sheet_name: &str,
    target: &ApplyTarget,
) -> Result<u64> {
    let sql = target.insert_sql(sheet_name)?;
    let inserted = sqlx::query(&sql)
        .bind(job_id)
        .bind(sheet_name)
        .execute(pool)
        .await
        .map_err(|e| {
            TabliftError::Persistence(format!("apply into {}: {e}", target.master_table))
        })?
        .rows_affected();

    info!(
        job_id,
        sheet = sheet_name,
        master_table = %target.master_table,
        inserted,
        "Apply step complete"
    );
    Ok(inserted)
}

pub(crate) fn identifier(name: &str) -> Result<&str> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.');
    if valid {
        Ok(name)
    } else {
        Err(TabliftError::Configuration(format!(
            "'{name}' is not a valid SQL identifier"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target() -> ApplyTarget {
        ApplyTarget::new("employees", "identity_card", "identity_card")
            .column("identity_card", "identity_card")
            .column("full_name", "full_name")
            .column_as("birth_date", "birth_date", "date")
            .column_as("salary", "salary", "numeric")
    }

    #[test]
    fn insert_select_suppresses_applied_rows() {
        let sql = target().insert_sql("Employees").unwrap();
        assert!(sql.contains("INSERT INTO employees"));
        assert!(sql.contains("FROM staging_valid_employees v"));
        assert!(sql.contains("LEFT JOIN employees m ON m.identity_card"));
        assert!(sql.contains("m.identity_card IS NULL"));
    }

    #[test]
    fn casts_wrap_payload_access() {
        let sql = target().insert_sql("Employees").unwrap();
        assert!(sql.contains("(v.payload->>'birth_date')::date"));
        assert!(sql.contains("(v.payload->>'salary')::numeric"));
        assert!(sql.contains("v.payload->>'full_name'"));
    }

    #[test]
    fn empty_column_map_is_rejected() {
        let empty = ApplyTarget::new("employees", "id", "id");
        assert!(empty.insert_sql("Employees").is_err());
    }

    #[test]
    fn malformed_identifiers_are_rejected() {
        let bad = ApplyTarget::new("employees; --", "id", "id").column("id", "id");
        assert!(bad.insert_sql("Employees").is_err());
    }
}
