//! Set-based SQL validation.
//!
//! Rules never touch rows one at a time: each rule compiles to one
//! statement over `staging_raw_<sheet>` that writes its findings into
//! `staging_error`. Join-shaped rules use the `LEFT JOIN ... IS NULL`
//! idiom; foreign-key checks materialize the distinct staging keys into a
//! scratch temp relation and join the master exactly once. Every step runs
//! under a timeout and emits a structured metric; the report names the
//! bottleneck step.

use std::time::{Duration, Instant};

use sqlx::PgPool;
use tracing::{info, warn};

use tablift_common::{Result, TabliftError};

use crate::store::raw_table;

/// The prescribed rule vocabulary
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum ValidationRule {
    /// Field must be present and non-blank
    Required { field: String },
    /// Field must hold an ISO date (coercion already normalized it)
    DateFormat { field: String },
    /// Field must be numeric
    NumericFormat { field: String },
    /// Field must be one of the allowed values
    EnumValue { field: String, allowed: Vec<String> },
    /// Field value must not repeat within the file
    DuplicateInFile { field: String },
    /// Field value must not already exist in a master table
    DuplicateVsMaster {
        field: String,
        master_table: String,
        master_column: String,
    },
    /// Field value must reference an existing master row
    ForeignKeyExists {
        field: String,
        master_table: String,
        master_column: String,
    },
}

impl ValidationRule {
    pub fn step_name(&self) -> String {
        match self {
            ValidationRule::Required { field } => format!("required:{field}"),
            ValidationRule::DateFormat { field } => format!("date_format:{field}"),
            ValidationRule::NumericFormat { field } => format!("numeric_format:{field}"),
            ValidationRule::EnumValue { field, .. } => format!("enum_value:{field}"),
            ValidationRule::DuplicateInFile { field } => format!("duplicate_in_file:{field}"),
            ValidationRule::DuplicateVsMaster { field, .. } => {
                format!("duplicate_vs_master:{field}")
            }
            ValidationRule::ForeignKeyExists { field, .. } => format!("foreign_key:{field}"),
        }
    }

    fn error_code(&self) -> String {
        self.step_name().to_uppercase().replace(':', "_")
    }
}

/// Structured outcome of one validation step
#[derive(Debug, Clone)]
pub struct StepMetric {
    pub step_name: String,
    pub duration_ms: u64,
    pub rows_affected: u64,
    pub success: bool,
}

/// All step metrics for one sheet's validation run
#[derive(Debug, Clone, Default)]
pub struct ValidationReport {
    pub metrics: Vec<StepMetric>,
    pub total_duration_ms: u64,
}

impl ValidationReport {
    pub fn all_succeeded(&self) -> bool {
        self.metrics.iter().all(|m| m.success)
    }

    /// Total findings written by successful steps.
    pub fn total_findings(&self) -> u64 {
        self.metrics
            .iter()
            .filter(|m| m.success)
            .map(|m| m.rows_affected)
            .sum()
    }

    /// The slowest step and its share of total duration.
    pub fn bottleneck(&self) -> Option<(&StepMetric, f64)> {
        let slowest = self.metrics.iter().max_by_key(|m| m.duration_ms)?;
        let percentage = if self.total_duration_ms > 0 {
            slowest.duration_ms as f64 / self.total_duration_ms as f64 * 100.0
        } else {
            0.0
        };
        Some((slowest, percentage))
    }
}

/// Rule runner for one database
pub struct ValidationEngine {
    pool: PgPool,
    step_timeout: Duration,
}

impl ValidationEngine {
    pub fn new(pool: PgPool, step_timeout: Duration) -> Self {
        Self { pool, step_timeout }
    }

    /// Run every rule against one sheet's raw staging. Failed or timed-out
    /// steps are recorded and the remaining steps still run; the caller
    /// fails the phase when `all_succeeded()` is false.
    pub async fn run(
        &self,
        job_id: &str,
        sheet_name: &str,
        rules: &[ValidationRule],
    ) -> Result<ValidationReport> {
        let started = Instant::now();
        let mut report = ValidationReport::default();

        for rule in rules {
            let step_name = rule.step_name();
            let step_started = Instant::now();

            let outcome =
                tokio::time::timeout(self.step_timeout, self.run_rule(job_id, sheet_name, rule))
                    .await;

            let duration_ms = step_started.elapsed().as_millis() as u64;
            let metric = match outcome {
                Ok(Ok(rows_affected)) => StepMetric {
                    step_name: step_name.clone(),
                    duration_ms,
                    rows_affected,
                    success: true,
                },
                Ok(Err(e)) => {
                    warn!(step = %step_name, error = %e, "Validation step failed");
                    StepMetric {
                        step_name: step_name.clone(),
                        duration_ms,
                        rows_affected: 0,
                        success: false,
                    }
                }
                Err(_) => {
                    // Dropping the in-flight future cancels the statement.
                    warn!(
                        step = %step_name,
                        timeout_ms = self.step_timeout.as_millis() as u64,
                        "Validation step timed out"
                    );
                    StepMetric {
                        step_name: step_name.clone(),
                        duration_ms,
                        rows_affected: 0,
                        success: false,
                    }
                }
            };

            info!(
                step_name = %metric.step_name,
                duration_ms = metric.duration_ms,
                rows_affected = metric.rows_affected,
                success = metric.success,
                "Validation step"
            );
            report.metrics.push(metric);
        }

        report.total_duration_ms = started.elapsed().as_millis() as u64;

        if let Some((slowest, percentage)) = report.bottleneck() {
            info!(
                sheet = sheet_name,
                bottleneck = %slowest.step_name,
                duration_ms = slowest.duration_ms,
                percentage = format!("{percentage:.1}"),
                total_duration_ms = report.total_duration_ms,
                findings = report.total_findings(),
                "Validation complete"
            );
        }

        Ok(report)
    }

    async fn run_rule(
        &self,
        job_id: &str,
        sheet_name: &str,
        rule: &ValidationRule,
    ) -> Result<u64> {
        match rule {
            ValidationRule::ForeignKeyExists {
                field,
                master_table,
                master_column,
            } => {
                self.run_foreign_key(job_id, sheet_name, rule, field, master_table, master_column)
                    .await
            }
            ValidationRule::EnumValue { field: _, allowed } => {
                let sql = rule_sql(rule, sheet_name)?;
                let affected = sqlx::query(&sql)
                    .bind(job_id)
                    .bind(sheet_name)
                    .bind(allowed)
                    .execute(&self.pool)
                    .await
                    .map_err(|e| {
                        TabliftError::Persistence(format!("{}: {e}", rule.step_name()))
                    })?
                    .rows_affected();
                Ok(affected)
            }
            _ => {
                let sql = rule_sql(rule, sheet_name)?;
                let affected = sqlx::query(&sql)
                    .bind(job_id)
                    .bind(sheet_name)
                    .execute(&self.pool)
                    .await
                    .map_err(|e| {
                        TabliftError::Persistence(format!("{}: {e}", rule.step_name()))
                    })?
                    .rows_affected();
                Ok(affected)
            }
        }
    }

    /// Foreign-key check in one transaction: materialize distinct keys
    /// into a scratch temp table, LEFT JOIN the master once, mark the rows
    /// whose key found no match.
    async fn run_foreign_key(
        &self,
        job_id: &str,
        sheet_name: &str,
        rule: &ValidationRule,
        field: &str,
        master_table: &str,
        master_column: &str,
    ) -> Result<u64> {
        let raw = raw_table(sheet_name);
        let master = checked_identifier(master_table)?;
        let column = checked_identifier(master_column)?;
        let value = json_field(field);
        let code = rule.error_code();

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| TabliftError::Persistence(format!("begin fk check: {e}")))?;

        let scratch_sql = format!(
            r#"
            CREATE TEMP TABLE scratch_keys ON COMMIT DROP AS
            SELECT DISTINCT {value} AS key
            FROM {raw}
            WHERE job_id = $1 AND sheet_name = $2 AND {value} IS NOT NULL
            "#
        );
        sqlx::query(&scratch_sql)
            .bind(job_id)
            .bind(sheet_name)
            .execute(&mut *tx)
            .await
            .map_err(|e| TabliftError::Persistence(format!("materialize scratch keys: {e}")))?;

        let mark_sql = format!(
            r#"
            INSERT INTO staging_error (job_id, sheet_name, row_num, error_code, error_message)
            SELECT r.job_id, r.sheet_name, r.row_num, '{code}',
                   '{field_label} references a missing {master} row'
            FROM {raw} r
            JOIN (
                SELECT s.key
                FROM scratch_keys s
                LEFT JOIN {master} m ON m.{column} = s.key
                WHERE m.{column} IS NULL
            ) missing ON missing.key = {value_r}
            WHERE r.job_id = $1 AND r.sheet_name = $2
            "#,
            field_label = sql_literal(field),
            value_r = json_field_on("r", field),
        );
        let affected = sqlx::query(&mark_sql)
            .bind(job_id)
            .bind(sheet_name)
            .execute(&mut *tx)
            .await
            .map_err(|e| TabliftError::Persistence(format!("mark missing keys: {e}")))?
            .rows_affected();

        tx.commit()
            .await
            .map_err(|e| TabliftError::Persistence(format!("commit fk check: {e}")))?;

        Ok(affected)
    }
}

/// SQL for every single-statement rule. `$1` = job id, `$2` = sheet name;
/// enum rules additionally bind `$3` = allowed values.
fn rule_sql(rule: &ValidationRule, sheet_name: &str) -> Result<String> {
    let raw = raw_table(sheet_name);

    let sql = match rule {
        ValidationRule::Required { field } => {
            let value = json_field_on("r", field);
            format!(
                r#"
                INSERT INTO staging_error (job_id, sheet_name, row_num, error_code, error_message)
                SELECT r.job_id, r.sheet_name, r.row_num, '{code}', '{field} is required'
                FROM {raw} r
                WHERE r.job_id = $1 AND r.sheet_name = $2
                  AND ({value} IS NULL OR btrim({value}) = '')
                "#,
                code = rule.error_code(),
                field = sql_literal(field),
            )
        }
        ValidationRule::DateFormat { field } => {
            let value = json_field_on("r", field);
            format!(
                r#"
                INSERT INTO staging_error (job_id, sheet_name, row_num, error_code, error_message)
                SELECT r.job_id, r.sheet_name, r.row_num, '{code}', '{field} is not a valid date'
                FROM {raw} r
                WHERE r.job_id = $1 AND r.sheet_name = $2
                  AND {value} IS NOT NULL
                  AND {value} !~ '^\d{{4}}-\d{{2}}-\d{{2}}'
                "#,
                code = rule.error_code(),
                field = sql_literal(field),
            )
        }
        ValidationRule::NumericFormat { field } => {
            let value = json_field_on("r", field);
            format!(
                r#"
                INSERT INTO staging_error (job_id, sheet_name, row_num, error_code, error_message)
                SELECT r.job_id, r.sheet_name, r.row_num, '{code}', '{field} is not numeric'
                FROM {raw} r
                WHERE r.job_id = $1 AND r.sheet_name = $2
                  AND {value} IS NOT NULL
                  AND {value} !~ '^[+-]?\d+(\.\d+)?$'
                "#,
                code = rule.error_code(),
                field = sql_literal(field),
            )
        }
        ValidationRule::EnumValue { field, .. } => {
            let value = json_field_on("r", field);
            format!(
                r#"
                INSERT INTO staging_error (job_id, sheet_name, row_num, error_code, error_message)
                SELECT r.job_id, r.sheet_name, r.row_num, '{code}', '{field} holds an unknown value'
                FROM {raw} r
                WHERE r.job_id = $1 AND r.sheet_name = $2
                  AND {value} IS NOT NULL
                  AND NOT ({value} = ANY($3))
                "#,
                code = rule.error_code(),
                field = sql_literal(field),
            )
        }
        ValidationRule::DuplicateInFile { field } => {
            let value = json_field(field);
            let value_r = json_field_on("r", field);
            format!(
                r#"
                INSERT INTO staging_error (job_id, sheet_name, row_num, error_code, error_message)
                SELECT r.job_id, r.sheet_name, r.row_num, '{code}', '{field} repeats within the file'
                FROM {raw} r
                JOIN (
                    SELECT {value} AS val, MIN(row_num) AS first_row
                    FROM {raw}
                    WHERE job_id = $1 AND sheet_name = $2 AND {value} IS NOT NULL
                    GROUP BY 1
                    HAVING COUNT(*) > 1
                ) d ON d.val = {value_r}
                WHERE r.job_id = $1 AND r.sheet_name = $2
                  AND r.row_num <> d.first_row
                "#,
                code = rule.error_code(),
                field = sql_literal(field),
            )
        }
        ValidationRule::DuplicateVsMaster {
            field,
            master_table,
            master_column,
        } => {
            let master = checked_identifier(master_table)?;
            let column = checked_identifier(master_column)?;
            let value_r = json_field_on("r", field);
            format!(
                r#"
                INSERT INTO staging_error (job_id, sheet_name, row_num, error_code, error_message)
                SELECT r.job_id, r.sheet_name, r.row_num, '{code}', '{field} already exists in {master}'
                FROM {raw} r
                LEFT JOIN {master} m ON m.{column} = {value_r}
                WHERE r.job_id = $1 AND r.sheet_name = $2
                  AND m.{column} IS NOT NULL
                "#,
                code = rule.error_code(),
                field = sql_literal(field),
            )
        }
        ValidationRule::ForeignKeyExists { .. } => {
            return Err(TabliftError::Configuration(
                "foreign-key rules run through the scratch-table path".into(),
            ))
        }
    };

    Ok(sql)
}

/// `payload->>'field'` with the field name made literal-safe.
fn json_field(field: &str) -> String {
    format!("payload->>'{}'", sql_literal(field))
}

fn json_field_on(alias: &str, field: &str) -> String {
    format!("{alias}.payload->>'{}'", sql_literal(field))
}

fn sql_literal(text: &str) -> String {
    text.replace('\'', "''")
}

/// Master table/column names come from code, but they still have to look
/// like identifiers before they are spliced into SQL.
fn checked_identifier(name: &str) -> Result<&str> {
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

    #[test]
    fn required_rule_scans_raw_staging() {
        let rule = ValidationRule::Required {
            field: "full_name".into(),
        };
        let sql = rule_sql(&rule, "Employees").unwrap();
        assert!(sql.contains("staging_raw_employees"));
        assert!(sql.contains("payload->>'full_name'"));
        assert!(sql.contains("REQUIRED_FULL_NAME"));
        assert!(sql.contains("btrim"));
    }

    #[test]
    fn duplicate_vs_master_uses_left_join() {
        let rule = ValidationRule::DuplicateVsMaster {
            field: "identity_card".into(),
            master_table: "employees".into(),
            master_column: "identity_card".into(),
        };
        let sql = rule_sql(&rule, "Employees").unwrap();
        assert!(sql.contains("LEFT JOIN employees m"));
        assert!(sql.contains("IS NOT NULL"));
    }

    #[test]
    fn duplicate_in_file_keeps_first_occurrence() {
        let rule = ValidationRule::DuplicateInFile {
            field: "identity_card".into(),
        };
        let sql = rule_sql(&rule, "Employees").unwrap();
        assert!(sql.contains("MIN(row_num)"));
        assert!(sql.contains("HAVING COUNT(*) > 1"));
        assert!(sql.contains("r.row_num <> d.first_row"));
    }

    #[test]
    fn foreign_key_rules_refuse_single_statement_path() {
        let rule = ValidationRule::ForeignKeyExists {
            field: "dept".into(),
            master_table: "departments".into(),
            master_column: "code".into(),
        };
        assert!(rule_sql(&rule, "Employees").is_err());
    }

    #[test]
    fn bad_master_identifiers_are_rejected() {
        assert!(checked_identifier("employees").is_ok());
        assert!(checked_identifier("public.employees").is_ok());
        assert!(checked_identifier("emp; DROP TABLE x").is_err());
        assert!(checked_identifier("").is_err());
    }

    #[test]
    fn field_names_are_literal_escaped() {
        assert_eq!(json_field("o'clock"), "payload->>'o''clock'");
    }

    #[test]
    fn bottleneck_identifies_slowest_step_with_percentage() {
        let report = ValidationReport {
            metrics: vec![
                StepMetric {
                    step_name: "required:a".into(),
                    duration_ms: 100,
                    rows_affected: 0,
                    success: true,
                },
                StepMetric {
                    step_name: "foreign_key:b".into(),
                    duration_ms: 700,
                    rows_affected: 3,
                    success: true,
                },
                StepMetric {
                    step_name: "enum_value:c".into(),
                    duration_ms: 200,
                    rows_affected: 1,
                    success: true,
                },
            ],
            total_duration_ms: 1000,
        };

        let (slowest, pct) = report.bottleneck().unwrap();
        assert_eq!(slowest.step_name, "foreign_key:b");
        assert!((pct - 70.0).abs() < f64::EPSILON);
        assert_eq!(report.total_findings(), 4);
        assert!(report.all_succeeded());
    }

    #[test]
    fn failed_steps_fail_the_report() {
        let report = ValidationReport {
            metrics: vec![StepMetric {
                step_name: "required:a".into(),
                duration_ms: 10,
                rows_affected: 0,
                success: false,
            }],
            total_duration_ms: 10,
        };
        assert!(!report.all_succeeded());
        assert_eq!(report.total_findings(), 0);
    }

    #[test]
    fn step_names_and_codes() {
        let rule = ValidationRule::DateFormat {
            field: "birth_date".into(),
        };
        assert_eq!(rule.step_name(), "date_format:birth_date");
        assert_eq!(rule.error_code(), "DATE_FORMAT_BIRTH_DATE");
    }
}
