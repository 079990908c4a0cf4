//! Sheet mapping specification.
//!
//! The CLI describes bindings, validation rules, and apply targets in a
//! JSON file; the same declarations a library consumer would make in
//! code. Binding sets built from the file land in the process-wide cache
//! keyed by record type.

use std::path::Path;
use std::sync::Arc;

use serde::Deserialize;

use tablift_common::{Result, TabliftError};
use tablift_ingest::binding::{cached_binding_set, BindingSet, ColumnBinding};
use tablift_migrate::{ApplyTarget, SheetPlan, ValidationRule};

/// Top-level mapping file
#[derive(Debug, Deserialize)]
pub struct MappingSpec {
    pub sheets: Vec<SheetSpec>,
}

/// One sheet's declarations
#[derive(Debug, Deserialize)]
pub struct SheetSpec {
    pub sheet_name: String,
    /// Cache key for the binding set
    pub record_type: String,
    pub bindings: Vec<ColumnBinding>,
    #[serde(default)]
    pub business_key_field: Option<String>,
    #[serde(default)]
    pub rules: Vec<ValidationRule>,
    #[serde(default)]
    pub apply: Option<ApplyTarget>,
}

impl MappingSpec {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            TabliftError::Configuration(format!("cannot read mapping {}: {e}", path.display()))
        })?;
        let spec: MappingSpec = serde_json::from_str(&text).map_err(|e| {
            TabliftError::Configuration(format!("malformed mapping {}: {e}", path.display()))
        })?;
        if spec.sheets.is_empty() {
            return Err(TabliftError::Configuration(
                "mapping declares no sheets".into(),
            ));
        }
        Ok(spec)
    }

    /// Turn the declarations into executable sheet plans.
    pub fn into_plans(self) -> Result<Vec<SheetPlan>> {
        self.sheets
            .into_iter()
            .map(|sheet| {
                let bindings: Arc<BindingSet> =
                    cached_binding_set(&sheet.record_type, || {
                        BindingSet::build(&sheet.record_type, sheet.bindings.clone())
                    })?;
                Ok(SheetPlan {
                    sheet_name: sheet.sheet_name,
                    bindings,
                    business_key_field: sheet.business_key_field,
                    rules: sheet.rules,
                    apply: sheet.apply,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAPPING: &str = r#"{
      "sheets": [
        {
          "sheet_name": "Employees",
          "record_type": "employee-cli-test",
          "bindings": [
            {"header_label": "Full Name", "field_name": "full_name", "kind": "string", "required": true},
            {"header_label": "Identity Card", "field_name": "identity_card", "kind": "string", "required": false},
            {"header_label": "Birth Date", "field_name": "birth_date", "kind": "date", "required": false}
          ],
          "business_key_field": "identity_card",
          "rules": [
            {"rule": "required", "field": "full_name"},
            {"rule": "duplicate_in_file", "field": "identity_card"},
            {"rule": "foreign_key_exists", "field": "dept", "master_table": "departments", "master_column": "code"}
          ],
          "apply": {
            "master_table": "employees",
            "key_column": "identity_card",
            "key_field": "identity_card",
            "columns": [
              {"master_column": "identity_card", "payload_field": "identity_card"},
              {"master_column": "full_name", "payload_field": "full_name"},
              {"master_column": "birth_date", "payload_field": "birth_date", "cast": "date"}
            ]
          }
        }
      ]
    }"#;

    #[test]
    fn mapping_parses_into_plans() {
        let spec: MappingSpec = serde_json::from_str(MAPPING).unwrap();
        let plans = spec.into_plans().unwrap();
        assert_eq!(plans.len(), 1);

        let plan = &plans[0];
        assert_eq!(plan.sheet_name, "Employees");
        assert_eq!(plan.bindings.len(), 3);
        assert_eq!(plan.business_key_field.as_deref(), Some("identity_card"));
        assert_eq!(plan.rules.len(), 3);
        assert!(plan.apply.is_some());
    }

    #[test]
    fn duplicate_header_in_mapping_is_a_config_error() {
        let bad = r#"{
          "sheets": [{
            "sheet_name": "S",
            "record_type": "dup-cli-test",
            "bindings": [
              {"header_label": "A", "field_name": "a", "kind": "string", "required": false},
              {"header_label": "A", "field_name": "b", "kind": "string", "required": false}
            ]
          }]
        }"#;
        let spec: MappingSpec = serde_json::from_str(bad).unwrap();
        assert!(matches!(
            spec.into_plans(),
            Err(TabliftError::Configuration(_))
        ));
    }

    #[test]
    fn empty_mapping_is_rejected() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("empty.json");
        std::fs::write(&path, r#"{"sheets": []}"#).unwrap();
        assert!(MappingSpec::load(&path).is_err());
    }
}
