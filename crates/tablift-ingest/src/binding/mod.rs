//! Declarative column-to-field binding.
//!
//! A [`BindingSet`] is the ordered binding table for one record type. It is
//! built once, validated at construction, and cached process-wide; the
//! per-row path works on precomputed slot indices and coercion policies
//! with no metadata lookups.

pub mod coerce;

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, OnceLock, RwLock};

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

use tablift_common::types::{CellFormatHint, FieldKind};
use tablift_common::{Result, TabliftError};

use coerce::CoercePolicy;

/// A typed cell value after coercion
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Text(String),
    Integer(i64),
    Decimal(f64),
    Bool(bool),
    Date(NaiveDate),
    DateTime(NaiveDateTime),
}

impl FieldValue {
    /// Canonical string form, used for unique-field tracking and staging
    /// payloads.
    pub fn canonical(&self) -> String {
        match self {
            FieldValue::Text(s) => s.clone(),
            FieldValue::Integer(i) => i.to_string(),
            FieldValue::Decimal(d) => d.to_string(),
            FieldValue::Bool(b) => b.to_string(),
            FieldValue::Date(d) => d.format("%Y-%m-%d").to_string(),
            FieldValue::DateTime(dt) => dt.format("%Y-%m-%dT%H:%M:%S").to_string(),
        }
    }

    pub fn is_blank(&self) -> bool {
        matches!(self, FieldValue::Text(s) if s.trim().is_empty())
    }
}

/// One declared mapping from a sheet header label to a record field
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnBinding {
    /// Header label as it appears in the sheet, unique within a set
    pub header_label: String,
    /// Record field the column binds to
    pub field_name: String,
    pub kind: FieldKind,
    pub required: bool,
    /// Overrides auto-detection when not `General`
    #[serde(default)]
    pub hint: CellFormatHint,
    /// Legal values for `FieldKind::Enum` fields
    #[serde(default)]
    pub allowed_values: Option<HashSet<String>>,
}

impl ColumnBinding {
    pub fn new(header_label: &str, field_name: &str, kind: FieldKind) -> Self {
        Self {
            header_label: header_label.to_string(),
            field_name: field_name.to_string(),
            kind,
            required: false,
            hint: CellFormatHint::General,
            allowed_values: None,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn hint(mut self, hint: CellFormatHint) -> Self {
        self.hint = hint;
        self
    }

    pub fn allowed_values<I, S>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_values = Some(values.into_iter().map(Into::into).collect());
        self
    }
}

/// The ordered binding table for one record type
///
/// Construction validates the table (duplicate header labels are a
/// programming error) and precomputes the per-field coercion policy so the
/// per-cell path never re-derives it.
#[derive(Debug)]
pub struct BindingSet {
    record_type: String,
    bindings: Vec<ColumnBinding>,
    policies: Vec<CoercePolicy>,
    by_header: HashMap<String, usize>,
    by_normalized_field: HashMap<String, usize>,
}

impl BindingSet {
    pub fn build(record_type: &str, bindings: Vec<ColumnBinding>) -> Result<Self> {
        if bindings.is_empty() {
            return Err(TabliftError::Configuration(format!(
                "binding set '{record_type}' declares no columns"
            )));
        }

        let mut by_header = HashMap::with_capacity(bindings.len());
        let mut by_normalized_field = HashMap::with_capacity(bindings.len());
        for (idx, binding) in bindings.iter().enumerate() {
            if by_header.insert(binding.header_label.clone(), idx).is_some() {
                return Err(TabliftError::Configuration(format!(
                    "duplicate header label '{}' in binding set '{}'",
                    binding.header_label, record_type
                )));
            }
            by_normalized_field.insert(normalize_label(&binding.field_name), idx);
        }

        let policies = bindings.iter().map(CoercePolicy::for_binding).collect();

        Ok(Self {
            record_type: record_type.to_string(),
            bindings,
            policies,
            by_header,
            by_normalized_field,
        })
    }

    pub fn record_type(&self) -> &str {
        &self.record_type
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    pub fn bindings(&self) -> &[ColumnBinding] {
        &self.bindings
    }

    pub fn binding(&self, slot: usize) -> &ColumnBinding {
        &self.bindings[slot]
    }

    pub fn policy(&self, slot: usize) -> &CoercePolicy {
        &self.policies[slot]
    }

    /// Slot index for a record field name
    pub fn field_slot(&self, field_name: &str) -> Option<usize> {
        self.bindings.iter().position(|b| b.field_name == field_name)
    }

    /// Resolve a header label to a field slot.
    ///
    /// Exact header-label match wins; otherwise the normalized label is
    /// compared against normalized field names. Unresolved labels are
    /// ignored by the parser, not errors.
    pub fn resolve_header(&self, label: &str) -> Option<usize> {
        if let Some(&slot) = self.by_header.get(label) {
            return Some(slot);
        }
        self.by_normalized_field
            .get(&normalize_label(label))
            .copied()
    }

    /// Coerce one raw cell string into the typed value for `slot`.
    pub fn coerce(&self, slot: usize, raw: &str) -> std::result::Result<FieldValue, String> {
        coerce::coerce_value(&self.bindings[slot], &self.policies[slot], raw)
    }

    /// Empty row shaped for this set.
    pub fn new_row(&self, source_row_index: u64) -> ParsedRow {
        ParsedRow {
            source_row_index,
            values: vec![None; self.bindings.len()],
        }
    }
}

/// Normalize a header label or field name for fuzzy matching: strip
/// diacritics, lowercase, drop whitespace and separators.
pub fn normalize_label(label: &str) -> String {
    label
        .chars()
        .map(coerce::fold_diacritic)
        .filter(|c| !c.is_whitespace() && *c != '_' && *c != '-')
        .flat_map(char::to_lowercase)
        .collect()
}

/// One record populated from one data row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedRow {
    /// 1-based row index in the source sheet
    pub source_row_index: u64,
    /// Values parallel to the binding set's slot order
    pub values: Vec<Option<FieldValue>>,
}

impl ParsedRow {
    pub fn get(&self, slot: usize) -> Option<&FieldValue> {
        self.values.get(slot).and_then(|v| v.as_ref())
    }

    pub fn set(&mut self, slot: usize, value: FieldValue) {
        self.values[slot] = Some(value);
    }

    /// True when every mapped cell is absent or blank.
    pub fn is_empty(&self) -> bool {
        self.values
            .iter()
            .all(|v| v.as_ref().map(FieldValue::is_blank).unwrap_or(true))
    }

    /// Staging payload keyed by field name.
    pub fn to_payload(&self, set: &BindingSet) -> serde_json::Value {
        let mut map = serde_json::Map::with_capacity(self.values.len());
        for (slot, value) in self.values.iter().enumerate() {
            let key = set.binding(slot).field_name.clone();
            let json = match value {
                Some(v) => serde_json::to_value(v).unwrap_or(serde_json::Value::Null),
                None => serde_json::Value::Null,
            };
            map.insert(key, json);
        }
        serde_json::Value::Object(map)
    }
}

/// Process-wide cache of binding sets, keyed by record type.
///
/// Write-once per type, many concurrent readers.
static BINDING_CACHE: OnceLock<RwLock<HashMap<String, Arc<BindingSet>>>> = OnceLock::new();

/// Fetch the cached set for `record_type`, building and caching it on first
/// use.
pub fn cached_binding_set<F>(record_type: &str, build: F) -> Result<Arc<BindingSet>>
where
    F: FnOnce() -> Result<BindingSet>,
{
    let cache = BINDING_CACHE.get_or_init(|| RwLock::new(HashMap::new()));

    if let Some(set) = cache
        .read()
        .expect("binding cache poisoned")
        .get(record_type)
    {
        return Ok(Arc::clone(set));
    }

    let built = Arc::new(build()?);
    let mut guard = cache.write().expect("binding cache poisoned");
    // A racing builder may have won; first write stays authoritative.
    let entry = guard
        .entry(record_type.to_string())
        .or_insert_with(|| Arc::clone(&built));
    Ok(Arc::clone(entry))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_set() -> BindingSet {
        BindingSet::build(
            "employee",
            vec![
                ColumnBinding::new("Họ và tên", "full_name", FieldKind::String).required(),
                ColumnBinding::new("Identity Card", "identity_card", FieldKind::String),
                ColumnBinding::new("Birth Date", "birth_date", FieldKind::Date),
                ColumnBinding::new("Salary", "salary", FieldKind::Decimal),
            ],
        )
        .unwrap()
    }

    #[test]
    fn duplicate_header_label_fails_at_construction() {
        let result = BindingSet::build(
            "dup",
            vec![
                ColumnBinding::new("Name", "name", FieldKind::String),
                ColumnBinding::new("Name", "other_name", FieldKind::String),
            ],
        );
        assert!(matches!(result, Err(TabliftError::Configuration(_))));
    }

    #[test]
    fn empty_set_fails_at_construction() {
        assert!(BindingSet::build("none", Vec::new()).is_err());
    }

    #[test]
    fn exact_header_match_wins() {
        let set = sample_set();
        assert_eq!(set.resolve_header("Identity Card"), Some(1));
    }

    #[test]
    fn normalized_field_name_match_is_fallback() {
        let set = sample_set();
        // No declared label matches, but the normalized form equals the
        // normalized field name.
        assert_eq!(set.resolve_header("FULL NAME"), Some(0));
        assert_eq!(set.resolve_header("birthdate"), Some(2));
    }

    #[test]
    fn unknown_headers_are_ignored() {
        let set = sample_set();
        assert_eq!(set.resolve_header("Ghi chú"), None);
    }

    #[test]
    fn diacritics_fold_for_matching() {
        assert_eq!(normalize_label("Họ Và Tên"), "hovaten");
        assert_eq!(normalize_label("Điện thoại"), "dienthoai");
    }

    #[test]
    fn empty_row_detection() {
        let set = sample_set();
        let mut row = set.new_row(5);
        assert!(row.is_empty());

        row.set(0, FieldValue::Text("   ".into()));
        assert!(row.is_empty());

        row.set(0, FieldValue::Text("An".into()));
        assert!(!row.is_empty());
    }

    #[test]
    fn payload_uses_field_names() {
        let set = sample_set();
        let mut row = set.new_row(2);
        row.set(0, FieldValue::Text("An".into()));
        row.set(3, FieldValue::Decimal(1200.5));

        let payload = row.to_payload(&set);
        assert_eq!(payload["full_name"], serde_json::json!("An"));
        assert_eq!(payload["salary"], serde_json::json!(1200.5));
        assert!(payload["identity_card"].is_null());
    }

    #[test]
    fn cache_returns_same_instance() {
        let a = cached_binding_set("cache-test", || {
            BindingSet::build(
                "cache-test",
                vec![ColumnBinding::new("A", "a", FieldKind::String)],
            )
        })
        .unwrap();
        let b = cached_binding_set("cache-test", || {
            panic!("second lookup must not rebuild")
        })
        .unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }
}
