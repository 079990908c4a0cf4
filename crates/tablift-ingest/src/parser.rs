//! Streaming workbook parser.
//!
//! Drives a [`SheetCursor`] row by row: binds the header row to a
//! [`BindingSet`], coerces and validates each data row inline, and hands
//! completed batches to a callback in source-row order. Memory stays
//! bounded by the batch size plus the workbook's shared tables; the sheet
//! is never materialized. The row limit is enforced the moment the
//! limiting row is read.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, warn};

use tablift_common::types::{FieldKind, ProcessingResult};
use tablift_common::{ImportConfig, Result, TabliftError};

use crate::binding::coerce::{normalize_date, CoercePolicy};
use crate::binding::{BindingSet, FieldValue, ParsedRow};
use crate::workbook::{RawRow, Stylesheet, Workbook};

/// An ordered batch of parsed rows. Never mutated after dispatch.
pub type Batch = Vec<ParsedRow>;

/// Per-field validation rule: `(field_name, value, row_index)`
pub type FieldValidator =
    Arc<dyn Fn(&str, &FieldValue, u64) -> std::result::Result<(), String> + Send + Sync>;

/// Whole-row validation rule, invoked with the fully populated record
pub type GlobalValidator =
    Arc<dyn Fn(&BindingSet, &ParsedRow) -> std::result::Result<(), String> + Send + Sync>;

/// Progress hook: processed-row count so far
pub type ProgressFn = Arc<dyn Fn(u64) + Send + Sync>;

/// Streaming parser for one or more worksheets
pub struct StreamParser {
    config: ImportConfig,
    resume_offset: u64,
    field_validators: HashMap<String, Vec<FieldValidator>>,
    global_validators: Vec<GlobalValidator>,
    progress: Option<ProgressFn>,
}

impl StreamParser {
    pub fn new(config: ImportConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            resume_offset: 0,
            field_validators: HashMap::new(),
            global_validators: Vec::new(),
            progress: None,
        })
    }

    pub fn config(&self) -> &ImportConfig {
        &self.config
    }

    /// Resume a sheet past its persisted offset: the first `offset` data
    /// rows are read and counted but never coerced, validated, or
    /// emitted. The parse continues with the row after the offset; the
    /// staging uniqueness only has to cover the one batch that may
    /// straddle it. Applies to each sheet this parser drives, so
    /// resuming callers run one sheet per parser.
    pub fn with_resume_offset(mut self, offset: u64) -> Self {
        self.resume_offset = offset;
        self
    }

    /// Register a per-field rule, invoked whenever the field is non-null.
    pub fn with_field_validator(mut self, field: &str, validator: FieldValidator) -> Self {
        self.field_validators
            .entry(field.to_string())
            .or_default()
            .push(validator);
        self
    }

    /// Register a whole-row rule.
    pub fn with_global_validator(mut self, validator: GlobalValidator) -> Self {
        self.global_validators.push(validator);
        self
    }

    pub fn with_progress(mut self, progress: ProgressFn) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Parse one sheet, delivering batches to `on_batch` in source order.
    pub fn process_sheet<F>(
        &self,
        workbook: &mut Workbook,
        sheet_name: &str,
        bindings: &BindingSet,
        mut on_batch: F,
    ) -> Result<ProcessingResult>
    where
        F: FnMut(Batch) -> Result<()>,
    {
        let started = Instant::now();
        let styles = workbook.stylesheet();
        let mut cursor = workbook.sheet_cursor(sheet_name)?;

        let mut sheet = SheetRun::new(self, sheet_name, bindings, styles);
        while let Some(row) = cursor.next_row()? {
            sheet.accept(row, &mut on_batch)?;
        }
        sheet.finish(&mut on_batch, started)
    }

    /// Multi-sheet mode: sheets with a binding set are parsed in workbook
    /// order (or in `config.sheet_names` order when given); sheets without
    /// one are skipped. Each sheet's cursor is dropped at the end of its
    /// own loop iteration.
    pub fn process_workbook<F>(
        &self,
        workbook: &mut Workbook,
        bindings: &HashMap<String, Arc<BindingSet>>,
        mut on_batch: F,
    ) -> Result<ProcessingResult>
    where
        F: FnMut(&str, Batch) -> Result<()>,
    {
        let ordered: Vec<String> = if self.config.sheet_names.is_empty() {
            workbook
                .sheets()
                .iter()
                .map(|s| s.name.clone())
                .collect()
        } else {
            self.config.sheet_names.clone()
        };

        let mut total = ProcessingResult::default();
        let started = Instant::now();

        for name in ordered {
            let Some(set) = bindings.get(&name) else {
                debug!(sheet = %name, "No binding set for sheet, skipping");
                continue;
            };
            let result =
                self.process_sheet(workbook, &name, set, |batch| on_batch(&name, batch))?;
            total.processed_rows += result.processed_rows;
            total.error_count += result.error_count;
        }

        Ok(ProcessingResult::new(
            total.processed_rows,
            total.error_count,
            started.elapsed().as_millis() as u64,
        ))
    }
}

/// Parse state for one sheet: header binding, counters, batch buffer
struct SheetRun<'p> {
    parser: &'p StreamParser,
    sheet_name: &'p str,
    bindings: &'p BindingSet,
    styles: Arc<Stylesheet>,
    /// column (1-based) -> binding slot, fixed after the header row
    header_map: Option<HashMap<u32, usize>>,
    batch: Batch,
    seen_unique: HashSet<String>,
    data_rows: u64,
    skipped_rows: u64,
    processed_rows: u64,
    error_count: u64,
}

impl<'p> SheetRun<'p> {
    fn new(
        parser: &'p StreamParser,
        sheet_name: &'p str,
        bindings: &'p BindingSet,
        styles: Arc<Stylesheet>,
    ) -> Self {
        Self {
            parser,
            sheet_name,
            bindings,
            styles,
            header_map: None,
            batch: Vec::with_capacity(parser.config.batch_size),
            seen_unique: HashSet::new(),
            data_rows: 0,
            skipped_rows: 0,
            processed_rows: 0,
            error_count: 0,
        }
    }

    fn accept<F>(&mut self, row: RawRow, on_batch: &mut F) -> Result<()>
    where
        F: FnMut(Batch) -> Result<()>,
    {
        let config = &self.parser.config;
        let header_row = config.header_row_index as u64 + 1;
        let data_start = config.data_start_row_index as u64 + 1;

        if self.header_map.is_none() {
            if row.row_number < header_row {
                return Ok(());
            }
            if row.row_number > header_row {
                return Err(TabliftError::SchemaMismatch(format!(
                    "sheet '{}' has no row at header index {}",
                    self.sheet_name, config.header_row_index
                )));
            }
            self.bind_header(&row)?;
            return Ok(());
        }

        if row.row_number < data_start {
            return Ok(());
        }

        // Resume fast path: data rows at or below the persisted offset
        // were staged by an earlier run. They are counted (the row limit
        // still applies) but never re-coerced, re-validated, or
        // re-emitted; the staging uniqueness covers the one batch that
        // may straddle the offset.
        if self.data_rows < self.parser.resume_offset {
            if self.mapped_row_is_blank(&row) {
                return Ok(());
            }
            self.data_rows += 1;
            self.skipped_rows += 1;
            if config.max_rows > 0 && self.data_rows > config.max_rows {
                return Err(TabliftError::RowLimitExceeded {
                    limit: config.max_rows,
                    row: self.data_rows,
                });
            }
            return Ok(());
        }

        let Some(parsed) = self.bind_row(&row) else {
            // Every mapped cell blank: dropped, not counted toward the
            // row limit.
            return Ok(());
        };

        self.data_rows += 1;
        if config.max_rows > 0 && self.data_rows > config.max_rows {
            return Err(TabliftError::RowLimitExceeded {
                limit: config.max_rows,
                row: self.data_rows,
            });
        }

        let row_errors = self.validate_row(&parsed);
        self.error_count += row_errors;
        if row_errors > 0 {
            if self.parser.config.fail_on_first_error {
                return Err(TabliftError::Validation(format!(
                    "sheet '{}' row {} failed validation",
                    self.sheet_name, parsed.source_row_index
                )));
            }
            if self.parser.config.strict_validation {
                // Strict mode drops the offending row instead of staging it.
                return Ok(());
            }
        }

        self.processed_rows += 1;
        self.batch.push(parsed);
        if self.batch.len() >= self.parser.config.batch_size {
            let full = std::mem::replace(
                &mut self.batch,
                Vec::with_capacity(self.parser.config.batch_size),
            );
            on_batch(full)?;
        }

        if self.parser.config.enable_progress_tracking
            && self.processed_rows % self.parser.config.progress_report_interval == 0
        {
            info!(
                sheet = %self.sheet_name,
                processed_rows = self.processed_rows,
                errors = self.error_count,
                "Parse progress"
            );
            if let Some(progress) = &self.parser.progress {
                progress(self.processed_rows);
            }
        }

        Ok(())
    }

    /// Blank check on raw mapped cells only, so the resume skip counts
    /// rows exactly the way the original run did without touching
    /// coercion.
    fn mapped_row_is_blank(&self, row: &RawRow) -> bool {
        let header_map = self.header_map.as_ref().expect("header bound");
        !row.cells.iter().any(|cell| {
            header_map.contains_key(&cell.column) && !cell.text.trim().is_empty()
        })
    }

    fn bind_header(&mut self, row: &RawRow) -> Result<()> {
        let mut map = HashMap::new();
        for cell in &row.cells {
            let label = cell.text.trim();
            if label.is_empty() {
                continue;
            }
            if let Some(slot) = self.bindings.resolve_header(label) {
                map.insert(cell.column, slot);
            } else {
                debug!(sheet = %self.sheet_name, column = cell.column, label, "Unbound column ignored");
            }
        }
        if map.is_empty() {
            return Err(TabliftError::SchemaMismatch(format!(
                "sheet '{}' header row matched none of the {} declared bindings",
                self.sheet_name,
                self.bindings.len()
            )));
        }
        debug!(
            sheet = %self.sheet_name,
            bound_columns = map.len(),
            "Header bound"
        );
        self.header_map = Some(map);
        Ok(())
    }

    /// Bind one data row; `None` when every mapped cell is blank.
    fn bind_row(&mut self, row: &RawRow) -> Option<ParsedRow> {
        let header_map = self.header_map.as_ref().expect("header bound");
        let mut parsed = self.bindings.new_row(row.row_number);
        let mut coercion_errors = 0u64;

        for cell in &row.cells {
            let Some(&slot) = header_map.get(&cell.column) else {
                continue;
            };
            let raw = cell.text.trim();
            if raw.is_empty() {
                continue;
            }

            let raw = self.apply_date_style(slot, cell.style, raw);
            match self.bindings.coerce(slot, &raw) {
                Ok(value) => parsed.set(slot, value),
                Err(message) => {
                    coercion_errors += 1;
                    warn!(
                        sheet = %self.sheet_name,
                        row = row.row_number,
                        field = %self.bindings.binding(slot).field_name,
                        %message,
                        "Cell coercion failed"
                    );
                }
            }
        }

        if parsed.is_empty() && coercion_errors == 0 {
            return None;
        }
        self.error_count += coercion_errors;
        Some(parsed)
    }

    /// A numeric cell styled as a date in a plain string field still means
    /// a date; render it as ISO text before coercion.
    fn apply_date_style(&self, slot: usize, style: Option<u32>, raw: &str) -> String {
        let styled_date = style
            .map(|s| self.styles.is_date_format(s as usize))
            .unwrap_or(false);
        if styled_date
            && *self.bindings.policy(slot) == CoercePolicy::Shape
            && self.bindings.binding(slot).kind == FieldKind::String
        {
            if let Some(iso) = normalize_date(raw, false) {
                return iso;
            }
        }
        raw.to_string()
    }

    fn validate_row(&mut self, row: &ParsedRow) -> u64 {
        let config = &self.parser.config;
        let mut errors = 0u64;

        // Declared-required bindings and config-listed required fields.
        for (slot, binding) in self.bindings.bindings().iter().enumerate() {
            let required =
                binding.required || config.required_fields.contains(&binding.field_name);
            if !required {
                continue;
            }
            let missing = row.get(slot).map(FieldValue::is_blank).unwrap_or(true);
            if missing {
                errors += 1;
                warn!(
                    sheet = %self.sheet_name,
                    row = row.source_row_index,
                    field = %binding.field_name,
                    "Required field is blank"
                );
            }
        }

        for field in &config.unique_fields {
            let Some(slot) = self.bindings.field_slot(field) else {
                continue;
            };
            if let Some(value) = row.get(slot) {
                let key = format!("{field}:{}", value.canonical());
                if !self.seen_unique.insert(key) {
                    errors += 1;
                    warn!(
                        sheet = %self.sheet_name,
                        row = row.source_row_index,
                        field = %field,
                        "Duplicate value for unique field"
                    );
                }
            }
        }

        for (field, validators) in &self.parser.field_validators {
            let Some(slot) = self.bindings.field_slot(field) else {
                continue;
            };
            let Some(value) = row.get(slot) else {
                continue;
            };
            for validator in validators {
                if let Err(message) = validator(field, value, row.source_row_index) {
                    errors += 1;
                    warn!(
                        sheet = %self.sheet_name,
                        row = row.source_row_index,
                        field = %field,
                        %message,
                        "Field validation failed"
                    );
                }
            }
        }

        for validator in &self.parser.global_validators {
            if let Err(message) = validator(self.bindings, row) {
                errors += 1;
                warn!(
                    sheet = %self.sheet_name,
                    row = row.source_row_index,
                    %message,
                    "Row validation failed"
                );
            }
        }

        errors
    }

    fn finish<F>(mut self, on_batch: &mut F, started: Instant) -> Result<ProcessingResult>
    where
        F: FnMut(Batch) -> Result<()>,
    {
        if self.header_map.is_none() {
            return Err(TabliftError::SchemaMismatch(format!(
                "sheet '{}' ended before the header row",
                self.sheet_name
            )));
        }
        if self.data_rows == 0 {
            return Err(TabliftError::EmptyDataSet);
        }
        if !self.batch.is_empty() {
            let last = std::mem::take(&mut self.batch);
            on_batch(last)?;
        }

        let duration_ms = started.elapsed().as_millis() as u64;
        let result = ProcessingResult::new(self.processed_rows, self.error_count, duration_ms);
        info!(
            sheet = %self.sheet_name,
            processed_rows = result.processed_rows,
            skipped_rows = self.skipped_rows,
            errors = result.error_count,
            duration_ms,
            throughput = format!("{:.0}/s", result.throughput),
            "Sheet parse complete"
        );
        Ok(result)
    }
}
