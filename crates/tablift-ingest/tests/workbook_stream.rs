//! End-to-end streaming tests over real workbook packages.
//!
//! Fixtures are written as genuine ZIP archives so the whole chain is
//! exercised: archive open, sheet resolution, shared strings, styles,
//! row cursor, binding, coercion, batching.

use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;

use tablift_common::types::FieldKind;
use tablift_common::{ImportConfig, TabliftError};
use tablift_ingest::binding::{BindingSet, ColumnBinding, FieldValue};
use tablift_ingest::parser::{Batch, StreamParser};
use tablift_ingest::workbook::Workbook;

/// Write a workbook package with the given sheets. Each sheet is
/// `(name, rows)`; each row is a list of raw cell texts written as inline
/// strings except texts that parse as numbers, which become number cells.
fn write_workbook(path: &std::path::Path, sheets: &[(&str, Vec<Vec<&str>>)]) {
    let file = std::fs::File::create(path).unwrap();
    let mut zip = zip::ZipWriter::new(file);
    let options = zip::write::SimpleFileOptions::default();

    let mut workbook_xml = String::from(
        r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<workbook xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main" xmlns:r="http://schemas.openxmlformats.org/officeDocument/2006/relationships"><sheets>"#,
    );
    let mut rels_xml = String::from(
        r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships">"#,
    );
    for (i, (name, _)) in sheets.iter().enumerate() {
        let n = i + 1;
        workbook_xml
            .push_str(&format!(r#"<sheet name="{name}" sheetId="{n}" r:id="rId{n}"/>"#));
        rels_xml.push_str(&format!(
            r#"<Relationship Id="rId{n}" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/worksheet" Target="worksheets/sheet{n}.xml"/>"#
        ));
    }
    workbook_xml.push_str("</sheets></workbook>");
    rels_xml.push_str("</Relationships>");

    zip.start_file("xl/workbook.xml", options).unwrap();
    zip.write_all(workbook_xml.as_bytes()).unwrap();
    zip.start_file("xl/_rels/workbook.xml.rels", options).unwrap();
    zip.write_all(rels_xml.as_bytes()).unwrap();

    zip.start_file("xl/styles.xml", options).unwrap();
    zip.write_all(
        br#"<?xml version="1.0"?><styleSheet xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main"><cellXfs count="2"><xf numFmtId="0"/><xf numFmtId="14"/></cellXfs></styleSheet>"#,
    )
    .unwrap();

    for (i, (_, rows)) in sheets.iter().enumerate() {
        let mut sheet_xml = String::from(
            r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<worksheet xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main"><sheetData>"#,
        );
        for (r, row) in rows.iter().enumerate() {
            let row_num = r + 1;
            sheet_xml.push_str(&format!(r#"<row r="{row_num}">"#));
            for (c, text) in row.iter().enumerate() {
                if text.is_empty() {
                    continue;
                }
                let col = column_name(c as u32 + 1);
                if text.parse::<f64>().is_ok() {
                    sheet_xml.push_str(&format!(
                        r#"<c r="{col}{row_num}"><v>{text}</v></c>"#
                    ));
                } else {
                    sheet_xml.push_str(&format!(
                        r#"<c r="{col}{row_num}" t="inlineStr"><is><t>{text}</t></is></c>"#
                    ));
                }
            }
            sheet_xml.push_str("</row>");
        }
        sheet_xml.push_str("</sheetData></worksheet>");

        zip.start_file(format!("xl/worksheets/sheet{}.xml", i + 1), options)
            .unwrap();
        zip.write_all(sheet_xml.as_bytes()).unwrap();
    }

    zip.finish().unwrap();
}

fn column_name(mut index: u32) -> String {
    let mut name = String::new();
    while index > 0 {
        let rem = (index - 1) % 26;
        name.insert(0, (b'A' + rem as u8) as char);
        index = (index - 1) / 26;
    }
    name
}

fn employee_bindings() -> BindingSet {
    BindingSet::build(
        "employee",
        vec![
            ColumnBinding::new("Full Name", "full_name", FieldKind::String).required(),
            ColumnBinding::new("Identity Card", "identity_card", FieldKind::String),
            ColumnBinding::new("Birth Date", "birth_date", FieldKind::Date),
            ColumnBinding::new("Salary", "salary", FieldKind::Decimal),
        ],
    )
    .unwrap()
}

fn employee_rows(count: usize) -> Vec<Vec<&'static str>> {
    let mut rows = vec![vec!["Full Name", "Identity Card", "Birth Date", "Salary"]];
    for _ in 0..count {
        rows.push(vec!["Nguyen Van A", "012345678901", "44927", "1500.5"]);
    }
    rows
}

fn parse_collect(
    path: &std::path::Path,
    config: ImportConfig,
    bindings: &BindingSet,
) -> Result<(Vec<Batch>, tablift_common::types::ProcessingResult), TabliftError> {
    let mut workbook = Workbook::open(path)?;
    let sheet = workbook.sheet_names()[0].to_string();
    let parser = StreamParser::new(config)?;
    let mut batches = Vec::new();
    let result = parser.process_sheet(&mut workbook, &sheet, bindings, |batch| {
        batches.push(batch);
        Ok(())
    })?;
    Ok((batches, result))
}

#[test]
fn accepts_source_within_row_limit() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("within.xlsx");
    write_workbook(&path, &[("Employees", employee_rows(15))]);

    let config = ImportConfig {
        max_rows: 20,
        batch_size: 4,
        ..Default::default()
    };
    let (batches, result) = parse_collect(&path, config, &employee_bindings()).unwrap();

    assert_eq!(result.processed_rows, 15);
    assert_eq!(result.error_count, 0);
    // Full batches of 4, final short batch of 3, in order.
    assert_eq!(batches.len(), 4);
    assert!(batches[..3].iter().all(|b| b.len() == 4));
    assert_eq!(batches[3].len(), 3);
    let first = &batches[0][0];
    assert_eq!(first.source_row_index, 2);
}

#[test]
fn rejects_source_over_row_limit_inline() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("over.xlsx");
    write_workbook(&path, &[("Employees", employee_rows(15))]);

    let config = ImportConfig {
        max_rows: 10,
        batch_size: 3,
        ..Default::default()
    };
    let mut delivered = 0usize;
    let mut workbook = Workbook::open(&path).unwrap();
    let bindings = employee_bindings();
    let parser = StreamParser::new(config).unwrap();
    let err = parser
        .process_sheet(&mut workbook, "Employees", &bindings, |batch| {
            delivered += batch.len();
            Ok(())
        })
        .unwrap_err();

    match err {
        TabliftError::RowLimitExceeded { limit, row } => {
            assert_eq!(limit, 10);
            // Raised the moment the limiting row is read, not after
            // buffering the file.
            assert_eq!(row, 11);
        }
        other => panic!("expected RowLimitExceeded, got {other:?}"),
    }
    assert!(delivered <= 10);
}

#[test]
fn unlimited_when_max_rows_is_zero() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("unlimited.xlsx");
    write_workbook(&path, &[("Employees", employee_rows(15))]);

    let (_, result) =
        parse_collect(&path, ImportConfig::default(), &employee_bindings()).unwrap();
    assert_eq!(result.processed_rows, 15);
}

#[test]
fn identifier_cells_survive_scientific_notation() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("ids.xlsx");
    write_workbook(
        &path,
        &[(
            "Employees",
            vec![
                vec!["Full Name", "Identity Card", "Birth Date", "Salary"],
                vec!["Tran Thi B", "1.234567E+11", "44927", "900"],
            ],
        )],
    );

    let (batches, _) =
        parse_collect(&path, ImportConfig::default(), &employee_bindings()).unwrap();
    let row = &batches[0][0];
    let bindings = employee_bindings();
    let id_slot = bindings.field_slot("identity_card").unwrap();
    assert_eq!(
        row.get(id_slot),
        Some(&FieldValue::Text("123456700000".into()))
    );
}

#[test]
fn serial_dates_become_calendar_dates() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("dates.xlsx");
    write_workbook(
        &path,
        &[(
            "Employees",
            vec![
                vec!["Full Name", "Identity Card", "Birth Date", "Salary"],
                vec!["Le Van C", "0123", "44927", "700"],
            ],
        )],
    );

    let (batches, _) =
        parse_collect(&path, ImportConfig::default(), &employee_bindings()).unwrap();
    let bindings = employee_bindings();
    let slot = bindings.field_slot("birth_date").unwrap();
    assert_eq!(
        batches[0][0].get(slot),
        Some(&FieldValue::Date(
            chrono::NaiveDate::from_ymd_opt(2023, 1, 1).unwrap()
        ))
    );
}

#[test]
fn blank_rows_are_dropped_and_not_counted() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("blanks.xlsx");
    write_workbook(
        &path,
        &[(
            "Employees",
            vec![
                vec!["Full Name", "Identity Card", "Birth Date", "Salary"],
                vec!["A", "1", "44927", "1"],
                vec!["", "", "", ""],
                vec!["B", "2", "44927", "2"],
            ],
        )],
    );

    // max_rows = 2 with two real rows and one blank: the blank must not
    // trip the limit.
    let config = ImportConfig {
        max_rows: 2,
        ..Default::default()
    };
    let (batches, result) = parse_collect(&path, config, &employee_bindings()).unwrap();
    assert_eq!(result.processed_rows, 2);
    assert_eq!(batches.iter().map(Vec::len).sum::<usize>(), 2);
}

#[test]
fn header_only_sheet_is_an_empty_data_set() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("empty.xlsx");
    write_workbook(&path, &[("Employees", employee_rows(0))]);

    let err = parse_collect(&path, ImportConfig::default(), &employee_bindings()).unwrap_err();
    assert!(matches!(err, TabliftError::EmptyDataSet));
}

#[test]
fn unmatched_header_is_a_schema_mismatch() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("badheader.xlsx");
    write_workbook(
        &path,
        &[(
            "Employees",
            vec![vec!["Alpha", "Beta"], vec!["x", "y"]],
        )],
    );

    let err = parse_collect(&path, ImportConfig::default(), &employee_bindings()).unwrap_err();
    assert!(matches!(err, TabliftError::SchemaMismatch(_)));
}

#[test]
fn required_and_unique_violations_accumulate() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("viol.xlsx");
    write_workbook(
        &path,
        &[(
            "Employees",
            vec![
                vec!["Full Name", "Identity Card", "Birth Date", "Salary"],
                vec!["A", "111", "44927", "1"],
                vec!["", "111", "44927", "2"],
            ],
        )],
    );

    let config = ImportConfig {
        unique_fields: vec!["identity_card".into()],
        ..Default::default()
    };
    let (batches, result) = parse_collect(&path, config, &employee_bindings()).unwrap();

    // Second row is missing the required name and repeats the id; both
    // are counted, neither aborts the parse.
    assert_eq!(result.processed_rows, 2);
    assert_eq!(result.error_count, 2);
    assert_eq!(batches.iter().map(Vec::len).sum::<usize>(), 2);
}

#[test]
fn strict_validation_drops_offending_rows() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("strict.xlsx");
    write_workbook(
        &path,
        &[(
            "Employees",
            vec![
                vec!["Full Name", "Identity Card", "Birth Date", "Salary"],
                vec!["A", "111", "44927", "1"],
                vec!["", "222", "44927", "2"],
            ],
        )],
    );

    let config = ImportConfig {
        strict_validation: true,
        ..Default::default()
    };
    let (batches, result) = parse_collect(&path, config, &employee_bindings()).unwrap();
    assert_eq!(result.processed_rows, 1);
    assert_eq!(result.error_count, 1);
    assert_eq!(batches.iter().map(Vec::len).sum::<usize>(), 1);
}

#[test]
fn resume_offset_continues_after_staged_rows() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("resume.xlsx");
    write_workbook(&path, &[("Employees", employee_rows(10))]);

    let mut workbook = Workbook::open(&path).unwrap();
    let bindings = employee_bindings();
    let parser = StreamParser::new(ImportConfig::default())
        .unwrap()
        .with_resume_offset(6);

    let mut emitted = Vec::new();
    let result = parser
        .process_sheet(&mut workbook, "Employees", &bindings, |batch| {
            emitted.extend(batch);
            Ok(())
        })
        .unwrap();

    // Six data rows are skipped without re-coercion; the parse picks up
    // with the seventh (sheet row 8, after the header at row 1).
    assert_eq!(result.processed_rows, 4);
    assert_eq!(result.error_count, 0);
    assert_eq!(emitted.len(), 4);
    assert_eq!(emitted[0].source_row_index, 8);
    assert_eq!(emitted[3].source_row_index, 11);
}

#[test]
fn blank_rows_do_not_consume_the_resume_offset() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("resume_blanks.xlsx");
    write_workbook(
        &path,
        &[(
            "Employees",
            vec![
                vec!["Full Name", "Identity Card", "Birth Date", "Salary"],
                vec!["A", "1", "44927", "1"],
                vec!["B", "2", "44927", "2"],
                vec!["", "", "", ""],
                vec!["C", "3", "44927", "3"],
                vec!["D", "4", "44927", "4"],
            ],
        )],
    );

    let mut workbook = Workbook::open(&path).unwrap();
    let bindings = employee_bindings();
    let parser = StreamParser::new(ImportConfig::default())
        .unwrap()
        .with_resume_offset(3);

    let mut emitted = Vec::new();
    let result = parser
        .process_sheet(&mut workbook, "Employees", &bindings, |batch| {
            emitted.extend(batch);
            Ok(())
        })
        .unwrap();

    // The blank sheet row is not a data row on any run, so the offset of
    // three skips A, B, and C, and D is the only row emitted.
    assert_eq!(result.processed_rows, 1);
    assert_eq!(emitted[0].source_row_index, 6);
}

#[test]
fn skipped_rows_still_count_toward_the_row_limit() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("resume_limit.xlsx");
    write_workbook(&path, &[("Employees", employee_rows(10))]);

    let mut workbook = Workbook::open(&path).unwrap();
    let bindings = employee_bindings();
    let config = ImportConfig {
        max_rows: 8,
        ..Default::default()
    };
    let parser = StreamParser::new(config).unwrap().with_resume_offset(6);

    let err = parser
        .process_sheet(&mut workbook, "Employees", &bindings, |_batch| Ok(()))
        .unwrap_err();
    assert!(matches!(
        err,
        TabliftError::RowLimitExceeded { limit: 8, row: 9 }
    ));
}

#[test]
fn multi_sheet_mode_skips_unbound_sheets() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("multi.xlsx");
    write_workbook(
        &path,
        &[
            ("Employees", employee_rows(3)),
            ("Notes", vec![vec!["whatever"], vec!["text"]]),
            ("More", employee_rows(2)),
        ],
    );

    let bindings: HashMap<String, Arc<BindingSet>> = [
        ("Employees".to_string(), Arc::new(employee_bindings())),
        ("More".to_string(), Arc::new(employee_bindings())),
    ]
    .into_iter()
    .collect();

    let mut workbook = Workbook::open(&path).unwrap();
    let parser = StreamParser::new(ImportConfig::default()).unwrap();
    let mut per_sheet: HashMap<String, usize> = HashMap::new();
    let result = parser
        .process_workbook(&mut workbook, &bindings, |sheet, batch| {
            *per_sheet.entry(sheet.to_string()).or_default() += batch.len();
            Ok(())
        })
        .unwrap();

    assert_eq!(result.processed_rows, 5);
    assert_eq!(per_sheet.get("Employees"), Some(&3));
    assert_eq!(per_sheet.get("More"), Some(&2));
    assert!(!per_sheet.contains_key("Notes"));
}

#[test]
fn corrupt_archive_is_a_source_error() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("corrupt.xlsx");
    std::fs::write(&path, b"this is not a zip archive").unwrap();

    assert!(Workbook::open(&path).is_err());
}

#[tokio::test]
async fn parser_feeds_executor_through_bounded_channel() {
    use tablift_ingest::executor::BatchExecutor;

    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("pipeline.xlsx");
    write_workbook(&path, &[("Employees", employee_rows(25))]);

    let config = ImportConfig {
        batch_size: 4,
        parallelism: 2,
        ..Default::default()
    };
    let executor = BatchExecutor::new(2, std::time::Duration::from_secs(30));
    let (tx, rx) = executor.channel();

    let parse = tokio::task::spawn_blocking(move || {
        let mut workbook = Workbook::open(&path)?;
        let bindings = employee_bindings();
        let parser = StreamParser::new(config)?;
        parser.process_sheet(&mut workbook, "Employees", &bindings, |batch| {
            tx.blocking_send(batch)
                .map_err(|_| TabliftError::Cancelled("executor hung up".into()))
        })
    });

    let stored = Arc::new(std::sync::atomic::AtomicU64::new(0));
    let stored_inner = Arc::clone(&stored);
    let stats = executor
        .run(rx, move |_, batch| {
            let stored = Arc::clone(&stored_inner);
            async move {
                stored.fetch_add(batch.len() as u64, std::sync::atomic::Ordering::Relaxed);
                Ok(())
            }
        })
        .await
        .unwrap();

    let result = parse.await.unwrap().unwrap();
    assert_eq!(result.processed_rows, 25);
    assert_eq!(stats.total_records, 25);
    assert_eq!(stats.failed_batches, 0);
    assert_eq!(stored.load(std::sync::atomic::Ordering::Relaxed), 25);
}
