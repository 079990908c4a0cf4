//! OOXML workbook package access.
//!
//! A [`Workbook`] opens the ZIP archive once, resolves sheet names to
//! worksheet parts through `xl/workbook.xml` and its relationships, and
//! parses the shared-strings and styles parts a single time. Sheet data is
//! then walked through [`SheetCursor`], a forward-only row cursor that
//! never materializes a worksheet. Parsing is single-pass; there is no
//! rewind API.

pub mod shared_strings;
pub mod sheet_reader;
pub mod styles;

pub use shared_strings::SharedStrings;
pub use sheet_reader::{RawCell, RawRow, SheetCursor};
pub use styles::Stylesheet;

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use quick_xml::events::Event;
use quick_xml::name::QName;
use tracing::debug;
use zip::ZipArchive;

use tablift_common::{Result, TabliftError};

const WORKBOOK_PART: &str = "xl/workbook.xml";
const WORKBOOK_RELS_PART: &str = "xl/_rels/workbook.xml.rels";
const SHARED_STRINGS_PART: &str = "xl/sharedStrings.xml";
const STYLES_PART: &str = "xl/styles.xml";

/// One worksheet entry resolved from the workbook part
#[derive(Debug, Clone)]
pub struct SheetMeta {
    pub name: String,
    /// Archive path of the worksheet part, e.g. `xl/worksheets/sheet1.xml`
    pub path: String,
    /// Zero-based position in workbook order
    pub order: u32,
}

/// An open workbook package
pub struct Workbook {
    path: PathBuf,
    archive: ZipArchive<BufReader<File>>,
    sheets: Vec<SheetMeta>,
    shared: Arc<SharedStrings>,
    styles: Arc<Stylesheet>,
}

impl Workbook {
    /// Open the package and parse the workbook, relationship,
    /// shared-strings, and styles parts. The two tables are parsed here
    /// once and shared read-only with every sheet cursor.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        let mut archive = ZipArchive::new(BufReader::new(file))?;

        let workbook_xml = read_part(&mut archive, WORKBOOK_PART)?.ok_or_else(|| {
            TabliftError::SourceFormat(format!("archive is missing {WORKBOOK_PART}"))
        })?;
        let rels_xml = read_part(&mut archive, WORKBOOK_RELS_PART)?.ok_or_else(|| {
            TabliftError::SourceFormat(format!("archive is missing {WORKBOOK_RELS_PART}"))
        })?;
        let sheets = resolve_sheets(&workbook_xml, &rels_xml)?;
        if sheets.is_empty() {
            return Err(TabliftError::SourceFormat(
                "workbook declares no worksheets".into(),
            ));
        }

        let shared = match read_part(&mut archive, SHARED_STRINGS_PART)? {
            Some(xml) => SharedStrings::parse(xml.as_bytes())?,
            None => SharedStrings::default(),
        };
        let styles = match read_part(&mut archive, STYLES_PART)? {
            Some(xml) => Stylesheet::parse(xml.as_bytes())?,
            None => Stylesheet::default(),
        };

        debug!(
            sheets = sheets.len(),
            shared_strings = shared.len(),
            "Opened workbook package"
        );

        Ok(Self {
            path,
            archive,
            sheets,
            shared: Arc::new(shared),
            styles: Arc::new(styles),
        })
    }

    pub fn sheet_names(&self) -> Vec<&str> {
        self.sheets.iter().map(|s| s.name.as_str()).collect()
    }

    pub fn sheets(&self) -> &[SheetMeta] {
        &self.sheets
    }

    pub fn shared_strings(&self) -> Arc<SharedStrings> {
        Arc::clone(&self.shared)
    }

    pub fn stylesheet(&self) -> Arc<Stylesheet> {
        Arc::clone(&self.styles)
    }

    /// Forward-only cursor over one worksheet's rows.
    ///
    /// Borrows the archive mutably: one cursor at a time per `Workbook`.
    /// Parallel sheet tasks each take their own handle via [`Self::reopen`].
    pub fn sheet_cursor(&mut self, sheet_name: &str) -> Result<SheetCursor<'_>> {
        let meta = self
            .sheets
            .iter()
            .find(|s| s.name == sheet_name)
            .ok_or_else(|| {
                TabliftError::SourceFormat(format!("worksheet '{sheet_name}' not found"))
            })?
            .clone();

        let entry = self.archive.by_name(&meta.path).map_err(|e| {
            TabliftError::SourceFormat(format!("cannot open worksheet part {}: {e}", meta.path))
        })?;
        let boxed: Box<dyn Read + '_> = Box::new(entry);
        Ok(SheetCursor::new(boxed, Arc::clone(&self.shared)))
    }

    /// A second handle on the same package for a parallel sheet task.
    /// Reopens the archive file but reuses the already-parsed shared
    /// tables and sheet metadata.
    pub fn reopen(&self) -> Result<Workbook> {
        let file = File::open(&self.path)?;
        let archive = ZipArchive::new(BufReader::new(file))?;
        Ok(Workbook {
            path: self.path.clone(),
            archive,
            sheets: self.sheets.clone(),
            shared: Arc::clone(&self.shared),
            styles: Arc::clone(&self.styles),
        })
    }
}

/// Read a whole (small) archive part; `None` when the part is absent.
fn read_part(
    archive: &mut ZipArchive<BufReader<File>>,
    name: &str,
) -> Result<Option<String>> {
    match archive.by_name(name) {
        Ok(mut entry) => {
            let mut content = String::new();
            entry.read_to_string(&mut content)?;
            Ok(Some(content))
        }
        Err(zip::result::ZipError::FileNotFound) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Resolve sheet names to worksheet part paths via the relationship ids.
fn resolve_sheets(workbook_xml: &str, rels_xml: &str) -> Result<Vec<SheetMeta>> {
    let mut declared: Vec<(String, String)> = Vec::new();

    let mut reader = quick_xml::Reader::from_str(workbook_xml);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_event_into(&mut buf)? {
            Event::Start(ref e) | Event::Empty(ref e)
                if e.local_name().as_ref() == b"sheet" =>
            {
                let mut name = None;
                let mut rel_id = None;
                for attr in e.attributes().flatten() {
                    match attr.key.as_ref() {
                        b"name" => name = attr.unescape_value().ok().map(|v| v.to_string()),
                        b"r:id" => rel_id = attr.unescape_value().ok().map(|v| v.to_string()),
                        _ => {}
                    }
                }
                if let (Some(name), Some(rel_id)) = (name, rel_id) {
                    declared.push((name, rel_id));
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    let mut targets: std::collections::HashMap<String, String> = std::collections::HashMap::new();
    let mut reader = quick_xml::Reader::from_str(rels_xml);
    loop {
        buf.clear();
        match reader.read_event_into(&mut buf)? {
            Event::Start(ref e) | Event::Empty(ref e)
                if e.local_name().as_ref() == b"Relationship" =>
            {
                let mut id = None;
                let mut target = None;
                for attr in e.attributes().flatten() {
                    match attr.key {
                        QName(b"Id") => id = attr.unescape_value().ok().map(|v| v.to_string()),
                        QName(b"Target") => {
                            target = attr.unescape_value().ok().map(|v| v.to_string())
                        }
                        _ => {}
                    }
                }
                if let (Some(id), Some(target)) = (id, target) {
                    targets.insert(id, target);
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    let mut sheets = Vec::with_capacity(declared.len());
    for (order, (name, rel_id)) in declared.into_iter().enumerate() {
        let target = targets.get(&rel_id).ok_or_else(|| {
            TabliftError::SourceFormat(format!(
                "sheet '{name}' references unknown relationship {rel_id}"
            ))
        })?;
        // Targets are relative to xl/ unless rooted.
        let path = if let Some(stripped) = target.strip_prefix('/') {
            stripped.to_string()
        } else {
            format!("xl/{target}")
        };
        sheets.push(SheetMeta {
            name,
            path,
            order: order as u32,
        });
    }
    Ok(sheets)
}

#[cfg(test)]
mod tests {
    use super::*;

    const WORKBOOK: &str = r#"<?xml version="1.0"?>
<workbook xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main"
          xmlns:r="http://schemas.openxmlformats.org/officeDocument/2006/relationships">
  <sheets>
    <sheet name="Employees" sheetId="1" r:id="rId1"/>
    <sheet name="Departments" sheetId="2" r:id="rId2"/>
  </sheets>
</workbook>"#;

    const RELS: &str = r#"<?xml version="1.0"?>
<Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships">
  <Relationship Id="rId1" Type="w" Target="worksheets/sheet1.xml"/>
  <Relationship Id="rId2" Type="w" Target="worksheets/sheet2.xml"/>
</Relationships>"#;

    #[test]
    fn sheets_resolve_in_workbook_order() {
        let sheets = resolve_sheets(WORKBOOK, RELS).unwrap();
        assert_eq!(sheets.len(), 2);
        assert_eq!(sheets[0].name, "Employees");
        assert_eq!(sheets[0].path, "xl/worksheets/sheet1.xml");
        assert_eq!(sheets[0].order, 0);
        assert_eq!(sheets[1].name, "Departments");
        assert_eq!(sheets[1].order, 1);
    }

    #[test]
    fn unknown_relationship_is_a_format_error() {
        let bad_rels = r#"<Relationships><Relationship Id="rId9" Target="x.xml"/></Relationships>"#;
        let result = resolve_sheets(WORKBOOK, bad_rels);
        assert!(matches!(result, Err(TabliftError::SourceFormat(_))));
    }
}
