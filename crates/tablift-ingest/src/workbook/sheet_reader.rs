//! Forward-only worksheet row cursor.
//!
//! Walks a worksheet part with event-driven XML parsing and exposes a
//! row-level `next_row()` cursor to the outside. Shared-string indices are
//! resolved against the workbook table as cells are read; formula elements
//! are skipped but their cached results kept. Rows arrive sparse, exactly
//! as stored.

use std::io::{BufReader, Read};
use std::sync::Arc;

use quick_xml::events::{BytesStart, Event};

use tablift_common::{Result, TabliftError};

use super::SharedStrings;

/// One cell as stored: 1-based column, resolved text, style index
#[derive(Debug, Clone, PartialEq)]
pub struct RawCell {
    pub column: u32,
    pub text: String,
    pub style: Option<u32>,
}

/// One sparse worksheet row
#[derive(Debug, Clone, PartialEq)]
pub struct RawRow {
    /// 1-based row number from the sheet
    pub row_number: u64,
    pub cells: Vec<RawCell>,
}

impl RawRow {
    /// Dense cell texts, blanks filled in, for header binding.
    pub fn dense_texts(&self) -> Vec<String> {
        let width = self
            .cells
            .iter()
            .map(|c| c.column as usize)
            .max()
            .unwrap_or(0);
        let mut out = vec![String::new(); width];
        for cell in &self.cells {
            out[cell.column as usize - 1] = cell.text.clone();
        }
        out
    }
}

/// Streaming cursor over one worksheet part
pub struct SheetCursor<'a> {
    reader: quick_xml::Reader<BufReader<Box<dyn Read + 'a>>>,
    shared: Arc<SharedStrings>,
    last_row_number: u64,
    done: bool,
}

impl<'a> SheetCursor<'a> {
    pub fn new(source: Box<dyn Read + 'a>, shared: Arc<SharedStrings>) -> Self {
        let mut reader = quick_xml::Reader::from_reader(BufReader::with_capacity(
            64 * 1024,
            source,
        ));
        reader.config_mut().trim_text(false);
        Self {
            reader,
            shared,
            last_row_number: 0,
            done: false,
        }
    }

    /// Next row in document order, `None` at the end of the sheet.
    pub fn next_row(&mut self) -> Result<Option<RawRow>> {
        if self.done {
            return Ok(None);
        }

        let mut buf = Vec::with_capacity(4096);
        loop {
            buf.clear();
            match self.reader.read_event_into(&mut buf)? {
                Event::Start(ref e) if e.local_name().as_ref() == b"row" => {
                    let row_number =
                        row_number_attr(e).unwrap_or(self.last_row_number + 1);
                    self.last_row_number = row_number;
                    let row = self.read_row_body(row_number)?;
                    return Ok(Some(row));
                }
                Event::Empty(ref e) if e.local_name().as_ref() == b"row" => {
                    let row_number =
                        row_number_attr(e).unwrap_or(self.last_row_number + 1);
                    self.last_row_number = row_number;
                    return Ok(Some(RawRow {
                        row_number,
                        cells: Vec::new(),
                    }));
                }
                Event::Eof => {
                    self.done = true;
                    return Ok(None);
                }
                _ => {}
            }
        }
    }

    fn read_row_body(&mut self, row_number: u64) -> Result<RawRow> {
        let mut cells = Vec::new();
        let mut last_column = 0u32;
        let mut buf = Vec::with_capacity(1024);

        loop {
            buf.clear();
            match self.reader.read_event_into(&mut buf)? {
                Event::Start(ref e) if e.local_name().as_ref() == b"c" => {
                    let attrs = CellAttrs::from_start(e, last_column);
                    last_column = attrs.column;
                    if let Some(cell) = self.read_cell_body(attrs)? {
                        cells.push(cell);
                    }
                }
                Event::Empty(ref e) if e.local_name().as_ref() == b"c" => {
                    let attrs = CellAttrs::from_start(e, last_column);
                    last_column = attrs.column;
                    // No body, no value.
                }
                Event::End(ref e) if e.local_name().as_ref() == b"row" => break,
                Event::Eof => {
                    self.done = true;
                    break;
                }
                _ => {}
            }
        }

        Ok(RawRow { row_number, cells })
    }

    /// Read the body of a `<c>` element and resolve its value.
    fn read_cell_body(&mut self, attrs: CellAttrs) -> Result<Option<RawCell>> {
        let mut value_text: Option<String> = None;
        let mut inline_text: Option<String> = None;
        let mut in_value = false;
        let mut in_inline_text = false;
        let mut buf = Vec::with_capacity(512);

        loop {
            buf.clear();
            match self.reader.read_event_into(&mut buf)? {
                Event::Start(ref e) => match e.local_name().as_ref() {
                    b"v" => in_value = true,
                    b"is" => inline_text = Some(String::new()),
                    b"t" if inline_text.is_some() => in_inline_text = true,
                    _ => {}
                },
                Event::End(ref e) => match e.local_name().as_ref() {
                    b"c" => break,
                    b"v" => in_value = false,
                    b"t" => in_inline_text = false,
                    _ => {}
                },
                Event::Text(ref e) => {
                    let decoded = e.unescape()?;
                    if in_value {
                        value_text.get_or_insert_with(String::new).push_str(&decoded);
                    } else if in_inline_text {
                        if let Some(ref mut s) = inline_text {
                            s.push_str(&decoded);
                        }
                    }
                }
                Event::Eof => {
                    self.done = true;
                    break;
                }
                _ => {}
            }
        }

        let text = match (attrs.cell_type.as_deref(), value_text, inline_text) {
            (Some("s"), Some(v), _) => {
                let index: usize = v.trim().parse().map_err(|_| {
                    TabliftError::SourceFormat(format!("invalid shared-string index '{v}'"))
                })?;
                self.shared
                    .get(index)
                    .ok_or_else(|| {
                        TabliftError::SourceFormat(format!(
                            "shared-string index {index} out of bounds"
                        ))
                    })?
                    .to_string()
            }
            (Some("inlineStr"), _, inline) => inline.unwrap_or_default(),
            (_, Some(v), _) => v,
            _ => return Ok(None),
        };

        Ok(Some(RawCell {
            column: attrs.column,
            text,
            style: attrs.style,
        }))
    }
}

struct CellAttrs {
    column: u32,
    cell_type: Option<String>,
    style: Option<u32>,
}

impl CellAttrs {
    fn from_start(e: &BytesStart<'_>, last_column: u32) -> Self {
        let mut column = None;
        let mut cell_type = None;
        let mut style = None;
        for attr in e.attributes().flatten() {
            match attr.key.as_ref() {
                b"r" => {
                    if let Ok(value) = std::str::from_utf8(&attr.value) {
                        column = column_of_ref(value);
                    }
                }
                b"t" => {
                    cell_type = std::str::from_utf8(&attr.value).ok().map(str::to_string);
                }
                b"s" => {
                    style = std::str::from_utf8(&attr.value)
                        .ok()
                        .and_then(|v| v.parse().ok());
                }
                _ => {}
            }
        }
        Self {
            column: column.unwrap_or(last_column + 1),
            cell_type,
            style,
        }
    }
}

/// Row number from a `<row>` element's `r` attribute, if present.
fn row_number_attr(e: &BytesStart<'_>) -> Option<u64> {
    e.attributes().flatten().find_map(|attr| {
        if attr.key.as_ref() == b"r" {
            std::str::from_utf8(&attr.value).ok()?.parse().ok()
        } else {
            None
        }
    })
}

/// 1-based column index from an A1-style reference ("BC12" -> 55).
fn column_of_ref(cell_ref: &str) -> Option<u32> {
    let mut column = 0u32;
    let mut seen = false;
    for c in cell_ref.chars() {
        if c.is_ascii_alphabetic() {
            seen = true;
            column = column * 26 + (c.to_ascii_uppercase() as u32 - 'A' as u32 + 1);
        } else {
            break;
        }
    }
    seen.then_some(column)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cursor_over(xml: &'static str, sst: SharedStrings) -> SheetCursor<'static> {
        SheetCursor::new(Box::new(xml.as_bytes()), Arc::new(sst))
    }

    fn read_all(xml: &'static str, sst: SharedStrings) -> Vec<RawRow> {
        let mut cursor = cursor_over(xml, sst);
        let mut rows = Vec::new();
        while let Some(row) = cursor.next_row().unwrap() {
            rows.push(row);
        }
        rows
    }

    #[test]
    fn column_references_decode() {
        assert_eq!(column_of_ref("A1"), Some(1));
        assert_eq!(column_of_ref("Z9"), Some(26));
        assert_eq!(column_of_ref("AA3"), Some(27));
        assert_eq!(column_of_ref("BC12"), Some(55));
        assert_eq!(column_of_ref("12"), None);
    }

    #[test]
    fn rows_arrive_in_order_with_sparse_columns() {
        static XML: &str = r#"<worksheet><sheetData>
<row r="1"><c r="A1"><v>1</v></c><c r="C1"><v>3</v></c></row>
<row r="4"><c r="B4"><v>2</v></c></row>
</sheetData></worksheet>"#;
        let rows = read_all(XML, SharedStrings::default());
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].row_number, 1);
        assert_eq!(rows[0].cells.len(), 2);
        assert_eq!(rows[0].cells[1].column, 3);
        assert_eq!(rows[1].row_number, 4);
    }

    #[test]
    fn shared_strings_resolve() {
        let sst = SharedStrings::parse(
            r#"<sst><si><t>Name</t></si><si><t>Age</t></si></sst>"#.as_bytes(),
        )
        .unwrap();
        static XML: &str = r#"<worksheet><sheetData>
<row r="1"><c r="A1" t="s"><v>0</v></c><c r="B1" t="s"><v>1</v></c></row>
</sheetData></worksheet>"#;
        let rows = read_all(XML, sst);
        assert_eq!(rows[0].cells[0].text, "Name");
        assert_eq!(rows[0].cells[1].text, "Age");
    }

    #[test]
    fn out_of_bounds_shared_string_is_an_error() {
        static XML: &str = r#"<worksheet><sheetData>
<row r="1"><c r="A1" t="s"><v>7</v></c></row>
</sheetData></worksheet>"#;
        let mut cursor = cursor_over(XML, SharedStrings::default());
        assert!(cursor.next_row().is_err());
    }

    #[test]
    fn inline_strings_and_empty_cells() {
        static XML: &str = r#"<worksheet><sheetData>
<row r="1"><c r="A1" t="inlineStr"><is><t>In</t><t>line</t></is></c><c r="B1"/><c r="C1"><v>5</v></c></row>
</sheetData></worksheet>"#;
        let rows = read_all(XML, SharedStrings::default());
        assert_eq!(rows[0].cells.len(), 2);
        assert_eq!(rows[0].cells[0].text, "Inline");
        assert_eq!(rows[0].cells[1].column, 3);
    }

    #[test]
    fn missing_cell_refs_advance_by_position() {
        static XML: &str = r#"<worksheet><sheetData>
<row r="1"><c><v>a</v></c><c><v>b</v></c></row>
</sheetData></worksheet>"#;
        let rows = read_all(XML, SharedStrings::default());
        assert_eq!(rows[0].cells[0].column, 1);
        assert_eq!(rows[0].cells[1].column, 2);
    }

    #[test]
    fn formula_cells_keep_cached_value() {
        static XML: &str = r#"<worksheet><sheetData>
<row r="1"><c r="A1"><f>SUM(B1:B9)</f><v>42</v></c></row>
</sheetData></worksheet>"#;
        let rows = read_all(XML, SharedStrings::default());
        assert_eq!(rows[0].cells[0].text, "42");
    }

    #[test]
    fn style_index_is_carried() {
        static XML: &str = r#"<worksheet><sheetData>
<row r="1"><c r="A1" s="3"><v>44927</v></c></row>
</sheetData></worksheet>"#;
        let rows = read_all(XML, SharedStrings::default());
        assert_eq!(rows[0].cells[0].style, Some(3));
    }

    #[test]
    fn dense_texts_fill_gaps() {
        let row = RawRow {
            row_number: 1,
            cells: vec![
                RawCell {
                    column: 1,
                    text: "a".into(),
                    style: None,
                },
                RawCell {
                    column: 3,
                    text: "c".into(),
                    style: None,
                },
            ],
        };
        assert_eq!(row.dense_texts(), vec!["a", "", "c"]);
    }

    #[test]
    fn empty_sheet_yields_no_rows() {
        static XML: &str = r#"<worksheet><sheetData></sheetData></worksheet>"#;
        assert!(read_all(XML, SharedStrings::default()).is_empty());
    }
}
