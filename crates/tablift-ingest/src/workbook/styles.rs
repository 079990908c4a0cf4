//! Styles table, reduced to what the pipeline needs: which cell formats
//! render as dates. Parsed once per workbook.

use std::collections::HashMap;
use std::io::BufRead;

use quick_xml::events::Event;

use tablift_common::Result;

/// Builtin OOXML number-format ids that render as dates or datetimes.
fn builtin_is_date(numfmt_id: u32) -> bool {
    matches!(numfmt_id, 14..=22 | 45..=47)
}

/// Date heuristic for custom format codes: any day/year token, or an
/// hour+minute pair. Bracketed sections and quoted literals are ignored.
fn code_is_date(code: &str) -> bool {
    let mut cleaned = String::with_capacity(code.len());
    let mut in_bracket = false;
    let mut in_quote = false;
    for c in code.chars() {
        match c {
            '[' if !in_quote => in_bracket = true,
            ']' if !in_quote => in_bracket = false,
            '"' => in_quote = !in_quote,
            _ if !in_bracket && !in_quote => cleaned.push(c.to_ascii_lowercase()),
            _ => {}
        }
    }
    cleaned.contains('y')
        || cleaned.contains('d')
        || (cleaned.contains('h') && cleaned.contains('m'))
}

/// Per-xf date flags extracted from `xl/styles.xml`
#[derive(Debug, Default)]
pub struct Stylesheet {
    xf_is_date: Vec<bool>,
}

impl Stylesheet {
    pub fn parse<R: BufRead>(source: R) -> Result<Self> {
        let mut reader = quick_xml::Reader::from_reader(source);
        reader.config_mut().trim_text(true);

        let mut custom_date_formats: HashMap<u32, bool> = HashMap::new();
        let mut xf_is_date = Vec::new();
        let mut in_cell_xfs = false;
        let mut buf = Vec::with_capacity(512);

        loop {
            buf.clear();
            match reader.read_event_into(&mut buf)? {
                Event::Start(ref e) | Event::Empty(ref e) => match e.local_name().as_ref() {
                    b"numFmt" => {
                        let mut id = None;
                        let mut code = None;
                        for attr in e.attributes().flatten() {
                            match attr.key.as_ref() {
                                b"numFmtId" => {
                                    id = attr
                                        .unescape_value()
                                        .ok()
                                        .and_then(|v| v.parse::<u32>().ok())
                                }
                                b"formatCode" => {
                                    code = attr.unescape_value().ok().map(|v| v.to_string())
                                }
                                _ => {}
                            }
                        }
                        if let (Some(id), Some(code)) = (id, code) {
                            custom_date_formats.insert(id, code_is_date(&code));
                        }
                    }
                    b"cellXfs" => in_cell_xfs = true,
                    b"xf" if in_cell_xfs => {
                        let numfmt_id = e
                            .attributes()
                            .flatten()
                            .find(|a| a.key.as_ref() == b"numFmtId")
                            .and_then(|a| a.unescape_value().ok())
                            .and_then(|v| v.parse::<u32>().ok())
                            .unwrap_or(0);
                        let is_date = builtin_is_date(numfmt_id)
                            || custom_date_formats.get(&numfmt_id).copied().unwrap_or(false);
                        xf_is_date.push(is_date);
                    }
                    _ => {}
                },
                Event::End(ref e) if e.local_name().as_ref() == b"cellXfs" => {
                    in_cell_xfs = false;
                }
                Event::Eof => break,
                _ => {}
            }
        }

        Ok(Self { xf_is_date })
    }

    /// True when the cell xf at `index` carries a date number format.
    pub fn is_date_format(&self, index: usize) -> bool {
        self.xf_is_date.get(index).copied().unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.xf_is_date.len()
    }

    pub fn is_empty(&self) -> bool {
        self.xf_is_date.is_empty()
    }
}
