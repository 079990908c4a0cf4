//! Shared-strings table.
//!
//! Cells of type `s` reference this table by index, so it has to be
//! resident for the whole workbook. It is parsed once per package and
//! shared read-only across every sheet cursor.

use std::io::BufRead;

use quick_xml::events::Event;

use tablift_common::Result;

/// The workbook's shared-strings table
#[derive(Debug, Default)]
pub struct SharedStrings {
    strings: Vec<String>,
}

impl SharedStrings {
    /// Parse `xl/sharedStrings.xml`. Rich-text runs are flattened into a
    /// single string; phonetic runs (`rPh`) are skipped.
    pub fn parse<R: BufRead>(source: R) -> Result<Self> {
        let mut reader = quick_xml::Reader::from_reader(source);
        reader.config_mut().trim_text(false);

        let mut strings = Vec::new();
        let mut buf = Vec::with_capacity(1024);
        let mut current: Option<String> = None;
        let mut in_text = false;
        let mut in_phonetic = false;

        loop {
            buf.clear();
            match reader.read_event_into(&mut buf)? {
                Event::Start(ref e) => match e.local_name().as_ref() {
                    b"si" => current = Some(String::new()),
                    b"rPh" => in_phonetic = true,
                    b"t" if !in_phonetic => in_text = true,
                    _ => {}
                },
                Event::End(ref e) => match e.local_name().as_ref() {
                    b"si" => {
                        if let Some(s) = current.take() {
                            strings.push(s);
                        }
                    }
                    b"rPh" => in_phonetic = false,
                    b"t" => in_text = false,
                    _ => {}
                },
                Event::Text(ref e) if in_text => {
                    if let Some(ref mut s) = current {
                        s.push_str(&e.unescape()?);
                    }
                }
                Event::Eof => break,
                _ => {}
            }
        }

        Ok(Self { strings })
    }

    pub fn get(&self, index: usize) -> Option<&str> {
        self.strings.get(index).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.strings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strings.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_and_rich_text_entries() {
        let xml = r#"<?xml version="1.0"?>
<sst xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main" count="3" uniqueCount="3">
  <si><t>Full Name</t></si>
  <si><r><t>Bold</t></r><r><t> Normal</t></r></si>
  <si><t xml:space="preserve"> spaced </t></si>
</sst>"#;
        let sst = SharedStrings::parse(xml.as_bytes()).unwrap();
        assert_eq!(sst.len(), 3);
        assert_eq!(sst.get(0), Some("Full Name"));
        assert_eq!(sst.get(1), Some("Bold Normal"));
        assert_eq!(sst.get(2), Some(" spaced "));
        assert_eq!(sst.get(3), None);
    }

    #[test]
    fn phonetic_runs_are_skipped() {
        let xml = r#"<sst><si><t>東京</t><rPh sb="0" eb="2"><t>とうきょう</t></rPh></si></sst>"#;
        let sst = SharedStrings::parse(xml.as_bytes()).unwrap();
        assert_eq!(sst.get(0), Some("東京"));
    }

    #[test]
    fn entities_are_unescaped() {
        let xml = r#"<sst><si><t>a &lt; b &amp; c</t></si></sst>"#;
        let sst = SharedStrings::parse(xml.as_bytes()).unwrap();
        assert_eq!(sst.get(0), Some("a < b & c"));
    }
}
