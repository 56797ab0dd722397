use super::ReadOutcome;
use crate::error::{IntakeError, Result};
use crate::schema::{CellValue, OriginKind, RawSheet, SheetOrigin, Warning, WarningCode};
use log::warn;
use quick_xml::events::Event;
use quick_xml::Reader;
use std::io::{Cursor, Read};
use std::time::Instant;

const DOCUMENT_PART: &str = "word/document.xml";

pub fn looks_like_docx(bytes: &[u8]) -> bool {
    zip::ZipArchive::new(Cursor::new(bytes))
        .map(|archive| archive.file_names().any(|n| n == DOCUMENT_PART))
        .unwrap_or(false)
}

#[derive(Default)]
struct TableBuilder {
    rows: Vec<Vec<CellValue>>,
    row: Vec<CellValue>,
    cell: String,
}

/// Reads body paragraphs as one text sheet and every top-level table as its own grid.
pub fn read(name: &str, bytes: &[u8], deadline: Instant) -> Result<ReadOutcome> {
    let corrupt = |details: String| IntakeError::CorruptFile {
        file: name.to_string(),
        details,
    };

    let mut archive =
        zip::ZipArchive::new(Cursor::new(bytes)).map_err(|e| corrupt(e.to_string()))?;
    let mut xml = String::new();
    archive
        .by_name(DOCUMENT_PART)
        .map_err(|e| corrupt(format!("{}: {}", DOCUMENT_PART, e)))?
        .read_to_string(&mut xml)
        .map_err(|e| corrupt(format!("{}: {}", DOCUMENT_PART, e)))?;

    let mut reader = Reader::from_str(&xml);
    reader.config_mut().trim_text(false);

    let mut outcome = ReadOutcome::default();
    let mut paragraphs: Vec<Vec<CellValue>> = Vec::new();
    let mut paragraph = String::new();
    let mut in_text = false;
    let mut table_depth = 0usize;
    let mut table = TableBuilder::default();
    let mut table_count = 0usize;

    loop {
        if Instant::now() >= deadline {
            warn!("Time budget exhausted while reading '{}'", name);
            outcome.warnings.push(
                Warning::new(
                    WarningCode::PartialExtraction,
                    format!(
                        "Time budget exhausted after {} table(s); remaining content skipped",
                        table_count
                    ),
                )
                .at(name),
            );
            break;
        }

        match reader.read_event() {
            Ok(Event::Start(e)) => match e.name().as_ref() {
                b"w:tbl" => {
                    table_depth += 1;
                    if table_depth == 1 {
                        table = TableBuilder::default();
                    }
                }
                b"w:t" => in_text = true,
                _ => {}
            },
            Ok(Event::Empty(e)) => {
                let target = if table_depth > 0 {
                    &mut table.cell
                } else {
                    &mut paragraph
                };
                match e.name().as_ref() {
                    b"w:tab" => target.push('\t'),
                    b"w:br" => target.push(' '),
                    _ => {}
                }
            }
            Ok(Event::Text(e)) if in_text => {
                let text = String::from_utf8_lossy(e.as_ref());
                if table_depth > 0 {
                    table.cell.push_str(&text);
                } else {
                    paragraph.push_str(&text);
                }
            }
            Ok(Event::GeneralRef(e)) if in_text => {
                let resolved = match e.as_ref() {
                    b"amp" => "&",
                    b"lt" => "<",
                    b"gt" => ">",
                    b"quot" => "\"",
                    b"apos" => "'",
                    _ => "",
                };
                if table_depth > 0 {
                    table.cell.push_str(resolved);
                } else {
                    paragraph.push_str(resolved);
                }
            }
            Ok(Event::End(e)) => match e.name().as_ref() {
                b"w:t" => in_text = false,
                b"w:p" if table_depth == 0 => {
                    paragraphs.push(vec![CellValue::text(std::mem::take(&mut paragraph))]);
                }
                b"w:p" => {
                    if !table.cell.is_empty() && !table.cell.ends_with(' ') {
                        table.cell.push(' ');
                    }
                }
                b"w:tc" if table_depth == 1 => {
                    let text = std::mem::take(&mut table.cell);
                    table.row.push(CellValue::text(text.trim()));
                }
                b"w:tr" if table_depth == 1 => {
                    let row = std::mem::take(&mut table.row);
                    table.rows.push(row);
                }
                b"w:tbl" => {
                    table_depth = table_depth.saturating_sub(1);
                    if table_depth == 0 {
                        let rows = std::mem::take(&mut table.rows);
                        outcome.sheets.push(RawSheet::new(
                            SheetOrigin::new(
                                name,
                                format!("table {}", table_count + 1),
                                table_count + 1,
                                OriginKind::Table,
                            ),
                            rows,
                        ));
                        table_count += 1;
                    }
                }
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(corrupt(format!("malformed markup: {}", e))),
            _ => {}
        }
    }

    if paragraphs.iter().any(|p| p.iter().any(|c| !c.is_blank())) {
        outcome.sheets.insert(
            0,
            RawSheet::new(SheetOrigin::new(name, "body", 0, OriginKind::Text), paragraphs),
        );
    }

    Ok(outcome)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io::Write;
    use std::time::Duration;
    use zip::write::SimpleFileOptions;

    pub(crate) fn make_docx(body: &str) -> Vec<u8> {
        let xml = format!(
            r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<w:document xmlns:w="http://schemas.openxmlformats.org/wordprocessingml/2006/main"><w:body>{}</w:body></w:document>"#,
            body
        );
        let mut buf = Cursor::new(Vec::new());
        {
            let mut zip = zip::ZipWriter::new(&mut buf);
            zip.start_file("word/document.xml", SimpleFileOptions::default())
                .unwrap();
            zip.write_all(xml.as_bytes()).unwrap();
            zip.finish().unwrap();
        }
        buf.into_inner()
    }

    fn para(text: &str) -> String {
        format!("<w:p><w:r><w:t>{}</w:t></w:r></w:p>", text)
    }

    fn table(rows: &[&[&str]]) -> String {
        let body: String = rows
            .iter()
            .map(|r| {
                let cells: String = r
                    .iter()
                    .map(|c| format!("<w:tc>{}</w:tc>", para(c)))
                    .collect();
                format!("<w:tr>{}</w:tr>", cells)
            })
            .collect();
        format!("<w:tbl>{}</w:tbl>", body)
    }

    #[test]
    fn test_paragraphs_and_tables() {
        let body = format!(
            "{}{}{}",
            para("Quotation for doors &amp; frames"),
            table(&[&["Vendor", "Item", "Unit Price"], &["Acme", "D01", "1,200"]]),
            para("Valid 30 days")
        );
        let bytes = make_docx(&body);
        assert!(looks_like_docx(&bytes));

        let outcome = read("quote.docx", &bytes, Instant::now() + Duration::from_secs(5)).unwrap();
        assert!(outcome.warnings.is_empty());
        assert_eq!(outcome.sheets.len(), 2);

        let text = &outcome.sheets[0];
        assert_eq!(text.origin().kind, OriginKind::Text);
        assert_eq!(text.cell(0, 0).display(), "Quotation for doors & frames");
        assert_eq!(text.cell(1, 0).display(), "Valid 30 days");

        let grid = &outcome.sheets[1];
        assert_eq!(grid.origin().kind, OriginKind::Table);
        assert_eq!(grid.cell(1, 2).display(), "1,200");
    }

    #[test]
    fn test_missing_document_part_is_corrupt() {
        let mut buf = Cursor::new(Vec::new());
        {
            let mut zip = zip::ZipWriter::new(&mut buf);
            zip.start_file("other.xml", SimpleFileOptions::default())
                .unwrap();
            zip.write_all(b"<x/>").unwrap();
            zip.finish().unwrap();
        }
        let err = read("x.docx", &buf.into_inner(), Instant::now() + Duration::from_secs(5))
            .unwrap_err();
        assert_eq!(err.code(), "corrupt_file");
    }
}
