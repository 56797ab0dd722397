use super::decode_text;
use crate::error::{IntakeError, Result};
use crate::schema::{CellValue, OriginKind, RawSheet, SheetOrigin};

const CANDIDATES: [u8; 4] = [b'\t', b';', b',', b'|'];

/// Picks the delimiter that splits the first lines into the most consistent
/// multi-field records. `None` when no candidate yields more than one field.
pub fn sniff_delimiter(content: &str) -> Option<u8> {
    let sample_lines: Vec<&str> = content
        .lines()
        .filter(|l| !l.trim().is_empty())
        .take(10)
        .collect();
    if sample_lines.is_empty() {
        return None;
    }

    let mut best = None;
    let mut best_score = 0u64;

    for &delim in &CANDIDATES {
        let counts: Vec<usize> = sample_lines
            .iter()
            .map(|line| {
                ::csv::ReaderBuilder::new()
                    .delimiter(delim)
                    .has_headers(false)
                    .flexible(true)
                    .from_reader(line.as_bytes())
                    .records()
                    .next()
                    .and_then(|r| r.ok())
                    .map(|r| r.len())
                    .unwrap_or(1)
            })
            .collect();

        let target = counts.iter().copied().max().unwrap_or(0);
        if target <= 1 {
            continue;
        }

        // lines agreeing with the widest record, weighted by width
        let consistent = counts.iter().filter(|&&c| c == target).count() as u64;
        let score = consistent * target as u64;

        if score > best_score {
            best_score = score;
            best = Some(delim);
        }
    }

    best
}

pub fn read(name: &str, bytes: &[u8]) -> Result<Vec<RawSheet>> {
    let content = decode_text(bytes);
    let delimiter = sniff_delimiter(&content).unwrap_or(b',');

    let mut reader = ::csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .has_headers(false)
        .flexible(true)
        .from_reader(content.as_bytes());

    let mut rows = Vec::new();
    for result in reader.records() {
        let record = result.map_err(|e| IntakeError::CorruptFile {
            file: name.to_string(),
            details: e.to_string(),
        })?;
        rows.push(record.iter().map(CellValue::text).collect::<Vec<_>>());
    }

    while rows
        .last()
        .is_some_and(|r: &Vec<CellValue>| r.iter().all(CellValue::is_blank))
    {
        rows.pop();
    }

    let sheet_name = std::path::Path::new(name)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("Sheet1")
        .to_string();

    Ok(vec![RawSheet::new(
        SheetOrigin::new(name, sheet_name, 0, OriginKind::Sheet),
        rows,
    )])
}
