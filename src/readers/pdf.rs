use super::ReadOutcome;
use crate::error::{IntakeError, Result};
use crate::schema::{CellValue, OriginKind, RawSheet, SheetOrigin, Warning, WarningCode};
use log::{debug, warn};
use lopdf::Document;
use std::time::Instant;

/// Extracts text page by page; each page becomes a one-column sheet of lines.
///
/// The deadline is checked between pages. Pages finished before it passes are
/// returned together with a `partial_extraction` warning.
pub fn read(name: &str, bytes: &[u8], deadline: Instant) -> Result<ReadOutcome> {
    let mut outcome = ReadOutcome::default();
    if Instant::now() >= deadline {
        outcome.warnings.push(budget_warning(name, 0));
        return Ok(outcome);
    }

    let doc = Document::load_mem(bytes).map_err(|e| IntakeError::CorruptFile {
        file: name.to_string(),
        details: format!("Failed to parse PDF: {}", e),
    })?;

    let pages = doc.get_pages();
    for (index, page_number) in pages.keys().copied().enumerate() {
        if Instant::now() >= deadline {
            warn!(
                "PDF budget exhausted for '{}' after {} of {} page(s)",
                name,
                index,
                pages.len()
            );
            outcome.warnings.push(budget_warning(name, index));
            break;
        }

        let text = match doc.extract_text(&[page_number]) {
            Ok(text) => text,
            Err(e) => {
                warn!("Could not extract page {} of '{}': {}", page_number, name, e);
                outcome.warnings.push(
                    Warning::new(
                        WarningCode::PartialExtraction,
                        format!("Page {} has no extractable text: {}", page_number, e),
                    )
                    .at(format!("{}:page {}", name, page_number)),
                );
                continue;
            }
        };

        let rows: Vec<Vec<CellValue>> = text
            .lines()
            .map(|line| vec![CellValue::text(line.trim_end())])
            .collect();
        debug!("Page {} of '{}': {} line(s)", page_number, name, rows.len());

        outcome.sheets.push(RawSheet::new(
            SheetOrigin::new(name, format!("page {}", page_number), index, OriginKind::Page),
            rows,
        ));
    }

    Ok(outcome)
}

fn budget_warning(name: &str, completed: usize) -> Warning {
    Warning::new(
        WarningCode::PartialExtraction,
        format!(
            "PDF parse time budget exhausted; {} page(s) extracted",
            completed
        ),
    )
    .at(name)
}
