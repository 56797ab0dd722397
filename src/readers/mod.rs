//! Format readers.
//!
//! Every reader turns raw upload bytes into [`RawSheet`]s; downstream code never
//! branches on the source format again.

pub mod csv;
pub mod docx;
pub mod pdf;
pub mod spreadsheet;
pub mod text;

use crate::error::{IntakeError, Result};
use crate::schema::{RawSheet, Warning, WarningCode};
use log::{debug, info, warn};
use std::time::{Duration, Instant};
use tokio::task::JoinError;

/// Time past the budget before a stuck document reader is abandoned. Readers
/// that check their deadline return partial pages well within it.
const ABANDON_GRACE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceFormat {
    Delimited,
    Spreadsheet,
    WordDocument,
    Pdf,
    PlainText,
}

#[derive(Debug, Clone, Default)]
pub struct ReadOutcome {
    pub sheets: Vec<RawSheet>,
    pub warnings: Vec<Warning>,
}

impl From<Vec<RawSheet>> for ReadOutcome {
    fn from(sheets: Vec<RawSheet>) -> Self {
        Self {
            sheets,
            warnings: Vec::new(),
        }
    }
}

const PDF_MAGIC: &[u8] = b"%PDF";
const ZIP_MAGIC: &[u8] = b"PK\x03\x04";
const OLE_MAGIC: &[u8] = &[0xD0, 0xCF, 0x11, 0xE0];

impl SourceFormat {
    /// Detects the format from magic bytes, then the declared MIME type, then the
    /// file extension, then the content itself.
    pub fn detect(name: &str, bytes: &[u8], declared_mime: Option<&str>) -> Result<Self> {
        if bytes.is_empty() {
            return Err(IntakeError::UnsupportedFormat {
                file: name.to_string(),
                details: "file is empty".to_string(),
            });
        }

        if bytes.starts_with(PDF_MAGIC) {
            return Ok(SourceFormat::Pdf);
        }
        if bytes.starts_with(ZIP_MAGIC) {
            return Ok(if docx::looks_like_docx(bytes) {
                SourceFormat::WordDocument
            } else {
                SourceFormat::Spreadsheet
            });
        }
        if bytes.starts_with(OLE_MAGIC) {
            return Ok(SourceFormat::Spreadsheet);
        }

        if let Some(format) = declared_mime.and_then(Self::from_mime) {
            return Ok(format);
        }
        if let Some(format) = mime_guess::from_path(name)
            .first_raw()
            .and_then(Self::from_mime)
        {
            return Ok(format);
        }

        let head = &bytes[..bytes.len().min(1024)];
        if head.contains(&0) {
            return Err(IntakeError::UnsupportedFormat {
                file: name.to_string(),
                details: "binary content of an unknown type".to_string(),
            });
        }
        let content = decode_text(bytes);
        if csv::sniff_delimiter(&content).is_some() {
            Ok(SourceFormat::Delimited)
        } else {
            Ok(SourceFormat::PlainText)
        }
    }

    fn from_mime(mime: &str) -> Option<Self> {
        let mime = mime.split(';').next().unwrap_or_default().trim().to_lowercase();
        match mime.as_str() {
            "text/csv" | "text/tab-separated-values" | "application/csv" => {
                Some(SourceFormat::Delimited)
            }
            "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet"
            | "application/vnd.ms-excel"
            | "application/vnd.ms-excel.sheet.macroenabled.12"
            | "application/vnd.ms-excel.sheet.binary.macroenabled.12"
            | "application/vnd.oasis.opendocument.spreadsheet" => Some(SourceFormat::Spreadsheet),
            "application/vnd.openxmlformats-officedocument.wordprocessingml.document" => {
                Some(SourceFormat::WordDocument)
            }
            "application/pdf" => Some(SourceFormat::Pdf),
            "text/plain" | "text/markdown" => Some(SourceFormat::PlainText),
            _ => None,
        }
    }
}

/// Reads one uploaded file into raw sheets.
///
/// `budget` bounds the document and PDF readers; when it runs out the sheets
/// completed so far are returned with a `partial_extraction` warning.
pub fn read(
    name: &str,
    bytes: &[u8],
    declared_mime: Option<&str>,
    budget: Duration,
) -> Result<ReadOutcome> {
    let format = SourceFormat::detect(name, bytes, declared_mime)?;
    debug!("Detected {:?} for '{}' ({} bytes)", format, name, bytes.len());

    let deadline = Instant::now() + budget;
    let outcome = match format {
        SourceFormat::Delimited => csv::read(name, bytes)?.into(),
        SourceFormat::Spreadsheet => spreadsheet::read(name, bytes)?.into(),
        SourceFormat::PlainText => text::read(name, bytes).into(),
        SourceFormat::WordDocument => docx::read(name, bytes, deadline)?,
        SourceFormat::Pdf => pdf::read(name, bytes, deadline)?,
    };

    info!(
        "Read {} sheet(s) from '{}' ({} warning(s))",
        outcome.sheets.len(),
        name,
        outcome.warnings.len()
    );
    Ok(outcome)
}

/// [`read`] on the blocking pool. A PDF or Word read still running once the
/// budget (plus a short grace) has passed is abandoned; the caller gets no
/// sheets and a `partial_extraction` warning.
pub async fn read_bounded(
    name: String,
    bytes: Vec<u8>,
    declared_mime: Option<String>,
    budget: Duration,
) -> Result<ReadOutcome> {
    let format = SourceFormat::detect(&name, &bytes, declared_mime.as_deref())?;
    let file = name.clone();
    let task = move || read(&file, &bytes, declared_mime.as_deref(), budget);
    match format {
        SourceFormat::Pdf | SourceFormat::WordDocument => {
            run_bounded(&name, budget + ABANDON_GRACE, task).await
        }
        _ => joined(&name, tokio::task::spawn_blocking(task).await),
    }
}

async fn run_bounded<F>(name: &str, limit: Duration, task: F) -> Result<ReadOutcome>
where
    F: FnOnce() -> Result<ReadOutcome> + Send + 'static,
{
    match tokio::time::timeout(limit, tokio::task::spawn_blocking(task)).await {
        Ok(result) => joined(name, result),
        Err(_) => {
            warn!("Reading '{}' exceeded {} ms; abandoned", name, limit.as_millis());
            Ok(ReadOutcome {
                sheets: Vec::new(),
                warnings: vec![Warning::new(
                    WarningCode::PartialExtraction,
                    format!(
                        "Parse time budget exceeded after {} ms; no content was extracted",
                        limit.as_millis()
                    ),
                )
                .at(name)],
            })
        }
    }
}

fn joined(
    name: &str,
    result: std::result::Result<Result<ReadOutcome>, JoinError>,
) -> Result<ReadOutcome> {
    result.map_err(|e| IntakeError::CorruptFile {
        file: name.to_string(),
        details: format!("reader task failed: {}", e),
    })?
}

/// Decodes text as UTF-8 (BOM stripped), falling back to Windows-1252.
pub fn decode_text(bytes: &[u8]) -> String {
    let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
    match std::str::from_utf8(bytes) {
        Ok(s) => s.to_string(),
        Err(_) => {
            // Excel-exported CSVs are frequently Windows-1252
            let (decoded, _, _) = encoding_rs::WINDOWS_1252.decode(bytes);
            decoded.into_owned()
        }
    }
}
