use crate::error::{IntakeError, Result};
use crate::schema::{CellValue, OriginKind, RawSheet, SheetOrigin};
use crate::utils::parse_date;
use calamine::{open_workbook_auto_from_rs, Data, Reader};
use chrono::{Days, NaiveDate};
use log::debug;
use std::io::Cursor;

/// Converts an Excel serial (1900 date system) to a calendar date.
pub fn excel_serial_to_date(serial: f64) -> Option<NaiveDate> {
    if !serial.is_finite() || serial < 1.0 {
        return None;
    }
    // Day 0 is 1899-12-30 once Excel's phantom 1900-02-29 is accounted for
    let epoch = NaiveDate::from_ymd_opt(1899, 12, 30)?;
    epoch.checked_add_days(Days::new(serial.floor() as u64))
}

fn convert(cell: &Data) -> CellValue {
    match cell {
        Data::Empty | Data::Error(_) => CellValue::Blank,
        Data::String(s) => CellValue::text(s.as_str()),
        Data::Float(n) => CellValue::Number(*n),
        Data::Int(n) => CellValue::Number(*n as f64),
        Data::Bool(b) => CellValue::Text(if *b { "TRUE" } else { "FALSE" }.to_string()),
        Data::DateTime(dt) => excel_serial_to_date(dt.as_f64())
            .map(CellValue::Date)
            .unwrap_or(CellValue::Number(dt.as_f64())),
        Data::DateTimeIso(s) => parse_date(s)
            .map(CellValue::Date)
            .unwrap_or_else(|| CellValue::text(s.as_str())),
        Data::DurationIso(s) => CellValue::text(s.as_str()),
    }
}

pub fn read(name: &str, bytes: &[u8]) -> Result<Vec<RawSheet>> {
    let corrupt = |details: String| IntakeError::CorruptFile {
        file: name.to_string(),
        details,
    };

    let mut workbook = open_workbook_auto_from_rs(Cursor::new(bytes.to_vec()))
        .map_err(|e| corrupt(e.to_string()))?;

    let mut sheets = Vec::new();
    for (index, sheet_name) in workbook.sheet_names().into_iter().enumerate() {
        let range = workbook
            .worksheet_range(&sheet_name)
            .map_err(|e| corrupt(format!("sheet '{}': {}", sheet_name, e)))?;

        // Range start offset (data may not begin at A1); keep real coordinates
        let (start_row, start_col) = range.start().unwrap_or((0, 0));
        let mut rows: Vec<Vec<CellValue>> = vec![Vec::new(); start_row as usize];
        for row in range.rows() {
            let mut cells = vec![CellValue::Blank; start_col as usize];
            cells.extend(row.iter().map(convert));
            rows.push(cells);
        }

        debug!(
            "Sheet '{}' of '{}': {} row(s)",
            sheet_name,
            name,
            rows.len()
        );
        sheets.push(RawSheet::new(
            SheetOrigin::new(name, sheet_name, index, OriginKind::Sheet),
            rows,
        ));
    }

    Ok(sheets)
}
