use super::decode_text;
use crate::schema::{CellValue, OriginKind, RawSheet, SheetOrigin};

/// Plain text: one column, one row per line. Blank lines keep their row so cell
/// references match the source line numbers.
pub fn read(name: &str, bytes: &[u8]) -> Vec<RawSheet> {
    let content = decode_text(bytes);
    let rows = content
        .lines()
        .map(|line| vec![CellValue::text(line.trim_end_matches('\r'))])
        .collect();
    vec![RawSheet::new(
        SheetOrigin::new(name, "text", 0, OriginKind::Text),
        rows,
    )]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lines_become_rows() {
        let sheets = read("notes.txt", b"first\r\n\r\nthird\n");
        assert_eq!(sheets.len(), 1);
        let sheet = &sheets[0];
        assert_eq!(sheet.row_count(), 3);
        assert_eq!(sheet.col_count(), 1);
        assert!(sheet.cell(1, 0).is_blank());
        assert_eq!(sheet.cell(2, 0).display(), "third");
    }
}
