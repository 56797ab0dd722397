use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// A single scalar read from a source grid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum CellValue {
    Blank,
    Text(String),
    Number(f64),
    Date(NaiveDate),
}

impl CellValue {
    pub fn text(s: impl Into<String>) -> Self {
        let s = s.into();
        if s.trim().is_empty() {
            CellValue::Blank
        } else {
            CellValue::Text(s)
        }
    }

    pub fn is_blank(&self) -> bool {
        match self {
            CellValue::Blank => true,
            CellValue::Text(s) => s.trim().is_empty(),
            _ => false,
        }
    }

    /// Display form used for header matching, prompts and grounding checks.
    pub fn display(&self) -> String {
        match self {
            CellValue::Blank => String::new(),
            CellValue::Text(s) => s.trim().to_string(),
            CellValue::Number(n) => {
                if n.fract() == 0.0 && n.abs() < 1e15 {
                    format!("{}", *n as i64)
                } else {
                    format!("{}", n)
                }
            }
            CellValue::Date(d) => d.format("%Y-%m-%d").to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OriginKind {
    /// A worksheet of a spreadsheet or a delimited file.
    Sheet,
    /// A page of a PDF.
    Page,
    /// A table embedded in a word-processor document.
    Table,
    /// Free text split on line breaks.
    Text,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SheetOrigin {
    pub file_name: String,
    pub sheet_name: String,
    /// Zero-based sheet or page index within the file.
    pub index: usize,
    pub kind: OriginKind,
}

impl SheetOrigin {
    pub fn new(
        file_name: impl Into<String>,
        sheet_name: impl Into<String>,
        index: usize,
        kind: OriginKind,
    ) -> Self {
        Self {
            file_name: file_name.into(),
            sheet_name: sheet_name.into(),
            index,
            kind,
        }
    }

    pub fn label(&self) -> String {
        format!("{}:{}", self.file_name, self.sheet_name)
    }
}

/// Immutable 2-D grid produced by a reader.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawSheet {
    origin: SheetOrigin,
    rows: Vec<Vec<CellValue>>,
}

static BLANK: CellValue = CellValue::Blank;

impl RawSheet {
    pub fn new(origin: SheetOrigin, rows: Vec<Vec<CellValue>>) -> Self {
        Self { origin, rows }
    }

    pub fn origin(&self) -> &SheetOrigin {
        &self.origin
    }

    pub fn rows(&self) -> &[Vec<CellValue>] {
        &self.rows
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn col_count(&self) -> usize {
        self.rows.iter().map(|r| r.len()).max().unwrap_or(0)
    }

    pub fn cell(&self, row: usize, col: usize) -> &CellValue {
        self.rows
            .get(row)
            .and_then(|r| r.get(col))
            .unwrap_or(&BLANK)
    }

    pub fn is_empty(&self) -> bool {
        self.rows.iter().all(|r| r.iter().all(CellValue::is_blank))
    }

    pub fn cell_ref(&self, row: usize, col: usize) -> CellRef {
        CellRef {
            file: self.origin.file_name.clone(),
            sheet: self.origin.sheet_name.clone(),
            row,
            col,
        }
    }
}

/// Pointer from a value back to the originating cell.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CellRef {
    pub file: String,
    pub sheet: String,
    /// Zero-based row.
    pub row: usize,
    /// Zero-based column.
    pub col: usize,
}

impl fmt::Display for CellRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}!{}{}",
            self.file,
            self.sheet,
            column_letters(self.col),
            self.row + 1
        )
    }
}

pub fn column_letters(mut col: usize) -> String {
    let mut letters = Vec::new();
    loop {
        letters.push((b'A' + (col % 26) as u8) as char);
        if col < 26 {
            break;
        }
        col = col / 26 - 1;
    }
    letters.iter().rev().collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SheetKind {
    BudgetActual,
    ChangeOrder,
    VendorMap,
    CategoryMap,
    Procurement,
    Unrecognized,
}

impl SheetKind {
    /// Tie-break priority: lower wins.
    pub fn priority(self) -> u8 {
        match self {
            SheetKind::BudgetActual => 0,
            SheetKind::Procurement => 1,
            SheetKind::ChangeOrder => 2,
            SheetKind::VendorMap => 3,
            SheetKind::CategoryMap => 4,
            SheetKind::Unrecognized => 5,
        }
    }
}

impl fmt::Display for SheetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SheetKind::BudgetActual => "budget_actual",
            SheetKind::ChangeOrder => "change_order",
            SheetKind::VendorMap => "vendor_map",
            SheetKind::CategoryMap => "category_map",
            SheetKind::Procurement => "procurement",
            SheetKind::Unrecognized => "unrecognized",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VarianceItem {
    pub project: String,
    pub period: String,
    pub category: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_code: Option<String>,
    /// Budget including approved change orders.
    pub budget_sar: f64,
    pub actual_sar: f64,
    /// Portion of `budget_sar` contributed by change orders.
    #[serde(default)]
    pub change_order_sar: f64,
    pub variance_sar: f64,
    /// Percent of budget; `None` when the budget is zero.
    pub variance_pct: Option<f64>,
    #[serde(default)]
    pub material: bool,
    #[serde(default)]
    pub drivers: Vec<String>,
    #[serde(default)]
    pub vendors: Vec<String>,
    pub evidence_refs: BTreeSet<CellRef>,
    #[serde(default)]
    pub evidence_links: Vec<String>,
}

impl VarianceItem {
    pub fn new(
        project: impl Into<String>,
        period: impl Into<String>,
        category: impl Into<String>,
        budget_sar: f64,
        actual_sar: f64,
        evidence_refs: BTreeSet<CellRef>,
    ) -> Self {
        let (variance_sar, variance_pct) = compute_variance(budget_sar, actual_sar);
        Self {
            project: project.into(),
            period: period.into(),
            category: category.into(),
            cost_code: None,
            budget_sar,
            actual_sar,
            change_order_sar: 0.0,
            variance_sar,
            variance_pct,
            material: false,
            drivers: Vec::new(),
            vendors: Vec::new(),
            evidence_refs,
            evidence_links: Vec::new(),
        }
    }

    pub fn key(&self) -> VarianceKey {
        VarianceKey {
            project: self.project.clone(),
            period: self.period.clone(),
            category: self.category.clone(),
        }
    }
}

/// `variance = actual - budget`, `pct = variance / budget * 100`; zero budget yields `None`.
pub fn compute_variance(budget_sar: f64, actual_sar: f64) -> (f64, Option<f64>) {
    let variance = actual_sar - budget_sar;
    let pct = if budget_sar == 0.0 {
        None
    } else {
        let pct = variance / budget_sar * 100.0;
        pct.is_finite().then_some(pct)
    };
    (variance, pct)
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct VarianceKey {
    pub project: String,
    pub period: String,
    pub category: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcurementItem {
    pub item_code: Option<String>,
    pub description: String,
    pub vendor: Option<String>,
    pub qty: Option<f64>,
    pub unit: Option<String>,
    pub unit_price_sar: Option<f64>,
    pub amount_sar: Option<f64>,
    pub doc_date: Option<String>,
    pub evidence_refs: BTreeSet<CellRef>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeOrder {
    pub project: Option<String>,
    pub period: Option<String>,
    /// Issue date; when present it decides which period the order falls in.
    #[serde(default)]
    pub date: Option<NaiveDate>,
    /// Category label as written, if the sheet carries one.
    pub category: Option<String>,
    pub cost_code: Option<String>,
    pub co_id: Option<String>,
    pub amount_sar: Option<f64>,
    pub description: Option<String>,
    pub file_link: Option<String>,
    pub evidence_refs: BTreeSet<CellRef>,
}

impl ChangeOrder {
    /// Driver line used in narratives, e.g. `CO-014: Facade upgrade`.
    pub fn driver_line(&self) -> String {
        let id = self.co_id.clone().unwrap_or_else(|| "CO".to_string());
        match self.description.as_deref().filter(|d| !d.trim().is_empty()) {
            Some(desc) => format!("{}: {}", id, desc.trim()),
            None => format!("Change Order {}", id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VendorMapEntry {
    pub raw_name: String,
    pub canonical_vendor: String,
    #[serde(default)]
    pub project: Option<String>,
    #[serde(default)]
    pub cost_code: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryMapEntry {
    pub raw_label: String,
    pub canonical_category: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CanonicalLineItem {
    Variance(VarianceItem),
    Procurement(ProcurementItem),
    ChangeOrder(ChangeOrder),
    VendorMap(VendorMapEntry),
    CategoryMap(CategoryMapEntry),
}

impl CanonicalLineItem {
    /// Whether every numeric value on the item is backed by a cell reference.
    pub fn has_evidence(&self) -> bool {
        match self {
            CanonicalLineItem::Variance(v) => !v.evidence_refs.is_empty(),
            CanonicalLineItem::Procurement(p) => !p.evidence_refs.is_empty(),
            CanonicalLineItem::ChangeOrder(c) => {
                c.amount_sar.is_none() || !c.evidence_refs.is_empty()
            }
            CanonicalLineItem::VendorMap(_) | CanonicalLineItem::CategoryMap(_) => true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarningCode {
    UnparseableCell,
    UngroundedValueDiscarded,
    PartialExtraction,
    UnmappedLabel,
    LowConfidence,
    LlmFallback,
    MissingEvidence,
    SkippedTotalRow,
    TruncatedInput,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Warning {
    pub code: WarningCode,
    pub message: String,
    pub sheet_ref: Option<String>,
}

impl Warning {
    pub fn new(code: WarningCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            sheet_ref: None,
        }
    }

    pub fn at(mut self, sheet_ref: impl Into<String>) -> Self {
        self.sheet_ref = Some(sheet_ref.into());
        self
    }
}

/// Outcome of extracting one sheet. Corrections produce a new value rather than mutating this one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionResult {
    pub origin: SheetOrigin,
    pub kind: SheetKind,
    pub confidence: f64,
    pub header_row: Option<usize>,
    pub items: Vec<CanonicalLineItem>,
    pub warnings: Vec<Warning>,
    /// True when the items came from the LLM-assisted extractor.
    #[serde(default)]
    pub assisted: bool,
}

impl ExtractionResult {
    pub fn unrecognized(origin: SheetOrigin, warnings: Vec<Warning>) -> Self {
        Self {
            origin,
            kind: SheetKind::Unrecognized,
            confidence: 0.0,
            header_row: None,
            items: Vec::new(),
            warnings,
            assisted: false,
        }
    }

    pub fn variance_items(&self) -> impl Iterator<Item = &VarianceItem> {
        self.items.iter().filter_map(|i| match i {
            CanonicalLineItem::Variance(v) => Some(v),
            _ => None,
        })
    }

    pub fn procurement_items(&self) -> impl Iterator<Item = &ProcurementItem> {
        self.items.iter().filter_map(|i| match i {
            CanonicalLineItem::Procurement(p) => Some(p),
            _ => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_budget_has_no_pct() {
        let (variance, pct) = compute_variance(0.0, 500.0);
        assert_eq!(variance, 500.0);
        assert!(pct.is_none());

        let (variance, pct) = compute_variance(1000.0, 1100.0);
        assert_eq!(variance, 100.0);
        assert!((pct.unwrap() - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_cell_ref_display() {
        let r = CellRef {
            file: "budget.csv".into(),
            sheet: "Sheet1".into(),
            row: 4,
            col: 27,
        };
        assert_eq!(r.to_string(), "budget.csv:Sheet1!AB5");
        assert_eq!(column_letters(0), "A");
        assert_eq!(column_letters(25), "Z");
    }

    #[test]
    fn test_cell_display() {
        assert_eq!(CellValue::Number(1200.0).display(), "1200");
        assert_eq!(CellValue::Number(12.5).display(), "12.5");
        assert!(CellValue::text("   ").is_blank());
    }

    #[test]
    fn test_driver_line() {
        let co = ChangeOrder {
            project: Some("P1".into()),
            period: Some("2024-03".into()),
            date: None,
            category: None,
            cost_code: Some("100-200".into()),
            co_id: Some("CO-014".into()),
            amount_sar: Some(150_000.0),
            description: Some("Facade upgrade".into()),
            file_link: None,
            evidence_refs: BTreeSet::new(),
        };
        assert_eq!(co.driver_line(), "CO-014: Facade upgrade");
    }
}
