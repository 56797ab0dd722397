//! No-invention check for model output: every value must be found in the grid.

use crate::classifier::UNSPECIFIED;
use crate::llm::types::{AssistItem, AssistKind, AssistResponse};
use crate::schema::{
    CanonicalLineItem, CellRef, ChangeOrder, ProcurementItem, RawSheet, VarianceItem, Warning,
    WarningCode,
};
use crate::utils::{coerce_number, normalize_label, normalize_period, normalize_period_str, parse_amount, round2};
use regex::Regex;
use std::collections::BTreeSet;
use std::sync::LazyLock;

/// Largest difference at which a returned number still matches a cell.
const NUMBER_TOLERANCE: f64 = 0.005;

static NUMBER_TOKEN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\(?-?\d{1,3}(?:,\d{3})+(?:\.\d+)?\)?|\(?-?\d+(?:\.\d+)?\)?").expect("valid regex")
});

/// Dates written inside text (`12/03/2024`, `2024-03-12`, `03/2024`); their
/// digits are not amounts.
static DATE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"\b\d{1,4}-\d{1,2}-\d{1,4}\b|\b\d{1,4}/\d{1,2}/\d{1,4}\b|\b\d{1,2}\.\d{1,2}\.\d{2,4}\b|\b\d{4}[-/]\d{1,2}\b|\b\d{1,2}[-/]\d{4}\b",
    )
    .expect("valid regex")
});

fn close(a: f64, b: f64) -> bool {
    (a - b).abs() <= NUMBER_TOLERANCE
}

/// Whole-word match of `needle` inside `haystack`, both in `normalize_label` form.
fn contains_phrase(haystack: &str, needle: &str) -> bool {
    let words: Vec<&str> = needle.split(' ').collect();
    let hay: Vec<&str> = haystack.split(' ').collect();
    !needle.is_empty() && hay.windows(words.len()).any(|w| w == words.as_slice())
}

/// Searchable view of the cells of one sheet.
struct GridIndex<'a> {
    sheet: &'a RawSheet,
    numbers: Vec<(f64, usize, usize)>,
    texts: Vec<(String, usize, usize)>,
    periods: Vec<(String, usize, usize)>,
}

impl<'a> GridIndex<'a> {
    fn build(sheet: &'a RawSheet) -> Self {
        let mut numbers = Vec::new();
        let mut texts = Vec::new();
        let mut periods = Vec::new();

        for (r, row) in sheet.rows().iter().enumerate() {
            for (c, cell) in row.iter().enumerate() {
                if cell.is_blank() {
                    continue;
                }
                match coerce_number(cell) {
                    Some(n) => numbers.push((n, r, c)),
                    None => {
                        // Numbers embedded in text lines (PDF and plain-text pages).
                        let display = cell.display();
                        let dates: Vec<(usize, usize)> = DATE_RE
                            .find_iter(&display)
                            .map(|m| (m.start(), m.end()))
                            .collect();
                        for token in NUMBER_TOKEN_RE.find_iter(&display) {
                            if dates.iter().any(|(s, e)| token.start() < *e && *s < token.end()) {
                                continue;
                            }
                            if let Some(n) = parse_amount(token.as_str()) {
                                numbers.push((n, r, c));
                            }
                        }
                    }
                }
                if let Some(p) = normalize_period(cell) {
                    periods.push((p, r, c));
                }
                texts.push((normalize_label(&cell.display()), r, c));
            }
        }

        Self {
            sheet,
            numbers,
            texts,
            periods,
        }
    }

    /// Prefers a hit on the row the model cited, then any row.
    fn pick<T>(
        &self,
        entries: &[(T, usize, usize)],
        row_hint: Option<usize>,
        matches: impl Fn(&T) -> bool,
    ) -> Option<CellRef> {
        let hits: Vec<&(T, usize, usize)> = entries.iter().filter(|(v, _, _)| matches(v)).collect();
        hits.iter()
            .find(|(_, r, _)| Some(*r) == row_hint)
            .or_else(|| hits.first())
            .map(|(_, r, c)| self.sheet.cell_ref(*r, *c))
    }

    /// Numbers only match on the given row.
    fn number(&self, value: f64, row: usize) -> Option<CellRef> {
        self.numbers
            .iter()
            .find(|(n, r, _)| *r == row && close(*n, value))
            .map(|(_, r, c)| self.sheet.cell_ref(*r, *c))
    }

    /// Row holding the most of `values`; ties go to the earliest row.
    fn best_number_row(&self, values: &[f64]) -> Option<usize> {
        let rows: BTreeSet<usize> = self.numbers.iter().map(|(_, r, _)| *r).collect();
        let mut best: Option<(usize, usize)> = None;
        for row in rows {
            let hits = values.iter().filter(|v| self.number(**v, row).is_some()).count();
            if hits > 0 && best.map_or(true, |(_, most)| hits > most) {
                best = Some((row, hits));
            }
        }
        best.map(|(row, _)| row)
    }

    fn text(&self, value: &str, row_hint: Option<usize>) -> Option<CellRef> {
        let needle = normalize_label(value);
        if needle.is_empty() {
            return None;
        }
        self.pick(&self.texts, row_hint, |t| contains_phrase(t, &needle))
    }

    fn period(&self, value: &str, row_hint: Option<usize>) -> Option<CellRef> {
        let Some(wanted) = normalize_period_str(value) else {
            return self.text(value, row_hint);
        };
        if let Some(found) = self.pick(&self.periods, row_hint, |p| *p == wanted) {
            return Some(found);
        }
        let needles = period_spellings(&wanted);
        self.pick(&self.texts, row_hint, |t| {
            needles.iter().any(|n| contains_phrase(t, n))
        })
    }
}

const MONTHS: [&str; 12] = [
    "january", "february", "march", "april", "may", "june", "july", "august", "september",
    "october", "november", "december",
];

/// Ways a `YYYY-MM` period is commonly written inside a line of text, in
/// `normalize_label` form.
fn period_spellings(period: &str) -> Vec<String> {
    let Some((year, month)) = period.split_once('-') else {
        return Vec::new();
    };
    let mut spellings = vec![format!("{} {}", year, month), format!("{} {}", month, year)];
    if let Some(name) = month
        .parse::<usize>()
        .ok()
        .and_then(|m| m.checked_sub(1))
        .and_then(|i| MONTHS.get(i))
    {
        spellings.push(format!("{} {}", name, year));
        spellings.push(format!("{} {}", &name[..3], year));
        spellings.push(format!("{} {}", year, name));
    }
    spellings
}

/// Collects discards for one record so the caller gets one warning per value.
struct Checker<'a, 'b> {
    index: &'b GridIndex<'a>,
    row_hint: Option<usize>,
    /// Row every number of the record must come from.
    number_row: Option<usize>,
    row_label: String,
    evidence: BTreeSet<CellRef>,
    warnings: Vec<Warning>,
}

impl<'a, 'b> Checker<'a, 'b> {
    fn new(index: &'b GridIndex<'a>, item: &AssistItem, position: usize) -> Self {
        let row_hint = item.row.and_then(|r| r.checked_sub(1));
        let row_label = match item.row {
            Some(r) => format!("row {}", r),
            None => format!("record {}", position + 1),
        };
        Self {
            index,
            row_hint,
            number_row: row_hint,
            row_label,
            evidence: BTreeSet::new(),
            warnings: Vec::new(),
        }
    }

    fn discard(&mut self, field: &str, value: String) {
        self.warnings.push(
            Warning::new(
                WarningCode::UngroundedValueDiscarded,
                format!(
                    "{} '{}' on {} was not found in the source and was discarded",
                    field, value, self.row_label
                ),
            )
            .at(self.index.sheet.origin().label()),
        );
    }

    /// Without a cited row, pins the numbers to the row holding most of them.
    fn anchor(&mut self, values: &[Option<f64>]) {
        if self.number_row.is_none() {
            let present: Vec<f64> = values.iter().flatten().copied().collect();
            self.number_row = self.index.best_number_row(&present);
        }
    }

    fn number(&mut self, field: &str, value: Option<f64>) -> Option<f64> {
        let value = value?;
        match self
            .number_row
            .and_then(|row| self.index.number(value, row))
        {
            Some(cell_ref) => {
                self.evidence.insert(cell_ref);
                Some(value)
            }
            None => {
                self.discard(field, value.to_string());
                None
            }
        }
    }

    fn text(&mut self, field: &str, value: Option<&String>) -> Option<String> {
        let value = value.map(|v| v.trim()).filter(|v| !v.is_empty())?;
        if self.index.text(value, self.row_hint).is_some() {
            Some(value.to_string())
        } else {
            self.discard(field, value.to_string());
            None
        }
    }

    fn period(&mut self, value: Option<&String>) -> Option<String> {
        let value = value.map(|v| v.trim()).filter(|v| !v.is_empty())?;
        if self.index.period(value, self.row_hint).is_some() {
            Some(normalize_period_str(value).unwrap_or_else(|| value.to_string()))
        } else {
            self.discard("period", value.to_string());
            None
        }
    }

    fn drop_record(&mut self, reason: &str) {
        self.warnings.push(
            Warning::new(
                WarningCode::MissingEvidence,
                format!("{} dropped: {}", self.row_label, reason),
            )
            .at(self.index.sheet.origin().label()),
        );
    }
}

/// Keeps only values that trace to a cell of `sheet`; records whose required
/// numbers cannot be traced are dropped. The numbers of one record must sit on
/// one row, the cited one when given. Pure: no I/O, no model access.
pub fn verify_grounding(
    sheet: &RawSheet,
    response: AssistResponse,
) -> (Vec<CanonicalLineItem>, Vec<Warning>) {
    let index = GridIndex::build(sheet);
    let mut items = Vec::new();
    let mut warnings = Vec::new();

    for (position, item) in response.items.iter().enumerate() {
        let mut check = Checker::new(&index, item, position);
        let lifted = match response.kind {
            AssistKind::BudgetActual => ground_variance(&mut check, item),
            AssistKind::Procurement => ground_procurement(&mut check, item),
            AssistKind::ChangeOrder => ground_change_order(&mut check, item),
            AssistKind::Unrecognized => None,
        };
        warnings.append(&mut check.warnings);
        items.extend(lifted);
    }

    (items, warnings)
}

fn ground_variance(check: &mut Checker, item: &AssistItem) -> Option<CanonicalLineItem> {
    check.anchor(&[item.budget_sar, item.actual_sar]);
    let budget = check.number("budget_sar", item.budget_sar);
    let actual = check.number("actual_sar", item.actual_sar);
    let (Some(budget), Some(actual)) = (budget, actual) else {
        check.drop_record("budget and actual must both be present in the source");
        return None;
    };

    let mut variance = VarianceItem::new(
        check
            .text("project", item.project.as_ref())
            .unwrap_or_else(|| UNSPECIFIED.to_string()),
        check
            .period(item.period.as_ref())
            .unwrap_or_else(|| UNSPECIFIED.to_string()),
        check.text("category", item.category.as_ref()).unwrap_or_default(),
        budget,
        actual,
        std::mem::take(&mut check.evidence),
    );
    variance.cost_code = check.text("cost_code", item.cost_code.as_ref());
    Some(CanonicalLineItem::Variance(variance))
}

fn ground_procurement(check: &mut Checker, item: &AssistItem) -> Option<CanonicalLineItem> {
    check.anchor(&[item.qty, item.unit_price_sar, item.amount_sar]);
    let qty = check.number("qty", item.qty);
    let unit_price = check.number("unit_price_sar", item.unit_price_sar);
    let amount = check.number("amount_sar", item.amount_sar);
    if unit_price.is_none() && amount.is_none() {
        check.drop_record("no unit price or amount found in the source");
        return None;
    }

    let amount_sar = amount.or_else(|| match (qty, unit_price) {
        (Some(q), Some(u)) => Some(round2(q * u)),
        _ => None,
    });
    let item_code = check.text("item_code", item.item_code.as_ref());
    let description = check
        .text("description", item.description.as_ref())
        .or_else(|| item_code.clone())
        .unwrap_or_default();

    Some(CanonicalLineItem::Procurement(ProcurementItem {
        item_code,
        description,
        vendor: check.text("vendor", item.vendor.as_ref()),
        qty,
        unit: check.text("unit", item.unit.as_ref()),
        unit_price_sar: unit_price,
        amount_sar,
        doc_date: check.text("doc_date", item.doc_date.as_ref()),
        evidence_refs: std::mem::take(&mut check.evidence),
    }))
}

fn ground_change_order(check: &mut Checker, item: &AssistItem) -> Option<CanonicalLineItem> {
    check.anchor(&[item.amount_sar]);
    let Some(amount) = check.number("amount_sar", item.amount_sar) else {
        check.drop_record("change order amount not found in the source");
        return None;
    };
    Some(CanonicalLineItem::ChangeOrder(ChangeOrder {
        project: check.text("project", item.project.as_ref()),
        period: check.period(item.period.as_ref()),
        date: None,
        category: check.text("category", item.category.as_ref()),
        cost_code: check.text("cost_code", item.cost_code.as_ref()),
        co_id: check.text("co_id", item.co_id.as_ref()),
        amount_sar: Some(amount),
        description: check.text("description", item.description.as_ref()),
        file_link: None,
        evidence_refs: std::mem::take(&mut check.evidence),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{CellValue, OriginKind, SheetOrigin};

    fn sheet() -> RawSheet {
        RawSheet::new(
            SheetOrigin::new("report.pdf", "page 1", 0, OriginKind::Page),
            vec![
                vec![CellValue::text("Project Tower A - March 2024")],
                vec![CellValue::text("Concrete works budget 1,000,000 actual 1,150,000")],
                vec![CellValue::text("D01 Fire door QTY 10 Unit Price 1,200.00")],
            ],
        )
    }

    #[test]
    fn test_grounded_variance_is_kept_with_evidence() {
        let response = AssistResponse {
            kind: AssistKind::BudgetActual,
            items: vec![AssistItem {
                row: Some(2),
                project: Some("Tower A".into()),
                period: Some("2024-03".into()),
                category: Some("Concrete works".into()),
                budget_sar: Some(1_000_000.0),
                actual_sar: Some(1_150_000.0),
                ..AssistItem::default()
            }],
        };
        let (items, warnings) = verify_grounding(&sheet(), response);
        assert!(warnings.is_empty(), "{:?}", warnings);
        match &items[0] {
            CanonicalLineItem::Variance(v) => {
                assert_eq!(v.variance_sar, 150_000.0);
                assert_eq!(v.period, "2024-03");
                assert_eq!(v.project, "Tower A");
                assert!(v.evidence_refs.iter().all(|r| r.row == 1));
            }
            other => panic!("unexpected item {:?}", other),
        }
    }

    #[test]
    fn test_invented_numbers_are_discarded() {
        let response = AssistResponse {
            kind: AssistKind::BudgetActual,
            items: vec![AssistItem {
                row: Some(2),
                category: Some("Steel".into()),
                budget_sar: Some(1_000_000.0),
                actual_sar: Some(1_300_000.0),
                ..AssistItem::default()
            }],
        };
        let (items, warnings) = verify_grounding(&sheet(), response);
        assert!(items.is_empty());
        let codes: Vec<_> = warnings.iter().map(|w| w.code).collect();
        assert!(codes.contains(&WarningCode::UngroundedValueDiscarded));
        assert!(codes.contains(&WarningCode::MissingEvidence));
    }

    #[test]
    fn test_procurement_text_fields_are_filtered() {
        let response = AssistResponse {
            kind: AssistKind::Procurement,
            items: vec![AssistItem {
                row: Some(3),
                item_code: Some("D01".into()),
                vendor: Some("Imaginary Doors LLC".into()),
                qty: Some(10.0),
                unit_price_sar: Some(1200.0),
                ..AssistItem::default()
            }],
        };
        let (items, warnings) = verify_grounding(&sheet(), response);
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].code, WarningCode::UngroundedValueDiscarded);
        match &items[0] {
            CanonicalLineItem::Procurement(p) => {
                assert_eq!(p.vendor, None);
                assert_eq!(p.amount_sar, Some(12_000.0));
                assert_eq!(p.description, "D01");
                assert!(!p.evidence_refs.is_empty());
            }
            other => panic!("unexpected item {:?}", other),
        }
    }

    fn variance_claim(row: Option<usize>, budget: f64, actual: f64) -> AssistResponse {
        AssistResponse {
            kind: AssistKind::BudgetActual,
            items: vec![AssistItem {
                row,
                category: Some("Concrete works".into()),
                budget_sar: Some(budget),
                actual_sar: Some(actual),
                ..AssistItem::default()
            }],
        }
    }

    #[test]
    fn test_numbers_from_another_row_are_rejected() {
        let memo = RawSheet::new(
            SheetOrigin::new("memo.txt", "text", 0, OriginKind::Page),
            vec![
                vec![CellValue::text("Civil budget 100 actual 120")],
                vec![CellValue::text("Concrete works")],
            ],
        );
        let (items, warnings) = verify_grounding(&memo, variance_claim(Some(2), 100.0, 120.0));
        assert!(items.is_empty());
        assert_eq!(warnings.last().map(|w| w.code), Some(WarningCode::MissingEvidence));
    }

    #[test]
    fn test_date_digits_are_not_amounts() {
        let memo = RawSheet::new(
            SheetOrigin::new("memo.txt", "text", 0, OriginKind::Page),
            vec![
                vec![CellValue::text("Issued 12/03/2024 by site office")],
                vec![CellValue::text("Concrete works")],
            ],
        );
        for row in [Some(1), Some(2), None] {
            let (items, _) = verify_grounding(&memo, variance_claim(row, 12.0, 2024.0));
            assert!(items.is_empty(), "row {:?} lifted {:?}", row, items);
        }
    }

    #[test]
    fn test_uncited_numbers_must_share_a_row() {
        let memo = RawSheet::new(
            SheetOrigin::new("memo.txt", "text", 0, OriginKind::Page),
            vec![
                vec![CellValue::text("Concrete works budget 100 actual 120")],
                vec![CellValue::text("Concrete works budget 300 actual 90")],
            ],
        );
        let (mixed, _) = verify_grounding(&memo, variance_claim(None, 100.0, 90.0));
        assert!(mixed.is_empty());

        let (items, warnings) = verify_grounding(&memo, variance_claim(None, 300.0, 90.0));
        assert!(warnings.is_empty(), "{:?}", warnings);
        match &items[0] {
            CanonicalLineItem::Variance(v) => {
                assert_eq!(v.variance_sar, -210.0);
                assert!(v.evidence_refs.iter().all(|r| r.row == 1));
            }
            other => panic!("unexpected item {:?}", other),
        }
    }

    #[test]
    fn test_text_must_match_whole_words() {
        let response = AssistResponse {
            kind: AssistKind::BudgetActual,
            items: vec![AssistItem {
                row: Some(2),
                project: Some("Tow".into()),
                category: Some("c".into()),
                budget_sar: Some(1_000_000.0),
                actual_sar: Some(1_150_000.0),
                ..AssistItem::default()
            }],
        };
        let (items, warnings) = verify_grounding(&sheet(), response);
        match &items[0] {
            CanonicalLineItem::Variance(v) => {
                assert_eq!(v.category, "");
                assert_eq!(v.project, UNSPECIFIED);
            }
            other => panic!("unexpected item {:?}", other),
        }
        assert_eq!(warnings.len(), 2);
        assert!(warnings.iter().all(|w| w.code == WarningCode::UngroundedValueDiscarded));
    }
}
