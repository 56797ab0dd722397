//! Deterministic extractor: header-driven sheet classification and row lifting.

use crate::config::PipelineConfig;
use crate::schema::{
    CanonicalLineItem, CategoryMapEntry, CellRef, CellValue, ChangeOrder, ExtractionResult,
    ProcurementItem, RawSheet, SheetKind, VarianceItem, VendorMapEntry, Warning, WarningCode,
};
use crate::utils::{
    coerce_date, coerce_number, is_total_label, normalize_period, parse_amount, parse_date,
    round2,
};
use crate::vocabulary::{match_header, vocabulary_for, Field, Vocabulary, VOCABULARIES};
use log::debug;
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::LazyLock;

/// Placeholder for identity fields a sheet does not carry.
pub const UNSPECIFIED: &str = "Unspecified";

/// Confidence assigned to procurement lines recovered by the free-text scan.
const TEXT_SCAN_CONFIDENCE: f64 = 0.6;

static SPLIT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\t|\s*\|\s*|\s{2,}").expect("valid regex"));

const NUM: &str = r"(\d{1,3}(?:[, ]\d{3})+(?:\.\d+)?|\d+(?:\.\d+)?)";

static ITEM_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(D0?\d{1,2}|Item\s*No\.?\s*:?\s*\d+)\b").expect("valid regex")
});
static QTY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:QTY|Quantity)\s*[:=]?\s*(\d+(?:\.\d+)?)|\b(\d{1,4})\s*(?:pcs|sets?|nos)\b")
        .expect("valid regex")
});
static PRICE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(
        r"(?i)\b(?:Unit\s*Price|U\.?\s*Rate|Unit\s*Rate)\s*(?:in\s*SAR)?\s*[:=]?\s*(?:SAR\s*)?{}",
        NUM
    ))
    .expect("valid regex")
});
static TOTAL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(
        r"(?i)\b(?:Grand\s*Total|TOTAL|Amount)\s*(?:in\s*SAR)?\s*[:=]?\s*(?:SAR\s*)?{}",
        NUM
    ))
    .expect("valid regex")
});
static DATE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bDate\s*[:\-]?\s*(\d{1,2}/\d{1,2}/\d{4}|\d{4}-\d{2}-\d{2}|\d{1,2}-\d{1,2}-\d{4})")
        .expect("valid regex")
});
static VENDOR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*(?:Vendor|Supplier|From|Company|Bidder)\s*(?:name)?\s*[:\-]\s*(.+?)\s*$")
        .expect("valid regex")
});

/// A located header: which rows hold it and which column carries each field.
#[derive(Debug, Clone, PartialEq)]
pub struct HeaderMatch {
    pub kind: SheetKind,
    pub row: usize,
    /// 1 for a single header row, 2 for a merged two-row header.
    pub span: usize,
    pub columns: BTreeMap<Field, usize>,
    pub score: f64,
}

fn header_labels(sheet: &RawSheet, row: usize, span: usize) -> (Vec<Option<Field>>, usize) {
    let mut carried = String::new();
    let mut non_blank = 0;
    let labels = (0..sheet.col_count())
        .map(|col| {
            let top = sheet.cell(row, col).display();
            if span == 1 {
                if !top.is_empty() {
                    non_blank += 1;
                }
                return match_header(&top);
            }
            let bottom = sheet.cell(row + 1, col).display();
            if !top.is_empty() {
                carried = top.clone();
            }
            if top.is_empty() && bottom.is_empty() {
                return None;
            }
            non_blank += 1;
            if bottom.is_empty() {
                return match_header(&top);
            }
            match_header(&format!("{} {}", carried, bottom)).or_else(|| match_header(&bottom))
        })
        .collect();
    (labels, non_blank)
}

/// Scans the first `header_scan_rows` rows for the best header candidate.
///
/// Highest recognised fraction wins; equal fractions go to the vocabulary listed
/// first (budget/actual), then to a single-row header, then to the earliest row.
pub fn locate_header(
    sheet: &RawSheet,
    config: &PipelineConfig,
    only: Option<SheetKind>,
) -> Option<HeaderMatch> {
    let scan = config.header_scan_rows.min(sheet.row_count());
    let vocabularies: Vec<&Vocabulary> = match only {
        Some(kind) => vocabulary_for(kind).into_iter().collect(),
        None => VOCABULARIES.iter().collect(),
    };
    let mut best: Option<HeaderMatch> = None;

    for row in 0..scan {
        for span in [1usize, 2] {
            if span == 2 && row + 1 >= sheet.row_count() {
                continue;
            }
            let (labels, non_blank) = header_labels(sheet, row, span);
            if non_blank < 2 {
                continue;
            }

            for vocab in vocabularies.iter().copied() {
                let accepted: Vec<(usize, Field)> = labels
                    .iter()
                    .enumerate()
                    .filter_map(|(col, l)| l.filter(|f| vocab.accepts(*f)).map(|f| (col, f)))
                    .collect();
                let fields: Vec<Field> = accepted.iter().map(|(_, f)| *f).collect();
                if !vocab.satisfied_by(&fields) {
                    continue;
                }

                let score = accepted.len() as f64 / non_blank as f64;
                let better = match &best {
                    None => true,
                    Some(b) => {
                        let tie = (score - b.score).abs() <= 1e-9;
                        score > b.score + 1e-9
                            || (tie && vocab.kind.priority() < b.kind.priority())
                            || (tie && vocab.kind == b.kind && span < b.span)
                    }
                };
                if better {
                    let mut columns = BTreeMap::new();
                    for (col, field) in accepted {
                        columns.entry(field).or_insert(col);
                    }
                    best = Some(HeaderMatch {
                        kind: vocab.kind,
                        row,
                        span,
                        columns,
                        score,
                    });
                }
            }
        }
    }

    best
}

/// Classifies a sheet and lifts its rows into canonical items.
pub fn classify(sheet: &RawSheet, config: &PipelineConfig) -> ExtractionResult {
    extract(sheet, config, None)
}

/// Extracts a sheet whose role is already known (structured track).
pub fn extract_as(sheet: &RawSheet, kind: SheetKind, config: &PipelineConfig) -> ExtractionResult {
    extract(sheet, config, Some(kind))
}

fn extract(sheet: &RawSheet, config: &PipelineConfig, only: Option<SheetKind>) -> ExtractionResult {
    let label = sheet.origin().label();
    if sheet.is_empty() {
        debug!("Sheet {} is empty", label);
        return ExtractionResult::unrecognized(sheet.origin().clone(), Vec::new());
    }

    if let Some(header) = locate_header(sheet, config, only) {
        return from_header(sheet, header, config);
    }

    if sheet.col_count() <= 1 {
        if let Some(grid) = regrid(sheet) {
            if let Some(header) = locate_header(&grid, config, only) {
                let mut result = from_header(&grid, header, config);
                collapse_to_lines(&mut result.items);
                return result;
            }
        }
        if only.map_or(true, |k| k == SheetKind::Procurement) {
            let items = scan_procurement_lines(sheet);
            if !items.is_empty() {
                debug!("Text scan of {} found {} line item(s)", label, items.len());
                let mut warnings = Vec::new();
                if TEXT_SCAN_CONFIDENCE < config.low_confidence_threshold {
                    warnings.push(low_confidence(&label, TEXT_SCAN_CONFIDENCE));
                }
                return ExtractionResult {
                    origin: sheet.origin().clone(),
                    kind: SheetKind::Procurement,
                    confidence: TEXT_SCAN_CONFIDENCE,
                    header_row: None,
                    items: items.into_iter().map(CanonicalLineItem::Procurement).collect(),
                    warnings,
                    assisted: false,
                };
            }
        }
    }

    debug!("No header row found in the first {} rows of {}", config.header_scan_rows, label);
    ExtractionResult::unrecognized(sheet.origin().clone(), Vec::new())
}

fn low_confidence(label: &str, confidence: f64) -> Warning {
    Warning::new(
        WarningCode::LowConfidence,
        format!("Classification confidence {:.2} is below threshold", confidence),
    )
    .at(label)
}

fn from_header(sheet: &RawSheet, header: HeaderMatch, config: &PipelineConfig) -> ExtractionResult {
    let label = sheet.origin().label();
    debug!(
        "Sheet {} classified as {} (header row {}, score {:.2})",
        label,
        header.kind,
        header.row + 1,
        header.score
    );

    let (items, mut warnings) = lift_rows(sheet, &header);
    if header.score < config.low_confidence_threshold {
        warnings.push(low_confidence(&label, header.score));
    }

    ExtractionResult {
        origin: sheet.origin().clone(),
        kind: header.kind,
        confidence: header.score,
        header_row: Some(header.row),
        items,
        warnings,
        assisted: false,
    }
}

struct RowCtx<'a> {
    sheet: &'a RawSheet,
    row: usize,
    columns: &'a BTreeMap<Field, usize>,
}

impl<'a> RowCtx<'a> {
    fn cell(&self, field: Field) -> Option<(&'a CellValue, usize)> {
        let col = *self.columns.get(&field)?;
        let cell = self.sheet.cell(self.row, col);
        (!cell.is_blank()).then_some((cell, col))
    }

    fn text(&self, field: Field) -> Option<String> {
        self.cell(field).map(|(c, _)| c.display())
    }

    /// `Ok(None)` for a missing column or blank cell; `Err` when the cell holds
    /// something that is not a number.
    fn number(&self, field: Field) -> Result<Option<(f64, CellRef)>, Warning> {
        let Some((cell, col)) = self.cell(field) else {
            return Ok(None);
        };
        let cell_ref = self.sheet.cell_ref(self.row, col);
        match coerce_number(cell) {
            Some(value) => Ok(Some((value, cell_ref))),
            None => Err(Warning::new(
                WarningCode::UnparseableCell,
                format!(
                    "Cannot read '{}' as a number for {:?}; row {} dropped",
                    cell.display(),
                    field,
                    self.row + 1
                ),
            )
            .at(cell_ref.to_string())),
        }
    }

    fn required_number(&self, field: Field) -> Result<(f64, CellRef), Warning> {
        match self.number(field)? {
            Some(found) => Ok(found),
            None => {
                let at = self
                    .columns
                    .get(&field)
                    .map(|col| self.sheet.cell_ref(self.row, *col).to_string())
                    .unwrap_or_else(|| self.sheet.origin().label());
                Err(Warning::new(
                    WarningCode::UnparseableCell,
                    format!("Blank {:?} value; row {} dropped", field, self.row + 1),
                )
                .at(at))
            }
        }
    }

    fn period(&self) -> Option<String> {
        if let Some((cell, _)) = self.cell(Field::Period) {
            return normalize_period(cell).or_else(|| Some(cell.display()));
        }
        self.cell(Field::Date).and_then(|(c, _)| normalize_period(c))
    }
}

type Lifted = Result<Option<CanonicalLineItem>, Warning>;

fn lift_rows(sheet: &RawSheet, header: &HeaderMatch) -> (Vec<CanonicalLineItem>, Vec<Warning>) {
    let mut items = Vec::new();
    let mut warnings = Vec::new();

    for (row, cells) in sheet.rows().iter().enumerate().skip(header.row + header.span) {
        if cells.iter().all(CellValue::is_blank) {
            continue;
        }
        if is_total_row(cells) {
            warnings.push(
                Warning::new(
                    WarningCode::SkippedTotalRow,
                    format!("Row {} is a total line and was not lifted", row + 1),
                )
                .at(sheet.cell_ref(row, 0).to_string()),
            );
            continue;
        }
        if is_repeated_header(cells) {
            continue;
        }

        let ctx = RowCtx {
            sheet,
            row,
            columns: &header.columns,
        };
        let lifted = match header.kind {
            SheetKind::BudgetActual => lift_budget_actual(&ctx),
            SheetKind::ChangeOrder => lift_change_order(&ctx),
            SheetKind::VendorMap => lift_vendor_map(&ctx),
            SheetKind::CategoryMap => lift_category_map(&ctx),
            SheetKind::Procurement => lift_procurement(&ctx),
            SheetKind::Unrecognized => Ok(None),
        };
        match lifted {
            Ok(Some(item)) => items.push(item),
            Ok(None) => {}
            Err(warning) => warnings.push(warning),
        }
    }

    (items, warnings)
}

fn is_total_row(cells: &[CellValue]) -> bool {
    cells
        .iter()
        .filter(|c| !c.is_blank())
        .take(2)
        .any(|c| matches!(c, CellValue::Text(s) if is_total_label(s)))
}

fn is_repeated_header(cells: &[CellValue]) -> bool {
    let texts: Vec<&CellValue> = cells.iter().filter(|c| !c.is_blank()).collect();
    let matched = texts
        .iter()
        .filter(|c| matches!(c, CellValue::Text(s) if match_header(s).is_some()))
        .count();
    matched >= 2 && matched * 2 >= texts.len()
}

fn lift_budget_actual(ctx: &RowCtx) -> Lifted {
    let (budget, budget_ref) = ctx.required_number(Field::Budget)?;
    let (actual, actual_ref) = ctx.required_number(Field::Actual)?;

    let mut item = VarianceItem::new(
        ctx.text(Field::Project).unwrap_or_else(|| UNSPECIFIED.to_string()),
        ctx.period().unwrap_or_else(|| UNSPECIFIED.to_string()),
        ctx.text(Field::Category).unwrap_or_default(),
        budget,
        actual,
        BTreeSet::from([budget_ref, actual_ref]),
    );
    item.cost_code = ctx.text(Field::CostCode);
    Ok(Some(CanonicalLineItem::Variance(item)))
}

fn lift_change_order(ctx: &RowCtx) -> Lifted {
    let amount = ctx.number(Field::Amount)?;
    let co_id = ctx.text(Field::CoId);
    let description = ctx.text(Field::Description);
    if amount.is_none() && co_id.is_none() && description.is_none() {
        return Ok(None);
    }

    let (amount_sar, evidence_refs) = match amount {
        Some((value, cell_ref)) => (Some(value), BTreeSet::from([cell_ref])),
        None => (None, BTreeSet::new()),
    };

    Ok(Some(CanonicalLineItem::ChangeOrder(ChangeOrder {
        project: ctx.text(Field::Project),
        period: ctx.period(),
        date: ctx.cell(Field::Date).and_then(|(c, _)| coerce_date(c)),
        category: ctx.text(Field::Category),
        cost_code: ctx
            .text(Field::LinkedCostCode)
            .or_else(|| ctx.text(Field::CostCode)),
        co_id,
        amount_sar,
        description,
        file_link: ctx.text(Field::FileLink),
        evidence_refs,
    })))
}

fn lift_vendor_map(ctx: &RowCtx) -> Lifted {
    let Some(vendor) = ctx.text(Field::Vendor) else {
        return Ok(None);
    };
    let raw_name = ctx.text(Field::VendorAlias).unwrap_or_else(|| vendor.clone());
    let canonical_vendor = ctx.text(Field::CanonicalVendor).unwrap_or(vendor);

    Ok(Some(CanonicalLineItem::VendorMap(VendorMapEntry {
        raw_name,
        canonical_vendor,
        project: ctx.text(Field::Project),
        cost_code: ctx.text(Field::CostCode),
    })))
}

fn lift_category_map(ctx: &RowCtx) -> Lifted {
    let raw = ctx.text(Field::RawLabel).or_else(|| ctx.text(Field::CostCode));
    let canonical = ctx
        .text(Field::CanonicalCategory)
        .or_else(|| ctx.text(Field::Category));
    match (raw, canonical) {
        (Some(raw_label), Some(canonical_category)) => {
            Ok(Some(CanonicalLineItem::CategoryMap(CategoryMapEntry {
                raw_label,
                canonical_category,
            })))
        }
        _ => Ok(None),
    }
}

fn lift_procurement(ctx: &RowCtx) -> Lifted {
    let qty = ctx.number(Field::Qty)?;
    let unit_price = ctx.number(Field::UnitPrice)?;
    let amount = ctx.number(Field::Amount)?;
    if unit_price.is_none() && amount.is_none() {
        return Ok(None);
    }

    let mut evidence_refs = BTreeSet::new();
    for (_, cell_ref) in [&qty, &unit_price, &amount].into_iter().flatten() {
        evidence_refs.insert(cell_ref.clone());
    }

    let amount_sar = match (&amount, &qty, &unit_price) {
        (Some((a, _)), _, _) => Some(*a),
        (None, Some((q, _)), Some((u, _))) => Some(round2(q * u)),
        _ => None,
    };

    let item_code = ctx.text(Field::ItemCode);
    let doc_date = ctx.cell(Field::Date).map(|(c, _)| {
        coerce_date(c)
            .map(|d| d.format("%Y-%m-%d").to_string())
            .unwrap_or_else(|| c.display())
    });

    Ok(Some(CanonicalLineItem::Procurement(ProcurementItem {
        description: ctx
            .text(Field::Description)
            .or_else(|| item_code.clone())
            .unwrap_or_default(),
        item_code,
        vendor: ctx.text(Field::Vendor),
        qty: qty.map(|(q, _)| q),
        unit: ctx.text(Field::Unit),
        unit_price_sar: unit_price.map(|(u, _)| u),
        amount_sar,
        doc_date,
        evidence_refs,
    })))
}

/// Splits one-column text on tabs, pipes or runs of spaces. `None` unless at least
/// two lines produce more than one field.
pub fn regrid(sheet: &RawSheet) -> Option<RawSheet> {
    let rows: Vec<Vec<CellValue>> = sheet
        .rows()
        .iter()
        .enumerate()
        .map(|(row, _)| {
            let line = sheet.cell(row, 0).display();
            SPLIT_RE
                .split(line.trim().trim_matches('|'))
                .map(|part| CellValue::text(part.trim()))
                .collect()
        })
        .collect();

    let multi = rows.iter().filter(|r| r.len() > 1).count();
    (multi >= 2).then(|| RawSheet::new(sheet.origin().clone(), rows))
}

/// Points evidence lifted from a re-gridded sheet back at the source line.
fn collapse_to_lines(items: &mut [CanonicalLineItem]) {
    let collapse = |refs: &mut BTreeSet<CellRef>| {
        *refs = refs
            .iter()
            .map(|r| CellRef {
                col: 0,
                ..r.clone()
            })
            .collect();
    };
    for item in items {
        match item {
            CanonicalLineItem::Variance(v) => collapse(&mut v.evidence_refs),
            CanonicalLineItem::Procurement(p) => collapse(&mut p.evidence_refs),
            CanonicalLineItem::ChangeOrder(c) => collapse(&mut c.evidence_refs),
            CanonicalLineItem::VendorMap(_) | CanonicalLineItem::CategoryMap(_) => {}
        }
    }
}

fn capture_amount(re: &Regex, line: &str) -> Option<f64> {
    re.captures(line)
        .and_then(|c| c.iter().skip(1).flatten().next().map(|m| m.as_str().to_string()))
        .and_then(|s| parse_amount(&s.replace(' ', "")))
}

/// Line-by-line scan of free text for quotation items (item code plus price or total).
/// Vendor and date come from labelled lines only.
pub fn scan_procurement_lines(sheet: &RawSheet) -> Vec<ProcurementItem> {
    let mut vendor: Option<String> = None;
    let mut doc_date: Option<String> = None;
    let mut items = Vec::new();

    for row in 0..sheet.row_count() {
        let line = sheet.cell(row, 0).display();
        if line.is_empty() {
            continue;
        }
        if vendor.is_none() {
            vendor = VENDOR_RE
                .captures(&line)
                .map(|c| c[1].to_string())
                .filter(|v| !v.is_empty());
        }
        if doc_date.is_none() {
            doc_date = DATE_RE.captures(&line).map(|c| {
                parse_date(&c[1])
                    .map(|d| d.format("%Y-%m-%d").to_string())
                    .unwrap_or_else(|| c[1].to_string())
            });
        }

        let Some(code) = ITEM_RE.captures(&line).map(|c| c[1].to_uppercase()) else {
            continue;
        };
        let qty = capture_amount(&QTY_RE, &line);
        let unit_price = capture_amount(&PRICE_RE, &line);
        let total = capture_amount(&TOTAL_RE, &line);
        if unit_price.is_none() && total.is_none() {
            continue;
        }

        let amount_sar = total.or_else(|| match (qty, unit_price) {
            (Some(q), Some(u)) => Some(round2(q * u)),
            _ => None,
        });

        items.push(ProcurementItem {
            item_code: Some(code),
            description: line.clone(),
            vendor: None,
            qty,
            unit: None,
            unit_price_sar: unit_price,
            amount_sar,
            doc_date: None,
            evidence_refs: BTreeSet::from([sheet.cell_ref(row, 0)]),
        });
    }

    for item in &mut items {
        item.vendor = vendor.clone();
        item.doc_date = doc_date.clone();
    }
    items
}
