//! Sheet-level highlights for uploads with no budget/actual or procurement
//! shape, and rollups for variance reports.

use crate::config::PipelineConfig;
use crate::procurement::{spread_analysis, SpreadRow, VendorAggregate};
use crate::schema::{CellValue, ProcurementItem, RawSheet, VarianceItem};
use crate::utils::{coerce_date, coerce_number, format_amount, round2};
use crate::vocabulary::{match_header, Field};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

const TOP_VALUES: usize = 10;
const SHEET_TOP_ROWS: usize = 10;
const WORKBOOK_TOP_ROWS: usize = 20;
const TOP_DRIVERS: usize = 5;
const TOP_VARIANCES: usize = 10;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SheetProfile {
    pub file: String,
    pub sheet: String,
    pub rows: usize,
    pub cols: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnProfile {
    pub column: String,
    pub missing_rate: f64,
    pub numeric: bool,
    pub date_like: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NumericSummary {
    pub column: String,
    pub count: usize,
    pub sum: f64,
    pub mean: f64,
    pub median: f64,
    pub min: f64,
    pub max: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValueCount {
    pub value: String,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpendLine {
    pub description: String,
    pub total_sar: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "rows", rename_all = "snake_case")]
pub enum Table {
    ColumnsProfile(Vec<ColumnProfile>),
    NumericSummary(Vec<NumericSummary>),
    TopValues(Vec<ValueCount>),
    VendorTotals(Vec<VendorAggregate>),
    TopItemsBySpend(Vec<SpendLine>),
    VendorSpreads(Vec<SpreadRow>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Card {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sheet: Option<String>,
    pub title: String,
    pub value_sar: f64,
}

/// Degraded result shape: profile, named tables, KPI cards and highlight lines.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkbookInsights {
    pub profile: Vec<SheetProfile>,
    pub tables: BTreeMap<String, Table>,
    pub cards: Vec<Card>,
    pub highlights: Vec<String>,
}

/// A sheet viewed as a header row plus data rows.
struct Frame<'a> {
    sheet: &'a RawSheet,
    header_row: usize,
    columns: Vec<String>,
}

impl<'a> Frame<'a> {
    /// The header is the first non-blank row within the scan window whose
    /// non-blank cells are mostly text.
    fn new(sheet: &'a RawSheet, scan_rows: usize) -> Option<Self> {
        let header_row = (0..scan_rows.min(sheet.row_count())).find(|&r| {
            let cells: Vec<&CellValue> =
                sheet.rows()[r].iter().filter(|c| !c.is_blank()).collect();
            let text = cells
                .iter()
                .filter(|c| matches!(c, CellValue::Text(_)) && coerce_number(c).is_none())
                .count();
            !cells.is_empty() && text * 2 >= cells.len()
        })?;

        let columns = (0..sheet.col_count())
            .map(|c| {
                let name = sheet.cell(header_row, c).display();
                if name.is_empty() {
                    format!("column {}", c + 1)
                } else {
                    name
                }
            })
            .collect();
        Some(Self {
            sheet,
            header_row,
            columns,
        })
    }

    fn data_rows(&self) -> impl Iterator<Item = usize> + '_ {
        (self.header_row + 1..self.sheet.row_count())
            .filter(|&r| !self.sheet.rows()[r].iter().all(CellValue::is_blank))
    }

    fn column(&self, col: usize) -> Vec<&'a CellValue> {
        let sheet = self.sheet;
        self.data_rows().map(|r| sheet.cell(r, col)).collect()
    }

    fn find(&self, fields: &[Field]) -> Option<usize> {
        fields.iter().find_map(|wanted| {
            self.columns
                .iter()
                .position(|name| match_header(name) == Some(*wanted))
        })
    }
}

fn numeric_values(cells: &[&CellValue]) -> Option<Vec<f64>> {
    let present: Vec<&&CellValue> = cells.iter().filter(|c| !c.is_blank()).collect();
    if present.is_empty() {
        return None;
    }
    present.iter().map(|c| coerce_number(c)).collect()
}

fn summarize_numbers(column: &str, mut values: Vec<f64>) -> NumericSummary {
    values.sort_by(f64::total_cmp);
    let count = values.len();
    let sum: f64 = values.iter().sum();
    let median = if count % 2 == 1 {
        values[count / 2]
    } else {
        (values[count / 2 - 1] + values[count / 2]) / 2.0
    };
    NumericSummary {
        column: column.to_string(),
        count,
        sum: round2(sum),
        mean: round2(sum / count as f64),
        median: round2(median),
        min: values[0],
        max: values[count - 1],
    }
}

/// Sums amounts per label, largest first.
fn totals_by_label(pairs: impl Iterator<Item = (String, f64)>) -> Vec<(String, f64)> {
    let mut grouped: BTreeMap<String, f64> = BTreeMap::new();
    for (label, amount) in pairs {
        *grouped.entry(label).or_default() += amount;
    }
    let mut out: Vec<(String, f64)> = grouped.into_iter().collect();
    out.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    out
}

#[derive(Default)]
struct Accumulator {
    grand_total: f64,
    vendor_totals: BTreeMap<String, f64>,
    spend_by_desc: BTreeMap<String, f64>,
    spreads: Vec<SpreadRow>,
}

fn profile_sheet(
    frame: &Frame,
    tables: &mut BTreeMap<String, Table>,
    cards: &mut Vec<Card>,
    acc: &mut Accumulator,
) {
    let name = frame.sheet.origin().label();
    let row_count = frame.data_rows().count();

    let mut profiles = Vec::new();
    let mut summaries = Vec::new();
    for (col, column) in frame.columns.iter().enumerate() {
        let cells = frame.column(col);
        let present: Vec<&CellValue> = cells.iter().copied().filter(|c| !c.is_blank()).collect();
        let numbers = numeric_values(&cells);
        let date_like = !present.is_empty()
            && numbers.is_none()
            && present.iter().all(|c| coerce_date(c).is_some());

        profiles.push(ColumnProfile {
            column: column.clone(),
            missing_rate: if row_count == 0 {
                0.0
            } else {
                ((cells.len() - present.len()) as f64 / row_count as f64 * 10_000.0).round()
                    / 10_000.0
            },
            numeric: numbers.is_some(),
            date_like,
        });

        match numbers {
            Some(values) => summaries.push(summarize_numbers(column, values)),
            None if !present.is_empty() && !date_like => {
                let mut counts: BTreeMap<String, usize> = BTreeMap::new();
                for cell in &present {
                    *counts.entry(cell.display()).or_default() += 1;
                }
                let distinct = counts.len();
                if distinct <= 50.max(row_count / 10) {
                    let mut top: Vec<ValueCount> = counts
                        .into_iter()
                        .map(|(value, count)| ValueCount { value, count })
                        .collect();
                    top.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.value.cmp(&b.value)));
                    top.truncate(TOP_VALUES);
                    tables.insert(format!("{}::top_values::{}", name, column), Table::TopValues(top));
                }
            }
            None => {}
        }
    }
    tables.insert(format!("{}::columns_profile", name), Table::ColumnsProfile(profiles));
    if !summaries.is_empty() {
        tables.insert(format!("{}::numeric_summary", name), Table::NumericSummary(summaries));
    }

    let amount_col = frame.find(&[Field::Amount]);
    let vendor_col = frame.find(&[Field::Vendor]);
    let desc_col = frame.find(&[Field::Description, Field::ItemCode]);
    let price_col = frame.find(&[Field::UnitPrice]);
    let sheet = frame.sheet;

    let amounts: Vec<(usize, f64)> = match amount_col {
        Some(col) => frame
            .data_rows()
            .filter_map(|r| coerce_number(sheet.cell(r, col)).map(|a| (r, a)))
            .collect(),
        None => Vec::new(),
    };
    if amount_col.is_some() {
        let total: f64 = amounts.iter().map(|(_, a)| a).sum();
        acc.grand_total += total;
        cards.push(Card {
            sheet: Some(name.clone()),
            title: "Sheet total amount".to_string(),
            value_sar: round2(total),
        });
    }

    let label_at = |col: usize, r: usize| Some(sheet.cell(r, col).display()).filter(|s| !s.is_empty());

    if let Some(vcol) = vendor_col {
        let totals = totals_by_label(amounts.iter().filter_map(|&(r, a)| label_at(vcol, r).map(|v| (v, a))));
        if !totals.is_empty() {
            for (vendor, total) in &totals {
                *acc.vendor_totals.entry(vendor.clone()).or_default() += total;
            }
            tables.insert(
                format!("{}::vendor_totals", name),
                Table::VendorTotals(
                    totals
                        .into_iter()
                        .take(SHEET_TOP_ROWS)
                        .map(|(vendor, total)| VendorAggregate {
                            vendor,
                            total_sar: round2(total),
                        })
                        .collect(),
                ),
            );
        }
    }

    if let Some(dcol) = desc_col {
        let totals = totals_by_label(amounts.iter().filter_map(|&(r, a)| label_at(dcol, r).map(|d| (d, a))));
        if !totals.is_empty() {
            for (desc, total) in &totals {
                *acc.spend_by_desc.entry(desc.clone()).or_default() += total;
            }
            tables.insert(
                format!("{}::top_items_by_spend", name),
                Table::TopItemsBySpend(
                    totals
                        .into_iter()
                        .take(SHEET_TOP_ROWS)
                        .map(|(description, total)| SpendLine {
                            description,
                            total_sar: round2(total),
                        })
                        .collect(),
                ),
            );
        }
    }

    if let (Some(vcol), Some(pcol), Some(dcol)) = (vendor_col, price_col, desc_col) {
        let quotes: Vec<ProcurementItem> = frame
            .data_rows()
            .filter_map(|r| {
                let price = coerce_number(sheet.cell(r, pcol))?;
                Some(ProcurementItem {
                    item_code: None,
                    description: label_at(dcol, r)?,
                    vendor: Some(label_at(vcol, r)?),
                    qty: None,
                    unit: None,
                    unit_price_sar: Some(price),
                    amount_sar: None,
                    doc_date: None,
                    evidence_refs: BTreeSet::from([sheet.cell_ref(r, pcol)]),
                })
            })
            .collect();
        acc.spreads.extend(spread_analysis(&quotes));
    }
}

/// Profiles every sheet and derives cost highlights where amount, vendor,
/// description or unit-price columns can be recognised.
pub fn workbook_insights(sheets: &[RawSheet], config: &PipelineConfig) -> WorkbookInsights {
    let mut insights = WorkbookInsights::default();
    let mut acc = Accumulator::default();

    for sheet in sheets {
        insights.profile.push(SheetProfile {
            file: sheet.origin().file_name.clone(),
            sheet: sheet.origin().sheet_name.clone(),
            rows: sheet.row_count(),
            cols: sheet.col_count(),
        });
        if sheet.is_empty() {
            continue;
        }
        if let Some(frame) = Frame::new(sheet, config.header_scan_rows) {
            profile_sheet(&frame, &mut insights.tables, &mut insights.cards, &mut acc);
        }
    }

    let vendor_totals = totals_by_label(acc.vendor_totals.into_iter());
    if let Some((vendor, total)) = vendor_totals.first() {
        insights.highlights.push(format!(
            "Top vendor by spend: {} (≈ {} SAR).",
            vendor,
            format_amount(*total, 2)
        ));
        insights.tables.insert(
            "workbook::vendor_totals".to_string(),
            Table::VendorTotals(
                vendor_totals
                    .iter()
                    .take(WORKBOOK_TOP_ROWS)
                    .map(|(vendor, total)| VendorAggregate {
                        vendor: vendor.clone(),
                        total_sar: round2(*total),
                    })
                    .collect(),
            ),
        );
    }

    let drivers = totals_by_label(acc.spend_by_desc.into_iter());
    if !drivers.is_empty() {
        let listed: Vec<String> = drivers
            .iter()
            .take(TOP_DRIVERS)
            .map(|(desc, total)| format!("{} (≈ {} SAR)", desc, format_amount(*total, 2)))
            .collect();
        insights
            .highlights
            .push(format!("Largest cost drivers: {}.", listed.join(", ")));
    }

    let mut spreads = acc.spreads;
    if !spreads.is_empty() {
        spreads.sort_by(|a, b| {
            b.unit_spread_sar
                .total_cmp(&a.unit_spread_sar)
                .then_with(|| b.spread_pct.total_cmp(&a.spread_pct))
        });
        spreads.truncate(WORKBOOK_TOP_ROWS);
        let top = &spreads[0];
        insights.highlights.push(format!(
            "Bid spread detected for '{}': {} {} vs {} {} SAR ({}% Δ).",
            top.description,
            top.min_vendor,
            top.min_unit_sar,
            top.max_vendor,
            top.max_unit_sar,
            top.spread_pct
        ));
        insights
            .tables
            .insert("workbook::vendor_spreads".to_string(), Table::VendorSpreads(spreads));
    }

    if acc.grand_total > 0.0 {
        insights.cards.insert(
            0,
            Card {
                sheet: None,
                title: "Workbook total amount".to_string(),
                value_sar: round2(acc.grand_total),
            },
        );
    }

    if insights.highlights.is_empty() {
        let rows: usize = sheets.iter().map(RawSheet::row_count).sum();
        insights.highlights.push(format!(
            "{} sheet(s) with {} row(s) profiled; no budget/actual or procurement columns were recognised.",
            sheets.len(),
            rows
        ));
    }

    insights
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VarianceTotals {
    pub budget_sar: f64,
    pub actual_sar: f64,
    pub variance_sar: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VarianceInsights {
    pub totals: VarianceTotals,
    pub top_overruns: Vec<VarianceItem>,
    pub top_underruns: Vec<VarianceItem>,
}

/// Portfolio totals plus the ten largest overruns and underruns.
pub fn variance_insights(items: &[VarianceItem]) -> VarianceInsights {
    let budget: f64 = items.iter().map(|v| v.budget_sar).sum();
    let actual: f64 = items.iter().map(|v| v.actual_sar).sum();

    let mut over: Vec<VarianceItem> = items.iter().filter(|v| v.variance_sar > 0.0).cloned().collect();
    over.sort_by(|a, b| b.variance_sar.total_cmp(&a.variance_sar));
    over.truncate(TOP_VARIANCES);

    let mut under: Vec<VarianceItem> = items.iter().filter(|v| v.variance_sar < 0.0).cloned().collect();
    under.sort_by(|a, b| a.variance_sar.total_cmp(&b.variance_sar));
    under.truncate(TOP_VARIANCES);

    VarianceInsights {
        totals: VarianceTotals {
            budget_sar: round2(budget),
            actual_sar: round2(actual),
            variance_sar: round2(actual - budget),
        },
        top_overruns: over,
        top_underruns: under,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{OriginKind, SheetOrigin};

    fn sheet(name: &str, rows: &[&[&str]]) -> RawSheet {
        RawSheet::new(
            SheetOrigin::new("book.xlsx", name, 0, OriginKind::Sheet),
            rows.iter()
                .map(|r| r.iter().map(|c| CellValue::text(*c)).collect())
                .collect(),
        )
    }

    #[test]
    fn test_cost_highlights() {
        let quotes = sheet(
            "Quotes",
            &[
                &["Supplier", "Description", "Rate", "Line Total"],
                &["Acme", "Door", "100", "1,000"],
                &["Bolt", "Door", "130", "1,300"],
                &["Acme", "Frame", "40", "400"],
            ],
        );
        let insights = workbook_insights(&[quotes], &PipelineConfig::default());

        assert_eq!(insights.cards[0].title, "Workbook total amount");
        assert_eq!(insights.cards[0].value_sar, 2700.0);
        assert!(insights.highlights[0].starts_with("Top vendor by spend: Acme"));
        assert!(insights.highlights[1].starts_with("Largest cost drivers: Door"));
        assert!(insights.highlights[2].contains("Acme 100 vs Bolt 130"));
        assert!(insights.tables.contains_key("book.xlsx:Quotes::numeric_summary"));
        match &insights.tables["workbook::vendor_spreads"] {
            Table::VendorSpreads(rows) => assert_eq!(rows[0].spread_pct, 30.0),
            other => panic!("unexpected table {:?}", other),
        }
    }

    #[test]
    fn test_profile_only_sheet() {
        let notes = sheet(
            "Notes",
            &[&["Site", "Weather"], &["North", "Sunny"], &["South", ""]],
        );
        let insights = workbook_insights(&[notes], &PipelineConfig::default());
        assert_eq!(insights.profile[0].rows, 3);
        assert!(insights.cards.is_empty());
        assert_eq!(insights.highlights.len(), 1);
        match &insights.tables["book.xlsx:Notes::columns_profile"] {
            Table::ColumnsProfile(cols) => {
                assert_eq!(cols[1].column, "Weather");
                assert_eq!(cols[1].missing_rate, 0.5);
            }
            other => panic!("unexpected table {:?}", other),
        }
    }

    #[test]
    fn test_numeric_summary_median() {
        let summary = summarize_numbers("x", vec![4.0, 1.0, 3.0, 2.0]);
        assert_eq!(summary.median, 2.5);
        assert_eq!(summary.min, 1.0);
        assert_eq!(summary.max, 4.0);
        assert_eq!(summary.mean, 2.5);
    }

    #[test]
    fn test_variance_insights() {
        let items = vec![
            VarianceItem::new("P", "2024-01", "A", 100.0, 150.0, BTreeSet::new()),
            VarianceItem::new("P", "2024-01", "B", 100.0, 80.0, BTreeSet::new()),
            VarianceItem::new("P", "2024-01", "C", 100.0, 100.0, BTreeSet::new()),
        ];
        let insights = variance_insights(&items);
        assert_eq!(insights.totals.variance_sar, 30.0);
        assert_eq!(insights.top_overruns.len(), 1);
        assert_eq!(insights.top_underruns[0].category, "B");
    }
}
