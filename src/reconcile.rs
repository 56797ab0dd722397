//! Merges per-sheet extraction results into one report: labels mapped, duplicate
//! keys summed, change orders folded into budget, materiality flagged.

use crate::config::PipelineConfig;
use crate::insights::{variance_insights, workbook_insights, VarianceInsights, WorkbookInsights};
use crate::procurement::{summarize, ProcurementSummary};
use crate::schema::{
    compute_variance, CanonicalLineItem, CategoryMapEntry, ChangeOrder, ExtractionResult,
    ProcurementItem, RawSheet, VarianceItem, VarianceKey, VendorMapEntry, Warning, WarningCode,
};
use crate::utils::{normalize_label, period_contains, round2};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

pub const UNCATEGORIZED: &str = "Uncategorized";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VarianceReport {
    pub items: Vec<VarianceItem>,
    pub insights: VarianceInsights,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "shape", content = "data", rename_all = "snake_case")]
pub enum ReconcileOutcome {
    Variance(VarianceReport),
    Procurement(ProcurementSummary),
    Insights(WorkbookInsights),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reconciled {
    pub outcome: ReconcileOutcome,
    pub warnings: Vec<Warning>,
}

/// Deduplicated warnings in first-seen order.
#[derive(Default)]
struct Notes {
    seen: HashSet<(WarningCode, String)>,
    warnings: Vec<Warning>,
}

impl Notes {
    fn push(&mut self, warning: Warning) {
        if self.seen.insert((warning.code, warning.message.clone())) {
            self.warnings.push(warning);
        }
    }
}

struct CategoryMap {
    by_label: HashMap<String, String>,
    canonical: HashSet<String>,
    supplied: bool,
}

impl CategoryMap {
    fn new(entries: &[CategoryMapEntry]) -> Self {
        Self {
            by_label: entries
                .iter()
                .map(|e| (normalize_label(&e.raw_label), e.canonical_category.clone()))
                .collect(),
            canonical: entries
                .iter()
                .map(|e| normalize_label(&e.canonical_category))
                .collect(),
            supplied: !entries.is_empty(),
        }
    }

    /// Category label through the map, then by cost code, then `Uncategorized`.
    fn resolve(&self, label: Option<&str>, cost_code: Option<&str>, notes: &mut Notes) -> String {
        if let Some(label) = label.map(str::trim).filter(|l| !l.is_empty()) {
            let key = normalize_label(label);
            if let Some(canonical) = self.by_label.get(&key) {
                return canonical.clone();
            }
            if self.supplied && !self.canonical.contains(&key) {
                notes.push(Warning::new(
                    WarningCode::UnmappedLabel,
                    format!("Category '{}' is not in the category map; kept as written", label),
                ));
            }
            return label.to_string();
        }

        if let Some(canonical) = cost_code.and_then(|c| self.by_label.get(&normalize_label(c))) {
            return canonical.clone();
        }
        notes.push(Warning::new(
            WarningCode::UnmappedLabel,
            match cost_code {
                Some(code) => format!("Cost code '{}' has no category mapping; using {}", code, UNCATEGORIZED),
                None => format!("Line without category or cost code; using {}", UNCATEGORIZED),
            },
        ));
        UNCATEGORIZED.to_string()
    }

    /// Change orders resolve by their linked cost code before their own label.
    fn resolve_change_order(&self, co: &ChangeOrder, notes: &mut Notes) -> String {
        if let Some(canonical) = co
            .cost_code
            .as_deref()
            .and_then(|c| self.by_label.get(&normalize_label(c)))
        {
            return canonical.clone();
        }
        self.resolve(co.category.as_deref(), co.cost_code.as_deref(), notes)
    }
}

struct VendorMap<'a> {
    entries: &'a [VendorMapEntry],
    by_name: HashMap<String, &'a str>,
    canonical: HashSet<String>,
}

impl<'a> VendorMap<'a> {
    fn new(entries: &'a [VendorMapEntry]) -> Self {
        Self {
            entries,
            by_name: entries
                .iter()
                .map(|e| (normalize_label(&e.raw_name), e.canonical_vendor.as_str()))
                .collect(),
            canonical: entries
                .iter()
                .map(|e| normalize_label(&e.canonical_vendor))
                .collect(),
        }
    }

    fn canonical_name(&self, raw: &str, notes: &mut Notes) -> String {
        let key = normalize_label(raw);
        if let Some(canonical) = self.by_name.get(&key) {
            return canonical.to_string();
        }
        if !self.entries.is_empty() && !self.canonical.contains(&key) {
            notes.push(Warning::new(
                WarningCode::UnmappedLabel,
                format!("Vendor '{}' is not in the vendor map; kept as written", raw.trim()),
            ));
        }
        raw.trim().to_string()
    }

    /// Canonical vendors contracted on a cost code, scoped to the project when
    /// the entry names one.
    fn for_cost_code(&self, project: &str, cost_code: &str) -> Vec<String> {
        let code = normalize_label(cost_code);
        let project = normalize_label(project);
        self.entries
            .iter()
            .filter(|e| e.cost_code.as_deref().map(normalize_label).as_deref() == Some(code.as_str()))
            .filter(|e| {
                e.project
                    .as_deref()
                    .map_or(true, |p| normalize_label(p) == project)
            })
            .map(|e| e.canonical_vendor.clone())
            .collect()
    }
}

/// Sums the rows sharing a key. Contributions are summed in sorted order so the
/// totals do not depend on sheet or row order.
fn merge_group(key: VarianceKey, mut rows: Vec<VarianceItem>) -> VarianceItem {
    rows.sort_by(|a, b| {
        a.budget_sar
            .total_cmp(&b.budget_sar)
            .then_with(|| a.actual_sar.total_cmp(&b.actual_sar))
    });
    let budget = rows.iter().map(|r| r.budget_sar).sum();
    let actual = rows.iter().map(|r| r.actual_sar).sum();
    let codes: BTreeSet<&String> = rows.iter().filter_map(|r| r.cost_code.as_ref()).collect();

    let mut merged = VarianceItem::new(
        key.project,
        key.period,
        key.category,
        budget,
        actual,
        rows.iter().flat_map(|r| r.evidence_refs.iter().cloned()).collect(),
    );
    if codes.len() == 1 {
        merged.cost_code = codes.into_iter().next().cloned();
    }
    merged
}

fn co_matches(co: &ChangeOrder, co_category: &str, item: &VarianceItem) -> bool {
    let same_project = co
        .project
        .as_deref()
        .map_or(true, |p| normalize_label(p) == normalize_label(&item.project));
    let in_period = match co.date {
        Some(date) => period_contains(&item.period, date),
        None => co.period.as_deref() == Some(item.period.as_str()),
    };
    same_project && in_period && co_category == item.category
}

fn fold_change_orders(
    items: &mut [VarianceItem],
    mut change_orders: Vec<ChangeOrder>,
    categories: &CategoryMap,
    vendors: &VendorMap,
    notes: &mut Notes,
) {
    change_orders.sort_by(|a, b| {
        a.co_id
            .cmp(&b.co_id)
            .then_with(|| a.description.cmp(&b.description))
    });

    for co in &change_orders {
        let category = categories.resolve_change_order(co, notes);
        let Some(item) = items.iter_mut().find(|i| co_matches(co, &category, i)) else {
            let when = co
                .date
                .map(|d| d.to_string())
                .or_else(|| co.period.clone())
                .unwrap_or_else(|| "no date".to_string());
            notes.push(Warning::new(
                WarningCode::PartialExtraction,
                format!(
                    "Change order {} ({}, {}, {}) matched no budget line and was not applied",
                    co.co_id.as_deref().unwrap_or("without id"),
                    co.project.as_deref().unwrap_or("any project"),
                    when,
                    category
                ),
            ));
            continue;
        };

        if let Some(amount) = co.amount_sar {
            item.budget_sar += amount;
            item.change_order_sar += amount;
        }
        item.evidence_refs.extend(co.evidence_refs.iter().cloned());
        item.drivers.push(co.driver_line());
        if let Some(link) = co.file_link.as_ref().filter(|l| !l.trim().is_empty()) {
            if !item.evidence_links.contains(link) {
                item.evidence_links.push(link.clone());
            }
        }
        if let Some(code) = co.cost_code.as_deref() {
            item.vendors.extend(vendors.for_cost_code(&item.project, code));
        }
    }

    for item in items.iter_mut() {
        item.vendors.sort();
        item.vendors.dedup();
    }
}

fn finish(item: &mut VarianceItem, config: &PipelineConfig) {
    item.budget_sar = round2(item.budget_sar);
    item.actual_sar = round2(item.actual_sar);
    item.change_order_sar = round2(item.change_order_sar);
    let (variance, pct) = compute_variance(item.budget_sar, item.actual_sar);
    item.variance_sar = round2(variance);
    item.variance_pct = pct.map(round2);
    item.material = pct.map_or(false, |p| p.abs() >= config.materiality_pct)
        || variance.abs() >= config.materiality_amount_sar;
}

/// Reconciles every extraction result into a single outcome.
///
/// Variance lines win over procurement lines; when neither survived, the raw
/// sheets are profiled into [`WorkbookInsights`] so the caller always gets a shape.
pub fn reconcile(
    results: &[ExtractionResult],
    vendor_map: &[VendorMapEntry],
    category_map: &[CategoryMapEntry],
    sheets: &[RawSheet],
    config: &PipelineConfig,
) -> Reconciled {
    let categories = CategoryMap::new(category_map);
    let vendors = VendorMap::new(vendor_map);
    let mut notes = Notes::default();

    let mut groups: BTreeMap<VarianceKey, Vec<VarianceItem>> = BTreeMap::new();
    let mut change_orders = Vec::new();
    let mut procurement: Vec<ProcurementItem> = Vec::new();

    for result in results {
        let label = result.origin.label();
        for item in &result.items {
            if !item.has_evidence() {
                notes.push(
                    Warning::new(
                        WarningCode::MissingEvidence,
                        "Line item without a source cell reference was dropped",
                    )
                    .at(label.clone()),
                );
                continue;
            }
            match item {
                CanonicalLineItem::Variance(v) => {
                    let mut v = v.clone();
                    v.category =
                        categories.resolve(Some(&v.category), v.cost_code.as_deref(), &mut notes);
                    groups.entry(v.key()).or_default().push(v);
                }
                CanonicalLineItem::ChangeOrder(co) => change_orders.push(co.clone()),
                CanonicalLineItem::Procurement(p) => {
                    let mut p = p.clone();
                    p.vendor = p.vendor.map(|v| vendors.canonical_name(&v, &mut notes));
                    procurement.push(p);
                }
                CanonicalLineItem::VendorMap(_) | CanonicalLineItem::CategoryMap(_) => {}
            }
        }
    }

    let outcome = if !groups.is_empty() {
        let mut items: Vec<VarianceItem> = groups
            .into_iter()
            .map(|(key, rows)| merge_group(key, rows))
            .collect();
        fold_change_orders(&mut items, change_orders, &categories, &vendors, &mut notes);
        for item in &mut items {
            finish(item, config);
        }
        info!(
            "Reconciled {} variance line(s), {} material",
            items.len(),
            items.iter().filter(|i| i.material).count()
        );
        let insights = variance_insights(&items);
        ReconcileOutcome::Variance(VarianceReport { items, insights })
    } else if !procurement.is_empty() {
        info!("Reconciled {} procurement line(s)", procurement.len());
        ReconcileOutcome::Procurement(summarize(procurement, config))
    } else {
        debug!("No variance or procurement lines; profiling {} sheet(s)", sheets.len());
        ReconcileOutcome::Insights(workbook_insights(sheets, config))
    };

    Reconciled {
        outcome,
        warnings: notes.warnings,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{CellRef, OriginKind, SheetKind, SheetOrigin};

    fn cell(sheet: &str, row: usize, col: usize) -> CellRef {
        CellRef {
            file: "budget.csv".into(),
            sheet: sheet.into(),
            row,
            col,
        }
    }

    fn line(category: &str, budget: f64, actual: f64, row: usize) -> CanonicalLineItem {
        let mut item = VarianceItem::new(
            "Tower A",
            "2024-03",
            category,
            budget,
            actual,
            BTreeSet::from([cell("s", row, 3), cell("s", row, 4)]),
        );
        item.cost_code = Some(format!("CC-{}", category.len()));
        CanonicalLineItem::Variance(item)
    }

    fn result(items: Vec<CanonicalLineItem>) -> ExtractionResult {
        ExtractionResult {
            origin: SheetOrigin::new("budget.csv", "csv", 0, OriginKind::Sheet),
            kind: SheetKind::BudgetActual,
            confidence: 1.0,
            header_row: Some(0),
            items,
            warnings: Vec::new(),
            assisted: false,
        }
    }

    fn variance(reconciled: Reconciled) -> Vec<VarianceItem> {
        match reconciled.outcome {
            ReconcileOutcome::Variance(report) => report.items,
            other => panic!("expected variance report, got {:?}", other),
        }
    }

    #[test]
    fn test_duplicate_keys_sum() {
        let results = vec![
            result(vec![line("Civil", 100.0, 120.0, 1)]),
            result(vec![line("Civil", 50.0, 60.0, 2)]),
        ];
        let items = variance(reconcile(&results, &[], &[], &[], &PipelineConfig::default()));
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].budget_sar, 150.0);
        assert_eq!(items[0].actual_sar, 180.0);
        assert_eq!(items[0].variance_sar, 30.0);
        assert_eq!(items[0].evidence_refs.len(), 4);
    }

    #[test]
    fn test_change_order_folds_into_budget() {
        let co = ChangeOrder {
            project: Some("Tower A".into()),
            period: Some("2024-03".into()),
            date: None,
            category: None,
            cost_code: Some("CC-5".into()),
            co_id: Some("CO-7".into()),
            amount_sar: Some(20.0),
            description: Some("Extra slab".into()),
            file_link: Some("https://files/co7.pdf".into()),
            evidence_refs: BTreeSet::from([cell("co", 1, 2)]),
        };
        let categories = vec![CategoryMapEntry {
            raw_label: "CC-5".into(),
            canonical_category: "Civil".into(),
        }];
        let vendor_map = vec![VendorMapEntry {
            raw_name: "Acme Co.".into(),
            canonical_vendor: "Acme".into(),
            project: None,
            cost_code: Some("CC-5".into()),
        }];
        let results = vec![
            result(vec![line("Civil", 100.0, 120.0, 1)]),
            result(vec![CanonicalLineItem::ChangeOrder(co)]),
        ];
        let reconciled = reconcile(&results, &vendor_map, &categories, &[], &PipelineConfig::default());
        let items = variance(reconciled);

        let civil = &items[0];
        assert_eq!(civil.budget_sar, 120.0);
        assert_eq!(civil.change_order_sar, 20.0);
        assert_eq!(civil.variance_sar, 0.0);
        assert_eq!(civil.drivers, vec!["CO-7: Extra slab".to_string()]);
        assert_eq!(civil.vendors, vec!["Acme".to_string()]);
        assert_eq!(civil.evidence_links, vec!["https://files/co7.pdf".to_string()]);
        assert!(civil.evidence_refs.contains(&cell("co", 1, 2)));
    }

    fn dated_co(id: &str, date: (i32, u32, u32), category: Option<&str>, amount: f64) -> CanonicalLineItem {
        CanonicalLineItem::ChangeOrder(ChangeOrder {
            project: Some("Tower A".into()),
            period: None,
            date: chrono::NaiveDate::from_ymd_opt(date.0, date.1, date.2),
            category: category.map(str::to_string),
            cost_code: Some("CC-5".into()),
            co_id: Some(id.into()),
            amount_sar: Some(amount),
            description: None,
            file_link: None,
            evidence_refs: BTreeSet::from([cell("co", 1, 4)]),
        })
    }

    #[test]
    fn test_change_orders_match_by_date_and_cost_code() {
        let categories = vec![CategoryMapEntry {
            raw_label: "CC-5".into(),
            canonical_category: "Civil".into(),
        }];
        let results = vec![
            result(vec![line("Civil", 100.0, 130.0, 1)]),
            result(vec![
                dated_co("CO-2", (2024, 3, 15), Some("Misc works"), 20.0),
                dated_co("CO-3", (2024, 3, 31), None, 5.0),
                dated_co("CO-4", (2024, 4, 1), None, 40.0),
            ]),
        ];
        let reconciled = reconcile(&results, &[], &categories, &[], &PipelineConfig::default());

        let unmatched: Vec<&Warning> = reconciled
            .warnings
            .iter()
            .filter(|w| w.code == WarningCode::PartialExtraction)
            .collect();
        assert_eq!(unmatched.len(), 1);
        assert!(unmatched[0].message.contains("CO-4"));
        assert!(unmatched[0].message.contains("2024-04-01"));
        assert!(!reconciled.warnings.iter().any(|w| w.message.contains("Misc works")));

        let civil = &variance(reconciled)[0];
        assert_eq!(civil.budget_sar, 125.0);
        assert_eq!(civil.change_order_sar, 25.0);
        assert_eq!(
            civil.drivers,
            vec!["Change Order CO-2".to_string(), "Change Order CO-3".to_string()]
        );
    }

    #[test]
    fn test_materiality_and_zero_budget() {
        let config = PipelineConfig {
            materiality_pct: 10.0,
            materiality_amount_sar: 1_000.0,
            ..PipelineConfig::default()
        };
        let results = vec![result(vec![
            line("Civil", 100.0, 105.0, 1),
            line("MEP", 100.0, 115.0, 2),
            line("Fitout", 0.0, 50.0, 3),
        ])];
        let items = variance(reconcile(&results, &[], &[], &[], &config));
        let by_cat: HashMap<&str, &VarianceItem> =
            items.iter().map(|i| (i.category.as_str(), i)).collect();

        assert!(!by_cat["Civil"].material);
        assert!(by_cat["MEP"].material);
        assert_eq!(by_cat["Fitout"].variance_pct, None);
        assert!(!by_cat["Fitout"].material);
    }

    #[test]
    fn test_missing_category_uses_cost_code_then_default() {
        let results = vec![result(vec![line("", 10.0, 12.0, 1)])];
        let reconciled = reconcile(&results, &[], &[], &[], &PipelineConfig::default());
        assert!(reconciled
            .warnings
            .iter()
            .any(|w| w.code == WarningCode::UnmappedLabel));
        assert_eq!(variance(reconciled)[0].category, UNCATEGORIZED);
    }

    #[test]
    fn test_item_without_evidence_is_dropped() {
        let bare = CanonicalLineItem::Variance(VarianceItem::new(
            "P",
            "2024-01",
            "Civil",
            1.0,
            2.0,
            BTreeSet::new(),
        ));
        let reconciled = reconcile(&[result(vec![bare])], &[], &[], &[], &PipelineConfig::default());
        assert!(matches!(reconciled.outcome, ReconcileOutcome::Insights(_)));
        assert_eq!(reconciled.warnings[0].code, WarningCode::MissingEvidence);
    }

    #[test]
    fn test_procurement_vendors_are_mapped() {
        let quote = |vendor: &str, price: f64, row: usize| {
            CanonicalLineItem::Procurement(ProcurementItem {
                item_code: Some("D-1".into()),
                description: "Door".into(),
                vendor: Some(vendor.into()),
                qty: Some(2.0),
                unit: None,
                unit_price_sar: Some(price),
                amount_sar: Some(price * 2.0),
                doc_date: None,
                evidence_refs: BTreeSet::from([cell("q", row, 1)]),
            })
        };
        let vendor_map = vec![VendorMapEntry {
            raw_name: "ACME Trading Est.".into(),
            canonical_vendor: "Acme".into(),
            project: None,
            cost_code: None,
        }];
        let results = vec![result(vec![quote("ACME Trading Est.", 100.0, 1), quote("Bolt", 150.0, 2)])];
        let reconciled = reconcile(&results, &vendor_map, &[], &[], &PipelineConfig::default());
        match reconciled.outcome {
            ReconcileOutcome::Procurement(summary) => {
                assert_eq!(summary.items[0].vendor.as_deref(), Some("Acme"));
                assert_eq!(summary.insights.spreads[0].min_vendor, "Acme");
            }
            other => panic!("expected procurement, got {:?}", other),
        }
        assert!(reconciled
            .warnings
            .iter()
            .any(|w| w.message.contains("'Bolt'")));
    }
}
