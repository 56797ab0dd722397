//! Vendor totals, bid spreads and basket pricing for quotation line items.

use crate::config::PipelineConfig;
use crate::schema::{CellRef, ProcurementItem};
use crate::utils::{format_amount, normalize_label, round2};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use strsim::normalized_levenshtein;

/// Descriptions at least this similar are treated as the same line.
const DESCRIPTION_SIMILARITY: f64 = 0.9;
const TOP_LINES: usize = 10;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VendorAggregate {
    pub vendor: String,
    pub total_sar: f64,
}

/// Cheapest and dearest quote for one line quoted by two or more vendors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpreadRow {
    pub item_code: Option<String>,
    pub description: String,
    pub min_vendor: String,
    pub min_unit_sar: f64,
    pub max_vendor: String,
    pub max_unit_sar: f64,
    pub unit_spread_sar: f64,
    /// `(max - min) / min * 100`.
    pub spread_pct: f64,
    /// Largest quantity quoted in the group.
    pub qty: Option<f64>,
    /// `(max - min) * qty`; absent when no quantity was quoted.
    pub total_spread_sar: Option<f64>,
    pub evidence_refs: BTreeSet<CellRef>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BasketTotal {
    pub vendor: String,
    pub net_amount_sar: f64,
    pub vat_amount_sar: f64,
    pub tco_sar: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineBenchmark {
    pub item_code: String,
    pub min_unit_price_sar: f64,
    pub max_unit_price_sar: f64,
    pub unit_price_spread_sar: f64,
    pub unit_price_spread_pct: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcurementInsights {
    pub totals_per_vendor: Vec<VendorAggregate>,
    pub top_lines_by_amount: Vec<ProcurementItem>,
    pub spreads: Vec<SpreadRow>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub vendor_basket_totals: Vec<BasketTotal>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub line_benchmarks: Vec<LineBenchmark>,
    pub highlights: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcurementSummary {
    pub items: Vec<ProcurementItem>,
    pub insights: ProcurementInsights,
}

fn desc_amount(a: f64, b: f64) -> Ordering {
    b.total_cmp(&a)
}

/// Sums `amount_sar` per vendor, largest first. Lines without a vendor or amount are skipped.
pub fn vendor_totals(items: &[ProcurementItem]) -> Vec<VendorAggregate> {
    let mut totals: BTreeMap<&str, Vec<f64>> = BTreeMap::new();
    for item in items {
        if let (Some(vendor), Some(amount)) = (item.vendor.as_deref(), item.amount_sar) {
            totals.entry(vendor).or_default().push(amount);
        }
    }

    let mut out: Vec<VendorAggregate> = totals
        .into_iter()
        .map(|(vendor, mut amounts)| {
            amounts.sort_by(f64::total_cmp);
            VendorAggregate {
                vendor: vendor.to_string(),
                total_sar: round2(amounts.iter().sum()),
            }
        })
        .collect();
    out.sort_by(|a, b| desc_amount(a.total_sar, b.total_sar).then_with(|| a.vendor.cmp(&b.vendor)));
    out
}

/// Groups lines by item code, or by similar description when no code is given.
fn group_lines(items: &[ProcurementItem]) -> Vec<Vec<&ProcurementItem>> {
    let mut by_code: BTreeMap<String, Vec<&ProcurementItem>> = BTreeMap::new();
    let mut by_desc: Vec<(String, Vec<&ProcurementItem>)> = Vec::new();

    for item in items {
        let code = item.item_code.as_deref().map(normalize_label).filter(|c| !c.is_empty());
        if let Some(code) = code {
            by_code.entry(code).or_default().push(item);
            continue;
        }
        let desc = normalize_label(&item.description);
        if desc.is_empty() {
            continue;
        }
        match by_desc
            .iter_mut()
            .find(|(d, _)| normalized_levenshtein(d, &desc) >= DESCRIPTION_SIMILARITY)
        {
            Some((_, group)) => group.push(item),
            None => by_desc.push((desc, vec![item])),
        }
    }

    by_code
        .into_values()
        .chain(by_desc.into_iter().map(|(_, g)| g))
        .collect()
}

/// Per-line bid spread between the cheapest and dearest vendor.
///
/// A group needs two distinct vendors with unit prices and a positive minimum
/// price. Rows are ordered by total spread, then spread percent, largest first.
pub fn spread_analysis(items: &[ProcurementItem]) -> Vec<SpreadRow> {
    let mut rows = Vec::new();

    for group in group_lines(items) {
        // cheapest quote per vendor
        let mut best: BTreeMap<&str, &ProcurementItem> = BTreeMap::new();
        for item in group.iter().copied() {
            let (Some(vendor), Some(price)) = (item.vendor.as_deref(), item.unit_price_sar) else {
                continue;
            };
            let keep = best
                .get(vendor)
                .and_then(|b| b.unit_price_sar)
                .map_or(true, |current| price < current);
            if keep {
                best.insert(vendor, item);
            }
        }
        if best.len() < 2 {
            continue;
        }

        let price = |i: &ProcurementItem| i.unit_price_sar.unwrap_or_default();
        let mut quotes: Vec<(&str, &ProcurementItem)> = best.into_iter().collect();
        quotes.sort_by(|a, b| price(a.1).total_cmp(&price(b.1)));
        let (Some(&(min_vendor, min_item)), Some(&(max_vendor, max_item))) =
            (quotes.first(), quotes.last())
        else {
            continue;
        };
        let (min_u, max_u) = (price(min_item), price(max_item));
        if min_u <= 0.0 {
            continue;
        }

        let qty = group
            .iter()
            .filter_map(|i| i.qty)
            .max_by(f64::total_cmp);
        let unit_spread = max_u - min_u;

        rows.push(SpreadRow {
            item_code: min_item.item_code.clone(),
            description: min_item.description.clone(),
            min_vendor: min_vendor.to_string(),
            min_unit_sar: round2(min_u),
            max_vendor: max_vendor.to_string(),
            max_unit_sar: round2(max_u),
            unit_spread_sar: round2(unit_spread),
            spread_pct: round2(unit_spread / min_u * 100.0),
            qty,
            total_spread_sar: qty.map(|q| round2(unit_spread * q)),
            evidence_refs: min_item
                .evidence_refs
                .iter()
                .chain(&max_item.evidence_refs)
                .cloned()
                .collect(),
        });
    }

    rows.sort_by(|a, b| {
        let total = |r: &SpreadRow| r.total_spread_sar.unwrap_or(r.unit_spread_sar);
        desc_amount(total(a), total(b))
            .then_with(|| desc_amount(a.spread_pct, b.spread_pct))
            .then_with(|| a.description.cmp(&b.description))
    });
    rows
}

/// Prices a requested basket (item code -> quantity) at each vendor's quoted unit prices.
pub fn basket_totals(
    items: &[ProcurementItem],
    basket: &BTreeMap<String, f64>,
    vat_rate: f64,
) -> Vec<BasketTotal> {
    let wanted: BTreeMap<String, f64> = basket
        .iter()
        .map(|(code, qty)| (normalize_label(code), *qty))
        .collect();

    let mut nets: BTreeMap<&str, f64> = BTreeMap::new();
    for item in items {
        let (Some(vendor), Some(code), Some(price)) =
            (item.vendor.as_deref(), item.item_code.as_deref(), item.unit_price_sar)
        else {
            continue;
        };
        if let Some(qty) = wanted.get(&normalize_label(code)) {
            *nets.entry(vendor).or_default() += price * qty;
        }
    }

    let mut rows: Vec<BasketTotal> = nets
        .into_iter()
        .map(|(vendor, net)| {
            let vat = net * vat_rate;
            BasketTotal {
                vendor: vendor.to_string(),
                net_amount_sar: round2(net),
                vat_amount_sar: round2(vat),
                tco_sar: round2(net + vat),
            }
        })
        .collect();
    rows.sort_by(|a, b| a.tco_sar.total_cmp(&b.tco_sar).then_with(|| a.vendor.cmp(&b.vendor)));
    rows
}

/// Lowest and highest quoted unit price per item code.
pub fn line_benchmarks(items: &[ProcurementItem]) -> Vec<LineBenchmark> {
    let mut prices: BTreeMap<String, (f64, f64)> = BTreeMap::new();
    for item in items {
        let (Some(_), Some(code), Some(price)) =
            (item.vendor.as_deref(), item.item_code.as_deref(), item.unit_price_sar)
        else {
            continue;
        };
        let entry = prices.entry(code.trim().to_string()).or_insert((price, price));
        entry.0 = entry.0.min(price);
        entry.1 = entry.1.max(price);
    }

    prices
        .into_iter()
        .map(|(item_code, (min, max))| LineBenchmark {
            item_code,
            min_unit_price_sar: round2(min),
            max_unit_price_sar: round2(max),
            unit_price_spread_sar: round2(max - min),
            unit_price_spread_pct: (min > 0.0).then(|| round2((max - min) / min * 100.0)),
        })
        .collect()
}

fn highlights(
    items: &[ProcurementItem],
    totals: &[VendorAggregate],
    spreads: &[SpreadRow],
) -> Vec<String> {
    let mut out = vec![format!("{} line(s) detected.", items.len())];
    let vendors: BTreeSet<&str> = items.iter().filter_map(|i| i.vendor.as_deref()).collect();
    if !vendors.is_empty() {
        out.push(format!("{} vendor(s) present.", vendors.len()));
    }
    let mut amounts: Vec<f64> = items.iter().filter_map(|i| i.amount_sar).collect();
    amounts.sort_by(f64::total_cmp);
    let total: f64 = amounts.iter().sum();
    if total != 0.0 {
        out.push(format!("Total amount ≈ {} SAR.", format_amount(total, 2)));
    }
    if let Some(top) = totals.first() {
        out.push(format!(
            "Top vendor by spend: {} (≈ {} SAR).",
            top.vendor,
            format_amount(top.total_sar, 2)
        ));
    }
    if let Some(spread) = spreads.first() {
        out.push(format!(
            "Bid spread detected for '{}': {} {} vs {} {} SAR ({}% Δ).",
            spread.description,
            spread.min_vendor,
            format_amount(spread.min_unit_sar, 2),
            spread.max_vendor,
            format_amount(spread.max_unit_sar, 2),
            spread.spread_pct
        ));
    }
    out
}

/// Builds the procurement result: the items plus vendor totals, top lines,
/// spreads, and basket pricing when a basket is configured.
pub fn summarize(items: Vec<ProcurementItem>, config: &PipelineConfig) -> ProcurementSummary {
    let totals_per_vendor = vendor_totals(&items);
    let spreads = spread_analysis(&items);

    let mut top_lines_by_amount: Vec<ProcurementItem> =
        items.iter().filter(|i| i.amount_sar.is_some()).cloned().collect();
    top_lines_by_amount.sort_by(|a, b| {
        desc_amount(a.amount_sar.unwrap_or_default(), b.amount_sar.unwrap_or_default())
    });
    top_lines_by_amount.truncate(TOP_LINES);

    let (vendor_basket_totals, line_benchmarks) = match &config.basket {
        Some(basket) if !basket.is_empty() => (
            basket_totals(&items, basket, config.vat_rate),
            line_benchmarks(&items),
        ),
        _ => (Vec::new(), Vec::new()),
    };

    let highlights = highlights(&items, &totals_per_vendor, &spreads);
    ProcurementSummary {
        items,
        insights: ProcurementInsights {
            totals_per_vendor,
            top_lines_by_amount,
            spreads,
            vendor_basket_totals,
            line_benchmarks,
            highlights,
        },
    }
}
