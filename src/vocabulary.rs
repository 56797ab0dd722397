//! Canonical header vocabularies and fuzzy header-cell matching.

use crate::schema::SheetKind;
use crate::utils::normalize_label;
use std::collections::HashMap;
use std::sync::LazyLock;
use strsim::jaro_winkler;

const FUZZY_THRESHOLD: f64 = 0.92;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Field {
    Project,
    Period,
    Date,
    Category,
    CostCode,
    Budget,
    Actual,
    Variance,
    Currency,
    Remarks,
    CoId,
    Amount,
    Description,
    LinkedCostCode,
    FileLink,
    Vendor,
    VendorAlias,
    CanonicalVendor,
    Trade,
    ContractId,
    RawLabel,
    CanonicalCategory,
    ItemCode,
    Qty,
    Unit,
    UnitPrice,
}

const SYNONYMS: &[(Field, &[&str])] = &[
    (
        Field::Project,
        &[
            "project", "project id", "project code", "project no", "project name", "job",
            "job no", "job code", "site", "المشروع",
        ],
    ),
    (
        Field::Period,
        &[
            "period", "period yyyy mm", "month", "reporting period", "fiscal period",
            "reporting month", "الفترة", "الشهر",
        ],
    ),
    (
        Field::Date,
        &[
            "date", "date yyyy mm dd", "doc date", "document date", "quote date", "co date",
            "approval date", "approved date", "invoice date", "التاريخ",
        ],
    ),
    (Field::Category, &["category", "cost category", "الفئة", "التصنيف"]),
    (
        Field::CostCode,
        &[
            "cost code", "costcode", "gl", "gl code", "gl account", "account", "account code",
            "wbs", "wbs code", "cost centre", "cost center", "رمز التكلفة",
        ],
    ),
    (
        Field::Budget,
        &[
            "budget", "budget sar", "budgeted", "budget amount", "approved budget", "planned",
            "plan", "planned cost", "original budget", "الميزانية", "الموازنة",
        ],
    ),
    (
        Field::Actual,
        &[
            "actual", "actual sar", "actuals", "actual cost", "actual amount", "spent",
            "cost to date", "ctd", "actual to date", "الفعلي", "المصروف",
        ],
    ),
    (
        Field::Variance,
        &["variance", "variance sar", "var", "difference", "over under", "الانحراف"],
    ),
    (Field::Currency, &["currency", "ccy", "العملة"]),
    (Field::Remarks, &["remarks", "notes", "comments", "comment", "ملاحظات"]),
    (
        Field::CoId,
        &[
            "co id", "co", "co no", "co number", "change order", "change order id",
            "change order no", "variation no", "vo no", "vo",
        ],
    ),
    (
        Field::Amount,
        &[
            "amount", "amount sar", "value", "co amount", "co amount sar", "total", "total sar",
            "total price", "total price sar", "line total", "extended price", "net amount",
            "المبلغ", "الإجمالي",
        ],
    ),
    (
        Field::Description,
        &[
            "description", "desc", "scope", "item description", "description of works", "details",
            "particulars",
            "الوصف", "البيان",
        ],
    ),
    (Field::LinkedCostCode, &["linked cost code", "cost code link", "related cost code"]),
    (
        Field::FileLink,
        &["file link", "link", "attachment", "document link", "evidence", "file"],
    ),
    (
        Field::Vendor,
        &[
            "vendor", "vendor name", "supplier", "supplier name", "contractor", "subcontractor",
            "bidder", "المورد", "المقاول",
        ],
    ),
    (
        Field::VendorAlias,
        &["raw name", "raw vendor", "alias", "vendor alias", "source vendor", "vendor as billed"],
    ),
    (
        Field::CanonicalVendor,
        &[
            "canonical vendor", "canonical name", "normalized vendor", "mapped vendor",
            "standard vendor", "master vendor",
        ],
    ),
    (Field::Trade, &["trade", "discipline", "package"]),
    (
        Field::ContractId,
        &["contract id", "contract", "contract no", "po", "po no", "po number"],
    ),
    (
        Field::RawLabel,
        &["raw label", "label", "source label", "raw category", "account name", "original label"],
    ),
    (
        Field::CanonicalCategory,
        &["canonical category", "mapped category", "standard category", "master category"],
    ),
    (
        Field::ItemCode,
        &[
            "item", "item code", "item no", "item number", "code", "sku", "part no", "ref", "door id",
            "رمز البند", "البند",
        ],
    ),
    (
        Field::Qty,
        &["qty", "quantity", "no of doors", "nos", "count", "الكمية"],
    ),
    (Field::Unit, &["unit", "uom", "unit of measure", "الوحدة"]),
    (
        Field::UnitPrice,
        &[
            "unit price", "unit price sar", "unit rate", "unit rate sar", "rate", "price",
            "unit cost", "price per unit", "سعر الوحدة",
        ],
    ),
];

static EXACT: LazyLock<HashMap<&'static str, Field>> = LazyLock::new(|| {
    SYNONYMS
        .iter()
        .flat_map(|(field, words)| words.iter().map(move |w| (*w, *field)))
        .collect()
});

const TRAILING_NOISE: [&str; 6] = ["sar", "sr", "riyal", "usd", "amount", "value"];

fn strip_noise(label: &str) -> Option<String> {
    let mut tokens: Vec<&str> = label.split_whitespace().collect();
    let original = tokens.len();
    while tokens.len() > 1 {
        match tokens.last() {
            Some(t) if TRAILING_NOISE.contains(t) || t.chars().all(|c| c.is_ascii_digit()) => {
                tokens.pop();
            }
            _ => break,
        }
    }
    (tokens.len() < original).then(|| tokens.join(" "))
}

/// Maps a header cell to a canonical field: exact synonym, then the synonym with
/// trailing currency/year tokens removed, then a Jaro-Winkler fuzzy match.
pub fn match_header(raw: &str) -> Option<Field> {
    let label = normalize_label(raw);
    if label.is_empty() {
        return None;
    }
    if let Some(field) = EXACT.get(label.as_str()) {
        return Some(*field);
    }
    if let Some(field) = strip_noise(&label).and_then(|l| EXACT.get(l.as_str()).copied()) {
        return Some(field);
    }
    if label.chars().count() < 4 {
        return None;
    }

    let mut best: Option<(f64, Field)> = None;
    for (field, words) in SYNONYMS {
        for word in words.iter().filter(|w| w.chars().count() >= 4) {
            let score = jaro_winkler(&label, word);
            if score >= FUZZY_THRESHOLD && best.map_or(true, |(s, _)| score > s) {
                best = Some((score, *field));
            }
        }
    }
    best.map(|(_, f)| f)
}

/// Column layout required and accepted for one sheet kind.
#[derive(Debug)]
pub struct Vocabulary {
    pub kind: SheetKind,
    /// Every group must be satisfied by at least one of its fields.
    pub required: &'static [&'static [Field]],
    pub optional: &'static [Field],
}

impl Vocabulary {
    pub fn accepts(&self, field: Field) -> bool {
        self.optional.contains(&field) || self.required.iter().any(|g| g.contains(&field))
    }

    pub fn satisfied_by(&self, fields: &[Field]) -> bool {
        self.required
            .iter()
            .all(|group| group.iter().any(|f| fields.contains(f)))
    }
}

/// Ordered so that equal scores resolve in favour of the earlier entry.
pub static VOCABULARIES: &[Vocabulary] = &[
    Vocabulary {
        kind: SheetKind::BudgetActual,
        required: &[&[Field::Budget], &[Field::Actual]],
        optional: &[
            Field::Project,
            Field::Period,
            Field::Date,
            Field::Category,
            Field::CostCode,
            Field::Variance,
            Field::Currency,
            Field::Remarks,
            Field::Description,
        ],
    },
    Vocabulary {
        kind: SheetKind::Procurement,
        required: &[
            &[Field::UnitPrice, Field::Qty, Field::ItemCode, Field::Vendor],
            &[Field::UnitPrice, Field::Amount],
            &[Field::Description, Field::ItemCode],
        ],
        optional: &[
            Field::Vendor,
            Field::Qty,
            Field::Unit,
            Field::Date,
            Field::Currency,
            Field::Remarks,
            Field::Project,
            Field::Trade,
        ],
    },
    Vocabulary {
        kind: SheetKind::ChangeOrder,
        required: &[&[Field::CoId, Field::LinkedCostCode], &[Field::Amount]],
        optional: &[
            Field::Project,
            Field::Period,
            Field::Date,
            Field::Category,
            Field::CostCode,
            Field::Description,
            Field::FileLink,
            Field::Currency,
            Field::Remarks,
        ],
    },
    Vocabulary {
        kind: SheetKind::VendorMap,
        required: &[
            &[Field::Vendor],
            &[Field::CanonicalVendor, Field::VendorAlias, Field::CostCode],
        ],
        optional: &[Field::Project, Field::Trade, Field::ContractId, Field::Remarks],
    },
    Vocabulary {
        kind: SheetKind::CategoryMap,
        required: &[
            &[Field::Category, Field::CanonicalCategory],
            &[Field::CostCode, Field::RawLabel],
        ],
        optional: &[Field::Description, Field::Remarks],
    },
];

pub fn vocabulary_for(kind: SheetKind) -> Option<&'static Vocabulary> {
    VOCABULARIES.iter().find(|v| v.kind == kind)
}
