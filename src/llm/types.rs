use crate::schema::SheetKind;
use crate::utils::parse_amount;
use schemars::JsonSchema;
use serde::{Deserialize, Deserializer, Serialize};

/// Sheet shapes the model may report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum AssistKind {
    BudgetActual,
    Procurement,
    ChangeOrder,
    Unrecognized,
}

impl From<AssistKind> for SheetKind {
    fn from(kind: AssistKind) -> Self {
        match kind {
            AssistKind::BudgetActual => SheetKind::BudgetActual,
            AssistKind::Procurement => SheetKind::Procurement,
            AssistKind::ChangeOrder => SheetKind::ChangeOrder,
            AssistKind::Unrecognized => SheetKind::Unrecognized,
        }
    }
}

/// Structured reply expected from the assisted extractor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct AssistResponse {
    pub kind: AssistKind,
    #[serde(default)]
    pub items: Vec<AssistItem>,
}

/// One record copied from the grid. Only the fields that match `kind` are filled.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct AssistItem {
    /// Row number exactly as shown in the grid listing (R1 is the first row).
    #[serde(default)]
    pub row: Option<usize>,
    #[serde(default)]
    pub project: Option<String>,
    #[serde(default)]
    pub period: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub cost_code: Option<String>,
    #[serde(default, deserialize_with = "lenient_number")]
    #[schemars(with = "Option<f64>")]
    pub budget_sar: Option<f64>,
    #[serde(default, deserialize_with = "lenient_number")]
    #[schemars(with = "Option<f64>")]
    pub actual_sar: Option<f64>,
    #[serde(default)]
    pub co_id: Option<String>,
    #[serde(default)]
    pub item_code: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub vendor: Option<String>,
    #[serde(default, deserialize_with = "lenient_number")]
    #[schemars(with = "Option<f64>")]
    pub qty: Option<f64>,
    #[serde(default)]
    pub unit: Option<String>,
    #[serde(default, deserialize_with = "lenient_number")]
    #[schemars(with = "Option<f64>")]
    pub unit_price_sar: Option<f64>,
    #[serde(default, deserialize_with = "lenient_number")]
    #[schemars(with = "Option<f64>")]
    pub amount_sar: Option<f64>,
    #[serde(default)]
    pub doc_date: Option<String>,
}

/// Models sometimes quote numbers ("1,200.00"); accept both forms.
fn lenient_number<'de, D>(deserializer: D) -> std::result::Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(f64),
        Text(String),
    }

    Ok(match Option::<Raw>::deserialize(deserializer)? {
        Some(Raw::Number(n)) => Some(n),
        Some(Raw::Text(s)) => parse_amount(&s),
        None => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parses_quoted_numbers() {
        let response: AssistResponse = serde_json::from_str(
            r#"{"kind": "procurement", "items": [
                {"row": 3, "item_code": "D01", "unit_price_sar": "1,200.00", "qty": 4, "amount_sar": null}
            ]}"#,
        )
        .unwrap();
        assert_eq!(response.kind, AssistKind::Procurement);
        let item = &response.items[0];
        assert_eq!(item.unit_price_sar, Some(1200.0));
        assert_eq!(item.qty, Some(4.0));
        assert_eq!(item.amount_sar, None);
        assert_eq!(item.vendor, None);
    }
}
