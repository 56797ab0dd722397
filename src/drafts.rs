//! Investor-facing variance narratives and procurement cards.
//!
//! Narratives use only the drivers, vendors and amounts already on the
//! [`VarianceItem`]; a line with no drivers says the cause is pending review
//! instead of guessing one.

use crate::config::PipelineConfig;
use crate::llm::prompts::{build_draft_prompt, SYSTEM_PROMPT_DRAFT};
use crate::llm::utils::strip_markdown_noise;
use crate::llm::{call_with_retry, CompletionRequest, LlmClient};
use crate::schema::{ProcurementItem, VarianceItem, VarianceKey};
use crate::utils::format_amount;
use futures::future::BoxFuture;
use futures::FutureExt;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub const CAUSE_PENDING_EN: &str = "Cause pending analyst review.";
pub const CAUSE_PENDING_AR: &str = "السبب قيد المراجعة من قبل المحلل.";

const CLOSING_EN: &str =
    "Impact remains contained within management oversight; corrective actions are in progress if required.";
const CLOSING_AR: &str =
    "يبقى الأثر ضمن نطاق المتابعة الإدارية، وسيتم اتخاذ الإجراءات التصحيحية عند الحاجة.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DraftSource {
    Local,
    Llm,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Draft {
    #[serde(flatten)]
    pub key: VarianceKey,
    pub draft_en: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub draft_ar: Option<String>,
    pub source: DraftSource,
}

pub trait DraftComposer: Send + Sync {
    fn compose<'a>(&'a self, item: &'a VarianceItem) -> BoxFuture<'a, Draft>;
}

/// Drafts every material line, in input order.
pub async fn draft_material(composer: &dyn DraftComposer, items: &[VarianceItem]) -> Vec<Draft> {
    let mut drafts = Vec::new();
    for item in items.iter().filter(|i| i.material) {
        drafts.push(composer.compose(item).await);
    }
    debug!("Drafted {} of {} line(s)", drafts.len(), items.len());
    drafts
}

/// Template narratives, no model involved.
#[derive(Debug, Clone, Copy)]
pub struct LocalDraftComposer {
    pub bilingual: bool,
}

impl LocalDraftComposer {
    pub fn new(bilingual: bool) -> Self {
        Self { bilingual }
    }

    pub fn english(&self, item: &VarianceItem) -> String {
        let amount = format_amount(item.variance_sar.abs(), 0);
        let mut text = match item.variance_pct {
            Some(pct) => format!("{:.2}% (SAR {}) variance in {}. ", pct, amount, item.category),
            None => format!(
                "SAR {} variance against a zero budget in {}. ",
                amount, item.category
            ),
        };
        if item.drivers.is_empty() {
            text.push_str(CAUSE_PENDING_EN);
            text.push(' ');
        } else {
            text.push_str(&format!("Drivers: {}. ", item.drivers.join("; ")));
        }
        if !item.vendors.is_empty() {
            text.push_str(&format!("Vendors: {}. ", item.vendors.join("; ")));
        }
        text.push_str(CLOSING_EN);
        text
    }

    pub fn arabic(&self, item: &VarianceItem) -> String {
        let amount = format_amount(item.variance_sar.abs(), 0);
        let mut text = match item.variance_pct {
            Some(pct) => format!(
                "تفاوت بنسبة {:.2}% (بقيمة {} ريال) في فئة {}. ",
                pct, amount, item.category
            ),
            None => format!(
                "تفاوت بقيمة {} ريال مقابل ميزانية صفرية في فئة {}. ",
                amount, item.category
            ),
        };
        if item.drivers.is_empty() {
            text.push_str(CAUSE_PENDING_AR);
            text.push(' ');
        } else {
            text.push_str(&format!("الأسباب: {}. ", item.drivers.join("؛ ")));
        }
        if !item.vendors.is_empty() {
            text.push_str(&format!("الموردون: {}. ", item.vendors.join("؛ ")));
        }
        text.push_str(CLOSING_AR);
        text
    }

    pub fn draft(&self, item: &VarianceItem) -> Draft {
        Draft {
            key: item.key(),
            draft_en: self.english(item),
            draft_ar: self.bilingual.then(|| self.arabic(item)),
            source: DraftSource::Local,
        }
    }
}

impl DraftComposer for LocalDraftComposer {
    fn compose<'a>(&'a self, item: &'a VarianceItem) -> BoxFuture<'a, Draft> {
        let draft = self.draft(item);
        async move { draft }.boxed()
    }
}

/// Model-written narratives. Lines without drivers, any failure, or an empty
/// reply yield the local draft.
pub struct LlmDraftComposer {
    client: Arc<dyn LlmClient>,
    config: PipelineConfig,
    local: LocalDraftComposer,
}

impl LlmDraftComposer {
    pub fn new(client: Arc<dyn LlmClient>, config: PipelineConfig) -> Self {
        let local = LocalDraftComposer::new(config.bilingual);
        Self {
            client,
            config,
            local,
        }
    }

    async fn draft(&self, item: &VarianceItem) -> Draft {
        if item.drivers.is_empty() {
            debug!(
                "No drivers for {}/{}/{}; using the pending-review template",
                item.project, item.period, item.category
            );
            return self.local.draft(item);
        }
        let request = CompletionRequest::text(
            SYSTEM_PROMPT_DRAFT,
            build_draft_prompt(item, self.config.bilingual),
        );
        let text = match call_with_retry(self.client.as_ref(), request, &self.config).await {
            Ok(text) => strip_markdown_noise(&text),
            Err(e) => {
                warn!(
                    "Draft for {}/{}/{} fell back to the template: {}",
                    item.project, item.period, item.category, e
                );
                return self.local.draft(item);
            }
        };
        if text.is_empty() {
            return self.local.draft(item);
        }

        let (en, ar) = match text.split_once("\n\n") {
            Some((en, ar)) if self.config.bilingual => (en.trim().to_string(), Some(ar.trim().to_string())),
            _ => (text, None),
        };
        Draft {
            key: item.key(),
            draft_en: en,
            draft_ar: ar.filter(|a| !a.is_empty()),
            source: DraftSource::Llm,
        }
    }
}

impl DraftComposer for LlmDraftComposer {
    fn compose<'a>(&'a self, item: &'a VarianceItem) -> BoxFuture<'a, Draft> {
        self.draft(item).boxed()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcurementCard {
    pub title: String,
    pub body_en: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body_ar: Option<String>,
    pub source: String,
}

const CARD_SOURCE: &str = "Uploaded procurement file";

/// One card per quoted line, with an Arabic body when `bilingual` is set.
pub fn procurement_cards(items: &[ProcurementItem], bilingual: bool) -> Vec<ProcurementCard> {
    let mut cards: Vec<ProcurementCard> = items
        .iter()
        .map(|item| {
            let headline = item.amount_sar.or(item.unit_price_sar);
            let title = match headline {
                Some(value) => format!(
                    "{}: SAR {}",
                    item.item_code.as_deref().unwrap_or("Item"),
                    format_amount(value, 2)
                ),
                None => item.item_code.clone().unwrap_or_else(|| "Item".to_string()),
            };

            let mut en = Vec::new();
            let mut ar = Vec::new();
            if let Some(vendor) = &item.vendor {
                en.push(format!("Vendor: {}", vendor));
                ar.push(format!("المورّد: {}", vendor));
            }
            if let Some(date) = &item.doc_date {
                en.push(format!("Document date: {}", date));
                ar.push(format!("تاريخ المستند: {}", date));
            }
            if let Some(qty) = item.qty {
                en.push(format!("Qty: {}", qty));
                ar.push(format!("الكمية: {}", qty));
            }
            if let Some(price) = item.unit_price_sar {
                en.push(format!("Unit price: SAR {}", format_amount(price, 2)));
                ar.push(format!("سعر الوحدة: {} ر.س", format_amount(price, 2)));
            }
            if let Some(amount) = item.amount_sar {
                en.push(format!("Line amount: SAR {}", format_amount(amount, 2)));
                ar.push(format!("قيمة البند: {} ر.س", format_amount(amount, 2)));
            }

            ProcurementCard {
                title,
                body_en: if en.is_empty() {
                    "No details found in the document.".to_string()
                } else {
                    en.join(" · ")
                },
                body_ar: (bilingual && !ar.is_empty()).then(|| ar.join(" · ")),
                source: CARD_SOURCE.to_string(),
            }
        })
        .collect();

    if cards.is_empty() {
        cards.push(ProcurementCard {
            title: "Summary".to_string(),
            body_en: "No structured line items were found.".to_string(),
            body_ar: None,
            source: CARD_SOURCE.to_string(),
        });
    }
    cards
}
