//! End-to-end request handling: read, classify, optionally assist, reconcile.

use crate::classifier;
use crate::config::PipelineConfig;
use crate::diagnostics::{Diagnostics, DiagnosticsRecorder};
use crate::error::{IntakeError, Result};
use crate::insights::{VarianceInsights, WorkbookInsights};
use crate::llm::{assist, LlmClient};
use crate::procurement::ProcurementSummary;
use crate::readers::{self, ReadOutcome};
use crate::reconcile::{reconcile, ReconcileOutcome};
use crate::routing::{after_llm_failure, decide, RoutingDecision, RoutingInputs, Track};
use crate::schema::{
    CanonicalLineItem, CategoryMapEntry, ExtractionResult, RawSheet, SheetKind, VarianceItem,
    VendorMapEntry, Warning, WarningCode,
};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc::Sender;

#[derive(Debug, Clone)]
pub struct UploadedFile {
    pub name: String,
    pub bytes: Vec<u8>,
    pub content_type: Option<String>,
}

impl UploadedFile {
    pub fn new(name: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            bytes: bytes.into(),
            content_type: None,
        }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }
}

/// The four files of a structured upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StructuredRole {
    BudgetActuals,
    ChangeOrders,
    VendorMap,
    CategoryMap,
}

impl StructuredRole {
    pub const ALL: [StructuredRole; 4] = [
        StructuredRole::BudgetActuals,
        StructuredRole::ChangeOrders,
        StructuredRole::VendorMap,
        StructuredRole::CategoryMap,
    ];

    pub fn name(self) -> &'static str {
        match self {
            StructuredRole::BudgetActuals => "budget_actuals",
            StructuredRole::ChangeOrders => "change_orders",
            StructuredRole::VendorMap => "vendor_map",
            StructuredRole::CategoryMap => "category_map",
        }
    }

    pub fn kind(self) -> SheetKind {
        match self {
            StructuredRole::BudgetActuals => SheetKind::BudgetActual,
            StructuredRole::ChangeOrders => SheetKind::ChangeOrder,
            StructuredRole::VendorMap => SheetKind::VendorMap,
            StructuredRole::CategoryMap => SheetKind::CategoryMap,
        }
    }
}

/// One upload. Either the four role fields (structured) or `file` (freeform).
#[derive(Debug, Clone, Default)]
pub struct UploadRequest {
    pub budget_actuals: Option<UploadedFile>,
    pub change_orders: Option<UploadedFile>,
    pub vendor_map: Option<UploadedFile>,
    pub category_map: Option<UploadedFile>,
    pub file: Option<UploadedFile>,
    /// Body flag; skips the LLM path.
    pub local_only: bool,
    /// Transport headers, kept for logging only.
    pub headers: BTreeMap<String, String>,
}

impl UploadRequest {
    pub fn freeform(file: UploadedFile) -> Self {
        Self {
            file: Some(file),
            ..Self::default()
        }
    }

    pub fn structured(
        budget_actuals: UploadedFile,
        change_orders: UploadedFile,
        vendor_map: UploadedFile,
        category_map: UploadedFile,
    ) -> Self {
        Self {
            budget_actuals: Some(budget_actuals),
            change_orders: Some(change_orders),
            vendor_map: Some(vendor_map),
            category_map: Some(category_map),
            ..Self::default()
        }
    }

    fn role(&self, role: StructuredRole) -> Option<&UploadedFile> {
        match role {
            StructuredRole::BudgetActuals => self.budget_actuals.as_ref(),
            StructuredRole::ChangeOrders => self.change_orders.as_ref(),
            StructuredRole::VendorMap => self.vendor_map.as_ref(),
            StructuredRole::CategoryMap => self.category_map.as_ref(),
        }
    }

    pub fn track(&self) -> Result<Track> {
        let any_role = StructuredRole::ALL.iter().any(|r| self.role(*r).is_some());
        match (&self.file, any_role) {
            (Some(_), true) => Err(IntakeError::MixedTracks),
            (Some(_), false) => Ok(Track::Freeform),
            (None, true) => Ok(Track::Structured),
            (None, false) => Err(IntakeError::MissingRequiredSheet(
                "no file was uploaded".to_string(),
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PipelineEvent {
    Reading { file: String },
    Routing,
    Classifying { sheets: usize },
    Assisting { sheet: String },
    Reconciling,
    Done,
    Failed { reason: String },
}

impl PipelineEvent {
    pub fn stage(&self) -> &'static str {
        match self {
            PipelineEvent::Reading { .. } => "reading",
            PipelineEvent::Routing => "routing",
            PipelineEvent::Classifying { .. } => "classifying",
            PipelineEvent::Assisting { .. } => "assisting",
            PipelineEvent::Reconciling => "reconciling",
            PipelineEvent::Done => "done",
            PipelineEvent::Failed { .. } => "failed",
        }
    }
}

/// Serialises as `{"variance_items": [...]}`, `{"procurement_summary": {...}}`
/// or `{"insights": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineResult {
    VarianceItems(Vec<VarianceItem>),
    ProcurementSummary(ProcurementSummary),
    Insights(WorkbookInsights),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineResponse {
    #[serde(flatten)]
    pub result: PipelineResult,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variance_insights: Option<VarianceInsights>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub routing: Option<RoutingDecision>,
    pub diagnostics: Diagnostics,
}

#[derive(Debug, Error)]
#[error("{error}")]
pub struct PipelineFailure {
    pub error: IntakeError,
    pub diagnostics: Diagnostics,
}

impl PipelineFailure {
    pub fn code(&self) -> &'static str {
        self.error.code()
    }
}

struct Output {
    result: PipelineResult,
    variance_insights: Option<VarianceInsights>,
    routing: Option<RoutingDecision>,
}

async fn send_event(sender: &Option<Sender<PipelineEvent>>, event: PipelineEvent) {
    if let Some(tx) = sender {
        let _ = tx.send(event).await;
    }
}

pub struct Pipeline {
    config: PipelineConfig,
    client: Option<Arc<dyn LlmClient>>,
}

impl Pipeline {
    /// A pipeline without an LLM client; freeform requests route as if no key were set.
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            config,
            client: None,
        }
    }

    pub fn with_client(mut self, client: Arc<dyn LlmClient>) -> Self {
        self.client = Some(client);
        self
    }

    /// Validates the configuration and attaches an OpenAI client when a key is set.
    #[cfg(feature = "openai")]
    pub fn from_config(config: PipelineConfig) -> Result<Self> {
        config.validate()?;
        let pipeline = Self::new(config);
        if !pipeline.config.has_api_key() {
            return Ok(pipeline);
        }
        let client = crate::llm::OpenAiClient::from_config(&pipeline.config)?;
        Ok(pipeline.with_client(Arc::new(client)))
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub async fn run(
        &self,
        request: UploadRequest,
    ) -> std::result::Result<PipelineResponse, PipelineFailure> {
        self.run_with_progress(request, None).await
    }

    pub async fn run_with_progress(
        &self,
        request: UploadRequest,
        progress: Option<Sender<PipelineEvent>>,
    ) -> std::result::Result<PipelineResponse, PipelineFailure> {
        let mut recorder = DiagnosticsRecorder::new();
        info!("Pipeline run {} started", recorder.correlation_id());

        match self.execute(request, &progress, &mut recorder).await {
            Ok(output) => {
                send_event(&progress, PipelineEvent::Done).await;
                let diagnostics = recorder.finish();
                info!(
                    "Pipeline run {} finished in {} ms",
                    diagnostics.correlation_id, diagnostics.duration_ms
                );
                debug!("Diagnostics: {}", diagnostics.to_json());
                Ok(PipelineResponse {
                    result: output.result,
                    variance_insights: output.variance_insights,
                    routing: output.routing,
                    diagnostics,
                })
            }
            Err(error) => {
                warn!("Pipeline run {} failed: {}", recorder.correlation_id(), error);
                send_event(
                    &progress,
                    PipelineEvent::Failed {
                        reason: error.to_string(),
                    },
                )
                .await;
                let diagnostics = recorder.finish();
                debug!("Diagnostics: {}", diagnostics.to_json());
                Err(PipelineFailure { error, diagnostics })
            }
        }
    }

    async fn execute(
        &self,
        request: UploadRequest,
        progress: &Option<Sender<PipelineEvent>>,
        recorder: &mut DiagnosticsRecorder,
    ) -> Result<Output> {
        match request.track()? {
            Track::Structured => self.run_structured(request, progress, recorder).await,
            Track::Freeform => self.run_freeform(request, progress, recorder).await,
        }
    }

    async fn read_file(
        &self,
        file: UploadedFile,
        progress: &Option<Sender<PipelineEvent>>,
        recorder: &mut DiagnosticsRecorder,
    ) -> Result<ReadOutcome> {
        send_event(
            progress,
            PipelineEvent::Reading {
                file: file.name.clone(),
            },
        )
        .await;
        let outcome = recorder
            .time_async(
                "read",
                readers::read_bounded(
                    file.name,
                    file.bytes,
                    file.content_type,
                    self.config.pdf_budget(),
                ),
            )
            .await?;
        recorder.extend(outcome.warnings.iter().cloned());
        Ok(outcome)
    }

    async fn run_structured(
        &self,
        mut request: UploadRequest,
        progress: &Option<Sender<PipelineEvent>>,
        recorder: &mut DiagnosticsRecorder,
    ) -> Result<Output> {
        let missing: Vec<&str> = StructuredRole::ALL
            .iter()
            .filter(|r| request.role(**r).is_none())
            .map(|r| r.name())
            .collect();
        if !missing.is_empty() {
            return Err(IntakeError::MissingRequiredSheet(missing.join(", ")));
        }

        let mut sheets: Vec<RawSheet> = Vec::new();
        let mut results: Vec<ExtractionResult> = Vec::new();
        let mut vendor_map: Vec<VendorMapEntry> = Vec::new();
        let mut category_map: Vec<CategoryMapEntry> = Vec::new();

        for role in StructuredRole::ALL {
            let file = match role {
                StructuredRole::BudgetActuals => request.budget_actuals.take(),
                StructuredRole::ChangeOrders => request.change_orders.take(),
                StructuredRole::VendorMap => request.vendor_map.take(),
                StructuredRole::CategoryMap => request.category_map.take(),
            }
            .ok_or_else(|| IntakeError::MissingRequiredSheet(role.name().to_string()))?;
            let file_name = file.name.clone();
            let outcome = self.read_file(file, progress, recorder).await?;

            send_event(
                progress,
                PipelineEvent::Classifying {
                    sheets: outcome.sheets.len(),
                },
            )
            .await;
            let config = &self.config;
            let extracted: Vec<ExtractionResult> = recorder.time("classify", || {
                outcome
                    .sheets
                    .iter()
                    .map(|s| classifier::extract_as(s, role.kind(), config))
                    .filter(|r| r.kind == role.kind())
                    .collect()
            });
            if extracted.is_empty() {
                return Err(IntakeError::MissingRequiredSheet(format!(
                    "{} ('{}' has no sheet with a {} header)",
                    role.name(),
                    file_name,
                    role.kind()
                )));
            }

            for result in extracted {
                recorder.extend(result.warnings.iter().cloned());
                match role {
                    StructuredRole::VendorMap => vendor_map.extend(result.items.into_iter().filter_map(
                        |i| match i {
                            CanonicalLineItem::VendorMap(v) => Some(v),
                            _ => None,
                        },
                    )),
                    StructuredRole::CategoryMap => category_map.extend(
                        result.items.into_iter().filter_map(|i| match i {
                            CanonicalLineItem::CategoryMap(c) => Some(c),
                            _ => None,
                        }),
                    ),
                    StructuredRole::BudgetActuals | StructuredRole::ChangeOrders => {
                        results.push(result)
                    }
                }
            }
            sheets.extend(outcome.sheets);
        }

        send_event(progress, PipelineEvent::Reconciling).await;
        let config = &self.config;
        let reconciled = recorder.time("reconcile", || {
            reconcile(&results, &vendor_map, &category_map, &sheets, config)
        });
        recorder.extend(reconciled.warnings);
        Ok(into_output(reconciled.outcome, None))
    }

    async fn run_freeform(
        &self,
        mut request: UploadRequest,
        progress: &Option<Sender<PipelineEvent>>,
        recorder: &mut DiagnosticsRecorder,
    ) -> Result<Output> {
        send_event(progress, PipelineEvent::Routing).await;
        let inputs = RoutingInputs {
            has_api_key: self.client.is_some(),
            ..RoutingInputs::from_request(Track::Freeform, &request, &self.config)
        };
        let mut decision = decide(&inputs)?;
        info!("Routing: use_llm={} ({:?})", decision.use_llm, decision.reason);

        let file = request
            .file
            .take()
            .ok_or_else(|| IntakeError::MissingRequiredSheet("file".to_string()))?;
        let outcome = self.read_file(file, progress, recorder).await?;

        send_event(
            progress,
            PipelineEvent::Classifying {
                sheets: outcome.sheets.len(),
            },
        )
        .await;
        let config = &self.config;
        let mut results: Vec<ExtractionResult> = recorder.time("classify", || {
            outcome
                .sheets
                .iter()
                .map(|s| classifier::classify(s, config))
                .collect()
        });

        for (sheet, result) in outcome.sheets.iter().zip(results.iter_mut()) {
            let weak = result.kind == SheetKind::Unrecognized
                || result.confidence < self.config.low_confidence_threshold;
            if !weak || sheet.is_empty() || !decision.use_llm {
                continue;
            }
            let Some(client) = self.client.as_deref() else {
                break;
            };

            send_event(
                progress,
                PipelineEvent::Assisting {
                    sheet: sheet.origin().label(),
                },
            )
            .await;
            match recorder
                .time_async("assist", assist(client, sheet, result, &self.config))
                .await
            {
                Ok(assisted) => *result = assisted,
                Err(error) => {
                    let code = error.code();
                    decision = after_llm_failure(&decision, self.config.fallback_policy, error)?;
                    recorder.warn(
                        Warning::new(
                            WarningCode::LlmFallback,
                            format!(
                                "LLM-assisted extraction failed ({}); continuing with rule-based results",
                                code
                            ),
                        )
                        .at(sheet.origin().label()),
                    );
                }
            }
        }

        for result in &results {
            recorder.extend(result.warnings.iter().cloned());
        }

        send_event(progress, PipelineEvent::Reconciling).await;
        let reconciled = recorder.time("reconcile", || {
            reconcile(&results, &[], &[], &outcome.sheets, config)
        });
        recorder.extend(reconciled.warnings);
        Ok(into_output(reconciled.outcome, Some(decision)))
    }
}

fn into_output(outcome: ReconcileOutcome, routing: Option<RoutingDecision>) -> Output {
    match outcome {
        ReconcileOutcome::Variance(report) => Output {
            result: PipelineResult::VarianceItems(report.items),
            variance_insights: Some(report.insights),
            routing,
        },
        ReconcileOutcome::Procurement(summary) => Output {
            result: PipelineResult::ProcurementSummary(summary),
            variance_insights: None,
            routing,
        },
        ReconcileOutcome::Insights(insights) => Output {
            result: PipelineResult::Insights(insights),
            variance_insights: None,
            routing,
        },
    }
}
