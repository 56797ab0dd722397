//! # Variance Intake
//!
//! Turns monthly financial uploads into canonical, evidence-backed results.
//!
//! ## Core Concepts
//!
//! - **Structured track**: four role files (budget/actuals, change orders, vendor map,
//!   category map) reconciled into variance line items
//! - **Freeform track**: one file of unknown shape (CSV, Excel, DOCX, PDF, text),
//!   classified by its headers and optionally assisted by an LLM
//! - **Evidence**: every number on a line item points back to the cells it came from;
//!   values the model returns that are not in the grid are discarded
//! - **Fallback**: when neither variance nor procurement lines are found the result
//!   degrades to sheet-level workbook insights, never to an empty response
//!
//! ## Example
//!
//! ```rust,ignore
//! use variance_intake::*;
//!
//! let config = PipelineConfig::from_env()?;
//! let request = UploadRequest::freeform(UploadedFile::new("quotes.xlsx", bytes));
//!
//! let response = process_upload(config, request).await?;
//! match response.result {
//!     PipelineResult::VarianceItems(items) => println!("{} variance lines", items.len()),
//!     PipelineResult::ProcurementSummary(summary) => println!("{:?}", summary.insights.highlights),
//!     PipelineResult::Insights(insights) => println!("{:?}", insights.highlights),
//! }
//! ```

pub mod classifier;
pub mod config;
pub mod diagnostics;
pub mod drafts;
pub mod error;
pub mod insights;
pub mod jobs;
pub mod llm;
pub mod pipeline;
pub mod procurement;
pub mod readers;
pub mod reconcile;
pub mod routing;
pub mod schema;
pub mod utils;
pub mod vocabulary;

pub use classifier::{classify, extract_as};
pub use config::{Backoff, FallbackPolicy, PipelineConfig};
pub use diagnostics::{Diagnostics, DiagnosticsRecorder};
pub use drafts::{
    procurement_cards, Draft, DraftComposer, DraftSource, LlmDraftComposer, LocalDraftComposer,
    ProcurementCard,
};
pub use error::{IntakeError, Result};
pub use insights::{VarianceInsights, WorkbookInsights};
pub use jobs::{JobState, JobStatus, JobStore};
pub use llm::{CompletionRequest, LlmClient};
pub use pipeline::{
    Pipeline, PipelineEvent, PipelineFailure, PipelineResponse, PipelineResult, UploadRequest,
    UploadedFile,
};
pub use procurement::{ProcurementSummary, SpreadRow, VendorAggregate};
pub use readers::{read, ReadOutcome};
pub use reconcile::{reconcile, ReconcileOutcome, Reconciled, VarianceReport};
pub use routing::{decide, RoutingDecision, RoutingInputs, RoutingReason, Track};
pub use schema::*;

/// Runs one upload with a pipeline built from `config`.
///
/// With the `openai` feature an OpenAI client is attached when a key is
/// configured; without it freeform uploads always take the local path.
pub async fn process_upload(
    config: PipelineConfig,
    request: UploadRequest,
) -> std::result::Result<PipelineResponse, PipelineFailure> {
    let pipeline = build_pipeline(config).map_err(|error| PipelineFailure {
        error,
        diagnostics: Diagnostics::empty(),
    })?;
    pipeline.run(request).await
}

#[cfg(feature = "openai")]
fn build_pipeline(config: PipelineConfig) -> Result<Pipeline> {
    Pipeline::from_config(config)
}

#[cfg(not(feature = "openai"))]
fn build_pipeline(config: PipelineConfig) -> Result<Pipeline> {
    config.validate()?;
    Ok(Pipeline::new(config))
}
