use crate::config::PipelineConfig;
use crate::error::{IntakeError, Result};
use crate::llm::grounding::verify_grounding;
use crate::llm::prompts::{build_assist_prompt, SYSTEM_PROMPT_ASSIST};
use crate::llm::retry::call_with_retry;
use crate::llm::types::AssistResponse;
use crate::llm::utils::clean_json_output;
use crate::llm::{CompletionRequest, LlmClient};
use crate::schema::{ExtractionResult, RawSheet, SheetKind};
use log::{debug, info};

/// Confidence given to a grounded assisted result with at least one item.
const ASSISTED_CONFIDENCE: f64 = 0.8;

/// Asks the model to lift records from a sheet the rule-based pass could not
/// handle, then keeps only values that trace back to the grid.
///
/// Returns a new result; `partial` is left untouched. Transport failures,
/// timeouts and unparseable replies come back as errors so the caller can apply
/// its fallback policy.
pub async fn assist(
    client: &dyn LlmClient,
    sheet: &RawSheet,
    partial: &ExtractionResult,
    config: &PipelineConfig,
) -> Result<ExtractionResult> {
    let label = sheet.origin().label();
    info!("LLM-assisted extraction for {}", label);

    let (user_prompt, truncation) = build_assist_prompt(sheet, partial, config)?;
    let request = CompletionRequest::json(SYSTEM_PROMPT_ASSIST, user_prompt);
    let raw = call_with_retry(client, request, config).await?;

    let response: AssistResponse = serde_json::from_str(clean_json_output(&raw))
        .map_err(|e| IntakeError::InvalidLlmResponse(format!("{} ({})", e, label)))?;
    let kind: SheetKind = response.kind.into();
    let returned = response.items.len();

    let (items, grounding_warnings) = verify_grounding(sheet, response);
    debug!(
        "{}: model returned {} record(s) as {}, {} survived grounding",
        label,
        returned,
        kind,
        items.len()
    );

    let mut warnings = partial.warnings.clone();
    warnings.extend(truncation);
    warnings.extend(grounding_warnings);

    if items.is_empty() {
        return Ok(ExtractionResult {
            warnings,
            ..partial.clone()
        });
    }

    Ok(ExtractionResult {
        origin: sheet.origin().clone(),
        kind,
        confidence: ASSISTED_CONFIDENCE,
        header_row: None,
        items,
        warnings,
        assisted: true,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{CellValue, OriginKind, SheetOrigin, WarningCode};
    use futures::future::BoxFuture;
    use futures::FutureExt;

    struct Scripted(&'static str);

    impl LlmClient for Scripted {
        fn complete(&self, _request: CompletionRequest) -> BoxFuture<'_, Result<String>> {
            let reply = self.0.to_string();
            async move { Ok(reply) }.boxed()
        }
    }

    fn sheet() -> RawSheet {
        RawSheet::new(
            SheetOrigin::new("memo.txt", "text", 0, OriginKind::Text),
            vec![
                vec![CellValue::text("Cost review for Tower A, March 2024")],
                vec![CellValue::text("Facade: budget 500,000 and actual 620,000")],
            ],
        )
    }

    #[tokio::test]
    async fn test_assist_keeps_grounded_items() {
        let client = Scripted(
            r#"```json
            {"kind": "budget_actual", "items": [
              {"row": 2, "project": "Tower A", "period": "2024-03", "category": "Facade",
               "budget_sar": 500000, "actual_sar": 620000},
              {"row": 2, "category": "Roofing", "budget_sar": 90000, "actual_sar": 95000}
            ]}
            ```"#,
        );
        let partial = ExtractionResult::unrecognized(sheet().origin().clone(), Vec::new());
        let result = assist(&client, &sheet(), &partial, &PipelineConfig::default())
            .await
            .unwrap();

        assert!(result.assisted);
        assert_eq!(result.kind, SheetKind::BudgetActual);
        assert_eq!(result.items.len(), 1);
        let item = result.variance_items().next().unwrap();
        assert_eq!(item.variance_sar, 120_000.0);
        assert!(result
            .warnings
            .iter()
            .any(|w| w.code == WarningCode::UngroundedValueDiscarded));
    }

    #[tokio::test]
    async fn test_unparseable_reply_is_an_error() {
        let partial = ExtractionResult::unrecognized(sheet().origin().clone(), Vec::new());
        let err = assist(
            &Scripted("I cannot help with that."),
            &sheet(),
            &partial,
            &PipelineConfig::default(),
        )
        .await
        .unwrap_err();
        assert_eq!(err.code(), "invalid_llm_response");
    }

    #[tokio::test]
    async fn test_nothing_grounded_keeps_partial() {
        let partial = ExtractionResult::unrecognized(sheet().origin().clone(), Vec::new());
        let result = assist(
            &Scripted(r#"{"kind": "procurement", "items": [{"item_code": "X9", "unit_price_sar": 77}]}"#),
            &sheet(),
            &partial,
            &PipelineConfig::default(),
        )
        .await
        .unwrap();
        assert_eq!(result.kind, SheetKind::Unrecognized);
        assert!(!result.assisted);
        assert!(!result.warnings.is_empty());
    }
}
