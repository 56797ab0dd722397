use crate::config::PipelineConfig;
use crate::error::{IntakeError, Result};
use crate::llm::{CompletionRequest, LlmClient};
use log::{debug, warn};
use tokio::time::{sleep, timeout};

/// Calls the model with a per-attempt timeout, retrying transport failures and
/// timeouts up to `llm_max_retries` times with the configured backoff.
///
/// Configuration errors are returned immediately.
pub async fn call_with_retry(
    client: &dyn LlmClient,
    request: CompletionRequest,
    config: &PipelineConfig,
) -> Result<String> {
    let attempts = config.llm_max_retries + 1;
    let mut last_error = IntakeError::LlmTransport("no attempt was made".to_string());

    for attempt in 1..=attempts {
        let outcome = match timeout(config.llm_timeout(), client.complete(request.clone())).await {
            Ok(result) => result,
            Err(_) => Err(IntakeError::LlmTimeout(config.llm_timeout_secs)),
        };

        match outcome {
            Ok(text) => {
                debug!("LLM call succeeded on attempt {}", attempt);
                return Ok(text);
            }
            Err(e) if !e.is_llm_failure() => return Err(e),
            Err(e) => {
                warn!("LLM call attempt {}/{} failed: {}", attempt, attempts, e);
                last_error = e;
                if attempt < attempts {
                    sleep(config.llm_backoff.delay_for(attempt)).await;
                }
            }
        }
    }

    Err(last_error)
}
