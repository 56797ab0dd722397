//! LLM seam: the client capability, the retry/timeout wrapper, prompts, and the
//! assisted extractor together with its grounding check.

#[cfg(feature = "openai")]
pub mod client;
pub mod extractor;
pub mod grounding;
pub mod prompts;
pub mod retry;
pub mod types;
pub mod utils;

#[cfg(feature = "openai")]
pub use client::OpenAiClient;
pub use extractor::assist;
pub use grounding::verify_grounding;
pub use retry::call_with_retry;
pub use types::*;

use crate::error::Result;
use futures::future::BoxFuture;

/// One chat completion call. Temperature stays at zero so retries are safe.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    pub system: String,
    pub user: String,
    pub temperature: f32,
    /// Ask the provider for a JSON object response.
    pub json: bool,
}

impl CompletionRequest {
    pub fn json(system: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            user: user.into(),
            temperature: 0.0,
            json: true,
        }
    }

    pub fn text(system: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            json: false,
            ..Self::json(system, user)
        }
    }
}

/// A model that turns a prompt into text. Implementations do a single attempt;
/// timeouts and retries are applied by [`call_with_retry`].
pub trait LlmClient: Send + Sync {
    fn complete(&self, request: CompletionRequest) -> BoxFuture<'_, Result<String>>;
}
