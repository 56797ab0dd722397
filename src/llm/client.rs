use crate::config::PipelineConfig;
use crate::error::{IntakeError, Result};
use crate::llm::{CompletionRequest, LlmClient};
use futures::future::BoxFuture;
use futures::FutureExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};

const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

/// Chat-completions client for OpenAI-compatible endpoints.
#[derive(Clone)]
pub struct OpenAiClient {
    client: Client,
    api_key: String,
    base_url: String,
    model: String,
}

impl OpenAiClient {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            api_key: api_key.into(),
            base_url: OPENAI_BASE_URL.to_string(),
            model: model.into(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    /// Builds a client from the pipeline configuration; fails when no key is set.
    pub fn from_config(config: &PipelineConfig) -> Result<Self> {
        let api_key = config
            .api_key
            .clone()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| IntakeError::Configuration("OPENAI_API_KEY is not set".to_string()))?;
        let client = Self::new(api_key, config.model.clone());
        Ok(match &config.base_url {
            Some(url) => client.with_base_url(url.clone()),
            None => client,
        })
    }

    async fn chat(&self, request: CompletionRequest) -> Result<String> {
        let url = format!("{}/chat/completions", self.base_url);
        let payload = ChatCompletionRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: &request.system,
                },
                ChatMessage {
                    role: "user",
                    content: &request.user,
                },
            ],
            temperature: request.temperature,
            response_format: request.json.then_some(ResponseFormat {
                kind: "json_object",
            }),
        };

        let res = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()
            .await?;
        let status = res.status();

        if !status.is_success() {
            let err_text = res.text().await?;
            return Err(IntakeError::LlmTransport(format!(
                "OpenAI API error (status {}): {}",
                status, err_text
            )));
        }

        let body: ChatCompletionResponse = res.json().await?;
        body.choices
            .into_iter()
            .next()
            .ok_or_else(|| IntakeError::InvalidLlmResponse("No choices returned".to_string()))?
            .message
            .content
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| IntakeError::InvalidLlmResponse("Empty message content".to_string()))
    }
}

impl LlmClient for OpenAiClient {
    fn complete(&self, request: CompletionRequest) -> BoxFuture<'_, Result<String>> {
        self.chat(request).boxed()
    }
}
