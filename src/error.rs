use thiserror::Error;

#[derive(Error, Debug)]
pub enum IntakeError {
    #[error("Unsupported format for '{file}': {details}")]
    UnsupportedFormat { file: String, details: String },

    #[error("Corrupt file '{file}': {details}")]
    CorruptFile { file: String, details: String },

    #[error("Missing required sheet: {0}")]
    MissingRequiredSheet(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("LLM transport error: {0}")]
    LlmTransport(String),

    #[error("LLM call timed out after {0} seconds")]
    LlmTimeout(u64),

    #[error("LLM returned an unusable response: {0}")]
    InvalidLlmResponse(String),

    #[error("Structured and freeform uploads cannot be mixed in one request")]
    MixedTracks,

    #[error("Unknown job id: {0}")]
    JobNotFound(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl IntakeError {
    /// Stable, user-visible error code.
    pub fn code(&self) -> &'static str {
        match self {
            IntakeError::UnsupportedFormat { .. } => "unsupported_format",
            IntakeError::CorruptFile { .. } => "corrupt_file",
            IntakeError::MissingRequiredSheet(_) => "missing_required_sheet",
            IntakeError::Configuration(_) => "configuration_error",
            IntakeError::LlmTransport(_) => "llm_transport_error",
            IntakeError::LlmTimeout(_) => "llm_timeout",
            IntakeError::InvalidLlmResponse(_) => "invalid_llm_response",
            IntakeError::MixedTracks => "mixed_tracks",
            IntakeError::JobNotFound(_) => "job_not_found",
            IntakeError::Serialization(_) => "serialization_error",
            IntakeError::Io(_) => "io_error",
        }
    }

    /// Errors raised by the LLM call itself, as opposed to configuration or input problems.
    pub fn is_llm_failure(&self) -> bool {
        matches!(
            self,
            IntakeError::LlmTransport(_)
                | IntakeError::LlmTimeout(_)
                | IntakeError::InvalidLlmResponse(_)
        )
    }
}

#[cfg(feature = "openai")]
impl From<reqwest::Error> for IntakeError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            IntakeError::LlmTransport(format!("request timed out: {}", err))
        } else {
            IntakeError::LlmTransport(err.to_string())
        }
    }
}

pub type Result<T> = std::result::Result<T, IntakeError>;
