use crate::error::{IntakeError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;

/// What to do when the LLM path is wanted but unavailable or failing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackPolicy {
    /// Fall back to local-only processing when the LLM call fails (or no key is set).
    OnError,
    /// Never fall back; a missing key or failing call is terminal.
    Never,
    /// Fall back only when no API key is configured; call failures are terminal.
    IfNoKey,
}

impl FromStr for FallbackPolicy {
    type Err = IntakeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "on_error" => Ok(Self::OnError),
            "never" => Ok(Self::Never),
            "if_no_key" => Ok(Self::IfNoKey),
            other => Err(IntakeError::Configuration(format!(
                "Unknown LOCAL_FALLBACK_POLICY '{}'. Expected on_error, never or if_no_key",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Backoff {
    Exponential { base_ms: u64 },
    Fixed { delay_ms: u64 },
}

impl Backoff {
    /// Delay before retry number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match self {
            Backoff::Exponential { base_ms } => {
                let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
                Duration::from_millis(base_ms.saturating_mul(factor))
            }
            Backoff::Fixed { delay_ms } => Duration::from_millis(*delay_ms),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// An item is material when |variance_pct| is at least this many percent.
    pub materiality_pct: f64,
    /// ...or when |variance_sar| is at least this amount.
    pub materiality_amount_sar: f64,
    pub header_scan_rows: usize,
    /// Classification confidence below which the freeform track asks the LLM for help.
    pub low_confidence_threshold: f64,
    pub llm_timeout_secs: u64,
    pub llm_max_retries: u32,
    pub llm_backoff: Backoff,
    pub pdf_timeout_secs: u64,
    pub fallback_policy: FallbackPolicy,
    pub force_llm: bool,
    pub bilingual: bool,
    pub model: String,
    pub base_url: Option<String>,
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    pub max_llm_input_chars: usize,
    pub vat_rate: f64,
    /// Requested quantities per item code, used to price a basket per vendor.
    pub basket: Option<BTreeMap<String, f64>>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            materiality_pct: 5.0,
            materiality_amount_sar: 100_000.0,
            header_scan_rows: 15,
            low_confidence_threshold: 0.5,
            llm_timeout_secs: 30,
            llm_max_retries: 2,
            llm_backoff: Backoff::Exponential { base_ms: 500 },
            pdf_timeout_secs: 20,
            fallback_policy: FallbackPolicy::OnError,
            force_llm: false,
            bilingual: true,
            model: "gpt-4o-mini".to_string(),
            base_url: None,
            api_key: None,
            max_llm_input_chars: 6000,
            vat_rate: 0.15,
            basket: None,
        }
    }
}

impl PipelineConfig {
    /// Build the configuration from process environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`PipelineConfig::from_env`] but with an injectable variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        config.api_key = get("OPENAI_API_KEY").or_else(|| get("AZURE_OPENAI_API_KEY"));
        if let Some(model) = get("OPENAI_MODEL") {
            config.model = model;
        }
        config.base_url = get("OPENAI_BASE_URL");

        if let Some(v) = get("OPENAI_TIMEOUT") {
            config.llm_timeout_secs = parse_env("OPENAI_TIMEOUT", &v)?;
        }
        if let Some(v) = get("OPENAI_MAX_RETRIES") {
            config.llm_max_retries = parse_env("OPENAI_MAX_RETRIES", &v)?;
        }
        if let Some(v) = get("PDF_PARSE_TIMEOUT") {
            config.pdf_timeout_secs = parse_env("PDF_PARSE_TIMEOUT", &v)?;
        }
        if let Some(v) = get("MATERIALITY_PCT") {
            config.materiality_pct = parse_env("MATERIALITY_PCT", &v)?;
        }
        if let Some(v) = get("MATERIALITY_AMOUNT_SAR") {
            config.materiality_amount_sar = parse_env("MATERIALITY_AMOUNT_SAR", &v)?;
        }

        config.force_llm = get("FORCE_LLM")
            .map(|v| matches!(v.trim().to_lowercase().as_str(), "1" | "true" | "yes"))
            .unwrap_or(false);

        config.fallback_policy = match get("LOCAL_FALLBACK_POLICY") {
            Some(v) => v.parse()?,
            None if get("ENV").as_deref() == Some("prod") => FallbackPolicy::Never,
            None => FallbackPolicy::OnError,
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.materiality_pct < 0.0 || self.materiality_amount_sar < 0.0 {
            return Err(IntakeError::Configuration(
                "Materiality thresholds must be non-negative".to_string(),
            ));
        }
        if self.header_scan_rows == 0 {
            return Err(IntakeError::Configuration(
                "header_scan_rows must be at least 1".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.low_confidence_threshold) {
            return Err(IntakeError::Configuration(format!(
                "low_confidence_threshold {} must be between 0.0 and 1.0",
                self.low_confidence_threshold
            )));
        }
        if self.llm_timeout_secs == 0 || self.pdf_timeout_secs == 0 {
            return Err(IntakeError::Configuration(
                "LLM and PDF timeouts must be greater than zero".to_string(),
            ));
        }
        if !(0.0..1.0).contains(&self.vat_rate) {
            return Err(IntakeError::Configuration(format!(
                "vat_rate {} must be in [0, 1)",
                self.vat_rate
            )));
        }
        Ok(())
    }

    pub fn has_api_key(&self) -> bool {
        self.api_key.as_deref().is_some_and(|k| !k.trim().is_empty())
    }

    pub fn llm_timeout(&self) -> Duration {
        Duration::from_secs(self.llm_timeout_secs)
    }

    pub fn pdf_budget(&self) -> Duration {
        Duration::from_secs(self.pdf_timeout_secs)
    }
}

fn parse_env<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value.trim().parse().map_err(|_| {
        IntakeError::Configuration(format!("Invalid value '{}' for {}", value, key))
    })
}
