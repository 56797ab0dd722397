//! Decides once per request whether the LLM-assisted path may run.

use crate::config::{FallbackPolicy, PipelineConfig};
use crate::error::{IntakeError, Result};
use crate::pipeline::UploadRequest;
use log::warn;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Track {
    /// Four role-specific files.
    Structured,
    /// One file of unknown shape.
    Freeform,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingReason {
    Forced,
    LocalOnly,
    KeyPresent,
    NoKeyFallback,
    ErrorFallback,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingDecision {
    pub use_llm: bool,
    pub reason: RoutingReason,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoutingInputs {
    pub track: Track,
    pub local_only: bool,
    pub force_llm: bool,
    pub has_api_key: bool,
    pub policy: FallbackPolicy,
}

impl RoutingInputs {
    /// Only the body `local_only` flag counts. Request headers such as
    /// `x-local-only` are not consulted.
    pub fn from_request(track: Track, request: &UploadRequest, config: &PipelineConfig) -> Self {
        if request
            .headers
            .keys()
            .any(|h| h.eq_ignore_ascii_case("x-local-only"))
        {
            warn!("Ignoring x-local-only header; set local_only in the request body instead");
        }
        Self {
            track,
            local_only: request.local_only,
            force_llm: config.force_llm,
            has_api_key: config.has_api_key(),
            policy: config.fallback_policy,
        }
    }
}

/// Routing table:
///
/// | force | local_only | key | policy    | outcome                    |
/// |-------|------------|-----|-----------|----------------------------|
/// | yes   | any        | no  | any       | `ConfigurationError`       |
/// | yes   | any        | yes | any       | LLM (forced)               |
/// | no    | yes        | any | any       | local                      |
/// | no    | no         | no  | if_no_key | local (no-key fallback)    |
/// | no    | no         | no  | on_error  | local (no-key fallback)    |
/// | no    | no         | no  | never     | `ConfigurationError`       |
/// | no    | no         | yes | any       | LLM                        |
pub fn decide(inputs: &RoutingInputs) -> Result<RoutingDecision> {
    if inputs.force_llm {
        if !inputs.has_api_key {
            return Err(IntakeError::Configuration(
                "FORCE_LLM is set but no OpenAI API key is configured".to_string(),
            ));
        }
        return Ok(RoutingDecision {
            use_llm: true,
            reason: RoutingReason::Forced,
        });
    }
    if inputs.local_only {
        return Ok(RoutingDecision {
            use_llm: false,
            reason: RoutingReason::LocalOnly,
        });
    }
    if !inputs.has_api_key {
        return match inputs.policy {
            FallbackPolicy::IfNoKey | FallbackPolicy::OnError => Ok(RoutingDecision {
                use_llm: false,
                reason: RoutingReason::NoKeyFallback,
            }),
            FallbackPolicy::Never => Err(IntakeError::Configuration(
                "No OpenAI API key is configured and LOCAL_FALLBACK_POLICY=never forbids local processing"
                    .to_string(),
            )),
        };
    }
    Ok(RoutingDecision {
        use_llm: true,
        reason: RoutingReason::KeyPresent,
    })
}

/// Applies the policy to a failed LLM call. Only `on_error` downgrades to local
/// processing, and never for a forced request.
pub fn after_llm_failure(
    decision: &RoutingDecision,
    policy: FallbackPolicy,
    error: IntakeError,
) -> Result<RoutingDecision> {
    match (decision.reason, policy) {
        (RoutingReason::Forced, _) => Err(error),
        (_, FallbackPolicy::OnError) => {
            warn!("LLM call failed, continuing locally: {}", error);
            Ok(RoutingDecision {
                use_llm: false,
                reason: RoutingReason::ErrorFallback,
            })
        }
        _ => Err(error),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inputs(force_llm: bool, local_only: bool, has_api_key: bool, policy: FallbackPolicy) -> RoutingInputs {
        RoutingInputs {
            track: Track::Freeform,
            local_only,
            force_llm,
            has_api_key,
            policy,
        }
    }

    #[test]
    fn test_forced_requires_key() {
        let err = decide(&inputs(true, true, false, FallbackPolicy::OnError)).unwrap_err();
        assert_eq!(err.code(), "configuration_error");

        let forced = decide(&inputs(true, true, true, FallbackPolicy::Never)).unwrap();
        assert!(forced.use_llm);
        assert_eq!(forced.reason, RoutingReason::Forced);
    }

    #[test]
    fn test_forced_failure_is_never_downgraded() {
        let forced = decide(&inputs(true, false, true, FallbackPolicy::OnError)).unwrap();
        let err = after_llm_failure(&forced, FallbackPolicy::OnError, IntakeError::LlmTimeout(30))
            .unwrap_err();
        assert_eq!(err.code(), "llm_timeout");
    }

    #[test]
    fn test_if_no_key_with_key_surfaces_failure() {
        let decision = decide(&inputs(false, false, true, FallbackPolicy::IfNoKey)).unwrap();
        assert!(decision.use_llm);
        assert!(after_llm_failure(
            &decision,
            FallbackPolicy::IfNoKey,
            IntakeError::LlmTransport("boom".into())
        )
        .is_err());
    }
}
