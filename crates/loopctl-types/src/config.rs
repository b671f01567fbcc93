use serde::{Deserialize, Serialize};

/// One YAML config layer as read from disk (user-level or project-level).
/// Every field is optional so layers can be deep-merged; the fully
/// resolved `Config` (with defaults applied) lives in `loopctl-core`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ConfigLayer {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub defaults: Option<DefaultsLayer>,
    #[serde(
        rename = "circuit_breaker",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub circuit_breaker: Option<CircuitBreakerLayer>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion: Option<CompletionLayer>,
    #[serde(
        rename = "successCriteria",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub success_criteria: Option<SuccessCriteriaLayer>,
    #[serde(
        rename = "quality_checks",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub quality_checks: Option<QualityChecksLayer>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hooks: Option<HooksLayer>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub research: Option<ResearchLayer>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DefaultsLayer {
    #[serde(rename = "max_iterations", skip_serializing_if = "Option::is_none")]
    pub max_iterations: Option<u32>,
    #[serde(rename = "timeout_minutes", skip_serializing_if = "Option::is_none")]
    pub timeout_minutes: Option<u64>,
    #[serde(
        rename = "rate_limit_per_hour",
        skip_serializing_if = "Option::is_none"
    )]
    pub rate_limit_per_hour: Option<u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CircuitBreakerLayer {
    #[serde(
        rename = "no_progress_threshold",
        skip_serializing_if = "Option::is_none"
    )]
    pub no_progress_threshold: Option<u32>,
    #[serde(
        rename = "same_error_threshold",
        skip_serializing_if = "Option::is_none"
    )]
    pub same_error_threshold: Option<u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CompletionLayer {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub promise: Option<String>,
    #[serde(
        rename = "custom_patterns",
        skip_serializing_if = "Option::is_none"
    )]
    pub custom_patterns: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SuccessCriteriaLayer {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct QualityChecksLayer {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub all: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frontend: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct HooksLayer {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ResearchLayer {
    #[serde(rename = "max_agents", skip_serializing_if = "Option::is_none")]
    pub max_agents: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
}
