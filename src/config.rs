use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::metadata;

/// Filter configuration handed over by the control plane. Loading it from a file
/// is up to the host; any serde format works.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct FilterConfig {
    #[serde(default = "default_metadata_namespace")]
    pub metadata_namespace: String,
    #[serde(default)]
    pub llm_request_costs: Vec<LlmRequestCost>,
    #[serde(default)]
    pub schema: VersionedApiSchema,
    #[serde(default = "default_selected_backend_header_key")]
    pub selected_backend_header_key: String,
    #[serde(default = "default_model_name_header_key")]
    pub model_name_header_key: String,
    #[serde(default)]
    pub missing_usage: MissingUsagePolicy,
    #[serde(default)]
    pub rules: Vec<RouteRuleConfig>,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            metadata_namespace: default_metadata_namespace(),
            llm_request_costs: Vec::new(),
            schema: VersionedApiSchema::default(),
            selected_backend_header_key: default_selected_backend_header_key(),
            model_name_header_key: default_model_name_header_key(),
            missing_usage: MissingUsagePolicy::default(),
            rules: Vec::new(),
        }
    }
}

fn default_metadata_namespace() -> String {
    "io.envoy.ai_gateway".to_string()
}

fn default_selected_backend_header_key() -> String {
    "x-ai-gateway-backend".to_string()
}

fn default_model_name_header_key() -> String {
    "x-ai-gateway-model".to_string()
}

impl FilterConfig {
    /// Structural checks that do not need the runtime objects. Rules and costs
    /// are checked again when they are compiled.
    pub fn validate(&self) -> Result<(), ConfigError> {
        metadata::validate_namespace(&self.metadata_namespace)?;
        if self.schema.name != ApiSchemaName::OpenAI {
            return Err(ConfigError::UnsupportedSchema(
                self.schema.name.as_str().to_string(),
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for cost in &self.llm_request_costs {
            metadata::validate_key(&cost.metadata_key)?;
            if !seen.insert(cost.metadata_key.as_str()) {
                return Err(ConfigError::DuplicateCostKey(cost.metadata_key.clone()));
            }
            if cost.kind == LlmRequestCostType::Expression
                && cost
                    .expression
                    .as_deref()
                    .map(|v| v.trim().is_empty())
                    .unwrap_or(true)
            {
                return Err(ConfigError::MissingExpression(cost.metadata_key.clone()));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct VersionedApiSchema {
    #[serde(default)]
    pub name: ApiSchemaName,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq, Hash)]
pub enum ApiSchemaName {
    #[default]
    OpenAI,
    AWSBedrock,
    Anthropic,
}

impl ApiSchemaName {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApiSchemaName::OpenAI => "OpenAI",
            ApiSchemaName::AWSBedrock => "AWSBedrock",
            ApiSchemaName::Anthropic => "Anthropic",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MissingUsagePolicy {
    /// Token costs are left out when the upstream reported no usage.
    #[default]
    Skip,
    /// Token costs are published as zero when the upstream reported no usage.
    Zero,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct LlmRequestCost {
    pub metadata_key: String,
    #[serde(rename = "type")]
    pub kind: LlmRequestCostType,
    #[serde(default, alias = "cel_expression", skip_serializing_if = "Option::is_none")]
    pub expression: Option<String>,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
pub enum LlmRequestCostType {
    InputToken,
    OutputToken,
    TotalToken,
    #[serde(alias = "CELExpression")]
    Expression,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MatchMode {
    /// Every header matcher must hold.
    #[default]
    All,
    /// Any single header matcher is enough.
    Any,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct RouteRuleConfig {
    pub headers: Vec<HeaderMatchConfig>,
    #[serde(default)]
    pub match_mode: MatchMode,
    pub backends: Vec<BackendConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct HeaderMatchConfig {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct BackendConfig {
    pub name: String,
    #[serde(default)]
    pub schema: VersionedApiSchema,
    #[serde(default = "default_backend_weight")]
    pub weight: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<BackendAuth>,
}

fn default_backend_weight() -> u32 {
    1
}

/// Where the host finds the credentials for a backend. The values are opaque
/// here; resolving them is the host's job.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BackendAuth {
    ApiKey {
        filename: String,
    },
    Aws {
        credential_file: String,
        region: String,
    },
}
