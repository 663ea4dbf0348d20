//! Cost evaluation: turns a request's usage into the named numbers the
//! external rate limiter consumes.
//!
//! Token costs project a usage counter. Expression costs evaluate an
//! `evalexpr` expression against a read-only context, so assignments and
//! other side effects fail at evaluation time. Every cost is independent: one
//! failing does not stop the others.

use std::collections::{BTreeMap, HashSet};

use evalexpr::{ContextWithMutableVariables, HashMapContext, Node, Value as ExprValue};
use serde::Serialize;

use crate::adapters::UsageRecord;
use crate::config::{LlmRequestCost, LlmRequestCostType, MissingUsagePolicy};
use crate::error::{ConfigError, CostError};

pub const VAR_INPUT_TOKENS: &str = "input_tokens";
pub const VAR_OUTPUT_TOKENS: &str = "output_tokens";
pub const VAR_TOTAL_TOKENS: &str = "total_tokens";
pub const VAR_MODEL: &str = "model";
pub const VAR_BACKEND: &str = "backend";
pub const VAR_REQUEST_STREAM: &str = "request.stream";
pub const VAR_RESPONSE_FINISH_REASON: &str = "response.finish_reason";
pub const VAR_RESPONSE_CHOICES: &str = "response.choices";

const USAGE_VARIABLES: [&str; 3] = [VAR_INPUT_TOKENS, VAR_OUTPUT_TOKENS, VAR_TOTAL_TOKENS];
const CONTEXT_VARIABLES: [&str; 5] = [
    VAR_MODEL,
    VAR_BACKEND,
    VAR_REQUEST_STREAM,
    VAR_RESPONSE_FINISH_REASON,
    VAR_RESPONSE_CHOICES,
];

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(untagged)]
pub enum CostValue {
    Unsigned(u64),
    Signed(i64),
    Float(f64),
}

impl CostValue {
    pub fn as_f64(&self) -> f64 {
        match *self {
            CostValue::Unsigned(v) => v as f64,
            CostValue::Signed(v) => v as f64,
            CostValue::Float(v) => v,
        }
    }
}

impl From<CostValue> for serde_json::Value {
    fn from(value: CostValue) -> Self {
        match value {
            CostValue::Unsigned(v) => serde_json::Value::from(v),
            CostValue::Signed(v) => serde_json::Value::from(v),
            CostValue::Float(v) => serde_json::Value::from(v),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CompiledExpression {
    node: Node,
    uses_usage: bool,
}

impl CompiledExpression {
    pub fn compile(source: &str) -> Result<Self, String> {
        let node = evalexpr::build_operator_tree(source).map_err(|err| err.to_string())?;
        let mut uses_usage = false;
        for identifier in node.iter_variable_identifiers() {
            if USAGE_VARIABLES.contains(&identifier) {
                uses_usage = true;
            } else if !CONTEXT_VARIABLES.contains(&identifier) {
                return Err(format!("unknown variable {identifier:?}"));
            }
        }
        Ok(Self { node, uses_usage })
    }
}

#[derive(Debug, Clone)]
pub enum CostKind {
    InputToken,
    OutputToken,
    TotalToken,
    Expression(CompiledExpression),
}

#[derive(Debug, Clone)]
pub struct CostSpec {
    pub metadata_key: String,
    pub kind: CostKind,
}

impl CostSpec {
    pub fn token(metadata_key: impl Into<String>, kind: LlmRequestCostType) -> Option<Self> {
        let kind = match kind {
            LlmRequestCostType::InputToken => CostKind::InputToken,
            LlmRequestCostType::OutputToken => CostKind::OutputToken,
            LlmRequestCostType::TotalToken => CostKind::TotalToken,
            LlmRequestCostType::Expression => return None,
        };
        Some(Self {
            metadata_key: metadata_key.into(),
            kind,
        })
    }

    pub fn expression(metadata_key: impl Into<String>, source: &str) -> Result<Self, ConfigError> {
        let metadata_key = metadata_key.into();
        let compiled =
            CompiledExpression::compile(source).map_err(|message| ConfigError::InvalidExpression {
                key: metadata_key.clone(),
                message,
            })?;
        Ok(Self {
            metadata_key,
            kind: CostKind::Expression(compiled),
        })
    }

    fn from_config(cfg: &LlmRequestCost) -> Result<Self, ConfigError> {
        match cfg.kind {
            LlmRequestCostType::Expression => {
                let source = cfg
                    .expression
                    .as_deref()
                    .filter(|v| !v.trim().is_empty())
                    .ok_or_else(|| ConfigError::MissingExpression(cfg.metadata_key.clone()))?;
                Self::expression(cfg.metadata_key.clone(), source)
            }
            kind => Self::token(cfg.metadata_key.clone(), kind)
                .ok_or_else(|| ConfigError::MissingExpression(cfg.metadata_key.clone())),
        }
    }
}

/// Request and response attributes visible to cost evaluation.
#[derive(Debug, Clone, Default)]
pub struct CostContext {
    pub usage: Option<UsageRecord>,
    pub model: String,
    pub backend: String,
    pub stream: bool,
    pub finish_reason: Option<String>,
    pub choices: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CostFailure {
    pub metadata_key: String,
    pub error: CostError,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CostReport {
    pub values: BTreeMap<String, CostValue>,
    pub failures: Vec<CostFailure>,
    pub skipped: Vec<String>,
}

impl CostReport {
    pub fn get(&self, key: &str) -> Option<CostValue> {
        self.values.get(key).copied()
    }
}

#[derive(Debug, Clone, Default)]
pub struct CostEvaluator {
    specs: Vec<CostSpec>,
    missing_usage: MissingUsagePolicy,
}

impl CostEvaluator {
    pub fn new(specs: Vec<CostSpec>, missing_usage: MissingUsagePolicy) -> Self {
        Self {
            specs,
            missing_usage,
        }
    }

    pub fn from_config(
        costs: &[LlmRequestCost],
        missing_usage: MissingUsagePolicy,
    ) -> Result<Self, ConfigError> {
        let mut seen = HashSet::new();
        let mut specs = Vec::with_capacity(costs.len());
        for cost in costs {
            if !seen.insert(cost.metadata_key.as_str()) {
                return Err(ConfigError::DuplicateCostKey(cost.metadata_key.clone()));
            }
            specs.push(CostSpec::from_config(cost)?);
        }
        Ok(Self::new(specs, missing_usage))
    }

    pub fn specs(&self) -> &[CostSpec] {
        &self.specs
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    pub fn evaluate(&self, ctx: &CostContext) -> CostReport {
        let mut report = CostReport::default();
        let usage = match (ctx.usage, self.missing_usage) {
            (Some(usage), _) => Some(usage),
            (None, MissingUsagePolicy::Zero) => Some(UsageRecord::default()),
            (None, MissingUsagePolicy::Skip) => None,
        };
        for spec in &self.specs {
            match evaluate_spec(spec, usage, ctx) {
                Ok(value) => {
                    report.values.insert(spec.metadata_key.clone(), value);
                }
                Err(CostError::MissingUsage) => {
                    tracing::debug!(key = %spec.metadata_key, "usage absent, cost skipped");
                    report.skipped.push(spec.metadata_key.clone());
                }
                Err(error) => {
                    tracing::warn!(key = %spec.metadata_key, error = %error, "cost evaluation failed");
                    metrics::counter!("aigw_cost_evaluation_failures_total",
                        "key" => spec.metadata_key.clone()
                    )
                    .increment(1);
                    report.failures.push(CostFailure {
                        metadata_key: spec.metadata_key.clone(),
                        error,
                    });
                }
            }
        }
        report
    }
}

fn evaluate_spec(
    spec: &CostSpec,
    usage: Option<UsageRecord>,
    ctx: &CostContext,
) -> Result<CostValue, CostError> {
    match &spec.kind {
        CostKind::InputToken => usage
            .map(|u| CostValue::Unsigned(u.prompt_tokens))
            .ok_or(CostError::MissingUsage),
        CostKind::OutputToken => usage
            .map(|u| CostValue::Unsigned(u.completion_tokens))
            .ok_or(CostError::MissingUsage),
        CostKind::TotalToken => usage
            .map(|u| CostValue::Unsigned(u.total_tokens))
            .ok_or(CostError::MissingUsage),
        CostKind::Expression(expr) => {
            if expr.uses_usage && usage.is_none() {
                return Err(CostError::MissingUsage);
            }
            let context = expression_context(usage, ctx)?;
            let value = expr
                .node
                .eval_with_context(&context)
                .map_err(|err| CostError::Evaluation(err.to_string()))?;
            match value {
                ExprValue::Int(v) => Ok(CostValue::Signed(v)),
                ExprValue::Float(v) if v.is_finite() => Ok(CostValue::Float(v)),
                other => Err(CostError::NotNumeric(other.to_string())),
            }
        }
    }
}

fn saturating_int(v: u64) -> ExprValue {
    ExprValue::Int(i64::try_from(v).unwrap_or(i64::MAX))
}

fn expression_context(
    usage: Option<UsageRecord>,
    ctx: &CostContext,
) -> Result<HashMapContext, CostError> {
    let mut context = HashMapContext::new();
    let mut set = |name: &str, value: ExprValue| {
        context
            .set_value(name.to_string(), value)
            .map_err(|err| CostError::Evaluation(err.to_string()))
    };
    if let Some(usage) = usage {
        set(VAR_INPUT_TOKENS, saturating_int(usage.prompt_tokens))?;
        set(VAR_OUTPUT_TOKENS, saturating_int(usage.completion_tokens))?;
        set(VAR_TOTAL_TOKENS, saturating_int(usage.total_tokens))?;
    }
    set(VAR_MODEL, ExprValue::String(ctx.model.clone()))?;
    set(VAR_BACKEND, ExprValue::String(ctx.backend.clone()))?;
    set(VAR_REQUEST_STREAM, ExprValue::Boolean(ctx.stream))?;
    set(
        VAR_RESPONSE_FINISH_REASON,
        ExprValue::String(ctx.finish_reason.clone().unwrap_or_default()),
    )?;
    set(VAR_RESPONSE_CHOICES, saturating_int(ctx.choices as u64))?;
    Ok(context)
}
