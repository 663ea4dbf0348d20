use std::sync::Arc;

use arc_swap::ArcSwap;
use serde_json::Map;

use crate::adapters::{self, AdapterRegistry, ResponseSummary, SchemaAdapter};
use crate::apischema::openai::ChatCompletionRequest;
use crate::config::FilterConfig;
use crate::cost::{CostContext, CostEvaluator, CostReport};
use crate::error::{ConfigError, ProcessingError, RouteError};
use crate::metadata::MetadataSink;
use crate::router::{
    Backend, DefaultRouter, Headers, NewCustomRouterFn, OsRandom, RandomSource, Router, RuleStore,
};
use crate::stream::StreamAccumulator;

/// Settings a request reads once, at session start.
#[derive(Debug)]
struct Runtime {
    metadata_namespace: String,
    selected_backend_header_key: String,
    model_name_header_key: String,
    costs: CostEvaluator,
}

impl Runtime {
    fn build(config: &FilterConfig, adapters: &AdapterRegistry) -> Result<(Self, RuleStore), ConfigError> {
        config.validate()?;
        let rules = RuleStore::from_config(&config.rules)?;
        for rule in rules.rules() {
            for backend in rule.backends() {
                if !adapters.contains_key(&backend.schema) {
                    return Err(ConfigError::UnsupportedSchema(
                        backend.schema.as_str().to_string(),
                    ));
                }
            }
        }
        let costs = CostEvaluator::from_config(&config.llm_request_costs, config.missing_usage)?;
        Ok((
            Self {
                metadata_namespace: config.metadata_namespace.clone(),
                selected_backend_header_key: config.selected_backend_header_key.to_ascii_lowercase(),
                model_name_header_key: config.model_name_header_key.to_ascii_lowercase(),
                costs,
            },
            rules,
        ))
    }
}

/// Shared, immutable request processor. One per filter configuration; hand a
/// [`RequestSession`] to every request.
pub struct Processor {
    runtime: ArcSwap<Runtime>,
    default_router: Arc<DefaultRouter>,
    router: Arc<dyn Router>,
    adapters: Arc<AdapterRegistry>,
}

impl Processor {
    pub fn new(config: &FilterConfig) -> Result<Self, ConfigError> {
        Self::build(config, Arc::new(OsRandom), None)
    }

    pub fn with_random(
        config: &FilterConfig,
        random: Arc<dyn RandomSource>,
    ) -> Result<Self, ConfigError> {
        Self::build(config, random, None)
    }

    /// Routes through the router `new_router` builds around the default one.
    pub fn with_custom_router(
        config: &FilterConfig,
        new_router: NewCustomRouterFn,
    ) -> Result<Self, ConfigError> {
        Self::build(config, Arc::new(OsRandom), Some(new_router))
    }

    fn build(
        config: &FilterConfig,
        random: Arc<dyn RandomSource>,
        new_router: Option<NewCustomRouterFn>,
    ) -> Result<Self, ConfigError> {
        let adapters = adapters::registry();
        let (runtime, rules) = Runtime::build(config, &adapters)?;
        let default_router = Arc::new(DefaultRouter::with_random(rules, random));
        let router: Arc<dyn Router> = match new_router {
            Some(new_router) => new_router(default_router.clone(), config),
            None => default_router.clone() as Arc<dyn Router>,
        };
        tracing::info!(
            rules = config.rules.len(),
            costs = config.llm_request_costs.len(),
            namespace = %config.metadata_namespace,
            "processor configured"
        );
        Ok(Self {
            runtime: ArcSwap::from(Arc::new(runtime)),
            default_router,
            router,
            adapters: Arc::new(adapters),
        })
    }

    /// Applies a new configuration. Existing sessions keep their header keys
    /// and costs but route with the new rules; a rejected configuration leaves
    /// everything in place.
    pub fn reload(&self, config: &FilterConfig) -> Result<(), ConfigError> {
        let (runtime, rules) = Runtime::build(config, &self.adapters)?;
        self.default_router.reload(rules);
        self.runtime.store(Arc::new(runtime));
        Ok(())
    }

    pub fn session(&self) -> RequestSession {
        RequestSession {
            runtime: self.runtime.load_full(),
            router: self.router.clone(),
            adapters: self.adapters.clone(),
            headers: Headers::new(),
            request: None,
            backend: None,
            response: None,
            stream: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteDecision {
    pub backend: Arc<Backend>,
    /// Headers the host sets on the upstream request.
    pub header_mutations: Vec<(String, String)>,
}

#[derive(Debug, Clone, Default)]
struct RequestSummary {
    model: String,
    stream: bool,
}

/// Per-request state, from request headers to cost emission.
pub struct RequestSession {
    runtime: Arc<Runtime>,
    router: Arc<dyn Router>,
    adapters: Arc<AdapterRegistry>,
    headers: Headers,
    request: Option<RequestSummary>,
    backend: Option<Arc<Backend>>,
    response: Option<ResponseSummary>,
    stream: Option<StreamAccumulator>,
}

impl RequestSession {
    pub fn on_request_headers<I, K, V>(&mut self, headers: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        for (name, value) in headers {
            self.headers
                .insert(name.as_ref().to_ascii_lowercase(), value.into());
        }
    }

    /// Decodes the chat-completions request, exposes its model to the rules
    /// and selects the backend.
    pub fn on_request_body(&mut self, body: &[u8]) -> Result<RouteDecision, ProcessingError> {
        let request: ChatCompletionRequest = serde_json::from_slice(body).map_err(|err| {
            tracing::warn!(error = %err, "invalid chat completion request body");
            ProcessingError::Parse(err.into())
        })?;
        self.headers.insert(
            self.runtime.model_name_header_key.clone(),
            request.model.clone(),
        );
        tracing::debug!(
            model = %request.model,
            stream = request.stream,
            include_usage = request.wants_stream_usage(),
            "chat completion request decoded"
        );
        self.request = Some(RequestSummary {
            model: request.model.clone(),
            stream: request.stream,
        });
        self.route()
    }

    /// Selects a backend from the headers alone, for hosts that route before
    /// the body is available.
    pub fn route(&mut self) -> Result<RouteDecision, ProcessingError> {
        let backend = self.router.calculate(&self.headers)?;
        let mut header_mutations = vec![(
            self.runtime.selected_backend_header_key.clone(),
            backend.name.clone(),
        )];
        if let Some(model) = self.request.as_ref().map(|r| r.model.clone()) {
            header_mutations.push((self.runtime.model_name_header_key.clone(), model));
        }
        self.backend = Some(backend.clone());
        Ok(RouteDecision {
            backend,
            header_mutations,
        })
    }

    pub fn backend(&self) -> Option<&Arc<Backend>> {
        self.backend.as_ref()
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    fn adapter(&self) -> Result<&Arc<dyn SchemaAdapter>, ProcessingError> {
        let backend = self.backend.as_ref().ok_or(RouteError::NotRouted)?;
        Ok(adapters::lookup(&self.adapters, backend.schema)?)
    }

    /// A complete, non-streaming response body.
    pub fn on_response_body(&mut self, body: &[u8]) -> Result<(), ProcessingError> {
        let adapter = self.adapter()?.clone();
        match adapter.parse_response(body) {
            Ok(summary) => {
                self.response = Some(summary);
                Ok(())
            }
            Err(err) => {
                metrics::counter!("aigw_usage_parse_errors_total",
                    "schema" => adapter.schema().as_str()
                )
                .increment(1);
                tracing::warn!(schema = adapter.schema().as_str(), error = %err, "response usage not parsed");
                Err(err.into())
            }
        }
    }

    /// One stream event payload, or the end sentinel.
    pub fn on_stream_event(&mut self, data: &[u8]) -> Result<(), ProcessingError> {
        let adapter = self.adapter()?.clone();
        self.stream
            .get_or_insert_with(StreamAccumulator::new)
            .ingest_event(adapter.as_ref(), data)?;
        Ok(())
    }

    /// Transport ended the stream without a failure.
    pub fn on_stream_end(&mut self) -> Result<(), ProcessingError> {
        self.adapter()?;
        self.stream.get_or_insert_with(StreamAccumulator::new).finish()?;
        Ok(())
    }

    /// Connection dropped mid-stream.
    pub fn on_stream_abort(&mut self) -> ProcessingError {
        let err = match self.stream.as_mut() {
            Some(acc) => acc.abort(),
            None => {
                let mut acc = StreamAccumulator::default();
                let err = acc.abort();
                self.stream = Some(acc);
                err
            }
        };
        ProcessingError::Stream(err)
    }

    pub fn stream(&self) -> Option<&StreamAccumulator> {
        self.stream.as_ref()
    }

    /// Evaluates the configured costs and attaches them to `sink`. Consumes
    /// the session so usage is accounted at most once per request.
    pub fn complete(self, sink: &mut dyn MetadataSink) -> Result<CostReport, ProcessingError> {
        let mut stream = self.stream;
        let (usage, finish_reason, choices) = match stream.as_mut() {
            Some(acc) => {
                if !acc.is_closed() {
                    return Err(ProcessingError::Stream(acc.abort()));
                }
                (
                    acc.usage(),
                    acc.finish_reason().map(str::to_string),
                    acc.choices().count(),
                )
            }
            None => match self.response {
                Some(summary) => (summary.usage, summary.finish_reason, summary.choices),
                None => (None, None, 0),
            },
        };
        let request = self.request.unwrap_or_default();
        let ctx = CostContext {
            usage,
            model: request.model,
            backend: self
                .backend
                .as_ref()
                .map(|b| b.name.clone())
                .unwrap_or_default(),
            stream: request.stream || stream.is_some(),
            finish_reason,
            choices,
        };
        if self.runtime.costs.is_empty() {
            return Ok(CostReport::default());
        }
        let report = self.runtime.costs.evaluate(&ctx);
        if !report.values.is_empty() {
            let entries: Map<String, serde_json::Value> = report
                .values
                .iter()
                .map(|(key, value)| (key.clone(), serde_json::Value::from(*value)))
                .collect();
            sink.publish(&self.runtime.metadata_namespace, entries)
                .map_err(|err| {
                    tracing::warn!(error = %err, "cost metadata rejected");
                    err
                })?;
        }
        tracing::debug!(
            backend = %ctx.backend,
            model = %ctx.model,
            has_usage = ctx.usage.is_some(),
            costs = report.values.len(),
            failures = report.failures.len(),
            "request costs evaluated"
        );
        Ok(report)
    }
}
