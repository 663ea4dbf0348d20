use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex};

use arc_swap::ArcSwap;
use rand_core::{OsRng, RngCore};

use crate::config::{ApiSchemaName, BackendAuth, FilterConfig, MatchMode, RouteRuleConfig};
use crate::error::{ConfigError, RouteError};

/// Request headers as seen by the host, keyed by lowercase header name.
pub type Headers = HashMap<String, String>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backend {
    pub name: String,
    pub weight: u32,
    pub schema: ApiSchemaName,
    pub auth: Option<BackendAuth>,
}

impl Backend {
    pub fn new(name: impl Into<String>, weight: u32, schema: ApiSchemaName) -> Self {
        Self {
            name: name.into(),
            weight,
            schema,
            auth: None,
        }
    }

    pub fn with_auth(mut self, auth: BackendAuth) -> Self {
        self.auth = Some(auth);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderMatch {
    pub name: String,
    pub value: String,
}

impl HeaderMatch {
    /// Header names are stored lowercase, as sessions see them.
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        let mut name = name.into();
        name.make_ascii_lowercase();
        Self {
            name,
            value: value.into(),
        }
    }

    fn matches(&self, headers: &Headers) -> bool {
        headers
            .get(&self.name)
            .map(|v| v == &self.value)
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone)]
pub struct RouteRule {
    headers: Vec<HeaderMatch>,
    match_mode: MatchMode,
    backends: Vec<Arc<Backend>>,
}

impl RouteRule {
    pub fn new(
        headers: Vec<HeaderMatch>,
        match_mode: MatchMode,
        backends: Vec<Backend>,
    ) -> Result<Self, ConfigError> {
        if headers.is_empty() {
            return Err(ConfigError::EmptyMatchers);
        }
        if backends.is_empty() {
            return Err(ConfigError::EmptyBackends);
        }
        let mut seen = HashSet::new();
        for backend in &backends {
            if !seen.insert(backend.name.as_str()) {
                return Err(ConfigError::DuplicateBackend(backend.name.clone()));
            }
        }
        Ok(Self {
            headers,
            match_mode,
            backends: backends.into_iter().map(Arc::new).collect(),
        })
    }

    fn from_config(cfg: &RouteRuleConfig) -> Result<Self, ConfigError> {
        let headers = cfg
            .headers
            .iter()
            .map(|h| HeaderMatch::new(h.name.as_str(), h.value.as_str()))
            .collect();
        let backends = cfg
            .backends
            .iter()
            .map(|b| Backend {
                name: b.name.clone(),
                weight: b.weight,
                schema: b.schema.name,
                auth: b.auth.clone(),
            })
            .collect();
        Self::new(headers, cfg.match_mode, backends)
    }

    pub fn headers(&self) -> &[HeaderMatch] {
        &self.headers
    }

    pub fn backends(&self) -> &[Arc<Backend>] {
        &self.backends
    }

    pub fn matches(&self, headers: &Headers) -> bool {
        if self.headers.is_empty() {
            return false;
        }
        match self.match_mode {
            MatchMode::All => self.headers.iter().all(|m| m.matches(headers)),
            MatchMode::Any => self.headers.iter().any(|m| m.matches(headers)),
        }
    }

    fn select(&self, random: &dyn RandomSource) -> Arc<Backend> {
        if self.backends.len() == 1 {
            return self.backends[0].clone();
        }
        let total_weight: u64 = self.backends.iter().map(|b| u64::from(b.weight)).sum();
        if total_weight == 0 {
            let idx = random.next_below(self.backends.len() as u64) as usize;
            return self.backends[idx].clone();
        }
        let target = random.next_below(total_weight);
        let mut cumulative = 0u64;
        for backend in &self.backends {
            cumulative += u64::from(backend.weight);
            if target < cumulative {
                return backend.clone();
            }
        }
        // unreachable while target < total_weight
        self.backends[self.backends.len() - 1].clone()
    }
}

/// Immutable, ordered set of rules. Replaced wholesale on reload.
#[derive(Debug, Clone, Default)]
pub struct RuleStore {
    rules: Vec<RouteRule>,
}

impl RuleStore {
    pub fn new(rules: Vec<RouteRule>) -> Self {
        Self { rules }
    }

    pub fn from_config(rules: &[RouteRuleConfig]) -> Result<Self, ConfigError> {
        let rules = rules
            .iter()
            .enumerate()
            .map(|(index, cfg)| {
                RouteRule::from_config(cfg).map_err(|err| ConfigError::InvalidRule {
                    index,
                    source: Box::new(err),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { rules })
    }

    pub fn rules(&self) -> &[RouteRule] {
        &self.rules
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    fn first_match(&self, headers: &Headers) -> Option<(usize, &RouteRule)> {
        self.rules.iter().enumerate().find(|(_, r)| r.matches(headers))
    }
}

/// Source of uniform integers for weighted selection.
pub trait RandomSource: Send + Sync {
    /// Returns a value in `[0, bound)`, or 0 when `bound <= 1`.
    fn next_below(&self, bound: u64) -> u64;
}

/// Operating-system entropy, shared by every request.
#[derive(Debug, Clone, Copy, Default)]
pub struct OsRandom;

impl RandomSource for OsRandom {
    fn next_below(&self, bound: u64) -> u64 {
        if bound <= 1 {
            return 0;
        }
        OsRng.next_u64() % bound
    }
}

/// Wraps any `RngCore`, mostly so tests can inject a fixed sequence.
pub struct SharedRng<R>(Mutex<R>);

impl<R: RngCore + Send> SharedRng<R> {
    pub fn new(rng: R) -> Self {
        Self(Mutex::new(rng))
    }
}

impl<R: RngCore + Send> RandomSource for SharedRng<R> {
    fn next_below(&self, bound: u64) -> u64 {
        if bound <= 1 {
            return 0;
        }
        let mut rng = self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        rng.next_u64() % bound
    }
}

pub trait Router: Send + Sync {
    fn calculate(&self, headers: &Headers) -> Result<Arc<Backend>, RouteError>;
}

/// Builds a router that wraps the default one, e.g. to override selection for
/// some requests and delegate the rest.
pub type NewCustomRouterFn = fn(default: Arc<dyn Router>, config: &FilterConfig) -> Arc<dyn Router>;

pub struct DefaultRouter {
    rules: ArcSwap<RuleStore>,
    random: Arc<dyn RandomSource>,
}

impl fmt::Debug for DefaultRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DefaultRouter")
            .field("rules", &self.rules.load().rules.len())
            .finish()
    }
}

impl DefaultRouter {
    pub fn new(rules: RuleStore) -> Self {
        Self::with_random(rules, Arc::new(OsRandom))
    }

    pub fn with_random(rules: RuleStore, random: Arc<dyn RandomSource>) -> Self {
        Self {
            rules: ArcSwap::from(Arc::new(rules)),
            random,
        }
    }

    /// Swaps in a new rule set. Requests already routing keep the snapshot they
    /// loaded.
    pub fn reload(&self, rules: RuleStore) {
        let count = rules.rules.len();
        if rules.is_empty() {
            tracing::warn!("empty route rule set, every request will be rejected");
        }
        self.rules.store(Arc::new(rules));
        tracing::info!(rules = count, "route rules reloaded");
    }

    pub fn snapshot(&self) -> Arc<RuleStore> {
        self.rules.load_full()
    }
}

impl Router for DefaultRouter {
    fn calculate(&self, headers: &Headers) -> Result<Arc<Backend>, RouteError> {
        let snapshot = self.rules.load_full();
        let Some((index, rule)) = snapshot.first_match(headers) else {
            metrics::counter!("aigw_route_no_match_total").increment(1);
            tracing::debug!(rules = snapshot.rules.len(), "no route rule matched");
            return Err(RouteError::NoMatchingRule);
        };
        let backend = rule.select(self.random.as_ref());
        metrics::counter!("aigw_route_selections_total",
            "rule" => index.to_string(), "backend" => backend.name.clone()
        )
        .increment(1);
        tracing::debug!(rule = index, backend = %backend.name, "route selected");
        Ok(backend)
    }
}
