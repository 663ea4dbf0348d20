use std::collections::HashMap;
use std::sync::Arc;

use aigw::config::{ApiSchemaName, FilterConfig, MatchMode};
use aigw::error::RouteError;
use aigw::processor::Processor;
use aigw::router::{
    Backend, DefaultRouter, HeaderMatch, Headers, RandomSource, RouteRule, Router, RuleStore,
};

const TRIALS: usize = 10_000;

fn headers(pairs: &[(&str, &str)]) -> Headers {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn rule(name: &str, value: &str, backends: &[(&str, u32)]) -> RouteRule {
    RouteRule::new(
        vec![HeaderMatch::new(name, value)],
        MatchMode::All,
        backends
            .iter()
            .map(|(n, w)| Backend::new(*n, *w, ApiSchemaName::OpenAI))
            .collect(),
    )
    .expect("valid rule")
}

fn counts(router: &DefaultRouter, h: &Headers) -> HashMap<String, usize> {
    let mut out = HashMap::new();
    for _ in 0..TRIALS {
        let backend = router.calculate(h).expect("backend");
        *out.entry(backend.name.clone()).or_insert(0) += 1;
    }
    out
}

#[test]
fn weights_one_and_three_split_a_quarter_to_three_quarters() {
    let router = DefaultRouter::new(RuleStore::new(vec![rule(
        "x-model-name",
        "m",
        &[("light", 1), ("heavy", 3)],
    )]));
    let counts = counts(&router, &headers(&[("x-model-name", "m")]));
    let heavy = counts.get("heavy").copied().unwrap_or(0);
    assert!(
        (7_000..=8_000).contains(&heavy),
        "heavy selected {heavy} times out of {TRIALS}"
    );
    assert_eq!(counts.values().sum::<usize>(), TRIALS);
}

#[test]
fn all_zero_weights_are_uniform() {
    let router = DefaultRouter::new(RuleStore::new(vec![rule(
        "x-model-name",
        "m",
        &[("a", 0), ("b", 0), ("c", 0)],
    )]));
    let counts = counts(&router, &headers(&[("x-model-name", "m")]));
    for name in ["a", "b", "c"] {
        let n = counts.get(name).copied().unwrap_or(0);
        assert!((2_900..=3_800).contains(&n), "{name} selected {n} times");
    }
}

#[test]
fn single_backend_wins_regardless_of_weight() {
    let router = DefaultRouter::new(RuleStore::new(vec![rule(
        "x-model-name",
        "m",
        &[("only", 0)],
    )]));
    let h = headers(&[("x-model-name", "m")]);
    for _ in 0..100 {
        assert_eq!(router.calculate(&h).expect("backend").name, "only");
    }
}

#[test]
fn empty_rule_set_and_unmatched_headers() {
    let empty = DefaultRouter::new(RuleStore::default());
    assert!(matches!(
        empty.calculate(&headers(&[("x-model-name", "m")])),
        Err(RouteError::NoMatchingRule)
    ));

    let router = DefaultRouter::new(RuleStore::new(vec![rule("x-model-name", "m", &[("a", 1)])]));
    assert!(matches!(
        router.calculate(&headers(&[("x-model-name", "other")])),
        Err(RouteError::NoMatchingRule)
    ));
    assert!(matches!(
        router.calculate(&Headers::new()),
        Err(RouteError::NoMatchingRule)
    ));
}

#[test]
fn only_the_first_matching_rule_is_used() {
    let router = DefaultRouter::new(RuleStore::new(vec![
        rule("x-tenant", "acme", &[("first-a", 1), ("first-b", 5)]),
        rule("x-tenant", "acme", &[("second", 100)]),
        rule("x-model-name", "m", &[("third", 1)]),
    ]));
    let h = headers(&[("x-tenant", "acme"), ("x-model-name", "m")]);
    for _ in 0..1_000 {
        let name = router.calculate(&h).expect("backend").name.clone();
        assert!(name.starts_with("first-"), "picked {name}");
    }
}

fn two_rule_config() -> FilterConfig {
    serde_json::from_value(serde_json::json!({
        "schema": {"name": "OpenAI"},
        "selected_backend_header_key": "x-selected-backend-name",
        "model_name_header_key": "x-model-name",
        "rules": [
            {
                "headers": [{"name": "x-model-name", "value": "gpt-4o-mini"}],
                "backends": [{"name": "openai", "schema": {"name": "OpenAI"}}]
            },
            {
                "headers": [
                    {"name": "x-model-name", "value": "llama3.3333"},
                    {"name": "x-model-name", "value": "us.meta.llama3-2-1b-instruct-v1:0"}
                ],
                "match_mode": "any",
                "backends": [{"name": "aws-bedrock", "schema": {"name": "AWSBedrock"}}]
            }
        ]
    }))
    .expect("config")
}

#[test]
fn model_in_body_routes_to_its_rule() {
    let processor = Processor::new(&two_rule_config()).expect("processor");

    let mut session = processor.session();
    let decision = session
        .on_request_body(br#"{"model":"gpt-4o-mini","messages":[{"role":"user","content":"hi"}]}"#)
        .expect("route");
    assert_eq!(decision.backend.name, "openai");

    let mut session = processor.session();
    let decision = session
        .on_request_body(
            br#"{"model":"us.meta.llama3-2-1b-instruct-v1:0","messages":[{"role":"user","content":"hi"}]}"#,
        )
        .expect("route");
    assert_eq!(decision.backend.name, "aws-bedrock");
    assert_eq!(decision.backend.schema, ApiSchemaName::AWSBedrock);
    assert!(decision.header_mutations.contains(&(
        "x-selected-backend-name".to_string(),
        "aws-bedrock".to_string()
    )));
    assert!(decision.header_mutations.contains(&(
        "x-model-name".to_string(),
        "us.meta.llama3-2-1b-instruct-v1:0".to_string()
    )));
}

#[test]
fn unknown_model_is_rejected() {
    let processor = Processor::new(&two_rule_config()).expect("processor");
    let mut session = processor.session();
    let err = session
        .on_request_body(br#"{"model":"claude","messages":[]}"#)
        .expect_err("no rule");
    assert_eq!(err.code(), "no_matching_rule");
}

struct PinnedRouter {
    inner: Arc<dyn Router>,
}

impl Router for PinnedRouter {
    fn calculate(&self, headers: &Headers) -> Result<Arc<Backend>, RouteError> {
        if headers.get("x-pin").map(String::as_str) == Some("canary") {
            return Ok(Arc::new(Backend::new("canary", 1, ApiSchemaName::OpenAI)));
        }
        self.inner.calculate(headers)
    }
}

fn pinned_router(default: Arc<dyn Router>, _config: &FilterConfig) -> Arc<dyn Router> {
    Arc::new(PinnedRouter { inner: default })
}

#[test]
fn custom_router_wraps_the_default() {
    let processor =
        Processor::with_custom_router(&two_rule_config(), pinned_router).expect("processor");

    let mut session = processor.session();
    session.on_request_headers([("X-Pin", "canary")]);
    let decision = session
        .on_request_body(br#"{"model":"gpt-4o-mini","messages":[]}"#)
        .expect("route");
    assert_eq!(decision.backend.name, "canary");

    let mut session = processor.session();
    let decision = session
        .on_request_body(br#"{"model":"gpt-4o-mini","messages":[]}"#)
        .expect("route");
    assert_eq!(decision.backend.name, "openai");
}

#[test]
fn reload_applies_to_new_sessions_only() {
    let processor = Processor::new(&two_rule_config()).expect("processor");
    let mut before = processor.session();

    let mut updated = two_rule_config();
    updated.rules[0].backends[0].name = "openai-v2".to_string();
    updated.selected_backend_header_key = "x-backend".to_string();
    processor.reload(&updated).expect("reload");

    let decision = before
        .on_request_body(br#"{"model":"gpt-4o-mini","messages":[]}"#)
        .expect("route");
    // rules are shared by the router, header keys are per session
    assert_eq!(decision.backend.name, "openai-v2");
    assert_eq!(decision.header_mutations[0].0, "x-selected-backend-name");

    let mut after = processor.session();
    let decision = after
        .on_request_body(br#"{"model":"gpt-4o-mini","messages":[]}"#)
        .expect("route");
    assert_eq!(decision.header_mutations[0].0, "x-backend");
}

#[test]
fn invalid_reload_keeps_current_rules() {
    let processor = Processor::new(&two_rule_config()).expect("processor");
    let mut broken = two_rule_config();
    broken.rules[1].backends.clear();
    assert!(processor.reload(&broken).is_err());

    let mut session = processor.session();
    let decision = session
        .on_request_body(br#"{"model":"llama3.3333","messages":[]}"#)
        .expect("route");
    assert_eq!(decision.backend.name, "aws-bedrock");
}

struct Highest;

impl RandomSource for Highest {
    fn next_below(&self, bound: u64) -> u64 {
        bound.saturating_sub(1)
    }
}

#[test]
fn injected_random_source_drives_selection() {
    let mut config = two_rule_config();
    config.rules[0].backends = serde_json::from_value(serde_json::json!([
        {"name": "primary", "weight": 9},
        {"name": "fallback", "weight": 1}
    ]))
    .expect("backends");
    let processor = Processor::with_random(&config, Arc::new(Highest)).expect("processor");
    for _ in 0..10 {
        let mut session = processor.session();
        let decision = session
            .on_request_body(br#"{"model":"gpt-4o-mini","messages":[]}"#)
            .expect("route");
        assert_eq!(decision.backend.name, "fallback");
    }
}
