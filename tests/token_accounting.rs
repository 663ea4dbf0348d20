use aigw::adapters::UsageRecord;
use aigw::config::FilterConfig;
use aigw::cost::CostValue;
use aigw::metadata::DynamicMetadata;
use aigw::processor::{Processor, RequestSession};
use aigw::sse;
use bytes::Bytes;
use futures_util::stream;
use serde_json::json;

const NS: &str = "ai_gateway_llm_ns";

fn config(missing_usage: &str) -> FilterConfig {
    serde_json::from_value(json!({
        "metadata_namespace": NS,
        "model_name_header_key": "x-model-name",
        "missing_usage": missing_usage,
        "llm_request_costs": [
            {"metadata_key": "used_token", "type": "TotalToken"},
            {"metadata_key": "input", "type": "InputToken"},
            {"metadata_key": "some_cel", "type": "Expression", "expression": "1+1"}
        ],
        "rules": [
            {
                "headers": [{"name": "x-model-name", "value": "gpt-4o-mini"}],
                "backends": [{"name": "openai", "schema": {"name": "OpenAI"}}]
            },
            {
                "headers": [{"name": "x-model-name", "value": "claude-sonnet"}],
                "backends": [{"name": "anthropic", "schema": {"name": "Anthropic"}}]
            },
            {
                "headers": [{"name": "x-model-name", "value": "us.meta.llama3-2-1b-instruct-v1:0"}],
                "backends": [{"name": "aws-bedrock", "schema": {"name": "AWSBedrock"}}]
            }
        ]
    }))
    .expect("config")
}

fn routed(processor: &Processor, model: &str, stream: bool) -> RequestSession {
    let mut session = processor.session();
    let body = json!({
        "model": model,
        "stream": stream,
        "stream_options": {"include_usage": stream},
        "messages": [{"role": "user", "content": "Say this is a test"}]
    });
    session
        .on_request_body(body.to_string().as_bytes())
        .expect("route");
    session
}

#[test]
fn streaming_usage_only_on_last_chunk() {
    let processor = Processor::new(&config("skip")).expect("processor");
    let mut session = routed(&processor, "gpt-4o-mini", true);
    let events = [
        r#"{"object":"chat.completion.chunk","choices":[{"index":0,"delta":{"role":"assistant","content":"This is"},"finish_reason":null}],"usage":null}"#,
        r#"{"object":"chat.completion.chunk","choices":[{"index":0,"delta":{"content":" a test."},"finish_reason":"stop"}],"usage":null}"#,
        r#"{"object":"chat.completion.chunk","choices":[],"usage":{"prompt_tokens":1,"completion_tokens":1,"total_tokens":2}}"#,
        "[DONE]",
    ];
    for event in events {
        session.on_stream_event(event.as_bytes()).expect("event");
    }
    assert_eq!(
        session.stream().and_then(|s| s.content(0)),
        Some("This is a test.")
    );

    let mut metadata = DynamicMetadata::new();
    let report = session.complete(&mut metadata).expect("complete");
    assert_eq!(report.get("used_token"), Some(CostValue::Unsigned(2)));
    assert_eq!(metadata.get(NS, "used_token"), Some(&json!(2)));
    assert_eq!(metadata.get(NS, "some_cel"), Some(&json!(2)));
}

#[test]
fn non_streaming_input_token_cost_is_exact() {
    let processor = Processor::new(&config("skip")).expect("processor");
    let mut session = routed(&processor, "gpt-4o-mini", false);
    session
        .on_response_body(
            br#"{"object":"chat.completion","choices":[{"index":0,"finish_reason":"stop","message":{"role":"assistant","content":"ok"}}],"usage":{"prompt_tokens":10000,"completion_tokens":12,"total_tokens":10012}}"#,
        )
        .expect("body");
    let mut metadata = DynamicMetadata::new();
    session.complete(&mut metadata).expect("complete");
    assert_eq!(
        metadata.to_value(),
        json!({NS: {"used_token": 10012, "input": 10000, "some_cel": 2}})
    );
}

#[test]
fn hello_world_stream() {
    let processor = Processor::new(&config("skip")).expect("processor");
    let mut session = routed(&processor, "gpt-4o-mini", false);
    session
        .on_stream_event(br#"{"choices":[{"index":0,"delta":{"content":"Hello"}}]}"#)
        .expect("first");
    session
        .on_stream_event(br#"{"choices":[{"index":0,"delta":{"content":" world"},"finish_reason":"stop"}],"usage":{"prompt_tokens":10,"completion_tokens":5,"total_tokens":15}}"#)
        .expect("second");
    let acc = session.stream().expect("stream");
    assert!(acc.is_closed());
    assert_eq!(acc.content(0), Some("Hello world"));
    assert_eq!(acc.usage(), Some(UsageRecord::new(10, 5, 15)));
}

#[test]
fn stream_without_usage_skips_token_costs() {
    let processor = Processor::new(&config("skip")).expect("processor");
    let mut session = routed(&processor, "gpt-4o-mini", false);
    session
        .on_stream_event(br#"{"choices":[{"delta":{"content":"hi"},"finish_reason":"stop"}],"usage":null}"#)
        .expect("event");
    session.on_stream_event(b"[DONE]").expect("done");
    let mut metadata = DynamicMetadata::new();
    let report = session.complete(&mut metadata).expect("complete");
    assert_eq!(report.skipped, vec!["used_token".to_string(), "input".to_string()]);
    assert_eq!(metadata.to_value(), json!({NS: {"some_cel": 2}}));
}

#[test]
fn stream_without_usage_emits_zeros_when_configured() {
    let processor = Processor::new(&config("zero")).expect("processor");
    let mut session = routed(&processor, "gpt-4o-mini", false);
    session.on_stream_event(b"[DONE]").expect("done");
    let mut metadata = DynamicMetadata::new();
    session.complete(&mut metadata).expect("complete");
    assert_eq!(metadata.get(NS, "used_token"), Some(&json!(0)));
    assert_eq!(metadata.get(NS, "input"), Some(&json!(0)));
}

#[test]
fn aborted_stream_emits_nothing() {
    let processor = Processor::new(&config("zero")).expect("processor");
    let mut session = routed(&processor, "gpt-4o-mini", true);
    session
        .on_stream_event(br#"{"choices":[{"delta":{"content":"partial"}}],"usage":{"prompt_tokens":5,"completion_tokens":1,"total_tokens":6}}"#)
        .expect("event");
    let err = session.on_stream_abort();
    assert_eq!(err.code(), "stream_aborted");

    let mut metadata = DynamicMetadata::new();
    let err = session.complete(&mut metadata).expect_err("aborted");
    assert_eq!(err.code(), "stream_aborted");
    assert!(metadata.is_empty());
}

#[test]
fn unterminated_stream_counts_as_aborted() {
    let processor = Processor::new(&config("skip")).expect("processor");
    let mut session = routed(&processor, "gpt-4o-mini", true);
    session
        .on_stream_event(br#"{"choices":[{"delta":{"content":"partial"}}]}"#)
        .expect("event");
    let mut metadata = DynamicMetadata::new();
    assert!(session.complete(&mut metadata).is_err());
    assert!(metadata.is_empty());
}

#[test]
fn malformed_response_body_still_completes() {
    let processor = Processor::new(&config("skip")).expect("processor");
    let mut session = routed(&processor, "gpt-4o-mini", false);
    let err = session.on_response_body(b"<html>bad gateway</html>").expect_err("parse");
    assert_eq!(err.code(), "invalid_body");
    let mut metadata = DynamicMetadata::new();
    let report = session.complete(&mut metadata).expect("complete");
    assert!(report.failures.is_empty());
    assert_eq!(metadata.to_value(), json!({NS: {"some_cel": 2}}));
}

#[test]
fn bedrock_events_accumulate_until_metadata() {
    let processor = Processor::new(&config("skip")).expect("processor");
    let mut session = routed(&processor, "us.meta.llama3-2-1b-instruct-v1:0", true);
    for event in [
        r#"{"messageStart":{"role":"assistant"}}"#,
        r#"{"contentBlockDelta":{"contentBlockIndex":0,"delta":{"text":"Hi"}}}"#,
        r#"{"contentBlockStop":{"contentBlockIndex":0}}"#,
        r#"{"messageStop":{"stopReason":"end_turn"}}"#,
        r#"{"metadata":{"usage":{"inputTokens":8,"outputTokens":1,"totalTokens":9},"metrics":{"latencyMs":120}}}"#,
    ] {
        session.on_stream_event(event.as_bytes()).expect("event");
    }
    assert!(session.stream().is_some_and(|s| s.is_closed()));
    let mut metadata = DynamicMetadata::new();
    session.complete(&mut metadata).expect("complete");
    assert_eq!(metadata.get(NS, "used_token"), Some(&json!(9)));
    assert_eq!(metadata.get(NS, "input"), Some(&json!(8)));
}

#[tokio::test]
async fn anthropic_sse_body_through_session() {
    let processor = Processor::new(&config("skip")).expect("processor");
    let mut session = routed(&processor, "claude-sonnet", true);
    let body = concat!(
        "event: message_start\n",
        "data: {\"type\":\"message_start\",\"message\":{\"id\":\"msg_1\",\"content\":[],\"usage\":{\"input_tokens\":25,\"output_tokens\":1}}}\n\n",
        "event: content_block_start\n",
        "data: {\"type\":\"content_block_start\",\"index\":0,\"content_block\":{\"type\":\"text\",\"text\":\"\"}}\n\n",
        "event: ping\n",
        "data: {\"type\":\"ping\"}\n\n",
        "event: content_block_delta\n",
        "data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"Hello\"}}\n\n",
        "event: content_block_stop\n",
        "data: {\"type\":\"content_block_stop\",\"index\":0}\n\n",
        "event: message_delta\n",
        "data: {\"type\":\"message_delta\",\"delta\":{\"stop_reason\":\"end_turn\"},\"usage\":{\"output_tokens\":15}}\n\n",
        "event: message_stop\n",
        "data: {\"type\":\"message_stop\"}\n\n",
    );
    let (first, second) = body.split_at(body.len() / 2);
    let chunks: Vec<Result<Bytes, std::io::Error>> = vec![
        Ok(Bytes::copy_from_slice(first.as_bytes())),
        Ok(Bytes::copy_from_slice(second.as_bytes())),
    ];
    sse::feed_session(&mut session, stream::iter(chunks))
        .await
        .expect("stream");

    let acc = session.stream().expect("stream");
    assert_eq!(acc.content(0), Some("Hello"));
    assert_eq!(acc.usage(), Some(UsageRecord::new(25, 15, 40)));

    let mut metadata = DynamicMetadata::new();
    session.complete(&mut metadata).expect("complete");
    assert_eq!(metadata.get(NS, "used_token"), Some(&json!(40)));
}

const OPENAI_USAGE_LAST: [&str; 4] = [
    r#"{"choices":[{"index":0,"delta":{"role":"assistant","content":"This is a test."},"finish_reason":null}],"usage":null}"#,
    r#"{"choices":[{"index":0,"delta":{},"finish_reason":"stop"}],"usage":null}"#,
    r#"{"choices":[],"usage":{"prompt_tokens":1,"completion_tokens":1,"total_tokens":2}}"#,
    "[DONE]",
];

#[test]
fn header_routed_session_keeps_usage_sent_after_finish() {
    let processor = Processor::new(&config("skip")).expect("processor");
    let mut session = processor.session();
    session.on_request_headers([("X-Model-Name", "gpt-4o-mini")]);
    session.route().expect("route");
    for event in OPENAI_USAGE_LAST {
        session.on_stream_event(event.as_bytes()).expect("event");
    }
    let mut metadata = DynamicMetadata::new();
    let report = session.complete(&mut metadata).expect("complete");
    assert!(report.skipped.is_empty());
    assert_eq!(metadata.get(NS, "used_token"), Some(&json!(2)));
    assert_eq!(metadata.get(NS, "input"), Some(&json!(1)));
}

#[test]
fn usage_on_finish_chunk_completes_without_sentinel() {
    let processor = Processor::new(&config("skip")).expect("processor");
    let mut session = routed(&processor, "gpt-4o-mini", true);
    session
        .on_stream_event(br#"{"choices":[{"index":0,"delta":{"content":"Hello"}}]}"#)
        .expect("first");
    session
        .on_stream_event(br#"{"choices":[{"index":0,"delta":{"content":" world"},"finish_reason":"stop"}],"usage":{"prompt_tokens":10,"completion_tokens":5,"total_tokens":15}}"#)
        .expect("second");
    assert!(session.stream().is_some_and(|s| s.is_closed()));

    let mut metadata = DynamicMetadata::new();
    session.complete(&mut metadata).expect("complete");
    assert_eq!(metadata.get(NS, "used_token"), Some(&json!(15)));
    assert_eq!(metadata.get(NS, "input"), Some(&json!(10)));
}

#[test]
fn stream_before_routing_is_rejected() {
    let processor = Processor::new(&config("skip")).expect("processor");
    let mut session = processor.session();
    let err = session
        .on_stream_event(OPENAI_USAGE_LAST[0].as_bytes())
        .expect_err("not routed");
    assert_eq!(err.code(), "not_routed");
    assert!(session.stream().is_none());
    let err = session
        .on_response_body(br#"{"choices":[]}"#)
        .expect_err("not routed");
    assert_eq!(err.code(), "not_routed");
}

#[test]
fn no_configured_costs_publishes_nothing() {
    let mut cfg = config("zero");
    cfg.llm_request_costs.clear();
    let processor = Processor::new(&cfg).expect("processor");
    let mut session = routed(&processor, "gpt-4o-mini", false);
    session
        .on_response_body(br#"{"choices":[],"usage":{"prompt_tokens":3,"completion_tokens":1,"total_tokens":4}}"#)
        .expect("body");
    let mut metadata = DynamicMetadata::new();
    let report = session.complete(&mut metadata).expect("complete");
    assert!(report.values.is_empty());
    assert!(metadata.is_empty());
}
