use crate::adapters::{
    AdapterEntry, ChoiceDelta, ResponseSummary, SchemaAdapter, StreamChunk, ToolCallDelta,
    UsageRecord, UsageUpdate,
};
use crate::apischema::openai::{ChatCompletionChunk, ChatCompletionResponse, Usage};
use crate::config::ApiSchemaName;
use crate::error::ParseError;

pub struct OpenAIAdapter;

fn usage_record(usage: Usage) -> UsageRecord {
    UsageRecord::new(
        usage.prompt_tokens,
        usage.completion_tokens,
        usage.total_tokens,
    )
}

impl SchemaAdapter for OpenAIAdapter {
    fn schema(&self) -> ApiSchemaName {
        ApiSchemaName::OpenAI
    }

    fn parse_response(&self, body: &[u8]) -> Result<ResponseSummary, ParseError> {
        let resp: ChatCompletionResponse = serde_json::from_slice(body)?;
        Ok(ResponseSummary {
            usage: resp.usage.map(usage_record),
            finish_reason: resp
                .choices
                .first()
                .and_then(|c| c.finish_reason.clone())
                .filter(|v| !v.is_empty()),
            choices: resp.choices.len(),
        })
    }

    fn parse_chunk(&self, raw: &[u8]) -> Result<StreamChunk, ParseError> {
        let chunk: ChatCompletionChunk = serde_json::from_slice(raw)?;
        let choices = chunk
            .choices
            .into_iter()
            .map(|choice| ChoiceDelta {
                index: choice.index,
                role: choice.delta.role,
                content: choice.delta.content,
                tool_calls: choice
                    .delta
                    .tool_calls
                    .into_iter()
                    .map(|call| {
                        let (name, arguments) = match call.function {
                            Some(f) => (f.name, f.arguments),
                            None => (None, None),
                        };
                        ToolCallDelta {
                            index: call.index,
                            id: call.id,
                            name,
                            arguments,
                        }
                    })
                    .collect(),
                finish_reason: choice.finish_reason.filter(|v| !v.is_empty()),
            })
            .collect();
        Ok(StreamChunk {
            choices,
            usage: chunk.usage.map(|u| UsageUpdate::Replace(usage_record(u))),
            end_of_stream: false,
        })
    }
}

inventory::submit!(AdapterEntry {
    factory: || Box::new(OpenAIAdapter),
});

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_usage_from_body() {
        let body = br#"{"object":"chat.completion","choices":[{"index":0,"finish_reason":"stop","message":{"role":"assistant","content":"hi"}}],"usage":{"prompt_tokens":10000,"completion_tokens":3,"total_tokens":10003}}"#;
        let usage = OpenAIAdapter.parse_usage(body).unwrap();
        assert_eq!(usage, Some(UsageRecord::new(10000, 3, 10003)));
    }

    #[test]
    fn parsing_is_idempotent() {
        let body = br#"{"choices":[],"usage":{"prompt_tokens":1,"completion_tokens":2,"total_tokens":3}}"#;
        let first = OpenAIAdapter.parse_response(body).unwrap();
        let second = OpenAIAdapter.parse_response(body).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn absent_usage_is_not_an_error() {
        let body = br#"{"choices":[{"message":{"content":"This is a test."}}]}"#;
        let summary = OpenAIAdapter.parse_response(body).unwrap();
        assert_eq!(summary.usage, None);
        assert_eq!(summary.choices, 1);
        assert_eq!(summary.finish_reason, None);
    }

    #[test]
    fn partial_usage_reads_missing_counters_as_zero() {
        let body = br#"{"choices":[],"usage":{"prompt_tokens":7}}"#;
        let usage = OpenAIAdapter.parse_usage(body).unwrap();
        assert_eq!(usage, Some(UsageRecord::new(7, 0, 0)));
    }

    #[test]
    fn reported_total_is_not_recomputed() {
        let body = br#"{"choices":[],"usage":{"prompt_tokens":1,"completion_tokens":1,"total_tokens":99}}"#;
        let usage = OpenAIAdapter.parse_usage(body).unwrap();
        assert_eq!(usage.map(|u| u.total_tokens), Some(99));
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let body = br#"{"choices":[],"system_fingerprint":"fp","usage":{"prompt_tokens":1,"completion_tokens":1,"total_tokens":2,"prompt_tokens_details":{"cached_tokens":0}}}"#;
        assert!(OpenAIAdapter.parse_usage(body).unwrap().is_some());
    }

    #[test]
    fn type_mismatch_and_bad_json_are_errors() {
        let body = br#"{"choices":[],"usage":{"prompt_tokens":"ten"}}"#;
        assert!(matches!(
            OpenAIAdapter.parse_usage(body),
            Err(ParseError::Json(_))
        ));
        assert!(OpenAIAdapter.parse_usage(b"{not json").is_err());
    }

    #[test]
    fn chunk_maps_tool_call_fragments() {
        let raw = br#"{"object":"chat.completion.chunk","choices":[{"index":0,"delta":{"tool_calls":[{"index":1,"id":"call_9","type":"function","function":{"name":"lookup","arguments":"{\"q\""}}]},"finish_reason":null}],"usage":null}"#;
        let chunk = OpenAIAdapter.parse_chunk(raw).unwrap();
        assert!(chunk.usage.is_none());
        let call = &chunk.choices[0].tool_calls[0];
        assert_eq!(call.index, 1);
        assert_eq!(call.id.as_deref(), Some("call_9"));
        assert_eq!(call.name.as_deref(), Some("lookup"));
        assert_eq!(call.arguments.as_deref(), Some("{\"q\""));
    }

    #[test]
    fn usage_only_chunk() {
        let raw = br#"{"object":"chat.completion.chunk","choices":[],"usage":{"prompt_tokens":10,"completion_tokens":5,"total_tokens":15}}"#;
        let chunk = OpenAIAdapter.parse_chunk(raw).unwrap();
        assert!(chunk.choices.is_empty());
        assert_eq!(
            chunk.usage,
            Some(UsageUpdate::Replace(UsageRecord::new(10, 5, 15)))
        );
    }
}
