use crate::adapters::{
    AdapterEntry, ChoiceDelta, ResponseSummary, SchemaAdapter, StreamChunk, ToolCallDelta,
    UsageRecord, UsageUpdate,
};
use crate::apischema::awsbedrock::{ConverseResponse, ConverseStreamEvent, TokenUsage};
use crate::config::ApiSchemaName;
use crate::error::ParseError;

pub struct AWSBedrockAdapter;

fn usage_record(usage: TokenUsage) -> UsageRecord {
    UsageRecord::new(usage.input_tokens, usage.output_tokens, usage.total_tokens)
}

/// Converse stop reasons expressed as chat-completions finish reasons.
fn finish_reason(stop_reason: &str) -> Option<String> {
    let mapped = match stop_reason {
        "" => return None,
        "end_turn" | "stop_sequence" => "stop",
        "max_tokens" => "length",
        "tool_use" => "tool_calls",
        "guardrail_intervened" | "content_filtered" => "content_filter",
        other => other,
    };
    Some(mapped.to_string())
}

impl SchemaAdapter for AWSBedrockAdapter {
    fn schema(&self) -> ApiSchemaName {
        ApiSchemaName::AWSBedrock
    }

    fn parse_response(&self, body: &[u8]) -> Result<ResponseSummary, ParseError> {
        let resp: ConverseResponse = serde_json::from_slice(body)?;
        let choices = resp
            .output
            .as_ref()
            .and_then(|o| o.message.as_ref())
            .map(|_| 1)
            .unwrap_or(0);
        Ok(ResponseSummary {
            usage: resp.usage.map(usage_record),
            finish_reason: resp.stop_reason.as_deref().and_then(finish_reason),
            choices,
        })
    }

    fn parse_chunk(&self, raw: &[u8]) -> Result<StreamChunk, ParseError> {
        let event: ConverseStreamEvent = serde_json::from_slice(raw)?;
        let mut chunk = StreamChunk::default();
        if let Some(start) = event.message_start {
            chunk.choices.push(ChoiceDelta {
                role: Some(start.role),
                ..ChoiceDelta::default()
            });
        }
        if let Some(start) = event.content_block_start {
            if let Some(tool) = start.start.and_then(|s| s.tool_use) {
                chunk.choices.push(ChoiceDelta {
                    tool_calls: vec![ToolCallDelta {
                        index: start.content_block_index,
                        id: Some(tool.tool_use_id),
                        name: Some(tool.name),
                        arguments: None,
                    }],
                    ..ChoiceDelta::default()
                });
            }
        }
        if let Some(delta) = event.content_block_delta {
            let mut choice = ChoiceDelta {
                content: delta.delta.text,
                ..ChoiceDelta::default()
            };
            if let Some(tool) = delta.delta.tool_use {
                choice.tool_calls.push(ToolCallDelta {
                    index: delta.content_block_index,
                    arguments: Some(tool.input),
                    ..ToolCallDelta::default()
                });
            }
            chunk.choices.push(choice);
        }
        if let Some(stop) = event.message_stop {
            chunk.choices.push(ChoiceDelta {
                finish_reason: finish_reason(&stop.stop_reason),
                ..ChoiceDelta::default()
            });
        }
        if let Some(metadata) = event.metadata {
            chunk.usage = metadata
                .usage
                .map(|u| UsageUpdate::Replace(usage_record(u)));
            // metadata is the last event Converse sends
            chunk.end_of_stream = true;
        }
        Ok(chunk)
    }
}

inventory::submit!(AdapterEntry {
    factory: || Box::new(AWSBedrockAdapter),
});
