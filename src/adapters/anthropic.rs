use crate::adapters::{
    AdapterEntry, ChoiceDelta, ResponseSummary, SchemaAdapter, StreamChunk, ToolCallDelta,
    UsageRecord, UsageUpdate,
};
use crate::apischema::anthropic::{
    ContentBlock, ContentDelta, MessagesResponse, StreamEvent, Usage,
};
use crate::config::ApiSchemaName;
use crate::error::ParseError;

pub struct AnthropicAdapter;

// Messages has no total field, so the total is the sum of what it reports.
fn usage_record(usage: Usage) -> UsageRecord {
    let prompt = usage.prompt_tokens();
    UsageRecord::new(
        prompt,
        usage.output_tokens,
        prompt.saturating_add(usage.output_tokens),
    )
}

fn finish_reason(stop_reason: &str) -> Option<String> {
    let mapped = match stop_reason {
        "" => return None,
        "end_turn" | "stop_sequence" | "pause_turn" => "stop",
        "max_tokens" => "length",
        "tool_use" => "tool_calls",
        "refusal" => "content_filter",
        other => other,
    };
    Some(mapped.to_string())
}

impl SchemaAdapter for AnthropicAdapter {
    fn schema(&self) -> ApiSchemaName {
        ApiSchemaName::Anthropic
    }

    fn parse_response(&self, body: &[u8]) -> Result<ResponseSummary, ParseError> {
        let resp: MessagesResponse = serde_json::from_slice(body)?;
        Ok(ResponseSummary {
            usage: resp.usage.map(usage_record),
            finish_reason: resp.stop_reason.as_deref().and_then(finish_reason),
            choices: 1,
        })
    }

    fn parse_chunk(&self, raw: &[u8]) -> Result<StreamChunk, ParseError> {
        let event: StreamEvent = serde_json::from_slice(raw)?;
        let chunk = match event {
            StreamEvent::MessageStart { message } => StreamChunk {
                choices: vec![ChoiceDelta {
                    role: Some("assistant".to_string()),
                    ..ChoiceDelta::default()
                }],
                usage: message.usage.map(|u| UsageUpdate::Patch {
                    prompt_tokens: Some(u.prompt_tokens()),
                    completion_tokens: Some(u.output_tokens),
                }),
                end_of_stream: false,
            },
            StreamEvent::ContentBlockStart {
                index,
                content_block: ContentBlock::ToolUse { id, name, .. },
            } => StreamChunk {
                choices: vec![ChoiceDelta {
                    tool_calls: vec![ToolCallDelta {
                        index,
                        id: Some(id),
                        name: Some(name),
                        arguments: None,
                    }],
                    ..ChoiceDelta::default()
                }],
                ..StreamChunk::default()
            },
            StreamEvent::ContentBlockStart {
                content_block: ContentBlock::Text { text },
                ..
            } if !text.is_empty() => StreamChunk {
                choices: vec![ChoiceDelta {
                    content: Some(text),
                    ..ChoiceDelta::default()
                }],
                ..StreamChunk::default()
            },
            StreamEvent::ContentBlockDelta { index, delta } => match delta {
                ContentDelta::TextDelta { text } => StreamChunk {
                    choices: vec![ChoiceDelta {
                        content: Some(text),
                        ..ChoiceDelta::default()
                    }],
                    ..StreamChunk::default()
                },
                ContentDelta::InputJsonDelta { partial_json } => StreamChunk {
                    choices: vec![ChoiceDelta {
                        tool_calls: vec![ToolCallDelta {
                            index,
                            arguments: Some(partial_json),
                            ..ToolCallDelta::default()
                        }],
                        ..ChoiceDelta::default()
                    }],
                    ..StreamChunk::default()
                },
                _ => StreamChunk::default(),
            },
            StreamEvent::MessageDelta { delta, usage } => StreamChunk {
                choices: vec![ChoiceDelta {
                    finish_reason: delta.stop_reason.as_deref().and_then(finish_reason),
                    ..ChoiceDelta::default()
                }],
                usage: usage.map(|u| UsageUpdate::Patch {
                    prompt_tokens: u.prompt_tokens(),
                    completion_tokens: u.output_tokens,
                }),
                end_of_stream: false,
            },
            StreamEvent::MessageStop => StreamChunk {
                end_of_stream: true,
                ..StreamChunk::default()
            },
            StreamEvent::Error { error } => {
                return Err(ParseError::InvalidEvent(error.to_string()));
            }
            _ => StreamChunk::default(),
        };
        Ok(chunk)
    }
}

inventory::submit!(AdapterEntry {
    factory: || Box::new(AnthropicAdapter),
});
