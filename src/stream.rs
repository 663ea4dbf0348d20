use std::collections::BTreeMap;

use crate::adapters::{ChoiceDelta, SchemaAdapter, StreamChunk, UsageRecord, UsageUpdate};
use crate::apischema::openai::{
    ChatCompletionMessageToolCall, ChatCompletionResponse, ChatCompletionResponseChoice,
    ChatCompletionResponseMessage, OBJECT_CHAT_COMPLETION, ToolCallFunction, ToolType, Usage,
};
use crate::error::StreamError;

/// Transport-level end marker of an SSE chat-completions stream.
pub const END_SENTINEL: &str = "[DONE]";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamPhase {
    Open,
    Receiving,
    Closed,
    Aborted,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccumulatedToolCall {
    pub index: u32,
    pub id: Option<String>,
    pub name: Option<String>,
    pub arguments: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccumulatedChoice {
    pub index: u32,
    pub role: Option<String>,
    pub content: String,
    pub tool_calls: BTreeMap<u32, AccumulatedToolCall>,
    pub finish_reason: Option<String>,
}

impl ChoiceDelta {
    /// Carries nothing that would change the assembled response.
    fn is_empty(&self) -> bool {
        self.content.as_deref().is_none_or(str::is_empty)
            && self.tool_calls.is_empty()
            && self.finish_reason.is_none()
    }
}

impl AccumulatedChoice {
    fn merge(&mut self, delta: ChoiceDelta) {
        if self.role.is_none() {
            self.role = delta.role;
        }
        if let Some(content) = delta.content {
            self.content.push_str(&content);
        }
        for fragment in delta.tool_calls {
            let call = self
                .tool_calls
                .entry(fragment.index)
                .or_insert_with(|| AccumulatedToolCall {
                    index: fragment.index,
                    ..AccumulatedToolCall::default()
                });
            if call.id.is_none() {
                call.id = fragment.id.filter(|v| !v.is_empty());
            }
            if call.name.is_none() {
                call.name = fragment.name.filter(|v| !v.is_empty());
            }
            if let Some(arguments) = fragment.arguments {
                call.arguments.push_str(&arguments);
            }
        }
        if let Some(reason) = delta.finish_reason {
            self.finish_reason = Some(reason);
        }
    }
}

/// Per-request accumulator for a streamed response. Owned by a single request
/// flow; chunks must be fed in arrival order.
///
/// The stream closes once every seen choice has a finish reason, or on an
/// end event or sentinel. Upstreams report usage after the finish reason
/// (OpenAI `include_usage`, Bedrock `metadata`, Anthropic `message_stop`), so
/// until an end event or sentinel arrives a closed stream still takes chunks
/// that carry no content and applies their usage.
#[derive(Debug, Clone)]
pub struct StreamAccumulator {
    phase: StreamPhase,
    choices: BTreeMap<u32, AccumulatedChoice>,
    usage: Option<UsageRecord>,
    // end event or sentinel seen; nothing may follow
    terminated: bool,
    chunks: usize,
}

impl Default for StreamAccumulator {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamAccumulator {
    pub fn new() -> Self {
        Self {
            phase: StreamPhase::Open,
            choices: BTreeMap::new(),
            usage: None,
            terminated: false,
            chunks: 0,
        }
    }

    pub fn phase(&self) -> StreamPhase {
        self.phase
    }

    pub fn is_closed(&self) -> bool {
        self.phase == StreamPhase::Closed
    }

    pub fn chunks(&self) -> usize {
        self.chunks
    }

    pub fn usage(&self) -> Option<UsageRecord> {
        self.usage
    }

    pub fn choices(&self) -> impl Iterator<Item = &AccumulatedChoice> {
        self.choices.values()
    }

    pub fn choice(&self, index: u32) -> Option<&AccumulatedChoice> {
        self.choices.get(&index)
    }

    pub fn content(&self, index: u32) -> Option<&str> {
        self.choices.get(&index).map(|c| c.content.as_str())
    }

    pub fn finish_reason(&self) -> Option<&str> {
        self.choices
            .values()
            .next()
            .and_then(|c| c.finish_reason.as_deref())
    }

    pub fn ingest(&mut self, chunk: StreamChunk) -> Result<(), StreamError> {
        match self.phase {
            StreamPhase::Closed if self.terminated || !is_trailer(&chunk) => {
                tracing::warn!(chunks = self.chunks, "chunk received after stream closed");
                metrics::counter!("aigw_stream_late_chunks_total").increment(1);
                return Err(StreamError::AlreadyClosed);
            }
            StreamPhase::Aborted => return Err(StreamError::Aborted),
            StreamPhase::Open => self.phase = StreamPhase::Receiving,
            StreamPhase::Receiving | StreamPhase::Closed => {}
        }
        self.chunks += 1;

        let mut saw_finish = false;
        let trailing = self.phase == StreamPhase::Closed;
        for delta in chunk.choices.into_iter().filter(|_| !trailing) {
            saw_finish |= delta.finish_reason.is_some();
            self.choices
                .entry(delta.index)
                .or_insert_with(|| AccumulatedChoice {
                    index: delta.index,
                    ..AccumulatedChoice::default()
                })
                .merge(delta);
        }

        if let Some(update) = chunk.usage {
            self.apply_usage(update);
        }

        let all_finished = !self.choices.is_empty()
            && self.choices.values().all(|c| c.finish_reason.is_some());
        if chunk.end_of_stream {
            self.terminated = true;
            self.close();
        } else if saw_finish && all_finished && self.phase != StreamPhase::Closed {
            self.close();
        }
        Ok(())
    }

    /// Parses and ingests one event payload. The end sentinel closes the
    /// stream; a payload that fails to parse is reported and skipped.
    pub fn ingest_event(
        &mut self,
        adapter: &dyn SchemaAdapter,
        data: &[u8],
    ) -> Result<(), StreamError> {
        if is_end_sentinel(data) {
            return self.finish();
        }
        if self.terminated {
            return self.ingest(StreamChunk::default());
        }
        let chunk = adapter.parse_chunk(data).map_err(|err| {
            metrics::counter!("aigw_usage_parse_errors_total",
                "schema" => adapter.schema().as_str()
            )
            .increment(1);
            tracing::warn!(schema = adapter.schema().as_str(), error = %err, "skipping malformed stream chunk");
            StreamError::Parse(err)
        })?;
        self.ingest(chunk)
    }

    /// Transport signalled the end of the stream. Idempotent once closed.
    pub fn finish(&mut self) -> Result<(), StreamError> {
        match self.phase {
            StreamPhase::Aborted => Err(StreamError::Aborted),
            _ => {
                self.terminated = true;
                self.close();
                Ok(())
            }
        }
    }

    /// Connection ended before a terminal event. Everything buffered is
    /// dropped and no usage survives.
    pub fn abort(&mut self) -> StreamError {
        if self.phase != StreamPhase::Aborted {
            metrics::counter!("aigw_stream_aborts_total").increment(1);
            tracing::warn!(chunks = self.chunks, "stream aborted before completion");
        }
        self.phase = StreamPhase::Aborted;
        self.choices.clear();
        self.usage = None;
        StreamError::Aborted
    }

    /// Assembles the buffered deltas into a non-streaming response.
    pub fn to_response(&self) -> ChatCompletionResponse {
        let choices = self
            .choices
            .values()
            .map(|c| ChatCompletionResponseChoice {
                index: c.index,
                finish_reason: c.finish_reason.clone(),
                message: ChatCompletionResponseMessage {
                    content: if c.content.is_empty() && !c.tool_calls.is_empty() {
                        None
                    } else {
                        Some(c.content.clone())
                    },
                    role: c.role.clone().unwrap_or_else(|| "assistant".to_string()),
                    refusal: None,
                    tool_calls: c
                        .tool_calls
                        .values()
                        .map(|call| ChatCompletionMessageToolCall {
                            id: call.id.clone().unwrap_or_default(),
                            kind: ToolType::Function,
                            function: ToolCallFunction {
                                name: call.name.clone().unwrap_or_default(),
                                arguments: call.arguments.clone(),
                            },
                        })
                        .collect(),
                },
                logprobs: None,
            })
            .collect();
        ChatCompletionResponse {
            id: None,
            choices,
            model: None,
            object: OBJECT_CHAT_COMPLETION.to_string(),
            usage: self.usage.map(|u| Usage {
                prompt_tokens: u.prompt_tokens,
                completion_tokens: u.completion_tokens,
                total_tokens: u.total_tokens,
            }),
        }
    }

    fn apply_usage(&mut self, update: UsageUpdate) {
        match update {
            UsageUpdate::Replace(record) => self.usage = Some(record),
            UsageUpdate::Patch {
                prompt_tokens,
                completion_tokens,
            } => {
                let mut record = self.usage.unwrap_or_default();
                if let Some(v) = prompt_tokens {
                    record.prompt_tokens = v;
                }
                if let Some(v) = completion_tokens {
                    record.completion_tokens = v;
                }
                record.total_tokens = record.prompt_tokens.saturating_add(record.completion_tokens);
                self.usage = Some(record);
            }
        }
    }

    fn close(&mut self) {
        if self.phase == StreamPhase::Closed {
            return;
        }
        self.phase = StreamPhase::Closed;
        tracing::debug!(
            chunks = self.chunks,
            has_usage = self.usage.is_some(),
            "stream closed"
        );
    }
}

fn is_trailer(chunk: &StreamChunk) -> bool {
    chunk.choices.iter().all(ChoiceDelta::is_empty)
}

pub fn is_end_sentinel(data: &[u8]) -> bool {
    data.trim_ascii() == END_SENTINEL.as_bytes()
}
