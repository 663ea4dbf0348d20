use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;

use crate::config::ApiSchemaName;
use crate::error::ParseError;

pub mod anthropic;
pub mod awsbedrock;
pub mod openai;

/// Normalized token counters. `total_tokens` is taken as reported and never
/// recomputed for upstreams that send it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UsageRecord {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl UsageRecord {
    pub fn new(prompt_tokens: u64, completion_tokens: u64, total_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsageUpdate {
    /// Authoritative counters, replacing anything captured before.
    Replace(UsageRecord),
    /// Counters reported piecemeal by upstreams that have no total field.
    /// Missing fields keep their previous value and the total is their sum.
    Patch {
        prompt_tokens: Option<u64>,
        completion_tokens: Option<u64>,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolCallDelta {
    pub index: u32,
    pub id: Option<String>,
    pub name: Option<String>,
    pub arguments: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChoiceDelta {
    pub index: u32,
    pub role: Option<String>,
    pub content: Option<String>,
    pub tool_calls: Vec<ToolCallDelta>,
    pub finish_reason: Option<String>,
}

/// One upstream stream event mapped onto the chat-completions chunk model.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamChunk {
    pub choices: Vec<ChoiceDelta>,
    pub usage: Option<UsageUpdate>,
    /// Set by upstreams that mark the end of the stream with an event of
    /// their own rather than a transport sentinel.
    pub end_of_stream: bool,
}

/// What the cost pipeline needs out of a non-streaming response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResponseSummary {
    pub usage: Option<UsageRecord>,
    pub finish_reason: Option<String>,
    pub choices: usize,
}

pub trait SchemaAdapter: Send + Sync + 'static {
    fn schema(&self) -> ApiSchemaName;

    fn parse_response(&self, body: &[u8]) -> Result<ResponseSummary, ParseError>;

    fn parse_chunk(&self, raw: &[u8]) -> Result<StreamChunk, ParseError>;

    fn parse_usage(&self, body: &[u8]) -> Result<Option<UsageRecord>, ParseError> {
        Ok(self.parse_response(body)?.usage)
    }
}

pub struct AdapterEntry {
    pub factory: fn() -> Box<dyn SchemaAdapter>,
}

inventory::collect!(AdapterEntry);

pub type AdapterRegistry = HashMap<ApiSchemaName, Arc<dyn SchemaAdapter>>;

pub fn registry() -> AdapterRegistry {
    let mut map = HashMap::new();
    for entry in inventory::iter::<AdapterEntry> {
        let adapter = (entry.factory)();
        map.insert(adapter.schema(), Arc::<dyn SchemaAdapter>::from(adapter));
    }
    map
}

pub fn lookup(
    registry: &AdapterRegistry,
    schema: ApiSchemaName,
) -> Result<&Arc<dyn SchemaAdapter>, ParseError> {
    registry
        .get(&schema)
        .ok_or_else(|| ParseError::UnknownSchema(schema.as_str().to_string()))
}
