use thiserror::Error;

use crate::apischema::openai::{ChatCompletionError, ChatCompletionErrorBody};

#[derive(Debug, Error)]
pub enum RouteError {
    #[error("no matching rule for the request headers")]
    NoMatchingRule,
    #[error("request has not been routed to a backend")]
    NotRouted,
}

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("invalid body: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unknown schema: {0}")]
    UnknownSchema(String),
    #[error("invalid event: {0}")]
    InvalidEvent(String),
}

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("chunk received after the stream was closed")]
    AlreadyClosed,
    #[error("stream aborted before completion")]
    Aborted,
    #[error(transparent)]
    Parse(#[from] ParseError),
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum CostError {
    #[error("usage is not available")]
    MissingUsage,
    #[error("expression evaluation failed: {0}")]
    Evaluation(String),
    #[error("expression produced a non-numeric value: {0}")]
    NotNumeric(String),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MetadataError {
    #[error("invalid metadata namespace: {0:?}")]
    InvalidNamespace(String),
    #[error("invalid metadata key: {0:?}")]
    InvalidKey(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("rule has no header matchers")]
    EmptyMatchers,
    #[error("rule has no backends")]
    EmptyBackends,
    #[error("backend {0:?} is declared more than once in a rule")]
    DuplicateBackend(String),
    #[error("rule {index}: {source}")]
    InvalidRule {
        index: usize,
        #[source]
        source: Box<ConfigError>,
    },
    #[error("unsupported schema: {0}")]
    UnsupportedSchema(String),
    #[error("cost {key:?} has an invalid expression: {message}")]
    InvalidExpression { key: String, message: String },
    #[error("cost {0:?} is an expression cost without an expression")]
    MissingExpression(String),
    #[error("cost key {0:?} is declared more than once")]
    DuplicateCostKey(String),
    #[error(transparent)]
    Metadata(#[from] MetadataError),
}

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("failed to install metrics recorder: {0}")]
    MetricsRecorder(String),
}

/// Failures surfaced by a request session. None of them is fatal to the host.
#[derive(Debug, Error)]
pub enum ProcessingError {
    #[error(transparent)]
    Route(#[from] RouteError),
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Stream(#[from] StreamError),
    #[error(transparent)]
    Metadata(#[from] MetadataError),
}

impl ProcessingError {
    pub fn code(&self) -> &'static str {
        match self {
            ProcessingError::Route(RouteError::NoMatchingRule) => "no_matching_rule",
            ProcessingError::Route(RouteError::NotRouted) => "not_routed",
            ProcessingError::Parse(_) => "invalid_body",
            ProcessingError::Stream(StreamError::Aborted) => "stream_aborted",
            ProcessingError::Stream(_) => "stream_protocol_error",
            ProcessingError::Metadata(_) => "metadata_rejected",
        }
    }

    /// Error envelope in the chat-completions wire shape, for hosts that answer
    /// the client directly.
    pub fn to_wire(&self) -> ChatCompletionError {
        let error_type = match self {
            ProcessingError::Route(RouteError::NoMatchingRule) | ProcessingError::Parse(_) => {
                "invalid_request_error"
            }
            _ => "server_error",
        };
        ChatCompletionError {
            kind: "error".to_string(),
            event_id: None,
            error: ChatCompletionErrorBody {
                kind: error_type.to_string(),
                code: Some(self.code().to_string()),
                message: self.to_string(),
                param: None,
                event_id: None,
            },
        }
    }
}
