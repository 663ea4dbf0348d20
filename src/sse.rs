use std::fmt::Display;

use eventsource_stream::{EventStreamError, Eventsource};
use futures_util::{Stream, StreamExt};

use crate::adapters::SchemaAdapter;
use crate::error::{ProcessingError, StreamError};
use crate::processor::RequestSession;
use crate::stream::StreamAccumulator;

/// Drives `accumulator` from an SSE byte stream until the stream closes.
///
/// A clean end of the body counts as the end sentinel. A transport error
/// aborts the stream. Malformed events and events after close are reported
/// and skipped.
pub async fn accumulate_event_stream<S, B, E>(
    accumulator: &mut StreamAccumulator,
    adapter: &dyn SchemaAdapter,
    body: S,
) -> Result<(), StreamError>
where
    S: Stream<Item = Result<B, E>> + Unpin,
    B: AsRef<[u8]>,
    E: Display,
{
    let mut events = body.eventsource();
    while let Some(event) = events.next().await {
        let event = match event {
            Ok(event) => event,
            Err(EventStreamError::Transport(err)) => {
                tracing::warn!(error = %err, "upstream stream failed");
                return Err(accumulator.abort());
            }
            Err(err) => {
                tracing::warn!(error = %err, "skipping undecodable event");
                continue;
            }
        };
        match accumulator.ingest_event(adapter, event.data.as_bytes()) {
            Ok(()) | Err(StreamError::Parse(_)) | Err(StreamError::AlreadyClosed) => {}
            Err(err) => return Err(err),
        }
    }
    accumulator.finish()
}

/// Same as [`accumulate_event_stream`], feeding a request session.
pub async fn feed_session<S, B, E>(
    session: &mut RequestSession,
    body: S,
) -> Result<(), ProcessingError>
where
    S: Stream<Item = Result<B, E>> + Unpin,
    B: AsRef<[u8]>,
    E: Display,
{
    let mut events = body.eventsource();
    while let Some(event) = events.next().await {
        let event = match event {
            Ok(event) => event,
            Err(EventStreamError::Transport(err)) => {
                tracing::warn!(error = %err, "upstream stream failed");
                return Err(session.on_stream_abort());
            }
            Err(err) => {
                tracing::warn!(error = %err, "skipping undecodable event");
                continue;
            }
        };
        match session.on_stream_event(event.data.as_bytes()) {
            Ok(())
            | Err(ProcessingError::Stream(StreamError::Parse(_)))
            | Err(ProcessingError::Stream(StreamError::AlreadyClosed)) => {}
            Err(err) => return Err(err),
        }
    }
    session.on_stream_end()
}
