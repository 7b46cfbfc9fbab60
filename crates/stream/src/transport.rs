//! Event transport: one server-streamed connection.
//!
//! [`open`] spawns a task that connects through a [`Connector`], decodes
//! server-sent events, parses them into [`StreamMessage`]s and hands each one to
//! the caller's `on_event` callback. When the stream ends for any reason
//! the `on_closed` callback runs exactly once with a [`CloseReason`].
//!
//! The transport interprets nothing beyond "is this message terminal for
//! the current [`StreamMode`]". After a terminal message it stops reading
//! and drops the connection itself.

use std::sync::Arc;

use bytes::Bytes;
use eventsource_stream::{Event, EventStreamError, Eventsource};
use futures::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;

use crate::client::{Connector, TransportError};
use crate::messages::{parse_message, StreamMessage};

/// Which messages end a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamMode {
    /// One input: `result` and `error` are terminal.
    Single,
    /// Many inputs: only the final `complete` ranking is terminal.
    Batch,
}

impl StreamMode {
    pub fn is_terminal(&self, message: &StreamMessage) -> bool {
        match self {
            Self::Single => matches!(message, StreamMessage::Result(_) | StreamMessage::Error(_)),
            Self::Batch => matches!(message, StreamMessage::BatchComplete(_)),
        }
    }
}

/// Why a transport stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// A terminal message was delivered; the transport closed itself.
    Terminal,
    /// The connection was never established.
    ConnectFailed(TransportError),
    /// The stream was lost before a terminal message.
    Dropped(String),
    /// [`TransportHandle::close`] was called.
    Closed,
}

/// Event name for frames that carry no `event:` field.
pub const DEFAULT_EVENT: &str = "message";

/// Reason carried by [`CloseReason::Dropped`] when the body simply ends.
pub const STREAM_ENDED: &str = "Stream ended before a terminal event";

/// Handle to a running transport.
///
/// Closing is idempotent and does not wait for the task to finish.
/// Dropping the handle closes the transport.
#[derive(Debug)]
pub struct TransportHandle {
    cancel: CancellationToken,
}

impl TransportHandle {
    pub fn close(&self) {
        self.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Drop for TransportHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Open a transport on `url`.
///
/// Must be called from within a tokio runtime. Callbacks run on the
/// transport task, in stream order.
pub fn open<E, C>(
    connector: Arc<dyn Connector>,
    url: String,
    mode: StreamMode,
    on_event: E,
    on_closed: C,
) -> TransportHandle
where
    E: FnMut(StreamMessage) + Send + 'static,
    C: FnOnce(CloseReason) + Send + 'static,
{
    let cancel = CancellationToken::new();
    let task_cancel = cancel.clone();

    tokio::spawn(async move {
        let mut on_event = on_event;
        let reason = tokio::select! {
            biased;
            _ = task_cancel.cancelled() => CloseReason::Closed,
            reason = run(connector.as_ref(), &url, mode, &task_cancel, &mut on_event) => reason,
        };
        tracing::debug!(url = %url, ?reason, "Transport closed");
        on_closed(reason);
    });

    TransportHandle { cancel }
}

async fn run<E>(
    connector: &dyn Connector,
    url: &str,
    mode: StreamMode,
    cancel: &CancellationToken,
    on_event: &mut E,
) -> CloseReason
where
    E: FnMut(StreamMessage),
{
    tracing::info!(url = %url, ?mode, "Opening event stream");
    match connector.connect(url).await {
        Ok(stream) => pump(stream, mode, cancel, on_event).await,
        Err(e) => {
            tracing::warn!(url = %url, error = %e, "Failed to open event stream");
            CloseReason::ConnectFailed(e)
        }
    }
}

/// Read `stream` to the end, delivering every parsed message.
///
/// SSE framing (split lines, CRLF, comments, multi-line `data:`) is left
/// to `eventsource-stream`. Returns as soon as a terminal message has been
/// delivered, the stream fails or ends, or `cancel` fires between two
/// messages.
pub async fn pump<S, E>(
    stream: S,
    mode: StreamMode,
    cancel: &CancellationToken,
    on_event: &mut E,
) -> CloseReason
where
    S: Stream<Item = Result<Bytes, TransportError>> + Unpin,
    E: FnMut(StreamMessage),
{
    let events = stream.eventsource();
    futures::pin_mut!(events);

    while let Some(item) = events.next().await {
        if cancel.is_cancelled() {
            return CloseReason::Closed;
        }
        match item {
            Ok(event) => {
                if deliver(&event, mode, on_event) {
                    return CloseReason::Terminal;
                }
            }
            Err(EventStreamError::Transport(e)) => {
                tracing::warn!(error = %e, "Event stream receive error");
                return CloseReason::Dropped(e.to_string());
            }
            Err(e) => {
                tracing::warn!(error = %e, "Skipping undecodable event stream data");
            }
        }
    }

    tracing::info!("Event stream exhausted");
    CloseReason::Dropped(STREAM_ENDED.to_string())
}

/// Parse and deliver one event. Returns `true` if it was terminal.
fn deliver<E>(event: &Event, mode: StreamMode, on_event: &mut E) -> bool
where
    E: FnMut(StreamMessage),
{
    let name = if event.event.is_empty() {
        DEFAULT_EVENT
    } else {
        event.event.as_str()
    };
    match parse_message(name, &event.data) {
        Ok(Some(message)) => {
            let terminal = mode.is_terminal(&message);
            on_event(message);
            terminal
        }
        Ok(None) => {
            tracing::debug!(event = %name, "Ignoring unrecognised stream event");
            false
        }
        Err(e) => {
            tracing::warn!(
                error = %e,
                raw_message = %event.data,
                "Failed to parse stream message",
            );
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use futures::stream;

    use super::*;

    fn chunks(parts: &[&'static str]) -> impl Stream<Item = Result<Bytes, TransportError>> + Unpin {
        stream::iter(
            parts
                .iter()
                .map(|p| Ok(Bytes::from_static(p.as_bytes())))
                .collect::<Vec<_>>(),
        )
    }

    async fn collect(
        parts: &[&'static str],
        mode: StreamMode,
    ) -> (Vec<StreamMessage>, CloseReason) {
        let mut seen = Vec::new();
        let cancel = CancellationToken::new();
        let reason = pump(chunks(parts), mode, &cancel, &mut |m| seen.push(m)).await;
        (seen, reason)
    }

    #[tokio::test]
    async fn result_is_terminal_in_single_mode() {
        let (seen, reason) = collect(
            &[
                "event: progress\ndata: {\"stage\":\"running_market\",\"progress\":10,\"input\":\"AAPL\"}\n\n",
                "event: result\ndata: {\"success\":true,\"input\":\"AAPL\"}\n\n",
                "event: progress\ndata: {\"stage\":\"running_news\",\"input\":\"AAPL\"}\n\n",
            ],
            StreamMode::Single,
        )
        .await;
        assert_eq!(reason, CloseReason::Terminal);
        assert_eq!(seen.len(), 2);
        assert_matches!(seen[1], StreamMessage::Result(_));
    }

    #[tokio::test]
    async fn error_event_is_terminal_in_single_mode() {
        let (seen, reason) = collect(
            &["event: error\ndata: {\"error\":\"boom\",\"input\":\"AAPL\"}\n\n"],
            StreamMode::Single,
        )
        .await;
        assert_eq!(reason, CloseReason::Terminal);
        assert_matches!(&seen[0], StreamMessage::Error(data) if data.error == "boom");
    }

    #[tokio::test]
    async fn batch_mode_continues_past_results() {
        let (seen, reason) = collect(
            &[
                "event: result\ndata: {\"success\":true,\"input\":\"AAPL\"}\n\n",
                "event: error\ndata: {\"error\":\"x\",\"input\":\"MSFT\"}\n\n",
                "event: complete\ndata: {\"results\":[]}\n\n",
            ],
            StreamMode::Batch,
        )
        .await;
        assert_eq!(reason, CloseReason::Terminal);
        assert_eq!(seen.len(), 3);
    }

    #[tokio::test]
    async fn malformed_and_unknown_events_are_skipped() {
        let (seen, reason) = collect(
            &[
                "event: progress\ndata: {broken\n\n",
                "event: heartbeat\ndata: {}\n\n",
                "event: progress\ndata: {\"stage\":\"running_news\",\"progress\":40,\"input\":\"AAPL\"}\n\n",
            ],
            StreamMode::Single,
        )
        .await;
        assert_eq!(seen.len(), 1);
        assert_matches!(&seen[0], StreamMessage::Progress(p) if p.progress == Some(40.0));
        assert_eq!(reason, CloseReason::Dropped(STREAM_ENDED.to_string()));
    }

    #[tokio::test]
    async fn events_split_across_chunks_are_reassembled() {
        let (seen, reason) = collect(
            &[
                ": keep-alive\r\nevent: prog",
                "ress\r\ndata: {\"stage\":\"running_news\",",
                "\"progress\":40,\"input\":\"AAPL\"}\r\n\r\n",
                "event: error\ndata: {\"error\":\"line one\",\n",
                "data: \"input\":\"AAPL\"}\n\n",
            ],
            StreamMode::Single,
        )
        .await;
        assert_eq!(reason, CloseReason::Terminal);
        assert_eq!(seen.len(), 2);
        assert_matches!(&seen[0], StreamMessage::Progress(p) if p.progress == Some(40.0));
        assert_matches!(&seen[1], StreamMessage::Error(e) if e.error == "line one");
    }

    #[tokio::test]
    async fn multibyte_character_split_across_chunks() {
        let raw = "event: error\ndata: {\"error\":\"caf\u{e9}\",\"input\":\"AAPL\"}\n\n";
        let cut = raw.find('\u{e9}').unwrap() + 1;
        let (head, tail) = raw.as_bytes().split_at(cut);
        let parts = stream::iter(vec![
            Ok(Bytes::copy_from_slice(head)),
            Ok(Bytes::copy_from_slice(tail)),
        ]);
        let cancel = CancellationToken::new();
        let mut seen = Vec::new();
        let reason = pump(parts, StreamMode::Single, &cancel, &mut |m| seen.push(m)).await;
        assert_eq!(reason, CloseReason::Terminal);
        assert_matches!(&seen[0], StreamMessage::Error(e) if e.error == "caf\u{e9}");
    }

    #[tokio::test]
    async fn receive_error_drops_stream() {
        let parts = stream::iter(vec![
            Ok(Bytes::from_static(b"event: progress\ndata: {\"stage\":\"x\"}\n\n")),
            Err(TransportError::Protocol("connection reset".into())),
        ]);
        let cancel = CancellationToken::new();
        let mut count = 0;
        let reason = pump(parts, StreamMode::Single, &cancel, &mut |_| count += 1).await;
        assert_eq!(count, 1);
        assert_matches!(reason, CloseReason::Dropped(msg) if msg.contains("connection reset"));
    }

    #[tokio::test]
    async fn cancelled_pump_stops_delivering() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut count = 0;
        let reason = pump(
            chunks(&["event: progress\ndata: {\"stage\":\"x\"}\n\n"]),
            StreamMode::Single,
            &cancel,
            &mut |_| count += 1,
        )
        .await;
        assert_eq!(reason, CloseReason::Closed);
        assert_eq!(count, 0);
    }

    #[test]
    fn handle_close_is_idempotent() {
        let handle = TransportHandle {
            cancel: CancellationToken::new(),
        };
        handle.close();
        handle.close();
        assert!(handle.is_closed());
    }
}
