//! In-memory [`Connector`] for driving controllers without a server.
//!
//! Every `connect` call opens a fresh channel-backed stream and records
//! it; the caller then writes SSE text into it through a [`StreamFeed`].

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use bytes::Bytes;
use futures::channel::mpsc;
use futures::StreamExt;
use tokio::sync::watch;

use crate::client::{ByteStream, Connector, TransportError};

/// Write side of one in-memory stream.
#[derive(Debug, Clone)]
pub struct StreamFeed {
    url: String,
    tx: mpsc::UnboundedSender<Result<Bytes, TransportError>>,
}

impl StreamFeed {
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Send raw bytes. Returns `false` once the transport has gone away.
    pub fn send_raw(&self, raw: impl Into<Bytes>) -> bool {
        self.tx.unbounded_send(Ok(raw.into())).is_ok()
    }

    /// Send one complete SSE event.
    pub fn send_event(&self, event: &str, data: &serde_json::Value) -> bool {
        self.send_raw(format!("event: {event}\ndata: {data}\n\n"))
    }

    /// Break the stream with a receive error.
    pub fn fail(&self, error: TransportError) -> bool {
        self.tx.unbounded_send(Err(error)).is_ok()
    }

    /// End the stream cleanly.
    pub fn end(&self) {
        self.tx.close_channel();
    }

    /// Whether the reading side has been dropped.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

#[derive(Debug, Default)]
struct State {
    feeds: Vec<StreamFeed>,
    failures: VecDeque<TransportError>,
    attempts: usize,
}

/// Connector backed by in-process channels.
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    state: Arc<Mutex<State>>,
    opened: Arc<watch::Sender<usize>>,
}

impl Default for MemoryConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryConnector {
    pub fn new() -> Self {
        let (opened, _) = watch::channel(0);
        Self {
            state: Arc::new(Mutex::new(State::default())),
            opened: Arc::new(opened),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Make the next `connect` call fail with `error`. Queues up.
    pub fn fail_next(&self, error: TransportError) {
        self.lock().failures.push_back(error);
    }

    /// Number of `connect` calls so far, failed ones included.
    pub fn attempts(&self) -> usize {
        self.lock().attempts
    }

    /// Number of streams opened so far.
    pub fn opened(&self) -> usize {
        self.lock().feeds.len()
    }

    /// Feed of the `index`-th opened stream.
    pub fn feed(&self, index: usize) -> Option<StreamFeed> {
        self.lock().feeds.get(index).cloned()
    }

    /// Wait until at least `count` streams have been opened and return
    /// the feed of the last one.
    pub async fn wait_for_stream(&self, count: usize) -> Option<StreamFeed> {
        let mut rx = self.opened.subscribe();
        rx.wait_for(|opened| *opened >= count).await.ok()?;
        self.feed(count.checked_sub(1)?)
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, url: &str) -> Result<ByteStream, TransportError> {
        let (tx, rx) = mpsc::unbounded();
        let opened = {
            let mut state = self.lock();
            state.attempts += 1;
            if let Some(error) = state.failures.pop_front() {
                return Err(error);
            }
            state.feeds.push(StreamFeed {
                url: url.to_string(),
                tx,
            });
            state.feeds.len()
        };
        self.opened.send_replace(opened);
        Ok(rx.boxed())
    }
}
