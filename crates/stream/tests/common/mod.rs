//! Shared helpers for controller integration tests.

#![allow(dead_code)]

use std::time::Duration;

use analyst_stream::config::StreamConfig;
use analyst_stream::events::SessionUpdate;
use analyst_stream::memory::{MemoryConnector, StreamFeed};
use analyst_stream::reconnect::RetryPolicy;
use serde_json::{json, Value};
use tokio::sync::broadcast;

pub const BASE_URL: &str = "http://localhost:8000/api";

const WAIT: Duration = Duration::from_secs(5);

/// Config with fast retries so tests don't sleep for long.
pub fn config(max_retries: u32) -> StreamConfig {
    StreamConfig::new(BASE_URL)
        .expect("base url should parse")
        .with_retry(RetryPolicy {
            max_retries,
            initial_delay: Duration::from_millis(5),
            ..RetryPolicy::default()
        })
}

/// Wait for the `count`-th stream to open.
pub async fn stream(connector: &MemoryConnector, count: usize) -> StreamFeed {
    tokio::time::timeout(WAIT, connector.wait_for_stream(count))
        .await
        .expect("timed out waiting for stream")
        .expect("stream should exist")
}

/// Receive updates until one matches `pred`.
pub async fn until<F>(rx: &mut broadcast::Receiver<SessionUpdate>, pred: F) -> SessionUpdate
where
    F: Fn(&SessionUpdate) -> bool,
{
    tokio::time::timeout(WAIT, async {
        loop {
            match rx.recv().await {
                Ok(update) if pred(&update) => return update,
                Ok(_) => continue,
                Err(e) => panic!("update channel failed: {e}"),
            }
        }
    })
    .await
    .expect("timed out waiting for update")
}

/// Wait until the reading side of `feed` has gone away.
pub async fn closed(feed: &StreamFeed) {
    tokio::time::timeout(WAIT, async {
        while !feed.is_closed() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .expect("timed out waiting for stream to close");
}

pub fn progress(input: &str, stage: &str, pct: u32) -> Value {
    json!({"stage": stage, "progress": pct, "input": input})
}

pub fn result(input: &str) -> Value {
    json!({
        "success": true,
        "input": input,
        "recommendation": "hold",
        "results": {
            "market": {"success": true},
            "news": {"success": true}
        }
    })
}
