//! Opening event streams.
//!
//! [`Connector`] is the seam between the transport and the network:
//! given a URL it yields the raw response body as a stream of byte
//! chunks. [`HttpConnector`] is the production implementation on top of
//! `reqwest`; tests plug in an in-memory connector instead.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;

/// Raw body chunks of an open event stream.
pub type ByteStream = BoxStream<'static, Result<Bytes, TransportError>>;

/// Opens a server-sent event stream.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, url: &str) -> Result<ByteStream, TransportError>;
}

/// Connector that issues a streaming `GET` with `reqwest`.
#[derive(Debug, Clone, Default)]
pub struct HttpConnector {
    client: reqwest::Client,
}

impl HttpConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reuse an existing [`reqwest::Client`] (shared connection pool).
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Connector for HttpConnector {
    async fn connect(&self, url: &str) -> Result<ByteStream, TransportError> {
        let response = self
            .client
            .get(url)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .header(reqwest::header::CACHE_CONTROL, "no-cache")
            .send()
            .await
            .map_err(|e| TransportError::Connection(format!("Failed to reach {url}: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(TransportError::Status {
                status: status.as_u16(),
                body,
            });
        }

        tracing::info!(url = %url, "Event stream opened");

        let stream = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| TransportError::Protocol(e.to_string())));
        Ok(stream.boxed())
    }
}

/// Errors from the stream transport.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum TransportError {
    /// The request never reached the server.
    #[error("Connection error: {0}")]
    Connection(String),

    /// The server answered with a non-2xx status.
    #[error("Stream endpoint returned {status}: {body}")]
    Status { status: u16, body: String },

    /// The stream broke after it was opened.
    #[error("Protocol error: {0}")]
    Protocol(String),
}
