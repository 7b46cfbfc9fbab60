//! Client side of the analysis event stream.
//!
//! [`transport`] reads one server-sent event stream and turns it into
//! [`messages::StreamMessage`]s. [`controller::SessionController`] and
//! [`batch::BatchController`] bind those messages to sessions from
//! `analyst-core` and expose snapshots plus a broadcast of
//! [`events::SessionUpdate`]s.

pub mod batch;
mod binding;
pub mod client;
pub mod config;
pub mod controller;
pub mod events;
pub mod memory;
pub mod messages;
pub mod reconnect;
pub mod transport;

pub use batch::{BatchController, BatchFuture};
pub use client::{Connector, HttpConnector, TransportError};
pub use config::{ConfigError, StreamConfig};
pub use controller::{JobFuture, SessionController, SessionError, SessionReader};
pub use events::SessionUpdate;
