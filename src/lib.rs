//! # outbox-client
//!
//! Rust client SDK for the outbox stream transport protocol.
//!
//! Applications use this crate to consume an ordered stream of domain
//! events from a remote service's outbox and to issue request/response
//! queries against it. Four interchangeable transports sit behind one
//! contract:
//!
//! - **WebSocket** - persistent bidirectional socket, managed (owned and
//!   reconnected by the client) or attached (host-owned)
//! - **HTTP** - stateless request/response; batches arrive on a webhook
//! - **IPC parent** - a spawned child process spoken to over its stdio
//! - **IPC child** - the child side of the same channel
//!
//! On every transport the client enforces the same protocol: a
//! Ping/Pong handshake and heartbeat, at-least-once stream delivery
//! with an explicit ACK after successful local processing, and a
//! correlated query channel with deadlines.
//!
//! ## Example
//!
//! ```ignore
//! use outbox_client::{Client, TransportKind};
//!
//! #[tokio::main]
//! async fn main() {
//!     let client = Client::builder(TransportKind::Ws)
//!         .url("ws://127.0.0.1:4500/stream")
//!         .subscribe("OrderPlaced", |event| async move {
//!             println!("{}", event.payload);
//!             Ok(())
//!         })
//!         .connect()
//!         .await
//!         .unwrap();
//!
//!     client.closed().await;
//! }
//! ```

pub mod channel;
pub mod config;
pub mod correlator;
pub mod dispatch;
pub mod envelope;
pub mod error;
pub mod heartbeat;

mod client;

pub use channel::{Capabilities, Channel, ConnState, HttpChannel, IpcChannel, SocketChannel};
pub use client::{Client, ClientBuilder};
pub use config::{ClientConfig, HeartbeatPolicy, ReconnectPolicy, TransportKind};
pub use envelope::{AckPayload, BatchPayload, Envelope, WireEvent};
pub use error::{OutboxError, Result};
