//! Channel abstraction - the uniform transport contract.
//!
//! Provides one interface over four backends:
//! - [`SocketChannel`] - persistent bidirectional WebSocket
//! - [`HttpChannel`] - stateless request/response HTTP
//! - [`IpcChannel`] - parent-owned child and child-to-parent stdio pipes
//!
//! A channel is responsible only for framing and transport mechanics.
//! Protocol semantics (heartbeat, dispatch, correlation, gating) live in
//! the layers above and reach the channel through [`InboundHandler`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::dispatch::BoxFuture;
use crate::envelope::Envelope;
use crate::error::Result;

mod http;
mod ipc;
mod socket;

pub use http::HttpChannel;
pub use ipc::{IpcChannel, IpcRole};
pub use socket::{ConnState, SocketChannel};

/// What a transport supports beyond plain sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// Correlated request/response queries.
    pub queries: bool,
    /// Stream batch delivery with positive acknowledgment.
    pub stream_acks: bool,
}

/// Handler invoked on each decoded inbound envelope.
///
/// Returning an envelope hands a reply back to the transport: persistent
/// channels send it on the same connection, the HTTP webhook uses it as
/// the response body. Inbound envelopes are processed strictly in
/// arrival order; the next one is decoded only after the handler for the
/// previous one returned.
pub type InboundHandler =
    Arc<dyn Fn(Envelope) -> BoxFuture<'static, Option<Envelope>> + Send + Sync>;

/// Hook invoked when a persistent connection is lost. The flag is true
/// when the transport will not come back (closed, attached, or
/// reconnect disabled).
pub type DisconnectHook = Arc<dyn Fn(bool) + Send + Sync>;

/// The uniform transport contract.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Establish underlying I/O for stateful transports; a no-op for
    /// stateless ones.
    async fn open(&self) -> Result<()>;

    /// Tear down. Releases listeners and I/O; never fails; idempotent.
    async fn close(&self);

    /// True iff the transport considers itself usable for
    /// client-initiated requests right now.
    fn is_ready(&self) -> bool;

    /// Wait until [`is_ready`](Channel::is_ready) holds, up to
    /// `deadline`. Returns whether readiness was reached in time.
    async fn await_ready(&self, deadline: Duration) -> bool;

    /// Encode and hand off one envelope. Transports with a synchronous
    /// exchange (HTTP) return the response inline; persistent transports
    /// return `None` and deliver responses through the inbound handler.
    async fn send(&self, env: Envelope) -> Result<Option<Envelope>>;

    /// Install the single inbound handler.
    fn set_inbound(&self, handler: InboundHandler);

    /// Install the disconnect hook.
    fn set_on_disconnect(&self, hook: DisconnectHook);

    /// Report what this transport supports.
    fn capabilities(&self) -> Capabilities;
}
