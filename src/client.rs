//! Client builder and protocol runtime.
//!
//! The [`ClientBuilder`] provides a fluent API for selecting a transport
//! and registering subscriptions. The [`Client`] owns the channel and
//! runs the protocol on top of it:
//! 1. Route inbound envelopes: Ping → Pong, Pong → liveness,
//!    batch → dispatcher → ACK, responses → correlator.
//! 2. Gate client-initiated requests behind the handshake on
//!    persistent transports.
//! 3. Correlate queries with deadlines and per-transport key choice.
//!
//! # Example
//!
//! ```ignore
//! use outbox_client::{Client, TransportKind};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = Client::builder(TransportKind::Ws)
//!         .url("ws://127.0.0.1:4500/stream")
//!         .token("secret")
//!         .subscribe("OrderPlaced", |event| async move {
//!             println!("order: {}", event.payload);
//!             Ok(())
//!         })
//!         .connect()
//!         .await?;
//!
//!     let answer = client.query("GetBalance", None).await?;
//!     println!("balance: {answer:?}");
//!     client.close().await;
//!     Ok(())
//! }
//! ```

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::Command;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::channel::{Channel, HttpChannel, InboundHandler, IpcChannel, SocketChannel};
use crate::config::{ClientConfig, HeartbeatPolicy, ReconnectPolicy, TransportKind};
use crate::correlator::{Correlator, FlightPolicy, KeyKind};
use crate::dispatch::{Dispatcher, EventHandler, HandlerError, Multiplicity, Subscriptions};
use crate::envelope::{
    actions, encode_checked, now_millis, Action, BatchPayload, Envelope, PingPayload,
    QueryRequestPayload, QueryResponsePayload, WireEvent,
};
use crate::error::{OutboxError, Result};
use crate::heartbeat::{Liveness, PingSchedule};

type SocketFactory = Box<dyn FnOnce(Liveness) -> SocketChannel + Send>;

/// Builder for configuring and connecting an outbox client.
pub struct ClientBuilder {
    config: ClientConfig,
    subscriptions: Vec<(String, EventHandler)>,
    child_command: Option<Command>,
    attached_socket: Option<SocketFactory>,
}

impl ClientBuilder {
    /// Start a builder for the given transport with protocol defaults.
    pub fn new(transport: TransportKind) -> Self {
        Self {
            config: ClientConfig::new(transport),
            subscriptions: Vec::new(),
            child_command: None,
            attached_socket: None,
        }
    }

    /// WebSocket endpoint for the socket transport.
    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.config.url = Some(url.into());
        self
    }

    /// Base URL for HTTP queries and pings.
    pub fn base_url(mut self, base_url: impl Into<String>) -> Self {
        self.config.base_url = Some(base_url.into());
        self
    }

    /// Shared token: echoed in Pong payloads and required on the
    /// webhook.
    pub fn token(mut self, token: impl Into<String>) -> Self {
        self.config.token = Some(token.into());
        self
    }

    /// Bind address for the self-served HTTP webhook receiver.
    pub fn webhook_addr(mut self, addr: std::net::SocketAddr) -> Self {
        self.config.webhook_addr = Some(addr);
        self
    }

    /// Webhook path for the HTTP transport.
    pub fn webhook_path(mut self, path: impl Into<String>) -> Self {
        self.config.webhook_path = path.into();
        self
    }

    /// Ping path for the HTTP transport.
    pub fn ping_path(mut self, path: impl Into<String>) -> Self {
        self.config.ping_path = path.into();
        self
    }

    /// Envelope size cap for outgoing frames.
    pub fn max_message_bytes(mut self, limit: usize) -> Self {
        self.config.max_message_bytes = limit;
        self
    }

    /// Client-initiated heartbeat policy.
    pub fn heartbeat(mut self, policy: HeartbeatPolicy) -> Self {
        self.config.heartbeat = policy;
        self
    }

    /// Deadline for a managed open and for handshake gating.
    pub fn connection_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.config.connection_timeout = timeout;
        self
    }

    /// Per-batch processing deadline.
    pub fn process_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.config.process_timeout = timeout;
        self
    }

    /// Per-query deadline for the full exchange.
    pub fn query_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.config.query_timeout = timeout;
        self
    }

    /// Managed-mode reconnect policy (sockets only).
    pub fn reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.config.reconnect = policy;
        self
    }

    /// Child process to spawn and own for the `IpcParent` transport.
    pub fn child_command(mut self, command: Command) -> Self {
        self.child_command = Some(command);
        self
    }

    /// Attach a host-owned, already-connected WebSocket stream. The
    /// client binds listeners but never reconnects.
    pub fn attach_socket<S>(mut self, ws: WebSocketStream<S>) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        self.attached_socket = Some(Box::new(move |liveness| {
            SocketChannel::attached(ws, liveness)
        }));
        self.config.reconnect.enabled = false;
        self
    }

    /// Pre-register a subscription, applied before the first batch can
    /// arrive.
    pub fn subscribe<F, Fut>(mut self, event_type: impl Into<String>, handler: F) -> Self
    where
        F: Fn(WireEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), HandlerError>> + Send + 'static,
    {
        let handler: EventHandler = Arc::new(move |ev| Box::pin(handler(ev)));
        self.subscriptions.push((event_type.into(), handler));
        self
    }

    /// Build the channel and connect.
    pub async fn connect(self) -> Result<Client> {
        let config = self.config;
        let liveness = Liveness::new(config.heartbeat.timeout);

        let channel: Arc<dyn Channel> = match config.transport {
            TransportKind::Ws => match self.attached_socket {
                Some(factory) => Arc::new(factory(liveness.clone())),
                None => {
                    let url = config.url.clone().ok_or_else(|| {
                        OutboxError::TransportInit("ws transport requires url".into())
                    })?;
                    Arc::new(SocketChannel::managed(
                        url,
                        config.reconnect.clone(),
                        config.connection_timeout,
                        liveness.clone(),
                    ))
                }
            },
            TransportKind::Http => Arc::new(HttpChannel::new(&config)?),
            TransportKind::IpcParent => {
                let command = self.child_command.ok_or_else(|| {
                    OutboxError::TransportInit("ipc-parent transport requires a child command".into())
                })?;
                Arc::new(IpcChannel::parent(command, liveness.clone())?)
            }
            TransportKind::IpcChild => Arc::new(IpcChannel::child(liveness.clone())),
        };

        Client::assemble(channel, config, liveness, self.subscriptions).await
    }
}

/// State shared between the client facade, the inbound router, and the
/// heartbeat loop. Every mutation is a bounded map or atomic operation.
struct ClientShared {
    config: ClientConfig,
    liveness: Liveness,
    subscriptions: Arc<Subscriptions>,
    dispatcher: Dispatcher,
    correlator: Correlator,
    closed: AtomicBool,
    terminated: watch::Sender<bool>,
}

impl ClientShared {
    /// The inbound protocol router: one decoded envelope in, at most
    /// one reply envelope out. Unknown actions are ignored.
    async fn route(&self, env: Envelope) -> Option<Envelope> {
        let Some((action, style)) = env.action() else {
            debug!(action = %env.action, "unknown action, ignoring");
            return None;
        };

        match action {
            Action::Ping => {
                self.liveness.record_ping_reply();
                let inbound: PingPayload =
                    serde_json::from_value(env.payload.clone()).unwrap_or_default();
                let payload = PingPayload {
                    ts: Some(now_millis()),
                    nonce: inbound.nonce,
                    sid: inbound.sid,
                    password: self.config.token.clone(),
                };
                let mut reply = Envelope::new(
                    actions::PONG,
                    serde_json::to_value(payload).unwrap_or(Value::Null),
                )
                .with_timestamp();
                reply.correlation_id = env.correlation_id;
                // Pong is not exempt from the outbound size guard; an
                // oversized reply is never sent.
                if let Err(e) = encode_checked(&reply, self.config.max_message_bytes) {
                    warn!(error = %e, "suppressing oversized pong reply");
                    return None;
                }
                Some(reply)
            }
            Action::Pong => {
                self.liveness.record_pong();
                None
            }
            Action::StreamBatch => {
                let batch: BatchPayload = match serde_json::from_value(env.payload) {
                    Ok(batch) => batch,
                    Err(e) => {
                        warn!(error = %e, "dropping undecodable batch payload");
                        return None;
                    }
                };
                let ack = self.dispatcher.dispatch(batch).await?;
                let payload = match serde_json::to_value(ack) {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!(error = %e, "failed to encode ack");
                        return None;
                    }
                };
                // The ACK mirrors the batch's action style and echoes
                // its correlation id when it carried one.
                let mut reply =
                    Envelope::new(Action::StreamAck.tag(style), payload).with_timestamp();
                reply.correlation_id = env.correlation_id;
                Some(reply)
            }
            Action::QueryResponse | Action::Error => {
                self.correlator.complete(env);
                None
            }
            Action::StreamAck | Action::QueryRequest | Action::RegisterStreamConsumer => {
                debug!(action = %env.action, "unexpected inbound action, ignoring");
                None
            }
        }
    }
}

/// A connected outbox client.
///
/// Owns its channel exclusively; dropping or closing the client tears
/// the transport down and rejects everything pending.
pub struct Client {
    shared: Arc<ClientShared>,
    channel: Arc<dyn Channel>,
    ping_task: Mutex<Option<JoinHandle<()>>>,
}

impl Client {
    /// Start a builder for the given transport.
    pub fn builder(transport: TransportKind) -> ClientBuilder {
        ClientBuilder::new(transport)
    }

    /// Run the protocol over an externally constructed channel.
    ///
    /// `liveness` must be the same instance the channel was built with:
    /// the router records Pongs on it and the channel derives readiness
    /// from it. The builder goes through here; tests and advanced hosts
    /// may too.
    pub async fn with_channel(
        channel: Arc<dyn Channel>,
        config: ClientConfig,
        liveness: Liveness,
    ) -> Result<Client> {
        Client::assemble(channel, config, liveness, Vec::new()).await
    }

    async fn assemble(
        channel: Arc<dyn Channel>,
        config: ClientConfig,
        liveness: Liveness,
        pre_subscriptions: Vec<(String, EventHandler)>,
    ) -> Result<Client> {
        let multiplicity = if config.transport.is_persistent() {
            Multiplicity::Single
        } else {
            Multiplicity::Multiple
        };
        let subscriptions = Arc::new(Subscriptions::new(multiplicity));
        for (event_type, handler) in pre_subscriptions {
            subscriptions.subscribe_handler(&event_type, handler)?;
        }

        let (key_kind, flight) = match config.transport {
            TransportKind::Ws => (KeyKind::RequestId, FlightPolicy::SingleFlight),
            TransportKind::Http => (KeyKind::RequestId, FlightPolicy::Parallel),
            TransportKind::IpcParent | TransportKind::IpcChild => {
                (KeyKind::CorrelationId, FlightPolicy::Parallel)
            }
        };

        let (terminated, _) = watch::channel(false);
        let shared = Arc::new(ClientShared {
            dispatcher: Dispatcher::new(subscriptions.clone(), config.process_timeout),
            correlator: Correlator::new(key_kind, flight),
            config,
            liveness,
            subscriptions,
            closed: AtomicBool::new(false),
            terminated,
        });

        let router: InboundHandler = {
            let shared = shared.clone();
            Arc::new(move |env| {
                let shared = shared.clone();
                Box::pin(async move { shared.route(env).await })
            })
        };
        channel.set_inbound(router);

        {
            let shared = shared.clone();
            channel.set_on_disconnect(Arc::new(move |terminal| {
                // Pending queries never survive a connection.
                shared.correlator.fail_all();
                if terminal {
                    let _ = shared.terminated.send(true);
                }
            }));
        }

        channel.open().await?;

        let client = Client {
            ping_task: Mutex::new(None),
            shared,
            channel,
        };
        if client.shared.config.heartbeat.enabled && client.shared.config.transport.is_persistent()
        {
            let task = spawn_ping_loop(client.channel.clone(), client.shared.clone());
            *client.ping_task.lock().expect("ping slot poisoned") = Some(task);
        }
        Ok(client)
    }

    /// Register a handler for an event type.
    ///
    /// Persistent transports allow one handler per type; registering a
    /// second fails with [`OutboxError::DuplicateSubscription`]. The
    /// HTTP transport allows several, invoked sequentially per event.
    pub fn subscribe<F, Fut>(&self, event_type: &str, handler: F) -> Result<()>
    where
        F: Fn(WireEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), HandlerError>> + Send + 'static,
    {
        self.shared.subscriptions.subscribe(event_type, handler)
    }

    /// Remove every handler for an event type. Returns whether any was
    /// registered.
    pub fn unsubscribe(&self, event_type: &str) -> bool {
        self.shared.subscriptions.unsubscribe(event_type)
    }

    /// Issue a correlated query and await its result.
    ///
    /// Resolves with the response `data` on `ok == true`. Fails with
    /// [`OutboxError::QueryFailed`] on `ok == false`,
    /// [`OutboxError::QueryTimeout`] past the deadline,
    /// [`OutboxError::QueryInFlight`] on single-flight violation, and
    /// [`OutboxError::Disconnected`] when the connection goes away.
    pub async fn query(&self, name: &str, dto: Option<Value>) -> Result<Option<Value>> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(OutboxError::Disconnected);
        }

        // Single-flight transports fail fast here, before any I/O.
        let key = Uuid::new_v4().to_string();
        let rx = self.shared.correlator.register(&key)?;

        // Queries stay gated until the first Ping/Pong exchange.
        if self.shared.config.transport.is_persistent()
            && !self
                .channel
                .await_ready(self.shared.config.connection_timeout)
                .await
        {
            self.shared.correlator.evict(&key);
            return Err(OutboxError::NotConnected);
        }

        let payload = QueryRequestPayload {
            name: name.to_string(),
            dto,
        };
        let payload = match serde_json::to_value(payload) {
            Ok(payload) => payload,
            Err(e) => {
                self.shared.correlator.evict(&key);
                return Err(e.into());
            }
        };
        let mut env = Envelope::new(actions::QUERY_REQUEST, payload).with_timestamp();
        match self.shared.correlator.key_kind() {
            KeyKind::RequestId => env.request_id = Some(key.clone()),
            KeyKind::CorrelationId => {
                // The process channels correlate on correlationId but
                // still carry a requestId on the wire.
                env.correlation_id = Some(key.clone());
                env.request_id = Some(Uuid::new_v4().to_string());
            }
        }

        if let Err(e) = encode_checked(&env, self.shared.config.max_message_bytes) {
            self.shared.correlator.evict(&key);
            return Err(e);
        }

        let inline = match self.channel.send(env).await {
            Ok(inline) => inline,
            Err(e) => {
                self.shared.correlator.evict(&key);
                return Err(e);
            }
        };

        // Transports with a synchronous exchange answer inline; only
        // empty inline values fall through to the correlator.
        if let Some(inline) = inline {
            if !inline.is_empty() {
                self.shared.correlator.evict(&key);
                return interpret_response(inline);
            }
        }

        match tokio::time::timeout(self.shared.config.query_timeout, rx).await {
            Err(_elapsed) => {
                // Evicting now means a late reply is discarded silently.
                self.shared.correlator.evict(&key);
                Err(OutboxError::QueryTimeout)
            }
            Ok(Err(_closed)) => Err(OutboxError::Disconnected),
            Ok(Ok(response)) => interpret_response(response),
        }
    }

    /// Announce this client as a stream consumer (socket transports
    /// only). Fire-and-forget, gated behind the handshake.
    pub async fn register_stream_consumer(&self) -> Result<()> {
        if self.shared.config.transport != TransportKind::Ws {
            return Err(OutboxError::TransportInit(
                "registerStreamConsumer requires a socket transport".into(),
            ));
        }
        if !self
            .channel
            .await_ready(self.shared.config.connection_timeout)
            .await
        {
            return Err(OutboxError::NotConnected);
        }

        let mut env = Envelope::new(
            actions::REGISTER_STREAM_CONSUMER,
            json!({ "token": self.shared.config.token }),
        )
        .with_timestamp();
        env.request_id = Some(Uuid::new_v4().to_string());
        encode_checked(&env, self.shared.config.max_message_bytes)?;
        self.channel.send(env).await?;
        Ok(())
    }

    /// True iff the transport is usable for requests right now.
    pub fn is_ready(&self) -> bool {
        self.channel.is_ready()
    }

    /// Wait for readiness up to `deadline`.
    pub async fn await_ready(&self, deadline: std::time::Duration) -> bool {
        self.channel.await_ready(deadline).await
    }

    /// The channel this client runs on.
    pub fn channel(&self) -> &Arc<dyn Channel> {
        &self.channel
    }

    /// Tear everything down: stop loops, close the transport, reject
    /// pending queries, clear subscriptions. Idempotent, never fails.
    pub async fn close(&self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(task) = self.ping_task.lock().expect("ping slot poisoned").take() {
            task.abort();
        }
        self.channel.close().await;
        self.shared.correlator.fail_all();
        self.shared.subscriptions.clear();
        let _ = self.shared.terminated.send(true);
    }

    /// Resolve when the client is closed or the transport dies for
    /// good.
    pub async fn closed(&self) {
        let mut rx = self.shared.terminated.subscribe();
        let _ = rx.wait_for(|terminated| *terminated).await;
    }
}

/// Interpret a response envelope for an awaiting query caller.
fn interpret_response(env: Envelope) -> Result<Option<Value>> {
    if matches!(env.action(), Some((Action::Error, _))) {
        let message = env
            .payload
            .get("message")
            .or_else(|| env.payload.get("err"))
            .and_then(Value::as_str)
            .unwrap_or("server error")
            .to_string();
        return Err(OutboxError::Server {
            message,
            details: Some(env.payload),
        });
    }

    let response: QueryResponsePayload =
        serde_json::from_value(env.payload).map_err(|_| OutboxError::InvalidResponse)?;
    match response.ok {
        Some(true) => Ok(response.data),
        Some(false) => Err(OutboxError::QueryFailed(
            response.err.unwrap_or_default(),
        )),
        None => Err(OutboxError::InvalidResponse),
    }
}

/// Client-initiated heartbeat: exponential interval with jitter, reset
/// on every fresh Pong. Send failures are swallowed; the liveness
/// window is what actually degrades readiness.
fn spawn_ping_loop(channel: Arc<dyn Channel>, shared: Arc<ClientShared>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut schedule = PingSchedule::new(&shared.config.heartbeat);
        let mut seen_seq = shared.liveness.pong_seq();
        loop {
            tokio::time::sleep(schedule.next_delay()).await;
            if shared.closed.load(Ordering::Acquire) {
                return;
            }
            let seq = shared.liveness.pong_seq();
            if seq != seen_seq {
                seen_seq = seq;
                schedule.reset();
            }

            let payload = PingPayload {
                ts: Some(now_millis()),
                ..Default::default()
            };
            let env = Envelope::new(
                actions::PING,
                serde_json::to_value(payload).unwrap_or(Value::Null),
            )
            .with_timestamp();
            if let Err(e) = encode_checked(&env, shared.config.max_message_bytes) {
                warn!(error = %e, "heartbeat ping exceeds size cap, not sent");
                continue;
            }
            if let Err(e) = channel.send(env).await {
                debug!(error = %e, "heartbeat ping not sent");
            }
        }
    })
}
