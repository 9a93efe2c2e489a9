//! Stateless request/response HTTP backend.
//!
//! Outgoing traffic (queries, pings) is plain POSTs through `reqwest`;
//! every exchange stands on its own, so the channel is always ready and
//! responses come back inline from `send`. Inbound batches arrive on an
//! `axum` router the host mounts (or the channel serves itself when a
//! bind address is configured): the webhook path takes a batch envelope
//! and answers with the ACK envelope, the ping path answers with a Pong.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::channel::{Capabilities, Channel, DisconnectHook, InboundHandler};
use crate::config::ClientConfig;
use crate::envelope::{actions, now_millis, Action, Envelope, PingPayload, SIZE_CHECK_MARGIN};
use crate::error::{OutboxError, Result};

/// Header carrying the shared transport token on both directions.
pub const TOKEN_HEADER: &str = "x-transport-token";

/// An HTTP transport endpoint.
pub struct HttpChannel {
    shared: Arc<HttpShared>,
}

struct HttpShared {
    base_url: String,
    webhook_path: String,
    ping_path: String,
    webhook_addr: Option<SocketAddr>,
    token: Option<String>,
    max_message_bytes: usize,
    http: reqwest::Client,
    inbound: Mutex<Option<InboundHandler>>,
    server: Mutex<Option<JoinHandle<()>>>,
}

impl HttpChannel {
    /// Build the channel from a client configuration.
    ///
    /// Requires `base_url`; the webhook and ping paths must be distinct
    /// rooted paths.
    pub fn new(config: &ClientConfig) -> Result<Self> {
        let base_url = config
            .base_url
            .clone()
            .ok_or_else(|| OutboxError::TransportInit("http transport requires base_url".into()))?;
        if config.webhook_path == config.ping_path {
            return Err(OutboxError::TransportInit(
                "webhook and ping paths must differ".into(),
            ));
        }
        for path in [&config.webhook_path, &config.ping_path] {
            if !path.starts_with('/') {
                return Err(OutboxError::TransportInit(format!(
                    "path must be rooted: {path}"
                )));
            }
        }

        let http = reqwest::Client::builder()
            .timeout(config.query_timeout)
            .build()
            .map_err(|e| OutboxError::TransportInit(e.to_string()))?;

        Ok(Self {
            shared: Arc::new(HttpShared {
                base_url: base_url.trim_end_matches('/').to_string(),
                webhook_path: config.webhook_path.clone(),
                ping_path: config.ping_path.clone(),
                webhook_addr: config.webhook_addr,
                token: config.token.clone(),
                max_message_bytes: config.max_message_bytes,
                http,
                inbound: Mutex::new(None),
                server: Mutex::new(None),
            }),
        })
    }

    /// The inbound router: webhook and ping paths. Hosts that manage
    /// their own listener mount this; otherwise `open()` serves it on
    /// the configured bind address.
    pub fn router(&self) -> Router {
        Router::new()
            .route(&self.shared.webhook_path, post(webhook_handler))
            .route(&self.shared.ping_path, post(ping_handler))
            .with_state(self.shared.clone())
    }

    async fn post_json(&self, url: String, body: &Value) -> Result<Value> {
        let mut request = self.shared.http.post(&url).json(body);
        if let Some(token) = &self.shared.token {
            request = request.header(TOKEN_HEADER, token);
        }
        let response = request
            .send()
            .await
            .map_err(|e| OutboxError::Connection(e.to_string()))?
            .error_for_status()
            .map_err(|e| OutboxError::Connection(e.to_string()))?;
        response
            .json::<Value>()
            .await
            .map_err(|e| OutboxError::Connection(e.to_string()))
    }
}

/// Wrap a response body as an envelope. Bodies that already look like an
/// envelope pass through; bare `QueryResponse` objects are wrapped.
fn inline_envelope(value: Value) -> Envelope {
    if value.get("action").is_some() {
        match serde_json::from_value(value) {
            Ok(env) => env,
            Err(_) => Envelope::default(),
        }
    } else {
        Envelope::new(actions::QUERY_RESPONSE, value)
    }
}

async fn webhook_handler(
    State(shared): State<Arc<HttpShared>>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> Response {
    if let Some(expected) = &shared.token {
        let provided = headers.get(TOKEN_HEADER).and_then(|v| v.to_str().ok());
        if provided != Some(expected.as_str()) {
            return StatusCode::UNAUTHORIZED.into_response();
        }
    }

    if body.len() > shared.max_message_bytes.saturating_sub(SIZE_CHECK_MARGIN) {
        return StatusCode::PAYLOAD_TOO_LARGE.into_response();
    }

    let env: Envelope = match serde_json::from_slice(&body) {
        Ok(env) => env,
        Err(_) => return StatusCode::BAD_REQUEST.into_response(),
    };

    if !matches!(env.action(), Some((Action::StreamBatch, _))) {
        return StatusCode::UNPROCESSABLE_ENTITY.into_response();
    }

    let handler = shared.inbound.lock().expect("inbound poisoned").clone();
    let Some(handler) = handler else {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    };

    match handler(env).await {
        Some(ack) => (StatusCode::OK, Json(ack)).into_response(),
        // No ACK means the batch failed or timed out; the server
        // retransmits.
        None => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

async fn ping_handler(State(shared): State<Arc<HttpShared>>) -> Json<Envelope> {
    let payload = PingPayload {
        ts: Some(now_millis()),
        password: shared.token.clone(),
        ..Default::default()
    };
    let payload = serde_json::to_value(payload).unwrap_or(Value::Null);
    Json(Envelope::new(actions::PONG, payload).with_timestamp())
}

#[async_trait::async_trait]
impl Channel for HttpChannel {
    /// Serve the router when a bind address is configured; otherwise a
    /// no-op, since every outgoing request is lazy.
    async fn open(&self) -> Result<()> {
        let Some(addr) = self.shared.webhook_addr else {
            return Ok(());
        };
        let mut server = self.shared.server.lock().expect("server poisoned");
        if server.is_some() {
            return Ok(());
        }
        let listener = std::net::TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        let listener = tokio::net::TcpListener::from_std(listener)?;
        let router = self.router();
        *server = Some(tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, router).await {
                tracing::warn!(error = %e, "webhook server stopped");
            }
        }));
        Ok(())
    }

    async fn close(&self) {
        if let Some(server) = self.shared.server.lock().expect("server poisoned").take() {
            server.abort();
        }
        self.shared.inbound.lock().expect("inbound poisoned").take();
    }

    /// Every request stands on its own.
    fn is_ready(&self) -> bool {
        true
    }

    async fn await_ready(&self, _deadline: Duration) -> bool {
        true
    }

    /// Queries and pings are synchronous exchanges: the response comes
    /// back inline. Other actions have no outgoing HTTP form.
    async fn send(&self, env: Envelope) -> Result<Option<Envelope>> {
        match env.action() {
            Some((Action::QueryRequest, _)) => {
                let url = format!("{}/query", self.shared.base_url);
                let body = self.post_json(url, &env.payload).await?;
                Ok(Some(inline_envelope(body)))
            }
            Some((Action::Ping, _)) => {
                let url = format!("{}{}", self.shared.base_url, self.shared.ping_path);
                let body = self.post_json(url, &env.payload).await?;
                Ok(Some(inline_envelope(body)))
            }
            _ => {
                debug!(action = %env.action, "action has no outgoing http form, dropping");
                Ok(None)
            }
        }
    }

    fn set_inbound(&self, handler: InboundHandler) {
        *self.shared.inbound.lock().expect("inbound poisoned") = Some(handler);
    }

    /// HTTP has no connection to lose.
    fn set_on_disconnect(&self, _hook: DisconnectHook) {}

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            queries: true,
            stream_acks: true,
        }
    }
}
