//! Canonical envelope and action tags.
//!
//! Every message on every transport is one [`Envelope`]: an `action` tag,
//! an action-specific `payload`, and optional correlation fields. The two
//! stream actions have a camel-case synonym; ACKs mirror the style of the
//! batch that produced them so servers emitting either form keep working.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{OutboxError, Result};

/// Action tags, canonical (dotted) and synonym (camel) forms.
pub mod actions {
    /// Server → client, carries a [`BatchPayload`](super::BatchPayload).
    pub const STREAM_BATCH: &str = "outbox.stream.batch";
    /// Camel-case synonym of [`STREAM_BATCH`].
    pub const STREAM_BATCH_CAMEL: &str = "outboxStreamBatch";
    /// Client → server, carries an [`AckPayload`](super::AckPayload).
    pub const STREAM_ACK: &str = "outbox.stream.ack";
    /// Camel-case synonym of [`STREAM_ACK`].
    pub const STREAM_ACK_CAMEL: &str = "outboxStreamAck";
    /// Correlated RPC request.
    pub const QUERY_REQUEST: &str = "query.request";
    /// Correlated RPC response.
    pub const QUERY_RESPONSE: &str = "query.response";
    /// Peer-initiated liveness probe.
    pub const PING: &str = "ping";
    /// Liveness reply; completes the handshake.
    pub const PONG: &str = "pong";
    /// Client-initiated stream registration (socket transports only).
    pub const REGISTER_STREAM_CONSUMER: &str = "registerStreamConsumer";
    /// Server-originated failure for a correlated request.
    pub const ERROR: &str = "error";
}

/// The closed set of recognized actions. Unknown tags on ingress are
/// ignored; the core never emits a tag outside this set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    StreamBatch,
    StreamAck,
    QueryRequest,
    QueryResponse,
    Ping,
    Pong,
    RegisterStreamConsumer,
    Error,
}

/// Which spelling an action arrived in. Only the two stream actions have
/// a camel form; for every other action the styles render identically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ActionStyle {
    #[default]
    Dotted,
    Camel,
}

impl Action {
    /// Parse a wire tag. Matching is case-sensitive on both the canonical
    /// and the synonym form.
    pub fn parse(tag: &str) -> Option<(Action, ActionStyle)> {
        match tag {
            actions::STREAM_BATCH => Some((Action::StreamBatch, ActionStyle::Dotted)),
            actions::STREAM_BATCH_CAMEL => Some((Action::StreamBatch, ActionStyle::Camel)),
            actions::STREAM_ACK => Some((Action::StreamAck, ActionStyle::Dotted)),
            actions::STREAM_ACK_CAMEL => Some((Action::StreamAck, ActionStyle::Camel)),
            actions::QUERY_REQUEST => Some((Action::QueryRequest, ActionStyle::Dotted)),
            actions::QUERY_RESPONSE => Some((Action::QueryResponse, ActionStyle::Dotted)),
            actions::PING => Some((Action::Ping, ActionStyle::Dotted)),
            actions::PONG => Some((Action::Pong, ActionStyle::Dotted)),
            actions::REGISTER_STREAM_CONSUMER => {
                Some((Action::RegisterStreamConsumer, ActionStyle::Dotted))
            }
            actions::ERROR => Some((Action::Error, ActionStyle::Dotted)),
            _ => None,
        }
    }

    /// Render this action in the given style.
    pub fn tag(self, style: ActionStyle) -> &'static str {
        match (self, style) {
            (Action::StreamBatch, ActionStyle::Dotted) => actions::STREAM_BATCH,
            (Action::StreamBatch, ActionStyle::Camel) => actions::STREAM_BATCH_CAMEL,
            (Action::StreamAck, ActionStyle::Dotted) => actions::STREAM_ACK,
            (Action::StreamAck, ActionStyle::Camel) => actions::STREAM_ACK_CAMEL,
            (Action::QueryRequest, _) => actions::QUERY_REQUEST,
            (Action::QueryResponse, _) => actions::QUERY_RESPONSE,
            (Action::Ping, _) => actions::PING,
            (Action::Pong, _) => actions::PONG,
            (Action::RegisterStreamConsumer, _) => actions::REGISTER_STREAM_CONSUMER,
            (Action::Error, _) => actions::ERROR,
        }
    }
}

/// The canonical on-wire message object (text JSON).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Envelope {
    /// Routing tag; non-empty on every real message.
    pub action: String,
    /// Action-specific body, left opaque at this layer.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub payload: Value,
    /// Correlation key on socket transports; echoed on IPC transports.
    #[serde(rename = "requestId", default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    /// Correlation key on IPC transports; mirrored on Pong replies.
    #[serde(
        rename = "correlationId",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub correlation_id: Option<String>,
    /// Milliseconds since the Unix epoch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
}

impl Envelope {
    /// Create an envelope with the given action tag and payload.
    pub fn new(action: impl Into<String>, payload: Value) -> Self {
        Self {
            action: action.into(),
            payload,
            ..Default::default()
        }
    }

    /// Parse the action tag into the known set, with its arrival style.
    pub fn action(&self) -> Option<(Action, ActionStyle)> {
        Action::parse(&self.action)
    }

    /// True when this envelope carries nothing: no action and no payload.
    /// Used to decide whether a transport returned an inline response.
    pub fn is_empty(&self) -> bool {
        self.action.is_empty() && self.payload.is_null()
    }

    /// Stamp the current wall-clock time onto the envelope.
    pub fn with_timestamp(mut self) -> Self {
        self.timestamp = Some(now_millis());
        self
    }
}

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Fixed headroom added to the serialized length in the outbound size
/// guard, covering transport framing around the envelope.
pub const SIZE_CHECK_MARGIN: usize = 256;

/// Serialize an envelope and enforce the outbound size guard:
/// `utf8_len(json) + SIZE_CHECK_MARGIN <= max_message_bytes`.
///
/// Callers use this as a pre-send gate and hand the envelope itself to
/// the channel afterwards; the serialized text is returned for the ones
/// that want to inspect it. ACK frames are exempt from this check and
/// are serialized directly by the transport instead.
pub fn encode_checked(env: &Envelope, max_message_bytes: usize) -> Result<String> {
    let text = serde_json::to_string(env)?;
    let size = text.len();
    if size + SIZE_CHECK_MARGIN > max_message_bytes {
        return Err(OutboxError::MessageTooLarge {
            size,
            limit: max_message_bytes,
        });
    }
    Ok(text)
}

/// One domain event carried inside a batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireEvent {
    /// Non-empty type tag; selects the subscriber.
    pub event_type: String,
    /// Either a structure or a JSON-encoded string the core leaves
    /// untouched.
    #[serde(default)]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aggregate_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_height: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
}

impl WireEvent {
    /// Create an event with just a type and payload.
    pub fn new(event_type: impl Into<String>, payload: Value) -> Self {
        Self {
            event_type: event_type.into(),
            payload,
            aggregate_id: None,
            block_height: None,
            request_id: None,
            timestamp: None,
        }
    }
}

/// Ordered sequence of events delivered in one `outbox.stream.batch`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchPayload {
    #[serde(default)]
    pub events: Vec<WireEvent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_offset: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_offset: Option<u64>,
}

/// Positive acknowledgment for a fully processed batch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AckPayload {
    pub ok: bool,
    /// Positions in the originating batch that were processed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ok_indices: Option<Vec<usize>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ack_from_offset: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ack_to_offset: Option<u64>,
}

/// Body of a `query.request`. `constructorName` is accepted as an alias
/// for `name` on ingress; `name` is always emitted.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryRequestPayload {
    #[serde(alias = "constructorName")]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dto: Option<Value>,
}

/// Body of a `query.response`. `ok` is kept optional so that a response
/// carrying neither verdict can be classified as invalid.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryResponsePayload {
    #[serde(default)]
    pub ok: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub err: Option<String>,
}

/// Body of a `ping` or `pong`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PingPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ts: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}
