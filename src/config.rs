//! Client configuration: transport selection and every tunable knob.

use std::net::SocketAddr;
use std::time::Duration;

use rand::Rng;

/// Default envelope size cap for all transports (1 MiB).
pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 1024 * 1024;

/// Default per-batch processing deadline.
pub const DEFAULT_PROCESS_TIMEOUT: Duration = Duration::from_secs(3);

/// Default per-query deadline for the full exchange.
pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Default liveness window: the transport is business-ready only while
/// the last Pong is younger than this.
pub const DEFAULT_HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default deadline for a managed open and for handshake gating.
pub const DEFAULT_CONNECTION_TIMEOUT: Duration = Duration::from_secs(10);

/// Default webhook path for the HTTP backend.
pub const DEFAULT_WEBHOOK_PATH: &str = "/outbox/stream";

/// Default ping path for the HTTP backend.
pub const DEFAULT_PING_PATH: &str = "/outbox/ping";

/// Which backend a client drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// Persistent bidirectional WebSocket.
    Ws,
    /// Stateless request/response HTTP.
    Http,
    /// Parent process owning a spawned child, envelopes over its stdio.
    IpcParent,
    /// Child process talking to its parent over its own stdio.
    IpcChild,
}

impl TransportKind {
    /// Persistent transports carry the heartbeat protocol and the
    /// handshake gate; HTTP stands each request on its own.
    pub fn is_persistent(self) -> bool {
        !matches!(self, TransportKind::Http)
    }

    /// Only the socket backend restricts queries to one in flight.
    pub fn is_single_flight(self) -> bool {
        matches!(self, TransportKind::Ws)
    }
}

/// Reconnect policy for managed socket connections. Attached sockets and
/// non-socket transports never reconnect.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub enabled: bool,
    pub min_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    /// Fractional jitter applied to every delay, e.g. 0.1 for +/-10%.
    pub jitter: f64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            min_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(3),
            multiplier: 2.0,
            jitter: 0.1,
        }
    }
}

impl ReconnectPolicy {
    /// The delay following `current`, capped at `max_delay`.
    pub fn next_delay(&self, current: Duration) -> Duration {
        current.mul_f64(self.multiplier).min(self.max_delay)
    }

    /// Apply fractional jitter to a delay.
    pub fn jittered(&self, delay: Duration) -> Duration {
        jitter(delay, self.jitter)
    }
}

/// Client-initiated heartbeat policy. Off by default: the client stays
/// quiet and only answers the peer's Pings unless explicitly configured
/// to probe.
#[derive(Debug, Clone)]
pub struct HeartbeatPolicy {
    pub enabled: bool,
    /// Liveness window; also caps the ping interval schedule.
    pub timeout: Duration,
    /// Fractional jitter on each ping interval.
    pub jitter: f64,
}

impl Default for HeartbeatPolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            timeout: DEFAULT_HEARTBEAT_TIMEOUT,
            jitter: 0.1,
        }
    }
}

/// Multiply a duration by `1 +/- jitter` uniformly at random.
pub(crate) fn jitter(delay: Duration, fraction: f64) -> Duration {
    if fraction <= 0.0 {
        return delay;
    }
    let factor = rand::thread_rng().gen_range(-fraction..=fraction);
    delay.mul_f64(1.0 + factor)
}

/// Full client configuration. Constructed through
/// [`ClientBuilder`](crate::ClientBuilder); the fields are public so
/// channels built directly can be configured the same way.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub transport: TransportKind,
    /// WebSocket endpoint for the socket backend.
    pub url: Option<String>,
    /// Base URL for HTTP queries and pings.
    pub base_url: Option<String>,
    /// Local bind address for the HTTP webhook receiver. When absent the
    /// host mounts the router itself.
    pub webhook_addr: Option<SocketAddr>,
    pub webhook_path: String,
    pub ping_path: String,
    /// Echoed as `password` in Pong payloads and sent as the
    /// `X-Transport-Token` header on HTTP.
    pub token: Option<String>,
    pub max_message_bytes: usize,
    pub heartbeat: HeartbeatPolicy,
    pub connection_timeout: Duration,
    pub process_timeout: Duration,
    pub query_timeout: Duration,
    pub reconnect: ReconnectPolicy,
}

impl ClientConfig {
    /// Configuration with the documented defaults for one transport.
    pub fn new(transport: TransportKind) -> Self {
        Self {
            transport,
            url: None,
            base_url: None,
            webhook_addr: None,
            webhook_path: DEFAULT_WEBHOOK_PATH.to_string(),
            ping_path: DEFAULT_PING_PATH.to_string(),
            token: None,
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
            heartbeat: HeartbeatPolicy::default(),
            connection_timeout: DEFAULT_CONNECTION_TIMEOUT,
            process_timeout: DEFAULT_PROCESS_TIMEOUT,
            query_timeout: DEFAULT_QUERY_TIMEOUT,
            reconnect: ReconnectPolicy::default(),
        }
    }
}
