//! Error types for outbox-client.

use thiserror::Error;

/// Main error type for all outbox transport operations.
#[derive(Debug, Error)]
pub enum OutboxError {
    /// Misconfiguration detected while constructing a transport
    /// (missing URL, missing child command, colliding paths).
    #[error("transport init error: {0}")]
    TransportInit(String),

    /// Send attempted before the transport reached readiness.
    #[error("not connected")]
    NotConnected,

    /// Underlying I/O failure on the transport.
    #[error("connection error: {0}")]
    Connection(String),

    /// I/O error during socket/pipe operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encode/decode error on the envelope codec.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Query deadline exceeded; the pending entry has been evicted.
    #[error("query timed out")]
    QueryTimeout,

    /// A second query was issued while one is pending on a
    /// single-flight transport.
    #[error("query already in flight")]
    QueryInFlight,

    /// The peer answered the query with `ok == false`.
    #[error("query failed: {0}")]
    QueryFailed(String),

    /// The peer sent an `error` action for a correlated request.
    #[error("server error: {message}")]
    Server {
        /// Server-provided error text.
        message: String,
        /// Remaining server-provided fields, verbatim.
        details: Option<serde_json::Value>,
    },

    /// A query response carried neither `ok == true` nor `ok == false`.
    #[error("invalid query response")]
    InvalidResponse,

    /// Pre-send size guard failed; the envelope was never sent.
    #[error("message too large: {size} bytes (limit {limit})")]
    MessageTooLarge { size: usize, limit: usize },

    /// Batch processing exceeded its deadline. Internal: surfaces only
    /// as a suppressed ACK, never to the caller.
    #[error("batch processing timed out")]
    BatchTimeout,

    /// A handler is already registered for this event type on a
    /// transport that requires one handler per type.
    #[error("duplicate subscription for event type: {0}")]
    DuplicateSubscription(String),

    /// The connection went away while requests were pending.
    #[error("disconnected")]
    Disconnected,
}

/// Result type alias using OutboxError.
pub type Result<T> = std::result::Result<T, OutboxError>;
