//! Query correlator: pending requests keyed by requestId or
//! correlationId.
//!
//! The key choice is fixed per transport: sockets correlate by
//! `requestId` and allow one query in flight; the process channels
//! correlate by `correlationId` (echoing `requestId` on the wire) and
//! run queries in parallel; HTTP correlates implicitly through its one
//! exchange. Every pending query resolves exactly once: with the
//! response envelope, with eviction on deadline, or with rejection when
//! the connection goes away.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::oneshot;
use tracing::debug;

use crate::envelope::Envelope;
use crate::error::{OutboxError, Result};

/// Which envelope field carries the correlation key on this transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyKind {
    RequestId,
    CorrelationId,
}

/// Concurrency policy for outgoing queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlightPolicy {
    /// At most one pending query; a second registration fails fast.
    SingleFlight,
    /// Bounded only by callers and deadlines.
    Parallel,
}

/// Pending-query table. Mutations are bounded single-map operations.
pub struct Correlator {
    key_kind: KeyKind,
    policy: FlightPolicy,
    pending: Mutex<HashMap<String, oneshot::Sender<Envelope>>>,
}

impl Correlator {
    /// Create a correlator with the transport's key kind and policy.
    pub fn new(key_kind: KeyKind, policy: FlightPolicy) -> Self {
        Self {
            key_kind,
            policy,
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// The envelope field this correlator matches responses on.
    pub fn key_kind(&self) -> KeyKind {
        self.key_kind
    }

    /// Register a pending query under `key` and obtain the receiver the
    /// response will arrive on.
    ///
    /// Fails fast with [`OutboxError::QueryInFlight`] when the policy is
    /// single-flight and another query is already pending.
    pub fn register(&self, key: &str) -> Result<oneshot::Receiver<Envelope>> {
        let mut pending = self.pending.lock().expect("correlator poisoned");
        if self.policy == FlightPolicy::SingleFlight && !pending.is_empty() {
            return Err(OutboxError::QueryInFlight);
        }
        let (tx, rx) = oneshot::channel();
        pending.insert(key.to_string(), tx);
        Ok(rx)
    }

    /// Remove a pending entry, e.g. on deadline or send failure. A reply
    /// arriving after eviction is discarded silently.
    pub fn evict(&self, key: &str) -> bool {
        self.pending
            .lock()
            .expect("correlator poisoned")
            .remove(key)
            .is_some()
    }

    /// Route an inbound response envelope to its pending query.
    ///
    /// Returns false when the envelope carries no key of the configured
    /// kind or no query is pending under it; such replies are dropped
    /// without further effect.
    pub fn complete(&self, env: Envelope) -> bool {
        let key = match self.key_kind {
            KeyKind::RequestId => env.request_id.clone(),
            KeyKind::CorrelationId => env.correlation_id.clone(),
        };
        let Some(key) = key else {
            debug!(action = %env.action, "response without correlation key, dropping");
            return false;
        };

        let sender = self
            .pending
            .lock()
            .expect("correlator poisoned")
            .remove(&key);
        match sender {
            Some(tx) => tx.send(env).is_ok(),
            None => {
                debug!(key = %key, "no pending query for response, dropping");
                false
            }
        }
    }

    /// Reject every pending query by dropping its sender. Receivers
    /// observe the closed channel and surface
    /// [`OutboxError::Disconnected`].
    pub fn fail_all(&self) {
        self.pending.lock().expect("correlator poisoned").clear();
    }

    /// Number of queries currently awaiting a response.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().expect("correlator poisoned").len()
    }
}
