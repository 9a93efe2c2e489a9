//! Batch dispatcher: per-type sequential, cross-type parallel fan-out.
//!
//! A batch is partitioned by `eventType`. Each group with a subscriber
//! runs as its own task, invoking handlers strictly in arrival order;
//! groups run concurrently. The whole batch shares one deadline. Full
//! success yields exactly one ACK covering every input index; any
//! failure or deadline expiry yields none, and the server retransmits.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::warn;

use crate::envelope::{AckPayload, BatchPayload, WireEvent};
use crate::error::{OutboxError, Result};

/// Boxed future used at the handler seams.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Error type user handlers may fail with.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// A subscriber for one event type. Handlers MUST be idempotent: the
/// delivery contract is at-least-once and a suppressed ACK means the
/// whole batch comes again.
pub type EventHandler =
    Arc<dyn Fn(WireEvent) -> BoxFuture<'static, std::result::Result<(), HandlerError>> + Send + Sync>;

/// How many handlers one event type may carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Multiplicity {
    /// Persistent-bidi transports: exactly one handler per type.
    Single,
    /// HTTP transport: any number, invoked sequentially per event.
    Multiple,
}

/// The eventType → handler map. Mutations are bounded single-map
/// operations; dispatch iterates over a snapshot.
pub struct Subscriptions {
    handlers: Mutex<HashMap<String, Vec<EventHandler>>>,
    multiplicity: Multiplicity,
}

impl Subscriptions {
    /// Create an empty subscription set with the given multiplicity.
    pub fn new(multiplicity: Multiplicity) -> Self {
        Self {
            handlers: Mutex::new(HashMap::new()),
            multiplicity,
        }
    }

    /// Register a handler for an event type.
    ///
    /// On `Single` transports a second handler for the same type fails
    /// with [`OutboxError::DuplicateSubscription`].
    pub fn subscribe<F, Fut>(&self, event_type: &str, handler: F) -> Result<()>
    where
        F: Fn(WireEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), HandlerError>> + Send + 'static,
    {
        self.subscribe_handler(event_type, Arc::new(move |ev| Box::pin(handler(ev))))
    }

    /// Register an already-boxed handler.
    pub fn subscribe_handler(&self, event_type: &str, handler: EventHandler) -> Result<()> {
        let mut handlers = self.handlers.lock().expect("subscriptions poisoned");
        let entry = handlers.entry(event_type.to_string()).or_default();
        if self.multiplicity == Multiplicity::Single && !entry.is_empty() {
            return Err(OutboxError::DuplicateSubscription(event_type.to_string()));
        }
        entry.push(handler);
        Ok(())
    }

    /// Remove every handler for an event type. Returns whether any
    /// handler was present.
    pub fn unsubscribe(&self, event_type: &str) -> bool {
        self.handlers
            .lock()
            .expect("subscriptions poisoned")
            .remove(event_type)
            .is_some()
    }

    /// Number of event types with at least one handler.
    pub fn len(&self) -> usize {
        self.handlers.lock().expect("subscriptions poisoned").len()
    }

    /// True when nothing is subscribed.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every subscription.
    pub fn clear(&self) {
        self.handlers.lock().expect("subscriptions poisoned").clear();
    }

    /// Snapshot the handlers for one event type.
    fn snapshot(&self, event_type: &str) -> Vec<EventHandler> {
        self.handlers
            .lock()
            .expect("subscriptions poisoned")
            .get(event_type)
            .cloned()
            .unwrap_or_default()
    }
}

/// Fans one batch out to subscribers and decides whether to ACK.
pub struct Dispatcher {
    subscriptions: Arc<Subscriptions>,
    process_timeout: Duration,
}

impl Dispatcher {
    /// Create a dispatcher over a shared subscription set.
    pub fn new(subscriptions: Arc<Subscriptions>, process_timeout: Duration) -> Self {
        Self {
            subscriptions,
            process_timeout,
        }
    }

    /// Process one batch.
    ///
    /// Returns the ACK payload iff every subscribed handler finished
    /// successfully within the deadline; `None` suppresses the ACK and
    /// leaves retransmission to the server. Events without subscribers
    /// are no-ops and never block the ACK: a batch with no matching
    /// subscribers at all still acknowledges the full index range.
    pub async fn dispatch(&self, batch: BatchPayload) -> Option<AckPayload> {
        let count = batch.events.len();
        let ack = AckPayload {
            ok: true,
            ok_indices: Some((0..count).collect()),
            stream_id: batch.stream_id.clone(),
            ack_from_offset: batch.from_offset,
            ack_to_offset: batch.to_offset,
        };

        // Partition by type, preserving arrival order within each group.
        let mut groups: HashMap<String, Vec<WireEvent>> = HashMap::new();
        for event in batch.events {
            groups
                .entry(event.event_type.clone())
                .or_default()
                .push(event);
        }

        let mut tasks = Vec::new();
        for (event_type, events) in groups {
            let handlers = self.subscriptions.snapshot(&event_type);
            if handlers.is_empty() {
                continue;
            }
            tasks.push(tokio::spawn(run_group(event_type, events, handlers)));
        }

        if tasks.is_empty() {
            return Some(ack);
        }

        let aborts: Vec<_> = tasks.iter().map(|t| t.abort_handle()).collect();
        let all = async {
            for task in tasks {
                match task.await {
                    Ok(Ok(())) => {}
                    Ok(Err(())) => return Err(()),
                    Err(_) => return Err(()),
                }
            }
            Ok(())
        };

        match tokio::time::timeout(self.process_timeout, all).await {
            Ok(Ok(())) => Some(ack),
            Ok(Err(())) => {
                for abort in aborts {
                    abort.abort();
                }
                None
            }
            Err(_) => {
                for abort in aborts {
                    abort.abort();
                }
                warn!(
                    timeout_ms = self.process_timeout.as_millis() as u64,
                    "batch processing deadline exceeded, suppressing ack"
                );
                None
            }
        }
    }
}

/// Run every handler over every event of one group, strictly in arrival
/// order. Multiple handlers (HTTP) run sequentially per event.
async fn run_group(
    event_type: String,
    events: Vec<WireEvent>,
    handlers: Vec<EventHandler>,
) -> std::result::Result<(), ()> {
    for event in events {
        for handler in &handlers {
            if let Err(err) = handler(event.clone()).await {
                warn!(event_type = %event_type, error = %err, "event handler failed");
                return Err(());
            }
        }
    }
    Ok(())
}
