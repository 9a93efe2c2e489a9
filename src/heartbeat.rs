//! Heartbeat and liveness tracking for persistent transports.
//!
//! [`Liveness`] is shared between a channel and the protocol router. The
//! router records Pongs (and replies to Pings); the channel consults it
//! for business-readiness: connected I/O alone is not enough, the last
//! Pong must also be younger than the heartbeat timeout. The first Pong
//! observed, or our reply to the first Ping, completes the handshake
//! that unlocks client-initiated requests.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Notify;

use crate::config::{self, HeartbeatPolicy};

/// Sentinel for "no pong observed yet".
const NEVER: u64 = u64::MAX;

/// Shared liveness state. Cheaply cloneable; all clones observe the same
/// connection.
#[derive(Clone)]
pub struct Liveness {
    inner: Arc<LivenessInner>,
}

struct LivenessInner {
    /// Reference point for the millisecond counters below.
    epoch: Instant,
    /// Milliseconds since `epoch` of the last liveness evidence.
    last_pong: AtomicU64,
    /// Count of Pongs observed; lets the ping loop detect fresh ones.
    pong_seq: AtomicU64,
    handshaken: AtomicBool,
    notify: Notify,
    timeout_ms: u64,
}

impl Liveness {
    /// Create liveness state with the given heartbeat window.
    pub fn new(timeout: Duration) -> Self {
        Self {
            inner: Arc::new(LivenessInner {
                epoch: Instant::now(),
                last_pong: AtomicU64::new(NEVER),
                pong_seq: AtomicU64::new(0),
                handshaken: AtomicBool::new(false),
                notify: Notify::new(),
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }

    fn now_ms(&self) -> u64 {
        self.inner.epoch.elapsed().as_millis() as u64
    }

    /// Record an inbound Pong: refresh the window, complete the
    /// handshake, and wake any gated requests.
    pub fn record_pong(&self) {
        self.inner.last_pong.store(self.now_ms(), Ordering::Release);
        self.inner.pong_seq.fetch_add(1, Ordering::AcqRel);
        self.inner.handshaken.store(true, Ordering::Release);
        self.inner.notify.notify_waiters();
    }

    /// Record that we replied to an inbound Ping. A peer that probes us
    /// is live, and the first exchange in either direction completes the
    /// handshake.
    pub fn record_ping_reply(&self) {
        self.inner.last_pong.store(self.now_ms(), Ordering::Release);
        self.inner.handshaken.store(true, Ordering::Release);
        self.inner.notify.notify_waiters();
    }

    /// Number of Pongs observed so far.
    pub fn pong_seq(&self) -> u64 {
        self.inner.pong_seq.load(Ordering::Acquire)
    }

    /// True once the first Ping/Pong exchange happened on this
    /// connection.
    pub fn handshake_complete(&self) -> bool {
        self.inner.handshaken.load(Ordering::Acquire)
    }

    /// True while the last Pong is within the heartbeat window.
    pub fn is_live(&self) -> bool {
        let last = self.inner.last_pong.load(Ordering::Acquire);
        last != NEVER && self.now_ms().saturating_sub(last) < self.inner.timeout_ms
    }

    /// Wait until `is_live()` holds, up to `deadline`. Returns whether
    /// liveness was reached in time.
    pub async fn wait_live(&self, deadline: Duration) -> bool {
        let start = Instant::now();
        loop {
            if self.is_live() {
                return true;
            }
            let remaining = match deadline.checked_sub(start.elapsed()) {
                Some(r) if !r.is_zero() => r,
                _ => return false,
            };
            // Bound the sleep so a stale notify cannot strand us.
            let wait = remaining.min(Duration::from_millis(50));
            let _ = tokio::time::timeout(wait, self.inner.notify.notified()).await;
        }
    }

    /// Forget everything about the previous connection. Called on
    /// observed disconnect so the next connection re-handshakes.
    pub fn reset(&self) {
        self.inner.last_pong.store(NEVER, Ordering::Release);
        self.inner.handshaken.store(false, Ordering::Release);
        self.inner.notify.notify_waiters();
    }
}

/// Exponential ping interval schedule: starts at a quarter of the
/// heartbeat window, doubles on each quiet round, caps at the window,
/// and resets when a fresh Pong arrives.
#[derive(Debug)]
pub struct PingSchedule {
    initial: Duration,
    max: Duration,
    current: Duration,
    jitter: f64,
}

impl PingSchedule {
    /// Build the schedule for a heartbeat policy.
    pub fn new(policy: &HeartbeatPolicy) -> Self {
        let initial = policy.timeout / 4;
        Self {
            initial,
            max: policy.timeout,
            current: initial,
            jitter: policy.jitter,
        }
    }

    /// The delay to sleep before the next ping; advances the schedule.
    pub fn next_delay(&mut self) -> Duration {
        let delay = config::jitter(self.current, self.jitter);
        self.current = (self.current * 2).min(self.max);
        delay
    }

    /// Drop back to the initial interval after a fresh Pong.
    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_starts_unverified_and_dead() {
        let liveness = Liveness::new(Duration::from_millis(100));
        assert!(!liveness.handshake_complete());
        assert!(!liveness.is_live());
    }

    #[test]
    fn test_pong_completes_handshake() {
        let liveness = Liveness::new(Duration::from_secs(10));
        liveness.record_pong();
        assert!(liveness.handshake_complete());
        assert!(liveness.is_live());
        assert_eq!(liveness.pong_seq(), 1);
    }

    #[test]
    fn test_ping_reply_completes_handshake() {
        let liveness = Liveness::new(Duration::from_secs(10));
        liveness.record_ping_reply();
        assert!(liveness.handshake_complete());
        assert!(liveness.is_live());
        // A reply is not a Pong for the ping schedule.
        assert_eq!(liveness.pong_seq(), 0);
    }

    #[tokio::test]
    async fn test_liveness_window_expires() {
        let liveness = Liveness::new(Duration::from_millis(20));
        liveness.record_pong();
        assert!(liveness.is_live());

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(!liveness.is_live());
        // Handshake survives the window; only readiness degrades.
        assert!(liveness.handshake_complete());
    }

    #[test]
    fn test_reset_clears_connection_state() {
        let liveness = Liveness::new(Duration::from_secs(10));
        liveness.record_pong();
        liveness.reset();
        assert!(!liveness.handshake_complete());
        assert!(!liveness.is_live());
    }

    #[tokio::test]
    async fn test_wait_live_times_out() {
        let liveness = Liveness::new(Duration::from_secs(10));
        let reached = liveness.wait_live(Duration::from_millis(30)).await;
        assert!(!reached);
    }

    #[tokio::test]
    async fn test_wait_live_wakes_on_pong() {
        let liveness = Liveness::new(Duration::from_secs(10));

        let waiter = liveness.clone();
        let handle = tokio::spawn(async move { waiter.wait_live(Duration::from_secs(2)).await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        liveness.record_pong();

        assert!(handle.await.unwrap());
    }

    #[test]
    fn test_ping_schedule_doubles_and_caps() {
        let policy = HeartbeatPolicy {
            enabled: true,
            timeout: Duration::from_secs(8),
            jitter: 0.0,
        };
        let mut schedule = PingSchedule::new(&policy);

        assert_eq!(schedule.next_delay(), Duration::from_secs(2));
        assert_eq!(schedule.next_delay(), Duration::from_secs(4));
        assert_eq!(schedule.next_delay(), Duration::from_secs(8));
        // Capped at the heartbeat window.
        assert_eq!(schedule.next_delay(), Duration::from_secs(8));

        schedule.reset();
        assert_eq!(schedule.next_delay(), Duration::from_secs(2));
    }
}
