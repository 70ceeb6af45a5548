//! Ping tracking
//!
//! Shared between the dispatch thread, which records inbound traffic and
//! outbound writes, and the worker, which sends pings and enforces the
//! timeout. Timestamps are milliseconds since an internal epoch so they fit
//! in atomics.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Pings are sent after a third of the negotiated timeout passes without
/// outbound traffic
pub const PING_INTERVAL_DIVISOR: u64 = 3;

/// Tracks traffic in both directions on one connection
pub struct PingTracker {
    epoch: Instant,
    last_sent_ms: AtomicU64,
    last_received_ms: AtomicU64,
    /// Negotiated timeout; 0 while the handshake is running
    timeout_ms: AtomicU64,
}

impl PingTracker {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
            last_sent_ms: AtomicU64::new(0),
            last_received_ms: AtomicU64::new(0),
            timeout_ms: AtomicU64::new(0),
        }
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    /// Start tracking with the negotiated timeout
    ///
    /// Both directions count as fresh at this point.
    pub fn start(&self, timeout: Duration) {
        let now = self.now_ms();
        self.last_sent_ms.store(now, Ordering::Release);
        self.last_received_ms.store(now, Ordering::Release);
        self.timeout_ms
            .store(timeout.as_millis() as u64, Ordering::Release);
    }

    pub fn is_started(&self) -> bool {
        self.timeout_ms.load(Ordering::Acquire) > 0
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.load(Ordering::Acquire))
    }

    /// Record outbound traffic (a ping or any written message)
    pub fn record_sent(&self) {
        self.last_sent_ms.store(self.now_ms(), Ordering::Release);
    }

    /// Record inbound traffic (a ping or any read message)
    pub fn record_received(&self) {
        self.last_received_ms.store(self.now_ms(), Ordering::Release);
    }

    /// A ping should go out now
    pub fn send_due(&self) -> bool {
        let timeout = self.timeout_ms.load(Ordering::Acquire);
        if timeout == 0 {
            return false;
        }
        let interval = (timeout / PING_INTERVAL_DIVISOR).max(1);
        let sent = self.last_sent_ms.load(Ordering::Acquire);
        self.now_ms().saturating_sub(sent) >= interval
    }

    /// Nothing was received within the full timeout
    pub fn expired(&self) -> bool {
        let timeout = self.timeout_ms.load(Ordering::Acquire);
        if timeout == 0 {
            return false;
        }
        let received = self.last_received_ms.load(Ordering::Acquire);
        self.now_ms().saturating_sub(received) > timeout
    }

    pub fn time_since_last_receive(&self) -> Duration {
        let received = self.last_received_ms.load(Ordering::Acquire);
        Duration::from_millis(self.now_ms().saturating_sub(received))
    }

    /// Stop tracking; used when a connection attempt is replaced
    pub fn reset(&self) {
        self.timeout_ms.store(0, Ordering::Release);
        self.last_sent_ms.store(0, Ordering::Release);
        self.last_received_ms.store(0, Ordering::Release);
    }
}

impl Default for PingTracker {
    fn default() -> Self {
        Self::new()
    }
}
