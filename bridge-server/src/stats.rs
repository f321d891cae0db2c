//! Per-second event counters, live gauges, and the per-client throttle.
//!
//! Counters form a tree: every connection gets a child of the process-wide
//! root, and each increment on a child also lands on its parent. The root
//! runs a ticking loop that freezes and resets the per-second buckets once a
//! second; children roll their own bucket over when throttling forces them
//! to. All updates are relaxed atomics, so a count racing a reset can be lost
//! across a bucket boundary. The numbers are advisory.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::info;

const NANOS_PER_SECOND: u64 = 1_000_000_000;

pub struct StatCounter {
    parent: Option<Arc<StatCounter>>,
    ticker_running: AtomicBool,
    unixtime: AtomicI64,
    // per-second buckets
    connection_attempts_per_sec: AtomicI64,
    connections_per_sec: AtomicI64,
    throttled_connections_per_sec: AtomicI64,
    requests_per_sec: AtomicI64,
    responses_per_sec: AtomicI64,
    // gauges
    active_connections: AtomicI64,
    active_requests: AtomicI64,
}

/// Counter values frozen at the end of one second.
#[derive(Debug, Clone, Copy, Default)]
pub struct StatSnapshot {
    pub unixtime: i64,
    pub connection_attempts_per_sec: i64,
    pub connections_per_sec: i64,
    pub throttled_connections_per_sec: i64,
    pub requests_per_sec: i64,
    pub responses_per_sec: i64,
    pub active_connections: i64,
    pub active_requests: i64,
}

impl StatSnapshot {
    /// True when the frozen second saw neither live connections nor traffic.
    pub fn is_idle(&self) -> bool {
        self.active_connections == 0 && self.requests_per_sec == 0 && self.responses_per_sec == 0
    }
}

pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

impl StatCounter {
    /// The process-wide counter. Pair with a spawned [`ticking_loop`].
    ///
    /// [`ticking_loop`]: StatCounter::ticking_loop
    pub fn root() -> Arc<Self> {
        Self::with_parent(None)
    }

    /// A per-connection counter chained to `parent`.
    pub fn child(parent: &Arc<StatCounter>) -> Arc<Self> {
        Self::with_parent(Some(parent.clone()))
    }

    fn with_parent(parent: Option<Arc<StatCounter>>) -> Arc<Self> {
        let counter = Arc::new(Self {
            parent,
            ticker_running: AtomicBool::new(false),
            unixtime: AtomicI64::new(0),
            connection_attempts_per_sec: AtomicI64::new(0),
            connections_per_sec: AtomicI64::new(0),
            throttled_connections_per_sec: AtomicI64::new(0),
            requests_per_sec: AtomicI64::new(0),
            responses_per_sec: AtomicI64::new(0),
            active_connections: AtomicI64::new(0),
            active_requests: AtomicI64::new(0),
        });
        counter.tick(unix_now());
        counter
    }

    /// Reset the per-second buckets for a new second and return the values
    /// frozen over the previous one. Swaps and gauge loads are independent
    /// atomics; an event racing the boundary may be counted once off.
    pub fn tick(&self, unixtime: i64) -> StatSnapshot {
        StatSnapshot {
            unixtime: self.unixtime.swap(unixtime, Ordering::Relaxed),
            connection_attempts_per_sec: self.connection_attempts_per_sec.swap(0, Ordering::Relaxed),
            connections_per_sec: self.connections_per_sec.swap(0, Ordering::Relaxed),
            throttled_connections_per_sec: self
                .throttled_connections_per_sec
                .swap(0, Ordering::Relaxed),
            requests_per_sec: self.requests_per_sec.swap(0, Ordering::Relaxed),
            responses_per_sec: self.responses_per_sec.swap(0, Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            active_requests: self.active_requests.load(Ordering::Relaxed),
        }
    }

    /// Roll the bucket over when the wall clock has moved past the stored
    /// second. Used by counters that have no ticking loop of their own.
    pub fn tick_if_needed(&self, now: SystemTime) {
        let now_unix = now
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as i64;
        let prev_unix = self.unixtime.swap(now_unix, Ordering::Relaxed);
        if prev_unix < now_unix {
            self.tick(now_unix);
        }
    }

    /// Once-a-second reset loop for the root counter. Emits the stats line
    /// only when the previous second saw any activity.
    pub async fn ticking_loop(self: Arc<Self>) {
        self.ticker_running.store(true, Ordering::Relaxed);
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        ticker.tick().await; // the first tick completes immediately
        loop {
            ticker.tick().await;
            let frozen = self.tick(unix_now());
            if frozen.is_idle() {
                continue;
            }
            info!(
                "New conns per sec: {}; Active conns: {}; Throttled conns: {}; RPS: {}; Handled RPS: {}; Active requests: {}",
                frozen.connections_per_sec,
                frozen.active_connections,
                frozen.throttled_connections_per_sec,
                frozen.requests_per_sec,
                frozen.responses_per_sec,
                frozen.active_requests,
            );
        }
    }

    pub fn connection_attempt(&self) {
        self.connection_attempts_per_sec.fetch_add(1, Ordering::Relaxed);
        if let Some(parent) = &self.parent {
            parent.connection_attempt();
        }
    }

    /// Record an opened connection. The guard records the close.
    pub fn opened_connection(self: Arc<Self>) -> ConnectionGuard {
        self.record_opened_connection();
        ConnectionGuard { stats: self }
    }

    /// Record a started request. The guard records completion, panics
    /// included.
    pub fn request_started(self: Arc<Self>) -> RequestGuard {
        self.record_request_started();
        RequestGuard { stats: self }
    }

    pub fn connection_throttled(&self) {
        self.throttled_connections_per_sec.fetch_add(1, Ordering::Relaxed);
        if let Some(parent) = &self.parent {
            parent.connection_throttled();
        }
    }

    pub fn active_connections(&self) -> i64 {
        self.active_connections.load(Ordering::Relaxed)
    }

    pub fn active_requests(&self) -> i64 {
        self.active_requests.load(Ordering::Relaxed)
    }

    fn record_opened_connection(&self) {
        self.connections_per_sec.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
        if let Some(parent) = &self.parent {
            parent.record_opened_connection();
        }
    }

    fn record_closed_connection(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
        if let Some(parent) = &self.parent {
            parent.record_closed_connection();
        }
    }

    fn record_request_started(&self) {
        self.requests_per_sec.fetch_add(1, Ordering::Relaxed);
        self.active_requests.fetch_add(1, Ordering::Relaxed);
        if let Some(parent) = &self.parent {
            parent.record_request_started();
        }
    }

    fn record_request_finished(&self) {
        self.responses_per_sec.fetch_add(1, Ordering::Relaxed);
        self.active_requests.fetch_sub(1, Ordering::Relaxed);
        if let Some(parent) = &self.parent {
            parent.record_request_finished();
        }
    }

    /// Block until the next second boundary when either per-second ceiling
    /// is reached. Limits of zero or less disable the corresponding check.
    pub async fn throttle_if_needed(
        &self,
        now: SystemTime,
        rps_limit: i64,
        active_requests_limit: i64,
    ) {
        if rps_limit > 0 && rps_limit <= self.requests_per_sec.load(Ordering::Relaxed) {
            self.throttle(now).await;
        } else if active_requests_limit > 0
            && active_requests_limit <= self.active_requests.load(Ordering::Relaxed)
        {
            self.throttle(now).await;
        }
    }

    /// Sleep out the remainder of the current second, computed from the wall
    /// clock's sub-second nanos. Clock jumps may over- or under-sleep; the
    /// counters are advisory.
    async fn throttle(&self, now: SystemTime) {
        self.connection_throttled();
        let subsec = now
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .subsec_nanos() as u64;
        let remaining = NANOS_PER_SECOND - subsec + 1;
        tokio::time::sleep(Duration::from_nanos(remaining)).await;
        if !self.ticker_running.load(Ordering::Relaxed) {
            self.tick_if_needed(SystemTime::now());
        }
    }
}

/// Decrements the active-connection gauge (chained to the parent) on drop.
pub struct ConnectionGuard {
    stats: Arc<StatCounter>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.stats.record_closed_connection();
    }
}

/// Records request completion (chained to the parent) on drop.
pub struct RequestGuard {
    stats: Arc<StatCounter>,
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        self.stats.record_request_finished();
    }
}
