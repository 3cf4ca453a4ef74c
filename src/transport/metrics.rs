//! Transport metrics - native counters for the selector loop and its channels
//!
//! Counters are plain atomics bumped from the selector thread (and from
//! caller threads for outbound data), read as a [`MetricsSnapshot`].

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Core transport metrics
pub struct TransportMetrics {
    // Byte counters
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,

    // Frame counters
    frames_received: AtomicU64,
    frames_sent: AtomicU64,
    control_frames_handled: AtomicU64,

    // Association lifecycle
    associations_up: AtomicU64,
    associations_down: AtomicU64,
    communications_lost: AtomicU64,
    connect_failures: AtomicU64,
    reconnects_scheduled: AtomicU64,
    accepts_rejected: AtomicU64,

    // Selector loop
    changes_applied: AtomicU64,
    loop_iterations: AtomicU64,

    start_time: Instant,
    last_reset: RwLock<Instant>,
}

impl TransportMetrics {
    pub fn new() -> Self {
        Self {
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            frames_received: AtomicU64::new(0),
            frames_sent: AtomicU64::new(0),
            control_frames_handled: AtomicU64::new(0),
            associations_up: AtomicU64::new(0),
            associations_down: AtomicU64::new(0),
            communications_lost: AtomicU64::new(0),
            connect_failures: AtomicU64::new(0),
            reconnects_scheduled: AtomicU64::new(0),
            accepts_rejected: AtomicU64::new(0),
            changes_applied: AtomicU64::new(0),
            loop_iterations: AtomicU64::new(0),
            start_time: Instant::now(),
            last_reset: RwLock::new(Instant::now()),
        }
    }

    pub fn record_bytes_sent(&self, bytes: usize) {
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_bytes_received(&self, bytes: usize) {
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_frame_received(&self) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_frame_sent(&self) {
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_control_frame(&self) {
        self.control_frames_handled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_association_up(&self) {
        self.associations_up.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_association_down(&self) {
        self.associations_down.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_communication_lost(&self) {
        self.communications_lost.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connect_failure(&self) {
        self.connect_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reconnect_scheduled(&self) {
        self.reconnects_scheduled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_accept_rejected(&self) {
        self.accepts_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_change_applied(&self) {
        self.changes_applied.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_loop_iteration(&self) {
        self.loop_iterations.fetch_add(1, Ordering::Relaxed);
    }

    /// Point-in-time copy of every counter
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            control_frames_handled: self.control_frames_handled.load(Ordering::Relaxed),
            associations_up: self.associations_up.load(Ordering::Relaxed),
            associations_down: self.associations_down.load(Ordering::Relaxed),
            communications_lost: self.communications_lost.load(Ordering::Relaxed),
            connect_failures: self.connect_failures.load(Ordering::Relaxed),
            reconnects_scheduled: self.reconnects_scheduled.load(Ordering::Relaxed),
            accepts_rejected: self.accepts_rejected.load(Ordering::Relaxed),
            changes_applied: self.changes_applied.load(Ordering::Relaxed),
            loop_iterations: self.loop_iterations.load(Ordering::Relaxed),
            uptime_secs: self.start_time.elapsed().as_secs_f64(),
        }
    }

    /// Restart the interval clock used by [`interval_secs`](Self::interval_secs)
    pub fn reset_interval(&self) {
        *self.last_reset.write() = Instant::now();
    }

    /// Seconds since the last interval reset
    pub fn interval_secs(&self) -> f64 {
        self.last_reset.read().elapsed().as_secs_f64()
    }
}

impl Default for TransportMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Serializable view of [`TransportMetrics`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub frames_received: u64,
    pub frames_sent: u64,
    pub control_frames_handled: u64,
    pub associations_up: u64,
    pub associations_down: u64,
    pub communications_lost: u64,
    pub connect_failures: u64,
    pub reconnects_scheduled: u64,
    pub accepts_rejected: u64,
    pub changes_applied: u64,
    pub loop_iterations: u64,
    pub uptime_secs: f64,
}
