//! Ping/pong keep-alive tracking for one session.
//!
//! Every ping tick either sends a PING or, when more than `max_pings_out` are still unanswered,
//! declares the connection stale. Any PONG clears the outstanding count.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// What the worker should do on a ping tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PingAction {
    /// Queue a PING.
    Send,
    /// Too many unanswered PINGs.
    Stale,
}

/// Keep-alive counters for diagnostics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PingStats {
    /// PINGs currently unanswered.
    pub outstanding: u32,
    /// PINGs sent this session.
    pub total_sent: u64,
    /// PONGs received this session.
    pub total_received: u64,
    /// Round-trip time of the last answered PING.
    pub last_rtt: Option<Duration>,
}

/// Tracks outstanding PINGs.
#[derive(Debug)]
pub struct PingTracker {
    max_pings_out: u32,
    outstanding: AtomicU32,
    total_sent: AtomicU64,
    total_received: AtomicU64,
    last_sent: Mutex<Option<Instant>>,
    last_rtt: Mutex<Option<Duration>>,
}

impl PingTracker {
    /// Creates a tracker tolerating `max_pings_out` unanswered PINGs.
    pub fn new(max_pings_out: u32) -> Self {
        Self {
            max_pings_out,
            outstanding: AtomicU32::new(0),
            total_sent: AtomicU64::new(0),
            total_received: AtomicU64::new(0),
            last_sent: Mutex::new(None),
            last_rtt: Mutex::new(None),
        }
    }

    /// Called on every ping tick.
    pub fn on_tick(&self) -> PingAction {
        let outstanding = self.outstanding.fetch_add(1, Ordering::SeqCst) + 1;
        if outstanding > self.max_pings_out {
            return PingAction::Stale;
        }
        self.total_sent.fetch_add(1, Ordering::Relaxed);
        *self.last_sent.lock() = Some(Instant::now());
        PingAction::Send
    }

    /// Records a PONG from the server.
    pub fn record_pong(&self) {
        self.total_received.fetch_add(1, Ordering::Relaxed);
        self.outstanding.store(0, Ordering::SeqCst);
        if let Some(sent) = self.last_sent.lock().take() {
            *self.last_rtt.lock() = Some(sent.elapsed());
        }
    }

    /// Clears all counters for a new session.
    pub fn reset(&self) {
        self.outstanding.store(0, Ordering::SeqCst);
        self.total_sent.store(0, Ordering::Relaxed);
        self.total_received.store(0, Ordering::Relaxed);
        *self.last_sent.lock() = None;
        *self.last_rtt.lock() = None;
    }

    /// Current counters.
    pub fn stats(&self) -> PingStats {
        PingStats {
            outstanding: self.outstanding.load(Ordering::SeqCst),
            total_sent: self.total_sent.load(Ordering::Relaxed),
            total_received: self.total_received.load(Ordering::Relaxed),
            last_rtt: *self.last_rtt.lock(),
        }
    }
}
