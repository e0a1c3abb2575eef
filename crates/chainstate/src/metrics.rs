//! Block connect and flush timings.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

#[derive(Debug, Default)]
pub struct ConnectMetrics {
    connect_us: AtomicU64,
    connected_blocks: AtomicU64,
    disconnect_us: AtomicU64,
    disconnected_blocks: AtomicU64,
    inputs_us: AtomicU64,
    script_us: AtomicU64,
    script_checks: AtomicU64,
    script_cache_hits: AtomicU64,
    undo_us: AtomicU64,
    undo_bytes: AtomicU64,
    flush_us: AtomicU64,
    flushes: AtomicU64,
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ConnectMetricsSnapshot {
    pub connect_us: u64,
    pub connected_blocks: u64,
    pub disconnect_us: u64,
    pub disconnected_blocks: u64,
    pub inputs_us: u64,
    pub script_us: u64,
    pub script_checks: u64,
    pub script_cache_hits: u64,
    pub undo_us: u64,
    pub undo_bytes: u64,
    pub flush_us: u64,
    pub flushes: u64,
}

fn micros(elapsed: Duration) -> u64 {
    u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX)
}

impl ConnectMetrics {
    pub fn record_connect(&self, elapsed: Duration) {
        self.connect_us.fetch_add(micros(elapsed), Ordering::Relaxed);
        self.connected_blocks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_disconnect(&self, elapsed: Duration) {
        self.disconnect_us
            .fetch_add(micros(elapsed), Ordering::Relaxed);
        self.disconnected_blocks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_inputs(&self, elapsed: Duration) {
        self.inputs_us.fetch_add(micros(elapsed), Ordering::Relaxed);
    }

    pub fn record_scripts(&self, elapsed: Duration, checks: u64, cache_hits: u64) {
        self.script_us.fetch_add(micros(elapsed), Ordering::Relaxed);
        self.script_checks.fetch_add(checks, Ordering::Relaxed);
        self.script_cache_hits
            .fetch_add(cache_hits, Ordering::Relaxed);
    }

    pub fn record_undo(&self, elapsed: Duration, bytes: u64) {
        self.undo_us.fetch_add(micros(elapsed), Ordering::Relaxed);
        self.undo_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_flush(&self, elapsed: Duration) {
        self.flush_us.fetch_add(micros(elapsed), Ordering::Relaxed);
        self.flushes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ConnectMetricsSnapshot {
        ConnectMetricsSnapshot {
            connect_us: self.connect_us.load(Ordering::Relaxed),
            connected_blocks: self.connected_blocks.load(Ordering::Relaxed),
            disconnect_us: self.disconnect_us.load(Ordering::Relaxed),
            disconnected_blocks: self.disconnected_blocks.load(Ordering::Relaxed),
            inputs_us: self.inputs_us.load(Ordering::Relaxed),
            script_us: self.script_us.load(Ordering::Relaxed),
            script_checks: self.script_checks.load(Ordering::Relaxed),
            script_cache_hits: self.script_cache_hits.load(Ordering::Relaxed),
            undo_us: self.undo_us.load(Ordering::Relaxed),
            undo_bytes: self.undo_bytes.load(Ordering::Relaxed),
            flush_us: self.flush_us.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
        }
    }
}
