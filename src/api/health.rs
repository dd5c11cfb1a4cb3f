//! Shared health counters for the /health endpoint.
//! Updated by the report consumer and the ProjectionWriter.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Default)]
pub struct HealthState {
    /// Refresh reports handed to the DB writer.
    pub reports_received: AtomicU64,
    /// Reports queued for the DB writer but not yet written.
    pub write_queue_pending: AtomicU64,
    /// Nanosecond timestamp of the last finished DB write (0 = none).
    pub last_write_at_ns: AtomicU64,
    pub write_errors: AtomicU64,
}

impl HealthState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn report_queued(&self) {
        self.reports_received.fetch_add(1, Ordering::Relaxed);
        self.write_queue_pending.fetch_add(1, Ordering::Relaxed);
    }

    pub fn report_written(&self, at_ns: u64, errors: u64) {
        // Saturating: a write may land before its queue increment is visible.
        let _ = self
            .write_queue_pending
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| Some(n.saturating_sub(1)));
        self.last_write_at_ns.store(at_ns, Ordering::Relaxed);
        self.write_errors.fetch_add(errors, Ordering::Relaxed);
    }

    pub fn reports_received(&self) -> u64 {
        self.reports_received.load(Ordering::Relaxed)
    }

    pub fn write_queue_pending(&self) -> u64 {
        self.write_queue_pending.load(Ordering::Relaxed)
    }

    pub fn last_write_at_ns(&self) -> u64 {
        self.last_write_at_ns.load(Ordering::Relaxed)
    }

    pub fn write_errors(&self) -> u64 {
        self.write_errors.load(Ordering::Relaxed)
    }
}
