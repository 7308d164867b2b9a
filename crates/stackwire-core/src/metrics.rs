//! Global atomic counters for deploy observability.
//!
//! Counters are incremented silently at the call site. Call
//! [`Metrics::flush`] to emit current values as a single
//! `tracing::info!` event (e.g. at the end of a deploy).

use std::sync::atomic::{AtomicU64, Ordering};

/// Global metrics singleton.
pub static METRICS: Metrics = Metrics::new();

/// Lightweight atomic counters, no allocations and no locking.
pub struct Metrics {
    resources_created: AtomicU64,
    resources_updated: AtomicU64,
    resources_deleted: AtomicU64,
    handler_invocations: AtomicU64,
    backend_retries: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            resources_created: AtomicU64::new(0),
            resources_updated: AtomicU64::new(0),
            resources_deleted: AtomicU64::new(0),
            handler_invocations: AtomicU64::new(0),
            backend_retries: AtomicU64::new(0),
        }
    }

    pub fn inc_created(&self) {
        self.resources_created.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "resources_created", "counter incremented");
    }

    pub fn inc_updated(&self) {
        self.resources_updated.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "resources_updated", "counter incremented");
    }

    pub fn inc_deleted(&self) {
        self.resources_deleted.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "resources_deleted", "counter incremented");
    }

    pub fn inc_handler_invocations(&self) {
        self.handler_invocations.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "handler_invocations", "counter incremented");
    }

    pub fn inc_backend_retries(&self) {
        self.backend_retries.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "backend_retries", "counter incremented");
    }

    /// Emit all current counter values as a single `info!` event.
    pub fn flush(&self) {
        tracing::info!(
            metric = "flush",
            resources_created = self.resources_created(),
            resources_updated = self.resources_updated(),
            resources_deleted = self.resources_deleted(),
            handler_invocations = self.handler_invocations(),
            backend_retries = self.backend_retries(),
        );
    }

    pub fn resources_created(&self) -> u64 {
        self.resources_created.load(Ordering::Relaxed)
    }

    pub fn resources_updated(&self) -> u64 {
        self.resources_updated.load(Ordering::Relaxed)
    }

    pub fn resources_deleted(&self) -> u64 {
        self.resources_deleted.load(Ordering::Relaxed)
    }

    pub fn handler_invocations(&self) -> u64 {
        self.handler_invocations.load(Ordering::Relaxed)
    }

    pub fn backend_retries(&self) -> u64 {
        self.backend_retries.load(Ordering::Relaxed)
    }

    /// Reset all counters to zero (useful in tests).
    pub fn reset(&self) {
        self.resources_created.store(0, Ordering::Relaxed);
        self.resources_updated.store(0, Ordering::Relaxed);
        self.resources_deleted.store(0, Ordering::Relaxed);
        self.handler_invocations.store(0, Ordering::Relaxed);
        self.backend_retries.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_increment_and_reset() {
        let m = Metrics::new();
        m.inc_created();
        m.inc_created();
        m.inc_handler_invocations();
        assert_eq!(m.resources_created(), 2);
        assert_eq!(m.handler_invocations(), 1);
        m.flush();
        m.reset();
        assert_eq!(m.resources_created(), 0);
        assert_eq!(m.handler_invocations(), 0);
    }
}
