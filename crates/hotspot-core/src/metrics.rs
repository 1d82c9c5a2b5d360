// ── Metrics seam ──
//
// Counters are keyed by dotted names. The core only increments; the binary
// plugs in a Prometheus-backed implementation, tests use `InMemoryMetrics`.

use std::fmt::Debug;
use std::sync::Arc;

use dashmap::DashMap;

pub const WEBHOOK_DUPLICATE: &str = "payment.webhook.duplicate";
pub const WEBHOOK_INVALID_SIGNATURE: &str = "payment.webhook.invalid_signature";
pub const EFFECT_FAILED: &str = "payment.effect.failed";
pub const AUTO_DEBT_BINDING_MISMATCH: &str = "policy.mismatch.auto_debt_blocked_ip_binding";
pub const SYNC_LOCK_DEGRADED: &str = "hotspot.sync.lock.degraded";
pub const SYNC_STEP_FAILED: &str = "hotspot.sync.step.failed";
pub const NOTIFY_FAILED: &str = "notification.dispatch.failed";
pub const NOTIFY_SKIPPED_OPEN: &str = "notification.dispatch.skipped_open";
pub const NOTIFY_SENT: &str = "notification.dispatch.sent";

/// Every counter name the core increments.
pub const ALL_COUNTERS: &[&str] = &[
    WEBHOOK_DUPLICATE,
    WEBHOOK_INVALID_SIGNATURE,
    EFFECT_FAILED,
    AUTO_DEBT_BINDING_MISMATCH,
    SYNC_LOCK_DEGRADED,
    SYNC_STEP_FAILED,
    NOTIFY_FAILED,
    NOTIFY_SKIPPED_OPEN,
    NOTIFY_SENT,
];

pub trait Metrics: Send + Sync + Debug {
    fn increment(&self, name: &str);

    /// Increment with a single label (provider, step, effect).
    fn increment_labeled(&self, name: &str, label: &str) {
        let _ = label;
        self.increment(name);
    }
}

pub type SharedMetrics = Arc<dyn Metrics>;

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl Metrics for NoopMetrics {
    fn increment(&self, _name: &str) {}
}

/// Lock-free counters, readable back for assertions and diagnostics.
#[derive(Debug, Default)]
pub struct InMemoryMetrics {
    counters: DashMap<String, u64>,
}

impl InMemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> u64 {
        self.counters.get(name).map_or(0, |v| *v)
    }

    pub fn get_labeled(&self, name: &str, label: &str) -> u64 {
        self.get(&format!("{name}{{{label}}}"))
    }

    /// Snapshot sorted by name.
    pub fn snapshot(&self) -> Vec<(String, u64)> {
        let mut all: Vec<(String, u64)> = self
            .counters
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect();
        all.sort();
        all
    }
}

impl Metrics for InMemoryMetrics {
    fn increment(&self, name: &str) {
        *self.counters.entry(name.to_owned()).or_insert(0) += 1;
    }

    fn increment_labeled(&self, name: &str, label: &str) {
        self.increment(name);
        *self
            .counters
            .entry(format!("{name}{{{label}}}"))
            .or_insert(0) += 1;
    }
}
