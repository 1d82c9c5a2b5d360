//! Prometheus backend for the engine's counters.
//!
//! Every dotted counter name the core declares becomes one
//! `hotspot_<name>_total` family with a single `label` dimension
//! (provider, step, effect; empty when unlabeled). Names the core did not
//! declare land in `hotspot_unregistered_events_total` so nothing is lost.

use std::collections::HashMap;

use hotspot_core::metrics::{ALL_COUNTERS, Metrics};
use prometheus::{Encoder, IntCounterVec, Opts, Registry, TextEncoder};
use tracing::warn;

const NAMESPACE: &str = "hotspot";

pub struct PrometheusMetrics {
    registry: Registry,
    counters: HashMap<&'static str, IntCounterVec>,
    unregistered: IntCounterVec,
}

impl std::fmt::Debug for PrometheusMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrometheusMetrics")
            .field("families", &self.counters.len())
            .finish_non_exhaustive()
    }
}

/// `payment.webhook.duplicate` -> `payment_webhook_duplicate_total`. A
/// leading `hotspot.` is dropped since the namespace already says it.
fn family_name(dotted: &str) -> String {
    let dotted = dotted.strip_prefix("hotspot.").unwrap_or(dotted);
    format!("{}_total", dotted.replace(['.', '-'], "_"))
}

impl PrometheusMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let mut counters = HashMap::with_capacity(ALL_COUNTERS.len());
        for &name in ALL_COUNTERS {
            let vec = IntCounterVec::new(
                Opts::new(family_name(name), format!("Occurrences of {name}")).namespace(NAMESPACE),
                &["label"],
            )?;
            registry.register(Box::new(vec.clone()))?;
            counters.insert(name, vec);
        }

        let unregistered = IntCounterVec::new(
            Opts::new(
                "unregistered_events_total",
                "Counters incremented under an undeclared name",
            )
            .namespace(NAMESPACE),
            &["name", "label"],
        )?;
        registry.register(Box::new(unregistered.clone()))?;

        Ok(Self {
            registry,
            counters,
            unregistered,
        })
    }

    /// Text exposition format for `GET /metrics`.
    pub fn render(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

impl Metrics for PrometheusMetrics {
    fn increment(&self, name: &str) {
        self.increment_labeled(name, "");
    }

    fn increment_labeled(&self, name: &str, label: &str) {
        if let Some(vec) = self.counters.get(name) {
            vec.with_label_values(&[label]).inc();
        } else {
            warn!(name, "increment of undeclared counter");
            self.unregistered.with_label_values(&[name, label]).inc();
        }
    }
}
