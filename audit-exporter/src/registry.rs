//! Metrics registry
//!
//! Owns a Prometheus registry holding the `RuleStat` gauge family, keyed by
//! label-key, plus a few pipeline self-metrics. Cloning the handle shares the
//! same registry, so the aggregator writes and the exporter reads one set of
//! series.
//!
//! Series are created on first observation. Without a series bound they are
//! never removed, so memory grows with the number of distinct label-keys
//! seen. With `max_series` set, the least recently updated series is evicted
//! when a new one would exceed the bound.

use dashmap::DashMap;
use prometheus::{core::Collector, Encoder, GaugeVec, IntCounter, Opts, Registry, TextEncoder};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::{Error, Result};

/// Gauge family name
pub const RULE_STAT: &str = "RuleStat";
/// Label carrying the label-key
pub const RULE_STAT_LABEL: &str = "rulestats";

struct Inner {
    registry: Registry,
    rule_stat: GaugeVec,
    processed: IntCounter,
    dropped: IntCounter,
    evicted: IntCounter,
    /// Last update sequence per series; only maintained when bounded
    recency: DashMap<String, u64>,
    sequence: AtomicU64,
    max_series: Option<usize>,
}

/// Process-wide metrics state, created at startup and injected where needed
#[derive(Clone)]
pub struct MetricsRegistry {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for MetricsRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsRegistry")
            .field("series", &self.series_count())
            .field("max_series", &self.inner.max_series)
            .finish()
    }
}

impl MetricsRegistry {
    /// Create an unbounded registry
    pub fn new() -> Result<Self> {
        Self::with_max_series(None)
    }

    /// Create a registry, optionally bounding the number of `RuleStat` series
    ///
    /// A bound of zero is raised to one.
    pub fn with_max_series(max_series: Option<usize>) -> Result<Self> {
        let registry = Registry::new();

        let rule_stat = GaugeVec::new(Opts::new(RULE_STAT, "event details"), &[RULE_STAT_LABEL])?;
        registry.register(Box::new(rule_stat.clone()))?;

        let processed = IntCounter::with_opts(Opts::new(
            "audit_exporter_messages_processed_total",
            "Audit messages aggregated into RuleStat",
        ))?;
        registry.register(Box::new(processed.clone()))?;

        let dropped = IntCounter::with_opts(Opts::new(
            "audit_exporter_handoff_dropped_total",
            "Audit messages discarded by the handoff overflow policy",
        ))?;
        registry.register(Box::new(dropped.clone()))?;

        let evicted = IntCounter::with_opts(Opts::new(
            "audit_exporter_series_evicted_total",
            "RuleStat series evicted by the series bound",
        ))?;
        registry.register(Box::new(evicted.clone()))?;

        Ok(Self {
            inner: Arc::new(Inner {
                registry,
                rule_stat,
                processed,
                dropped,
                evicted,
                recency: DashMap::new(),
                sequence: AtomicU64::new(0),
                max_series: max_series.map(|max| max.max(1)),
            }),
        })
    }

    /// Set the series for `label_key`, overwriting any previous value
    pub fn set(&self, label_key: &str, value: f64) {
        self.inner
            .rule_stat
            .with_label_values(&[label_key])
            .set(value);

        if let Some(max) = self.inner.max_series {
            let seq = self.inner.sequence.fetch_add(1, Ordering::Relaxed);
            self.inner.recency.insert(label_key.to_string(), seq);
            while self.inner.recency.len() > max {
                self.evict_least_recent();
            }
        }
    }

    fn evict_least_recent(&self) {
        let oldest = self
            .inner
            .recency
            .iter()
            .min_by_key(|entry| *entry.value())
            .map(|entry| entry.key().clone());

        if let Some(key) = oldest {
            self.inner.recency.remove(&key);
            if self.inner.rule_stat.remove_label_values(&[key.as_str()]).is_ok() {
                self.inner.evicted.inc();
            }
            tracing::debug!(label = %key, "Evicted least recently updated series");
        }
    }

    /// Current value for `label_key`, if the series exists
    pub fn get(&self, label_key: &str) -> Option<f64> {
        self.snapshot()
            .into_iter()
            .find(|(key, _)| key == label_key)
            .map(|(_, value)| value)
    }

    /// All `RuleStat` series as (label-key, value) pairs
    pub fn snapshot(&self) -> Vec<(String, f64)> {
        let mut samples = Vec::new();
        for family in self.inner.rule_stat.collect() {
            for metric in family.get_metric() {
                let key = metric
                    .get_label()
                    .iter()
                    .find(|pair| pair.get_name() == RULE_STAT_LABEL)
                    .map(|pair| pair.get_value().to_string())
                    .unwrap_or_default();
                samples.push((key, metric.get_gauge().get_value()));
            }
        }
        samples
    }

    /// Number of `RuleStat` series
    pub fn series_count(&self) -> usize {
        self.inner
            .rule_stat
            .collect()
            .iter()
            .map(|family| family.get_metric().len())
            .sum()
    }

    /// Count one aggregated message
    pub fn record_processed(&self) {
        self.inner.processed.inc();
    }

    /// Messages aggregated so far
    pub fn processed(&self) -> u64 {
        self.inner.processed.get()
    }

    /// Bring the drop counter up to the handoff's running total
    pub fn sync_dropped(&self, total: u64) {
        let current = self.inner.dropped.get();
        if total > current {
            self.inner.dropped.inc_by(total - current);
        }
    }

    /// Render all metrics in the Prometheus text exposition format
    pub fn render(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.inner.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer)
            .map_err(|e| Error::Internal(format!("Metrics output is not UTF-8: {}", e)))
    }

    /// Content type of [`render`](Self::render)
    pub fn content_type(&self) -> String {
        TextEncoder::new().format_type().to_string()
    }
}
