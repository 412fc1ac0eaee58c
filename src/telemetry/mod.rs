//! Resolver metrics.
//!
//! Lock-free counters updated on every resolution. A [`MetricsSnapshot`] can
//! be checked against the configured [`PerformanceTargets`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::PerformanceTargets;

#[derive(Debug, Default)]
pub struct ResolverMetrics {
    resolutions: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    failures: AtomicU64,
    total_micros: AtomicU64,
    max_micros: AtomicU64,
}

impl ResolverMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    /// Count one finished resolution.
    pub fn record_resolution(&self, elapsed: Duration, success: bool) {
        let micros = elapsed.as_micros().min(u64::MAX as u128) as u64;
        self.resolutions.fetch_add(1, Ordering::Relaxed);
        self.total_micros.fetch_add(micros, Ordering::Relaxed);
        self.max_micros.fetch_max(micros, Ordering::Relaxed);
        if !success {
            self.failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let resolutions = self.resolutions.load(Ordering::Relaxed);
        let cache_hits = self.cache_hits.load(Ordering::Relaxed);
        let cache_misses = self.cache_misses.load(Ordering::Relaxed);
        let failures = self.failures.load(Ordering::Relaxed);
        let total_micros = self.total_micros.load(Ordering::Relaxed);

        let lookups = cache_hits + cache_misses;
        MetricsSnapshot {
            resolutions,
            cache_hits,
            cache_misses,
            failures,
            cache_hit_rate: ratio(cache_hits, lookups),
            failure_rate: ratio(failures, resolutions),
            avg_resolution_ms: if resolutions == 0 {
                0.0
            } else {
                total_micros as f64 / resolutions as f64 / 1000.0
            },
            max_resolution_ms: self.max_micros.load(Ordering::Relaxed) as f64 / 1000.0,
        }
    }
}

fn ratio(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64
    }
}

/// Point-in-time view of [`ResolverMetrics`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub resolutions: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub failures: u64,
    pub cache_hit_rate: f64,
    pub failure_rate: f64,
    pub avg_resolution_ms: f64,
    pub max_resolution_ms: f64,
}

impl MetricsSnapshot {
    /// Whether averages are within the service targets.
    pub fn meets_targets(&self, targets: &PerformanceTargets) -> bool {
        self.avg_resolution_ms <= targets.max_resolution_ms
            && self.cache_hit_rate >= targets.min_cache_hit_rate
            && self.failure_rate <= targets.max_failure_rate
    }
}
