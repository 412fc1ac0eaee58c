//! Metadata store adapters.
//!
//! The resolver never owns persistence: providers, audit events, rotation
//! pointers and performance samples live behind [`MetadataStore`]. Two
//! backends ship with the crate:
//!
//! - [`InMemoryStore`]: process-local maps, the default and the test double.
//! - [`SqliteStore`]: a single SQLite file, for a durable single-node setup.

pub mod memory;
pub mod sqlite;

use std::collections::HashMap;
use std::future::Future;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::capabilities::{ProviderRecord, ProviderStatus};
use crate::config::StoreConfig;
use crate::errors::StoreError;

pub use memory::InMemoryStore;
pub use sqlite::SqliteStore;

/// Filters applied by the store when querying providers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderFilter {
    /// Minimum recorded `performance_score`.
    pub min_performance: Option<f64>,
    /// Exact status match.
    pub status: Option<ProviderStatus>,
    /// Consumer the allow-list must admit.
    pub compatible_with: Option<String>,
}

impl ProviderFilter {
    /// Active providers only, nothing else constrained.
    pub fn active() -> Self {
        Self {
            status: Some(ProviderStatus::Active),
            ..Default::default()
        }
    }

    pub fn matches(&self, record: &ProviderRecord) -> bool {
        if let Some(status) = self.status {
            if record.status != status {
                return false;
            }
        }
        if let Some(min) = self.min_performance {
            if record.performance_score < min {
                return false;
            }
        }
        if let Some(consumer) = &self.compatible_with {
            if !record.admits(consumer) {
                return false;
            }
        }
        true
    }
}

/// One observed invocation of a provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderSample {
    pub at: DateTime<Utc>,
    pub latency_ms: f64,
    pub success: bool,
    /// False when the provider could not be reached at all.
    pub available: bool,
}

impl ProviderSample {
    pub fn now(latency_ms: f64, success: bool) -> Self {
        Self {
            at: Utc::now(),
            latency_ms,
            success,
            available: true,
        }
    }
}

/// Aggregated samples for one provider over the stats window.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderStats {
    pub sample_count: u64,
    pub avg_latency_ms: f64,
    pub success_rate: f64,
    pub throughput_per_min: f64,
    pub uptime: f64,
    /// Failures at the tail of the sample sequence, most recent last.
    pub consecutive_failures: u32,
}

impl ProviderStats {
    /// Aggregate samples (any order).
    pub fn from_samples(samples: &[ProviderSample]) -> Self {
        if samples.is_empty() {
            return Self::default();
        }
        let mut ordered: Vec<&ProviderSample> = samples.iter().collect();
        ordered.sort_by_key(|s| s.at);

        let count = ordered.len() as f64;
        let avg_latency_ms = ordered.iter().map(|s| s.latency_ms).sum::<f64>() / count;
        let successes = ordered.iter().filter(|s| s.success).count() as f64;
        let available = ordered.iter().filter(|s| s.available).count() as f64;

        let first = ordered[0].at;
        let last = ordered[ordered.len() - 1].at;
        let span_minutes = ((last - first).num_milliseconds() as f64 / 60_000.0).max(1.0);

        let consecutive_failures = ordered
            .iter()
            .rev()
            .take_while(|s| !s.success)
            .count() as u32;

        Self {
            sample_count: ordered.len() as u64,
            avg_latency_ms,
            success_rate: successes / count,
            throughput_per_min: count / span_minutes,
            uptime: available / count,
            consecutive_failures,
        }
    }
}

/// Audit row written by the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: String,
    pub kind: String,
    pub payload: Value,
    pub recorded_at: DateTime<Utc>,
}

/// Key-value/relational store the resolver reads providers from and writes
/// audit and learning data to.
///
/// Implementations must be safe to call concurrently. Every call may block on
/// I/O; the resolver wraps each one in a timeout.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Providers registered for `capability` that pass `filter`, ordered by id.
    async fn query_providers(
        &self,
        capability: &str,
        filter: &ProviderFilter,
    ) -> Result<Vec<ProviderRecord>, StoreError>;

    /// Fetch a single provider regardless of status.
    async fn get_provider(
        &self,
        capability: &str,
        provider_id: &str,
    ) -> Result<Option<ProviderRecord>, StoreError>;

    /// Insert or replace a provider keyed by `(capability_name, id)`.
    async fn upsert_provider(&self, record: &ProviderRecord) -> Result<(), StoreError>;

    /// Whether any provider, in any status, was ever registered for `capability`.
    async fn capability_known(&self, capability: &str) -> Result<bool, StoreError>;

    /// Append an audit event.
    async fn record_audit_event(&self, kind: &str, payload: &Value) -> Result<(), StoreError>;

    async fn get_rotation_pointer(&self, capability: &str) -> Result<Option<u64>, StoreError>;

    async fn set_rotation_pointer(&self, capability: &str, index: u64) -> Result<(), StoreError>;

    /// Append a performance sample for a provider.
    async fn record_provider_sample(
        &self,
        capability: &str,
        provider_id: &str,
        sample: &ProviderSample,
    ) -> Result<(), StoreError>;

    /// Aggregated samples since `since`, keyed by provider id.
    async fn provider_stats(
        &self,
        capability: &str,
        since: DateTime<Utc>,
    ) -> Result<HashMap<String, ProviderStats>, StoreError>;
}

/// Run a store call under the configured hard timeout.
///
/// Calls slower than the latency target are logged; calls past the hard cap
/// fail with [`StoreError::Timeout`].
pub async fn bounded<T, F>(config: &StoreConfig, operation: &str, call: F) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    let started = Instant::now();
    let outcome = tokio::time::timeout(config.timeout(), call).await;
    let elapsed = started.elapsed();
    if elapsed.as_millis() as u64 > config.target_latency_ms {
        log::debug!(
            "Store call {} took {}ms (target {}ms)",
            operation,
            elapsed.as_millis(),
            config.target_latency_ms
        );
    }
    match outcome {
        Ok(result) => result,
        Err(_) => {
            log::warn!("Store call {} timed out after {}ms", operation, config.timeout_ms);
            Err(StoreError::Timeout {
                operation: operation.to_string(),
                timeout_ms: config.timeout_ms,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_filter_matches() {
        let record = ProviderRecord::new("p1", "send_message")
            .with_scores(0.7, 0.9)
            .with_compatible(vec!["support_*".into()]);

        assert!(ProviderFilter::active().matches(&record));
        let strict = ProviderFilter {
            min_performance: Some(0.8),
            ..ProviderFilter::active()
        };
        assert!(!strict.matches(&record));
        let wrong_consumer = ProviderFilter {
            compatible_with: Some("sales".into()),
            ..Default::default()
        };
        assert!(!wrong_consumer.matches(&record));
    }

    #[test]
    fn test_stats_from_samples() {
        let start = Utc::now() - Duration::minutes(10);
        let samples: Vec<ProviderSample> = (0..10)
            .map(|i| ProviderSample {
                at: start + Duration::minutes(i),
                latency_ms: 100.0,
                success: i < 8,
                available: true,
            })
            .collect();

        let stats = ProviderStats::from_samples(&samples);
        assert_eq!(stats.sample_count, 10);
        assert!((stats.avg_latency_ms - 100.0).abs() < 1e-9);
        assert!((stats.success_rate - 0.8).abs() < 1e-9);
        assert_eq!(stats.consecutive_failures, 2);
        assert!((stats.throughput_per_min - 10.0 / 9.0).abs() < 1e-6);
        assert_eq!(stats.uptime, 1.0);
    }

    #[tokio::test]
    async fn test_bounded_times_out() {
        let config = StoreConfig {
            timeout_ms: 10,
            ..Default::default()
        };
        let result: Result<(), StoreError> = bounded(&config, "slow_call", async {
            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
            Ok(())
        })
        .await;
        assert!(matches!(result, Err(StoreError::Timeout { .. })));

        let fast = bounded(&config, "fast_call", async { Ok::<_, StoreError>(7) }).await;
        assert_eq!(fast.unwrap(), 7);
    }

    #[test]
    fn test_stats_empty() {
        assert_eq!(ProviderStats::from_samples(&[]), ProviderStats::default());
    }
}
