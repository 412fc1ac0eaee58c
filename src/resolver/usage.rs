//! In-flight load and performance learning for providers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;

use crate::capabilities::{ProviderRecord, ProviderStatus};
use crate::config::{ScoringConfig, StoreConfig};
use crate::errors::{ProviderError, StoreError};
use crate::store::{self, MetadataStore, ProviderSample};

/// Smoothing factor for the performance moving average.
pub const PERFORMANCE_ALPHA: f64 = 0.1;
/// Consecutive failures after which an active provider is degraded.
pub const DEGRADE_AFTER_FAILURES: u32 = 5;

/// Counts in-flight invocations per provider.
#[derive(Debug, Default)]
pub struct LoadTracker {
    in_flight: DashMap<String, Arc<AtomicU32>>,
}

impl LoadTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one invocation until the guard drops.
    pub fn acquire(&self, provider_id: &str) -> UsageGuard {
        let counter = self
            .in_flight
            .entry(provider_id.to_string())
            .or_default()
            .clone();
        counter.fetch_add(1, Ordering::SeqCst);
        UsageGuard { counter }
    }

    pub fn in_flight(&self, provider_id: &str) -> u32 {
        self.in_flight
            .get(provider_id)
            .map_or(0, |c| c.load(Ordering::SeqCst))
    }

    /// Non-zero counters only.
    pub fn snapshot(&self) -> HashMap<String, u32> {
        self.in_flight
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().load(Ordering::SeqCst)))
            .filter(|(_, n)| *n > 0)
            .collect()
    }
}

/// Releases one in-flight slot on drop.
#[derive(Debug)]
pub struct UsageGuard {
    counter: Arc<AtomicU32>,
}

impl Drop for UsageGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

/// How a provider invocation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvocationOutcome {
    Succeeded,
    /// The provider refused the input; it was reachable and working.
    Rejected,
    /// The provider failed or could not be reached.
    Failed,
}

impl InvocationOutcome {
    pub fn of<T>(result: &Result<T, ProviderError>) -> Self {
        match result {
            Ok(_) => InvocationOutcome::Succeeded,
            Err(ProviderError::InvalidInput(_)) => InvocationOutcome::Rejected,
            Err(ProviderError::ExecutionFailed(_)) | Err(ProviderError::MissingHandle(_)) => {
                InvocationOutcome::Failed
            }
        }
    }

    pub fn succeeded(self) -> bool {
        self == InvocationOutcome::Succeeded
    }

    /// Whether the sample counts towards uptime.
    pub fn available(self) -> bool {
        self != InvocationOutcome::Failed
    }
}

/// Result of folding one invocation into a provider's record.
#[derive(Debug, Clone)]
pub struct PerformanceUpdate {
    pub record: ProviderRecord,
    /// The provider went from active to degraded on this update.
    pub newly_degraded: bool,
}

/// Records samples and keeps `performance_score` current.
pub struct PerformanceTracker {
    store: Arc<dyn MetadataStore>,
    store_config: StoreConfig,
    target_response_ms: f64,
    failures: DashMap<(String, String), u32>,
}

impl PerformanceTracker {
    pub fn new(store: Arc<dyn MetadataStore>, scoring: &ScoringConfig, store_config: StoreConfig) -> Self {
        Self {
            store,
            store_config,
            target_response_ms: scoring.target_response_ms,
            failures: DashMap::new(),
        }
    }

    /// Consecutive failures seen in-process for a provider.
    pub fn consecutive_failures(&self, capability: &str, provider_id: &str) -> u32 {
        self.failures
            .get(&(capability.to_string(), provider_id.to_string()))
            .map_or(0, |n| *n)
    }

    /// Append a sample and fold it into the stored record.
    ///
    /// Failed invocations count against uptime and towards degradation;
    /// rejected input does neither and leaves the moving average alone.
    /// Returns `None` when the provider is no longer in the store.
    pub async fn record(
        &self,
        capability: &str,
        provider_id: &str,
        latency_ms: f64,
        outcome: InvocationOutcome,
    ) -> Result<Option<PerformanceUpdate>, StoreError> {
        let sample = ProviderSample {
            available: outcome.available(),
            ..ProviderSample::now(latency_ms, outcome.succeeded())
        };
        store::bounded(
            &self.store_config,
            "record_provider_sample",
            self.store.record_provider_sample(capability, provider_id, &sample),
        )
        .await?;

        let failures = {
            let mut count = self
                .failures
                .entry((capability.to_string(), provider_id.to_string()))
                .or_insert(0);
            *count = match outcome {
                InvocationOutcome::Succeeded => 0,
                InvocationOutcome::Rejected => *count,
                InvocationOutcome::Failed => *count + 1,
            };
            *count
        };

        let existing = store::bounded(
            &self.store_config,
            "get_provider",
            self.store.get_provider(capability, provider_id),
        )
        .await?;
        let Some(mut record) = existing else {
            return Ok(None);
        };

        let observed = match outcome {
            InvocationOutcome::Succeeded => {
                Some((1.0 - latency_ms / self.target_response_ms).clamp(0.0, 1.0))
            }
            InvocationOutcome::Rejected => None,
            InvocationOutcome::Failed => Some(0.0),
        };
        if let Some(observed) = observed {
            record.performance_score = (PERFORMANCE_ALPHA * observed
                + (1.0 - PERFORMANCE_ALPHA) * record.performance_score)
                .clamp(0.0, 1.0);
        }

        let newly_degraded =
            failures >= DEGRADE_AFTER_FAILURES && record.status == ProviderStatus::Active;
        if newly_degraded {
            record.status = ProviderStatus::Degraded;
            log::warn!(
                "Provider {} for {} degraded after {} consecutive failures",
                provider_id,
                capability,
                failures
            );
        }
        record.updated_at = Utc::now();

        store::bounded(
            &self.store_config,
            "upsert_provider",
            self.store.upsert_provider(&record),
        )
        .await?;

        Ok(Some(PerformanceUpdate {
            record,
            newly_degraded,
        }))
    }
}
