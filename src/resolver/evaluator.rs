//! Provider evaluator: weighted multi-factor scoring of candidates.
//!
//! Each candidate gets four independent sub-scores in [0,1]:
//!
//! | factor        | source                                                     |
//! |---------------|------------------------------------------------------------|
//! | performance   | windowed latency, success rate and throughput; else record |
//! | compatibility | interface overlap with the request plus allow-list match   |
//! | stability     | windowed uptime (or record rating), floored below minimum  |
//! | load          | free share of the provider's concurrency ceiling           |
//!
//! The composite is the weighted sum of the four. Evaluation is a pure
//! function of the candidates, the request and the statistics the caller
//! fetched beforehand.

use std::cmp::Ordering;
use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::capabilities::{CapabilityRequest, ProviderRecord};
use crate::config::ScoringConfig;
use crate::store::ProviderStats;

const INTERFACE_SHARE: f64 = 0.7;
const CONSUMER_SHARE: f64 = 0.3;
const FAILURE_PENALTY: f64 = 0.05;
const MAX_FAILURE_PENALTY: f64 = 0.5;

/// A provider with its sub-scores and composite score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredCandidate {
    pub provider: ProviderRecord,
    pub performance_score: f64,
    pub compatibility_score: f64,
    pub stability_score: f64,
    pub load_score: f64,
    pub composite_score: f64,
}

/// Data fetched by the caller before evaluation.
#[derive(Debug, Clone, Default)]
pub struct EvaluationContext {
    /// Windowed statistics keyed by provider id.
    pub stats: HashMap<String, ProviderStats>,
    /// Current in-flight invocations keyed by provider id.
    pub in_flight: HashMap<String, u32>,
    pub load_balancing: bool,
}

/// Scores candidates against a request.
#[derive(Debug, Clone)]
pub struct ProviderEvaluator {
    config: ScoringConfig,
}

impl ProviderEvaluator {
    pub fn new(config: ScoringConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ScoringConfig {
        &self.config
    }

    /// Score and rank `candidates`, best first.
    ///
    /// Ties on composite score go to the higher stability score, then to the
    /// lexicographically smaller primary file, then to the smaller id.
    pub fn evaluate(
        &self,
        candidates: &[ProviderRecord],
        request: &CapabilityRequest,
        context: &EvaluationContext,
    ) -> Vec<ScoredCandidate> {
        let mut scored: Vec<ScoredCandidate> = candidates
            .iter()
            .map(|provider| self.score(provider, request, context))
            .collect();
        scored.sort_by(rank_order);
        scored
    }

    fn score(
        &self,
        provider: &ProviderRecord,
        request: &CapabilityRequest,
        context: &EvaluationContext,
    ) -> ScoredCandidate {
        let stats = context.stats.get(&provider.id).filter(|s| s.sample_count > 0);

        let performance_score = clamp01(self.performance(provider, stats));
        let compatibility_score = clamp01(compatibility(provider, request));
        let stability_score = clamp01(self.stability(provider, stats));
        let load_score = if context.load_balancing {
            clamp01(self.load(provider, context.in_flight.get(&provider.id).copied().unwrap_or(0)))
        } else {
            1.0
        };

        let w = &self.config.weights;
        let composite_score = clamp01(
            w.performance * performance_score
                + w.compatibility * compatibility_score
                + w.stability * stability_score
                + w.load * load_score,
        );

        ScoredCandidate {
            provider: provider.clone(),
            performance_score,
            compatibility_score,
            stability_score,
            load_score,
            composite_score,
        }
    }

    fn performance(&self, provider: &ProviderRecord, stats: Option<&ProviderStats>) -> f64 {
        match stats {
            Some(stats) => {
                let latency = clamp01(1.0 - stats.avg_latency_ms / self.config.target_response_ms);
                let throughput =
                    clamp01(stats.throughput_per_min / self.config.target_throughput_per_min);
                0.4 * latency + 0.4 * clamp01(stats.success_rate) + 0.2 * throughput
            }
            None => provider.performance_score,
        }
    }

    fn stability(&self, provider: &ProviderRecord, stats: Option<&ProviderStats>) -> f64 {
        let (uptime, failures) = match stats {
            Some(stats) => (stats.uptime, stats.consecutive_failures),
            None => (provider.stability_rating, 0),
        };
        let min = self.config.min_uptime;
        let base = if uptime >= min {
            uptime
        } else {
            let floor = min - self.config.uptime_falloff;
            min * clamp01((uptime - floor) / self.config.uptime_falloff)
        };
        let penalty = (failures as f64 * FAILURE_PENALTY).min(MAX_FAILURE_PENALTY);
        base * (1.0 - penalty)
    }

    fn load(&self, provider: &ProviderRecord, in_flight: u32) -> f64 {
        let capacity = provider
            .max_concurrency
            .unwrap_or(self.config.default_capacity)
            .max(1);
        1.0 - in_flight as f64 / capacity as f64
    }
}

fn compatibility(provider: &ProviderRecord, request: &CapabilityRequest) -> f64 {
    let interface = request
        .requirements
        .interface_spec
        .as_ref()
        .map_or(1.0, |required| provider.interface_spec.overlap_with(required));
    let consumer = if provider.admits(&request.consumer) { 1.0 } else { 0.0 };
    INTERFACE_SHARE * interface + CONSUMER_SHARE * consumer
}

fn clamp01(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

/// Best-first ordering used by evaluation and selection.
pub fn rank_order(a: &ScoredCandidate, b: &ScoredCandidate) -> Ordering {
    b.composite_score
        .total_cmp(&a.composite_score)
        .then_with(|| b.stability_score.total_cmp(&a.stability_score))
        .then_with(|| a.provider.primary_file().cmp(b.provider.primary_file()))
        .then_with(|| a.provider.id.cmp(&b.provider.id))
}
