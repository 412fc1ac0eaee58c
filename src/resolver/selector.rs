//! Provider selector: picks one provider from ranked candidates.
//!
//! Three strategies:
//! - `weighted_performance`: best composite score; with load balancing, a
//!   uniform pick among candidates within the near-best tolerance of the max
//! - `round_robin`: per-capability rotation over candidates in id order
//! - `highest_scored`: deterministic top-1
//!
//! The rotation pointer is the only shared mutable state in the resolver.
//! Each capability has its own async mutex; the pointer is written through to
//! the metadata store so rotation survives restarts.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::Mutex as AsyncMutex;

use super::evaluator::{rank_order, ScoredCandidate};
use crate::capabilities::SelectionAlgorithm;
use crate::config::StoreConfig;
use crate::errors::SelectionError;
use crate::store::{self, MetadataStore};

/// Chooses a provider for a capability.
pub struct ProviderSelector {
    rotation: DashMap<String, Arc<AsyncMutex<Option<u64>>>>,
    store: Option<Arc<dyn MetadataStore>>,
    store_config: StoreConfig,
    near_best_tolerance: f64,
    rng: Mutex<StdRng>,
}

impl ProviderSelector {
    /// Selector with process-local rotation only.
    pub fn new(near_best_tolerance: f64) -> Self {
        Self {
            rotation: DashMap::new(),
            store: None,
            store_config: StoreConfig::default(),
            near_best_tolerance: near_best_tolerance.clamp(0.0, 1.0),
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Persist rotation pointers through `store`.
    pub fn with_store(mut self, store: Arc<dyn MetadataStore>, store_config: StoreConfig) -> Self {
        self.store = Some(store);
        self.store_config = store_config;
        self
    }

    /// Fix the random source, for reproducible near-best picks.
    pub fn with_seed(self, seed: u64) -> Self {
        *self.rng.lock() = StdRng::seed_from_u64(seed);
        self
    }

    /// Pick one candidate. Never mutates `scored`.
    pub async fn select(
        &self,
        capability: &str,
        scored: &[ScoredCandidate],
        algorithm: SelectionAlgorithm,
        load_balancing: bool,
    ) -> Result<ScoredCandidate, SelectionError> {
        if scored.is_empty() {
            return Err(SelectionError::NoCandidates {
                capability: capability.to_string(),
            });
        }

        let chosen = match algorithm {
            SelectionAlgorithm::HighestScored => top(scored),
            SelectionAlgorithm::WeightedPerformance if load_balancing => self.near_best(scored),
            SelectionAlgorithm::WeightedPerformance => top(scored),
            SelectionAlgorithm::RoundRobin => self.round_robin(capability, scored).await,
        };

        log::debug!(
            "Selected provider {} for {} via {:?} (score {:.3})",
            chosen.provider.id,
            capability,
            algorithm,
            chosen.composite_score
        );
        Ok(chosen.clone())
    }

    fn near_best<'a>(&self, scored: &'a [ScoredCandidate]) -> &'a ScoredCandidate {
        let max = scored
            .iter()
            .map(|c| c.composite_score)
            .fold(f64::MIN, f64::max);
        let threshold = max * (1.0 - self.near_best_tolerance);
        let mut pool: Vec<&ScoredCandidate> = scored
            .iter()
            .filter(|c| c.composite_score >= threshold)
            .collect();
        pool.sort_by(|a, b| rank_order(a, b));

        let index = self.rng.lock().gen_range(0..pool.len());
        pool[index]
    }

    async fn round_robin<'a>(
        &self,
        capability: &str,
        scored: &'a [ScoredCandidate],
    ) -> &'a ScoredCandidate {
        let mut ordered: Vec<&ScoredCandidate> = scored.iter().collect();
        ordered.sort_by(|a, b| a.provider.id.cmp(&b.provider.id));

        let slot = self
            .rotation
            .entry(capability.to_string())
            .or_default()
            .clone();
        let mut pointer = slot.lock().await;

        let current = match *pointer {
            Some(position) => position,
            None => self.load_pointer(capability).await,
        };
        let next = current.wrapping_add(1);
        *pointer = Some(next);
        self.save_pointer(capability, next).await;

        ordered[(current % ordered.len() as u64) as usize]
    }

    async fn load_pointer(&self, capability: &str) -> u64 {
        let Some(store) = &self.store else {
            return 0;
        };
        match store::bounded(
            &self.store_config,
            "get_rotation_pointer",
            store.get_rotation_pointer(capability),
        )
        .await
        {
            Ok(position) => position.unwrap_or(0),
            Err(e) => {
                log::warn!("Rotation pointer for {} unavailable, starting at 0: {}", capability, e);
                0
            }
        }
    }

    async fn save_pointer(&self, capability: &str, position: u64) {
        let Some(store) = &self.store else {
            return;
        };
        if let Err(e) = store::bounded(
            &self.store_config,
            "set_rotation_pointer",
            store.set_rotation_pointer(capability, position),
        )
        .await
        {
            log::warn!("Rotation pointer for {} not persisted: {}", capability, e);
        }
    }
}

fn top(scored: &[ScoredCandidate]) -> &ScoredCandidate {
    scored
        .iter()
        .min_by(|a, b| rank_order(a, b))
        .unwrap_or(&scored[0])
}
