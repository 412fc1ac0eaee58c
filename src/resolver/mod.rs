//! Capability resolver, the public entry point.
//!
//! Sequences one resolution through its states:
//!
//! ```text
//! RECEIVED → CACHE_CHECK ─ hit ─────────────────────────────────────────→ DONE
//!                        └ miss → REGISTRY_QUERY ─ empty → GAP_HANDLING ─→ FAILED
//!                                      │                        │
//!                                      └──── providers ←────────┘ (relaxed / alternative)
//!                                               ↓
//!                         EVALUATE → SELECT → CYCLE_CHECK → BIND → CACHE_WRITE → DONE
//! ```
//!
//! `file_resolution_*` requests take a separate path that looks up a file
//! location and caches it in its own namespace.

pub mod binding;
pub mod cache;
pub mod cycles;
pub mod evaluator;
pub mod file_path;
pub mod gap;
pub mod selector;
pub mod usage;

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::capabilities::{
    CapabilityProvider, CapabilityRegistry, CapabilityRequest, InterfaceSpec, ProviderRecord,
};
use crate::config::ResolverConfig;
use crate::errors::{ConfigError, ErrorKind, ProviderError, ResolutionError, StoreError};
use crate::generation::{AutoGenerator, NullGenerator};
use crate::store::{self, MetadataStore, ProviderFilter};
use crate::telemetry::{MetricsSnapshot, ResolverMetrics};

pub use binding::{Binding, BindingManager, BindingMode, BindingMonitor, LogMonitor, MonitoringInfo};
pub use cache::{CacheNamespace, CacheStats, ResolutionCache};
pub use cycles::{CircularDependencyDetector, CycleReport, CycleStrategy, DependencyGraph};
pub use evaluator::{EvaluationContext, ProviderEvaluator, ScoredCandidate};
pub use file_path::{FilePathResolver, FileResolution, FileSource};
pub use gap::{Escalation, EscalationNotifier, GapDecision, GapHandler, LogNotifier};
pub use selector::ProviderSelector;
pub use usage::{InvocationOutcome, LoadTracker, PerformanceTracker, UsageGuard};

/// Cooperative cancellation flag shared between a caller and a resolution.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Fail with [`ResolutionError::Cancelled`] once cancelled.
    pub fn check(&self, stage: &str) -> Result<(), ResolutionError> {
        if self.is_cancelled() {
            Err(ResolutionError::Cancelled {
                stage: stage.to_string(),
            })
        } else {
            Ok(())
        }
    }
}

/// States a resolution passes through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResolutionState {
    Received,
    CacheCheck,
    RegistryQuery,
    GapHandling,
    Evaluate,
    Select,
    CycleCheck,
    Bind,
    CacheWrite,
    Done,
    Failed,
}

impl ResolutionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResolutionState::Received => "RECEIVED",
            ResolutionState::CacheCheck => "CACHE_CHECK",
            ResolutionState::RegistryQuery => "REGISTRY_QUERY",
            ResolutionState::GapHandling => "GAP_HANDLING",
            ResolutionState::Evaluate => "EVALUATE",
            ResolutionState::Select => "SELECT",
            ResolutionState::CycleCheck => "CYCLE_CHECK",
            ResolutionState::Bind => "BIND",
            ResolutionState::CacheWrite => "CACHE_WRITE",
            ResolutionState::Done => "DONE",
            ResolutionState::Failed => "FAILED",
        }
    }
}

/// Non-fatal problem attached to a successful resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolutionWarning {
    pub kind: ErrorKind,
    pub message: String,
}

/// Successful resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedCapability {
    pub provider: String,
    pub provider_files: Vec<String>,
    pub interface: InterfaceSpec,
    pub binding_id: String,
    pub cached: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub composite_score: Option<f64>,
    /// Substitute capability the binding was made against.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub via_alternative: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cycle_strategy: Option<CycleStrategy>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<ResolutionWarning>,
    pub binding: Binding,
}

impl ResolvedCapability {
    fn from_binding(binding: Binding, cached: bool) -> Self {
        Self {
            provider: binding.provider.clone(),
            provider_files: binding.provider_files.clone(),
            interface: binding.interface.clone(),
            binding_id: binding.id.clone(),
            cached,
            composite_score: None,
            via_alternative: None,
            cycle_strategy: None,
            warnings: Vec::new(),
            binding,
        }
    }
}

/// Failed resolution. `fallback_required` tells the caller to degrade
/// gracefully instead of aborting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolutionFailure {
    pub error: ErrorKind,
    pub message: String,
    pub fallback_required: bool,
    /// Present when the capability is known but has no active provider right now.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
    #[serde(default)]
    pub generation_requested: bool,
    /// Expired binding for the same key, usable as a last resort.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stale_binding: Option<Binding>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cycle: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
}

/// Outcome of [`CapabilityResolver::resolve_capability`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ResolutionResult {
    Resolved(ResolvedCapability),
    Failed(ResolutionFailure),
}

impl ResolutionResult {
    pub fn is_resolved(&self) -> bool {
        matches!(self, ResolutionResult::Resolved(_))
    }

    pub fn resolved(&self) -> Option<&ResolvedCapability> {
        match self {
            ResolutionResult::Resolved(r) => Some(r),
            ResolutionResult::Failed(_) => None,
        }
    }

    pub fn failure(&self) -> Option<&ResolutionFailure> {
        match self {
            ResolutionResult::Resolved(_) => None,
            ResolutionResult::Failed(f) => Some(f),
        }
    }
}

/// Result of [`CapabilityResolver::register_capability`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationOutcome {
    pub registered: bool,
    pub capability: String,
}

/// Builder for [`CapabilityResolver`].
pub struct CapabilityResolverBuilder {
    config: ResolverConfig,
    store: Arc<dyn MetadataStore>,
    registry: CapabilityRegistry,
    monitor: Arc<dyn BindingMonitor>,
    generator: Arc<dyn AutoGenerator>,
    notifier: Arc<dyn EscalationNotifier>,
    selection_seed: Option<u64>,
}

impl CapabilityResolverBuilder {
    pub fn config(mut self, config: ResolverConfig) -> Self {
        self.config = config;
        self
    }

    pub fn registry(mut self, registry: CapabilityRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn monitor(mut self, monitor: Arc<dyn BindingMonitor>) -> Self {
        self.monitor = monitor;
        self
    }

    pub fn generator(mut self, generator: Arc<dyn AutoGenerator>) -> Self {
        self.generator = generator;
        self
    }

    pub fn notifier(mut self, notifier: Arc<dyn EscalationNotifier>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Seed near-best selection, for reproducible runs.
    pub fn selection_seed(mut self, seed: u64) -> Self {
        self.selection_seed = Some(seed);
        self
    }

    pub fn build(self) -> Result<CapabilityResolver, ConfigError> {
        let config = self.config;
        config.validate()?;

        let store = self.store;
        let registry = Arc::new(RwLock::new(self.registry));

        let mut selector = ProviderSelector::new(config.selection.near_best_tolerance)
            .with_store(store.clone(), config.store.clone());
        if let Some(seed) = self.selection_seed {
            selector = selector.with_seed(seed);
        }

        Ok(CapabilityResolver {
            cache: ResolutionCache::new(config.cache.max_size),
            evaluator: ProviderEvaluator::new(config.scoring.clone()),
            selector,
            bindings: BindingManager::new(
                store.clone(),
                self.monitor,
                config.monitoring.clone(),
                config.store.clone(),
            ),
            detector: CircularDependencyDetector::new(config.cycles.clone()),
            gap: GapHandler::new(
                store.clone(),
                registry.clone(),
                self.generator,
                self.notifier,
                config.gap.clone(),
                config.store.clone(),
            ),
            files: FilePathResolver::new(
                config.file_paths.clone(),
                store.clone(),
                config.store.clone(),
            ),
            load: LoadTracker::new(),
            performance: PerformanceTracker::new(
                store.clone(),
                &config.scoring,
                config.store.clone(),
            ),
            metrics: ResolverMetrics::new(),
            attached: DashMap::new(),
            store,
            registry,
            config,
        })
    }
}

/// Resolves capability requests to bindings.
pub struct CapabilityResolver {
    config: ResolverConfig,
    store: Arc<dyn MetadataStore>,
    registry: Arc<RwLock<CapabilityRegistry>>,
    cache: ResolutionCache,
    evaluator: ProviderEvaluator,
    selector: ProviderSelector,
    bindings: BindingManager,
    detector: CircularDependencyDetector,
    gap: GapHandler,
    files: FilePathResolver,
    load: LoadTracker,
    performance: PerformanceTracker,
    metrics: ResolverMetrics,
    /// Deferred bindings whose handle has been attached.
    attached: DashMap<String, ()>,
}

impl CapabilityResolver {
    pub fn builder(store: Arc<dyn MetadataStore>) -> CapabilityResolverBuilder {
        CapabilityResolverBuilder {
            config: ResolverConfig::default(),
            store,
            registry: CapabilityRegistry::new(),
            monitor: Arc::new(LogMonitor),
            generator: Arc::new(NullGenerator),
            notifier: Arc::new(LogNotifier),
            selection_seed: None,
        }
    }

    /// Resolver with default collaborators.
    pub fn new(config: ResolverConfig, store: Arc<dyn MetadataStore>) -> Result<Self, ConfigError> {
        Self::builder(store).config(config).build()
    }

    pub fn config(&self) -> &ResolverConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn MetadataStore> {
        &self.store
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    // ------------------------------------------------------------------
    // Resolution
    // ------------------------------------------------------------------

    /// Resolve a capability for a consumer.
    pub async fn resolve_capability(&self, request: &CapabilityRequest) -> ResolutionResult {
        self.resolve_with_cancel(request, &CancelToken::new()).await
    }

    /// Resolve, stopping early once `cancel` fires.
    ///
    /// A binding already persisted when cancellation is noticed is not rolled
    /// back.
    pub async fn resolve_with_cancel(
        &self,
        request: &CapabilityRequest,
        cancel: &CancelToken,
    ) -> ResolutionResult {
        let started = Instant::now();
        let outcome = self.run(request, cancel).await;
        self.metrics
            .record_resolution(started.elapsed(), outcome.is_ok());

        match outcome {
            Ok(resolved) => {
                self.transition(request, ResolutionState::Done);
                ResolutionResult::Resolved(resolved)
            }
            Err(failure) => {
                self.transition(request, ResolutionState::Failed);
                ResolutionResult::Failed(failure)
            }
        }
    }

    async fn run(
        &self,
        request: &CapabilityRequest,
        cancel: &CancelToken,
    ) -> Result<ResolvedCapability, ResolutionFailure> {
        self.step(request, ResolutionState::Received, cancel)?;
        request.validate().map_err(|e| self.fail(request, e))?;

        if request.is_file_resolution() {
            return self.resolve_file(request, cancel).await;
        }

        self.step(request, ResolutionState::CacheCheck, cancel)?;
        if let Some(binding) = self.cache.get(
            CacheNamespace::Capability,
            &request.capability,
            &request.consumer,
        ) {
            self.metrics.record_cache_hit();
            return Ok(ResolvedCapability::from_binding(binding, true));
        }
        self.metrics.record_cache_miss();

        self.step(request, ResolutionState::RegistryQuery, cancel)?;
        let (capability, providers, via_alternative) = match self.query_providers(request).await {
            Ok(found) if !found.is_empty() => (request.capability.clone(), found, None),
            Ok(_) => {
                self.step(request, ResolutionState::GapHandling, cancel)?;
                self.fill_gap(request).await?
            }
            Err(e) => {
                self.step(request, ResolutionState::GapHandling, cancel)?;
                let found = self.gap.relaxed_retry(request).await;
                if found.is_empty() {
                    return Err(self.fail(request, e.into()));
                }
                (request.capability.clone(), found, None)
            }
        };

        self.step(request, ResolutionState::Evaluate, cancel)?;
        let load_balancing = request
            .requirements
            .load_balancing
            .unwrap_or(self.config.selection.load_balancing);
        let context = self.evaluation_context(&capability, load_balancing).await;
        let scored = self.evaluator.evaluate(&providers, request, &context);

        self.step(request, ResolutionState::Select, cancel)?;
        let algorithm = request
            .requirements
            .algorithm
            .unwrap_or(self.config.selection.default_algorithm);
        let selected = self
            .selector
            .select(&capability, &scored, algorithm, load_balancing)
            .await
            .map_err(|e| self.fail(request, e.into()))?;

        self.step(request, ResolutionState::CycleCheck, cancel)?;
        let (selected, mode, cycle_strategy) = self
            .check_cycles(request, &capability, selected, &scored)
            .await
            .map_err(|e| self.fail(request, e))?;

        self.step(request, ResolutionState::Bind, cancel)?;
        let outcome = self
            .bindings
            .create_binding(
                &request.consumer,
                &selected.provider,
                &capability,
                request.requirements.interface_spec.as_ref(),
                mode,
                cancel,
            )
            .await
            .map_err(|e| self.fail(request, e))?;

        self.transition(request, ResolutionState::CacheWrite);
        self.cache.put(
            CacheNamespace::Capability,
            &request.capability,
            &request.consumer,
            outcome.binding.clone(),
            Duration::from_millis(self.config.cache.capability_ttl_ms),
        );

        let mut resolved = ResolvedCapability::from_binding(outcome.binding, false);
        resolved.composite_score = Some(selected.composite_score);
        resolved.via_alternative = via_alternative;
        resolved.cycle_strategy = cycle_strategy;
        if let Some(message) = outcome.persistence_warning {
            resolved.warnings.push(ResolutionWarning {
                kind: ErrorKind::StorePersistenceWarning,
                message,
            });
        }
        Ok(resolved)
    }

    async fn resolve_file(
        &self,
        request: &CapabilityRequest,
        cancel: &CancelToken,
    ) -> Result<ResolvedCapability, ResolutionFailure> {
        self.step(request, ResolutionState::CacheCheck, cancel)?;
        if let Some(binding) =
            self.cache
                .get(CacheNamespace::FilePath, &request.capability, &request.consumer)
        {
            self.metrics.record_cache_hit();
            return Ok(ResolvedCapability::from_binding(binding, true));
        }
        self.metrics.record_cache_miss();

        self.step(request, ResolutionState::RegistryQuery, cancel)?;
        let found = self
            .files
            .resolve(request)
            .await
            .map_err(|e| self.fail(request, e))?;

        self.step(request, ResolutionState::Bind, cancel)?;
        let provider = found.as_provider(&request.capability);
        let outcome = self
            .bindings
            .create_binding(
                &request.consumer,
                &provider,
                &request.capability,
                None,
                BindingMode::Eager,
                cancel,
            )
            .await
            .map_err(|e| self.fail(request, e))?;

        self.transition(request, ResolutionState::CacheWrite);
        self.cache.put(
            CacheNamespace::FilePath,
            &request.capability,
            &request.consumer,
            outcome.binding.clone(),
            Duration::from_millis(self.config.cache.file_path_ttl_ms),
        );

        let mut resolved = ResolvedCapability::from_binding(outcome.binding, false);
        if let Some(message) = outcome.persistence_warning {
            resolved.warnings.push(ResolutionWarning {
                kind: ErrorKind::StorePersistenceWarning,
                message,
            });
        }
        Ok(resolved)
    }

    /// Active providers for the request; a timed-out query is retried once.
    async fn query_providers(
        &self,
        request: &CapabilityRequest,
    ) -> Result<Vec<ProviderRecord>, StoreError> {
        let filter = ProviderFilter {
            min_performance: request.requirements.min_performance,
            compatible_with: Some(request.consumer.clone()),
            ..ProviderFilter::active()
        };
        let first = store::bounded(
            &self.config.store,
            "query_providers",
            self.store.query_providers(&request.capability, &filter),
        )
        .await;

        match first {
            Err(StoreError::Timeout { .. }) => {
                log::warn!(
                    "Provider query for {} timed out, retrying in {}ms",
                    request.capability,
                    self.config.store.retry_backoff_ms
                );
                tokio::time::sleep(self.config.store.backoff()).await;
                store::bounded(
                    &self.config.store,
                    "query_providers",
                    self.store.query_providers(&request.capability, &filter),
                )
                .await
            }
            other => other,
        }
    }

    async fn fill_gap(
        &self,
        request: &CapabilityRequest,
    ) -> Result<(String, Vec<ProviderRecord>, Option<String>), ResolutionFailure> {
        let no_providers = || ResolutionError::NoProvidersAvailable {
            capability: request.capability.clone(),
        };
        match self.gap.handle_no_providers(request).await {
            GapDecision::Relaxed(found) => Ok((request.capability.clone(), found, None)),
            GapDecision::Alternative {
                capability,
                providers,
            } => Ok((capability.clone(), providers, Some(capability))),
            GapDecision::RetryLater { retry_after_ms } => {
                let mut failure = self.fail(request, no_providers());
                failure.retry_after_ms = Some(retry_after_ms);
                Err(failure)
            }
            GapDecision::GenerationRequested => {
                let mut failure = self.fail(request, no_providers());
                failure.generation_requested = true;
                Err(failure)
            }
            GapDecision::Escalated => Err(self.fail(request, no_providers())),
        }
    }

    /// Windowed stats and live load. Stats failures fall back to record values.
    async fn evaluation_context(&self, capability: &str, load_balancing: bool) -> EvaluationContext {
        let since = Utc::now() - chrono::Duration::days(self.config.scoring.stats_window_days);
        let stats = match store::bounded(
            &self.config.store,
            "provider_stats",
            self.store.provider_stats(capability, since),
        )
        .await
        {
            Ok(stats) => stats,
            Err(e) => {
                log::warn!("Stats for {} unavailable, scoring from records: {}", capability, e);
                HashMap::new()
            }
        };
        EvaluationContext {
            stats,
            in_flight: self.load.snapshot(),
            load_balancing,
        }
    }

    async fn check_cycles(
        &self,
        request: &CapabilityRequest,
        capability: &str,
        selected: ScoredCandidate,
        scored: &[ScoredCandidate],
    ) -> Result<(ScoredCandidate, BindingMode, Option<CycleStrategy>), ResolutionError> {
        let mut chain = request.requirements.resolution_chain.clone();
        chain.push(capability.to_string());

        let graph = self.dependency_graph(capability, &selected.provider).await;
        let report = self.detector.detect(&request.consumer, &chain, &graph);
        let Some(cycle) = report.primary().cloned() else {
            return Ok((selected, BindingMode::Eager, None));
        };
        log::warn!(
            "Dependency cycle for {} via {}: {}",
            capability,
            selected.provider.id,
            cycle.join(" -> ")
        );

        if let Some((strategy, mode)) = self.detector.binding_strategy(request) {
            log::info!("Breaking cycle for {} with {:?}", capability, strategy);
            return Ok((selected, mode, Some(strategy)));
        }

        if self.detector.reorganization_enabled() {
            for alternate in scored.iter().filter(|c| {
                c.provider.id != selected.provider.id && c.provider.interface_spec.requires.is_empty()
            }) {
                let graph = self.dependency_graph(capability, &alternate.provider).await;
                if !self.detector.detect(&request.consumer, &chain, &graph).found {
                    log::info!(
                        "Breaking cycle for {} by switching to provider {}",
                        capability,
                        alternate.provider.id
                    );
                    return Ok((
                        alternate.clone(),
                        BindingMode::Eager,
                        Some(CycleStrategy::ProviderReorganization),
                    ));
                }
            }
        }

        let suggestion = self.detector.split_suggestion(&cycle);
        Err(ResolutionError::CircularDependency { cycle, suggestion })
    }

    /// Dependencies reachable from `capability` when bound to `provider`,
    /// expanded breadth-first up to the configured depth.
    async fn dependency_graph(&self, capability: &str, provider: &ProviderRecord) -> DependencyGraph {
        let mut graph = DependencyGraph::new();
        let mut direct: Vec<String> = provider.interface_spec.requires.clone();
        direct.extend(self.registry.read().depends_on(capability));
        for dependency in &direct {
            graph.add_edge(capability, dependency.clone());
        }

        let mut visited: HashSet<String> = HashSet::from([capability.to_string()]);
        let mut frontier = direct;
        for _ in 0..self.detector.max_depth() {
            let next: Vec<String> = frontier
                .into_iter()
                .filter(|c| visited.insert(c.clone()))
                .collect();
            if next.is_empty() {
                break;
            }
            let lookups = join_all(next.iter().map(|c| self.direct_dependencies(c))).await;
            frontier = Vec::new();
            for (from, dependencies) in next.iter().zip(lookups) {
                for dependency in dependencies {
                    graph.add_edge(from.clone(), dependency.clone());
                    frontier.push(dependency);
                }
            }
        }
        log::debug!(
            "Dependency graph for {} via {}: {} edge(s)",
            capability,
            provider.id,
            graph.edge_count()
        );
        graph
    }

    /// Everything any active provider of `capability` requires, plus its
    /// definition's `depends_on`.
    async fn direct_dependencies(&self, capability: &str) -> Vec<String> {
        let mut dependencies = self.registry.read().depends_on(capability);
        match store::bounded(
            &self.config.store,
            "query_providers",
            self.store
                .query_providers(capability, &ProviderFilter::active()),
        )
        .await
        {
            Ok(providers) => {
                for provider in providers {
                    dependencies.extend(provider.interface_spec.requires);
                }
            }
            Err(e) => log::warn!("Dependencies of {} unavailable: {}", capability, e),
        }
        dependencies.sort();
        dependencies.dedup();
        dependencies
    }

    fn transition(&self, request: &CapabilityRequest, state: ResolutionState) {
        log::debug!(
            "Resolution {}/{} -> {}",
            request.capability,
            request.consumer,
            state.as_str()
        );
    }

    fn step(
        &self,
        request: &CapabilityRequest,
        state: ResolutionState,
        cancel: &CancelToken,
    ) -> Result<(), ResolutionFailure> {
        self.transition(request, state);
        cancel
            .check(state.as_str())
            .map_err(|e| self.fail(request, e))
    }

    /// Structured failure, with an expired binding attached when one exists.
    fn fail(&self, request: &CapabilityRequest, error: ResolutionError) -> ResolutionFailure {
        let namespace = if request.is_file_resolution() {
            CacheNamespace::FilePath
        } else {
            CacheNamespace::Capability
        };
        let stale_binding = if error.fallback_required() {
            self.cache
                .get_stale(namespace, &request.capability, &request.consumer)
        } else {
            None
        };

        match &error {
            ResolutionError::InvalidRequest(_) | ResolutionError::Cancelled { .. } => {
                log::debug!("Resolution of {} failed: {}", request.capability, error)
            }
            _ => log::warn!(
                "Resolution of {} for {} failed: {}",
                request.capability,
                request.consumer,
                error
            ),
        }

        let (cycle, suggestion) = match &error {
            ResolutionError::CircularDependency { cycle, suggestion } => {
                (Some(cycle.clone()), suggestion.clone())
            }
            _ => (None, None),
        };

        ResolutionFailure {
            error: error.kind(),
            message: error.to_string(),
            fallback_required: error.fallback_required(),
            retry_after_ms: None,
            generation_requested: false,
            stale_binding,
            cycle,
            suggestion,
        }
    }

    // ------------------------------------------------------------------
    // Registration
    // ------------------------------------------------------------------

    /// Register `module::function_name` as a provider of the capability named
    /// after the function.
    pub async fn register_capability(
        &self,
        module: &str,
        function_name: &str,
        provider_path: &str,
    ) -> RegistrationOutcome {
        let record = self
            .registry
            .write()
            .register_function(module, function_name, provider_path);
        let Some(record) = record else {
            return RegistrationOutcome {
                registered: false,
                capability: function_name.trim().to_string(),
            };
        };

        match self.upsert_provider(&record).await {
            Ok(()) => {
                log::info!("Registered {} as provider of {}", record.id, record.capability_name);
                RegistrationOutcome {
                    registered: true,
                    capability: record.capability_name,
                }
            }
            Err(e) => {
                log::warn!("Registration of {} not stored: {}", record.id, e);
                RegistrationOutcome {
                    registered: false,
                    capability: record.capability_name,
                }
            }
        }
    }

    /// Store a provider record, optionally with its callable handle.
    pub async fn register_provider(
        &self,
        record: ProviderRecord,
        handle: Option<Arc<dyn CapabilityProvider>>,
    ) -> Result<(), StoreError> {
        if let Some(handle) = handle {
            self.registry.write().register_handle(handle);
        }
        self.upsert_provider(&record).await
    }

    pub fn register_handle(&self, handle: Arc<dyn CapabilityProvider>) {
        self.registry.write().register_handle(handle);
    }

    /// Insert or replace a provider and drop cached bindings for its capability.
    pub async fn upsert_provider(&self, record: &ProviderRecord) -> Result<(), StoreError> {
        store::bounded(
            &self.config.store,
            "upsert_provider",
            self.store.upsert_provider(record),
        )
        .await?;
        let dropped = self.cache.invalidate_capability(&record.capability_name);
        if dropped > 0 {
            log::debug!(
                "Dropped {} cached binding(s) for {}",
                dropped,
                record.capability_name
            );
        }
        Ok(())
    }

    /// Load YAML capability definitions under `dir` and store their providers.
    ///
    /// Returns how many providers were stored; store failures skip the record.
    pub async fn load_provider_directory(&self, dir: &Path) -> Result<usize, ConfigError> {
        let records = self.registry.write().load_directory(dir)?;
        let mut stored = 0;
        for record in &records {
            match self.upsert_provider(record).await {
                Ok(()) => stored += 1,
                Err(e) => log::warn!("Provider {} from {} not stored: {}", record.id, dir.display(), e),
            }
        }
        log::info!("Loaded {} provider(s) from {}", stored, dir.display());
        Ok(stored)
    }

    pub fn invalidate(&self, capability: &str, consumer: &str) -> bool {
        self.cache
            .invalidate(CacheNamespace::Capability, capability, consumer)
            | self.cache.invalidate(CacheNamespace::FilePath, capability, consumer)
    }

    pub fn invalidate_capability(&self, capability: &str) -> usize {
        self.cache.invalidate_capability(capability)
    }

    // ------------------------------------------------------------------
    // Invocation
    // ------------------------------------------------------------------

    /// Run the bound provider and feed the outcome back into scoring.
    pub async fn invoke(
        &self,
        resolved: &ResolvedCapability,
        input: Value,
    ) -> Result<Value, ProviderError> {
        let binding = &resolved.binding;
        let handle = self
            .registry
            .read()
            .handle(&binding.provider)
            .ok_or_else(|| ProviderError::MissingHandle(binding.provider.clone()))?;

        if binding.mode != BindingMode::Eager && self.attached.insert(binding.id.clone(), ()).is_none() {
            log::debug!(
                "Attached {:?} binding {} to provider {} on first use",
                binding.mode,
                binding.id,
                binding.provider
            );
        }

        let _guard = self.load.acquire(&binding.provider);
        let started = Instant::now();
        let result = handle.invoke(input).await;
        let latency_ms = started.elapsed().as_secs_f64() * 1000.0;
        match self
            .performance
            .record(
                &binding.capability,
                &binding.provider,
                latency_ms,
                InvocationOutcome::of(&result),
            )
            .await
        {
            Ok(Some(update)) if update.newly_degraded => {
                self.cache.invalidate_capability(&binding.capability);
            }
            Ok(_) => {}
            Err(e) => log::warn!("Sample for {} not recorded: {}", binding.provider, e),
        }
        result
    }

    /// Current in-flight invocations of a provider.
    pub fn in_flight(&self, provider_id: &str) -> u32 {
        self.load.in_flight(provider_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::{
        CapabilityDefinition, FnProvider, ProviderStatus, Requirements, ResolutionType,
        SelectionAlgorithm,
    };
    use crate::config::StoreConfig;
    use crate::errors::MonitorError;
    use crate::generation::PatternGenerator;
    use crate::store::{InMemoryStore, ProviderSample, ProviderStats};
    use async_trait::async_trait;
    use chrono::DateTime;
    use serde_json::json;
    use std::sync::atomic::AtomicU32;

    /// In-memory store with injectable slowness and write failures.
    #[derive(Default)]
    struct ScriptedStore {
        inner: InMemoryStore,
        slow_queries: AtomicU32,
        fail_audit: bool,
    }

    #[async_trait]
    impl MetadataStore for ScriptedStore {
        async fn query_providers(
            &self,
            capability: &str,
            filter: &ProviderFilter,
        ) -> Result<Vec<ProviderRecord>, StoreError> {
            let slow = self
                .slow_queries
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if slow {
                tokio::time::sleep(Duration::from_millis(300)).await;
            }
            self.inner.query_providers(capability, filter).await
        }
        async fn get_provider(&self, c: &str, p: &str) -> Result<Option<ProviderRecord>, StoreError> {
            self.inner.get_provider(c, p).await
        }
        async fn upsert_provider(&self, record: &ProviderRecord) -> Result<(), StoreError> {
            self.inner.upsert_provider(record).await
        }
        async fn capability_known(&self, c: &str) -> Result<bool, StoreError> {
            self.inner.capability_known(c).await
        }
        async fn record_audit_event(&self, kind: &str, payload: &Value) -> Result<(), StoreError> {
            if self.fail_audit {
                return Err(StoreError::Backend("disk full".to_string()));
            }
            self.inner.record_audit_event(kind, payload).await
        }
        async fn get_rotation_pointer(&self, c: &str) -> Result<Option<u64>, StoreError> {
            self.inner.get_rotation_pointer(c).await
        }
        async fn set_rotation_pointer(&self, c: &str, i: u64) -> Result<(), StoreError> {
            self.inner.set_rotation_pointer(c, i).await
        }
        async fn record_provider_sample(
            &self,
            c: &str,
            p: &str,
            s: &ProviderSample,
        ) -> Result<(), StoreError> {
            self.inner.record_provider_sample(c, p, s).await
        }
        async fn provider_stats(
            &self,
            c: &str,
            since: DateTime<Utc>,
        ) -> Result<HashMap<String, ProviderStats>, StoreError> {
            self.inner.provider_stats(c, since).await
        }
    }

    /// Monitor that cancels the resolution it is registering.
    struct CancellingMonitor(CancelToken);

    #[async_trait]
    impl BindingMonitor for CancellingMonitor {
        async fn register(&self, _: &Binding, _: crate::config::MonitoringLevel) -> Result<(), MonitorError> {
            self.0.cancel();
            Ok(())
        }
    }

    fn send_message_providers() -> Vec<ProviderRecord> {
        vec![
            ProviderRecord::new("P1", "send_message")
                .with_files(vec!["agents/mail/p1.rs".into()])
                .with_scores(0.9, 0.95),
            ProviderRecord::new("P2", "send_message")
                .with_files(vec!["agents/mail/p2.rs".into()])
                .with_scores(0.5, 0.95),
        ]
    }

    fn resolver_with(store: Arc<dyn MetadataStore>) -> CapabilityResolver {
        CapabilityResolver::new(ResolverConfig::default(), store).unwrap()
    }

    fn highest(capability: &str, consumer: &str) -> CapabilityRequest {
        CapabilityRequest::new(capability, consumer).with_algorithm(SelectionAlgorithm::HighestScored)
    }

    #[tokio::test]
    async fn test_highest_scored_end_to_end() {
        let store = Arc::new(InMemoryStore::with_providers(send_message_providers()));
        let resolver = resolver_with(store.clone());

        let result = resolver.resolve_capability(&highest("send_message", "agent_1")).await;
        let resolved = result.resolved().unwrap();
        assert_eq!(resolved.provider, "P1");
        assert_eq!(resolved.provider_files, vec!["agents/mail/p1.rs".to_string()]);
        assert!(!resolved.cached);
        // P1 = 0.4*0.9 + 0.3 + 0.2*0.95 + 0.1, P2 = 0.4*0.5 + 0.3 + 0.2*0.95 + 0.1
        let p1 = resolved.composite_score.unwrap();
        assert!((p1 - 0.95).abs() < 1e-9);
        assert!(p1 > 0.79 + 1e-9);
        assert!(resolved.warnings.is_empty());
        assert_eq!(store.audit_events_of("binding_created").len(), 1);
    }

    #[tokio::test]
    async fn test_repeat_resolution_hits_cache() {
        let resolver = resolver_with(Arc::new(InMemoryStore::with_providers(send_message_providers())));
        let request = highest("send_message", "agent_1");

        let first = resolver.resolve_capability(&request).await;
        let second = resolver.resolve_capability(&request).await;
        let (first, second) = (first.resolved().unwrap(), second.resolved().unwrap());
        assert_eq!(first.binding_id, second.binding_id);
        assert!(second.cached);

        let snapshot = resolver.metrics();
        assert_eq!(snapshot.resolutions, 2);
        assert_eq!(snapshot.cache_hits, 1);
        assert_eq!(snapshot.cache_misses, 1);
    }

    #[tokio::test]
    async fn test_expired_cache_entry_rebinds() {
        let mut config = ResolverConfig::default();
        config.cache.capability_ttl_ms = 20;
        let resolver = CapabilityResolver::new(
            config,
            Arc::new(InMemoryStore::with_providers(send_message_providers())),
        )
        .unwrap();
        let request = highest("send_message", "agent_1");

        let first = resolver.resolve_capability(&request).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        let second = resolver.resolve_capability(&request).await;
        let (first, second) = (first.resolved().unwrap(), second.resolved().unwrap());
        assert_ne!(first.binding_id, second.binding_id);
        assert!(!second.cached);
    }

    #[tokio::test]
    async fn test_unknown_capability_requires_fallback() {
        let resolver = resolver_with(Arc::new(InMemoryStore::new()));
        let result = resolver
            .resolve_capability(&CapabilityRequest::new("summon_dragon", "wizard"))
            .await;
        let failure = result.failure().unwrap();
        assert_eq!(failure.error, ErrorKind::NoProvidersAvailable);
        assert!(failure.fallback_required);
        assert!(!failure.generation_requested);
        assert!(failure.retry_after_ms.is_none());

        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["error"], "no_providers_available");
        assert_eq!(json["fallback_required"], true);
    }

    #[tokio::test]
    async fn test_generatable_capability_requests_generation() {
        let (generator, mut queue) = PatternGenerator::pair(&["^summon_"], 4).unwrap();
        let resolver = CapabilityResolver::builder(Arc::new(InMemoryStore::new()))
            .generator(Arc::new(generator))
            .build()
            .unwrap();
        let result = resolver
            .resolve_capability(&CapabilityRequest::new("summon_dragon", "wizard"))
            .await;
        let failure = result.failure().unwrap();
        assert!(failure.fallback_required);
        assert!(failure.generation_requested);

        let queued = tokio::time::timeout(Duration::from_secs(1), queue.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(queued.capability, "summon_dragon");
    }

    #[tokio::test]
    async fn test_known_capability_without_active_providers_retries_later() {
        let store = Arc::new(InMemoryStore::with_providers(vec![
            ProviderRecord::new("P1", "send_message").with_status(ProviderStatus::Disabled),
        ]));
        let resolver = resolver_with(store);
        let result = resolver
            .resolve_capability(&CapabilityRequest::new("send_message", "agent_1"))
            .await;
        let failure = result.failure().unwrap();
        assert_eq!(failure.error, ErrorKind::NoProvidersAvailable);
        assert_eq!(failure.retry_after_ms, Some(30_000));
    }

    #[tokio::test]
    async fn test_alternative_capability_is_bound() {
        let store = Arc::new(InMemoryStore::with_providers(vec![ProviderRecord::new(
            "push",
            "notify_user",
        )]));
        let mut registry = CapabilityRegistry::new();
        let mut definition = CapabilityDefinition::new("send_message");
        definition.alternatives = vec!["notify_user".into()];
        registry.define(definition);

        let resolver = CapabilityResolver::builder(store)
            .registry(registry)
            .build()
            .unwrap();
        let result = resolver
            .resolve_capability(&CapabilityRequest::new("send_message", "agent_1"))
            .await;
        let resolved = result.resolved().unwrap();
        assert_eq!(resolved.provider, "push");
        assert_eq!(resolved.via_alternative.as_deref(), Some("notify_user"));
        assert_eq!(resolved.binding.capability, "notify_user");
    }

    #[tokio::test]
    async fn test_min_performance_relaxed_when_nothing_qualifies() {
        let resolver = resolver_with(Arc::new(InMemoryStore::with_providers(send_message_providers())));
        let mut request = highest("send_message", "agent_1");
        request.requirements.min_performance = Some(0.99);
        let result = resolver.resolve_capability(&request).await;
        assert_eq!(result.resolved().unwrap().provider, "P1");
    }

    #[tokio::test]
    async fn test_invalid_request_is_not_fallback() {
        let resolver = resolver_with(Arc::new(InMemoryStore::new()));
        let result = resolver
            .resolve_capability(&CapabilityRequest::new("bad name!", "agent"))
            .await;
        let failure = result.failure().unwrap();
        assert_eq!(failure.error, ErrorKind::InvalidRequest);
        assert!(!failure.fallback_required);

        let result = resolver
            .resolve_capability(&CapabilityRequest::new("send_message", ""))
            .await;
        assert_eq!(result.failure().unwrap().error, ErrorKind::InvalidRequest);
    }

    #[tokio::test]
    async fn test_round_robin_rotates_across_consumers() {
        let providers = vec![
            ProviderRecord::new("a", "cap"),
            ProviderRecord::new("b", "cap"),
            ProviderRecord::new("c", "cap"),
        ];
        let resolver = resolver_with(Arc::new(InMemoryStore::with_providers(providers)));

        let mut counts: HashMap<String, usize> = HashMap::new();
        let n = 12;
        for i in 0..n {
            let request = CapabilityRequest::new("cap", format!("agent_{}", i))
                .with_algorithm(SelectionAlgorithm::RoundRobin);
            let result = resolver.resolve_capability(&request).await;
            *counts.entry(result.resolved().unwrap().provider.clone()).or_default() += 1;
        }
        for id in ["a", "b", "c"] {
            assert!(counts.get(id).copied().unwrap_or(0) >= n / 3 - 1);
        }
    }

    #[tokio::test]
    async fn test_query_timeout_retried_once() {
        let store = Arc::new(ScriptedStore {
            inner: InMemoryStore::with_providers(send_message_providers()),
            slow_queries: AtomicU32::new(1),
            fail_audit: false,
        });
        let mut config = ResolverConfig::default();
        config.store = StoreConfig {
            timeout_ms: 50,
            ..Default::default()
        };
        let resolver = CapabilityResolver::new(config, store).unwrap();
        let result = resolver.resolve_capability(&highest("send_message", "agent_1")).await;
        assert_eq!(result.resolved().unwrap().provider, "P1");
    }

    #[tokio::test]
    async fn test_persistent_timeout_surfaces() {
        let store = Arc::new(ScriptedStore {
            inner: InMemoryStore::with_providers(send_message_providers()),
            slow_queries: AtomicU32::new(10),
            fail_audit: false,
        });
        let mut config = ResolverConfig::default();
        config.store = StoreConfig {
            timeout_ms: 30,
            retry_backoff_ms: 5,
            ..Default::default()
        };
        let resolver = CapabilityResolver::new(config, store).unwrap();
        let result = resolver.resolve_capability(&highest("send_message", "agent_1")).await;
        let failure = result.failure().unwrap();
        assert_eq!(failure.error, ErrorKind::ResolutionTimeout);
        assert!(failure.fallback_required);
    }

    #[tokio::test]
    async fn test_persistence_failure_is_warning() {
        let store = Arc::new(ScriptedStore {
            inner: InMemoryStore::with_providers(send_message_providers()),
            fail_audit: true,
            ..Default::default()
        });
        let resolver = resolver_with(store);
        let result = resolver.resolve_capability(&highest("send_message", "agent_1")).await;
        let resolved = result.resolved().unwrap();
        assert_eq!(resolved.provider, "P1");
        assert_eq!(resolved.warnings.len(), 1);
        assert_eq!(resolved.warnings[0].kind, ErrorKind::StorePersistenceWarning);
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let store = Arc::new(InMemoryStore::with_providers(send_message_providers()));
        let resolver = resolver_with(store.clone());
        let cancel = CancelToken::new();
        cancel.cancel();
        let result = resolver
            .resolve_with_cancel(&highest("send_message", "agent_1"), &cancel)
            .await;
        assert_eq!(result.failure().unwrap().error, ErrorKind::Cancelled);
        assert!(store.audit_events().is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_before_persistence() {
        let store = Arc::new(InMemoryStore::with_providers(send_message_providers()));
        let cancel = CancelToken::new();
        let resolver = CapabilityResolver::builder(store.clone())
            .monitor(Arc::new(CancellingMonitor(cancel.clone())))
            .build()
            .unwrap();
        let result = resolver
            .resolve_with_cancel(&highest("send_message", "agent_1"), &cancel)
            .await;
        assert_eq!(result.failure().unwrap().error, ErrorKind::Cancelled);
        assert!(store.audit_events().is_empty());
    }

    fn cyclic_store(with_plain_alternative: bool) -> Arc<InMemoryStore> {
        let mut records = vec![ProviderRecord::new("formatter", "format_text")
            .with_scores(0.9, 0.95)
            .with_interface(InterfaceSpec {
                requires: vec!["send_message".into()],
                ..Default::default()
            })];
        if with_plain_alternative {
            records.push(ProviderRecord::new("plain_formatter", "format_text").with_scores(0.4, 0.95));
        }
        Arc::new(InMemoryStore::with_providers(records))
    }

    fn cyclic_request() -> CapabilityRequest {
        highest("format_text", "agent_1").with_requirements(Requirements {
            algorithm: Some(SelectionAlgorithm::HighestScored),
            resolution_chain: vec!["send_message".into()],
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_unresolvable_cycle_fails() {
        let resolver = resolver_with(cyclic_store(false));
        let result = resolver.resolve_capability(&cyclic_request()).await;
        let failure = result.failure().unwrap();
        assert_eq!(failure.error, ErrorKind::CircularDependency);
        assert!(!failure.fallback_required);
        let cycle = failure.cycle.clone().unwrap();
        assert_eq!(cycle, vec!["format_text".to_string(), "send_message".to_string()]);
        assert!(failure.suggestion.is_some());
    }

    #[tokio::test]
    async fn test_cycle_broken_by_reorganization() {
        let resolver = resolver_with(cyclic_store(true));
        let result = resolver.resolve_capability(&cyclic_request()).await;
        let resolved = result.resolved().unwrap();
        assert_eq!(resolved.provider, "plain_formatter");
        assert_eq!(resolved.cycle_strategy, Some(CycleStrategy::ProviderReorganization));
    }

    #[tokio::test]
    async fn test_cycle_broken_by_lazy_binding() {
        let resolver = resolver_with(cyclic_store(false));
        let mut request = cyclic_request();
        request.requirements.allow_lazy = true;
        let result = resolver.resolve_capability(&request).await;
        let resolved = result.resolved().unwrap();
        assert_eq!(resolved.provider, "formatter");
        assert_eq!(resolved.binding.mode, BindingMode::Lazy);
        assert_eq!(resolved.cycle_strategy, Some(CycleStrategy::LazyInitialization));
    }

    #[tokio::test]
    async fn test_stale_binding_offered_on_failure() {
        let mut config = ResolverConfig::default();
        config.cache.capability_ttl_ms = 10;
        let store = Arc::new(InMemoryStore::with_providers(send_message_providers()));
        let resolver = CapabilityResolver::new(config, store.clone()).unwrap();
        let request = highest("send_message", "agent_1");
        let first = resolver.resolve_capability(&request).await;
        let binding_id = first.resolved().unwrap().binding_id.clone();

        for record in send_message_providers() {
            store
                .upsert_provider(&record.with_status(ProviderStatus::Disabled))
                .await
                .unwrap();
        }
        tokio::time::sleep(Duration::from_millis(30)).await;

        let result = resolver.resolve_capability(&request).await;
        let failure = result.failure().unwrap();
        assert_eq!(failure.stale_binding.as_ref().map(|b| b.id.as_str()), Some(binding_id.as_str()));
    }

    #[tokio::test]
    async fn test_upsert_invalidates_cached_bindings() {
        let resolver = resolver_with(Arc::new(InMemoryStore::with_providers(send_message_providers())));
        let request = highest("send_message", "agent_1");
        resolver.resolve_capability(&request).await;

        tokio_test::assert_ok!(
            resolver
                .upsert_provider(&ProviderRecord::new("P3", "send_message").with_scores(1.0, 1.0))
                .await
        );
        let result = resolver.resolve_capability(&request).await;
        let resolved = result.resolved().unwrap();
        assert!(!resolved.cached);
        assert_eq!(resolved.provider, "P3");
    }

    #[tokio::test]
    async fn test_register_capability() {
        let store = Arc::new(InMemoryStore::new());
        let resolver = resolver_with(store.clone());
        let outcome = resolver
            .register_capability("mail", "sendMessage", "agents/mail.rs")
            .await;
        assert_eq!(
            outcome,
            RegistrationOutcome {
                registered: true,
                capability: "send_message".into()
            }
        );
        let stored = store.get_provider("send_message", "mail::sendMessage").await.unwrap().unwrap();
        assert_eq!(stored.performance_score, 0.5);
        assert_eq!(stored.stability_rating, 0.9);
        assert_eq!(stored.status, ProviderStatus::Active);

        let rejected = resolver.register_capability("mail", "  ", "agents/mail.rs").await;
        assert!(!rejected.registered);
    }

    #[tokio::test]
    async fn test_invoke_records_samples() {
        let store = Arc::new(InMemoryStore::new());
        let resolver = resolver_with(store.clone());
        resolver
            .register_provider(
                ProviderRecord::new("echo", "echo"),
                Some(Arc::new(FnProvider::new("echo", |input| Ok(json!({ "echo": input }))))),
            )
            .await
            .unwrap();

        let result = resolver.resolve_capability(&CapabilityRequest::new("echo", "agent")).await;
        let resolved = result.resolved().unwrap();
        let output = resolver.invoke(resolved, json!("hi")).await.unwrap();
        assert_eq!(output, json!({ "echo": "hi" }));
        assert_eq!(resolver.in_flight("echo"), 0);

        let stats = store
            .provider_stats("echo", Utc::now() - chrono::Duration::days(1))
            .await
            .unwrap();
        assert_eq!(stats["echo"].sample_count, 1);
        assert_eq!(stats["echo"].success_rate, 1.0);
    }

    #[tokio::test]
    async fn test_invoke_without_handle() {
        let resolver = resolver_with(Arc::new(InMemoryStore::with_providers(send_message_providers())));
        let result = resolver.resolve_capability(&highest("send_message", "agent_1")).await;
        let err = tokio_test::assert_err!(resolver.invoke(result.resolved().unwrap(), json!({})).await);
        assert!(matches!(err, ProviderError::MissingHandle(_)));
    }

    #[tokio::test]
    async fn test_file_resolution_uses_own_namespace() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join("playbook.yaml"), "steps: []").unwrap();
        let mut config = ResolverConfig::default();
        config.file_paths.roots = vec![dir.path().to_path_buf()];
        let resolver = CapabilityResolver::new(config, Arc::new(InMemoryStore::new())).unwrap();

        let request = CapabilityRequest::new("file_resolution_playbook", "acme");
        let first = resolver.resolve_capability(&request).await;
        let first = first.resolved().unwrap();
        assert_eq!(
            first.provider_files,
            vec![dir.path().join("playbook.yaml").display().to_string()]
        );

        let second = resolver.resolve_capability(&request).await;
        assert!(second.resolved().unwrap().cached);
        assert_eq!(resolver.cache_stats().entries, 1);

        let missing = resolver
            .resolve_capability(&CapabilityRequest::new("file_resolution_absent", "acme"))
            .await;
        let failure = missing.failure().unwrap();
        assert_eq!(failure.error, ErrorKind::NoProvidersAvailable);
        assert!(failure.fallback_required);
    }

    #[tokio::test]
    async fn test_load_provider_directory() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("mail.yaml"),
            r#"
capability:
  name: "send_message"
  providers:
    - id: "mail::smtp"
      performance_score: 0.8
"#,
        )
        .unwrap();
        let store = Arc::new(InMemoryStore::new());
        let resolver = resolver_with(store.clone());
        assert_eq!(resolver.load_provider_directory(dir.path()).await.unwrap(), 1);
        assert_eq!(store.provider_count(), 1);

        let result = resolver
            .resolve_capability(&CapabilityRequest::new("send_message", "agent"))
            .await;
        assert_eq!(result.resolved().unwrap().provider, "mail::smtp");
    }

    #[tokio::test]
    async fn test_cycle_broken_by_interface_injection() {
        let resolver = resolver_with(cyclic_store(false));
        let required = InterfaceSpec {
            operations: vec!["format".into()],
            outputs: vec!["text".into()],
            ..Default::default()
        };
        let mut request = cyclic_request();
        request.requirements.interface_spec = Some(required.clone());
        let result = resolver.resolve_capability(&request).await;
        let resolved = result.resolved().unwrap();
        assert_eq!(resolved.provider, "formatter");
        assert_eq!(resolved.cycle_strategy, Some(CycleStrategy::InterfaceInjection));
        assert_eq!(resolved.binding.mode, BindingMode::InterfaceStub);
        assert_eq!(resolved.binding.interface, required);
    }

    #[tokio::test]
    async fn test_file_path_resolution_type_without_prefix() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("clients").join("acme")).unwrap();
        std::fs::write(dir.path().join("clients/acme/brand_voice.yaml"), "tone: warm").unwrap();
        std::fs::write(dir.path().join("brand_voice.yaml"), "tone: neutral").unwrap();
        let mut config = ResolverConfig::default();
        config.file_paths.roots = vec![dir.path().to_path_buf()];
        let resolver = CapabilityResolver::new(config, Arc::new(InMemoryStore::new())).unwrap();

        let request = CapabilityRequest::new("brand_voice", "acme").with_requirements(Requirements {
            resolution_type: ResolutionType::FilePath,
            ..Default::default()
        });
        let first = resolver.resolve_capability(&request).await;
        assert_eq!(
            first.resolved().unwrap().provider_files,
            vec![dir.path().join("clients/acme/brand_voice.yaml").display().to_string()]
        );
        assert!(resolver.resolve_capability(&request).await.resolved().unwrap().cached);

        // Same name as a plain capability request is a different lookup.
        let plain = resolver
            .resolve_capability(&CapabilityRequest::new("brand_voice", "acme"))
            .await;
        assert!(plain.failure().is_some());
    }

    #[tokio::test]
    async fn test_resolution_over_sqlite_store() {
        let dir = tempfile::TempDir::new().unwrap();
        let db = dir.path().join("caplink.db");
        let store = Arc::new(crate::store::SqliteStore::open(&db).unwrap());
        for record in send_message_providers() {
            store.upsert_provider(&record).await.unwrap();
        }
        let resolver = resolver_with(store.clone());

        let result = resolver.resolve_capability(&highest("send_message", "agent_1")).await;
        assert_eq!(result.resolved().unwrap().provider, "P1");

        let rotate = |consumer: &str| {
            CapabilityRequest::new("send_message", consumer).with_algorithm(SelectionAlgorithm::RoundRobin)
        };
        let first = resolver.resolve_capability(&rotate("agent_2")).await;
        let second = resolver.resolve_capability(&rotate("agent_3")).await;
        assert_eq!(first.resolved().unwrap().provider, "P1");
        assert_eq!(second.resolved().unwrap().provider, "P2");
        assert_eq!(store.get_rotation_pointer("send_message").await.unwrap(), Some(2));

        // A fresh resolver over the same file continues the rotation.
        drop(resolver);
        let reopened = Arc::new(crate::store::SqliteStore::open(&db).unwrap());
        let resolver = resolver_with(reopened);
        let third = resolver.resolve_capability(&rotate("agent_4")).await;
        assert_eq!(third.resolved().unwrap().provider, "P1");
    }

    #[tokio::test]
    async fn test_new_alternative_provider_drops_cached_binding() {
        let store = Arc::new(InMemoryStore::with_providers(vec![ProviderRecord::new(
            "push",
            "notify_user",
        )]));
        let mut registry = CapabilityRegistry::new();
        let mut definition = CapabilityDefinition::new("send_message");
        definition.alternatives = vec!["notify_user".into()];
        registry.define(definition);
        let resolver = CapabilityResolver::builder(store)
            .registry(registry)
            .build()
            .unwrap();
        let request = CapabilityRequest::new("send_message", "agent_1");

        assert!(!resolver.resolve_capability(&request).await.resolved().unwrap().cached);
        assert!(resolver.resolve_capability(&request).await.resolved().unwrap().cached);

        resolver
            .upsert_provider(&ProviderRecord::new("sms", "notify_user"))
            .await
            .unwrap();
        let after = resolver.resolve_capability(&request).await;
        assert!(!after.resolved().unwrap().cached);
    }
}
