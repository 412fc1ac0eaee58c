//! Gap handler: what happens when a capability has no usable provider.
//!
//! Stages, first success wins:
//! 1. Relaxed retry: query again without the performance floor
//! 2. Alternatives: capabilities the definition names as substitutes
//! 3. Known capability: schedule a recovery check, answer "retry later"
//! 4. Unknown capability: ask the generator, trigger it in the background
//! 5. Escalate through the notifier

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::capabilities::{CapabilityRegistry, CapabilityRequest, ProviderRecord};
use crate::config::{GapConfig, StoreConfig};
use crate::generation::AutoGenerator;
use crate::store::{self, MetadataStore, ProviderFilter};

/// A capability gap nobody could fill.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Escalation {
    pub capability: String,
    pub consumer: String,
    pub reason: String,
    pub at: DateTime<Utc>,
}

/// Sink for escalations.
#[async_trait]
pub trait EscalationNotifier: Send + Sync {
    async fn notify(&self, escalation: &Escalation);
}

/// Notifier that only logs.
#[derive(Debug, Default, Clone)]
pub struct LogNotifier;

#[async_trait]
impl EscalationNotifier for LogNotifier {
    async fn notify(&self, escalation: &Escalation) {
        log::error!(
            "Capability gap escalated: {} requested by {} ({})",
            escalation.capability,
            escalation.consumer,
            escalation.reason
        );
    }
}

/// Outcome of gap handling.
#[derive(Debug, Clone, PartialEq)]
pub enum GapDecision {
    /// The relaxed query found providers for the requested capability.
    Relaxed(Vec<ProviderRecord>),
    /// A substitute capability has providers.
    Alternative {
        capability: String,
        providers: Vec<ProviderRecord>,
    },
    /// Capability is known but currently providerless; a recovery check is scheduled.
    RetryLater { retry_after_ms: u64 },
    /// Generation was triggered in the background.
    GenerationRequested,
    Escalated,
}

pub struct GapHandler {
    store: Arc<dyn MetadataStore>,
    registry: Arc<RwLock<CapabilityRegistry>>,
    generator: Arc<dyn AutoGenerator>,
    notifier: Arc<dyn EscalationNotifier>,
    config: GapConfig,
    store_config: StoreConfig,
    pending_recovery: Arc<DashMap<String, ()>>,
}

impl GapHandler {
    pub fn new(
        store: Arc<dyn MetadataStore>,
        registry: Arc<RwLock<CapabilityRegistry>>,
        generator: Arc<dyn AutoGenerator>,
        notifier: Arc<dyn EscalationNotifier>,
        config: GapConfig,
        store_config: StoreConfig,
    ) -> Self {
        Self {
            store,
            registry,
            generator,
            notifier,
            config,
            store_config,
            pending_recovery: Arc::new(DashMap::new()),
        }
    }

    /// Capabilities with a recovery check in flight.
    pub fn pending_recoveries(&self) -> Vec<String> {
        self.pending_recovery.iter().map(|e| e.key().clone()).collect()
    }

    /// Query again for the requested capability with only the status and
    /// consumer constraints kept.
    pub async fn relaxed_retry(&self, request: &CapabilityRequest) -> Vec<ProviderRecord> {
        let found = self.query(&request.capability, &relaxed_filter(request)).await;
        if !found.is_empty() {
            log::info!(
                "Relaxed requirements for {} found {} provider(s)",
                request.capability,
                found.len()
            );
        }
        found
    }

    /// Run the fallback stages for a request that found no providers.
    pub async fn handle_no_providers(&self, request: &CapabilityRequest) -> GapDecision {
        let capability = request.capability.as_str();
        let relaxed = relaxed_filter(request);

        if request.requirements.min_performance.is_some() {
            let found = self.relaxed_retry(request).await;
            if !found.is_empty() {
                return GapDecision::Relaxed(found);
            }
        }

        let alternatives = self.registry.read().alternatives(capability);
        for alternative in alternatives {
            let found = self.query(&alternative, &relaxed).await;
            if !found.is_empty() {
                log::info!("Using alternative {} for {}", alternative, capability);
                return GapDecision::Alternative {
                    capability: alternative,
                    providers: found,
                };
            }
        }

        if self.is_known(capability).await {
            let active = self.query(capability, &ProviderFilter::active()).await;
            if !active.is_empty() {
                let reason = format!(
                    "{} active provider(s), none admit consumer {}",
                    active.len(),
                    request.consumer
                );
                return self.escalate(request, reason).await;
            }
            self.schedule_recovery(capability);
            return GapDecision::RetryLater {
                retry_after_ms: self.config.recovery_retry_ms,
            };
        }

        if self.config.auto_generation && self.generator.can_auto_generate(capability).await {
            self.trigger_generation(request);
            return GapDecision::GenerationRequested;
        }

        self.escalate(request, "no providers, no alternatives, not generatable".to_string())
            .await
    }

    async fn escalate(&self, request: &CapabilityRequest, reason: String) -> GapDecision {
        let escalation = Escalation {
            capability: request.capability.clone(),
            consumer: request.consumer.clone(),
            reason,
            at: Utc::now(),
        };
        self.notifier.notify(&escalation).await;
        GapDecision::Escalated
    }

    async fn query(&self, capability: &str, filter: &ProviderFilter) -> Vec<ProviderRecord> {
        match store::bounded(
            &self.store_config,
            "query_providers",
            self.store.query_providers(capability, filter),
        )
        .await
        {
            Ok(found) => found,
            Err(e) => {
                log::warn!("Fallback query for {} failed: {}", capability, e);
                Vec::new()
            }
        }
    }

    async fn is_known(&self, capability: &str) -> bool {
        if self.registry.read().is_defined(capability) {
            return true;
        }
        store::bounded(
            &self.store_config,
            "capability_known",
            self.store.capability_known(capability),
        )
        .await
        .unwrap_or(false)
    }

    fn schedule_recovery(&self, capability: &str) {
        if self.pending_recovery.insert(capability.to_string(), ()).is_some() {
            log::debug!("Recovery check for {} already scheduled", capability);
            return;
        }
        log::info!(
            "Capability {} has no active providers, re-checking in {}ms",
            capability,
            self.config.recovery_retry_ms
        );

        let store = self.store.clone();
        let store_config = self.store_config.clone();
        let pending = self.pending_recovery.clone();
        let capability = capability.to_string();
        let delay = Duration::from_millis(self.config.recovery_retry_ms);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let active = store::bounded(
                &store_config,
                "query_providers",
                store.query_providers(&capability, &ProviderFilter::active()),
            )
            .await
            .map(|found| found.len())
            .unwrap_or(0);

            let payload = json!({ "capability": capability, "active_providers": active });
            if let Err(e) = store::bounded(
                &store_config,
                "record_audit_event",
                store.record_audit_event("capability_recovery_check", &payload),
            )
            .await
            {
                log::warn!("Recovery check for {} not recorded: {}", capability, e);
            }
            if active > 0 {
                log::info!("Capability {} recovered with {} provider(s)", capability, active);
            }
            pending.remove(&capability);
        });
    }

    fn trigger_generation(&self, request: &CapabilityRequest) {
        let generator = self.generator.clone();
        let capability = request.capability.clone();
        let requirements = request.requirements.clone();
        log::info!("Requesting generation of {}", capability);
        tokio::spawn(async move {
            if let Err(e) = generator.request_generation(&capability, &requirements).await {
                log::warn!("Generation request for {} failed: {}", capability, e);
            }
        });
    }
}

fn relaxed_filter(request: &CapabilityRequest) -> ProviderFilter {
    ProviderFilter {
        compatible_with: Some(request.consumer.clone()),
        ..ProviderFilter::active()
    }
}
