//! Binding manager: turns a selected provider into an immutable binding.
//!
//! Creating a binding has two side effects, neither of which can fail it:
//! monitoring registration (failure leaves `monitoring.enabled = false`) and
//! the audit record in the metadata store (failure is reported back as a
//! persistence warning, the binding stays valid for the current call).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};

use super::CancelToken;
use crate::capabilities::{InterfaceSpec, ProviderRecord};
use crate::config::{MonitoringConfig, MonitoringLevel, StoreConfig};
use crate::errors::{MonitorError, ResolutionError};
use crate::store::{self, MetadataStore};

static BINDING_NONCE: AtomicU64 = AtomicU64::new(0);

/// How the provider is attached to the consumer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BindingMode {
    /// Provider attached at resolve time.
    #[default]
    Eager,
    /// Provider handle attached on first invocation.
    Lazy,
    /// Consumer gets a stub with the required interface shape only.
    InterfaceStub,
}

/// Monitoring state of a binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitoringInfo {
    pub enabled: bool,
    pub level: MonitoringLevel,
}

/// Resolved pairing of consumer, capability and provider. Immutable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Binding {
    pub id: String,
    pub consumer: String,
    pub provider: String,
    pub capability: String,
    #[serde(default)]
    pub provider_files: Vec<String>,
    pub interface: InterfaceSpec,
    pub created_at: DateTime<Utc>,
    pub monitoring: MonitoringInfo,
    #[serde(default)]
    pub mode: BindingMode,
}

/// Monitoring subscription sink for new bindings.
#[async_trait]
pub trait BindingMonitor: Send + Sync {
    async fn register(&self, binding: &Binding, level: MonitoringLevel) -> Result<(), MonitorError>;
}

/// Monitor that only logs the subscription.
#[derive(Debug, Default, Clone)]
pub struct LogMonitor;

#[async_trait]
impl BindingMonitor for LogMonitor {
    async fn register(&self, binding: &Binding, level: MonitoringLevel) -> Result<(), MonitorError> {
        log::debug!(
            "Monitoring binding {} ({} -> {}) at {:?}",
            binding.id,
            binding.consumer,
            binding.provider,
            level
        );
        Ok(())
    }
}

/// A binding plus whatever went wrong around it without failing it.
#[derive(Debug, Clone)]
pub struct BindingOutcome {
    pub binding: Binding,
    pub persistence_warning: Option<String>,
}

/// Generate a binding id unique per consumer, provider, capability and creation time.
pub fn binding_id(consumer: &str, provider: &str, capability: &str, created_at: DateTime<Utc>) -> String {
    let nonce = BINDING_NONCE.fetch_add(1, Ordering::Relaxed);
    let mut hasher = Sha256::new();
    hasher.update(consumer.as_bytes());
    hasher.update(b"|");
    hasher.update(provider.as_bytes());
    hasher.update(b"|");
    hasher.update(capability.as_bytes());
    hasher.update(b"|");
    hasher.update(created_at.to_rfc3339().as_bytes());
    hasher.update(nonce.to_le_bytes());
    let digest = hex::encode(hasher.finalize());
    format!("bnd_{}", &digest[..32])
}

/// Creates bindings, registers monitoring and persists audit records.
pub struct BindingManager {
    store: Arc<dyn MetadataStore>,
    monitor: Arc<dyn BindingMonitor>,
    monitoring: MonitoringConfig,
    store_config: StoreConfig,
}

impl BindingManager {
    pub fn new(
        store: Arc<dyn MetadataStore>,
        monitor: Arc<dyn BindingMonitor>,
        monitoring: MonitoringConfig,
        store_config: StoreConfig,
    ) -> Self {
        Self {
            store,
            monitor,
            monitoring,
            store_config,
        }
    }

    /// Bind `provider` to `consumer` for `capability`.
    ///
    /// Stops with [`ResolutionError::Cancelled`] if `cancel` fires before the
    /// audit record is written.
    pub async fn create_binding(
        &self,
        consumer: &str,
        provider: &ProviderRecord,
        capability: &str,
        interface_requirements: Option<&InterfaceSpec>,
        mode: BindingMode,
        cancel: &CancelToken,
    ) -> Result<BindingOutcome, ResolutionError> {
        let created_at = Utc::now();
        let interface = match (mode, interface_requirements) {
            (BindingMode::InterfaceStub, Some(required)) => required.clone(),
            _ => provider.interface_spec.clone(),
        };

        let mut binding = Binding {
            id: binding_id(consumer, &provider.id, capability, created_at),
            consumer: consumer.to_string(),
            provider: provider.id.clone(),
            capability: capability.to_string(),
            provider_files: provider.provider_files.clone(),
            interface,
            created_at,
            monitoring: MonitoringInfo {
                enabled: false,
                level: self.monitoring.level,
            },
            mode,
        };

        if self.monitoring.enabled {
            binding.monitoring.enabled = self.register_monitoring(&binding).await;
        }

        cancel.check("binding persistence")?;

        let persistence_warning = self.persist(&binding).await;
        Ok(BindingOutcome {
            binding,
            persistence_warning,
        })
    }

    async fn register_monitoring(&self, binding: &Binding) -> bool {
        let registration = tokio::time::timeout(
            self.store_config.timeout(),
            self.monitor.register(binding, self.monitoring.level),
        )
        .await;
        match registration {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                log::warn!("Binding {} created without monitoring: {}", binding.id, e);
                false
            }
            Err(_) => {
                log::warn!(
                    "Binding {} created without monitoring: registration timed out",
                    binding.id
                );
                false
            }
        }
    }

    /// Best-effort audit record; returns the failure message instead of failing.
    pub async fn persist(&self, binding: &Binding) -> Option<String> {
        let payload = json!({
            "binding_id": binding.id,
            "capability": binding.capability,
            "consumer": binding.consumer,
            "provider": binding.provider,
            "mode": binding.mode,
            "created_at": binding.created_at.to_rfc3339(),
        });
        let write = store::bounded(
            &self.store_config,
            "record_audit_event",
            self.store.record_audit_event("binding_created", &payload),
        )
        .await;
        match write {
            Ok(()) => None,
            Err(e) => {
                log::warn!(
                    "Binding {} not durably recorded, continuing: {}",
                    binding.id,
                    e
                );
                Some(e.to_string())
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::errors::StoreError;
    use crate::store::InMemoryStore;
    use std::collections::HashMap;

    pub(crate) fn sample_binding(capability: &str, consumer: &str, provider: &str) -> Binding {
        let created_at = Utc::now();
        Binding {
            id: binding_id(consumer, provider, capability, created_at),
            consumer: consumer.to_string(),
            provider: provider.to_string(),
            capability: capability.to_string(),
            provider_files: vec![format!("{}.rs", provider)],
            interface: InterfaceSpec::default(),
            created_at,
            monitoring: MonitoringInfo {
                enabled: true,
                level: MonitoringLevel::Standard,
            },
            mode: BindingMode::Eager,
        }
    }

    struct FailingMonitor;

    #[async_trait]
    impl BindingMonitor for FailingMonitor {
        async fn register(&self, _: &Binding, _: MonitoringLevel) -> Result<(), MonitorError> {
            Err(MonitorError::RegistrationFailed("sink offline".to_string()))
        }
    }

    /// Store whose writes always fail.
    struct ReadOnlyStore(InMemoryStore);

    #[async_trait]
    impl MetadataStore for ReadOnlyStore {
        async fn query_providers(
            &self,
            capability: &str,
            filter: &crate::store::ProviderFilter,
        ) -> Result<Vec<ProviderRecord>, StoreError> {
            self.0.query_providers(capability, filter).await
        }
        async fn get_provider(&self, c: &str, p: &str) -> Result<Option<ProviderRecord>, StoreError> {
            self.0.get_provider(c, p).await
        }
        async fn upsert_provider(&self, _: &ProviderRecord) -> Result<(), StoreError> {
            Err(StoreError::Backend("read-only".to_string()))
        }
        async fn capability_known(&self, c: &str) -> Result<bool, StoreError> {
            self.0.capability_known(c).await
        }
        async fn record_audit_event(&self, _: &str, _: &serde_json::Value) -> Result<(), StoreError> {
            Err(StoreError::Backend("read-only".to_string()))
        }
        async fn get_rotation_pointer(&self, c: &str) -> Result<Option<u64>, StoreError> {
            self.0.get_rotation_pointer(c).await
        }
        async fn set_rotation_pointer(&self, _: &str, _: u64) -> Result<(), StoreError> {
            Err(StoreError::Backend("read-only".to_string()))
        }
        async fn record_provider_sample(
            &self,
            _: &str,
            _: &str,
            _: &crate::store::ProviderSample,
        ) -> Result<(), StoreError> {
            Err(StoreError::Backend("read-only".to_string()))
        }
        async fn provider_stats(
            &self,
            c: &str,
            since: DateTime<Utc>,
        ) -> Result<HashMap<String, crate::store::ProviderStats>, StoreError> {
            self.0.provider_stats(c, since).await
        }
    }

    fn manager(store: Arc<dyn MetadataStore>, monitor: Arc<dyn BindingMonitor>) -> BindingManager {
        BindingManager::new(store, monitor, MonitoringConfig::default(), StoreConfig::default())
    }

    #[test]
    fn test_binding_ids_unique() {
        let now = Utc::now();
        let a = binding_id("c", "p", "cap", now);
        let b = binding_id("c", "p", "cap", now);
        assert_ne!(a, b);
        assert!(a.starts_with("bnd_"));
        assert_eq!(a.len(), 36);
    }

    #[tokio::test]
    async fn test_create_binding_persists_audit_record() {
        let store = Arc::new(InMemoryStore::new());
        let manager = manager(store.clone(), Arc::new(LogMonitor));
        let provider = ProviderRecord::new("mail::smtp", "send_message")
            .with_files(vec!["mail/smtp.rs".to_string()]);

        let outcome = manager
            .create_binding(
                "agent_1",
                &provider,
                "send_message",
                None,
                BindingMode::Eager,
                &CancelToken::new(),
            )
            .await
            .unwrap();

        assert!(outcome.persistence_warning.is_none());
        assert!(outcome.binding.monitoring.enabled);
        assert_eq!(outcome.binding.provider, "mail::smtp");
        let events = store.audit_events_of("binding_created");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].payload["binding_id"], outcome.binding.id.as_str());
    }

    #[tokio::test]
    async fn test_monitoring_failure_does_not_fail_binding() {
        let manager = manager(Arc::new(InMemoryStore::new()), Arc::new(FailingMonitor));
        let provider = ProviderRecord::new("p", "cap");
        let outcome = manager
            .create_binding("c", &provider, "cap", None, BindingMode::Eager, &CancelToken::new())
            .await
            .unwrap();
        assert!(!outcome.binding.monitoring.enabled);
    }

    #[tokio::test]
    async fn test_persistence_failure_is_warning() {
        let manager = manager(
            Arc::new(ReadOnlyStore(InMemoryStore::new())),
            Arc::new(LogMonitor),
        );
        let provider = ProviderRecord::new("p", "cap");
        let outcome = manager
            .create_binding("c", &provider, "cap", None, BindingMode::Eager, &CancelToken::new())
            .await
            .unwrap();
        assert!(outcome.persistence_warning.is_some());
        assert_eq!(outcome.binding.capability, "cap");
    }

    #[tokio::test]
    async fn test_cancelled_before_persistence() {
        let store = Arc::new(InMemoryStore::new());
        let manager = manager(store.clone(), Arc::new(LogMonitor));
        let cancel = CancelToken::new();
        cancel.cancel();
        let result = manager
            .create_binding(
                "c",
                &ProviderRecord::new("p", "cap"),
                "cap",
                None,
                BindingMode::Eager,
                &cancel,
            )
            .await;
        assert!(matches!(result, Err(ResolutionError::Cancelled { .. })));
        assert!(store.audit_events().is_empty());
    }

    #[tokio::test]
    async fn test_interface_stub_uses_required_shape() {
        let manager = manager(Arc::new(InMemoryStore::new()), Arc::new(LogMonitor));
        let required = InterfaceSpec {
            operations: vec!["send".to_string()],
            ..Default::default()
        };
        let outcome = manager
            .create_binding(
                "c",
                &ProviderRecord::new("p", "cap"),
                "cap",
                Some(&required),
                BindingMode::InterfaceStub,
                &CancelToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(outcome.binding.interface, required);
        assert_eq!(outcome.binding.mode, BindingMode::InterfaceStub);
    }
}
