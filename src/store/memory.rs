//! Process-local metadata store.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde_json::Value;

use super::{AuditEvent, MetadataStore, ProviderFilter, ProviderSample, ProviderStats};
use crate::capabilities::ProviderRecord;
use crate::errors::StoreError;

/// In-memory [`MetadataStore`].
///
/// Providers are kept per capability, keyed by provider id. Audit events are
/// append-only and can be inspected with [`InMemoryStore::audit_events`].
#[derive(Debug, Default)]
pub struct InMemoryStore {
    providers: RwLock<HashMap<String, HashMap<String, ProviderRecord>>>,
    audit: RwLock<Vec<AuditEvent>>,
    rotation: RwLock<HashMap<String, u64>>,
    samples: RwLock<HashMap<(String, String), Vec<ProviderSample>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store pre-populated with `records`.
    pub fn with_providers(records: impl IntoIterator<Item = ProviderRecord>) -> Self {
        let store = Self::new();
        {
            let mut providers = store.providers.write();
            for record in records {
                providers
                    .entry(record.capability_name.clone())
                    .or_default()
                    .insert(record.id.clone(), record);
            }
        }
        store
    }

    /// Snapshot of all audit events recorded so far.
    pub fn audit_events(&self) -> Vec<AuditEvent> {
        self.audit.read().clone()
    }

    /// Audit events of a single kind.
    pub fn audit_events_of(&self, kind: &str) -> Vec<AuditEvent> {
        self.audit
            .read()
            .iter()
            .filter(|e| e.kind == kind)
            .cloned()
            .collect()
    }

    pub fn provider_count(&self) -> usize {
        self.providers.read().values().map(|m| m.len()).sum()
    }
}

#[async_trait]
impl MetadataStore for InMemoryStore {
    async fn query_providers(
        &self,
        capability: &str,
        filter: &ProviderFilter,
    ) -> Result<Vec<ProviderRecord>, StoreError> {
        let providers = self.providers.read();
        let mut matched: Vec<ProviderRecord> = providers
            .get(capability)
            .map(|by_id| by_id.values().filter(|r| filter.matches(r)).cloned().collect())
            .unwrap_or_default();
        matched.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(matched)
    }

    async fn get_provider(
        &self,
        capability: &str,
        provider_id: &str,
    ) -> Result<Option<ProviderRecord>, StoreError> {
        Ok(self
            .providers
            .read()
            .get(capability)
            .and_then(|by_id| by_id.get(provider_id))
            .cloned())
    }

    async fn upsert_provider(&self, record: &ProviderRecord) -> Result<(), StoreError> {
        self.providers
            .write()
            .entry(record.capability_name.clone())
            .or_default()
            .insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn capability_known(&self, capability: &str) -> Result<bool, StoreError> {
        Ok(self
            .providers
            .read()
            .get(capability)
            .map_or(false, |by_id| !by_id.is_empty()))
    }

    async fn record_audit_event(&self, kind: &str, payload: &Value) -> Result<(), StoreError> {
        self.audit.write().push(AuditEvent {
            id: uuid::Uuid::new_v4().to_string(),
            kind: kind.to_string(),
            payload: payload.clone(),
            recorded_at: Utc::now(),
        });
        Ok(())
    }

    async fn get_rotation_pointer(&self, capability: &str) -> Result<Option<u64>, StoreError> {
        Ok(self.rotation.read().get(capability).copied())
    }

    async fn set_rotation_pointer(&self, capability: &str, index: u64) -> Result<(), StoreError> {
        self.rotation.write().insert(capability.to_string(), index);
        Ok(())
    }

    async fn record_provider_sample(
        &self,
        capability: &str,
        provider_id: &str,
        sample: &ProviderSample,
    ) -> Result<(), StoreError> {
        self.samples
            .write()
            .entry((capability.to_string(), provider_id.to_string()))
            .or_default()
            .push(sample.clone());
        Ok(())
    }

    async fn provider_stats(
        &self,
        capability: &str,
        since: DateTime<Utc>,
    ) -> Result<HashMap<String, ProviderStats>, StoreError> {
        let samples = self.samples.read();
        let mut stats = HashMap::new();
        for ((cap, provider_id), list) in samples.iter() {
            if cap != capability {
                continue;
            }
            let recent: Vec<ProviderSample> =
                list.iter().filter(|s| s.at >= since).cloned().collect();
            if !recent.is_empty() {
                stats.insert(provider_id.clone(), ProviderStats::from_samples(&recent));
            }
        }
        Ok(stats)
    }
}
