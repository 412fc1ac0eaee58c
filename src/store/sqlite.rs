//! SQLite-backed metadata store.
//!
//! Each operation opens its own connection on a blocking thread, so the store
//! can be shared freely across tasks. Provider records are kept as JSON next
//! to the columns the store filters on.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;

use super::{MetadataStore, ProviderFilter, ProviderSample, ProviderStats};
use crate::capabilities::ProviderRecord;
use crate::errors::StoreError;

/// SQLite [`MetadataStore`].
#[derive(Debug, Clone)]
pub struct SqliteStore {
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
}

impl SqliteStore {
    /// Open (creating if needed) the database at `db_path` and ensure the schema.
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let db_path = db_path.as_ref().to_path_buf();
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StoreError::Backend(e.to_string()))?;
            }
        }
        let store = Self { db_path };
        store.initialize_db()?;
        Ok(store)
    }

    fn initialize_db(&self) -> Result<(), StoreError> {
        let conn = Connection::open(&self.db_path).map_err(|e| {
            log::error!("Failed to open provider store {}: {}", self.db_path.display(), e);
            StoreError::from(e)
        })?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS providers (
                capability_name TEXT NOT NULL,
                id TEXT NOT NULL,
                status TEXT NOT NULL,
                performance_score REAL NOT NULL,
                record TEXT NOT NULL,
                PRIMARY KEY (capability_name, id)
            );
            CREATE TABLE IF NOT EXISTS audit_events (
                id TEXT PRIMARY KEY,
                kind TEXT NOT NULL,
                payload TEXT NOT NULL,
                recorded_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS rotation_pointers (
                capability_name TEXT PRIMARY KEY,
                position INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS provider_samples (
                capability_name TEXT NOT NULL,
                provider_id TEXT NOT NULL,
                at TEXT NOT NULL,
                latency_ms REAL NOT NULL,
                success INTEGER NOT NULL,
                available INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_samples_cap_at
                ON provider_samples (capability_name, at);",
        )?;
        Ok(())
    }

    /// Run `op` against a fresh connection on the blocking pool.
    async fn with_conn<T, F>(&self, op: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let conn = Connection::open(&db_path)?;
            op(&conn)
        })
        .await
        .map_err(|e| StoreError::Backend(format!("blocking task failed: {}", e)))?
    }
}

fn decode_record(json: &str) -> Result<ProviderRecord, StoreError> {
    serde_json::from_str(json).map_err(StoreError::from)
}

#[async_trait]
impl MetadataStore for SqliteStore {
    async fn query_providers(
        &self,
        capability: &str,
        filter: &ProviderFilter,
    ) -> Result<Vec<ProviderRecord>, StoreError> {
        let capability = capability.to_string();
        let filter = filter.clone();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT record FROM providers
                 WHERE capability_name = ?1
                   AND (?2 IS NULL OR status = ?2)
                   AND (?3 IS NULL OR performance_score >= ?3)
                 ORDER BY id",
            )?;
            let status = filter.status.map(|s| s.as_str());
            let rows = stmt.query_map(params![capability, status, filter.min_performance], |row| {
                row.get::<_, String>(0)
            })?;

            let mut records = Vec::new();
            for row in rows {
                let record = decode_record(&row?)?;
                if let Some(consumer) = &filter.compatible_with {
                    if !record.admits(consumer) {
                        continue;
                    }
                }
                records.push(record);
            }
            Ok(records)
        })
        .await
    }

    async fn get_provider(
        &self,
        capability: &str,
        provider_id: &str,
    ) -> Result<Option<ProviderRecord>, StoreError> {
        let capability = capability.to_string();
        let provider_id = provider_id.to_string();
        self.with_conn(move |conn| {
            let json: Option<String> = conn
                .query_row(
                    "SELECT record FROM providers WHERE capability_name = ?1 AND id = ?2",
                    params![capability, provider_id],
                    |row| row.get(0),
                )
                .optional()?;
            json.map(|j| decode_record(&j)).transpose()
        })
        .await
    }

    async fn upsert_provider(&self, record: &ProviderRecord) -> Result<(), StoreError> {
        let record = record.clone();
        self.with_conn(move |conn| {
            let json = serde_json::to_string(&record)?;
            conn.execute(
                "INSERT INTO providers (capability_name, id, status, performance_score, record)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT (capability_name, id) DO UPDATE SET
                    status = excluded.status,
                    performance_score = excluded.performance_score,
                    record = excluded.record",
                params![
                    record.capability_name,
                    record.id,
                    record.status.as_str(),
                    record.performance_score,
                    json
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn capability_known(&self, capability: &str) -> Result<bool, StoreError> {
        let capability = capability.to_string();
        self.with_conn(move |conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM providers WHERE capability_name = ?1",
                params![capability],
                |row| row.get(0),
            )?;
            Ok(count > 0)
        })
        .await
    }

    async fn record_audit_event(&self, kind: &str, payload: &Value) -> Result<(), StoreError> {
        let kind = kind.to_string();
        let payload = serde_json::to_string(payload)?;
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO audit_events (id, kind, payload, recorded_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    uuid::Uuid::new_v4().to_string(),
                    kind,
                    payload,
                    Utc::now().to_rfc3339()
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn get_rotation_pointer(&self, capability: &str) -> Result<Option<u64>, StoreError> {
        let capability = capability.to_string();
        self.with_conn(move |conn| {
            let position: Option<i64> = conn
                .query_row(
                    "SELECT position FROM rotation_pointers WHERE capability_name = ?1",
                    params![capability],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(position.map(|p| p.max(0) as u64))
        })
        .await
    }

    async fn set_rotation_pointer(&self, capability: &str, index: u64) -> Result<(), StoreError> {
        let capability = capability.to_string();
        // SQLite integers are signed; keep the stored position non-negative.
        let position = (index % i64::MAX as u64) as i64;
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO rotation_pointers (capability_name, position) VALUES (?1, ?2)
                 ON CONFLICT (capability_name) DO UPDATE SET position = excluded.position",
                params![capability, position],
            )?;
            Ok(())
        })
        .await
    }

    async fn record_provider_sample(
        &self,
        capability: &str,
        provider_id: &str,
        sample: &ProviderSample,
    ) -> Result<(), StoreError> {
        let capability = capability.to_string();
        let provider_id = provider_id.to_string();
        let sample = sample.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO provider_samples
                    (capability_name, provider_id, at, latency_ms, success, available)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    capability,
                    provider_id,
                    sample.at.to_rfc3339(),
                    sample.latency_ms,
                    sample.success,
                    sample.available
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn provider_stats(
        &self,
        capability: &str,
        since: DateTime<Utc>,
    ) -> Result<HashMap<String, ProviderStats>, StoreError> {
        let capability = capability.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT provider_id, at, latency_ms, success, available
                 FROM provider_samples WHERE capability_name = ?1",
            )?;
            let rows = stmt.query_map(params![capability], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, f64>(2)?,
                    row.get::<_, bool>(3)?,
                    row.get::<_, bool>(4)?,
                ))
            })?;

            let mut grouped: HashMap<String, Vec<ProviderSample>> = HashMap::new();
            for row in rows {
                let (provider_id, at, latency_ms, success, available) = row?;
                let at = DateTime::parse_from_rfc3339(&at)
                    .map_err(|e| StoreError::Serialization(e.to_string()))?
                    .with_timezone(&Utc);
                if at < since {
                    continue;
                }
                grouped.entry(provider_id).or_default().push(ProviderSample {
                    at,
                    latency_ms,
                    success,
                    available,
                });
            }

            Ok(grouped
                .into_iter()
                .map(|(id, samples)| (id, ProviderStats::from_samples(&samples)))
                .collect())
        })
        .await
    }
}
