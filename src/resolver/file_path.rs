//! File path resolution for `file_resolution_<id>` requests.
//!
//! Registered providers whose files exist win. Otherwise candidate paths are
//! constructed under each configured root and checked in preference order:
//! client-specific, exact match, system default.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::capabilities::{CapabilityRequest, ProviderRecord};
use crate::config::{FilePathConfig, StoreConfig};
use crate::errors::ResolutionError;
use crate::store::{self, MetadataStore, ProviderFilter};

static FILE_RESOLUTION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^file_resolution_(?P<id>[A-Za-z0-9_.\-]+)$").expect("file resolution pattern")
});

/// Where a resolved path came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum FileSource {
    Registered { provider_id: String },
    ClientSpecific,
    ExactMatch,
    SystemDefault,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileResolution {
    pub file_id: String,
    pub path: PathBuf,
    pub source: FileSource,
}

impl FileResolution {
    /// Provider record standing in for the file in a binding.
    pub fn as_provider(&self, capability: &str) -> ProviderRecord {
        let id = match &self.source {
            FileSource::Registered { provider_id } => provider_id.clone(),
            _ => format!("file::{}", self.path.display()),
        };
        ProviderRecord::new(id, capability)
            .with_files(vec![self.path.display().to_string()])
            .with_scores(1.0, 1.0)
    }
}

pub struct FilePathResolver {
    config: FilePathConfig,
    store: Arc<dyn MetadataStore>,
    store_config: StoreConfig,
}

impl FilePathResolver {
    pub fn new(config: FilePathConfig, store: Arc<dyn MetadataStore>, store_config: StoreConfig) -> Self {
        Self {
            config,
            store,
            store_config,
        }
    }

    /// The file id a request refers to.
    pub fn file_id(request: &CapabilityRequest) -> Result<String, ResolutionError> {
        let id = match FILE_RESOLUTION.captures(&request.capability) {
            Some(caps) => caps["id"].to_string(),
            None => request.capability.clone(),
        };
        if id.is_empty() || id.contains("..") || id.contains('/') || id.contains('\\') {
            return Err(ResolutionError::InvalidRequest(format!(
                "unusable file id '{}'",
                id.escape_debug()
            )));
        }
        Ok(id)
    }

    /// Constructed candidates in preference order.
    pub fn candidates(&self, consumer: &str, file_id: &str) -> Vec<(PathBuf, FileSource)> {
        let mut out = Vec::new();
        let consumer_usable =
            !consumer.contains("..") && !consumer.contains('/') && !consumer.contains('\\');

        if consumer_usable {
            for root in &self.config.roots {
                let dir = root.join("clients").join(consumer);
                self.push_variants(&mut out, &dir, file_id, FileSource::ClientSpecific);
            }
        }
        for root in &self.config.roots {
            self.push_variants(&mut out, root, file_id, FileSource::ExactMatch);
        }
        for root in &self.config.roots {
            let dir = root.join("defaults");
            self.push_variants(&mut out, &dir, file_id, FileSource::SystemDefault);
        }
        out
    }

    fn push_variants(
        &self,
        out: &mut Vec<(PathBuf, FileSource)>,
        dir: &Path,
        file_id: &str,
        source: FileSource,
    ) {
        for ext in &self.config.extensions {
            out.push((dir.join(format!("{}{}", file_id, ext)), source.clone()));
        }
    }

    /// First accessible location for the request.
    pub async fn resolve(&self, request: &CapabilityRequest) -> Result<FileResolution, ResolutionError> {
        let file_id = Self::file_id(request)?;

        let filter = ProviderFilter {
            compatible_with: Some(request.consumer.clone()),
            ..ProviderFilter::active()
        };
        let registered = store::bounded(
            &self.store_config,
            "query_providers",
            self.store.query_providers(&request.capability, &filter),
        )
        .await?;
        for record in &registered {
            for file in &record.provider_files {
                let path = PathBuf::from(file);
                if is_file(&path).await {
                    return Ok(FileResolution {
                        file_id,
                        path,
                        source: FileSource::Registered {
                            provider_id: record.id.clone(),
                        },
                    });
                }
            }
        }

        for (path, source) in self.candidates(&request.consumer, &file_id) {
            if is_file(&path).await {
                log::debug!("File {} resolved to {} ({:?})", file_id, path.display(), source);
                return Ok(FileResolution {
                    file_id,
                    path,
                    source,
                });
            }
        }

        Err(ResolutionError::NoProvidersAvailable {
            capability: request.capability.clone(),
        })
    }
}

async fn is_file(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.is_file())
        .unwrap_or(false)
}
