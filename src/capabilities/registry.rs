//! Capability Registry: definitions and provider handles known in-process.
//!
//! The registry holds:
//! 1. Capability definitions (description, alternatives, dependencies)
//! 2. The provider-id → handle table used to hand out callable providers
//! 3. Provider records parsed from YAML definition files, ready to be
//!    written to the metadata store
//!
//! Provider records themselves are persisted by the store; the registry only
//! produces them.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::capability::{validate_capability_name, CapabilityDefinition, ProviderRecord};
use super::provider::CapabilityProvider;
use crate::errors::ConfigError;

/// A capability definition together with the providers it ships with.
///
/// Example YAML:
/// ```yaml
/// capability:
///   name: "send_message"
///   description: "Deliver a message to a user"
///   alternatives: ["notify_user"]
///   providers:
///     - id: "mail::smtp"
///       provider_files: ["agents/mail/smtp.rs"]
///       performance_score: 0.9
///       stability_rating: 0.97
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CapabilityDocument {
    #[serde(flatten)]
    pub definition: CapabilityDefinition,

    #[serde(default)]
    pub providers: Vec<ProviderRecord>,
}

#[derive(Debug, Deserialize)]
struct SingleDocument {
    capability: CapabilityDocument,
}

#[derive(Debug, Deserialize)]
struct ListDocument {
    capabilities: Vec<CapabilityDocument>,
}

/// Definitions and handles, indexed by name and provider id.
#[derive(Default)]
pub struct CapabilityRegistry {
    definitions: HashMap<String, CapabilityDefinition>,
    handles: HashMap<String, Arc<dyn CapabilityProvider>>,
}

impl std::fmt::Debug for CapabilityRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapabilityRegistry")
            .field("definitions", &self.definitions.keys().collect::<Vec<_>>())
            .field("handles", &self.handles.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace a capability definition.
    pub fn define(&mut self, definition: CapabilityDefinition) {
        self.definitions.insert(definition.name.clone(), definition);
    }

    pub fn definition(&self, name: &str) -> Option<&CapabilityDefinition> {
        self.definitions.get(name)
    }

    pub fn is_defined(&self, name: &str) -> bool {
        self.definitions.contains_key(name)
    }

    /// Alternatives declared for `name`, in declaration order.
    pub fn alternatives(&self, name: &str) -> Vec<String> {
        self.definitions
            .get(name)
            .map(|d| d.alternatives.clone())
            .unwrap_or_default()
    }

    /// Capabilities `name` depends on through its definition.
    pub fn depends_on(&self, name: &str) -> Vec<String> {
        self.definitions
            .get(name)
            .map(|d| d.depends_on.clone())
            .unwrap_or_default()
    }

    /// Attach a callable handle to a provider id.
    pub fn register_handle(&mut self, handle: Arc<dyn CapabilityProvider>) {
        self.handles.insert(handle.id().to_string(), handle);
    }

    pub fn handle(&self, provider_id: &str) -> Option<Arc<dyn CapabilityProvider>> {
        self.handles.get(provider_id).cloned()
    }

    /// Build the definition and provider record for a module function.
    ///
    /// The capability is the function name in lower snake case and the
    /// provider id is `module::function_name`. Returns `None` when either
    /// identifier is unusable.
    pub fn register_function(
        &mut self,
        module: &str,
        function_name: &str,
        provider_path: &str,
    ) -> Option<ProviderRecord> {
        let module = module.trim();
        let function_name = function_name.trim();
        let provider_path = provider_path.trim();
        if module.is_empty() || function_name.is_empty() || provider_path.is_empty() {
            return None;
        }

        let capability = to_snake_case(function_name);
        if validate_capability_name(&capability).is_err() {
            log::warn!(
                "Rejected registration of {}::{}: unusable capability name",
                module,
                function_name
            );
            return None;
        }

        self.definitions
            .entry(capability.clone())
            .or_insert_with(|| CapabilityDefinition::new(capability.clone()));

        let mut record = ProviderRecord::new(format!("{}::{}", module, function_name), capability)
            .with_files(vec![provider_path.to_string()]);
        record.module = Some(module.to_string());
        record.interface_spec.operations = vec![function_name.to_string()];
        Some(record)
    }

    /// Parse a YAML document holding one `capability:` or a `capabilities:` list.
    ///
    /// Definitions are registered; the providers are returned with their
    /// `capability_name` filled in.
    pub fn register_from_yaml(&mut self, content: &str) -> Result<Vec<ProviderRecord>, ConfigError> {
        let documents = match serde_yaml::from_str::<SingleDocument>(content) {
            Ok(single) => vec![single.capability],
            Err(_) => {
                serde_yaml::from_str::<ListDocument>(content)
                    .map_err(|e| ConfigError::Parse(e.to_string()))?
                    .capabilities
            }
        };

        let mut records = Vec::new();
        for doc in documents {
            let name = doc.definition.name.clone();
            validate_capability_name(&name).map_err(|e| ConfigError::Invalid {
                field: "capability.name".to_string(),
                message: e.to_string(),
            })?;
            for mut provider in doc.providers {
                if provider.capability_name.is_empty() {
                    provider.capability_name = name.clone();
                } else if provider.capability_name != name {
                    return Err(ConfigError::Invalid {
                        field: format!("providers[{}].capability_name", provider.id),
                        message: format!(
                            "'{}' does not match enclosing capability '{}'",
                            provider.capability_name, name
                        ),
                    });
                }
                records.push(provider);
            }
            self.define(doc.definition);
        }
        Ok(records)
    }

    /// Load all YAML definition files under `dir` (recursive).
    ///
    /// Files that fail to parse are skipped with a warning.
    pub fn load_directory(&mut self, dir: &Path) -> Result<Vec<ProviderRecord>, ConfigError> {
        let mut records = Vec::new();
        if !dir.exists() {
            return Ok(records);
        }

        let entries = std::fs::read_dir(dir).map_err(|e| ConfigError::Io {
            path: dir.display().to_string(),
            message: e.to_string(),
        })?;
        let mut paths: Vec<_> = entries.filter_map(|e| e.ok().map(|e| e.path())).collect();
        paths.sort();

        for path in paths {
            if path.is_dir() {
                records.extend(self.load_directory(&path)?);
            } else if path
                .extension()
                .map_or(false, |ext| ext == "yaml" || ext == "yml")
            {
                let loaded = std::fs::read_to_string(&path)
                    .map_err(|e| ConfigError::Io {
                        path: path.display().to_string(),
                        message: e.to_string(),
                    })
                    .and_then(|content| self.register_from_yaml(&content));
                match loaded {
                    Ok(found) => records.extend(found),
                    Err(e) => {
                        log::warn!("Failed to load capability from {}: {}", path.display(), e);
                    }
                }
            }
        }

        Ok(records)
    }
}

/// `sendMessage`, `Send-Message` and `send message` all become `send_message`.
fn to_snake_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 4);
    let mut prev_lower_or_digit = false;
    for c in name.chars() {
        if c == '-' || c == ' ' || c == '_' {
            if !out.ends_with('_') && !out.is_empty() {
                out.push('_');
            }
            prev_lower_or_digit = false;
        } else if c.is_uppercase() {
            if prev_lower_or_digit {
                out.push('_');
            }
            out.extend(c.to_lowercase());
            prev_lower_or_digit = false;
        } else {
            out.push(c);
            prev_lower_or_digit = c.is_lowercase() || c.is_ascii_digit();
        }
    }
    out.trim_end_matches('_').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::provider::FnProvider;
    use serde_json::json;

    #[test]
    fn test_snake_case() {
        assert_eq!(to_snake_case("sendMessage"), "send_message");
        assert_eq!(to_snake_case("Send-Message"), "send_message");
        assert_eq!(to_snake_case("send message"), "send_message");
        assert_eq!(to_snake_case("fetch_v2"), "fetch_v2");
    }

    #[test]
    fn test_register_function() {
        let mut registry = CapabilityRegistry::new();
        let record = registry
            .register_function("mail", "sendMessage", "agents/mail.rs")
            .unwrap();
        assert_eq!(record.capability_name, "send_message");
        assert_eq!(record.id, "mail::sendMessage");
        assert_eq!(record.module.as_deref(), Some("mail"));
        assert_eq!(record.provider_files, vec!["agents/mail.rs".to_string()]);
        assert!(registry.is_defined("send_message"));

        assert!(registry.register_function("", "x", "p").is_none());
        assert!(registry.register_function("m", "!!!", "p").is_none());
    }

    #[test]
    fn test_register_from_yaml_single_and_list() {
        let mut registry = CapabilityRegistry::new();
        let single = r#"
capability:
  name: "send_message"
  alternatives: ["notify_user"]
  providers:
    - id: "mail::smtp"
      provider_files: ["agents/mail/smtp.rs"]
      performance_score: 0.9
"#;
        let records = registry.register_from_yaml(single).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].capability_name, "send_message");
        assert_eq!(registry.alternatives("send_message"), vec!["notify_user".to_string()]);

        let list = r#"
capabilities:
  - name: "a"
    depends_on: ["b"]
    providers:
      - id: "pa"
  - name: "b"
"#;
        let records = registry.register_from_yaml(list).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(registry.depends_on("a"), vec!["b".to_string()]);
        assert!(registry.is_defined("b"));
    }

    #[test]
    fn test_mismatched_capability_name_rejected() {
        let mut registry = CapabilityRegistry::new();
        let yaml = r#"
capability:
  name: "a"
  providers:
    - id: "p"
      capability_name: "b"
"#;
        assert!(registry.register_from_yaml(yaml).is_err());
    }

    #[test]
    fn test_load_directory_skips_broken_files() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("mail")).unwrap();
        std::fs::write(
            dir.path().join("mail/send.yaml"),
            "capability:\n  name: send_message\n  providers:\n    - id: smtp\n",
        )
        .unwrap();
        std::fs::write(dir.path().join("broken.yml"), "::: not yaml :::").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let mut registry = CapabilityRegistry::new();
        let records = registry.load_directory(dir.path()).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, "smtp");
    }

    #[test]
    fn test_handles() {
        let mut registry = CapabilityRegistry::new();
        registry.register_handle(Arc::new(FnProvider::new("echo", |v| Ok(json!(v)))));
        assert!(registry.handle("echo").is_some());
        assert!(registry.handle("missing").is_none());
    }
}
