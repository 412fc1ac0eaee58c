//! Capability and provider definitions: the data the resolver works on.
//!
//! A *capability* is a named unit of behavior an agent can ask for
//! (`send_message`, `billing:refund`). A *provider* is one concrete
//! implementation registered against a capability; several providers may
//! compete for the same capability name.
//!
//! Provider records are usually loaded from YAML or registered at runtime:
//!
//! ```yaml
//! id: "mail::smtp"
//! capability_name: "send_message"
//! provider_files: ["agents/mail/smtp.rs"]
//! interface_spec:
//!   operations: ["send"]
//!   inputs: ["recipient", "body"]
//! performance_score: 0.9
//! stability_rating: 0.97
//! compatible_with: ["support_*"]
//! ```

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::ResolutionError;

static CAPABILITY_NAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.:\-]{0,127}$").expect("static capability regex")
});

/// Prefix marking a capability that resolves a file location, not a behavior.
pub const FILE_RESOLUTION_PREFIX: &str = "file_resolution_";

/// Lifecycle status of a provider. Providers are never hard-deleted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderStatus {
    /// Eligible for selection.
    #[default]
    Active,
    /// Known but currently failing; excluded until it recovers.
    Degraded,
    /// Administratively switched off.
    Disabled,
}

impl ProviderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderStatus::Active => "active",
            ProviderStatus::Degraded => "degraded",
            ProviderStatus::Disabled => "disabled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "active" => Some(ProviderStatus::Active),
            "degraded" => Some(ProviderStatus::Degraded),
            "disabled" => Some(ProviderStatus::Disabled),
            _ => None,
        }
    }
}

/// Shape of a provider's interface, or of what a consumer requires.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InterfaceSpec {
    /// Named operations offered (or required).
    #[serde(default)]
    pub operations: Vec<String>,

    /// Input fields accepted.
    #[serde(default)]
    pub inputs: Vec<String>,

    /// Output fields produced.
    #[serde(default)]
    pub outputs: Vec<String>,

    /// Other capabilities this interface needs resolved before it can run.
    #[serde(default)]
    pub requires: Vec<String>,

    /// Free-form extra attributes carried through to the binding.
    #[serde(default, flatten)]
    pub extra: HashMap<String, Value>,
}

impl InterfaceSpec {
    /// True when no operation, input or output is declared.
    pub fn is_empty_shape(&self) -> bool {
        self.operations.is_empty() && self.inputs.is_empty() && self.outputs.is_empty()
    }

    /// Fraction of `required`'s declared items that `self` offers.
    ///
    /// An empty requirement is fully satisfied by anything.
    pub fn overlap_with(&self, required: &InterfaceSpec) -> f64 {
        let wanted = required.operations.len() + required.inputs.len() + required.outputs.len();
        if wanted == 0 {
            return 1.0;
        }
        let matched = count_present(&required.operations, &self.operations)
            + count_present(&required.inputs, &self.inputs)
            + count_present(&required.outputs, &self.outputs);
        matched as f64 / wanted as f64
    }
}

fn count_present(wanted: &[String], offered: &[String]) -> usize {
    wanted.iter().filter(|w| offered.contains(w)).count()
}

/// A provider registered against a capability, as persisted in the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderRecord {
    /// Unique provider identifier within its capability (e.g. `mail::send_message`).
    pub id: String,

    /// Capability this provider implements; the lookup key.
    #[serde(default)]
    pub capability_name: String,

    /// Implementation locations, primary first.
    #[serde(default)]
    pub provider_files: Vec<String>,

    /// Interface the provider offers.
    #[serde(default)]
    pub interface_spec: InterfaceSpec,

    /// Historical stability in [0,1], used when no samples exist.
    #[serde(default = "default_stability")]
    pub stability_rating: f64,

    /// Performance score in [0,1], updated by performance tracking.
    #[serde(default = "default_performance")]
    pub performance_score: f64,

    #[serde(default)]
    pub status: ProviderStatus,

    /// Consumer allow-list. Empty or `"*"` admits everyone; `prefix*` entries match by prefix.
    #[serde(default)]
    pub compatible_with: Vec<String>,

    /// Module the provider was registered from, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub module: Option<String>,

    /// Concurrent invocation ceiling used by the load score.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrency: Option<u32>,

    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

fn default_stability() -> f64 {
    0.9
}

fn default_performance() -> f64 {
    0.5
}

impl ProviderRecord {
    /// Create an active provider with default scores.
    pub fn new(id: impl Into<String>, capability_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            capability_name: capability_name.into(),
            provider_files: Vec::new(),
            interface_spec: InterfaceSpec::default(),
            stability_rating: default_stability(),
            performance_score: default_performance(),
            status: ProviderStatus::Active,
            compatible_with: Vec::new(),
            module: None,
            max_concurrency: None,
            updated_at: Utc::now(),
        }
    }

    pub fn with_files(mut self, files: Vec<String>) -> Self {
        self.provider_files = files;
        self
    }

    pub fn with_interface(mut self, spec: InterfaceSpec) -> Self {
        self.interface_spec = spec;
        self
    }

    pub fn with_scores(mut self, performance: f64, stability: f64) -> Self {
        self.performance_score = performance.clamp(0.0, 1.0);
        self.stability_rating = stability.clamp(0.0, 1.0);
        self
    }

    pub fn with_status(mut self, status: ProviderStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_compatible(mut self, consumers: Vec<String>) -> Self {
        self.compatible_with = consumers;
        self
    }

    pub fn with_max_concurrency(mut self, max: u32) -> Self {
        self.max_concurrency = Some(max);
        self
    }

    /// First implementation location, or the provider id when none is listed.
    pub fn primary_file(&self) -> &str {
        self.provider_files
            .first()
            .map(|s| s.as_str())
            .unwrap_or(self.id.as_str())
    }

    pub fn is_active(&self) -> bool {
        self.status == ProviderStatus::Active
    }

    /// Whether the allow-list admits `consumer`.
    pub fn admits(&self, consumer: &str) -> bool {
        if self.compatible_with.is_empty() {
            return true;
        }
        self.compatible_with.iter().any(|entry| {
            if entry == "*" || entry == consumer {
                true
            } else if let Some(prefix) = entry.strip_suffix('*') {
                consumer.starts_with(prefix)
            } else {
                false
            }
        })
    }
}

/// Registry-side definition of a capability (independent of its providers).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CapabilityDefinition {
    pub name: String,

    #[serde(default)]
    pub description: String,

    /// Capabilities that can stand in when this one has no provider.
    #[serde(default)]
    pub alternatives: Vec<String>,

    /// Capabilities any provider of this one will need.
    #[serde(default)]
    pub depends_on: Vec<String>,

    #[serde(default)]
    pub tags: Vec<String>,
}

impl CapabilityDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }
}

/// How a provider is picked from ranked candidates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionAlgorithm {
    /// Highest composite score, optionally spread across near-best candidates.
    #[default]
    WeightedPerformance,
    /// Cycle through candidates per capability.
    RoundRobin,
    /// Deterministic top-1.
    HighestScored,
}

/// What kind of thing the request resolves to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionType {
    #[default]
    Capability,
    FilePath,
}

/// Optional constraints attached to a request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Requirements {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_performance: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interface_spec: Option<InterfaceSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub algorithm: Option<SelectionAlgorithm>,

    #[serde(default)]
    pub resolution_type: ResolutionType,

    /// Overrides the configured load-balancing switch for this request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub load_balancing: Option<bool>,

    /// Consumer accepts a binding whose provider is attached on first use.
    #[serde(default)]
    pub allow_lazy: bool,

    /// Capabilities already being resolved upstream of this request.
    #[serde(default)]
    pub resolution_chain: Vec<String>,
}

/// Input to a resolution call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityRequest {
    pub capability: String,
    pub consumer: String,
    #[serde(default)]
    pub requirements: Requirements,
}

impl CapabilityRequest {
    pub fn new(capability: impl Into<String>, consumer: impl Into<String>) -> Self {
        Self {
            capability: capability.into(),
            consumer: consumer.into(),
            requirements: Requirements::default(),
        }
    }

    pub fn with_requirements(mut self, requirements: Requirements) -> Self {
        self.requirements = requirements;
        self
    }

    pub fn with_algorithm(mut self, algorithm: SelectionAlgorithm) -> Self {
        self.requirements.algorithm = Some(algorithm);
        self
    }

    /// True for `file_resolution_*` names or an explicit file-path resolution type.
    pub fn is_file_resolution(&self) -> bool {
        self.capability.starts_with(FILE_RESOLUTION_PREFIX)
            || self.requirements.resolution_type == ResolutionType::FilePath
    }

    /// Reject malformed capability or consumer identifiers.
    pub fn validate(&self) -> Result<(), ResolutionError> {
        validate_capability_name(&self.capability)?;
        let consumer = self.consumer.trim();
        if consumer.is_empty() {
            return Err(ResolutionError::InvalidRequest(
                "consumer must not be empty".to_string(),
            ));
        }
        if self.consumer.chars().any(|c| c.is_control() || c.is_whitespace()) {
            return Err(ResolutionError::InvalidRequest(format!(
                "consumer '{}' contains whitespace or control characters",
                self.consumer.escape_debug()
            )));
        }
        if let Some(min) = self.requirements.min_performance {
            if !(0.0..=1.0).contains(&min) {
                return Err(ResolutionError::InvalidRequest(format!(
                    "min_performance {} outside [0,1]",
                    min
                )));
            }
        }
        Ok(())
    }
}

/// Check a capability identifier against the naming rules.
pub fn validate_capability_name(name: &str) -> Result<(), ResolutionError> {
    if CAPABILITY_NAME.is_match(name) {
        Ok(())
    } else {
        Err(ResolutionError::InvalidRequest(format!(
            "malformed capability name '{}'",
            name.escape_debug()
        )))
    }
}
