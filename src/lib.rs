//! # caplink
//!
//! Runtime capability resolution and binding for multi-agent automation.
//!
//! Agents ask for a named capability (`send_message`, `format_text`, ...)
//! instead of importing a concrete implementation. The [`CapabilityResolver`]
//! looks up registered providers, scores and selects one, guards against
//! dependency cycles, and hands back a [`Binding`] describing what to call.
//! Missing capabilities degrade gracefully through alternatives, delayed
//! retries, auto-generation or escalation.

pub mod capabilities;
pub mod config;
pub mod errors;
pub mod generation;
pub mod resolver;
pub mod store;
pub mod telemetry;

pub use capabilities::{
    CapabilityDefinition, CapabilityProvider, CapabilityRegistry, CapabilityRequest, FnProvider,
    InterfaceSpec, ProviderRecord, ProviderStatus, Requirements, SelectionAlgorithm,
};
pub use config::ResolverConfig;
pub use errors::{ErrorKind, ResolutionError};
pub use resolver::{
    Binding, BindingMode, CancelToken, CapabilityResolver, ResolutionFailure, ResolutionResult,
    ResolvedCapability,
};
pub use store::{InMemoryStore, MetadataStore, SqliteStore};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
