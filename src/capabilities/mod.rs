//! # Capabilities
//!
//! Named units of behavior, the providers that implement them, and the
//! in-process registry of definitions and callable handles.
//!
//! ## Registration Flow
//!
//! 1. A module registers a function (`register_function`) or a YAML file
//!    declares capabilities with their providers (`load_directory`)
//! 2. The resulting `ProviderRecord`s are written to the metadata store
//! 3. Optional `CapabilityProvider` handles are attached by provider id
//! 4. The resolver later ranks the stored providers and binds one

pub mod capability;
pub mod provider;
pub mod registry;

pub use capability::{
    validate_capability_name, CapabilityDefinition, CapabilityRequest, InterfaceSpec,
    ProviderRecord, ProviderStatus, Requirements, ResolutionType, SelectionAlgorithm,
    FILE_RESOLUTION_PREFIX,
};
pub use provider::{CapabilityProvider, FnProvider};
pub use registry::{CapabilityDocument, CapabilityRegistry};
