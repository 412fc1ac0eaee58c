//! CapabilityProvider trait: the typed handle behind a provider record.
//!
//! Handles are registered once, keyed by provider id, so the resolver hands
//! back a callable reference instead of a path the caller must load.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::errors::ProviderError;

/// A callable implementation of a capability.
#[async_trait]
pub trait CapabilityProvider: Send + Sync {
    /// Provider id this handle was registered under.
    fn id(&self) -> &str;

    /// Execute the capability with a JSON payload.
    async fn invoke(&self, input: Value) -> Result<Value, ProviderError>;
}

type ProviderFn = dyn Fn(Value) -> Result<Value, ProviderError> + Send + Sync;

/// Provider backed by a plain function or closure.
#[derive(Clone)]
pub struct FnProvider {
    id: String,
    func: Arc<ProviderFn>,
}

impl FnProvider {
    pub fn new<F>(id: impl Into<String>, func: F) -> Self
    where
        F: Fn(Value) -> Result<Value, ProviderError> + Send + Sync + 'static,
    {
        Self {
            id: id.into(),
            func: Arc::new(func),
        }
    }
}

impl fmt::Debug for FnProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnProvider")
            .field("id", &self.id)
            .field("func", &"<fn>")
            .finish()
    }
}

#[async_trait]
impl CapabilityProvider for FnProvider {
    fn id(&self) -> &str {
        &self.id
    }

    async fn invoke(&self, input: Value) -> Result<Value, ProviderError> {
        (self.func)(input)
    }
}
