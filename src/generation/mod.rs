//! Auto-generation hook for capabilities nobody provides yet.
//!
//! The resolver only asks two questions of a generator: whether a capability
//! looks generatable, and to start generating it. What happens afterwards
//! (code generation, human review, deployment) is outside the resolver.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::capabilities::Requirements;
use crate::errors::{ConfigError, GenerationError};

/// Oracle and trigger for generating missing capabilities.
#[async_trait]
pub trait AutoGenerator: Send + Sync {
    async fn can_auto_generate(&self, capability: &str) -> bool;

    /// Start generation. Must not wait for the generated provider.
    async fn request_generation(
        &self,
        capability: &str,
        requirements: &Requirements,
    ) -> Result<(), GenerationError>;
}

/// Generator that never generates.
#[derive(Debug, Default, Clone)]
pub struct NullGenerator;

#[async_trait]
impl AutoGenerator for NullGenerator {
    async fn can_auto_generate(&self, _capability: &str) -> bool {
        false
    }

    async fn request_generation(
        &self,
        capability: &str,
        _requirements: &Requirements,
    ) -> Result<(), GenerationError> {
        Err(GenerationError::Rejected {
            capability: capability.to_string(),
            message: "auto-generation is disabled".to_string(),
        })
    }
}

/// A queued request for a new provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub id: String,
    pub capability: String,
    pub requirements: Requirements,
    pub requested_at: DateTime<Utc>,
}

/// Receiving end of the generation queue.
pub struct GenerationQueue {
    rx: mpsc::Receiver<GenerationRequest>,
}

impl GenerationQueue {
    /// Next request, or `None` once every generator is dropped.
    pub async fn recv(&mut self) -> Option<GenerationRequest> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<GenerationRequest> {
        self.rx.try_recv().ok()
    }
}

/// Generator that accepts capabilities matching any configured pattern and
/// forwards requests onto a bounded channel.
#[derive(Debug, Clone)]
pub struct PatternGenerator {
    patterns: Vec<Regex>,
    tx: mpsc::Sender<GenerationRequest>,
}

impl PatternGenerator {
    /// Create a generator and its queue.
    pub fn pair<S: AsRef<str>>(
        patterns: &[S],
        buffer: usize,
    ) -> Result<(Self, GenerationQueue), ConfigError> {
        let patterns = patterns
            .iter()
            .map(|p| {
                Regex::new(p.as_ref()).map_err(|e| ConfigError::Invalid {
                    field: "gap.generation_patterns".to_string(),
                    message: e.to_string(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        let (tx, rx) = mpsc::channel(buffer.max(1));
        Ok((Self { patterns, tx }, GenerationQueue { rx }))
    }
}

#[async_trait]
impl AutoGenerator for PatternGenerator {
    async fn can_auto_generate(&self, capability: &str) -> bool {
        self.patterns.iter().any(|p| p.is_match(capability))
    }

    async fn request_generation(
        &self,
        capability: &str,
        requirements: &Requirements,
    ) -> Result<(), GenerationError> {
        let request = GenerationRequest {
            id: uuid::Uuid::new_v4().to_string(),
            capability: capability.to_string(),
            requirements: requirements.clone(),
            requested_at: Utc::now(),
        };
        self.tx.try_send(request).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => GenerationError::Rejected {
                capability: capability.to_string(),
                message: "generation queue is full".to_string(),
            },
            mpsc::error::TrySendError::Closed(_) => GenerationError::ChannelClosed,
        })?;
        log::info!("Queued generation request for {}", capability);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_null_generator_declines() {
        let generator = NullGenerator;
        assert!(!generator.can_auto_generate("anything").await);
        assert!(generator
            .request_generation("anything", &Requirements::default())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_pattern_generator_queues_matching_requests() {
        let (generator, mut queue) =
            PatternGenerator::pair(&["^format_", "_report$"], 4).unwrap();
        assert!(generator.can_auto_generate("format_invoice").await);
        assert!(generator.can_auto_generate("weekly_report").await);
        assert!(!generator.can_auto_generate("summon_dragon").await);

        generator
            .request_generation("format_invoice", &Requirements::default())
            .await
            .unwrap();
        let request = queue.recv().await.unwrap();
        assert_eq!(request.capability, "format_invoice");
        assert!(queue.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_full_and_closed_queue() {
        let (generator, queue) = PatternGenerator::pair(&[".*"], 1).unwrap();
        let req = Requirements::default();
        generator.request_generation("a", &req).await.unwrap();
        assert!(matches!(
            generator.request_generation("b", &req).await,
            Err(GenerationError::Rejected { .. })
        ));
        drop(queue);
        assert!(matches!(
            generator.request_generation("c", &req).await,
            Err(GenerationError::ChannelClosed)
        ));
    }

    #[test]
    fn test_invalid_pattern() {
        assert!(matches!(
            PatternGenerator::pair(&["("], 1),
            Err(ConfigError::Invalid { .. })
        ));
    }
}
