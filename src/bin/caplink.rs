//! caplink command-line resolver.
//!
//! Resolves a single capability request and prints the result as JSON.
//!
//! # Usage
//!
//! ```bash
//! caplink [--config FILE] [--db FILE] [--providers DIR] [--algorithm NAME] <CAPABILITY> <CONSUMER>
//! ```
//!
//! # Environment Variables
//!
//! - `CAPLINK_CONFIG` / `CAPLINK_DB` stand in for `--config` / `--db`
//! - other `CAPLINK_*` variables override resolver configuration values
//! - `RUST_LOG` sets the tracing filter (default: "info,caplink=debug")

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};

use caplink::generation::{AutoGenerator, NullGenerator, PatternGenerator};
use caplink::{
    CapabilityRequest, CapabilityResolver, InMemoryStore, MetadataStore, ResolverConfig,
    SelectionAlgorithm, SqliteStore,
};

/// Resolve one capability request and print the result as JSON.
#[derive(Debug, Parser)]
#[command(name = "caplink", version, about)]
struct Cli {
    /// Resolver configuration (YAML).
    #[arg(long, env = "CAPLINK_CONFIG")]
    config: Option<PathBuf>,

    /// SQLite metadata store; the in-memory store is used when absent.
    #[arg(long, env = "CAPLINK_DB")]
    db: Option<PathBuf>,

    /// Directory of YAML capability definitions to load before resolving.
    #[arg(long)]
    providers: Option<PathBuf>,

    /// Selection algorithm, overriding the configured default.
    #[arg(long, value_enum)]
    algorithm: Option<Algorithm>,

    /// Capability name, e.g. `send_message` or `file_resolution_playbook`.
    capability: String,

    /// Requesting consumer.
    consumer: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[value(rename_all = "snake_case")]
enum Algorithm {
    WeightedPerformance,
    RoundRobin,
    HighestScored,
}

impl From<Algorithm> for SelectionAlgorithm {
    fn from(algorithm: Algorithm) -> Self {
        match algorithm {
            Algorithm::WeightedPerformance => SelectionAlgorithm::WeightedPerformance,
            Algorithm::RoundRobin => SelectionAlgorithm::RoundRobin,
            Algorithm::HighestScored => SelectionAlgorithm::HighestScored,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,caplink=debug".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Cli::parse();

    let config = match &args.config {
        Some(path) => ResolverConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => ResolverConfig::default(),
    }
    .apply_env_overrides()?;

    let store: Arc<dyn MetadataStore> = match &args.db {
        Some(path) => {
            tracing::info!("Using SQLite store at {}", path.display());
            Arc::new(SqliteStore::open(path)?)
        }
        None => Arc::new(InMemoryStore::new()),
    };

    let generator: Arc<dyn AutoGenerator> = if config.gap.generation_patterns.is_empty() {
        Arc::new(NullGenerator)
    } else {
        let (generator, mut queue) = PatternGenerator::pair(&config.gap.generation_patterns, 16)?;
        tokio::spawn(async move {
            while let Some(request) = queue.recv().await {
                tracing::info!(
                    "Generation requested for {} ({})",
                    request.capability,
                    request.id
                );
            }
        });
        Arc::new(generator)
    };

    let resolver = CapabilityResolver::builder(store)
        .config(config)
        .generator(generator)
        .build()?;

    if let Some(dir) = &args.providers {
        let loaded = resolver.load_provider_directory(dir).await?;
        tracing::info!("{} provider(s) available from {}", loaded, dir.display());
    }

    let mut request = CapabilityRequest::new(args.capability, args.consumer);
    request.requirements.algorithm = args.algorithm.map(SelectionAlgorithm::from);

    let result = resolver.resolve_capability(&request).await;
    println!("{}", serde_json::to_string_pretty(&result)?);

    tracing::debug!("Metrics: {:?}", resolver.metrics());
    if !result.is_resolved() {
        std::process::exit(1);
    }
    Ok(())
}
