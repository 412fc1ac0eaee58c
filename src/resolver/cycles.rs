//! Circular dependency detection over the capability graph.
//!
//! An edge `a -> b` means resolving `a` requires resolving `b` first. The
//! graph is assembled by the resolver from the request's resolution chain,
//! the selected provider's `interface_spec.requires`, registry `depends_on`
//! entries and the providers currently registered for those capabilities.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use serde::{Deserialize, Serialize};

use super::binding::BindingMode;
use crate::capabilities::CapabilityRequest;
use crate::config::CycleConfig;

/// Directed dependency graph with deterministic iteration order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DependencyGraph {
    edges: BTreeMap<String, BTreeSet<String>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_edge(&mut self, from: impl Into<String>, to: impl Into<String>) {
        self.edges.entry(from.into()).or_default().insert(to.into());
    }

    /// Add `nodes[0] -> nodes[1] -> ... -> nodes[n]`.
    pub fn add_path(&mut self, nodes: &[String]) {
        for pair in nodes.windows(2) {
            self.add_edge(pair[0].clone(), pair[1].clone());
        }
    }

    pub fn successors(&self, node: &str) -> impl Iterator<Item = &String> {
        self.edges.get(node).into_iter().flatten()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.values().map(BTreeSet::len).sum()
    }
}

/// Outcome of a detection pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleReport {
    pub found: bool,
    /// Each cycle once, rotated so its smallest node comes first.
    pub cycles: Vec<Vec<String>>,
    /// Traversal was cut at the depth bound without closing a cycle.
    pub depth_exceeded: bool,
}

impl CycleReport {
    /// First cycle, the one reported to callers.
    pub fn primary(&self) -> Option<&Vec<String>> {
        self.cycles.first()
    }
}

/// Ways a detected cycle can be broken, in the order they are tried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleStrategy {
    LazyInitialization,
    InterfaceInjection,
    ProviderReorganization,
    CapabilitySplitting,
}

/// Bounded depth-first cycle detector.
#[derive(Debug, Clone)]
pub struct CircularDependencyDetector {
    config: CycleConfig,
}

impl CircularDependencyDetector {
    pub fn new(config: CycleConfig) -> Self {
        Self { config }
    }

    pub fn max_depth(&self) -> usize {
        self.config.max_depth
    }

    /// Walk from `starting_consumer` through `chain` and `graph`.
    ///
    /// `chain` contributes the edges `starting_consumer -> chain[0] -> chain[1] ...`.
    pub fn detect(
        &self,
        starting_consumer: &str,
        chain: &[String],
        graph: &DependencyGraph,
    ) -> CycleReport {
        let mut combined = graph.clone();
        let mut path = Vec::with_capacity(chain.len() + 1);
        path.push(starting_consumer.to_string());
        path.extend(chain.iter().cloned());
        combined.add_path(&path);

        let mut walk = Walk {
            graph: &combined,
            max_depth: self.config.max_depth,
            stack: Vec::new(),
            finished: HashSet::new(),
            seen: HashSet::new(),
            report: CycleReport::default(),
        };
        walk.visit(starting_consumer);

        let mut report = walk.report;
        report.found = !report.cycles.is_empty();
        if report.depth_exceeded && !report.found {
            log::warn!(
                "Dependency chain from {} exceeds depth {} without closing a cycle",
                starting_consumer,
                self.config.max_depth
            );
        }
        report
    }

    /// Mode-only strategies that accept the cycle as-is, in priority order.
    ///
    /// Provider reorganization needs the store and is handled by the resolver.
    pub fn binding_strategy(&self, request: &CapabilityRequest) -> Option<(CycleStrategy, BindingMode)> {
        if self.config.lazy_initialization && request.requirements.allow_lazy {
            return Some((CycleStrategy::LazyInitialization, BindingMode::Lazy));
        }
        if self.config.interface_injection && request.requirements.interface_spec.is_some() {
            return Some((CycleStrategy::InterfaceInjection, BindingMode::InterfaceStub));
        }
        None
    }

    pub fn reorganization_enabled(&self) -> bool {
        self.config.provider_reorganization
    }

    /// Split suggestion attached to an unresolved cycle. Never applied.
    pub fn split_suggestion(&self, cycle: &[String]) -> Option<String> {
        let widest = cycle.iter().max_by(|a, b| a.len().cmp(&b.len()).then_with(|| b.cmp(a)))?;
        Some(format!(
            "split '{}' into a narrower capability that does not depend on {}",
            widest,
            cycle
                .iter()
                .filter(|n| *n != widest)
                .map(|n| format!("'{}'", n))
                .collect::<Vec<_>>()
                .join(", ")
        ))
    }
}

struct Walk<'g> {
    graph: &'g DependencyGraph,
    max_depth: usize,
    stack: Vec<String>,
    /// Nodes whose whole reachable subgraph was explored within the bound.
    finished: HashSet<String>,
    seen: HashSet<Vec<String>>,
    report: CycleReport,
}

impl Walk<'_> {
    /// Returns false when the subtree was cut by the depth bound.
    fn visit(&mut self, node: &str) -> bool {
        if self.stack.len() >= self.max_depth {
            self.report.depth_exceeded = true;
            return false;
        }
        self.stack.push(node.to_string());
        let mut complete = true;

        let graph = self.graph;
        for next in graph.successors(node) {
            if let Some(position) = self.stack.iter().position(|n| n == next) {
                self.record(canonical(&self.stack[position..]));
                continue;
            }
            if self.finished.contains(next) {
                continue;
            }
            complete &= self.visit(next);
        }

        self.stack.pop();
        if complete {
            self.finished.insert(node.to_string());
        }
        complete
    }

    fn record(&mut self, cycle: Vec<String>) {
        if self.seen.insert(cycle.clone()) {
            self.report.cycles.push(cycle);
        }
    }
}

/// Rotate a cycle so the smallest node comes first.
fn canonical(cycle: &[String]) -> Vec<String> {
    let start = cycle
        .iter()
        .enumerate()
        .min_by(|a, b| a.1.cmp(b.1))
        .map_or(0, |(i, _)| i);
    cycle[start..].iter().chain(&cycle[..start]).cloned().collect()
}
