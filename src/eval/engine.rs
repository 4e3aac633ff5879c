//! The evaluation engine: registration, cache-first dependency-ordered
//! evaluation, metrics, and graph export.
//!
//! The engine is an explicit instance owning its graph and cache; there is no
//! global registry. Multiple independent engines can coexist in one process.

use crate::core::config::EngineConfig;
use crate::core::errors::{LazyflowError, Result};
use crate::eval::cache::{CacheLookup, CacheStats, ComputationCache};
use crate::eval::graph::DependencyGraph;
use crate::eval::node::{Computation, NodeState, WorkflowNode};
use dashmap::DashMap;
use futures::stream::{FuturesUnordered, StreamExt};
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

/// Per-node evaluation counters. Mutated only by the engine; destroyed only
/// by [`EvaluationEngine::reset_metrics`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct NodeMetrics {
    /// Times the compute function was actually invoked
    pub evaluations: u64,
    /// Times a result was served from the cache instead
    pub cache_hits: u64,
    /// Times the compute function returned an error
    pub failures: u64,
    /// Wall-clock time spent inside the compute function
    pub total_time_ms: f64,
}

/// Aggregate view across all nodes
#[derive(Debug, Clone, Serialize)]
pub struct EngineSummary {
    pub total_nodes: usize,
    pub states: HashMap<String, usize>,
    pub total_evaluations: u64,
    pub total_cache_hits: u64,
    /// cache_hits / (cache_hits + evaluations), 0.0 when nothing has run
    pub cache_hit_rate: f64,
    pub total_compute_time_ms: f64,
    pub cache: CacheStats,
}

/// Serialized graph structure for external inspection
#[derive(Debug, Serialize)]
struct GraphExport {
    nodes: Vec<ExportedNode>,
    edges: Vec<ExportedEdge>,
}

#[derive(Debug, Serialize)]
struct ExportedNode {
    id: String,
    dependencies: Vec<String>,
    state: NodeState,
    cache_ttl_secs: Option<f64>,
    metadata: HashMap<String, Value>,
    last_error: Option<String>,
}

#[derive(Debug, Serialize)]
struct ExportedEdge {
    from: String,
    to: String,
}

/// Orchestrates lazy evaluation of registered workflows
pub struct EvaluationEngine {
    graph: RwLock<DependencyGraph>,
    cache: Arc<ComputationCache>,
    metrics: DashMap<String, NodeMetrics>,
    /// Singleflight: concurrent evaluations of the same node collapse into
    /// one computation, the rest observing its cached result
    node_locks: DashMap<String, Arc<Mutex<()>>>,
    config: EngineConfig,
}

impl EvaluationEngine {
    /// Build an engine from config; a configured `cache_dir` enables the
    /// durable cache tier.
    pub fn new(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let cache = match &config.cache_dir {
            Some(dir) => ComputationCache::persistent(dir)?,
            None => ComputationCache::in_memory(),
        };
        Ok(Self::with_cache(config, cache))
    }

    /// Ephemeral engine with default config
    pub fn in_memory() -> Self {
        Self::with_cache(EngineConfig::default(), ComputationCache::in_memory())
    }

    /// Build an engine around an existing cache (injectable clock, tests)
    pub fn with_cache(config: EngineConfig, cache: ComputationCache) -> Self {
        Self {
            graph: RwLock::new(DependencyGraph::new()),
            cache: Arc::new(cache),
            metrics: DashMap::new(),
            node_locks: DashMap::new(),
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Register (or overwrite) a workflow. Never evaluates anything.
    ///
    /// `cache_ttl: None` falls back to the engine default TTL. Replacing an
    /// existing registration drops the node's cache entries, since the new
    /// computation may produce different results under unchanged inputs.
    pub async fn register_workflow(
        &self,
        id: impl Into<String>,
        computation: Arc<dyn Computation>,
        dependencies: Vec<String>,
        cache_ttl: Option<Duration>,
        metadata: HashMap<String, Value>,
    ) {
        let id = id.into();
        let ttl = cache_ttl.or_else(|| self.config.default_ttl());
        let node = WorkflowNode::new(&id, computation, dependencies, ttl, metadata);
        let mut graph = self.graph.write().await;
        if graph.contains(&id) {
            self.cache.invalidate(&id);
        }
        debug!(node_id = %id, deps = ?node.dependencies, "registered workflow");
        graph.add_node(node);
    }

    /// Register an externally supplied value as a dependency-less node
    pub async fn register_value(&self, id: impl Into<String>, value: Value) {
        let id = id.into();
        let mut graph = self.graph.write().await;
        if graph.contains(&id) {
            self.cache.invalidate(&id);
        }
        graph.add_node(WorkflowNode::literal(&id, value));
    }

    /// Unregister a node; its cache entries are dropped too
    pub async fn remove_workflow(&self, id: &str) -> Result<()> {
        let mut graph = self.graph.write().await;
        graph.remove_node(id)?;
        self.cache.invalidate(id);
        self.node_locks.remove(id);
        self.metrics.remove(id);
        Ok(())
    }

    /// Evaluate one workflow, resolving its transitive dependencies first.
    ///
    /// `force` bypasses the cache for the requested node only; dependencies
    /// still resolve cache-first.
    pub async fn evaluate(&self, id: &str, force: bool) -> Result<Value> {
        let plan = {
            let graph = self.graph.read().await;
            Self::plan_order(&graph, id)?
        };
        debug!(node_id = id, plan_len = plan.len(), "evaluation plan resolved");

        let resolved: DashMap<String, Value> = DashMap::new();
        // node id -> the dependency that took it down
        let mut failed: HashMap<String, String> = HashMap::new();
        let mut errors: HashMap<String, LazyflowError> = HashMap::new();

        for node_id in &plan {
            let deps = {
                let graph = self.graph.read().await;
                graph.get_dependencies(node_id)?
            };
            if let Some(bad_dep) = deps.iter().find(|d| failed.contains_key(*d)) {
                let err = LazyflowError::dependency_failure(node_id, bad_dep);
                self.mark_node_failed(node_id, &err).await;
                failed.insert(node_id.clone(), bad_dep.clone());
                errors.insert(node_id.clone(), err);
                continue;
            }
            let force_node = force && node_id == id;
            match self.evaluate_node(node_id, force_node, &resolved).await {
                Ok(value) => {
                    resolved.insert(node_id.clone(), value);
                }
                Err(err) => {
                    failed.insert(node_id.clone(), node_id.clone());
                    errors.insert(node_id.clone(), err);
                }
            }
        }

        if let Some(err) = errors.remove(id) {
            return Err(err);
        }
        resolved
            .remove(id)
            .map(|(_, v)| v)
            .ok_or_else(|| LazyflowError::internal(format!("no result produced for '{}'", id)))
    }

    /// Evaluate every registered workflow in dependency order.
    ///
    /// Structural problems (missing dependency, cycle) fail the whole call;
    /// per-node compute failures land in the result map, and their dependents
    /// are marked failed without being attempted.
    pub async fn evaluate_all(&self, force: bool) -> Result<HashMap<String, Result<Value>>> {
        let order = {
            let graph = self.graph.read().await;
            graph.validate()?;
            graph.topological_sort()?
        };
        info!(nodes = order.len(), force, "starting full evaluation pass");

        if self.config.enable_parallel_execution {
            self.evaluate_all_parallel(order, force).await
        } else {
            self.evaluate_all_sequential(order, force).await
        }
    }

    async fn evaluate_all_sequential(
        &self,
        order: Vec<String>,
        force: bool,
    ) -> Result<HashMap<String, Result<Value>>> {
        let resolved: DashMap<String, Value> = DashMap::new();
        let mut failed: HashSet<String> = HashSet::new();
        let mut results: HashMap<String, Result<Value>> = HashMap::new();

        for node_id in order {
            let deps = {
                let graph = self.graph.read().await;
                graph.get_dependencies(&node_id)?
            };
            if let Some(bad_dep) = deps.iter().find(|d| failed.contains(*d)) {
                let err = LazyflowError::dependency_failure(&node_id, bad_dep);
                self.mark_node_failed(&node_id, &err).await;
                failed.insert(node_id.clone());
                results.insert(node_id, Err(err));
                continue;
            }
            match self.evaluate_node(&node_id, force, &resolved).await {
                Ok(value) => {
                    resolved.insert(node_id.clone(), value.clone());
                    results.insert(node_id, Ok(value));
                }
                Err(err) => {
                    failed.insert(node_id.clone());
                    results.insert(node_id, Err(err));
                }
            }
        }
        Ok(results)
    }

    /// Wave-based parallel pass: nodes whose dependencies all live in earlier
    /// waves run concurrently, bounded by `max_parallel_nodes`.
    async fn evaluate_all_parallel(
        &self,
        order: Vec<String>,
        force: bool,
    ) -> Result<HashMap<String, Result<Value>>> {
        let waves = {
            let graph = self.graph.read().await;
            Self::build_waves(&graph, &order)?
        };
        let resolved: DashMap<String, Value> = DashMap::new();
        let mut failed: HashSet<String> = HashSet::new();
        let mut results: HashMap<String, Result<Value>> = HashMap::new();

        for wave in waves {
            let mut runnable = Vec::new();
            for node_id in wave {
                let deps = {
                    let graph = self.graph.read().await;
                    graph.get_dependencies(&node_id)?
                };
                if let Some(bad_dep) = deps.iter().find(|d| failed.contains(*d)) {
                    let err = LazyflowError::dependency_failure(&node_id, bad_dep);
                    self.mark_node_failed(&node_id, &err).await;
                    failed.insert(node_id.clone());
                    results.insert(node_id, Err(err));
                } else {
                    runnable.push(node_id);
                }
            }

            let mut in_flight = FuturesUnordered::new();
            let mut pending = runnable.into_iter();
            loop {
                while in_flight.len() < self.config.max_parallel_nodes {
                    match pending.next() {
                        Some(node_id) => {
                            let resolved_ref = &resolved;
                            in_flight.push(async move {
                                let outcome =
                                    self.evaluate_node(&node_id, force, resolved_ref).await;
                                (node_id, outcome)
                            });
                        }
                        None => break,
                    }
                }
                match in_flight.next().await {
                    Some((node_id, Ok(value))) => {
                        resolved.insert(node_id.clone(), value.clone());
                        results.insert(node_id, Ok(value));
                    }
                    Some((node_id, Err(err))) => {
                        failed.insert(node_id.clone());
                        results.insert(node_id, Err(err));
                    }
                    None => break,
                }
            }
        }
        Ok(results)
    }

    /// Evaluate a single node whose dependencies are already in `resolved`.
    /// Cache-first unless `force`; records metrics and state transitions.
    async fn evaluate_node(
        &self,
        node_id: &str,
        force: bool,
        resolved: &DashMap<String, Value>,
    ) -> Result<Value> {
        let lock = self
            .node_locks
            .entry(node_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        let (deps, ttl, computation, literal) = {
            let graph = self.graph.read().await;
            let node = graph.get(node_id)?;
            if node.state == NodeState::Evaluating {
                // runtime cycle backstop: this evaluation re-entered a node
                // already mid-flight
                return Err(LazyflowError::cyclic(vec![
                    node_id.to_string(),
                    node_id.to_string(),
                ]));
            }
            (
                node.dependencies.clone(),
                node.cache_ttl,
                node.computation.clone(),
                node.literal.clone(),
            )
        };

        let mut dep_values = Vec::with_capacity(deps.len());
        for dep in &deps {
            let value = resolved
                .get(dep)
                .map(|v| v.value().clone())
                .ok_or_else(|| {
                    LazyflowError::internal(format!(
                        "dependency '{}' of '{}' was not resolved before use",
                        dep, node_id
                    ))
                })?;
            dep_values.push(value);
        }

        // externally supplied values resolve directly; caching them would
        // survive re-registration under the same (empty) fingerprint
        let Some(computation) = computation else {
            let value = literal.ok_or_else(|| {
                LazyflowError::internal(format!("node '{}' has neither computation nor value", node_id))
            })?;
            self.set_node_state(node_id, NodeState::Completed).await;
            return Ok(value);
        };

        let fingerprint = dependency_fingerprint(&deps, &dep_values);

        if !force {
            if let CacheLookup::Hit(value) = self.cache.get(node_id, &fingerprint, ttl) {
                debug!(node_id, "cache hit");
                self.set_node_state(node_id, NodeState::Cached).await;
                self.metrics
                    .entry(node_id.to_string())
                    .or_default()
                    .cache_hits += 1;
                return Ok(value);
            }
        }

        self.set_node_state(node_id, NodeState::Evaluating).await;
        debug!(node_id, force, "computing");
        let started = Instant::now();
        let outcome = computation.compute(&dep_values).await;
        let elapsed = started.elapsed();

        match outcome {
            Ok(value) => {
                self.set_node_state(node_id, NodeState::Completed).await;
                {
                    let mut m = self.metrics.entry(node_id.to_string()).or_default();
                    m.evaluations += 1;
                    m.total_time_ms += elapsed.as_secs_f64() * 1000.0;
                }
                if let Err(e) = self.cache.set(node_id, &fingerprint, value.clone(), ttl) {
                    // entry stays usable in memory; persistence is best-effort
                    warn!(node_id, error = %e, "cache persistence failed");
                }
                Ok(value)
            }
            Err(source) => {
                let err = LazyflowError::compute(node_id, source);
                self.mark_node_failed(node_id, &err).await;
                {
                    let mut m = self.metrics.entry(node_id.to_string()).or_default();
                    m.evaluations += 1;
                    m.failures += 1;
                    m.total_time_ms += elapsed.as_secs_f64() * 1000.0;
                }
                Err(err)
            }
        }
    }

    /// Drop cache entries for `id` and return it to `Pending`
    pub async fn invalidate_cache(&self, id: &str) -> Result<()> {
        self.cache.invalidate(id);
        let mut graph = self.graph.write().await;
        graph.get_mut(id)?.reset();
        Ok(())
    }

    /// Empty both cache tiers and return every node to `Pending`
    pub async fn clear_all_cache(&self) {
        self.cache.clear_all();
        let mut graph = self.graph.write().await;
        let ids: Vec<String> = graph.node_ids().cloned().collect();
        for id in ids {
            if let Ok(node) = graph.get_mut(&id) {
                node.reset();
            }
        }
    }

    pub fn get_metrics(&self) -> HashMap<String, NodeMetrics> {
        self.metrics
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    pub fn reset_metrics(&self) {
        self.metrics.clear();
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.get_stats()
    }

    pub async fn get_summary(&self) -> EngineSummary {
        let graph = self.graph.read().await;
        let mut states: HashMap<String, usize> = HashMap::new();
        for node in graph.nodes() {
            *states.entry(node.state.to_string()).or_insert(0) += 1;
        }
        let mut total_evaluations = 0;
        let mut total_cache_hits = 0;
        let mut total_compute_time_ms = 0.0;
        for entry in self.metrics.iter() {
            total_evaluations += entry.evaluations;
            total_cache_hits += entry.cache_hits;
            total_compute_time_ms += entry.total_time_ms;
        }
        let attempts = total_evaluations + total_cache_hits;
        EngineSummary {
            total_nodes: graph.len(),
            states,
            total_evaluations,
            total_cache_hits,
            cache_hit_rate: if attempts == 0 {
                0.0
            } else {
                total_cache_hits as f64 / attempts as f64
            },
            total_compute_time_ms,
            cache: self.cache.get_stats(),
        }
    }

    /// Write the dependency structure (ids, edges, states) as JSON
    pub async fn export_graph<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let export = {
            let graph = self.graph.read().await;
            let mut nodes: Vec<ExportedNode> = graph
                .nodes()
                .map(|node| ExportedNode {
                    id: node.id.clone(),
                    dependencies: node.dependencies.clone(),
                    state: node.state,
                    cache_ttl_secs: node.cache_ttl.map(|d| d.as_secs_f64()),
                    metadata: node.metadata.clone(),
                    last_error: node.last_error.clone(),
                })
                .collect();
            nodes.sort_by(|a, b| a.id.cmp(&b.id));
            let mut edges: Vec<ExportedEdge> = nodes
                .iter()
                .flat_map(|node| {
                    node.dependencies.iter().map(|dep| ExportedEdge {
                        from: dep.clone(),
                        to: node.id.clone(),
                    })
                })
                .collect();
            edges.sort_by(|a, b| (&a.from, &a.to).cmp(&(&b.from, &b.to)));
            GraphExport { nodes, edges }
        };
        let bytes = serde_json::to_vec_pretty(&export)?;
        std::fs::write(path.as_ref(), bytes)
            .map_err(|e| LazyflowError::io("write graph export", e))?;
        info!(path = %path.as_ref().display(), "graph exported");
        Ok(())
    }

    /// Render the dependency graph to Graphviz DOT, nodes colored by state
    pub async fn visualize_graph(&self) -> String {
        let graph = self.graph.read().await;
        let mut dot = String::from("digraph workflows {\n");
        dot.push_str("  graph [rankdir=LR, nodesep=0.5, ranksep=1.0];\n");
        dot.push_str("  node [shape=box, style=\"rounded,filled\", fontname=\"Helvetica\"];\n\n");

        let mut ids: Vec<&String> = graph.node_ids().collect();
        ids.sort();
        for id in &ids {
            let node = match graph.get(id) {
                Ok(n) => n,
                Err(_) => continue,
            };
            let color = match node.state {
                NodeState::Pending => "#E8E8E8",
                NodeState::Evaluating => "#FFF3C4",
                NodeState::Completed => "#C8E6C9",
                NodeState::Cached => "#BBDEFB",
                NodeState::Failed => "#FFCDD2",
            };
            dot.push_str(&format!(
                "  \"{}\" [fillcolor=\"{}\", label=\"{}\\n({})\"];\n",
                id, color, id, node.state
            ));
        }
        dot.push('\n');
        for id in &ids {
            if let Ok(deps) = graph.get_dependencies(id) {
                for dep in deps {
                    dot.push_str(&format!("  \"{}\" -> \"{}\";\n", dep, id));
                }
            }
        }
        dot.push_str("}\n");
        dot
    }

    async fn set_node_state(&self, node_id: &str, state: NodeState) {
        let mut graph = self.graph.write().await;
        if let Ok(node) = graph.get_mut(node_id) {
            node.state = state;
            if state != NodeState::Failed {
                node.last_error = None;
            }
        }
    }

    async fn mark_node_failed(&self, node_id: &str, err: &LazyflowError) {
        let mut graph = self.graph.write().await;
        if let Ok(node) = graph.get_mut(node_id) {
            node.mark_failed(err.to_string());
        }
    }

    /// Current state of a node (inspection)
    pub async fn node_state(&self, id: &str) -> Result<NodeState> {
        let graph = self.graph.read().await;
        Ok(graph.get(id)?.state)
    }

    /// Message of a node's most recent failure, if any
    pub async fn node_error(&self, id: &str) -> Result<Option<String>> {
        let graph = self.graph.read().await;
        Ok(graph.get(id)?.last_error.clone())
    }

    /// Dependency-first order over the transitive closure of `id`, ending
    /// with `id` itself. Iterative DFS with an explicit stack; rejects
    /// unregistered dependencies and cycles.
    fn plan_order(graph: &DependencyGraph, id: &str) -> Result<Vec<String>> {
        graph.get(id)?;

        let mut order = Vec::new();
        let mut done: HashSet<String> = HashSet::new();
        let mut on_path: HashSet<String> = HashSet::new();
        // (node, next dependency index); path mirrors the on_path chain
        let mut stack: Vec<(String, usize)> = vec![(id.to_string(), 0)];
        let mut path: Vec<String> = vec![id.to_string()];
        on_path.insert(id.to_string());

        while let Some(frame) = stack.last() {
            let (current, idx) = (frame.0.clone(), frame.1);
            let deps = graph.get_dependencies(&current)?;
            if idx >= deps.len() {
                stack.pop();
                path.pop();
                on_path.remove(&current);
                done.insert(current.clone());
                order.push(current);
                continue;
            }
            stack.last_mut().expect("frame exists").1 += 1;
            let dep = &deps[idx];
            if done.contains(dep) {
                continue;
            }
            if on_path.contains(dep) {
                let start = path.iter().position(|n| n == dep).unwrap_or(0);
                let mut cycle: Vec<String> = path[start..].to_vec();
                cycle.push(dep.clone());
                return Err(LazyflowError::cyclic(cycle));
            }
            if !graph.contains(dep) {
                return Err(LazyflowError::missing_dependency(&current, dep));
            }
            on_path.insert(dep.clone());
            stack.push((dep.clone(), 0));
            path.push(dep.clone());
        }
        Ok(order)
    }

    /// Group a topological order into waves whose members are mutually
    /// independent: wave(n) = 1 + max(wave(deps)).
    fn build_waves(graph: &DependencyGraph, order: &[String]) -> Result<Vec<Vec<String>>> {
        let mut wave_of: HashMap<String, usize> = HashMap::new();
        let mut waves: Vec<Vec<String>> = Vec::new();
        for id in order {
            let deps = graph.get_dependencies(id)?;
            let wave = deps
                .iter()
                .filter_map(|d| wave_of.get(d))
                .max()
                .map(|w| w + 1)
                .unwrap_or(0);
            wave_of.insert(id.clone(), wave);
            if waves.len() <= wave {
                waves.resize_with(wave + 1, Vec::new);
            }
            waves[wave].push(id.clone());
        }
        Ok(waves)
    }
}

/// Fingerprint of a node's inputs: blake3 over the ordered
/// (dependency id, resolved JSON value) pairs. Value-based, so a changed
/// upstream result changes every downstream cache key.
pub fn dependency_fingerprint(dep_ids: &[String], values: &[Value]) -> String {
    let mut hasher = blake3::Hasher::new();
    for (id, value) in dep_ids.iter().zip(values) {
        hasher.update(id.as_bytes());
        hasher.update(&[0]);
        hasher.update(value.to_string().as_bytes());
        hasher.update(&[0]);
    }
    hasher.finalize().to_hex().to_string()
}
