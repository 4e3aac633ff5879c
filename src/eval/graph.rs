//! Directed dependency graph over registered workflow nodes.
//!
//! Edges point from a node to the dependencies it consumes. Structural
//! queries ignore dependency ids that are not (yet) registered; `validate`
//! rejects them, and runs before any evaluation.

use crate::core::errors::{LazyflowError, Result};
use crate::eval::node::WorkflowNode;
use std::collections::{HashMap, HashSet, VecDeque};
use tracing::debug;

#[derive(Debug, Default)]
pub struct DependencyGraph {
    nodes: HashMap<String, WorkflowNode>,
    /// Reverse index: dependency id -> ids of nodes that consume it
    dependents: HashMap<String, HashSet<String>>,
}

// DFS coloring: white = unvisited, gray = on the current path, black = done
#[derive(Clone, Copy, PartialEq)]
enum Color {
    White,
    Gray,
    Black,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a node; an existing node with the same id is replaced
    /// (last registration wins). Dependencies need not be registered yet.
    pub fn add_node(&mut self, node: WorkflowNode) {
        if let Some(old) = self.nodes.get(&node.id) {
            debug!(node_id = %node.id, "replacing existing node registration");
            for dep in &old.dependencies {
                if let Some(set) = self.dependents.get_mut(dep) {
                    set.remove(&node.id);
                }
            }
        }
        for dep in &node.dependencies {
            self.dependents
                .entry(dep.clone())
                .or_default()
                .insert(node.id.clone());
        }
        self.nodes.insert(node.id.clone(), node);
    }

    /// Remove a node. Nodes that depend on it keep their declared edge and
    /// will fail `validate` until it is re-registered or they are removed.
    pub fn remove_node(&mut self, id: &str) -> Result<()> {
        let node = self
            .nodes
            .remove(id)
            .ok_or_else(|| LazyflowError::unknown_node(id))?;
        for dep in &node.dependencies {
            if let Some(set) = self.dependents.get_mut(dep) {
                set.remove(id);
            }
        }
        Ok(())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn get(&self, id: &str) -> Result<&WorkflowNode> {
        self.nodes
            .get(id)
            .ok_or_else(|| LazyflowError::unknown_node(id))
    }

    pub fn get_mut(&mut self, id: &str) -> Result<&mut WorkflowNode> {
        self.nodes
            .get_mut(id)
            .ok_or_else(|| LazyflowError::unknown_node(id))
    }

    pub fn node_ids(&self) -> impl Iterator<Item = &String> {
        self.nodes.keys()
    }

    pub fn nodes(&self) -> impl Iterator<Item = &WorkflowNode> {
        self.nodes.values()
    }

    /// Direct dependencies of `id`, in declaration order
    pub fn get_dependencies(&self, id: &str) -> Result<Vec<String>> {
        Ok(self.get(id)?.dependencies.clone())
    }

    /// Nodes that directly consume `id`'s result (order unspecified)
    pub fn get_dependents(&self, id: &str) -> Result<Vec<String>> {
        self.get(id)?;
        Ok(self
            .dependents
            .get(id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default())
    }

    /// Every declared dependency must be registered by evaluation time
    pub fn validate(&self) -> Result<()> {
        for node in self.nodes.values() {
            for dep in &node.dependencies {
                if !self.nodes.contains_key(dep) {
                    return Err(LazyflowError::missing_dependency(&node.id, dep));
                }
            }
        }
        Ok(())
    }

    pub fn has_cycles(&self) -> bool {
        self.find_cycle().is_some()
    }

    /// Find one representative cycle, as a path with the entry id repeated at
    /// the end. Iterative three-color DFS; a gray-to-gray edge is a back edge.
    pub fn find_cycle(&self) -> Option<Vec<String>> {
        let mut colors: HashMap<&str, Color> =
            self.nodes.keys().map(|id| (id.as_str(), Color::White)).collect();

        let mut roots: Vec<&str> = self.nodes.keys().map(String::as_str).collect();
        roots.sort_unstable(); // deterministic cycle reporting

        for root in roots {
            if colors[root] != Color::White {
                continue;
            }
            // Stack frames of (node, next dependency index); path mirrors
            // the gray chain so the cycle can be reconstructed.
            let mut stack: Vec<(&str, usize)> = vec![(root, 0)];
            let mut path: Vec<&str> = vec![root];
            colors.insert(root, Color::Gray);

            while let Some(&(current, idx)) = stack.last() {
                let deps = &self.nodes[current].dependencies;
                if idx >= deps.len() {
                    stack.pop();
                    path.pop();
                    colors.insert(current, Color::Black);
                    continue;
                }
                stack.last_mut().expect("frame exists").1 += 1;
                let dep = deps[idx].as_str();
                match colors.get(dep).copied() {
                    None | Some(Color::Black) => {}
                    Some(Color::Gray) => {
                        // Back edge: slice the path from the first
                        // occurrence of `dep` and close the loop.
                        let start = path.iter().position(|&n| n == dep).unwrap_or(0);
                        let mut cycle: Vec<String> =
                            path[start..].iter().map(|s| s.to_string()).collect();
                        cycle.push(dep.to_string());
                        return Some(cycle);
                    }
                    Some(Color::White) => {
                        colors.insert(dep, Color::Gray);
                        stack.push((dep, 0));
                        path.push(dep);
                    }
                }
            }
        }
        None
    }

    /// Total order with dependencies before dependents (Kahn's algorithm).
    /// Fails with the representative cycle if any nodes cannot be ordered.
    pub fn topological_sort(&self) -> Result<Vec<String>> {
        // Indegree counts only edges between registered nodes
        let mut indegree: HashMap<&str, usize> = HashMap::with_capacity(self.nodes.len());
        for (id, node) in &self.nodes {
            // count unique registered deps; the dependents index is a set
            let registered_deps = node
                .dependencies
                .iter()
                .filter(|d| self.nodes.contains_key(*d))
                .collect::<HashSet<_>>()
                .len();
            indegree.insert(id.as_str(), registered_deps);
        }

        let mut ready: VecDeque<&str> = {
            let mut zero: Vec<&str> = indegree
                .iter()
                .filter(|(_, d)| **d == 0)
                .map(|(id, _)| *id)
                .collect();
            zero.sort_unstable(); // deterministic order among peers
            zero.into()
        };

        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(id) = ready.pop_front() {
            order.push(id.to_string());
            if let Some(consumers) = self.dependents.get(id) {
                let mut unlocked: Vec<&str> = Vec::new();
                for consumer in consumers {
                    if let Some(d) = indegree.get_mut(consumer.as_str()) {
                        *d -= 1;
                        if *d == 0 {
                            unlocked.push(consumer.as_str());
                        }
                    }
                }
                unlocked.sort_unstable();
                ready.extend(unlocked);
            }
        }

        if order.len() != self.nodes.len() {
            let cycle = self.find_cycle().unwrap_or_default();
            return Err(LazyflowError::cyclic(cycle));
        }
        Ok(order)
    }

    /// Full downward closure of `id` (direct and indirect dependencies)
    pub fn get_transitive_dependencies(&self, id: &str) -> Result<HashSet<String>> {
        self.get(id)?;
        let mut closure = HashSet::new();
        let mut queue: VecDeque<&str> = VecDeque::from([id]);
        while let Some(current) = queue.pop_front() {
            if let Some(node) = self.nodes.get(current) {
                for dep in &node.dependencies {
                    if closure.insert(dep.clone()) {
                        queue.push_back(dep.as_str());
                    }
                }
            }
        }
        Ok(closure)
    }
}
