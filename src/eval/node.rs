//! Workflow nodes: a deferred computation plus the state machine that tracks
//! how its value was last obtained (computed fresh, served from cache, failed).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// A deferred computation attached to a workflow node.
///
/// Receives the resolved values of the node's dependencies in declaration
/// order. Errors are arbitrary caller errors; the engine wraps them into
/// `LazyflowError::ComputeFunction`.
#[async_trait]
pub trait Computation: Send + Sync {
    async fn compute(&self, deps: &[Value]) -> anyhow::Result<Value>;
}

/// Adapts a plain closure into a [`Computation`].
pub struct FnComputation<F>(pub F);

#[async_trait]
impl<F> Computation for FnComputation<F>
where
    F: Fn(&[Value]) -> anyhow::Result<Value> + Send + Sync,
{
    async fn compute(&self, deps: &[Value]) -> anyhow::Result<Value> {
        (self.0)(deps)
    }
}

/// Wrap a closure as a registerable computation
pub fn computation<F>(f: F) -> Arc<dyn Computation>
where
    F: Fn(&[Value]) -> anyhow::Result<Value> + Send + Sync + 'static,
{
    Arc::new(FnComputation(f))
}

/// Lifecycle of a node within an evaluation session.
///
/// `Evaluating` doubles as a reentrancy guard: a node observed in this state
/// by its own evaluation path signals a runtime cycle that evaded the static
/// check, and evaluation fails fast instead of recursing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    /// Registered, never evaluated this session
    Pending,
    /// Computation in flight
    Evaluating,
    /// Computed fresh this session
    Completed,
    /// Result served from the cache
    Cached,
    /// Compute function raised, or a dependency failed
    Failed,
}

impl NodeState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cached | Self::Failed)
    }

    pub fn has_result(self) -> bool {
        matches!(self, Self::Completed | Self::Cached)
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Evaluating => "evaluating",
            Self::Completed => "completed",
            Self::Cached => "cached",
            Self::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

/// A registered workflow node
pub struct WorkflowNode {
    /// Unique identifier
    pub id: String,
    /// The computation; `None` for externally supplied literal values
    pub computation: Option<Arc<dyn Computation>>,
    /// Literal value for nodes registered without a computation
    pub literal: Option<Value>,
    /// Ids of nodes whose results this node consumes, in argument order
    pub dependencies: Vec<String>,
    /// Cache TTL; `None` means never expires, zero means never valid
    pub cache_ttl: Option<Duration>,
    /// Opaque caller metadata, carried through to graph export
    pub metadata: HashMap<String, Value>,
    /// Current lifecycle state
    pub state: NodeState,
    /// Message of the most recent failure, if any
    pub last_error: Option<String>,
    /// When the node was registered
    pub registered_at: DateTime<Utc>,
}

impl WorkflowNode {
    pub fn new(
        id: impl Into<String>,
        computation: Arc<dyn Computation>,
        dependencies: Vec<String>,
        cache_ttl: Option<Duration>,
        metadata: HashMap<String, Value>,
    ) -> Self {
        Self {
            id: id.into(),
            computation: Some(computation),
            literal: None,
            dependencies,
            cache_ttl,
            metadata,
            state: NodeState::Pending,
            last_error: None,
            registered_at: Utc::now(),
        }
    }

    /// A node carrying an externally supplied value instead of a computation
    pub fn literal(id: impl Into<String>, value: Value) -> Self {
        Self {
            id: id.into(),
            computation: None,
            literal: Some(value),
            dependencies: Vec::new(),
            cache_ttl: None,
            metadata: HashMap::new(),
            state: NodeState::Pending,
            last_error: None,
            registered_at: Utc::now(),
        }
    }

    /// Reset to `Pending`, clearing any recorded failure
    pub fn reset(&mut self) {
        self.state = NodeState::Pending;
        self.last_error = None;
    }

    pub fn mark_failed(&mut self, message: impl Into<String>) {
        self.state = NodeState::Failed;
        self.last_error = Some(message.into());
    }
}

impl fmt::Debug for WorkflowNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkflowNode")
            .field("id", &self.id)
            .field("dependencies", &self.dependencies)
            .field("cache_ttl", &self.cache_ttl)
            .field("state", &self.state)
            .field("last_error", &self.last_error)
            .field("has_computation", &self.computation.is_some())
            .finish()
    }
}
