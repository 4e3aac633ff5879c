pub mod cache;
pub mod engine;
pub mod graph;
pub mod node;

pub use cache::{CacheLookup, CacheStats, Clock, ComputationCache, ManualClock, SystemClock};
pub use engine::{dependency_fingerprint, EngineSummary, EvaluationEngine, NodeMetrics};
pub use graph::DependencyGraph;
pub use node::{computation, Computation, FnComputation, NodeState, WorkflowNode};
