//! lazyflow - lazy evaluation of named workflow computations over a
//! dependency graph, with a two-tier TTL result cache.
//!
//! Callers register named computations with declared dependencies; the
//! [`EvaluationEngine`] resolves dependencies in topological order,
//! consults the cache before invoking any compute function, and records
//! per-node metrics. Results are `serde_json::Value`s and cache keys are
//! value-based fingerprints of each node's resolved inputs, so a changed
//! upstream result invalidates everything downstream of it.

// Core infrastructure modules
pub mod core {
    pub mod config;
    pub mod errors;
}

// Graph, cache, node and engine
pub mod eval;

// Re-exports for convenience
pub use crate::core::config::EngineConfig;
pub use crate::core::errors::{LazyflowError, Result};
pub use eval::*;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    #[tokio::test]
    async fn test_register_and_evaluate_chain() {
        let engine = EvaluationEngine::in_memory();

        engine
            .register_workflow(
                "base",
                computation(|_| Ok(json!(10))),
                vec![],
                None,
                HashMap::new(),
            )
            .await;
        engine
            .register_workflow(
                "double",
                computation(|deps| {
                    let n = deps[0].as_i64().unwrap_or(0);
                    Ok(json!(n * 2))
                }),
                vec!["base".to_string()],
                None,
                HashMap::new(),
            )
            .await;

        let value = engine.evaluate("double", false).await.unwrap();
        assert_eq!(value, json!(20));
        assert_eq!(
            engine.node_state("double").await.unwrap(),
            NodeState::Completed
        );
    }

    #[tokio::test]
    async fn test_two_engines_are_independent() {
        let a = EvaluationEngine::in_memory();
        let b = EvaluationEngine::in_memory();
        a.register_value("x", json!(1)).await;
        assert!(a.evaluate("x", false).await.is_ok());
        assert!(matches!(
            b.evaluate("x", false).await,
            Err(LazyflowError::UnknownNode { .. })
        ));
    }
}
