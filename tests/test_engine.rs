//! Scenario tests for the evaluation engine: cache idempotence, cycle
//! reporting, failure propagation, TTL expiry and fingerprint sensitivity.

use lazyflow::{
    computation, Computation, ComputationCache, EngineConfig, EvaluationEngine, LazyflowError,
    ManualClock, NodeState,
};
use async_trait::async_trait;
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn counting(counter: Arc<AtomicU32>, value: Value) -> Arc<dyn Computation> {
    computation(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(value.clone())
    })
}

#[tokio::test]
async fn test_evaluate_chain_and_cache_idempotence() {
    let engine = EvaluationEngine::in_memory();

    engine
        .register_workflow("a", computation(|_| Ok(json!(1))), vec![], None, HashMap::new())
        .await;
    engine
        .register_workflow(
            "b",
            computation(|deps| Ok(json!(deps[0].as_i64().unwrap() + 1))),
            vec!["a".to_string()],
            None,
            HashMap::new(),
        )
        .await;

    assert_eq!(engine.evaluate("b", false).await.unwrap(), json!(2));
    assert_eq!(engine.evaluate("b", false).await.unwrap(), json!(2));

    let metrics = engine.get_metrics();
    assert_eq!(metrics["b"].evaluations, 1);
    assert_eq!(metrics["b"].cache_hits, 1);
    assert_eq!(engine.node_state("b").await.unwrap(), NodeState::Cached);
}

#[tokio::test]
async fn test_unknown_node() {
    let engine = EvaluationEngine::in_memory();
    match engine.evaluate("ghost", false).await {
        Err(LazyflowError::UnknownNode { node_id }) => assert_eq!(node_id, "ghost"),
        other => panic!("expected unknown node, got {:?}", other),
    }
}

#[tokio::test]
async fn test_missing_dependency_at_evaluation_time() {
    let engine = EvaluationEngine::in_memory();
    engine
        .register_workflow(
            "b",
            computation(|_| Ok(json!(null))),
            vec!["a".to_string()],
            None,
            HashMap::new(),
        )
        .await;
    match engine.evaluate("b", false).await {
        Err(LazyflowError::MissingDependency { node_id, dependency }) => {
            assert_eq!(node_id, "b");
            assert_eq!(dependency, "a");
        }
        other => panic!("expected missing dependency, got {:?}", other),
    }
}

#[tokio::test]
async fn test_cycle_reported_by_evaluate_all() {
    let engine = EvaluationEngine::in_memory();
    engine
        .register_workflow(
            "x",
            computation(|_| Ok(json!(null))),
            vec!["y".to_string()],
            None,
            HashMap::new(),
        )
        .await;
    engine
        .register_workflow(
            "y",
            computation(|_| Ok(json!(null))),
            vec!["x".to_string()],
            None,
            HashMap::new(),
        )
        .await;

    match engine.evaluate_all(false).await {
        Err(LazyflowError::CyclicDependency { cycle }) => {
            assert_eq!(cycle.first(), cycle.last());
            assert!(cycle.contains(&"x".to_string()));
            assert!(cycle.contains(&"y".to_string()));
        }
        other => panic!("expected cycle error, got {:?}", other.map(|_| ())),
    }

    // evaluate() of a node inside the cycle fails the same way
    assert!(matches!(
        engine.evaluate("x", false).await,
        Err(LazyflowError::CyclicDependency { .. })
    ));
}

#[tokio::test]
async fn test_compute_failure_recorded_not_fatal_to_pass() {
    let engine = EvaluationEngine::in_memory();
    engine
        .register_workflow(
            "f",
            computation(|_| Err(anyhow::anyhow!("bad value"))),
            vec![],
            None,
            HashMap::new(),
        )
        .await;
    engine.register_value("ok", json!("fine")).await;

    match engine.evaluate("f", false).await {
        Err(LazyflowError::ComputeFunction { node_id, .. }) => assert_eq!(node_id, "f"),
        other => panic!("expected compute failure, got {:?}", other),
    }
    assert_eq!(engine.node_state("f").await.unwrap(), NodeState::Failed);
    assert!(engine.node_error("f").await.unwrap().is_some());

    let results = engine.evaluate_all(false).await.unwrap();
    assert!(results["f"].is_err());
    assert_eq!(*results["ok"].as_ref().unwrap(), json!("fine"));
}

#[tokio::test]
async fn test_dependency_failure_skips_dependent_compute() {
    let engine = EvaluationEngine::in_memory();
    let broken_calls = Arc::new(AtomicU32::new(0));
    let g_calls = Arc::new(AtomicU32::new(0));

    let broken_counter = broken_calls.clone();
    engine
        .register_workflow(
            "broken",
            computation(move |_| {
                broken_counter.fetch_add(1, Ordering::SeqCst);
                Err(anyhow::anyhow!("upstream exploded"))
            }),
            vec![],
            None,
            HashMap::new(),
        )
        .await;
    engine
        .register_workflow(
            "g",
            counting(g_calls.clone(), json!(null)),
            vec!["broken".to_string()],
            None,
            HashMap::new(),
        )
        .await;

    match engine.evaluate("g", false).await {
        Err(LazyflowError::DependencyFailure { node_id, dependency }) => {
            assert_eq!(node_id, "g");
            assert_eq!(dependency, "broken");
        }
        other => panic!("expected dependency failure, got {:?}", other),
    }
    assert_eq!(broken_calls.load(Ordering::SeqCst), 1);
    assert_eq!(g_calls.load(Ordering::SeqCst), 0);
    assert_eq!(engine.node_state("g").await.unwrap(), NodeState::Failed);
    assert_eq!(engine.node_state("broken").await.unwrap(), NodeState::Failed);
}

#[tokio::test]
async fn test_ttl_expiry_triggers_recompute() {
    let clock = ManualClock::starting_now();
    let cache = ComputationCache::in_memory().with_clock(Arc::new(clock.clone()));
    let engine = EvaluationEngine::with_cache(EngineConfig::default(), cache);

    let calls = Arc::new(AtomicU32::new(0));
    engine
        .register_workflow(
            "slow",
            counting(calls.clone(), json!("result")),
            vec![],
            Some(Duration::from_secs(1)),
            HashMap::new(),
        )
        .await;

    engine.evaluate("slow", false).await.unwrap();
    engine.evaluate("slow", false).await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1); // second call hit the cache

    clock.advance(Duration::from_secs(2));
    engine.evaluate("slow", false).await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 2); // expired, recomputed
}

#[tokio::test]
async fn test_force_bypasses_cache_for_target_only() {
    let engine = EvaluationEngine::in_memory();
    let a_calls = Arc::new(AtomicU32::new(0));
    let b_calls = Arc::new(AtomicU32::new(0));

    engine
        .register_workflow("a", counting(a_calls.clone(), json!(1)), vec![], None, HashMap::new())
        .await;
    engine
        .register_workflow(
            "b",
            counting(b_calls.clone(), json!(2)),
            vec!["a".to_string()],
            None,
            HashMap::new(),
        )
        .await;

    engine.evaluate("b", false).await.unwrap();
    engine.evaluate("b", true).await.unwrap();

    assert_eq!(b_calls.load(Ordering::SeqCst), 2); // forced recompute
    assert_eq!(a_calls.load(Ordering::SeqCst), 1); // dependency stayed cached
}

#[tokio::test]
async fn test_fingerprint_sensitivity_to_dependency_value() {
    let engine = EvaluationEngine::in_memory();
    let calls = Arc::new(AtomicU32::new(0));

    engine.register_value("src", json!(1)).await;
    let counter = calls.clone();
    engine
        .register_workflow(
            "down",
            computation(move |deps| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(json!(deps[0].as_i64().unwrap() * 10))
            }),
            vec!["src".to_string()],
            None,
            HashMap::new(),
        )
        .await;

    assert_eq!(engine.evaluate("down", false).await.unwrap(), json!(10));
    assert_eq!(engine.evaluate("down", false).await.unwrap(), json!(10));
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // change what the dependency resolves to; the old cache entry must not
    // be served under the new fingerprint
    engine.register_value("src", json!(5)).await;
    assert_eq!(engine.evaluate("down", false).await.unwrap(), json!(50));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_invalidate_cache_resets_node() {
    let engine = EvaluationEngine::in_memory();
    let calls = Arc::new(AtomicU32::new(0));
    engine
        .register_workflow("n", counting(calls.clone(), json!(7)), vec![], None, HashMap::new())
        .await;

    engine.evaluate("n", false).await.unwrap();
    engine.invalidate_cache("n").await.unwrap();
    assert_eq!(engine.node_state("n").await.unwrap(), NodeState::Pending);

    engine.evaluate("n", false).await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    assert!(matches!(
        engine.invalidate_cache("ghost").await,
        Err(LazyflowError::UnknownNode { .. })
    ));
}

#[tokio::test]
async fn test_clear_all_cache_resets_everything() {
    let engine = EvaluationEngine::in_memory();
    engine.register_value("v", json!(1)).await;
    engine
        .register_workflow("w", computation(|_| Ok(json!(2))), vec![], None, HashMap::new())
        .await;
    engine.evaluate_all(false).await.unwrap();

    engine.clear_all_cache().await;
    assert_eq!(engine.node_state("v").await.unwrap(), NodeState::Pending);
    assert_eq!(engine.node_state("w").await.unwrap(), NodeState::Pending);
    assert_eq!(engine.cache_stats().memory_entries, 0);
}

#[tokio::test]
async fn test_summary_aggregates_metrics() {
    let engine = EvaluationEngine::in_memory();
    engine
        .register_workflow("a", computation(|_| Ok(json!(1))), vec![], None, HashMap::new())
        .await;
    engine.evaluate("a", false).await.unwrap();
    engine.evaluate("a", false).await.unwrap();

    let summary = engine.get_summary().await;
    assert_eq!(summary.total_nodes, 1);
    assert_eq!(summary.total_evaluations, 1);
    assert_eq!(summary.total_cache_hits, 1);
    assert!((summary.cache_hit_rate - 0.5).abs() < f64::EPSILON);
    assert_eq!(summary.states.get("cached"), Some(&1));

    engine.reset_metrics();
    assert!(engine.get_metrics().is_empty());
}

struct SlowComputation {
    calls: Arc<AtomicU32>,
}

#[async_trait]
impl Computation for SlowComputation {
    async fn compute(&self, _deps: &[Value]) -> anyhow::Result<Value> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        Ok(json!("done"))
    }
}

#[tokio::test]
async fn test_concurrent_evaluations_collapse_into_one_computation() {
    let engine = EvaluationEngine::in_memory();
    let calls = Arc::new(AtomicU32::new(0));
    engine
        .register_workflow(
            "slow",
            Arc::new(SlowComputation { calls: calls.clone() }),
            vec![],
            None,
            HashMap::new(),
        )
        .await;

    let (r1, r2) = tokio::join!(engine.evaluate("slow", false), engine.evaluate("slow", false));
    assert_eq!(r1.unwrap(), json!("done"));
    assert_eq!(r2.unwrap(), json!("done"));
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let metrics = engine.get_metrics();
    assert_eq!(metrics["slow"].evaluations, 1);
    assert_eq!(metrics["slow"].cache_hits, 1);
}

#[tokio::test]
async fn test_parallel_evaluate_all_diamond() {
    let config = EngineConfig {
        enable_parallel_execution: true,
        max_parallel_nodes: 2,
        ..EngineConfig::default()
    };
    let engine = EvaluationEngine::new(config).unwrap();

    engine.register_value("a", json!(1)).await;
    engine
        .register_workflow(
            "b",
            computation(|deps| Ok(json!(deps[0].as_i64().unwrap() + 1))),
            vec!["a".to_string()],
            None,
            HashMap::new(),
        )
        .await;
    engine
        .register_workflow(
            "c",
            computation(|deps| Ok(json!(deps[0].as_i64().unwrap() + 2))),
            vec!["a".to_string()],
            None,
            HashMap::new(),
        )
        .await;
    engine
        .register_workflow(
            "d",
            computation(|deps| {
                Ok(json!(deps[0].as_i64().unwrap() + deps[1].as_i64().unwrap()))
            }),
            vec!["b".to_string(), "c".to_string()],
            None,
            HashMap::new(),
        )
        .await;

    let results = engine.evaluate_all(false).await.unwrap();
    assert_eq!(*results["d"].as_ref().unwrap(), json!(5));
    assert_eq!(results.len(), 4);
}

#[tokio::test]
async fn test_parallel_pass_skips_dependents_of_failures() {
    let config = EngineConfig {
        enable_parallel_execution: true,
        max_parallel_nodes: 3,
        ..EngineConfig::default()
    };
    let engine = EvaluationEngine::new(config).unwrap();
    let leaf_calls = Arc::new(AtomicU32::new(0));

    engine
        .register_workflow(
            "root",
            computation(|_| Err(anyhow::anyhow!("boom"))),
            vec![],
            None,
            HashMap::new(),
        )
        .await;
    engine
        .register_workflow(
            "leaf",
            counting(leaf_calls.clone(), json!(null)),
            vec!["root".to_string()],
            None,
            HashMap::new(),
        )
        .await;

    let results = engine.evaluate_all(false).await.unwrap();
    assert!(results["root"].is_err());
    assert!(matches!(
        results["leaf"],
        Err(LazyflowError::DependencyFailure { .. })
    ));
    assert_eq!(leaf_calls.load(Ordering::SeqCst), 0);
}
