//! Thin CLI over the evaluation engine: run a demonstration pipeline,
//! clear the cache, or export the dependency graph.

use anyhow::Result;
use clap::{Parser, Subcommand};
use lazyflow::{computation, EngineConfig, EvaluationEngine};
use serde_json::json;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "lazyflow", about = "Lazy workflow evaluation engine", version)]
struct Cli {
    /// Directory for the durable cache tier (memory-only when omitted)
    #[arg(long, global = true)]
    cache_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Register a demonstration pipeline and evaluate everything
    Demo {
        /// Recompute every node, bypassing the cache
        #[arg(long)]
        force: bool,
    },
    /// Empty both cache tiers
    ClearCache,
    /// Write the dependency graph as JSON
    Export {
        /// Output path for the graph JSON
        #[arg(long, short)]
        output: PathBuf,
        /// Also print the Graphviz DOT rendering to stdout
        #[arg(long)]
        dot: bool,
    },
}

fn build_engine(cache_dir: Option<PathBuf>) -> Result<EvaluationEngine> {
    let config = EngineConfig {
        cache_dir,
        ..EngineConfig::default()
    };
    Ok(EvaluationEngine::new(config)?)
}

/// A small pipeline exercising dependencies, fan-in and a TTL
async fn register_demo(engine: &EvaluationEngine) {
    engine.register_value("threshold", json!(40)).await;

    engine
        .register_workflow(
            "fetch_issues",
            computation(|_| {
                Ok(json!([
                    {"id": 101, "score": 55},
                    {"id": 102, "score": 30},
                    {"id": 103, "score": 72},
                ]))
            }),
            vec![],
            Some(Duration::from_secs(300)),
            HashMap::new(),
        )
        .await;

    engine
        .register_workflow(
            "filter_issues",
            computation(|deps| {
                let issues = deps[0].as_array().cloned().unwrap_or_default();
                let threshold = deps[1].as_i64().unwrap_or(0);
                let kept: Vec<_> = issues
                    .into_iter()
                    .filter(|i| i["score"].as_i64().unwrap_or(0) >= threshold)
                    .collect();
                Ok(json!(kept))
            }),
            vec!["fetch_issues".to_string(), "threshold".to_string()],
            Some(Duration::from_secs(300)),
            HashMap::new(),
        )
        .await;

    engine
        .register_workflow(
            "report",
            computation(|deps| {
                let kept = deps[0].as_array().map(|a| a.len()).unwrap_or(0);
                Ok(json!({ "matched": kept }))
            }),
            vec!["filter_issues".to_string()],
            None,
            HashMap::new(),
        )
        .await;
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let cli = Cli::parse();
    let engine = build_engine(cli.cache_dir)?;

    match cli.command {
        Command::Demo { force } => {
            register_demo(&engine).await;
            let results = engine.evaluate_all(force).await?;
            let mut ids: Vec<_> = results.keys().cloned().collect();
            ids.sort();
            for id in ids {
                match &results[&id] {
                    Ok(value) => println!("{id}: {value}"),
                    Err(err) => println!("{id}: FAILED ({err})"),
                }
            }
            let summary = engine.get_summary().await;
            println!("{}", serde_json::to_string_pretty(&summary)?);
            if results.values().any(|r| r.is_err()) {
                anyhow::bail!("one or more workflows failed");
            }
        }
        Command::ClearCache => {
            engine.clear_all_cache().await;
            println!("cache cleared");
        }
        Command::Export { output, dot } => {
            register_demo(&engine).await;
            engine.export_graph(&output).await?;
            println!("graph written to {}", output.display());
            if dot {
                println!("{}", engine.visualize_graph().await);
            }
        }
    }
    Ok(())
}
