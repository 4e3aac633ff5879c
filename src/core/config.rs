use crate::core::errors::{LazyflowError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

fn default_max_parallel_nodes() -> usize {
    3
}

/// Configuration for engine and cache behavior
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Default cache TTL in seconds for nodes registered without one.
    /// `None` means entries never expire during the process lifetime.
    pub default_ttl_secs: Option<u64>,
    /// Directory for the durable cache tier. `None` disables persistence
    /// and the cache runs memory-only.
    pub cache_dir: Option<PathBuf>,
    /// Enable parallel evaluation of independent nodes in `evaluate_all`
    #[serde(default)]
    pub enable_parallel_execution: bool,
    /// Maximum number of nodes to evaluate in parallel (default: 3)
    #[serde(default = "default_max_parallel_nodes")]
    pub max_parallel_nodes: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_ttl_secs: None,
            cache_dir: None,
            enable_parallel_execution: false,
            max_parallel_nodes: default_max_parallel_nodes(),
        }
    }
}

impl EngineConfig {
    /// Validates configuration values
    pub fn validate(&self) -> Result<()> {
        if self.max_parallel_nodes == 0 {
            return Err(LazyflowError::configuration_field(
                "max_parallel_nodes must be greater than 0",
                "max_parallel_nodes",
            ));
        }
        if let Some(dir) = &self.cache_dir {
            if dir.as_os_str().is_empty() {
                return Err(LazyflowError::configuration_field(
                    "cache_dir cannot be an empty path",
                    "cache_dir",
                ));
            }
        }
        Ok(())
    }

    /// Merges two configurations, with `override_with` taking precedence
    pub fn merge(base: &Self, override_with: &Self) -> Result<Self> {
        let merged = Self {
            default_ttl_secs: override_with.default_ttl_secs.or(base.default_ttl_secs),
            cache_dir: override_with
                .cache_dir
                .clone()
                .or_else(|| base.cache_dir.clone()),
            enable_parallel_execution: override_with.enable_parallel_execution,
            max_parallel_nodes: override_with.max_parallel_nodes,
        };
        merged.validate()?;
        Ok(merged)
    }

    /// Default TTL as a `Duration`, if configured
    pub fn default_ttl(&self) -> Option<Duration> {
        self.default_ttl_secs.map(Duration::from_secs)
    }

    /// Convenience constructor for a persistent engine
    pub fn with_cache_dir<P: Into<PathBuf>>(dir: P) -> Self {
        Self {
            cache_dir: Some(dir.into()),
            ..Self::default()
        }
    }
}
