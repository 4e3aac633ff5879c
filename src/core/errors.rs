use thiserror::Error;

/// Unified error type for the entire lazyflow library
#[derive(Debug, Error)]
pub enum LazyflowError {
    /// An operation referenced a workflow id that was never registered
    #[error("Unknown workflow node: '{node_id}'")]
    UnknownNode { node_id: String },

    /// A registered node declares a dependency that does not exist at evaluation time
    #[error("Node '{node_id}' depends on '{dependency}', which is not registered")]
    MissingDependency {
        node_id: String,
        dependency: String,
    },

    /// The dependency relation contains a cycle; `cycle` is one representative
    /// path with the first id repeated at the end (e.g. ["x", "y", "x"])
    #[error("Cyclic dependency detected: {}", cycle.join(" -> "))]
    CyclicDependency { cycle: Vec<String> },

    /// A caller-supplied compute function returned an error
    #[error("Compute function for node '{node_id}' failed: {source}")]
    ComputeFunction {
        node_id: String,
        #[source]
        source: anyhow::Error,
    },

    /// A node was not evaluated because one of its dependencies failed
    #[error("Node '{node_id}' skipped: dependency '{dependency}' failed")]
    DependencyFailure {
        node_id: String,
        dependency: String,
    },

    /// Disk cache serialization/deserialization failure; the affected entry
    /// degrades to memory-only operation
    #[error("Cache persistence failed during {operation}")]
    CachePersistence {
        operation: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Configuration {
        message: String,
        field: Option<String>,
    },

    /// Filesystem errors outside the cache persistence path (graph export etc.)
    #[error("IO operation failed: {operation}")]
    Io {
        operation: String,
        #[source]
        source: std::io::Error,
    },

    /// Serialization errors outside the cache persistence path
    #[error("Serialization failed: {format}")]
    Serialization {
        format: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Generic internal errors
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl LazyflowError {
    pub fn unknown_node<S: Into<String>>(node_id: S) -> Self {
        Self::UnknownNode {
            node_id: node_id.into(),
        }
    }

    pub fn missing_dependency<S: Into<String>, D: Into<String>>(node_id: S, dependency: D) -> Self {
        Self::MissingDependency {
            node_id: node_id.into(),
            dependency: dependency.into(),
        }
    }

    pub fn cyclic(cycle: Vec<String>) -> Self {
        Self::CyclicDependency { cycle }
    }

    pub fn compute<S: Into<String>>(node_id: S, source: anyhow::Error) -> Self {
        Self::ComputeFunction {
            node_id: node_id.into(),
            source,
        }
    }

    pub fn dependency_failure<S: Into<String>, D: Into<String>>(node_id: S, dependency: D) -> Self {
        Self::DependencyFailure {
            node_id: node_id.into(),
            dependency: dependency.into(),
        }
    }

    pub fn persistence<S: Into<String>, E: std::error::Error + Send + Sync + 'static>(
        operation: S,
        source: E,
    ) -> Self {
        Self::CachePersistence {
            operation: operation.into(),
            source: Box::new(source),
        }
    }

    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
            field: None,
        }
    }

    pub fn configuration_field<S: Into<String>, F: Into<String>>(message: S, field: F) -> Self {
        Self::Configuration {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    pub fn io<S: Into<String>>(operation: S, source: std::io::Error) -> Self {
        Self::Io {
            operation: operation.into(),
            source,
        }
    }

    pub fn serialization<S: Into<String>, E: std::error::Error + Send + Sync + 'static>(
        format: S,
        source: E,
    ) -> Self {
        Self::Serialization {
            format: format.into(),
            source: Box::new(source),
        }
    }

    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Whether re-invoking the failed operation could plausibly succeed
    /// without any registration change (e.g. `evaluate(id, force=true)`)
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::ComputeFunction { .. } => true,
            Self::CachePersistence { .. } | Self::Io { .. } => true,
            Self::DependencyFailure { .. } => true, // recoverable once the dependency is fixed
            Self::UnknownNode { .. }
            | Self::MissingDependency { .. }
            | Self::CyclicDependency { .. }
            | Self::Configuration { .. } => false,
            Self::Serialization { .. } | Self::Internal { .. } => false,
        }
    }

    /// Get error category for metrics/logging
    pub fn category(&self) -> &'static str {
        match self {
            Self::UnknownNode { .. } => "unknown_node",
            Self::MissingDependency { .. } => "missing_dependency",
            Self::CyclicDependency { .. } => "cycle",
            Self::ComputeFunction { .. } => "compute",
            Self::DependencyFailure { .. } => "dependency_failure",
            Self::CachePersistence { .. } => "cache_persistence",
            Self::Configuration { .. } => "configuration",
            Self::Io { .. } => "io",
            Self::Serialization { .. } => "serialization",
            Self::Internal { .. } => "internal",
        }
    }
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, LazyflowError>;

impl From<std::io::Error> for LazyflowError {
    fn from(err: std::io::Error) -> Self {
        Self::io("io_operation", err)
    }
}

impl From<serde_json::Error> for LazyflowError {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization("json", err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = LazyflowError::unknown_node("missing");
        assert!(matches!(err, LazyflowError::UnknownNode { .. }));
        assert_eq!(err.category(), "unknown_node");
    }

    #[test]
    fn test_cycle_message_names_path() {
        let err = LazyflowError::cyclic(vec!["x".into(), "y".into(), "x".into()]);
        assert_eq!(err.to_string(), "Cyclic dependency detected: x -> y -> x");
    }

    #[test]
    fn test_error_recoverability() {
        let compute = LazyflowError::compute("n", anyhow::anyhow!("boom"));
        assert!(compute.is_recoverable());
        assert!(!LazyflowError::unknown_node("n").is_recoverable());
        assert!(!LazyflowError::cyclic(vec!["a".into(), "a".into()]).is_recoverable());
    }
}
