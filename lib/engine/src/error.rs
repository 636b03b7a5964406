//! Error types for the engine crate.
//!
//! Errors are layered:
//! - `GraphError`: a single flow's topology is malformed
//! - `ConfigError`: the system definition cannot be compiled (wraps `GraphError`)
//! - `EngineError`: a flow instance cannot make progress during `update()`
//!
//! Boundary code wraps these in a rootcause `Report` together with the flow
//! and dispatcher that hit them.

use crate::executor::ExecutorError;
use std::fmt;

/// Errors from building a flow graph.
///
/// These errors contain only information available at the graph layer. The
/// flow name is added by [`ConfigError::Graph`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    /// An edge has no destination nodes.
    EmptyDestination { edge: usize },
    /// A node appears more than once in an edge's source set.
    DuplicatePredecessor { edge: usize, node: String },
    /// A node name is empty.
    EmptyNodeName { edge: usize },
    /// An edge condition inspects a node that is not one of the edge's sources.
    ConditionOutsideSources { edge: usize, node: String },
    /// The flow has edges but none of them is an entry edge.
    NoEntryEdge,
    /// A source node can never finish because no entry edge leads to it.
    UnreachableNode { edge: usize, node: String },
}

impl fmt::Display for GraphError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyDestination { edge } => {
                write!(f, "edge #{edge} has no destination nodes")
            }
            Self::DuplicatePredecessor { edge, node } => {
                write!(f, "edge #{edge} lists '{node}' more than once in 'from'")
            }
            Self::EmptyNodeName { edge } => write!(f, "edge #{edge} references an empty node name"),
            Self::ConditionOutsideSources { edge, node } => {
                write!(
                    f,
                    "condition of edge #{edge} inspects '{node}', which is not in 'from'"
                )
            }
            Self::NoEntryEdge => write!(f, "flow has no entry edge"),
            Self::UnreachableNode { edge, node } => {
                write!(
                    f,
                    "node '{node}' required by edge #{edge} is not reachable from any entry edge"
                )
            }
        }
    }
}

impl std::error::Error for GraphError {}

/// Errors from loading or compiling a system definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// The definition could not be read.
    Io { path: String, reason: String },
    /// The definition could not be parsed.
    Parse { reason: String },
    /// Two tasks or flows share a name.
    DuplicateName { name: String },
    /// A flow references a node that is neither a declared task nor a flow.
    UnknownNode { flow_name: String, node: String },
    /// A flow's topology is invalid.
    Graph { flow_name: String, source: GraphError },
    /// An output schema could not be loaded or compiled.
    InvalidSchema { node_name: String, path: String, reason: String },
    /// Runtime settings could not be loaded.
    Settings { reason: String },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io { path, reason } => write!(f, "failed to read {path}: {reason}"),
            Self::Parse { reason } => write!(f, "failed to parse system definition: {reason}"),
            Self::DuplicateName { name } => write!(f, "name '{name}' is defined more than once"),
            Self::UnknownNode { flow_name, node } => {
                write!(f, "flow '{flow_name}' references undefined node '{node}'")
            }
            Self::Graph { flow_name, source } => {
                write!(f, "invalid graph for flow '{flow_name}': {source}")
            }
            Self::InvalidSchema {
                node_name,
                path,
                reason,
            } => {
                write!(f, "invalid output schema {path} for '{node_name}': {reason}")
            }
            Self::Settings { reason } => write!(f, "invalid dispatcher settings: {reason}"),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Graph { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Errors raised while a flow instance makes progress.
///
/// "Nothing is ready yet" is never an error; it is reported through the
/// retry interval returned by `SystemState::update`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// The flow is not part of the system configuration.
    UnknownFlow { flow_name: String },
    /// The execution collaborator failed.
    Executor(ExecutorError),
    /// The serialized state was written by an incompatible version.
    UnsupportedStateVersion { found: u32, expected: u32 },
    /// The serialized state does not match the flow's graph.
    InvalidState { reason: String },
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownFlow { flow_name } => write!(f, "unknown flow '{flow_name}'"),
            Self::Executor(e) => write!(f, "executor error: {e}"),
            Self::UnsupportedStateVersion { found, expected } => {
                write!(
                    f,
                    "unsupported state version {found} (expected {expected})"
                )
            }
            Self::InvalidState { reason } => write!(f, "invalid flow state: {reason}"),
        }
    }
}

impl std::error::Error for EngineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Executor(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ExecutorError> for EngineError {
    fn from(e: ExecutorError) -> Self {
        Self::Executor(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;

    #[test]
    fn graph_error_display() {
        let err = GraphError::UnreachableNode {
            edge: 2,
            node: "Task3".to_string(),
        };
        assert!(err.to_string().contains("'Task3'"));
        assert!(err.to_string().contains("#2"));
    }

    #[test]
    fn config_error_keeps_graph_source() {
        let err = ConfigError::Graph {
            flow_name: "flow1".to_string(),
            source: GraphError::NoEntryEdge,
        };
        assert!(err.to_string().contains("flow1"));
        assert!(err.source().is_some());
    }

    #[test]
    fn engine_error_wraps_executor_error() {
        let err: EngineError = ExecutorError::Unavailable {
            reason: "broker down".to_string(),
        }
        .into();
        assert!(err.to_string().contains("broker down"));
        assert!(err.source().is_some());
    }
}
