//! The execution collaborator seam.
//!
//! The engine never runs work itself. It asks a [`NodeExecutor`] to start
//! tasks and sub-flows, and on later cycles asks it whether they finished.
//! Production executors put work on a queue; [`LocalExecutor`] keeps
//! everything in memory for tests and dry runs.
//!
//! [`LocalExecutor`]: crate::local::LocalExecutor

use crate::node::Node;
use async_trait::async_trait;
use edgewise_core::{DispatcherId, NodeInstanceId};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::fmt;

/// Opaque handle identifying a started node in the executor.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeHandle(String);

impl NodeHandle {
    /// Creates a handle from the executor's own identifier.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the executor's identifier.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Everything the executor needs to start one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartRequest {
    /// The flow instance starting the node.
    pub flow_name: String,
    /// Dispatcher of the flow instance starting the node.
    pub dispatcher_id: DispatcherId,
    /// The node to start.
    pub node: Node,
    /// Id of this occurrence of the node.
    pub instance_id: NodeInstanceId,
    /// Arguments for the node.
    pub node_args: Option<JsonValue>,
    /// Predecessor occurrences that triggered this start, by node name.
    pub parent: BTreeMap<String, NodeInstanceId>,
}

/// Runs tasks and sub-flows on behalf of the engine.
#[async_trait]
pub trait NodeExecutor: Send + Sync {
    /// Starts a task or sub-flow and returns a handle to poll it.
    async fn start(&self, request: StartRequest) -> Result<NodeHandle, ExecutorError>;

    /// Returns true once the node finished successfully.
    async fn is_finished(&self, handle: &NodeHandle) -> Result<bool, ExecutorError>;

    /// Returns true once the node failed permanently.
    async fn is_failed(&self, handle: &NodeHandle) -> Result<bool, ExecutorError>;

    /// Returns the result of a finished node.
    async fn result(&self, handle: &NodeHandle) -> Result<JsonValue, ExecutorError>;
}

/// Errors from executor operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutorError {
    /// The node could not be started.
    StartFailed { node_name: String, reason: String },
    /// The executor does not know the handle.
    UnknownHandle { handle: NodeHandle },
    /// The node's result could not be retrieved.
    ResultUnavailable { handle: NodeHandle, reason: String },
    /// The executor backend cannot be reached.
    Unavailable { reason: String },
}

impl fmt::Display for ExecutorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StartFailed { node_name, reason } => {
                write!(f, "failed to start '{node_name}': {reason}")
            }
            Self::UnknownHandle { handle } => write!(f, "unknown node handle: {handle}"),
            Self::ResultUnavailable { handle, reason } => {
                write!(f, "result of {handle} unavailable: {reason}")
            }
            Self::Unavailable { reason } => write!(f, "executor unavailable: {reason}"),
        }
    }
}

impl std::error::Error for ExecutorError {}
