//! Nodes of a flow graph.
//!
//! A node is either a task (a leaf unit of work) or a flow (a nested
//! instance of another graph). The kind is resolved once, when the graph is
//! built, because argument propagation treats the two differently.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The kind of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    /// A leaf unit of work.
    Task,
    /// A nested flow, dispatched on its own.
    Flow,
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Task => write!(f, "task"),
            Self::Flow => write!(f, "flow"),
        }
    }
}

/// A named node, tagged with its kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Node {
    /// Name of the task or flow.
    pub name: String,
    /// Whether this node is a task or a sub-flow.
    pub kind: NodeKind,
}

impl Node {
    /// Creates a task node.
    #[must_use]
    pub fn task(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: NodeKind::Task,
        }
    }

    /// Creates a sub-flow node.
    #[must_use]
    pub fn flow(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: NodeKind::Flow,
        }
    }

    /// Returns true if this node is a sub-flow.
    #[must_use]
    pub fn is_flow(&self) -> bool {
        self.kind == NodeKind::Flow
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            NodeKind::Task => write!(f, "{}", self.name),
            NodeKind::Flow => write!(f, "flow:{}", self.name),
        }
    }
}
