//! Edge types for flow graphs.
//!
//! An edge connects a set of source nodes to a set of destination nodes:
//! - `from`: nodes that must all have finished (empty for an entry edge)
//! - `to`: nodes started when the edge fires
//! - `condition`: predicate over the results of the `from` nodes

use crate::condition::Condition;
use serde::{Deserialize, Serialize};

/// A conditional transition between node sets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    /// Names of the predecessor nodes.
    #[serde(default)]
    pub from: Vec<String>,
    /// Names of the successor nodes.
    pub to: Vec<String>,
    /// Readiness condition, evaluated against the results of `from`.
    #[serde(default)]
    pub condition: Condition,
}

impl Edge {
    /// Creates an unconditional edge.
    #[must_use]
    pub fn new<F, T>(from: F, to: T) -> Self
    where
        F: IntoIterator,
        F::Item: Into<String>,
        T: IntoIterator,
        T::Item: Into<String>,
    {
        Self {
            from: from.into_iter().map(Into::into).collect(),
            to: to.into_iter().map(Into::into).collect(),
            condition: Condition::AlwaysTrue,
        }
    }

    /// Creates an entry edge starting the given nodes.
    #[must_use]
    pub fn entry<T>(to: T) -> Self
    where
        T: IntoIterator,
        T::Item: Into<String>,
    {
        Self::new(Vec::<String>::new(), to)
    }

    /// Sets the readiness condition.
    #[must_use]
    pub fn with_condition(mut self, condition: Condition) -> Self {
        self.condition = condition;
        self
    }

    /// Returns true if this edge has no predecessors.
    #[must_use]
    pub fn is_entry(&self) -> bool {
        self.from.is_empty()
    }

    /// Returns true if a node is both a source and a destination of this edge.
    #[must_use]
    pub fn is_self_loop(&self) -> bool {
        self.from.iter().any(|name| self.to.contains(name))
    }
}
