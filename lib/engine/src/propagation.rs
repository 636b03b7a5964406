//! Argument propagation between nodes.
//!
//! When an edge fires, each destination node is started with an argument
//! value (`node_args`). Which value that is depends on the owning flow's
//! policy, on how many predecessors the edge has, and on whether the
//! destination is a task or a sub-flow:
//!
//! | predecessors | `node_args_from_first` | recipient | argument                                  |
//! |--------------|------------------------|-----------|-------------------------------------------|
//! | 0 (entry)    | any                    | any       | the flow's own `node_args`                |
//! | 1            | false                  | any       | inherited `node_args`                     |
//! | 1            | true                   | task      | the predecessor's result                  |
//! | 1            | true                   | flow      | the result iff `propagate_node_args`      |
//! | more than 1  | any                    | any       | inherited `node_args`                     |

use crate::node::NodeKind;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Per-flow rules for argument propagation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropagationPolicy {
    /// Hand the single predecessor's result to the nodes it starts.
    #[serde(default)]
    pub node_args_from_first: bool,
    /// Also hand the predecessor's result to sub-flows, not only tasks.
    #[serde(default)]
    pub propagate_node_args: bool,
}

impl PropagationPolicy {
    /// Creates a policy with both flags set as given.
    #[must_use]
    pub const fn new(node_args_from_first: bool, propagate_node_args: bool) -> Self {
        Self {
            node_args_from_first,
            propagate_node_args,
        }
    }

    /// Resolves the argument for a node started by a firing edge.
    ///
    /// `predecessor_results` holds one result per node in the edge's `from`
    /// set, so its length is the predecessor count. `inherited` is the flow
    /// instance's current `node_args`.
    #[must_use]
    pub fn resolve(
        &self,
        recipient: NodeKind,
        predecessor_results: &[&JsonValue],
        inherited: Option<&JsonValue>,
    ) -> Option<JsonValue> {
        match predecessor_results {
            [result] if self.forwards_result_to(recipient) => Some((*result).clone()),
            _ => inherited.cloned(),
        }
    }

    fn forwards_result_to(&self, recipient: NodeKind) -> bool {
        match recipient {
            NodeKind::Task => self.node_args_from_first,
            NodeKind::Flow => self.node_args_from_first && self.propagate_node_args,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn entry_edge_uses_flow_args() {
        let policy = PropagationPolicy::new(true, true);
        let flow_args = json!({"repo": "edgewise"});
        assert_eq!(
            policy.resolve(NodeKind::Task, &[], Some(&flow_args)),
            Some(flow_args.clone())
        );
        assert_eq!(
            policy.resolve(NodeKind::Flow, &[], Some(&flow_args)),
            Some(flow_args)
        );
        assert_eq!(policy.resolve(NodeKind::Task, &[], None), None);
    }

    #[test]
    fn disabled_policy_inherits() {
        let policy = PropagationPolicy::default();
        let result = json!("result");
        let inherited = json!("inherited");
        assert_eq!(
            policy.resolve(NodeKind::Task, &[&result], Some(&inherited)),
            Some(inherited)
        );
    }

    #[test]
    fn task_receives_predecessor_result() {
        let policy = PropagationPolicy::new(true, false);
        let result = json!("result");
        assert_eq!(
            policy.resolve(NodeKind::Task, &[&result], None),
            Some(result)
        );
    }

    #[test]
    fn flow_needs_propagate_flag() {
        let result = json!("result");

        let without = PropagationPolicy::new(true, false);
        assert_eq!(without.resolve(NodeKind::Flow, &[&result], None), None);

        let with = PropagationPolicy::new(true, true);
        assert_eq!(
            with.resolve(NodeKind::Flow, &[&result], None),
            Some(result)
        );
    }

    #[test]
    fn propagate_flag_alone_does_nothing() {
        let policy = PropagationPolicy::new(false, true);
        let result = json!("result");
        assert_eq!(policy.resolve(NodeKind::Flow, &[&result], None), None);
    }

    #[test]
    fn multiple_predecessors_inherit() {
        let policy = PropagationPolicy::new(true, true);
        let a = json!("a");
        let b = json!("b");
        let inherited = json!("inherited");
        assert_eq!(
            policy.resolve(NodeKind::Task, &[&a, &b], Some(&inherited)),
            Some(inherited)
        );
    }
}
