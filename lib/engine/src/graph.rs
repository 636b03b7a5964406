//! Flow graph implementation.
//!
//! A flow graph is the immutable topology of one flow: an ordered list of
//! edges, each connecting a set of predecessors to a set of successors.
//! Edges are kept in definition order because the engine evaluates them in
//! that order. A petgraph view of the node-to-node relation is kept next to
//! them for topology queries and diagnostics.
//!
//! Self-loops are ordinary edges. The engine tracks firing per completion
//! event, so a node that depends on itself needs no cycle handling here.

use crate::edge::Edge;
use crate::error::GraphError;
use crate::node::{Node, NodeKind};
use petgraph::Direction;
use petgraph::dot::Dot;
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::{BTreeSet, HashMap, HashSet};

/// The validated topology of a single flow.
#[derive(Debug, Clone)]
pub struct FlowGraph {
    name: String,
    edges: Vec<Edge>,
    /// Edge indices keyed by each node appearing in the edge's `from` set.
    edges_from: HashMap<String, Vec<usize>>,
    entry_edges: Vec<usize>,
    /// Node-to-node relation; edge weights are indices into `edges`.
    topology: DiGraph<Node, usize>,
    node_index_map: HashMap<String, NodeIndex>,
}

impl FlowGraph {
    /// Builds and validates a flow graph.
    ///
    /// `kind_of` resolves each referenced node name to a task or a flow.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - An edge has no destination or references an empty name
    /// - An edge lists the same predecessor twice
    /// - A condition inspects a node outside the edge's `from` set
    /// - The flow has edges but no entry edge
    /// - A predecessor can never be reached from an entry edge
    pub fn new(
        name: impl Into<String>,
        edges: Vec<Edge>,
        kind_of: impl Fn(&str) -> NodeKind,
    ) -> Result<Self, GraphError> {
        for (idx, edge) in edges.iter().enumerate() {
            validate_edge(idx, edge)?;
        }

        if !edges.is_empty() && !edges.iter().any(Edge::is_entry) {
            return Err(GraphError::NoEntryEdge);
        }

        check_reachability(&edges)?;

        let mut topology = DiGraph::new();
        let mut node_index_map = HashMap::new();
        let mut edges_from: HashMap<String, Vec<usize>> = HashMap::new();
        let mut entry_edges = Vec::new();

        for (idx, edge) in edges.iter().enumerate() {
            for node_name in edge.from.iter().chain(&edge.to) {
                node_index_map
                    .entry(node_name.clone())
                    .or_insert_with(|| {
                        topology.add_node(Node {
                            name: node_name.clone(),
                            kind: kind_of(node_name),
                        })
                    });
            }

            if edge.is_entry() {
                entry_edges.push(idx);
            }

            for source in &edge.from {
                edges_from.entry(source.clone()).or_default().push(idx);
                for target in &edge.to {
                    topology.add_edge(node_index_map[source], node_index_map[target], idx);
                }
            }
        }

        Ok(Self {
            name: name.into(),
            edges,
            edges_from,
            entry_edges,
            topology,
            node_index_map,
        })
    }

    /// Returns the flow name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns all edges in definition order.
    #[must_use]
    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    /// Returns the edge at the given index.
    #[must_use]
    pub fn edge(&self, idx: usize) -> Option<&Edge> {
        self.edges.get(idx)
    }

    /// Returns the number of edges.
    #[must_use]
    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    /// Returns the number of distinct nodes.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.topology.node_count()
    }

    /// Returns true if the flow has no edges at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    /// Returns the entry edges with their indices.
    pub fn entry_edges(&self) -> impl Iterator<Item = (usize, &Edge)> {
        self.entry_edges.iter().map(|&idx| (idx, &self.edges[idx]))
    }

    /// Returns the edges that list `node_name` as a predecessor.
    pub fn edges_from(&self, node_name: &str) -> impl Iterator<Item = (usize, &Edge)> {
        self.edges_from
            .get(node_name)
            .into_iter()
            .flatten()
            .map(|&idx| (idx, &self.edges[idx]))
    }

    /// Returns a node by name.
    #[must_use]
    pub fn node(&self, node_name: &str) -> Option<&Node> {
        let index = self.node_index_map.get(node_name)?;
        self.topology.node_weight(*index)
    }

    /// Returns the kind of a node, if the node is part of this flow.
    #[must_use]
    pub fn kind_of(&self, node_name: &str) -> Option<NodeKind> {
        self.node(node_name).map(|node| node.kind)
    }

    /// Returns all nodes of the flow.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.topology.node_weights()
    }

    /// Returns the distinct successors of a node.
    #[must_use]
    pub fn successors(&self, node_name: &str) -> Vec<&Node> {
        self.neighbors(node_name, Direction::Outgoing)
    }

    /// Returns the distinct predecessors of a node.
    #[must_use]
    pub fn predecessors(&self, node_name: &str) -> Vec<&Node> {
        self.neighbors(node_name, Direction::Incoming)
    }

    /// Renders the node-to-node relation in Graphviz dot format.
    ///
    /// Edge labels are edge indices, so edges with several predecessors show
    /// up once per predecessor with the same label.
    #[must_use]
    pub fn to_dot(&self) -> String {
        format!("{}", Dot::new(&self.topology))
    }

    fn neighbors(&self, node_name: &str, direction: Direction) -> Vec<&Node> {
        let Some(&index) = self.node_index_map.get(node_name) else {
            return Vec::new();
        };

        let mut seen = HashSet::new();
        self.topology
            .neighbors_directed(index, direction)
            .filter(|idx| seen.insert(*idx))
            .filter_map(|idx| self.topology.node_weight(idx))
            .collect()
    }
}

fn validate_edge(idx: usize, edge: &Edge) -> Result<(), GraphError> {
    if edge.to.is_empty() {
        return Err(GraphError::EmptyDestination { edge: idx });
    }

    if edge.from.iter().chain(&edge.to).any(String::is_empty) {
        return Err(GraphError::EmptyNodeName { edge: idx });
    }

    let mut seen = HashSet::new();
    for name in &edge.from {
        if !seen.insert(name.as_str()) {
            return Err(GraphError::DuplicatePredecessor {
                edge: idx,
                node: name.clone(),
            });
        }
    }

    if let Some(node) = edge
        .condition
        .referenced_nodes()
        .into_iter()
        .find(|node| !seen.contains(node))
    {
        return Err(GraphError::ConditionOutsideSources {
            edge: idx,
            node: node.to_string(),
        });
    }

    Ok(())
}

/// Checks that every predecessor can eventually finish.
///
/// An edge makes its destinations reachable once all of its sources are
/// reachable, so this is a fixpoint over edges rather than a plain graph
/// search: a join edge needs every branch to be reachable.
fn check_reachability(edges: &[Edge]) -> Result<(), GraphError> {
    let mut reachable: BTreeSet<&str> = BTreeSet::new();

    loop {
        let mut changed = false;
        for edge in edges {
            if edge.from.iter().all(|name| reachable.contains(name.as_str())) {
                for target in &edge.to {
                    changed |= reachable.insert(target.as_str());
                }
            }
        }
        if !changed {
            break;
        }
    }

    for (idx, edge) in edges.iter().enumerate() {
        if let Some(node) = edge
            .from
            .iter()
            .find(|name| !reachable.contains(name.as_str()))
        {
            return Err(GraphError::UnreachableNode {
                edge: idx,
                node: node.clone(),
            });
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::condition::Condition;
    use serde_json::json;

    fn tasks_only(_: &str) -> NodeKind {
        NodeKind::Task
    }

    #[test]
    fn builds_linear_flow() {
        let graph = FlowGraph::new(
            "flow1",
            vec![Edge::entry(["Task1"]), Edge::new(["Task1"], ["Task2"])],
            tasks_only,
        )
        .unwrap();

        assert_eq!(graph.name(), "flow1");
        assert_eq!(graph.edge_count(), 2);
        assert_eq!(graph.node_count(), 2);
        assert_eq!(graph.entry_edges().count(), 1);

        let from_task1: Vec<_> = graph.edges_from("Task1").map(|(idx, _)| idx).collect();
        assert_eq!(from_task1, vec![1]);
        assert_eq!(graph.edges_from("Task2").count(), 0);

        let successors = graph.successors("Task1");
        assert_eq!(successors.len(), 1);
        assert_eq!(successors[0].name, "Task2");
    }

    #[test]
    fn resolves_node_kinds() {
        let graph = FlowGraph::new(
            "flow1",
            vec![Edge::entry(["Task1"]), Edge::new(["Task1"], ["flow2"])],
            |name| {
                if name.starts_with("flow") {
                    NodeKind::Flow
                } else {
                    NodeKind::Task
                }
            },
        )
        .unwrap();

        assert_eq!(graph.kind_of("Task1"), Some(NodeKind::Task));
        assert_eq!(graph.kind_of("flow2"), Some(NodeKind::Flow));
        assert_eq!(graph.kind_of("missing"), None);
    }

    #[test]
    fn self_loop_is_accepted() {
        let graph = FlowGraph::new(
            "flow1",
            vec![Edge::new(["Task1"], ["Task1"]), Edge::entry(["Task1"])],
            tasks_only,
        )
        .unwrap();

        assert!(graph.edge(0).unwrap().is_self_loop());
        assert_eq!(graph.successors("Task1")[0].name, "Task1");
    }

    #[test]
    fn empty_flow_is_accepted() {
        let graph = FlowGraph::new("flow2", Vec::new(), tasks_only).unwrap();
        assert!(graph.is_empty());
        assert_eq!(graph.entry_edges().count(), 0);
    }

    #[test]
    fn rejects_flow_without_entry() {
        let result = FlowGraph::new("flow1", vec![Edge::new(["Task1"], ["Task2"])], tasks_only);
        assert_eq!(result.unwrap_err(), GraphError::NoEntryEdge);
    }

    #[test]
    fn rejects_unreachable_predecessor() {
        let result = FlowGraph::new(
            "flow1",
            vec![Edge::entry(["Task1"]), Edge::new(["Task3"], ["Task2"])],
            tasks_only,
        );
        assert_eq!(
            result.unwrap_err(),
            GraphError::UnreachableNode {
                edge: 1,
                node: "Task3".to_string()
            }
        );
    }

    #[test]
    fn rejects_cycle_not_fed_by_entry() {
        // Task2 and Task3 only feed each other.
        let result = FlowGraph::new(
            "flow1",
            vec![
                Edge::entry(["Task1"]),
                Edge::new(["Task2"], ["Task3"]),
                Edge::new(["Task3"], ["Task2"]),
            ],
            tasks_only,
        );
        assert!(matches!(
            result.unwrap_err(),
            GraphError::UnreachableNode { .. }
        ));
    }

    #[test]
    fn join_requires_every_branch_reachable() {
        let ok = FlowGraph::new(
            "flow1",
            vec![
                Edge::entry(["Task1", "Task2"]),
                Edge::new(["Task1", "Task2"], ["Task3"]),
            ],
            tasks_only,
        );
        assert!(ok.is_ok());

        let broken = FlowGraph::new(
            "flow1",
            vec![
                Edge::entry(["Task1"]),
                Edge::new(["Task1", "Task2"], ["Task3"]),
            ],
            tasks_only,
        );
        assert!(broken.is_err());
    }

    #[test]
    fn rejects_empty_destination() {
        let result = FlowGraph::new(
            "flow1",
            vec![Edge::entry(Vec::<String>::new())],
            tasks_only,
        );
        assert_eq!(
            result.unwrap_err(),
            GraphError::EmptyDestination { edge: 0 }
        );
    }

    #[test]
    fn rejects_duplicate_predecessor() {
        let result = FlowGraph::new(
            "flow1",
            vec![Edge::entry(["Task1"]), Edge::new(["Task1", "Task1"], ["Task2"])],
            tasks_only,
        );
        assert!(matches!(
            result.unwrap_err(),
            GraphError::DuplicatePredecessor { edge: 1, .. }
        ));
    }

    #[test]
    fn rejects_condition_on_foreign_node() {
        let edge = Edge::new(["Task1"], ["Task2"]).with_condition(Condition::FieldEqual {
            node: "Task0".to_string(),
            path: Vec::new(),
            value: json!(true),
        });
        let result = FlowGraph::new("flow1", vec![Edge::entry(["Task1"]), edge], tasks_only);
        assert!(matches!(
            result.unwrap_err(),
            GraphError::ConditionOutsideSources { edge: 1, .. }
        ));
    }

    #[test]
    fn dot_output_mentions_nodes() {
        let graph = FlowGraph::new(
            "flow1",
            vec![Edge::entry(["Task1"]), Edge::new(["Task1"], ["Task2"])],
            tasks_only,
        )
        .unwrap();
        let dot = graph.to_dot();
        assert!(dot.contains("digraph"));
        assert!(dot.contains("Task2"));
    }
}
