//! Flow progression engine.
//!
//! A [`SystemState`] is built for one flow instance from its serialized
//! [`StateSnapshot`], advanced by a single call to [`SystemState::update`],
//! and serialized again. Nothing survives between calls except the snapshot
//! and the `node_args` the caller passes back in, so any worker can pick up
//! any flow instance.
//!
//! Edges fire per completion event. When a node finishes, every edge listing
//! it as a predecessor is considered once for that occurrence:
//! - an edge with a single predecessor fires right away if its condition
//!   holds for the new result
//! - a join edge records the occurrence and fires once for every new
//!   combination of predecessor occurrences whose results satisfy the
//!   condition
//!
//! Each firing bumps the edge's generation counter, and started nodes record
//! the `(edge, generation)` pair that triggered them. Self-loops need no
//! special handling: a node finishing again is just another event.
//!
//! Planned starts are written to the snapshot as [`ScheduledNode`]s before the
//! executor sees them. If the executor refuses one, the rest stay scheduled
//! and the next cycle starts them without firing any edge again.

use crate::condition::ResultView;
use crate::definition::{FlowConfig, SystemConfig};
use crate::edge::Edge;
use crate::envelope::Envelope;
use crate::error::EngineError;
use crate::executor::{NodeExecutor, NodeHandle, StartRequest};
use crate::node::{Node, NodeKind};
use crate::strategy::CycleStatus;
use chrono::{DateTime, Utc};
use edgewise_core::{DispatcherId, NodeInstanceId};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// Identifies one firing of an edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FiringRecord {
    /// Index of the edge in its flow.
    pub edge: usize,
    /// How many times the edge had fired, this firing included.
    pub generation: u64,
}

/// A started node that has not been observed as finished or failed yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveNode {
    pub name: String,
    pub kind: NodeKind,
    pub id: NodeInstanceId,
    pub handle: NodeHandle,
    pub started_at: DateTime<Utc>,
    /// Predecessor occurrences that triggered this node.
    #[serde(default)]
    pub parent: BTreeMap<String, NodeInstanceId>,
    /// The firing that started this node; `None` for snapshots that predate
    /// firing records.
    #[serde(default)]
    pub trigger: Option<FiringRecord>,
}

/// A node planned for start that the executor has not accepted yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledNode {
    pub name: String,
    pub kind: NodeKind,
    /// Instance id the node is started with, kept across attempts.
    pub id: NodeInstanceId,
    pub node_args: Option<JsonValue>,
    #[serde(default)]
    pub parent: BTreeMap<String, NodeInstanceId>,
    pub trigger: FiringRecord,
}

/// Completions of one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinishedNode {
    /// The most recent finished occurrence.
    pub latest: NodeInstanceId,
    /// How many occurrences finished.
    pub count: u64,
}

/// The serializable progress of one flow instance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    /// Started nodes, in start order.
    #[serde(default)]
    pub active_nodes: Vec<ActiveNode>,
    /// Nodes planned for start, in start order.
    #[serde(default)]
    pub scheduled_nodes: Vec<ScheduledNode>,
    /// Completions by node name.
    #[serde(default)]
    pub finished_nodes: BTreeMap<String, FinishedNode>,
    /// Failed occurrences by node name, in completion order.
    #[serde(default)]
    pub failed_nodes: BTreeMap<String, Vec<NodeInstanceId>>,
    /// Occurrences recorded for each join edge, by predecessor name.
    #[serde(default)]
    pub waiting_edges: BTreeMap<usize, BTreeMap<String, Vec<NodeInstanceId>>>,
    /// Results of occurrences recorded in `waiting_edges`.
    #[serde(default)]
    pub results: BTreeMap<NodeInstanceId, JsonValue>,
    /// Number of times each edge has fired.
    #[serde(default)]
    pub edge_generations: BTreeMap<usize, u64>,
}

/// Where a node stands within a flow instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeStatus {
    /// Never started.
    Waiting,
    /// At least one occurrence is active or scheduled.
    Running,
    /// The latest settled occurrence finished.
    Finished,
    /// An occurrence failed and none is active.
    Failed,
}

#[derive(Debug)]
enum Settlement {
    Finished(JsonValue),
    Failed,
}

#[derive(Debug)]
struct Completion {
    name: String,
    id: NodeInstanceId,
    result: JsonValue,
}

#[derive(Debug)]
struct Firing {
    edge: usize,
    parent: BTreeMap<String, NodeInstanceId>,
    /// Predecessor results in `from` order.
    results: Vec<JsonValue>,
}

/// The engine for one flow instance.
#[derive(Debug, Clone)]
pub struct SystemState {
    flow: Arc<FlowConfig>,
    flow_name: String,
    dispatcher_id: DispatcherId,
    node_args: Option<JsonValue>,
    previous_retry: Option<Duration>,
    /// True until the entry edges have been evaluated.
    fresh: bool,
    snapshot: StateSnapshot,
}

impl SystemState {
    /// Builds the engine for a flow instance.
    ///
    /// `state` is `None` to start the flow. `node_args` is the flow's
    /// arguments on a fresh start and the previously returned
    /// [`node_args`](Self::node_args) afterwards.
    ///
    /// # Errors
    ///
    /// Returns an error if the flow is unknown or the snapshot does not fit
    /// the flow's graph.
    pub fn new(
        config: &SystemConfig,
        dispatcher_id: DispatcherId,
        flow_name: impl Into<String>,
        state: Option<StateSnapshot>,
        node_args: Option<JsonValue>,
    ) -> Result<Self, EngineError> {
        let flow_name = flow_name.into();
        let flow = config
            .flow(&flow_name)
            .ok_or_else(|| EngineError::UnknownFlow {
                flow_name: flow_name.clone(),
            })?;

        let fresh = state.is_none();
        let snapshot = state.unwrap_or_default();
        check_snapshot(&flow, &snapshot)?;

        Ok(Self {
            flow,
            flow_name,
            dispatcher_id,
            node_args,
            previous_retry: None,
            fresh,
            snapshot,
        })
    }

    /// Builds the engine from a serialized state blob.
    ///
    /// # Errors
    ///
    /// Returns an error if the blob has a foreign version, is malformed, or
    /// does not fit the flow's graph.
    pub fn from_blob(
        config: &SystemConfig,
        dispatcher_id: DispatcherId,
        flow_name: impl Into<String>,
        blob: Option<JsonValue>,
        node_args: Option<JsonValue>,
    ) -> Result<Self, EngineError> {
        let state = blob
            .map(Envelope::<StateSnapshot>::from_value)
            .transpose()?
            .map(Envelope::into_payload);
        Self::new(config, dispatcher_id, flow_name, state, node_args)
    }

    /// Sets the interval returned by the previous cycle.
    ///
    /// Interval-growing sampling strategies start over without it.
    #[must_use]
    pub fn with_previous_retry(mut self, previous_retry: Option<Duration>) -> Self {
        self.previous_retry = previous_retry;
        self
    }

    /// Serializes the state into a versioned blob.
    ///
    /// # Errors
    ///
    /// Returns an error if a result cannot be represented as JSON.
    pub fn to_blob(&self) -> Result<JsonValue, EngineError> {
        Envelope::new(&self.snapshot).to_value()
    }

    /// Returns a copy of the current snapshot.
    #[must_use]
    pub fn to_snapshot(&self) -> StateSnapshot {
        self.snapshot.clone()
    }

    /// Returns the current snapshot.
    #[must_use]
    pub fn snapshot(&self) -> &StateSnapshot {
        &self.snapshot
    }

    /// Returns the arguments to pass back on the next cycle.
    #[must_use]
    pub fn node_args(&self) -> Option<&JsonValue> {
        self.node_args.as_ref()
    }

    #[must_use]
    pub fn flow_name(&self) -> &str {
        &self.flow_name
    }

    #[must_use]
    pub fn dispatcher_id(&self) -> DispatcherId {
        self.dispatcher_id
    }

    /// Returns the nodes waiting to be handed to the executor.
    #[must_use]
    pub fn scheduled_nodes(&self) -> &[ScheduledNode] {
        &self.snapshot.scheduled_nodes
    }

    /// Returns the nodes that are still active.
    #[must_use]
    pub fn active_nodes(&self) -> &[ActiveNode] {
        &self.snapshot.active_nodes
    }

    /// Returns failed occurrences by node name.
    #[must_use]
    pub fn failed_nodes(&self) -> &BTreeMap<String, Vec<NodeInstanceId>> {
        &self.snapshot.failed_nodes
    }

    /// Returns true if any node failed permanently.
    #[must_use]
    pub fn has_failures(&self) -> bool {
        !self.snapshot.failed_nodes.is_empty()
    }

    /// Returns the status of a node within this flow instance.
    #[must_use]
    pub fn node_status(&self, node_name: &str) -> NodeStatus {
        if self.snapshot.active_nodes.iter().any(|n| n.name == node_name)
            || self.snapshot.scheduled_nodes.iter().any(|n| n.name == node_name)
        {
            NodeStatus::Running
        } else if self.snapshot.failed_nodes.contains_key(node_name) {
            NodeStatus::Failed
        } else if self.snapshot.finished_nodes.contains_key(node_name) {
            NodeStatus::Finished
        } else {
            NodeStatus::Waiting
        }
    }

    /// Advances the flow by one cycle.
    ///
    /// Settles active nodes that finished or failed, fires the edges their
    /// completions satisfy, and starts the destination nodes through
    /// `executor`. Returns how long to wait before the next cycle, or `None`
    /// once no node is active.
    ///
    /// Calling this again without any node settling changes nothing.
    ///
    /// # Errors
    ///
    /// Returns an error if the executor fails. An error while polling leaves
    /// the state untouched. An error while starting keeps the nodes started
    /// so far as active and the rest as scheduled; the state is consistent
    /// and the next `update()` resumes the remaining starts.
    pub async fn update<E>(&mut self, executor: &E) -> Result<Option<Duration>, EngineError>
    where
        E: NodeExecutor + ?Sized,
    {
        let settlements = self.poll_active(executor).await?;
        let (completions, new_failed) = self.settle(settlements);

        let mut firings = Vec::new();
        let entry = self.fresh;
        if entry {
            self.fresh = false;
            firings.extend(self.entry_firings());
        }
        for completion in &completions {
            self.fire_from(completion, &mut firings);
        }

        let planned = self.plan_starts(firings)?;
        self.snapshot.scheduled_nodes.extend(planned);
        if entry && self.flow.propagation.node_args_from_first {
            self.node_args = None;
        }
        let new_started = self.start_scheduled(executor).await?;

        let status = CycleStatus {
            previous_retry: self.previous_retry,
            active_nodes: self.snapshot.active_nodes.len(),
            new_started_nodes: new_started,
            new_finished_nodes: completions.len(),
            new_failed_nodes: new_failed,
        };
        let retry = self.flow.sampling.next_retry(&status);

        tracing::debug!(
            flow_name = %self.flow_name,
            dispatcher_id = %self.dispatcher_id,
            active = status.active_nodes,
            started = new_started,
            finished = status.new_finished_nodes,
            failed = new_failed,
            retry_secs = retry.map(|d| d.as_secs()),
            "flow cycle complete"
        );

        self.previous_retry = retry;
        Ok(retry)
    }

    async fn poll_active<E>(&self, executor: &E) -> Result<Vec<Option<Settlement>>, EngineError>
    where
        E: NodeExecutor + ?Sized,
    {
        let mut settlements = Vec::with_capacity(self.snapshot.active_nodes.len());
        for node in &self.snapshot.active_nodes {
            let settlement = if executor.is_finished(&node.handle).await? {
                Some(Settlement::Finished(executor.result(&node.handle).await?))
            } else if executor.is_failed(&node.handle).await? {
                Some(Settlement::Failed)
            } else {
                None
            };
            settlements.push(settlement);
        }
        Ok(settlements)
    }

    fn settle(&mut self, settlements: Vec<Option<Settlement>>) -> (Vec<Completion>, usize) {
        let mut completions = Vec::new();
        let mut failed = 0;
        let active = std::mem::take(&mut self.snapshot.active_nodes);

        for (node, settlement) in active.into_iter().zip(settlements) {
            match settlement {
                None => self.snapshot.active_nodes.push(node),
                Some(Settlement::Finished(result)) => {
                    tracing::debug!(node = %node.name, instance_id = %node.id, "node finished");
                    self.snapshot
                        .finished_nodes
                        .entry(node.name.clone())
                        .and_modify(|finished| {
                            finished.latest = node.id;
                            finished.count += 1;
                        })
                        .or_insert(FinishedNode {
                            latest: node.id,
                            count: 1,
                        });
                    completions.push(Completion {
                        name: node.name,
                        id: node.id,
                        result,
                    });
                }
                Some(Settlement::Failed) => {
                    tracing::warn!(
                        flow_name = %self.flow_name,
                        node = %node.name,
                        instance_id = %node.id,
                        "node failed"
                    );
                    self.snapshot
                        .failed_nodes
                        .entry(node.name)
                        .or_default()
                        .push(node.id);
                    failed += 1;
                }
            }
        }

        (completions, failed)
    }

    fn entry_firings(&self) -> Vec<Firing> {
        let no_results = ResultView::new();
        self.flow
            .graph
            .entry_edges()
            .filter(|(_, edge)| edge.condition.evaluate(&no_results))
            .map(|(idx, _)| Firing {
                edge: idx,
                parent: BTreeMap::new(),
                results: Vec::new(),
            })
            .collect()
    }

    fn fire_from(&mut self, completion: &Completion, firings: &mut Vec<Firing>) {
        let flow = Arc::clone(&self.flow);

        for (idx, edge) in flow.graph.edges_from(&completion.name) {
            if edge.from.len() == 1 {
                let view = ResultView::from([(completion.name.as_str(), &completion.result)]);
                if edge.condition.evaluate(&view) {
                    firings.push(Firing {
                        edge: idx,
                        parent: BTreeMap::from([(completion.name.clone(), completion.id)]),
                        results: vec![completion.result.clone()],
                    });
                }
                continue;
            }

            // Join: pair the new occurrence with every recorded occurrence of
            // the other predecessors.
            let waiting = self.snapshot.waiting_edges.entry(idx).or_default();
            let mut combinations = vec![BTreeMap::from([(completion.name.clone(), completion.id)])];
            for source in edge.from.iter().filter(|s| **s != completion.name) {
                let recorded = waiting.get(source).map(Vec::as_slice).unwrap_or_default();
                let mut extended = Vec::with_capacity(combinations.len() * recorded.len());
                for combination in &combinations {
                    for id in recorded {
                        let mut next = combination.clone();
                        next.insert(source.clone(), *id);
                        extended.push(next);
                    }
                }
                combinations = extended;
            }
            waiting
                .entry(completion.name.clone())
                .or_default()
                .push(completion.id);
            self.snapshot
                .results
                .insert(completion.id, completion.result.clone());

            for parent in combinations {
                let Some(results) = edge
                    .from
                    .iter()
                    .map(|name| {
                        parent
                            .get(name)
                            .and_then(|id| self.snapshot.results.get(id))
                    })
                    .collect::<Option<Vec<&JsonValue>>>()
                else {
                    continue;
                };

                let view: ResultView<'_> = edge
                    .from
                    .iter()
                    .map(String::as_str)
                    .zip(results.iter().copied())
                    .collect();
                if edge.condition.evaluate(&view) {
                    firings.push(Firing {
                        edge: idx,
                        parent,
                        results: results.into_iter().cloned().collect(),
                    });
                }
            }
        }
    }

    /// Resolves arguments for every node the firings start.
    ///
    /// Several edges reaching one node in the same cycle start it once per
    /// firing of the last of those edges; firings of the other edges are
    /// dropped without counting as a generation. Firings of a single edge
    /// come from distinct completions and each start the node.
    fn plan_starts(&mut self, firings: Vec<Firing>) -> Result<Vec<ScheduledNode>, EngineError> {
        let flow = Arc::clone(&self.flow);

        let mut winners: BTreeMap<&str, usize> = BTreeMap::new();
        for firing in &firings {
            for target in &flow_edge(&flow, firing.edge)?.to {
                if let Some(previous) = winners.insert(target.as_str(), firing.edge) {
                    if previous != firing.edge {
                        tracing::debug!(
                            node = %target,
                            edge = firing.edge,
                            superseded_edge = previous,
                            "node reached by several edges in one cycle"
                        );
                    }
                }
            }
        }

        let mut scheduled = Vec::new();
        for firing in firings {
            let edge = flow_edge(&flow, firing.edge)?;
            let targets: Vec<&String> = edge
                .to
                .iter()
                .filter(|target| winners.get(target.as_str()) == Some(&firing.edge))
                .collect();
            if targets.is_empty() {
                continue;
            }

            let generation = self
                .snapshot
                .edge_generations
                .entry(firing.edge)
                .or_insert(0);
            *generation += 1;
            let trigger = FiringRecord {
                edge: firing.edge,
                generation: *generation,
            };

            let results: Vec<&JsonValue> = firing.results.iter().collect();
            for target in targets {
                let kind = flow
                    .graph
                    .kind_of(target)
                    .ok_or_else(|| EngineError::InvalidState {
                        reason: format!("node '{target}' is not part of the flow"),
                    })?;
                scheduled.push(ScheduledNode {
                    name: target.clone(),
                    kind,
                    id: NodeInstanceId::new(),
                    node_args: flow
                        .propagation
                        .resolve(kind, &results, self.node_args.as_ref()),
                    parent: firing.parent.clone(),
                    trigger,
                });
            }
        }

        Ok(scheduled)
    }

    /// Hands scheduled nodes to the executor, oldest first.
    async fn start_scheduled<E>(&mut self, executor: &E) -> Result<usize, EngineError>
    where
        E: NodeExecutor + ?Sized,
    {
        let mut started = 0;
        loop {
            let request = match self.snapshot.scheduled_nodes.first() {
                Some(next) => StartRequest {
                    flow_name: self.flow_name.clone(),
                    dispatcher_id: self.dispatcher_id,
                    node: Node {
                        name: next.name.clone(),
                        kind: next.kind,
                    },
                    instance_id: next.id,
                    node_args: next.node_args.clone(),
                    parent: next.parent.clone(),
                },
                None => break,
            };

            let handle = executor.start(request).await.inspect_err(|e| {
                tracing::warn!(
                    flow_name = %self.flow_name,
                    scheduled = self.snapshot.scheduled_nodes.len(),
                    error = %e,
                    "executor refused start"
                );
            })?;
            let node = self.snapshot.scheduled_nodes.remove(0);

            tracing::info!(
                flow_name = %self.flow_name,
                node = %node.name,
                instance_id = %node.id,
                edge = node.trigger.edge,
                generation = node.trigger.generation,
                "started node"
            );

            self.snapshot.active_nodes.push(ActiveNode {
                name: node.name,
                kind: node.kind,
                id: node.id,
                handle,
                started_at: Utc::now(),
                parent: node.parent,
                trigger: Some(node.trigger),
            });
            started += 1;
        }
        Ok(started)
    }
}

fn flow_edge(flow: &FlowConfig, idx: usize) -> Result<&Edge, EngineError> {
    flow.graph.edge(idx).ok_or_else(|| EngineError::InvalidState {
        reason: format!("edge #{idx} does not exist"),
    })
}

fn check_snapshot(flow: &FlowConfig, snapshot: &StateSnapshot) -> Result<(), EngineError> {
    if let Some(node) = snapshot
        .active_nodes
        .iter()
        .find(|n| flow.graph.kind_of(&n.name) != Some(n.kind))
    {
        return Err(EngineError::InvalidState {
            reason: format!("active node '{}' is not a {} of the flow", node.name, node.kind),
        });
    }

    if let Some(node) = snapshot
        .scheduled_nodes
        .iter()
        .find(|n| flow.graph.kind_of(&n.name) != Some(n.kind))
    {
        return Err(EngineError::InvalidState {
            reason: format!("scheduled node '{}' is not a {} of the flow", node.name, node.kind),
        });
    }

    for &idx in snapshot.waiting_edges.keys() {
        match flow.graph.edge(idx) {
            Some(edge) if edge.from.len() > 1 => {}
            _ => {
                return Err(EngineError::InvalidState {
                    reason: format!("edge #{idx} is not a join edge of the flow"),
                });
            }
        }
    }

    Ok(())
}
