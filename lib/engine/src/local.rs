//! In-memory node executor.
//!
//! `LocalExecutor` records every start request and lets the caller decide
//! when each occurrence finishes or fails. Tests drive flows with it, and the
//! CLI uses it for dry runs.

use crate::executor::{ExecutorError, NodeExecutor, NodeHandle, StartRequest};
use async_trait::async_trait;
use edgewise_core::NodeInstanceId;
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Debug, Clone, PartialEq)]
enum Outcome {
    Running,
    Finished(JsonValue),
    Failed(String),
}

#[derive(Debug, Default)]
struct Inner {
    started: Vec<StartRequest>,
    outcomes: HashMap<NodeHandle, Outcome>,
    /// Reasons to refuse the next start of a node, by node name.
    refusals: HashMap<String, String>,
}

/// Executor keeping all node state in memory.
///
/// Clones share state, so a test can hand one clone to the engine and keep
/// another to complete nodes.
#[derive(Debug, Clone, Default)]
pub struct LocalExecutor {
    inner: Arc<Mutex<Inner>>,
}

impl LocalExecutor {
    /// Creates an executor with no started nodes.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the handle the executor assigns to an occurrence.
    #[must_use]
    pub fn handle_for(instance_id: NodeInstanceId) -> NodeHandle {
        NodeHandle::new(format!("local-{instance_id}"))
    }

    /// Returns every start request, oldest first.
    #[must_use]
    pub fn started(&self) -> Vec<StartRequest> {
        self.lock().started.clone()
    }

    /// Returns every start request for the named node, oldest first.
    #[must_use]
    pub fn started_named(&self, node_name: &str) -> Vec<StartRequest> {
        self.lock()
            .started
            .iter()
            .filter(|r| r.node.name == node_name)
            .cloned()
            .collect()
    }

    /// Returns the most recent start request for the named node.
    #[must_use]
    pub fn last_started(&self, node_name: &str) -> Option<StartRequest> {
        self.started_named(node_name).pop()
    }

    /// Returns the start requests of occurrences that are still running.
    #[must_use]
    pub fn running(&self) -> Vec<StartRequest> {
        let inner = self.lock();
        inner
            .started
            .iter()
            .filter(|r| {
                inner.outcomes.get(&Self::handle_for(r.instance_id)) == Some(&Outcome::Running)
            })
            .cloned()
            .collect()
    }

    /// Marks an occurrence as finished with the given result.
    ///
    /// # Errors
    ///
    /// Returns an error if the occurrence was never started.
    pub fn finish(
        &self,
        instance_id: NodeInstanceId,
        result: JsonValue,
    ) -> Result<(), ExecutorError> {
        self.settle(instance_id, Outcome::Finished(result))
    }

    /// Marks an occurrence as permanently failed.
    ///
    /// # Errors
    ///
    /// Returns an error if the occurrence was never started.
    pub fn fail(
        &self,
        instance_id: NodeInstanceId,
        reason: impl Into<String>,
    ) -> Result<(), ExecutorError> {
        self.settle(instance_id, Outcome::Failed(reason.into()))
    }

    /// Makes the next start of the named node fail as if the executor were
    /// unavailable.
    pub fn refuse_next_start(&self, node_name: impl Into<String>, reason: impl Into<String>) {
        self.lock().refusals.insert(node_name.into(), reason.into());
    }

    /// Returns the failure reason recorded for an occurrence.
    #[must_use]
    pub fn failure_reason(&self, instance_id: NodeInstanceId) -> Option<String> {
        match self.lock().outcomes.get(&Self::handle_for(instance_id)) {
            Some(Outcome::Failed(reason)) => Some(reason.clone()),
            _ => None,
        }
    }

    fn settle(&self, instance_id: NodeInstanceId, outcome: Outcome) -> Result<(), ExecutorError> {
        let handle = Self::handle_for(instance_id);
        let mut inner = self.lock();
        let slot = inner
            .outcomes
            .get_mut(&handle)
            .ok_or(ExecutorError::UnknownHandle { handle })?;
        *slot = outcome;
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn outcome(&self, handle: &NodeHandle) -> Result<Outcome, ExecutorError> {
        self.lock()
            .outcomes
            .get(handle)
            .cloned()
            .ok_or_else(|| ExecutorError::UnknownHandle {
                handle: handle.clone(),
            })
    }
}

#[async_trait]
impl NodeExecutor for LocalExecutor {
    async fn start(&self, request: StartRequest) -> Result<NodeHandle, ExecutorError> {
        let handle = Self::handle_for(request.instance_id);
        let mut inner = self.lock();
        if let Some(reason) = inner.refusals.remove(&request.node.name) {
            return Err(ExecutorError::Unavailable { reason });
        }
        inner.outcomes.insert(handle.clone(), Outcome::Running);
        inner.started.push(request);
        Ok(handle)
    }

    async fn is_finished(&self, handle: &NodeHandle) -> Result<bool, ExecutorError> {
        Ok(matches!(self.outcome(handle)?, Outcome::Finished(_)))
    }

    async fn is_failed(&self, handle: &NodeHandle) -> Result<bool, ExecutorError> {
        Ok(matches!(self.outcome(handle)?, Outcome::Failed(_)))
    }

    async fn result(&self, handle: &NodeHandle) -> Result<JsonValue, ExecutorError> {
        match self.outcome(handle)? {
            Outcome::Finished(result) => Ok(result),
            _ => Err(ExecutorError::ResultUnavailable {
                handle: handle.clone(),
                reason: "node has not finished".to_string(),
            }),
        }
    }
}
