//! Dispatcher: one scheduling cycle of one flow instance.
//!
//! The dispatcher is what an external scheduler invokes. Each call:
//! 1. Rebuilds the engine from the request's state blob (or starts fresh)
//! 2. Runs a single `update()` against the executor
//! 3. Returns the new state, plus the request to send again if the flow is
//!    still running
//!
//! The dispatcher keeps no state of its own, so consecutive cycles of the
//! same flow instance may run on different workers.

use crate::definition::SystemConfig;
use crate::error::EngineError;
use crate::executor::NodeExecutor;
use crate::state::SystemState;
use edgewise_core::{DispatcherId, NodeInstanceId};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Input of one dispatch cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchRequest {
    pub flow_name: String,
    pub dispatcher_id: DispatcherId,
    /// Flow arguments on the first cycle, the echoed `node_args` afterwards.
    pub node_args: Option<JsonValue>,
    /// State blob returned by the previous cycle; `None` starts the flow.
    pub state: Option<JsonValue>,
    /// Interval returned by the previous cycle.
    pub previous_retry: Option<Duration>,
}

impl DispatchRequest {
    /// Creates the request starting a new flow instance.
    #[must_use]
    pub fn start(flow_name: impl Into<String>, node_args: Option<JsonValue>) -> Self {
        Self {
            flow_name: flow_name.into(),
            dispatcher_id: DispatcherId::new(),
            node_args,
            state: None,
            previous_retry: None,
        }
    }
}

/// Result of one dispatch cycle.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    /// Nodes are still active; send `next` again after `after`.
    Retry {
        after: Duration,
        next: DispatchRequest,
    },
    /// No node is active and none failed.
    Finished { state: JsonValue },
    /// No node is active and at least one failed.
    Failed {
        state: JsonValue,
        failed_nodes: BTreeMap<String, Vec<NodeInstanceId>>,
    },
}

/// Errors from a dispatch cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    /// The engine could not be built from the request.
    Start {
        flow_name: String,
        dispatcher_id: DispatcherId,
        source: EngineError,
    },
    /// The engine failed while advancing the flow.
    ///
    /// `resume` carries the progress made before the failure; sending it
    /// again continues from there instead of from the previous request.
    Update {
        flow_name: String,
        dispatcher_id: DispatcherId,
        source: EngineError,
        resume: Option<Box<DispatchRequest>>,
    },
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Start {
                flow_name,
                dispatcher_id,
                source,
            } => write!(
                f,
                "failed to load flow '{flow_name}' ({dispatcher_id}): {source}"
            ),
            Self::Update {
                flow_name,
                dispatcher_id,
                source,
                ..
            } => write!(
                f,
                "failed to advance flow '{flow_name}' ({dispatcher_id}): {source}"
            ),
        }
    }
}

impl std::error::Error for DispatchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Start { source, .. } | Self::Update { source, .. } => Some(source),
        }
    }
}

/// Drives flow instances one cycle at a time.
pub struct Dispatcher<E: NodeExecutor> {
    config: Arc<SystemConfig>,
    executor: E,
}

impl<E: NodeExecutor> Dispatcher<E> {
    pub fn new(config: Arc<SystemConfig>, executor: E) -> Self {
        Self { config, executor }
    }

    /// Returns the system configuration.
    pub fn config(&self) -> &SystemConfig {
        &self.config
    }

    /// Returns the executor.
    pub fn executor(&self) -> &E {
        &self.executor
    }

    /// Runs one cycle of a flow instance.
    ///
    /// # Errors
    ///
    /// Returns an error if the request names an unknown flow, carries an
    /// unreadable state blob, or the executor fails.
    #[tracing::instrument(
        skip_all,
        fields(flow_name = %request.flow_name, dispatcher_id = %request.dispatcher_id)
    )]
    pub async fn dispatch(
        &self,
        request: DispatchRequest,
    ) -> edgewise_core::Result<DispatchOutcome, DispatchError> {
        let DispatchRequest {
            flow_name,
            dispatcher_id,
            node_args,
            state,
            previous_retry,
        } = request;

        let mut engine = SystemState::from_blob(
            &self.config,
            dispatcher_id,
            flow_name.as_str(),
            state,
            node_args,
        )
        .map_err(|source| DispatchError::Start {
            flow_name: flow_name.clone(),
            dispatcher_id,
            source,
        })?
        .with_previous_retry(previous_retry);

        let retry = match engine.update(&self.executor).await {
            Ok(retry) => retry,
            Err(source) => {
                let resume = engine.to_blob().ok().map(|state| {
                    Box::new(DispatchRequest {
                        flow_name: flow_name.clone(),
                        dispatcher_id,
                        node_args: engine.node_args().cloned(),
                        state: Some(state),
                        previous_retry,
                    })
                });
                tracing::warn!(error = %source, resumable = resume.is_some(), "flow cycle failed");
                return Err(DispatchError::Update {
                    flow_name,
                    dispatcher_id,
                    source,
                    resume,
                }
                .into());
            }
        };
        let state = engine.to_blob().map_err(|source| DispatchError::Update {
            flow_name: flow_name.clone(),
            dispatcher_id,
            source,
            resume: None,
        })?;

        let outcome = match retry {
            Some(after) => DispatchOutcome::Retry {
                after,
                next: DispatchRequest {
                    flow_name: flow_name.clone(),
                    dispatcher_id,
                    node_args: engine.node_args().cloned(),
                    state: Some(state),
                    previous_retry: Some(after),
                },
            },
            None if engine.has_failures() => {
                tracing::warn!(failed = ?engine.failed_nodes(), "flow failed");
                DispatchOutcome::Failed {
                    state,
                    failed_nodes: engine.failed_nodes().clone(),
                }
            }
            None => {
                tracing::info!("flow finished");
                DispatchOutcome::Finished { state }
            }
        };

        Ok(outcome)
    }
}
