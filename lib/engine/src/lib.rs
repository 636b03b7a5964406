//! Flow progression engine for edgewise.
//!
//! A system is a set of tasks and flows. Each flow is a graph of conditional
//! edges between nodes, where a node is either a task or another flow. This
//! crate provides:
//! - Definition loading and validation ([`SystemDefinition`], [`SystemConfig`])
//! - The per-instance state machine ([`SystemState`])
//! - Argument propagation between nodes ([`PropagationPolicy`])
//! - Task execution with result validation and retries ([`TaskEnvelope`])
//! - A stateless entry point for schedulers ([`Dispatcher`])
//!
//! Work is never executed here. Nodes are started through a
//! [`NodeExecutor`], and all flow progress lives in a versioned state blob
//! passed in and out of every cycle.

pub mod condition;
pub mod definition;
pub mod dispatcher;
pub mod edge;
pub mod envelope;
pub mod error;
pub mod executor;
pub mod graph;
pub mod local;
pub mod node;
pub mod propagation;
pub mod schema;
pub mod settings;
pub mod state;
pub mod strategy;
pub mod task;

pub use condition::{Condition, PathSegment, ResultView};
pub use definition::{
    FlowConfig, FlowDefinition, SystemConfig, SystemDefinition, TaskConfig, TaskDefinition,
};
pub use dispatcher::{DispatchError, DispatchOutcome, DispatchRequest, Dispatcher};
pub use edge::Edge;
pub use envelope::{Envelope, STATE_FORMAT_VERSION};
pub use error::{ConfigError, EngineError, GraphError};
pub use executor::{ExecutorError, NodeExecutor, NodeHandle, StartRequest};
pub use graph::FlowGraph;
pub use local::LocalExecutor;
pub use node::{Node, NodeKind};
pub use propagation::PropagationPolicy;
pub use schema::{ResultValidator, SchemaRegistry, SchemaViolation};
pub use settings::DispatcherSettings;
pub use state::{
    ActiveNode, FinishedNode, FiringRecord, NodeStatus, ScheduledNode, StateSnapshot, SystemState,
};
pub use strategy::{CycleStatus, SamplingStrategy};
pub use task::{
    RetryContext, RetryDecision, RetryInstruction, Task, TaskEnvelope, TaskError, TaskFailure,
    TaskOutcome,
};
