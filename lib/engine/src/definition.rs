//! System definitions and their compiled form.
//!
//! A system definition is the declarative YAML document listing every task
//! and flow:
//!
//! ```yaml
//! tasks:
//!   - name: Task1
//!     output_schema: schemas/task1.json
//!     max_retry: 3
//! flows:
//!   - name: flow1
//!     node_args_from_first: true
//!     edges:
//!       - from: []
//!         to: [Task1]
//!       - from: [Task1]
//!         to: [flow2]
//! ```
//!
//! [`SystemConfig::compile`] validates a definition once and produces the
//! immutable configuration shared by every flow instance.

use crate::edge::Edge;
use crate::error::ConfigError;
use crate::graph::FlowGraph;
use crate::node::NodeKind;
use crate::propagation::PropagationPolicy;
use crate::schema::SchemaRegistry;
use crate::settings::DispatcherSettings;
use crate::strategy::SamplingStrategy;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// The declarative description of all tasks and flows.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SystemDefinition {
    /// Declared tasks.
    #[serde(default)]
    pub tasks: Vec<TaskDefinition>,
    /// Declared flows.
    #[serde(default)]
    pub flows: Vec<FlowDefinition>,
    /// Directory relative schema paths are resolved against.
    #[serde(skip)]
    pub base_dir: Option<PathBuf>,
}

/// A declared task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskDefinition {
    /// Task name, unique across tasks and flows.
    pub name: String,
    /// JSON Schema file the task's result must conform to.
    #[serde(default)]
    pub output_schema: Option<PathBuf>,
    /// Retry bound; falls back to the dispatcher default.
    #[serde(default)]
    pub max_retry: Option<u32>,
    /// Seconds to wait before a retry; falls back to the dispatcher default.
    #[serde(default)]
    pub retry_countdown: Option<u64>,
}

/// A declared flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowDefinition {
    /// Flow name, unique across tasks and flows.
    pub name: String,
    /// Edges in evaluation order.
    #[serde(default)]
    pub edges: Vec<Edge>,
    #[serde(default)]
    pub node_args_from_first: bool,
    #[serde(default)]
    pub propagate_node_args: bool,
    /// Retry interval strategy; falls back to the dispatcher default.
    #[serde(default)]
    pub sampling: Option<SamplingStrategy>,
}

impl SystemDefinition {
    /// Creates an empty definition.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a task.
    #[must_use]
    pub fn with_task(mut self, task: TaskDefinition) -> Self {
        self.tasks.push(task);
        self
    }

    /// Adds a flow.
    #[must_use]
    pub fn with_flow(mut self, flow: FlowDefinition) -> Self {
        self.flows.push(flow);
        self
    }

    /// Parses a definition from YAML.
    ///
    /// # Errors
    ///
    /// Returns an error if the document is not a valid definition.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(yaml).map_err(|e| ConfigError::Parse {
            reason: e.to_string(),
        })
    }

    /// Reads a definition from a YAML file.
    ///
    /// Relative schema paths are resolved against the file's directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;

        let mut definition = Self::from_yaml_str(&raw)?;
        definition.base_dir = path.parent().map(Path::to_path_buf);
        Ok(definition)
    }

    fn resolve_path(&self, path: &Path) -> PathBuf {
        match &self.base_dir {
            Some(base) if path.is_relative() => base.join(path),
            _ => path.to_path_buf(),
        }
    }
}

impl TaskDefinition {
    /// Declares a task with default retry behavior and no schema.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            output_schema: None,
            max_retry: None,
            retry_countdown: None,
        }
    }

    /// Sets the output schema file.
    #[must_use]
    pub fn with_output_schema(mut self, path: impl Into<PathBuf>) -> Self {
        self.output_schema = Some(path.into());
        self
    }

    /// Sets the retry bound.
    #[must_use]
    pub fn with_max_retry(mut self, max_retry: u32) -> Self {
        self.max_retry = Some(max_retry);
        self
    }

    /// Sets the retry countdown in seconds.
    #[must_use]
    pub fn with_retry_countdown(mut self, secs: u64) -> Self {
        self.retry_countdown = Some(secs);
        self
    }
}

impl FlowDefinition {
    /// Declares a flow with the given edges and no propagation.
    #[must_use]
    pub fn new(name: impl Into<String>, edges: Vec<Edge>) -> Self {
        Self {
            name: name.into(),
            edges,
            node_args_from_first: false,
            propagate_node_args: false,
            sampling: None,
        }
    }

    /// Sets the propagation flags.
    #[must_use]
    pub fn with_propagation(mut self, policy: PropagationPolicy) -> Self {
        self.node_args_from_first = policy.node_args_from_first;
        self.propagate_node_args = policy.propagate_node_args;
        self
    }

    /// Sets the sampling strategy.
    #[must_use]
    pub fn with_sampling(mut self, sampling: SamplingStrategy) -> Self {
        self.sampling = Some(sampling);
        self
    }

    /// Returns the flow's propagation policy.
    #[must_use]
    pub fn propagation(&self) -> PropagationPolicy {
        PropagationPolicy::new(self.node_args_from_first, self.propagate_node_args)
    }
}

/// Compiled configuration of one flow.
#[derive(Debug, Clone)]
pub struct FlowConfig {
    pub graph: FlowGraph,
    pub propagation: PropagationPolicy,
    pub sampling: SamplingStrategy,
}

/// Compiled retry settings of one task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskConfig {
    /// Retry bound; `None` retries without limit.
    pub max_retry: Option<u32>,
    /// Delay before each retry.
    pub retry_countdown: Duration,
}

/// The validated, immutable configuration of a whole system.
#[derive(Debug, Clone, Default)]
pub struct SystemConfig {
    flows: HashMap<String, Arc<FlowConfig>>,
    tasks: HashMap<String, TaskConfig>,
    schemas: SchemaRegistry,
}

impl SystemConfig {
    /// Validates a definition and compiles it.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - A name is declared twice, as tasks, flows, or one of each
    /// - A flow references a node that is neither a task nor a flow
    /// - A flow's graph is invalid
    /// - An output schema cannot be loaded or compiled
    pub fn compile(
        definition: &SystemDefinition,
        settings: &DispatcherSettings,
    ) -> Result<Self, ConfigError> {
        let mut seen = HashSet::new();
        for name in definition
            .tasks
            .iter()
            .map(|t| &t.name)
            .chain(definition.flows.iter().map(|f| &f.name))
        {
            if !seen.insert(name.as_str()) {
                return Err(ConfigError::DuplicateName { name: name.clone() });
            }
        }

        let flow_names: HashSet<&str> = definition.flows.iter().map(|f| f.name.as_str()).collect();
        let kind_of = |name: &str| {
            if flow_names.contains(name) {
                NodeKind::Flow
            } else {
                NodeKind::Task
            }
        };

        let mut flows = HashMap::new();
        for flow in &definition.flows {
            let referenced: BTreeSet<&str> = flow
                .edges
                .iter()
                .flat_map(|e| e.from.iter().chain(&e.to))
                .map(String::as_str)
                .collect();
            if let Some(node) = referenced
                .into_iter()
                .find(|n| !n.is_empty() && !seen.contains(n))
            {
                return Err(ConfigError::UnknownNode {
                    flow_name: flow.name.clone(),
                    node: node.to_string(),
                });
            }

            let graph = FlowGraph::new(&flow.name, flow.edges.clone(), kind_of).map_err(
                |source| ConfigError::Graph {
                    flow_name: flow.name.clone(),
                    source,
                },
            )?;

            tracing::debug!(
                flow_name = %flow.name,
                edges = graph.edge_count(),
                nodes = graph.node_count(),
                "compiled flow"
            );

            flows.insert(
                flow.name.clone(),
                Arc::new(FlowConfig {
                    graph,
                    propagation: flow.propagation(),
                    sampling: flow.sampling.unwrap_or_else(|| settings.default_sampling()),
                }),
            );
        }

        let mut tasks = HashMap::new();
        let mut schemas = SchemaRegistry::new();
        for task in &definition.tasks {
            if let Some(path) = &task.output_schema {
                schemas.load(&task.name, &definition.resolve_path(path))?;
            }

            tasks.insert(
                task.name.clone(),
                TaskConfig {
                    max_retry: task.max_retry.or(settings.default_max_retry),
                    retry_countdown: task
                        .retry_countdown
                        .map_or_else(|| settings.default_retry_countdown(), Duration::from_secs),
                },
            );
        }

        Ok(Self {
            flows,
            tasks,
            schemas,
        })
    }

    /// Replaces the output schemas.
    #[must_use]
    pub fn with_schemas(mut self, schemas: SchemaRegistry) -> Self {
        self.schemas = schemas;
        self
    }

    /// Returns a compiled flow.
    #[must_use]
    pub fn flow(&self, flow_name: &str) -> Option<Arc<FlowConfig>> {
        self.flows.get(flow_name).cloned()
    }

    /// Returns flow names in sorted order.
    #[must_use]
    pub fn flow_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.flows.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Returns a task's retry settings.
    #[must_use]
    pub fn task(&self, task_name: &str) -> Option<&TaskConfig> {
        self.tasks.get(task_name)
    }

    /// Returns the output schemas.
    #[must_use]
    pub fn schemas(&self) -> &SchemaRegistry {
        &self.schemas
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GraphError;
    use std::io::Write;

    const DEFINITION: &str = r"
tasks:
  - name: Task1
    max_retry: 3
    retry_countdown: 10
  - name: Task2
flows:
  - name: flow1
    node_args_from_first: true
    sampling:
      name: constant
      retry: 5
    edges:
      - to: [Task1]
      - from: [Task1]
        to: [Task2, flow2]
        condition:
          name: field_equal
          node: Task1
          path: [status]
          value: ok
  - name: flow2
    edges:
      - to: [Task2]
";

    fn compile(definition: &SystemDefinition) -> Result<SystemConfig, ConfigError> {
        SystemConfig::compile(definition, &DispatcherSettings::default())
    }

    #[test]
    fn compiles_yaml_definition() {
        let definition = SystemDefinition::from_yaml_str(DEFINITION).unwrap();
        let config = compile(&definition).unwrap();

        assert_eq!(config.flow_names(), vec!["flow1", "flow2"]);

        let flow1 = config.flow("flow1").unwrap();
        assert_eq!(flow1.propagation, PropagationPolicy::new(true, false));
        assert_eq!(flow1.sampling, SamplingStrategy::Constant { retry: 5 });
        assert_eq!(flow1.graph.kind_of("flow2"), Some(NodeKind::Flow));
        assert_eq!(flow1.graph.kind_of("Task2"), Some(NodeKind::Task));

        let flow2 = config.flow("flow2").unwrap();
        assert_eq!(flow2.sampling, SamplingStrategy::default());
    }

    #[test]
    fn task_settings_fall_back_to_defaults() {
        let definition = SystemDefinition::from_yaml_str(DEFINITION).unwrap();
        let settings = DispatcherSettings {
            default_max_retry: Some(1),
            default_retry_countdown_secs: 4,
            ..DispatcherSettings::default()
        };
        let config = SystemConfig::compile(&definition, &settings).unwrap();

        assert_eq!(
            config.task("Task1"),
            Some(&TaskConfig {
                max_retry: Some(3),
                retry_countdown: Duration::from_secs(10)
            })
        );
        assert_eq!(
            config.task("Task2"),
            Some(&TaskConfig {
                max_retry: Some(1),
                retry_countdown: Duration::from_secs(4)
            })
        );
    }

    #[test]
    fn rejects_duplicate_names() {
        let definition = SystemDefinition::new()
            .with_task(TaskDefinition::new("same"))
            .with_flow(FlowDefinition::new("same", vec![Edge::entry(["same"])]));

        assert_eq!(
            compile(&definition).unwrap_err(),
            ConfigError::DuplicateName {
                name: "same".to_string()
            }
        );
    }

    #[test]
    fn rejects_undeclared_node() {
        let definition = SystemDefinition::new()
            .with_flow(FlowDefinition::new("flow1", vec![Edge::entry(["Ghost"])]));

        assert_eq!(
            compile(&definition).unwrap_err(),
            ConfigError::UnknownNode {
                flow_name: "flow1".to_string(),
                node: "Ghost".to_string()
            }
        );
    }

    #[test]
    fn graph_errors_carry_flow_name() {
        let definition = SystemDefinition::new()
            .with_task(TaskDefinition::new("Task1"))
            .with_task(TaskDefinition::new("Task2"))
            .with_flow(FlowDefinition::new(
                "flow1",
                vec![Edge::entry(["Task1"]), Edge::new(["Task2"], ["Task1"])],
            ));

        let err = compile(&definition).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Graph {
                ref flow_name,
                source: GraphError::UnreachableNode { .. }
            } if flow_name == "flow1"
        ));
    }

    #[test]
    fn malformed_yaml_is_parse_error() {
        let result = SystemDefinition::from_yaml_str("flows: [name: 3");
        assert!(matches!(result, Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn schema_paths_resolve_next_to_definition() {
        let dir = tempfile::tempdir().unwrap();

        let mut schema = std::fs::File::create(dir.path().join("task1.json")).unwrap();
        write!(schema, r#"{{"type": "object", "required": ["id"]}}"#).unwrap();

        let definition_path = dir.path().join("system.yml");
        std::fs::write(
            &definition_path,
            "tasks:\n  - name: Task1\n    output_schema: task1.json\nflows:\n  - name: flow1\n    edges:\n      - to: [Task1]\n",
        )
        .unwrap();

        let definition = SystemDefinition::from_path(&definition_path).unwrap();
        let config = compile(&definition).unwrap();

        assert!(config.schemas().has_schema("Task1"));
        assert!(!config.schemas().has_schema("flow1"));
    }

    #[test]
    fn missing_definition_file_is_io_error() {
        let result = SystemDefinition::from_path(Path::new("/nonexistent/system.yml"));
        assert!(matches!(result, Err(ConfigError::Io { .. })));
    }
}
