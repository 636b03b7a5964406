//! Implementations of the `check` and `dry-run` commands.

use crate::error::CliError;
use edgewise_engine::{
    DispatchError, DispatchOutcome, DispatchRequest, Dispatcher, DispatcherSettings, LocalExecutor,
    SystemConfig, SystemDefinition,
};
use rootcause::Report;
use serde_json::Value as JsonValue;
use std::fmt::Write as _;
use std::path::Path;
use std::sync::Arc;

/// Loads a definition file and compiles it with settings from the
/// environment.
pub fn load(path: &Path) -> Result<SystemConfig, Report<CliError>> {
    let definition = SystemDefinition::from_path(path).map_err(CliError::from)?;
    let settings = DispatcherSettings::from_env().map_err(CliError::from)?;
    let config = SystemConfig::compile(&definition, &settings).map_err(CliError::from)?;
    tracing::info!(path = %path.display(), flows = config.flow_names().len(), "loaded definition");
    Ok(config)
}

/// Describes every flow of a compiled system, optionally with its graph in
/// dot format.
pub fn summary(config: &SystemConfig, dot: bool) -> String {
    let mut out = String::new();
    for name in config.flow_names() {
        let Some(flow) = config.flow(name) else {
            continue;
        };
        let graph = &flow.graph;
        let _ = writeln!(
            out,
            "{name}: {} edges, {} nodes, node_args_from_first={}, propagate_node_args={}",
            graph.edge_count(),
            graph.node_count(),
            flow.propagation.node_args_from_first,
            flow.propagation.propagate_node_args,
        );

        let mut nodes: Vec<String> = graph.nodes().map(ToString::to_string).collect();
        nodes.sort();
        for node in nodes {
            let _ = writeln!(out, "  {node}");
        }

        if dot {
            let _ = writeln!(out, "{}", graph.to_dot());
        }
    }
    out
}

/// Parses the `--args` value.
pub fn parse_args(raw: Option<&str>) -> Result<Option<JsonValue>, Report<CliError>> {
    let Some(raw) = raw else {
        return Ok(None);
    };
    let value = serde_json::from_str(raw).map_err(|e| CliError::InvalidArgs {
        reason: e.to_string(),
    })?;
    Ok(Some(value))
}

/// Drives a flow to its end, finishing every started node with its own
/// arguments as result. Returns one line per started node.
pub async fn dry_run(
    config: SystemConfig,
    flow_name: &str,
    node_args: Option<JsonValue>,
    max_cycles: u32,
) -> Result<Vec<String>, Report<CliError>> {
    if config.flow(flow_name).is_none() {
        return Err(CliError::UnknownFlow {
            flow_name: flow_name.to_string(),
        }
        .into());
    }

    let executor = LocalExecutor::new();
    let dispatcher = Dispatcher::new(Arc::new(config), executor.clone());
    let mut request = DispatchRequest::start(flow_name, node_args);
    let mut log = Vec::new();

    for cycle in 1..=max_cycles {
        let outcome = dispatcher
            .dispatch(request)
            .await
            .map_err(|report| dispatch_failed(flow_name, report))?;

        let running = executor.running();
        for started in &running {
            let args = started.node_args.clone().unwrap_or(JsonValue::Null);
            log.push(format!("cycle {cycle}: {} <- {args}", started.node));
        }

        match outcome {
            DispatchOutcome::Retry { after, next } => {
                tracing::debug!(cycle, retry_secs = after.as_secs(), "flow still running");
                for started in running {
                    let result = started.node_args.unwrap_or(JsonValue::Null);
                    executor
                        .finish(started.instance_id, result)
                        .map_err(CliError::from)?;
                }
                request = next;
            }
            DispatchOutcome::Finished { .. } => return Ok(log),
            DispatchOutcome::Failed { failed_nodes, .. } => {
                return Err(CliError::FlowFailed {
                    flow_name: flow_name.to_string(),
                    nodes: failed_nodes.into_keys().collect(),
                }
                .into());
            }
        }
    }

    Err(CliError::CycleLimit {
        flow_name: flow_name.to_string(),
        cycles: max_cycles,
    }
    .into())
}

/// Reports a failed dispatch cycle, keeping the dispatcher's report as the
/// cause.
fn dispatch_failed(flow_name: &str, report: Report<DispatchError>) -> Report<CliError> {
    report.context(CliError::Dispatch {
        flow_name: flow_name.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEFINITION: &str = "
tasks:
  - name: fetch
  - name: analyze
  - name: report
flows:
  - name: main
    node_args_from_first: true
    edges:
      - to: [fetch]
      - from: [fetch]
        to: [analyze, report]
";

    fn config() -> SystemConfig {
        let definition = SystemDefinition::from_yaml_str(DEFINITION).unwrap();
        SystemConfig::compile(&definition, &DispatcherSettings::default()).unwrap()
    }

    #[test]
    fn summary_lists_flows_and_nodes() {
        let out = summary(&config(), false);
        assert!(out.starts_with("main: 2 edges, 3 nodes, node_args_from_first=true"));
        assert!(out.contains("  analyze\n"));
        assert!(!out.contains("digraph"));

        assert!(summary(&config(), true).contains("digraph"));
    }

    #[test]
    fn parses_json_args() {
        assert_eq!(parse_args(None).unwrap(), None);
        assert_eq!(
            parse_args(Some(r#"{"repo": "edgewise"}"#)).unwrap(),
            Some(serde_json::json!({"repo": "edgewise"}))
        );
        assert!(parse_args(Some("{not json")).is_err());
    }

    #[tokio::test]
    async fn dry_run_walks_the_flow() {
        let log = dry_run(config(), "main", Some(serde_json::json!("seed")), 10)
            .await
            .unwrap();

        assert_eq!(log.len(), 3);
        assert_eq!(log[0], r#"cycle 1: fetch <- "seed""#);
        assert!(log[1..].iter().all(|line| line.starts_with("cycle 2: ")));
        assert!(log.iter().any(|line| line.contains("analyze <- \"seed\"")));
    }

    #[tokio::test]
    async fn dry_run_rejects_unknown_flow() {
        assert!(dry_run(config(), "nope", None, 10).await.is_err());
    }

    #[tokio::test]
    async fn dry_run_stops_at_cycle_limit() {
        let definition = SystemDefinition::from_yaml_str(
            "tasks:\n  - name: loop\nflows:\n  - name: forever\n    edges:\n      - to: [loop]\n      - from: [loop]\n        to: [loop]\n",
        )
        .unwrap();
        let config = SystemConfig::compile(&definition, &DispatcherSettings::default()).unwrap();

        let result = dry_run(config, "forever", None, 5).await;
        assert!(result.is_err());
    }

    #[test]
    fn dispatch_failure_keeps_cause() {
        let cause = DispatchError::Start {
            flow_name: "main".to_string(),
            dispatcher_id: edgewise_core::DispatcherId::new(),
            source: edgewise_engine::EngineError::UnknownFlow {
                flow_name: "main".to_string(),
            },
        };

        let report = dispatch_failed("main", Report::from(cause.clone()));

        assert!(matches!(
            report.current_context(),
            CliError::Dispatch { flow_name } if flow_name == "main"
        ));
        let kept = report
            .iter_reports()
            .find_map(|r| r.downcast_current_context::<DispatchError>());
        assert_eq!(kept, Some(&cause));
    }

    #[test]
    fn loads_definition_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("system.yml");
        std::fs::write(&path, DEFINITION).unwrap();

        let config = load(&path).unwrap();
        assert_eq!(config.flow_names(), vec!["main"]);
    }
}
