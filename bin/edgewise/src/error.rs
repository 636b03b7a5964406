//! Errors reported by the command line front end.

use edgewise_engine::{ConfigError, ExecutorError};
use std::fmt;

/// Command failures.
#[derive(Debug)]
pub enum CliError {
    /// The definition or the dispatcher settings are invalid.
    Config(ConfigError),
    /// `--args` is not valid JSON.
    InvalidArgs { reason: String },
    /// The requested flow is not defined.
    UnknownFlow { flow_name: String },
    /// A dispatch cycle failed; the dispatcher's report is the cause.
    Dispatch { flow_name: String },
    /// The dry-run executor rejected an operation.
    Executor(ExecutorError),
    /// The flow was still running after the cycle limit.
    CycleLimit { flow_name: String, cycles: u32 },
    /// The flow ended with failed nodes.
    FlowFailed { flow_name: String, nodes: Vec<String> },
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(e) => write!(f, "{e}"),
            Self::InvalidArgs { reason } => write!(f, "invalid --args: {reason}"),
            Self::UnknownFlow { flow_name } => write!(f, "flow '{flow_name}' is not defined"),
            Self::Dispatch { flow_name } => write!(f, "dispatch of flow '{flow_name}' failed"),
            Self::Executor(e) => write!(f, "{e}"),
            Self::CycleLimit { flow_name, cycles } => {
                write!(f, "flow '{flow_name}' still running after {cycles} cycles")
            }
            Self::FlowFailed { flow_name, nodes } => {
                write!(f, "flow '{flow_name}' failed in {}", nodes.join(", "))
            }
        }
    }
}

impl std::error::Error for CliError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Config(e) => Some(e),
            Self::Executor(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ConfigError> for CliError {
    fn from(e: ConfigError) -> Self {
        Self::Config(e)
    }
}

impl From<ExecutorError> for CliError {
    fn from(e: ExecutorError) -> Self {
        Self::Executor(e)
    }
}
