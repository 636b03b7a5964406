//! Task execution envelope.
//!
//! [`TaskEnvelope`] wraps one run of a task: it executes the task, validates
//! the result against the task's output schema, and on failure decides
//! between scheduling a retry and giving up. Giving up never hides the
//! original error; [`TaskFailure`] keeps it as its source so a worker on
//! another machine can still see what went wrong.

use crate::definition::SystemConfig;
use crate::schema::{ResultValidator, SchemaViolation};
use async_trait::async_trait;
use edgewise_core::{DispatcherId, NodeInstanceId};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// A unit of work.
#[async_trait]
pub trait Task: Send + Sync {
    /// Runs the task with its arguments and returns its result.
    async fn run(&self, node_args: Option<JsonValue>) -> Result<JsonValue, TaskError>;
}

/// Why a task run failed.
#[derive(Debug, Clone)]
pub enum TaskError {
    /// A failure expected to go away, such as a timeout.
    Transient { reason: String },
    /// The task asked to be run again, optionally after its own countdown in
    /// seconds.
    RetryRequested {
        countdown: Option<u64>,
        reason: String,
    },
    /// A failure retrying cannot fix, keeping the task's own error.
    Fatal {
        source: Arc<dyn StdError + Send + Sync>,
    },
    /// The result did not conform to the task's output schema.
    SchemaViolation(SchemaViolation),
}

impl TaskError {
    /// Wraps an error the task cannot recover from.
    pub fn fatal(error: impl Into<Box<dyn StdError + Send + Sync>>) -> Self {
        Self::Fatal {
            source: Arc::from(error.into()),
        }
    }

    /// Returns true for failure kinds that are retried automatically.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. } | Self::RetryRequested { .. })
    }
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transient { reason } => write!(f, "transient failure: {reason}"),
            Self::RetryRequested { reason, .. } => write!(f, "retry requested: {reason}"),
            Self::Fatal { source } => write!(f, "fatal failure: {source}"),
            Self::SchemaViolation(v) => write!(f, "{v}"),
        }
    }
}

impl StdError for TaskError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Self::Fatal { source } => Some(&**source),
            Self::SchemaViolation(v) => Some(v),
            _ => None,
        }
    }
}

impl From<SchemaViolation> for TaskError {
    fn from(violation: SchemaViolation) -> Self {
        Self::SchemaViolation(violation)
    }
}

/// Everything needed to run a task again.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryContext {
    pub task_name: String,
    pub flow_name: String,
    /// Predecessor occurrences that triggered the task.
    pub parent: BTreeMap<String, NodeInstanceId>,
    pub node_args: Option<JsonValue>,
    /// Delay before the next attempt.
    pub retry_countdown: Duration,
    /// Attempts already retried.
    pub retried_count: u32,
    pub dispatcher_id: DispatcherId,
    /// Retry regardless of the failure kind.
    pub user_retry: bool,
}

/// Whether a failed run is tried again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { after: Duration },
    Fatal,
}

/// A retry to schedule.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryInstruction {
    /// Context of the next attempt, with the retry counted.
    pub context: RetryContext,
    /// Delay before the next attempt.
    pub after: Duration,
}

/// A task that failed permanently.
#[derive(Debug, Clone)]
pub struct TaskFailure {
    pub task_name: String,
    pub flow_name: String,
    pub dispatcher_id: DispatcherId,
    pub retried_count: u32,
    /// The failure of the last attempt.
    pub error: TaskError,
}

impl fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "task '{}' of flow '{}' ({}) failed after {} retries: {}",
            self.task_name, self.flow_name, self.dispatcher_id, self.retried_count, self.error
        )
    }
}

impl StdError for TaskFailure {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        Some(&self.error)
    }
}

/// How a task run ended.
#[derive(Debug, Clone)]
pub enum TaskOutcome {
    Finished { result: JsonValue },
    Retry(RetryInstruction),
    Failed(TaskFailure),
}

/// Runs tasks and classifies their outcome.
#[derive(Debug, Clone)]
pub struct TaskEnvelope {
    config: Arc<SystemConfig>,
}

impl TaskEnvelope {
    #[must_use]
    pub fn new(config: Arc<SystemConfig>) -> Self {
        Self { config }
    }

    /// Builds the context of a first attempt, with the task's configured
    /// countdown.
    #[must_use]
    pub fn context(
        &self,
        task_name: impl Into<String>,
        flow_name: impl Into<String>,
        dispatcher_id: DispatcherId,
        node_args: Option<JsonValue>,
    ) -> RetryContext {
        let task_name = task_name.into();
        let retry_countdown = self
            .config
            .task(&task_name)
            .map(|t| t.retry_countdown)
            .unwrap_or_default();

        RetryContext {
            task_name,
            flow_name: flow_name.into(),
            parent: BTreeMap::new(),
            node_args,
            retry_countdown,
            retried_count: 0,
            dispatcher_id,
            user_retry: false,
        }
    }

    /// Checks a result against the task's output schema.
    ///
    /// # Errors
    ///
    /// Returns the violation if the task has a schema and the result does
    /// not conform to it.
    pub fn validate_result(&self, task_name: &str, result: &JsonValue) -> Result<(), SchemaViolation> {
        self.config.schemas().validate(task_name, result)
    }

    /// Decides whether a failed attempt is retried.
    ///
    /// A failure is retried when the task asked for it or the failure kind is
    /// transient, and fewer than `max_retries` retries happened so far.
    /// `None` means no bound.
    #[must_use]
    pub fn retry_decision(
        error: &TaskError,
        retry_countdown: Duration,
        retried_count: u32,
        max_retries: Option<u32>,
        user_requested: bool,
    ) -> RetryDecision {
        let retryable = user_requested || error.is_transient();
        let within_bound = max_retries.is_none_or(|max| retried_count < max);

        if !(retryable && within_bound) {
            return RetryDecision::Fatal;
        }

        let after = match error {
            TaskError::RetryRequested {
                countdown: Some(secs),
                ..
            } => Duration::from_secs(*secs),
            _ => retry_countdown,
        };
        RetryDecision::Retry { after }
    }

    /// Turns a failed attempt into a retry instruction or a permanent
    /// failure.
    ///
    /// # Errors
    ///
    /// Returns the failure, wrapping `error`, when the attempt is not
    /// retried.
    pub fn retry(&self, ctx: &RetryContext, error: TaskError) -> Result<RetryInstruction, TaskFailure> {
        let max_retries = self.config.task(&ctx.task_name).and_then(|t| t.max_retry);
        let user_requested = ctx.user_retry || matches!(error, TaskError::RetryRequested { .. });

        match Self::retry_decision(
            &error,
            ctx.retry_countdown,
            ctx.retried_count,
            max_retries,
            user_requested,
        ) {
            RetryDecision::Retry { after } => {
                tracing::warn!(
                    task_name = %ctx.task_name,
                    flow_name = %ctx.flow_name,
                    dispatcher_id = %ctx.dispatcher_id,
                    retried_count = ctx.retried_count,
                    retry_in_secs = after.as_secs(),
                    error = %error,
                    "task failed, scheduling retry"
                );
                let mut context = ctx.clone();
                context.retried_count += 1;
                Ok(RetryInstruction { context, after })
            }
            RetryDecision::Fatal => {
                tracing::warn!(
                    task_name = %ctx.task_name,
                    flow_name = %ctx.flow_name,
                    dispatcher_id = %ctx.dispatcher_id,
                    retried_count = ctx.retried_count,
                    error = %error,
                    "task failed permanently"
                );
                Err(TaskFailure {
                    task_name: ctx.task_name.clone(),
                    flow_name: ctx.flow_name.clone(),
                    dispatcher_id: ctx.dispatcher_id,
                    retried_count: ctx.retried_count,
                    error,
                })
            }
        }
    }

    /// Runs one attempt of a task.
    pub async fn run<T>(&self, task: &T, ctx: RetryContext) -> TaskOutcome
    where
        T: Task + ?Sized,
    {
        let attempt = task
            .run(ctx.node_args.clone())
            .await
            .and_then(|result| {
                self.validate_result(&ctx.task_name, &result)?;
                Ok(result)
            });

        match attempt {
            Ok(result) => {
                tracing::debug!(task_name = %ctx.task_name, flow_name = %ctx.flow_name, "task finished");
                TaskOutcome::Finished { result }
            }
            Err(error) => match self.retry(&ctx, error) {
                Ok(instruction) => TaskOutcome::Retry(instruction),
                Err(failure) => TaskOutcome::Failed(failure),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::{SystemDefinition, TaskDefinition};
    use crate::schema::SchemaRegistry;
    use crate::settings::DispatcherSettings;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Echo;

    #[async_trait]
    impl Task for Echo {
        async fn run(&self, node_args: Option<JsonValue>) -> Result<JsonValue, TaskError> {
            Ok(node_args.unwrap_or(JsonValue::Null))
        }
    }

    struct Failing(TaskError);

    #[async_trait]
    impl Task for Failing {
        async fn run(&self, _node_args: Option<JsonValue>) -> Result<JsonValue, TaskError> {
            Err(self.0.clone())
        }
    }

    /// Fails transiently until its third attempt.
    #[derive(Default)]
    struct Flaky {
        attempts: AtomicU32,
    }

    #[async_trait]
    impl Task for Flaky {
        async fn run(&self, _node_args: Option<JsonValue>) -> Result<JsonValue, TaskError> {
            if self.attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                return Err(TaskError::Transient {
                    reason: "timeout".to_string(),
                });
            }
            Ok(json!("done"))
        }
    }

    fn envelope() -> TaskEnvelope {
        let mut schemas = SchemaRegistry::new();
        schemas
            .register(
                "Task1",
                "validate_schema.json",
                &json!({
                    "type": "object",
                    "properties": {"projectName": {"type": "string"}},
                    "required": ["projectName"]
                }),
            )
            .unwrap();
        TaskEnvelope::new(Arc::new(SystemConfig::default().with_schemas(schemas)))
    }

    fn bounded_envelope(max_retry: u32, countdown: u64) -> TaskEnvelope {
        let definition = SystemDefinition::new().with_task(
            TaskDefinition::new("Task1")
                .with_max_retry(max_retry)
                .with_retry_countdown(countdown),
        );
        let config = SystemConfig::compile(&definition, &DispatcherSettings::default()).unwrap();
        TaskEnvelope::new(Arc::new(config))
    }

    #[test]
    fn conforming_result_validates() {
        envelope()
            .validate_result("Task1", &json!({"projectName": "edgewise"}))
            .unwrap();
    }

    #[test]
    fn non_conforming_result_names_node() {
        let violation = envelope()
            .validate_result("Task1", &json!({"foo": "bar"}))
            .unwrap_err();
        assert_eq!(violation.node_name, "Task1");
        assert_eq!(violation.schema_path, "validate_schema.json");
    }

    #[derive(Debug)]
    struct MissingKey(&'static str);

    impl fmt::Display for MissingKey {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "missing key '{}'", self.0)
        }
    }

    impl StdError for MissingKey {}

    #[test]
    fn unknown_failure_without_user_retry_is_fatal() {
        let envelope = envelope();
        let ctx = envelope.context("Task1", "flow1", DispatcherId::new(), None);
        let error = TaskError::fatal(MissingKey("projectName"));

        let failure = envelope.retry(&ctx, error).unwrap_err();

        assert_eq!(failure.task_name, "Task1");
        assert_eq!(failure.flow_name, "flow1");
        assert_eq!(failure.dispatcher_id, ctx.dispatcher_id);
        let task_error = failure.source().unwrap();
        assert_eq!(task_error.to_string(), "fatal failure: missing key 'projectName'");
        let original = task_error.source().unwrap().downcast_ref::<MissingKey>();
        assert_eq!(original.map(|e| e.0), Some("projectName"));
    }

    #[test]
    fn fatal_accepts_plain_messages() {
        let error = TaskError::fatal("KeyError");
        assert!(!error.is_transient());
        assert_eq!(error.to_string(), "fatal failure: KeyError");
        assert!(error.source().is_some());
    }

    #[test]
    fn user_retry_overrides_failure_kind() {
        let decision = TaskEnvelope::retry_decision(
            &TaskError::fatal("boom"),
            Duration::from_secs(3),
            0,
            None,
            true,
        );
        assert_eq!(
            decision,
            RetryDecision::Retry {
                after: Duration::from_secs(3)
            }
        );
    }

    #[test]
    fn retry_bound_is_honored() {
        let transient = TaskError::Transient {
            reason: "timeout".to_string(),
        };
        let countdown = Duration::from_secs(1);

        assert!(matches!(
            TaskEnvelope::retry_decision(&transient, countdown, 1, Some(2), false),
            RetryDecision::Retry { .. }
        ));
        assert_eq!(
            TaskEnvelope::retry_decision(&transient, countdown, 2, Some(2), false),
            RetryDecision::Fatal
        );
        assert!(matches!(
            TaskEnvelope::retry_decision(&transient, countdown, 1000, None, false),
            RetryDecision::Retry { .. }
        ));
    }

    #[test]
    fn requested_countdown_wins() {
        let error = TaskError::RetryRequested {
            countdown: Some(30),
            reason: "rate limited".to_string(),
        };
        assert_eq!(
            TaskEnvelope::retry_decision(&error, Duration::from_secs(5), 0, None, false),
            RetryDecision::Retry {
                after: Duration::from_secs(30)
            }
        );
    }

    #[tokio::test]
    async fn run_finishes_with_validated_result() {
        let envelope = envelope();
        let ctx = envelope.context(
            "Task1",
            "flow1",
            DispatcherId::new(),
            Some(json!({"projectName": "edgewise"})),
        );

        let outcome = envelope.run(&Echo, ctx).await;

        let TaskOutcome::Finished { result } = outcome else {
            panic!("expected the task to finish");
        };
        assert_eq!(result, json!({"projectName": "edgewise"}));
    }

    #[tokio::test]
    async fn schema_violation_fails_run() {
        let envelope = envelope();
        let ctx = envelope.context("Task1", "flow1", DispatcherId::new(), Some(json!({})));

        let outcome = envelope.run(&Echo, ctx).await;

        let TaskOutcome::Failed(failure) = outcome else {
            panic!("expected failure");
        };
        assert!(matches!(failure.error, TaskError::SchemaViolation(_)));
    }

    #[tokio::test]
    async fn transient_failures_retry_until_bound() {
        let envelope = bounded_envelope(2, 4);
        let task = Failing(TaskError::Transient {
            reason: "timeout".to_string(),
        });
        let mut ctx = envelope.context("Task1", "flow1", DispatcherId::new(), None);
        assert_eq!(ctx.retry_countdown, Duration::from_secs(4));

        for expected in 1..=2 {
            let TaskOutcome::Retry(instruction) = envelope.run(&task, ctx.clone()).await else {
                panic!("expected retry {expected}");
            };
            assert_eq!(instruction.after, Duration::from_secs(4));
            assert_eq!(instruction.context.retried_count, expected);
            ctx = instruction.context;
        }

        let outcome = envelope.run(&task, ctx).await;
        assert!(matches!(
            outcome,
            TaskOutcome::Failed(TaskFailure {
                retried_count: 2,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn flaky_task_eventually_finishes() {
        let envelope = bounded_envelope(5, 0);
        let task = Flaky::default();
        let mut ctx = envelope.context("Task1", "flow1", DispatcherId::new(), None);

        let result = loop {
            match envelope.run(&task, ctx.clone()).await {
                TaskOutcome::Finished { result } => break result,
                TaskOutcome::Retry(instruction) => ctx = instruction.context,
                TaskOutcome::Failed(failure) => panic!("unexpected failure: {failure}"),
            }
        };

        assert_eq!(result, json!("done"));
        assert_eq!(ctx.retried_count, 2);
    }
}
