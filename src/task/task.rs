//! Tasks
//!
//! A task is one step applied to one input set. Its identity is the content
//! fingerprint of the owning step run and the data path, so deriving the
//! same combination twice always lands on the same task.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use blake3::Hasher;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::attempt::{AttemptId, TaskAttempt};
use super::render::{render_task, RenderError};
use super::store::{AttemptStore, StoreError};
use crate::config::RetryPolicy;
use crate::data::{DataPath, DataType};
use crate::engine::RunId;
use crate::scheduler::{InputItem, InputSet};
use crate::template::{OutputMode, OutputSource, Resources, Template, TemplateOutput};

/// Content fingerprint of `(step run, data path)`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    pub fn fingerprint(run_id: &RunId, data_path: &DataPath) -> Self {
        let mut hasher = Hasher::new();
        hasher.update(run_id.to_string().as_bytes());
        hasher.update(b"\0");
        hasher.update(data_path.to_string().as_bytes());
        Self(hasher.finalize().to_hex().to_string())
    }

    /// Abbreviated form for log lines.
    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(12)]
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Waiting,
    Running,
    Finished,
    Failed,
    Killed,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished | Self::Failed | Self::Killed)
    }
}

/// Why an attempt failed; each kind has its own retry budget.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The command itself failed
    Analysis,
    /// Launch failures and lost workers
    System,
    /// The attempt ran past its time limit
    Timeout,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Analysis => write!(f, "analysis"),
            Self::System => write!(f, "system"),
            Self::Timeout => write!(f, "timeout"),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FailureCounts {
    pub analysis: u32,
    pub system: u32,
    pub timeout: u32,
}

impl FailureCounts {
    pub fn get(&self, kind: FailureKind) -> u32 {
        match kind {
            FailureKind::Analysis => self.analysis,
            FailureKind::System => self.system,
            FailureKind::Timeout => self.timeout,
        }
    }

    /// Counts one more failure of `kind` and returns the new total.
    pub fn record(&mut self, kind: FailureKind) -> u32 {
        let count = match kind {
            FailureKind::Analysis => &mut self.analysis,
            FailureKind::System => &mut self.system,
            FailureKind::Timeout => &mut self.timeout,
        };
        *count += 1;
        *count
    }
}

/// Where a task's output comes from, with file names already rendered.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TaskOutputSpec {
    pub channel: String,
    pub data_type: DataType,
    pub source: OutputSource,
    pub mode: OutputMode,
}

/// The execution details of a leaf step shared by all of its tasks.
#[derive(Debug, Clone, PartialEq)]
pub struct StepSpec {
    pub name: String,
    pub command: String,
    pub interpreter: String,
    pub resources: Resources,
    pub environment: BTreeMap<String, String>,
    pub outputs: Vec<TemplateOutput>,
    pub timeout_hours: Option<f64>,
}

impl StepSpec {
    /// Execution details of a leaf template; `None` for branches.
    pub fn from_template(template: &Template) -> Option<Self> {
        if !template.is_leaf() {
            return None;
        }
        Some(Self {
            name: template.name.clone(),
            command: template.command.clone()?,
            interpreter: template.interpreter.clone(),
            resources: template.resources.clone(),
            environment: template.environment.clone(),
            outputs: template.outputs.clone(),
            timeout_hours: template.timeout_hours,
        })
    }
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct Task {
    pub id: TaskId,
    pub run_id: RunId,
    pub step_name: String,
    pub data_path: DataPath,
    pub raw_command: String,
    pub command: String,
    pub interpreter: String,
    pub resources: Resources,
    pub environment: BTreeMap<String, String>,
    pub timeout_hours: Option<f64>,
    pub inputs: Vec<InputItem>,
    pub outputs: Vec<TaskOutputSpec>,
    pub status: TaskStatus,
    pub active_attempt: Option<AttemptId>,
    pub attempts: Vec<AttemptId>,
    pub failures: FailureCounts,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Builds the task for `input_set`, rendering its command and outputs.
    pub fn new(run_id: RunId, step: &StepSpec, input_set: InputSet) -> Result<Self, RenderError> {
        let rendered = render_task(&step.command, &input_set, &step.outputs)?;

        Ok(Self {
            id: TaskId::fingerprint(&run_id, &input_set.data_path),
            run_id,
            step_name: step.name.clone(),
            data_path: input_set.data_path,
            raw_command: step.command.clone(),
            command: rendered.command,
            interpreter: step.interpreter.clone(),
            resources: step.resources.clone(),
            environment: step.environment.clone(),
            timeout_hours: step.timeout_hours,
            inputs: input_set.items,
            outputs: rendered.outputs,
            status: TaskStatus::Waiting,
            active_attempt: None,
            attempts: Vec::new(),
            failures: FailureCounts::default(),
            created_at: Utc::now(),
            finished_at: None,
        })
    }

    /// Creates a new attempt, deactivates the previous one and makes the
    /// new one the only attempt whose reports count.
    pub fn create_and_activate_attempt(
        &mut self,
        store: &AttemptStore,
    ) -> Result<TaskAttempt, StoreError> {
        if let Some(previous) = self.active_attempt.take() {
            store.update(previous, |attempt| {
                attempt.active = false;
                Ok(())
            })?;
        }

        let attempt = TaskAttempt::for_task(self, self.attempts.len() as u32 + 1);
        store.insert(attempt.clone());

        self.active_attempt = Some(attempt.id);
        self.attempts.push(attempt.id);
        if self.status == TaskStatus::Waiting {
            self.status = TaskStatus::Running;
        }

        Ok(attempt)
    }

    /// Counts a failure and tells whether another attempt is allowed.
    pub fn record_failure(&mut self, kind: FailureKind, policy: &RetryPolicy) -> bool {
        self.failures.record(kind) <= policy.max_for(kind)
    }

    /// Time limit for attempts of this task.
    pub fn timeout(&self, default: Duration) -> Duration {
        self.timeout_hours
            .filter(|hours| hours.is_finite() && *hours > 0.0)
            .map(|hours| Duration::from_secs_f64(hours * 3600.0))
            .unwrap_or(default)
    }

    pub fn finish(&mut self) {
        self.status = TaskStatus::Finished;
        self.finished_at = Some(Utc::now());
    }

    pub fn terminate(&mut self, status: TaskStatus) {
        self.status = status;
        self.finished_at = Some(Utc::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{DataContents, DataValue, InputMode};
    use crate::task::AttemptStatus;

    fn spec() -> StepSpec {
        let template = Template::leaf("hello", "echo {{ name }}")
            .with_input("name", DataType::String, InputMode::NoGather, 0);
        StepSpec::from_template(&template).unwrap()
    }

    fn input_set(index: usize) -> InputSet {
        InputSet {
            data_path: DataPath::from_pairs(&[(index, 2)]),
            items: vec![InputItem {
                channel: "name".into(),
                data_type: DataType::String,
                mode: InputMode::NoGather,
                contents: DataContents::Scalar(DataValue::String(format!("n{}", index))),
            }],
        }
    }

    #[test]
    fn test_fingerprint_is_deterministic() {
        let run = RunId::new();
        let path = DataPath::from_pairs(&[(0, 2)]);

        assert_eq!(TaskId::fingerprint(&run, &path), TaskId::fingerprint(&run, &path));
        assert_ne!(
            TaskId::fingerprint(&run, &path),
            TaskId::fingerprint(&run, &DataPath::from_pairs(&[(1, 2)]))
        );
        assert_ne!(
            TaskId::fingerprint(&run, &path),
            TaskId::fingerprint(&RunId::new(), &path)
        );
        assert_eq!(TaskId::fingerprint(&run, &path).short().len(), 12);
    }

    #[test]
    fn test_new_task_renders_command() {
        let task = Task::new(RunId::new(), &spec(), input_set(1)).unwrap();

        assert_eq!(task.command, "echo n1");
        assert_eq!(task.raw_command, "echo {{ name }}");
        assert_eq!(task.status, TaskStatus::Waiting);
        assert!(task.active_attempt.is_none());
    }

    #[test]
    fn test_step_spec_requires_leaf() {
        let branch = Template::branch("group").with_step(Template::leaf("a", "true"));
        assert!(StepSpec::from_template(&branch).is_none());
    }

    #[test]
    fn test_exactly_one_active_attempt() {
        let store = AttemptStore::new();
        let mut task = Task::new(RunId::new(), &spec(), input_set(0)).unwrap();

        let first = task.create_and_activate_attempt(&store).unwrap();
        let second = task.create_and_activate_attempt(&store).unwrap();

        assert_eq!(task.active_attempt, Some(second.id));
        assert_eq!(task.attempts, vec![first.id, second.id]);
        assert_eq!(second.attempt_number, 2);
        assert!(!store.get(first.id).unwrap().value.active);
        assert!(store.get(second.id).unwrap().value.active);
        assert_eq!(task.status, TaskStatus::Running);

        let active = store.list().into_iter().filter(|a| a.active).count();
        assert_eq!(active, 1);
        assert_eq!(store.get(second.id).unwrap().value.status, AttemptStatus::NotStarted);
    }

    #[test]
    fn test_retry_budget_boundaries() {
        let policy = RetryPolicy::uniform(2);
        let mut task = Task::new(RunId::new(), &spec(), input_set(0)).unwrap();

        assert!(task.record_failure(FailureKind::Analysis, &policy));
        assert!(task.record_failure(FailureKind::Analysis, &policy));
        assert!(!task.record_failure(FailureKind::Analysis, &policy));

        // Budgets are tracked per kind.
        assert!(task.record_failure(FailureKind::System, &policy));
        assert_eq!(task.failures.get(FailureKind::Analysis), 3);
        assert_eq!(task.failures.get(FailureKind::System), 1);
    }

    #[test]
    fn test_zero_budget_fails_on_first_error() {
        let policy = RetryPolicy::default();
        let mut task = Task::new(RunId::new(), &spec(), input_set(0)).unwrap();

        assert!(!task.record_failure(FailureKind::Timeout, &policy));
    }

    #[test]
    fn test_timeout_override() {
        let mut task = Task::new(RunId::new(), &spec(), input_set(0)).unwrap();
        let default = Duration::from_secs(60);

        assert_eq!(task.timeout(default), default);
        task.timeout_hours = Some(0.5);
        assert_eq!(task.timeout(default), Duration::from_secs(1800));
        task.timeout_hours = Some(-1.0);
        assert_eq!(task.timeout(default), default);
    }
}
