//! Run Status Snapshots
//!
//! Serializable views of a run tree returned by `Engine::run_status`.

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::run::{RunId, RunStatus};
use crate::data::{DataContents, DataPath};
use crate::task::{AttemptId, AttemptStatus, Event, FailureCounts, TaskId, TaskStatus};

#[derive(Serialize, Debug, Clone)]
pub struct RunSummary {
    pub id: RunId,
    pub name: String,
    pub status: RunStatus,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub events: Vec<Event>,
    pub outputs: Vec<OutputSummary>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tasks: Vec<TaskSummary>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub steps: Vec<RunSummary>,
}

/// An output channel and its data, once all of it has arrived.
#[derive(Serialize, Debug, Clone)]
pub struct OutputSummary {
    pub channel: String,
    pub contents: Option<DataContents>,
}

#[derive(Serialize, Debug, Clone)]
pub struct TaskSummary {
    pub id: TaskId,
    pub data_path: DataPath,
    pub status: TaskStatus,
    pub command: String,
    pub failures: FailureCounts,
    pub attempts: Vec<AttemptSummary>,
}

#[derive(Serialize, Debug, Clone)]
pub struct AttemptSummary {
    pub id: AttemptId,
    pub number: u32,
    pub status: AttemptStatus,
    pub active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RunSummary {
    /// `(finished, total)` task counts over the whole tree.
    pub fn task_counts(&self) -> (usize, usize) {
        let finished = self
            .tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Finished)
            .count();

        self.steps
            .iter()
            .map(RunSummary::task_counts)
            .fold((finished, self.tasks.len()), |(f, t), (cf, ct)| (f + cf, t + ct))
    }

    /// Finds the summary of the step called `name` anywhere in the tree.
    pub fn find(&self, name: &str) -> Option<&RunSummary> {
        if self.name == name {
            return Some(self);
        }
        self.steps.iter().find_map(|step| step.find(name))
    }

    pub fn output(&self, channel: &str) -> Option<&DataContents> {
        self.outputs
            .iter()
            .find(|o| o.channel == channel)
            .and_then(|o| o.contents.as_ref())
    }
}
