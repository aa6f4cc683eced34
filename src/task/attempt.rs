//! Task Attempts
//!
//! One concrete execution of a task. An attempt carries a copy of everything
//! a backend needs to run it, so backends never look at tasks or channel
//! data directly.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::store::StoreError;
use super::task::{Task, TaskId, TaskOutputSpec};
use crate::template::Resources;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct AttemptId(Uuid);

impl AttemptId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for AttemptId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for AttemptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for AttemptId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Lifecycle of an attempt:
/// `not_started -> launching -> running -> {finished | failed | killed}`.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    NotStarted,
    Launching,
    Running,
    Finished,
    Failed,
    Killed,
}

impl AttemptStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished | Self::Failed | Self::Killed)
    }

    /// Whether the attempt may move from `self` to `next`.
    pub fn can_transition_to(&self, next: AttemptStatus) -> bool {
        use AttemptStatus::*;
        matches!(
            (self, next),
            (NotStarted, Launching | Failed | Killed)
                | (Launching, Running | Finished | Failed | Killed)
                | (Running, Finished | Failed | Killed)
        )
    }
}

impl fmt::Display for AttemptStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::NotStarted => "not_started",
            Self::Launching => "launching",
            Self::Running => "running",
            Self::Finished => "finished",
            Self::Failed => "failed",
            Self::Killed => "killed",
        };
        write!(f, "{}", name)
    }
}

/// A timestamped note in an attempt's or run's history.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Event {
    pub timestamp: DateTime<Utc>,
    pub message: String,
    pub is_error: bool,
}

impl Event {
    pub fn new(message: impl Into<String>, is_error: bool) -> Self {
        Self {
            timestamp: Utc::now(),
            message: message.into(),
            is_error,
        }
    }
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct TaskAttempt {
    pub id: AttemptId,
    pub task_id: TaskId,
    pub step_name: String,
    pub attempt_number: u32,
    pub status: AttemptStatus,
    /// Only the active attempt's reports are honoured
    pub active: bool,

    pub command: String,
    pub interpreter: String,
    pub resources: Resources,
    pub environment: BTreeMap<String, String>,
    pub outputs: Vec<TaskOutputSpec>,
    pub timeout_hours: Option<f64>,

    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub events: Vec<Event>,
    pub cleaned_up: bool,
}

impl TaskAttempt {
    /// A fresh, active attempt for `task`.
    pub fn for_task(task: &Task, attempt_number: u32) -> Self {
        Self {
            id: AttemptId::new(),
            task_id: task.id.clone(),
            step_name: task.step_name.clone(),
            attempt_number,
            status: AttemptStatus::NotStarted,
            active: true,
            command: task.command.clone(),
            interpreter: task.interpreter.clone(),
            resources: task.resources.clone(),
            environment: task.environment.clone(),
            outputs: task.outputs.clone(),
            timeout_hours: task.timeout_hours,
            created_at: Utc::now(),
            started_at: None,
            last_heartbeat_at: None,
            finished_at: None,
            error: None,
            events: Vec::new(),
            cleaned_up: false,
        }
    }

    /// Moves to `next`, stamping the matching timestamp.
    pub fn transition(&mut self, next: AttemptStatus) -> Result<(), StoreError> {
        if !self.status.can_transition_to(next) {
            return Err(StoreError::IllegalTransition {
                id: self.id,
                from: self.status,
                to: next,
            });
        }

        let now = Utc::now();
        match next {
            AttemptStatus::Launching => {
                self.started_at = Some(now);
                self.last_heartbeat_at = Some(now);
            }
            AttemptStatus::Running => self.last_heartbeat_at = Some(now),
            status if status.is_terminal() => self.finished_at = Some(now),
            _ => {}
        }

        self.status = next;
        self.events.push(Event::new(format!("Status changed to {}", next), false));
        Ok(())
    }

    /// Marks the attempt failed with `error`.
    pub fn fail(&mut self, error: impl Into<String>) -> Result<(), StoreError> {
        let error = error.into();
        self.transition(AttemptStatus::Failed)?;
        self.events.push(Event::new(error.clone(), true));
        self.error = Some(error);
        Ok(())
    }

    pub fn add_event(&mut self, message: impl Into<String>, is_error: bool) {
        self.events.push(Event::new(message, is_error));
    }

    /// Time of the last sign of life.
    pub fn last_seen(&self) -> DateTime<Utc> {
        self.last_heartbeat_at
            .or(self.started_at)
            .unwrap_or(self.created_at)
    }
}
