//! Runs
//!
//! A run is one instantiation of a template node. Leaf runs own tasks;
//! branch runs own child runs and the connector channels between them.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::data::{Channel, DataType, NodeId};
use crate::task::{Event, StepSpec, TaskId};
use crate::template::OutputMode;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct RunId(Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RunId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Waiting,
    Running,
    Finished,
    Failed,
    Killed,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished | Self::Failed | Self::Killed)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Waiting => "waiting",
            Self::Running => "running",
            Self::Finished => "finished",
            Self::Failed => "failed",
            Self::Killed => "killed",
        };
        write!(f, "{}", name)
    }
}

/// An output port bound to the data tree it writes.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct RunOutput {
    pub channel: String,
    pub data_type: DataType,
    pub mode: OutputMode,
    pub root: NodeId,
}

#[derive(Debug, Clone)]
pub struct Run {
    pub id: RunId,
    pub name: String,
    pub parent: Option<RunId>,
    pub children: Vec<RunId>,
    /// Execution details; `None` for branch runs
    pub step: Option<StepSpec>,
    pub inputs: Vec<Channel>,
    pub outputs: Vec<RunOutput>,
    /// Channels created inside a branch to carry data between its steps
    pub connectors: BTreeMap<String, NodeId>,
    pub tasks: Vec<TaskId>,
    pub status: RunStatus,
    pub events: Vec<Event>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Run {
    pub fn new(name: impl Into<String>, parent: Option<RunId>, step: Option<StepSpec>) -> Self {
        Self {
            id: RunId::new(),
            name: name.into(),
            parent,
            children: Vec::new(),
            step,
            inputs: Vec::new(),
            outputs: Vec::new(),
            connectors: BTreeMap::new(),
            tasks: Vec::new(),
            status: RunStatus::Waiting,
            events: Vec::new(),
            created_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn is_leaf(&self) -> bool {
        self.step.is_some()
    }

    /// Moves to a terminal status; a run that already ended keeps its status.
    pub fn terminate(&mut self, status: RunStatus, message: impl Into<String>, is_error: bool) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = status;
        self.finished_at = Some(Utc::now());
        self.events.push(Event::new(message, is_error));
        true
    }

    pub fn add_event(&mut self, message: impl Into<String>, is_error: bool) {
        self.events.push(Event::new(message, is_error));
    }
}
