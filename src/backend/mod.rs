//! Task Managers
//!
//! Backends that execute task attempts. One backend is selected at startup
//! from [`Settings::backend`] and shared by the engine as a trait object.
//!
//! # Structure
//!
//! - [`local`]: Runs attempts as child processes on this machine
//! - [`external`]: Cluster batch submission and cloud launch hooks
//! - [`outputs`]: Collects output values from a finished attempt
//!
//! Backends never touch tasks or channel data. Progress flows back to the
//! engine through a [`StatusReporter`], or, for workers outside this
//! process, through the engine's report entry points.

pub mod external;
pub mod local;
pub mod outputs;

use std::io;
use std::path::PathBuf;
use std::sync::mpsc::Sender;
use std::sync::Arc;

use log::{debug, info};
use serde::Serialize;
use thiserror::Error;

use crate::config::{BackendKind, Settings};
use crate::data::DataContents;
use crate::task::{AttemptId, AttemptStatus, TaskAttempt};

pub use external::{CloudTaskManager, ClusterTaskManager};
pub use local::LocalTaskManager;
pub use outputs::{collect_outputs, AttemptFiles, OutputError};

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("Failed to {action} '{path}': {source}")]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Task needs {requested} cores but only {available} are available")]
    InsufficientResources { requested: usize, available: usize },

    #[error("Command '{command}' failed: {detail}")]
    CommandFailed { command: String, detail: String },

    #[error("Backend is not configured: {0}")]
    NotConfigured(String),

    #[error(transparent)]
    Output(#[from] OutputError),
}

/// One output value reported by a finished attempt.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct AttemptOutput {
    pub channel: String,
    pub contents: DataContents,
}

/// A status change reported for an attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptUpdate {
    Running,
    Finished { outputs: Vec<AttemptOutput> },
    Failed { error: String },
    /// The backend could not start the attempt after `run` returned.
    LaunchFailed { error: String },
}

impl AttemptUpdate {
    /// The attempt status this update moves to.
    pub fn status(&self) -> AttemptStatus {
        match self {
            Self::Running => AttemptStatus::Running,
            Self::Finished { .. } => AttemptStatus::Finished,
            Self::Failed { .. } | Self::LaunchFailed { .. } => AttemptStatus::Failed,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AttemptReport {
    pub attempt_id: AttemptId,
    pub update: AttemptUpdate,
}

/// Hands attempt status changes back to the engine.
#[derive(Debug, Clone)]
pub struct StatusReporter {
    sender: Sender<AttemptReport>,
}

impl StatusReporter {
    pub fn new(sender: Sender<AttemptReport>) -> Self {
        Self { sender }
    }

    pub fn report(&self, attempt_id: AttemptId, update: AttemptUpdate) {
        if self.sender.send(AttemptReport { attempt_id, update }).is_err() {
            debug!("Engine is gone; dropping report for attempt {}", attempt_id);
        }
    }
}

/// Executes task attempts.
///
/// `run` returns once the attempt has been handed off and must not block on
/// slow external commands; completion is reported later. An `Err` from `run`,
/// or a later [`AttemptUpdate::LaunchFailed`], means nothing was started.
pub trait TaskManager: Send + Sync {
    fn name(&self) -> &'static str;

    fn run(&self, attempt: &TaskAttempt, reporter: StatusReporter) -> Result<(), BackendError>;

    fn kill(&self, _attempt: &TaskAttempt) -> Result<(), BackendError> {
        Ok(())
    }

    fn cleanup(&self, _attempt: &TaskAttempt) -> Result<(), BackendError> {
        Ok(())
    }

    /// Whether attempts run inside this process, so the engine itself must
    /// keep their heartbeats alive.
    fn in_process(&self) -> bool {
        false
    }
}

/// Builds the task manager selected by `settings`.
pub fn create_task_manager(settings: &Settings) -> Arc<dyn TaskManager> {
    info!("Using {} backend", settings.backend);
    match settings.backend {
        BackendKind::Local => Arc::new(LocalTaskManager::new(settings.working_root.clone())),
        BackendKind::Cluster => Arc::new(ClusterTaskManager::new(
            settings.cluster.clone(),
            settings.working_root.clone(),
        )),
        BackendKind::Cloud => Arc::new(CloudTaskManager::new(settings.cloud.clone())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn test_create_task_manager_by_kind() {
        let mut settings = Settings::default();
        assert_eq!(create_task_manager(&settings).name(), "local");
        assert!(create_task_manager(&settings).in_process());

        settings.backend = BackendKind::Cluster;
        assert_eq!(create_task_manager(&settings).name(), "cluster");
        assert!(!create_task_manager(&settings).in_process());

        settings.backend = BackendKind::Cloud;
        assert_eq!(create_task_manager(&settings).name(), "cloud");
    }

    #[test]
    fn test_reporter_survives_closed_channel() {
        let (tx, rx) = mpsc::channel();
        let reporter = StatusReporter::new(tx);
        drop(rx);

        reporter.report(AttemptId::new(), AttemptUpdate::Running);
    }

    #[test]
    fn test_launch_failure_is_a_failed_status() {
        let update = AttemptUpdate::LaunchFailed {
            error: "submit refused".into(),
        };
        assert_eq!(update.status(), AttemptStatus::Failed);
    }
}
