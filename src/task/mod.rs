//! Tasks and Task Attempts
//!
//! # Structure
//!
//! - [`task`]: Tasks, failure accounting and retry decisions
//! - [`attempt`]: Attempt lifecycle and status transitions
//! - [`store`]: Versioned in-memory stores
//! - [`render`]: Command and output name rendering
//! - [`monitor`]: Heartbeats and stall detection

pub mod attempt;
pub mod monitor;
pub mod render;
pub mod store;
#[allow(clippy::module_inception)]
pub mod task;

pub use attempt::{AttemptId, AttemptStatus, Event, TaskAttempt};
pub use monitor::{StalledAttempt, TaskAttemptMonitor};
pub use render::{render_task, RenderError, RenderedTask};
pub use store::{AttemptStore, StoreError, TaskStore, Versioned};
pub use task::{
    FailureCounts, FailureKind, StepSpec, Task, TaskId, TaskOutputSpec, TaskStatus,
};
