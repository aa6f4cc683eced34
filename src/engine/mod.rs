//! Run Orchestration
//!
//! # Structure
//!
//! - [`engine`]: The [`Engine`] and its front-end entry points
//! - [`run`]: Run tree nodes and run status
//! - [`status`]: Serializable snapshots returned by `run_status`

#[allow(clippy::module_inception)]
pub mod engine;
pub mod run;
pub mod status;

pub use engine::Engine;
pub use run::{Run, RunId, RunOutput, RunStatus};
pub use status::{AttemptSummary, OutputSummary, RunSummary, TaskSummary};
