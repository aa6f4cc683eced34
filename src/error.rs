//! Crate-level error type aggregating every module's errors.

use thiserror::Error;

use crate::backend::BackendError;
use crate::config::ConfigError;
use crate::data::DataNodeError;
use crate::engine::RunId;
use crate::scheduler::InputError;
use crate::task::{RenderError, StoreError};
use crate::template::TemplateError;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Run {0} not found")]
    RunNotFound(RunId),

    #[error("No value supplied for input '{0}'")]
    MissingInput(String),

    #[error("Input '{0}' is not an input of the template")]
    UnknownInput(String),

    #[error("Channel '{channel}' of step '{step}' is not connected")]
    UnconnectedChannel { step: String, channel: String },

    #[error("Output '{channel}' of step '{step}' expects {expected} but the task reported {found}")]
    OutputShape {
        step: String,
        channel: String,
        expected: &'static str,
        found: &'static str,
    },

    #[error("Timed out waiting for run {0}")]
    WaitTimeout(RunId),

    #[error(transparent)]
    Data(#[from] DataNodeError),

    #[error(transparent)]
    Input(#[from] InputError),

    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error(transparent)]
    Render(#[from] RenderError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}
