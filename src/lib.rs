//! ScatterFlow - Dataflow Workflow Scheduling Engine
//!
//! Runs workflow templates whose steps start as soon as their input data
//! arrives. Array inputs are scattered into one task per element and
//! gathered back into arrays downstream.
//!
//! # Architecture
//!
//! - [`data`]: Data trees, paths and channels
//! - [`scheduler`]: Combines ready channel data into task input sets
//! - [`template`]: Template model, loading and validation
//! - [`task`]: Tasks, attempts, command rendering and heartbeats
//! - [`backend`]: Local, cluster and cloud task managers
//! - [`engine`]: Run orchestration and the front-end entry points
//! - [`config`]: Engine settings
//!
//! # Example
//!
//! ```rust,no_run
//! use scatterflow::{load_inputs, load_template, Engine, Settings};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let template = load_template("pipeline.yaml")?;
//!     let inputs = load_inputs("inputs.yaml")?;
//!
//!     let engine = Engine::from_settings(Settings::load(Some("scatterflow.yaml"))?);
//!     let run_id = engine.submit_run(template, inputs)?;
//!
//!     let status = engine.wait_for_run(run_id, None)?;
//!     println!("{}", status);
//!     Ok(())
//! }
//! ```

pub mod backend;
pub mod config;
pub mod data;
pub mod engine;
pub mod error;
pub mod scheduler;
pub mod task;
pub mod template;

// Re-export commonly used types
pub use config::Settings;
pub use engine::{Engine, RunId, RunStatus, RunSummary};
pub use error::EngineError;
pub use template::{load_inputs, load_template, Template};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "ScatterFlow";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_library_version() {
        assert!(!VERSION.is_empty());
        assert!(VERSION.contains('.'));
    }

    #[test]
    fn test_app_name() {
        assert_eq!(APP_NAME, "ScatterFlow");
    }

    #[test]
    fn test_module_exports_template() {
        let template = Template::leaf("hello", "echo hello");
        assert!(template.is_leaf());
        assert_eq!(template.leaf_count(), 1);
    }
}
