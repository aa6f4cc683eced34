//! Template Definition Module
//!
//! Provides data structures and utilities for defining, parsing, and
//! validating template trees.
//!
//! # Structure
//!
//! - [`model`]: Core data structures (Template, inputs, outputs)
//! - [`loader`]: YAML parsing and loading
//! - [`validator`]: Validation rules and channel wiring checks

pub mod loader;
pub mod model;
pub mod validator;

use thiserror::Error;

pub use loader::{load_inputs, load_template, parse_template, RunInputs};
pub use model::{
    OutputMode, OutputSource, Resources, StreamName, Template, TemplateInput, TemplateOutput,
};
pub use validator::{validate_template, ValidationError};

#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("Failed to read '{path}': {source}. Check that the file exists and is readable.")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse YAML: {0}. Check the file format.")]
    Parse(#[from] serde_yaml::Error),

    #[error("Template is invalid:\n{}", format_errors(.0))]
    Invalid(Vec<ValidationError>),
}

fn format_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| format!("  - {}", e))
        .collect::<Vec<_>>()
        .join("\n")
}
