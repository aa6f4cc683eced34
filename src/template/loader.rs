//! Template Loader
//!
//! Loads template trees and run inputs from YAML files.

use std::collections::BTreeMap;
use std::fs;

use log::{debug, info};

use super::model::Template;
use super::validator::validate_template;
use super::TemplateError;

/// Values supplied for top-level inputs, keyed by channel name.
pub type RunInputs = BTreeMap<String, serde_yaml::Value>;

/// Parses and validates a template from YAML text.
pub fn parse_template(yaml: &str) -> Result<Template, TemplateError> {
    let template: Template = serde_yaml::from_str(yaml)?;
    validate_template(&template)?;
    Ok(template)
}

/// Loads a template from a YAML file.
///
/// This function:
/// 1. Reads and parses the YAML file
/// 2. Validates the template tree
///
/// # Example
///
/// ```rust,no_run
/// use scatterflow::template::load_template;
///
/// fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let template = load_template("pipeline.yaml")?;
///     println!("Loaded {} leaf steps", template.leaf_count());
///     Ok(())
/// }
/// ```
pub fn load_template(path: &str) -> Result<Template, TemplateError> {
    info!("Loading template from: {}", path);

    let yaml_content = fs::read_to_string(path).map_err(|source| TemplateError::Read {
        path: path.to_string(),
        source,
    })?;

    debug!("YAML content loaded ({} bytes)", yaml_content.len());

    let template = parse_template(&yaml_content)?;

    info!(
        "Parsed template '{}' with {} inputs and {} outputs",
        template.name,
        template.inputs.len(),
        template.outputs.len()
    );

    Ok(template)
}

/// Loads run inputs (a mapping of channel name to value) from a YAML file.
pub fn load_inputs(path: &str) -> Result<RunInputs, TemplateError> {
    let content = fs::read_to_string(path).map_err(|source| TemplateError::Read {
        path: path.to_string(),
        source,
    })?;

    if content.trim().is_empty() {
        return Ok(RunInputs::new());
    }

    let inputs: RunInputs = serde_yaml::from_str(&content)?;
    debug!("Loaded {} run inputs from {}", inputs.len(), path);
    Ok(inputs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const PIPELINE: &str = r#"
name: pipeline
inputs:
  - channel: words
    type: string
    data: [a, b]
outputs:
  - channel: shout
    type: string
steps:
  - name: upper
    command: echo {{ words }} | tr a-z A-Z
    inputs:
      - channel: words
        type: string
    outputs:
      - channel: shout
        type: string
        source:
          stream: stdout
"#;

    #[test]
    fn test_parse_template() {
        let template = parse_template(PIPELINE).unwrap();

        assert_eq!(template.name, "pipeline");
        assert_eq!(template.steps.len(), 1);
        assert!(template.inputs[0].data.is_some());
    }

    #[test]
    fn test_parse_invalid_yaml() {
        let result = parse_template("name: [unclosed");
        assert!(matches!(result, Err(TemplateError::Parse(_))));
    }

    #[test]
    fn test_parse_rejects_invalid_template() {
        let result = parse_template("name: lonely\n");
        assert!(matches!(result, Err(TemplateError::Invalid(_))));
    }

    #[test]
    fn test_load_template_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(PIPELINE.as_bytes()).unwrap();

        let template = load_template(file.path().to_str().unwrap()).unwrap();
        assert_eq!(template.leaf_count(), 1);
    }

    #[test]
    fn test_load_missing_file() {
        let result = load_template("/nonexistent/template.yaml");
        assert!(matches!(result, Err(TemplateError::Read { .. })));
    }

    #[test]
    fn test_load_inputs() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "words: [x, y, z]").unwrap();
        writeln!(file, "count: 3").unwrap();

        let inputs = load_inputs(file.path().to_str().unwrap()).unwrap();

        assert_eq!(inputs.len(), 2);
        assert!(inputs["words"].is_sequence());
    }

    #[test]
    fn test_load_empty_inputs_file() {
        let file = NamedTempFile::new().unwrap();
        assert!(load_inputs(file.path().to_str().unwrap()).unwrap().is_empty());
    }
}
