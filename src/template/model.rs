//! Template Data Model
//!
//! A template is a tree: leaf steps run a command, branch steps group child
//! steps and wire their channels together by name.
//!
//! # Example YAML Format
//!
//! ```yaml
//! name: greet_all
//! inputs:
//!   - channel: names
//!     type: string
//!     data: [alice, bob]
//! outputs:
//!   - channel: report
//!     type: file
//! steps:
//!   - name: greet
//!     command: echo hello {{ names }} > {{ greeting }}
//!     inputs:
//!       - channel: names
//!         type: string
//!     outputs:
//!       - channel: greeting
//!         type: file
//!         source:
//!           filename: "greeting_{{ names }}.txt"
//!
//!   - name: combine
//!     command: cat {{ greeting }} > {{ report }}
//!     inputs:
//!       - channel: greeting
//!         type: file
//!         mode: gather
//!     outputs:
//!       - channel: report
//!         type: file
//!         source:
//!           filename: report.txt
//! ```

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::data::{DataType, InputMode};

/// Default interpreter for step commands.
pub const DEFAULT_INTERPRETER: &str = "/bin/bash";

/// One node of a template tree.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Template {
    /// Step name, unique among siblings
    pub name: String,

    /// Command template; present on leaf steps only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,

    /// Program that runs the rendered command
    #[serde(default = "default_interpreter")]
    pub interpreter: String,

    #[serde(default)]
    pub inputs: Vec<TemplateInput>,

    #[serde(default)]
    pub outputs: Vec<TemplateOutput>,

    /// Child steps; present on branch steps only
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub steps: Vec<Template>,

    #[serde(default)]
    pub resources: Resources,

    /// Environment variables exported to the command
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub environment: BTreeMap<String, String>,

    /// Overrides the configured task timeout for tasks of this step
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_hours: Option<f64>,
}

fn default_interpreter() -> String {
    DEFAULT_INTERPRETER.to_string()
}

/// An input port.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TemplateInput {
    pub channel: String,

    #[serde(rename = "type")]
    pub data_type: DataType,

    #[serde(default)]
    pub mode: InputMode,

    #[serde(default)]
    pub group: u32,

    /// Default data for top-level inputs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_yaml::Value>,
}

/// An output port.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TemplateOutput {
    pub channel: String,

    #[serde(rename = "type")]
    pub data_type: DataType,

    /// Where a leaf step's task finds the value; unused on branch steps
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<OutputSource>,

    #[serde(default)]
    pub mode: OutputMode,
}

/// How a task's output value is collected after the command exits.
///
/// Written in YAML as a map with exactly one key, e.g. `stream: stdout` or
/// `filename: out.txt`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(try_from = "SourceMap", into = "SourceMap")]
pub enum OutputSource {
    Filename(String),
    Filenames(Vec<String>),
    Glob(String),
    Stream(StreamName),
}

/// YAML shape of an [`OutputSource`].
#[derive(Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct SourceMap {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    filename: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    filenames: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    glob: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    stream: Option<StreamName>,
}

impl TryFrom<SourceMap> for OutputSource {
    type Error = String;

    fn try_from(map: SourceMap) -> Result<Self, Self::Error> {
        match map {
            SourceMap { filename: Some(name), filenames: None, glob: None, stream: None } => {
                Ok(Self::Filename(name))
            }
            SourceMap { filename: None, filenames: Some(names), glob: None, stream: None } => {
                Ok(Self::Filenames(names))
            }
            SourceMap { filename: None, filenames: None, glob: Some(pattern), stream: None } => {
                Ok(Self::Glob(pattern))
            }
            SourceMap { filename: None, filenames: None, glob: None, stream: Some(stream) } => {
                Ok(Self::Stream(stream))
            }
            _ => Err("output source needs exactly one of filename, filenames, glob or stream"
                .to_string()),
        }
    }
}

impl From<OutputSource> for SourceMap {
    fn from(source: OutputSource) -> Self {
        match source {
            OutputSource::Filename(name) => Self { filename: Some(name), ..Self::default() },
            OutputSource::Filenames(names) => Self { filenames: Some(names), ..Self::default() },
            OutputSource::Glob(pattern) => Self { glob: Some(pattern), ..Self::default() },
            OutputSource::Stream(stream) => Self { stream: Some(stream), ..Self::default() },
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StreamName {
    Stdout,
    Stderr,
}

/// Whether a task output is one value or an array scattered downstream.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum OutputMode {
    #[default]
    NoScatter,
    Scatter,
}

/// Resources requested by each task of a step.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Resources {
    #[serde(default = "default_cores")]
    pub cores: usize,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_gb: Option<f64>,
}

fn default_cores() -> usize {
    1
}

impl Default for Resources {
    fn default() -> Self {
        Self {
            cores: default_cores(),
            memory_gb: None,
        }
    }
}

impl Template {
    /// Creates a leaf step running `command`.
    ///
    /// # Example
    ///
    /// ```
    /// use scatterflow::data::{DataType, InputMode};
    /// use scatterflow::template::{OutputSource, Template};
    ///
    /// let step = Template::leaf("count", "wc -l {{ reads }} > {{ count }}")
    ///     .with_input("reads", DataType::File, InputMode::NoGather, 0)
    ///     .with_output("count", DataType::File, OutputSource::Filename("count.txt".into()));
    /// assert!(step.is_leaf());
    /// ```
    pub fn leaf(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            command: Some(command.into()),
            ..Self::branch(name)
        }
    }

    /// Creates an empty branch step.
    pub fn branch(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: None,
            interpreter: default_interpreter(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            steps: Vec::new(),
            resources: Resources::default(),
            environment: BTreeMap::new(),
            timeout_hours: None,
        }
    }

    pub fn with_input(
        mut self,
        channel: impl Into<String>,
        data_type: DataType,
        mode: InputMode,
        group: u32,
    ) -> Self {
        self.inputs.push(TemplateInput {
            channel: channel.into(),
            data_type,
            mode,
            group,
            data: None,
        });
        self
    }

    /// Adds a top-level input with default data.
    pub fn with_data_input(
        mut self,
        channel: impl Into<String>,
        data_type: DataType,
        data: serde_yaml::Value,
    ) -> Self {
        self.inputs.push(TemplateInput {
            channel: channel.into(),
            data_type,
            mode: InputMode::NoGather,
            group: 0,
            data: Some(data),
        });
        self
    }

    pub fn with_output(
        mut self,
        channel: impl Into<String>,
        data_type: DataType,
        source: OutputSource,
    ) -> Self {
        self.outputs.push(TemplateOutput {
            channel: channel.into(),
            data_type,
            source: Some(source),
            mode: OutputMode::NoScatter,
        });
        self
    }

    /// Adds an output whose values are scattered into an array.
    pub fn with_scatter_output(
        mut self,
        channel: impl Into<String>,
        data_type: DataType,
        source: OutputSource,
    ) -> Self {
        self.outputs.push(TemplateOutput {
            channel: channel.into(),
            data_type,
            source: Some(source),
            mode: OutputMode::Scatter,
        });
        self
    }

    /// Adds a branch output fed by a child step.
    pub fn with_branch_output(mut self, channel: impl Into<String>, data_type: DataType) -> Self {
        self.outputs.push(TemplateOutput {
            channel: channel.into(),
            data_type,
            source: None,
            mode: OutputMode::NoScatter,
        });
        self
    }

    pub fn with_step(mut self, step: Template) -> Self {
        self.steps.push(step);
        self
    }

    pub fn with_interpreter(mut self, interpreter: impl Into<String>) -> Self {
        self.interpreter = interpreter.into();
        self
    }

    pub fn with_cores(mut self, cores: usize) -> Self {
        self.resources.cores = cores;
        self
    }

    pub fn is_leaf(&self) -> bool {
        self.steps.is_empty()
    }

    /// Number of leaf steps in the tree.
    pub fn leaf_count(&self) -> usize {
        if self.is_leaf() {
            1
        } else {
            self.steps.iter().map(Template::leaf_count).sum()
        }
    }

    pub fn input(&self, channel: &str) -> Option<&TemplateInput> {
        self.inputs.iter().find(|i| i.channel == channel)
    }

    pub fn output(&self, channel: &str) -> Option<&TemplateOutput> {
        self.outputs.iter().find(|o| o.channel == channel)
    }
}
