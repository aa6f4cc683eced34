//! Command Rendering
//!
//! Renders a step's command and output file names for one input set.
//!
//! Commands are minijinja templates. The context holds:
//! - one variable per input channel (arrays render space-separated)
//! - one variable per file output, holding its rendered file name(s)
//! - `index` and `size`: the task's position in each scatter dimension
//!
//! Output file names are rendered first, against the inputs only.

use std::fmt::Write as _;

use minijinja::{escape_formatter, Environment, Output, State, UndefinedBehavior, Value};
use once_cell::sync::Lazy;
use serde_json::{json, Map};
use thiserror::Error;

use super::task::TaskOutputSpec;
use crate::data::{DataContents, DataValue};
use crate::scheduler::InputSet;
use crate::template::{OutputSource, TemplateOutput};

static TEMPLATE_ENV: Lazy<Environment<'static>> = Lazy::new(|| {
    let mut env = Environment::new();
    env.set_undefined_behavior(UndefinedBehavior::Strict);
    env.set_formatter(join_sequences);
    env
});

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("Failed to render {what}: {source}")]
    Template {
        what: String,
        #[source]
        source: minijinja::Error,
    },

    #[error("Output '{0}' has no source")]
    MissingSource(String),
}

/// A command and output list ready to hand to a backend.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderedTask {
    pub command: String,
    pub outputs: Vec<TaskOutputSpec>,
}

/// Renders `command` and the output sources of `outputs` for `input_set`.
pub fn render_task(
    command: &str,
    input_set: &InputSet,
    outputs: &[TemplateOutput],
) -> Result<RenderedTask, RenderError> {
    let mut context = input_context(input_set);

    let mut rendered_outputs = Vec::with_capacity(outputs.len());
    for output in outputs {
        let source = output
            .source
            .as_ref()
            .ok_or_else(|| RenderError::MissingSource(output.channel.clone()))?;
        let source = render_source(&output.channel, source, &context)?;
        rendered_outputs.push(TaskOutputSpec {
            channel: output.channel.clone(),
            data_type: output.data_type,
            source,
            mode: output.mode,
        });
    }

    for output in &rendered_outputs {
        match &output.source {
            OutputSource::Filename(name) | OutputSource::Glob(name) => {
                context.insert(output.channel.clone(), json!(name));
            }
            OutputSource::Filenames(names) => {
                context.insert(output.channel.clone(), json!(names));
            }
            OutputSource::Stream(_) => {}
        }
    }

    let command = render(command, &context, "command")?;
    Ok(RenderedTask {
        command,
        outputs: rendered_outputs,
    })
}

fn input_context(input_set: &InputSet) -> Map<String, serde_json::Value> {
    let mut context = Map::new();
    context.insert("index".to_string(), json!(input_set.data_path.indices()));
    context.insert("size".to_string(), json!(input_set.data_path.degrees()));

    for item in &input_set.items {
        let value = match &item.contents {
            DataContents::Scalar(value) => json_value(value),
            DataContents::Array(values) => {
                serde_json::Value::Array(values.iter().map(json_value).collect())
            }
        };
        context.insert(item.channel.clone(), value);
    }
    context
}

fn json_value(value: &DataValue) -> serde_json::Value {
    match value {
        DataValue::File(s) | DataValue::String(s) => json!(s),
        DataValue::Integer(i) => json!(i),
        DataValue::Float(f) => json!(f),
        DataValue::Boolean(b) => json!(b),
    }
}

fn render_source(
    channel: &str,
    source: &OutputSource,
    context: &Map<String, serde_json::Value>,
) -> Result<OutputSource, RenderError> {
    let what = format!("source of output '{}'", channel);
    Ok(match source {
        OutputSource::Filename(name) => OutputSource::Filename(render(name, context, &what)?),
        OutputSource::Filenames(names) => OutputSource::Filenames(
            names
                .iter()
                .map(|name| render(name, context, &what))
                .collect::<Result<_, _>>()?,
        ),
        OutputSource::Glob(pattern) => OutputSource::Glob(render(pattern, context, &what)?),
        OutputSource::Stream(stream) => OutputSource::Stream(*stream),
    })
}

fn render(
    template: &str,
    context: &Map<String, serde_json::Value>,
    what: &str,
) -> Result<String, RenderError> {
    TEMPLATE_ENV
        .render_str(template, Value::from_serialize(context))
        .map_err(|source| RenderError::Template {
            what: what.to_string(),
            source,
        })
}

/// Prints sequences as space-separated words, the way a shell expects a
/// list of arguments.
fn join_sequences(
    out: &mut Output<'_>,
    state: &State<'_, '_>,
    value: &Value,
) -> Result<(), minijinja::Error> {
    if value.kind() != minijinja::value::ValueKind::Seq {
        return escape_formatter(out, state, value);
    }

    for (i, item) in value.try_iter()?.enumerate() {
        if i > 0 {
            out.write_char(' ')?;
        }
        write!(out, "{}", item)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{DataPath, DataType, InputMode};
    use crate::scheduler::InputItem;
    use crate::template::{OutputMode, StreamName};

    fn item(channel: &str, contents: DataContents) -> InputItem {
        InputItem {
            channel: channel.to_string(),
            data_type: DataType::String,
            mode: InputMode::NoGather,
            contents,
        }
    }

    fn output(channel: &str, source: OutputSource) -> TemplateOutput {
        TemplateOutput {
            channel: channel.to_string(),
            data_type: DataType::File,
            source: Some(source),
            mode: OutputMode::NoScatter,
        }
    }

    fn set(items: Vec<InputItem>) -> InputSet {
        InputSet {
            data_path: DataPath::from_pairs(&[(1, 3)]),
            items,
        }
    }

    #[test]
    fn test_render_scalar_and_output_filename() {
        let inputs = set(vec![item(
            "name",
            DataContents::Scalar(DataValue::String("ada".into())),
        )]);
        let outputs = [output(
            "greeting",
            OutputSource::Filename("hello_{{ name }}.txt".into()),
        )];

        let rendered =
            render_task("echo hi {{ name }} > {{ greeting }}", &inputs, &outputs).unwrap();

        assert_eq!(rendered.command, "echo hi ada > hello_ada.txt");
        assert_eq!(
            rendered.outputs[0].source,
            OutputSource::Filename("hello_ada.txt".into())
        );
    }

    #[test]
    fn test_arrays_render_space_separated() {
        let inputs = set(vec![item(
            "words",
            DataContents::Array(vec![
                DataValue::String("a".into()),
                DataValue::String("b".into()),
                DataValue::String("c".into()),
            ]),
        )]);

        let rendered = render_task("cat {{ words }}", &inputs, &[]).unwrap();
        assert_eq!(rendered.command, "cat a b c");

        let rendered = render_task("echo {{ words | length }}", &inputs, &[]).unwrap();
        assert_eq!(rendered.command, "echo 3");
    }

    #[test]
    fn test_index_and_size() {
        let rendered = render_task("part {{ index[0] }} of {{ size[0] }}", &set(vec![]), &[]).unwrap();
        assert_eq!(rendered.command, "part 1 of 3");
    }

    #[test]
    fn test_filenames_and_streams() {
        let outputs = [
            output(
                "parts",
                OutputSource::Filenames(vec!["a.txt".into(), "b.txt".into()]),
            ),
            output("log", OutputSource::Stream(StreamName::Stdout)),
        ];

        let rendered = render_task("split {{ parts }}", &set(vec![]), &outputs).unwrap();

        assert_eq!(rendered.command, "split a.txt b.txt");
        assert_eq!(
            rendered.outputs[1].source,
            OutputSource::Stream(StreamName::Stdout)
        );
    }

    #[test]
    fn test_undefined_variable_is_an_error() {
        let result = render_task("echo {{ missing }}", &set(vec![]), &[]);
        assert!(matches!(result, Err(RenderError::Template { .. })));
    }

    #[test]
    fn test_output_without_source() {
        let outputs = [TemplateOutput {
            channel: "out".into(),
            data_type: DataType::String,
            source: None,
            mode: OutputMode::NoScatter,
        }];

        let result = render_task("true", &set(vec![]), &outputs);
        assert!(matches!(result, Err(RenderError::MissingSource(_))));
    }
}
