//! Template Validation
//!
//! Checks a template tree before any run is created:
//! - Step field validation (commands on leaves only, output sources)
//! - Channel wiring inside every branch (one producer per channel)
//! - Type agreement between producers and consumers
//! - No cyclic dependencies between sibling steps
//! - Bounded nesting depth

use std::collections::{HashMap, HashSet, VecDeque};

use log::{debug, info, warn};
use thiserror::Error;

use super::model::{OutputMode, OutputSource, Template};
use super::TemplateError;
use crate::data::DataType;

/// Deepest template nesting accepted.
pub const MAXIMUM_TREE_DEPTH: usize = 10;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ValidationError {
    #[error("Step has empty or whitespace-only name")]
    EmptyStepName,

    #[error("Duplicate step name '{0}'")]
    DuplicateStepName(String),

    #[error("Step '{0}' has no command specified")]
    MissingCommand(String),

    #[error("Step '{0}' has child steps and must not define a command")]
    CommandOnBranch(String),

    #[error("Step '{step}': output '{channel}' has no source")]
    MissingOutputSource { step: String, channel: String },

    #[error("Step '{step}': channel '{channel}' is declared more than once")]
    DuplicateChannel { step: String, channel: String },

    #[error("Step '{step}': channel '{channel}' is both an input and an output")]
    ChannelBothInputAndOutput { step: String, channel: String },

    #[error("Step '{step}': input '{channel}' is not provided by any sibling or parent input")]
    UnconnectedInput { step: String, channel: String },

    #[error("Step '{step}': output '{channel}' is not produced by any child step")]
    UnproducedOutput { step: String, channel: String },

    #[error("Step '{step}': channel '{channel}' has more than one producer")]
    DuplicateProducer { step: String, channel: String },

    #[error("Channel '{channel}' is {expected} where produced but {found} where consumed")]
    TypeMismatch {
        channel: String,
        expected: DataType,
        found: DataType,
    },

    #[error("Steps inside '{0}' depend on each other in a loop")]
    CyclicDependency(String),

    #[error("Template nesting exceeds {} levels at step '{0}'", MAXIMUM_TREE_DEPTH)]
    TooDeep(String),
}

/// Validates a single step's own fields.
fn validate_step(step: &Template) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    if step.name.trim().is_empty() {
        errors.push(ValidationError::EmptyStepName);
        return errors;
    }

    if step.is_leaf() {
        match &step.command {
            Some(command) if !command.trim().is_empty() => {}
            _ => errors.push(ValidationError::MissingCommand(step.name.clone())),
        }

        for output in &step.outputs {
            match &output.source {
                None => errors.push(ValidationError::MissingOutputSource {
                    step: step.name.clone(),
                    channel: output.channel.clone(),
                }),
                Some(OutputSource::Filenames(_)) | Some(OutputSource::Glob(_))
                    if output.mode == OutputMode::NoScatter =>
                {
                    warn!(
                        "Step '{}': output '{}' collects several files but is not scattered; \
                         exactly one match will be required",
                        step.name, output.channel
                    );
                }
                Some(_) => {}
            }
        }
    } else if step.command.is_some() {
        errors.push(ValidationError::CommandOnBranch(step.name.clone()));
    }

    let mut seen = HashSet::new();
    for channel in step.inputs.iter().map(|i| &i.channel) {
        if !seen.insert(channel) {
            errors.push(ValidationError::DuplicateChannel {
                step: step.name.clone(),
                channel: channel.clone(),
            });
        }
    }

    let mut seen_outputs = HashSet::new();
    for channel in step.outputs.iter().map(|o| &o.channel) {
        if !seen_outputs.insert(channel) {
            errors.push(ValidationError::DuplicateChannel {
                step: step.name.clone(),
                channel: channel.clone(),
            });
        }
        if seen.contains(channel) {
            errors.push(ValidationError::ChannelBothInputAndOutput {
                step: step.name.clone(),
                channel: channel.clone(),
            });
        }
    }

    errors
}

/// Validates how the children of a branch are wired together.
fn validate_wiring(branch: &Template) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    // channel -> (producer index or None for the branch input, type)
    let mut producers: HashMap<&str, (Option<usize>, DataType)> = HashMap::new();
    for input in &branch.inputs {
        producers.insert(&input.channel, (None, input.data_type));
    }

    let mut names = HashSet::new();
    for (index, child) in branch.steps.iter().enumerate() {
        if !names.insert(child.name.as_str()) {
            errors.push(ValidationError::DuplicateStepName(child.name.clone()));
        }

        for output in &child.outputs {
            if producers
                .insert(&output.channel, (Some(index), output.data_type))
                .is_some()
            {
                errors.push(ValidationError::DuplicateProducer {
                    step: branch.name.clone(),
                    channel: output.channel.clone(),
                });
            }
        }
    }

    for child in &branch.steps {
        for input in &child.inputs {
            match producers.get(input.channel.as_str()) {
                None => errors.push(ValidationError::UnconnectedInput {
                    step: child.name.clone(),
                    channel: input.channel.clone(),
                }),
                Some((_, produced)) if *produced != input.data_type => {
                    errors.push(ValidationError::TypeMismatch {
                        channel: input.channel.clone(),
                        expected: *produced,
                        found: input.data_type,
                    })
                }
                Some(_) => {}
            }
        }
    }

    for output in &branch.outputs {
        match producers.get(output.channel.as_str()) {
            Some((Some(_), produced)) if *produced != output.data_type => {
                errors.push(ValidationError::TypeMismatch {
                    channel: output.channel.clone(),
                    expected: *produced,
                    found: output.data_type,
                })
            }
            Some((Some(_), _)) => {}
            _ => errors.push(ValidationError::UnproducedOutput {
                step: branch.name.clone(),
                channel: output.channel.clone(),
            }),
        }
    }

    if errors.is_empty() && !is_acyclic(branch, &producers) {
        errors.push(ValidationError::CyclicDependency(branch.name.clone()));
    }

    errors
}

/// Kahn's algorithm over the sibling dependency graph.
fn is_acyclic(branch: &Template, producers: &HashMap<&str, (Option<usize>, DataType)>) -> bool {
    let count = branch.steps.len();
    let mut in_degree = vec![0usize; count];
    let mut successors: Vec<HashSet<usize>> = vec![HashSet::new(); count];

    for (consumer, child) in branch.steps.iter().enumerate() {
        for input in &child.inputs {
            if let Some((Some(producer), _)) = producers.get(input.channel.as_str()) {
                if successors[*producer].insert(consumer) {
                    in_degree[consumer] += 1;
                }
            }
        }
    }

    let mut queue: VecDeque<usize> = (0..count).filter(|&i| in_degree[i] == 0).collect();
    let mut visited = 0;

    while let Some(current) = queue.pop_front() {
        visited += 1;
        for &next in &successors[current] {
            in_degree[next] -= 1;
            if in_degree[next] == 0 {
                queue.push_back(next);
            }
        }
    }

    visited == count
}

/// Collects every validation error in the tree.
pub fn collect_errors(template: &Template) -> Vec<ValidationError> {
    let mut errors = Vec::new();
    collect_into(template, 1, &mut errors);
    errors
}

fn collect_into(step: &Template, depth: usize, errors: &mut Vec<ValidationError>) {
    if depth > MAXIMUM_TREE_DEPTH {
        errors.push(ValidationError::TooDeep(step.name.clone()));
        return;
    }

    errors.extend(validate_step(step));

    if !step.is_leaf() {
        errors.extend(validate_wiring(step));
        for child in &step.steps {
            collect_into(child, depth + 1, errors);
        }
    } else {
        debug!("Step '{}' is a leaf step", step.name);
    }
}

/// Validates the entire template tree.
///
/// Performs the following checks:
/// 1. Every step has a name and leaves have a command
/// 2. No duplicate step names among siblings or duplicate channels per step
/// 3. Every consumed channel has exactly one producer with a matching type
/// 4. Every branch output is produced by a child
/// 5. No cyclic dependencies between siblings
/// 6. Nesting stays within [`MAXIMUM_TREE_DEPTH`]
pub fn validate_template(template: &Template) -> Result<(), TemplateError> {
    info!("Validating template '{}'", template.name);

    let errors = collect_errors(template);
    if !errors.is_empty() {
        return Err(TemplateError::Invalid(errors));
    }

    info!(
        "Template validated: {} leaf steps",
        template.leaf_count()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::InputMode;
    use crate::template::model::StreamName;

    fn stdout() -> OutputSource {
        OutputSource::Stream(StreamName::Stdout)
    }

    fn valid_pipeline() -> Template {
        Template::branch("pipeline")
            .with_data_input("x", DataType::String, serde_yaml::Value::Null)
            .with_branch_output("z", DataType::String)
            .with_step(
                Template::leaf("first", "echo {{ x }}")
                    .with_input("x", DataType::String, InputMode::NoGather, 0)
                    .with_output("y", DataType::String, stdout()),
            )
            .with_step(
                Template::leaf("second", "echo {{ y }}")
                    .with_input("y", DataType::String, InputMode::Gather(1), 0)
                    .with_output("z", DataType::String, stdout()),
            )
    }

    #[test]
    fn test_valid_template() {
        assert!(validate_template(&valid_pipeline()).is_ok());
    }

    #[test]
    fn test_leaf_without_command() {
        let mut step = Template::leaf("empty", "   ");
        step.command = Some("   ".into());

        assert_eq!(
            collect_errors(&step),
            vec![ValidationError::MissingCommand("empty".into())]
        );
    }

    #[test]
    fn test_branch_with_command() {
        let mut tree = valid_pipeline();
        tree.command = Some("echo nope".into());

        assert!(collect_errors(&tree).contains(&ValidationError::CommandOnBranch("pipeline".into())));
    }

    #[test]
    fn test_missing_output_source() {
        let step = Template::leaf("s", "true").with_branch_output("out", DataType::File);

        assert_eq!(
            collect_errors(&step),
            vec![ValidationError::MissingOutputSource {
                step: "s".into(),
                channel: "out".into()
            }]
        );
    }

    #[test]
    fn test_unconnected_input() {
        let tree = Template::branch("pipeline").with_step(
            Template::leaf("orphan", "cat {{ nothing }}").with_input(
                "nothing",
                DataType::File,
                InputMode::NoGather,
                0,
            ),
        );

        assert!(matches!(
            collect_errors(&tree)[0],
            ValidationError::UnconnectedInput { .. }
        ));
    }

    #[test]
    fn test_unproduced_output() {
        let tree = valid_pipeline().with_branch_output("missing", DataType::File);

        assert!(collect_errors(&tree).contains(&ValidationError::UnproducedOutput {
            step: "pipeline".into(),
            channel: "missing".into()
        }));
    }

    #[test]
    fn test_duplicate_producer() {
        let tree = valid_pipeline().with_step(
            Template::leaf("third", "echo again").with_output("y", DataType::String, stdout()),
        );

        assert!(collect_errors(&tree).contains(&ValidationError::DuplicateProducer {
            step: "pipeline".into(),
            channel: "y".into()
        }));
    }

    #[test]
    fn test_type_mismatch() {
        let tree = Template::branch("pipeline")
            .with_step(Template::leaf("a", "echo 1").with_output("n", DataType::Integer, stdout()))
            .with_step(
                Template::leaf("b", "echo {{ n }}")
                    .with_input("n", DataType::File, InputMode::NoGather, 0),
            );

        assert_eq!(
            collect_errors(&tree),
            vec![ValidationError::TypeMismatch {
                channel: "n".into(),
                expected: DataType::Integer,
                found: DataType::File
            }]
        );
    }

    #[test]
    fn test_cycle_detected() {
        let tree = Template::branch("loop")
            .with_step(
                Template::leaf("a", "echo {{ q }}")
                    .with_input("q", DataType::String, InputMode::NoGather, 0)
                    .with_output("p", DataType::String, stdout()),
            )
            .with_step(
                Template::leaf("b", "echo {{ p }}")
                    .with_input("p", DataType::String, InputMode::NoGather, 0)
                    .with_output("q", DataType::String, stdout()),
            );

        assert_eq!(
            collect_errors(&tree),
            vec![ValidationError::CyclicDependency("loop".into())]
        );
    }

    #[test]
    fn test_duplicate_sibling_names() {
        let tree = Template::branch("pipeline")
            .with_step(Template::leaf("same", "true"))
            .with_step(Template::leaf("same", "true"));

        assert!(collect_errors(&tree).contains(&ValidationError::DuplicateStepName("same".into())));
    }

    #[test]
    fn test_channel_both_input_and_output() {
        let step = Template::leaf("s", "true")
            .with_input("c", DataType::String, InputMode::NoGather, 0)
            .with_output("c", DataType::String, stdout());

        assert!(collect_errors(&step).contains(&ValidationError::ChannelBothInputAndOutput {
            step: "s".into(),
            channel: "c".into()
        }));
    }

    #[test]
    fn test_depth_limit() {
        let mut tree = Template::leaf("deepest", "true");
        for level in 0..MAXIMUM_TREE_DEPTH {
            tree = Template::branch(format!("level{}", level)).with_step(tree);
        }

        assert!(matches!(
            collect_errors(&tree).last(),
            Some(ValidationError::TooDeep(_))
        ));
    }
}
