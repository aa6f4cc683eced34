//! Output Collection
//!
//! Turns what a finished attempt left behind (files in its working
//! directory, captured stdout and stderr) into typed output values.
//!
//! - `file` outputs become the absolute path of each produced file
//! - other types are parsed from the file or stream contents
//! - `scatter` outputs become an array; contents are split on whitespace
//! - `no_scatter` outputs must yield exactly one value

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use globset::Glob;
use log::debug;
use thiserror::Error;

use super::AttemptOutput;
use crate::data::{DataContents, DataType, DataValue, ValueError};
use crate::task::TaskOutputSpec;
use crate::template::{OutputMode, OutputSource, StreamName};

#[derive(Debug, Error)]
pub enum OutputError {
    #[error("Output file '{0}' was not created")]
    MissingFile(PathBuf),

    #[error("Invalid glob pattern '{pattern}': {source}")]
    Glob {
        pattern: String,
        #[source]
        source: globset::Error,
    },

    #[error("Output '{channel}' expects exactly one value but the task produced {count}")]
    NotScalar { channel: String, count: usize },

    #[error("Output '{channel}' has an invalid value: {source}")]
    Value {
        channel: String,
        #[source]
        source: ValueError,
    },

    #[error("Failed to read '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Where an attempt's captured streams and files live.
#[derive(Debug, Clone)]
pub struct AttemptFiles {
    pub work_dir: PathBuf,
    pub stdout: PathBuf,
    pub stderr: PathBuf,
}

/// Collects every output of a finished attempt.
pub fn collect_outputs(
    specs: &[TaskOutputSpec],
    files: &AttemptFiles,
) -> Result<Vec<AttemptOutput>, OutputError> {
    specs
        .iter()
        .map(|spec| {
            let contents = collect_output(spec, files)?;
            debug!("Collected output '{}': {:?}", spec.channel, contents);
            Ok(AttemptOutput {
                channel: spec.channel.clone(),
                contents,
            })
        })
        .collect()
}

fn collect_output(spec: &TaskOutputSpec, files: &AttemptFiles) -> Result<DataContents, OutputError> {
    let texts = match &spec.source {
        OutputSource::Filename(name) => vec![file_value(spec, &files.work_dir.join(name))?],
        OutputSource::Filenames(names) => names
            .iter()
            .map(|name| file_value(spec, &files.work_dir.join(name)))
            .collect::<Result<_, _>>()?,
        OutputSource::Glob(pattern) => glob_files(&files.work_dir, pattern)?
            .iter()
            .map(|path| file_value(spec, path))
            .collect::<Result<_, _>>()?,
        OutputSource::Stream(stream) => {
            let path = match stream {
                StreamName::Stdout => &files.stdout,
                StreamName::Stderr => &files.stderr,
            };
            vec![file_value(spec, path)?]
        }
    };

    let texts: Vec<String> = match (spec.data_type, spec.mode) {
        (DataType::File, _) => texts,
        (_, OutputMode::Scatter) => texts
            .iter()
            .flat_map(|text| text.split_whitespace().map(str::to_string))
            .collect(),
        (_, OutputMode::NoScatter) => texts.into_iter().map(|t| t.trim().to_string()).collect(),
    };

    let mut values = texts
        .iter()
        .map(|text| DataValue::parse(spec.data_type, text))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| OutputError::Value {
            channel: spec.channel.clone(),
            source,
        })?;

    match spec.mode {
        OutputMode::Scatter => Ok(DataContents::Array(values)),
        OutputMode::NoScatter if values.len() == 1 => Ok(DataContents::Scalar(values.remove(0))),
        OutputMode::NoScatter => Err(OutputError::NotScalar {
            channel: spec.channel.clone(),
            count: values.len(),
        }),
    }
}

/// The path itself for `file` outputs, otherwise the file's contents.
fn file_value(spec: &TaskOutputSpec, path: &Path) -> Result<String, OutputError> {
    if !path.is_file() {
        return Err(OutputError::MissingFile(path.to_path_buf()));
    }

    if spec.data_type == DataType::File {
        let absolute = fs::canonicalize(path).map_err(|source| OutputError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        return Ok(absolute.to_string_lossy().into_owned());
    }

    fs::read_to_string(path).map_err(|source| OutputError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Files under `dir` whose relative path matches `pattern`, sorted.
fn glob_files(dir: &Path, pattern: &str) -> Result<Vec<PathBuf>, OutputError> {
    let matcher = Glob::new(pattern)
        .map_err(|source| OutputError::Glob {
            pattern: pattern.to_string(),
            source,
        })?
        .compile_matcher();

    let mut matches = Vec::new();
    let mut pending = vec![dir.to_path_buf()];
    while let Some(current) = pending.pop() {
        let entries = fs::read_dir(&current).map_err(|source| OutputError::Io {
            path: current.clone(),
            source,
        })?;
        for entry in entries {
            let path = entry
                .map_err(|source| OutputError::Io {
                    path: current.clone(),
                    source,
                })?
                .path();
            if path.is_dir() {
                pending.push(path);
            } else if let Ok(relative) = path.strip_prefix(dir) {
                if matcher.is_match(relative) {
                    matches.push(path);
                }
            }
        }
    }

    matches.sort();
    Ok(matches)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn spec(data_type: DataType, source: OutputSource, mode: OutputMode) -> TaskOutputSpec {
        TaskOutputSpec {
            channel: "out".into(),
            data_type,
            source,
            mode,
        }
    }

    fn files(dir: &Path) -> AttemptFiles {
        AttemptFiles {
            work_dir: dir.to_path_buf(),
            stdout: dir.join("stdout.log"),
            stderr: dir.join("stderr.log"),
        }
    }

    #[test]
    fn test_file_output_is_absolute_path() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("result.txt"), "data").unwrap();

        let outputs = collect_outputs(
            &[spec(
                DataType::File,
                OutputSource::Filename("result.txt".into()),
                OutputMode::NoScatter,
            )],
            &files(dir.path()),
        )
        .unwrap();

        let DataContents::Scalar(DataValue::File(path)) = &outputs[0].contents else {
            panic!("expected a file value");
        };
        assert!(Path::new(path).is_absolute());
        assert!(path.ends_with("result.txt"));
    }

    #[test]
    fn test_stdout_integer() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("stdout.log"), "42\n").unwrap();

        let outputs = collect_outputs(
            &[spec(
                DataType::Integer,
                OutputSource::Stream(StreamName::Stdout),
                OutputMode::NoScatter,
            )],
            &files(dir.path()),
        )
        .unwrap();

        assert_eq!(outputs[0].contents, DataContents::Scalar(DataValue::Integer(42)));
    }

    #[test]
    fn test_scatter_stream_splits_on_whitespace() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("stdout.log"), "a b\nc\n").unwrap();

        let outputs = collect_outputs(
            &[spec(
                DataType::String,
                OutputSource::Stream(StreamName::Stdout),
                OutputMode::Scatter,
            )],
            &files(dir.path()),
        )
        .unwrap();

        assert_eq!(
            outputs[0].contents,
            DataContents::Array(vec![
                DataValue::String("a".into()),
                DataValue::String("b".into()),
                DataValue::String("c".into()),
            ])
        );
    }

    #[test]
    fn test_glob_matches_sorted() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("part_2.txt"), "").unwrap();
        fs::write(dir.path().join("part_1.txt"), "").unwrap();
        fs::write(dir.path().join("other.log"), "").unwrap();

        let outputs = collect_outputs(
            &[spec(
                DataType::File,
                OutputSource::Glob("part_*.txt".into()),
                OutputMode::Scatter,
            )],
            &files(dir.path()),
        )
        .unwrap();

        let values = outputs[0].contents.values();
        assert_eq!(values.len(), 2);
        assert!(values[0].substitution_value().ends_with("part_1.txt"));
        assert!(values[1].substitution_value().ends_with("part_2.txt"));
    }

    #[test]
    fn test_empty_glob_scatter_is_empty_array() {
        let dir = tempdir().unwrap();

        let outputs = collect_outputs(
            &[spec(
                DataType::File,
                OutputSource::Glob("*.bam".into()),
                OutputMode::Scatter,
            )],
            &files(dir.path()),
        )
        .unwrap();

        assert_eq!(outputs[0].contents, DataContents::Array(vec![]));
    }

    #[test]
    fn test_no_scatter_requires_one_value() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), "").unwrap();
        fs::write(dir.path().join("b.txt"), "").unwrap();

        let result = collect_outputs(
            &[spec(
                DataType::File,
                OutputSource::Glob("*.txt".into()),
                OutputMode::NoScatter,
            )],
            &files(dir.path()),
        );

        assert!(matches!(result, Err(OutputError::NotScalar { count: 2, .. })));
    }

    #[test]
    fn test_missing_file() {
        let dir = tempdir().unwrap();

        let result = collect_outputs(
            &[spec(
                DataType::File,
                OutputSource::Filename("nope.txt".into()),
                OutputMode::NoScatter,
            )],
            &files(dir.path()),
        );

        assert!(matches!(result, Err(OutputError::MissingFile(_))));
    }

    #[test]
    fn test_unparseable_value() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("stdout.log"), "many").unwrap();

        let result = collect_outputs(
            &[spec(
                DataType::Integer,
                OutputSource::Stream(StreamName::Stdout),
                OutputMode::NoScatter,
            )],
            &files(dir.path()),
        );

        assert!(matches!(result, Err(OutputError::Value { .. })));
    }
}
