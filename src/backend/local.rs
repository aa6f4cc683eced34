//! Local Task Manager
//!
//! Runs each attempt as a child process on this machine:
//! - Script generation under `{working_root}/{attempt_id}/`
//! - Interpreter launch with stdout and stderr captured to log files
//! - A waiter thread that collects outputs and reports the result
//!
//! Layout of an attempt directory:
//!
//! ```text
//! {working_root}/{attempt_id}/
//!     run.sh        the rendered command
//!     stdout.log
//!     stderr.log
//!     work/         the command's working directory
//! ```

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use log::{debug, error, info, warn};

use super::outputs::{collect_outputs, AttemptFiles};
use super::{AttemptUpdate, BackendError, StatusReporter, TaskManager};
use crate::task::{AttemptId, TaskAttempt};

const SCRIPT_NAME: &str = "run.sh";
const STDOUT_NAME: &str = "stdout.log";
const STDERR_NAME: &str = "stderr.log";
const WORK_DIR_NAME: &str = "work";

/// How often the waiter thread checks the child process.
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Lines of stderr quoted in a failure message.
const STDERR_TAIL_LINES: usize = 10;

type RunningChildren = Arc<Mutex<HashMap<AttemptId, Arc<Mutex<Child>>>>>;

/// Paths used by one attempt.
#[derive(Debug, Clone)]
pub struct AttemptLayout {
    pub dir: PathBuf,
    pub script: PathBuf,
    pub files: AttemptFiles,
}

impl AttemptLayout {
    pub fn new(root: &Path, attempt_id: AttemptId) -> Self {
        let dir = root.join(attempt_id.to_string());
        Self {
            script: dir.join(SCRIPT_NAME),
            files: AttemptFiles {
                work_dir: dir.join(WORK_DIR_NAME),
                stdout: dir.join(STDOUT_NAME),
                stderr: dir.join(STDERR_NAME),
            },
            dir,
        }
    }

    pub fn create_dirs(&self) -> Result<(), BackendError> {
        fs::create_dir_all(&self.files.work_dir).map_err(|source| BackendError::Io {
            action: "create directory",
            path: self.files.work_dir.clone(),
            source,
        })
    }

    /// Removes the attempt directory left by a launch that never started.
    pub fn discard(&self) {
        match fs::remove_dir_all(&self.dir) {
            Ok(()) => debug!("Removed {}", self.dir.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove {}: {}", self.dir.display(), e),
        }
    }
}

/// Writes the execution script for `command`.
///
/// Shell interpreters get `set -e` so a failing line fails the attempt.
pub(crate) fn write_script(
    path: &Path,
    interpreter: &str,
    command: &str,
) -> Result<(), BackendError> {
    let io_error = |source| BackendError::Io {
        action: "write script",
        path: path.to_path_buf(),
        source,
    };

    let mut file = File::create(path).map_err(io_error)?;
    writeln!(file, "#!{}", interpreter).map_err(io_error)?;
    if is_shell(interpreter) {
        writeln!(file, "set -e").map_err(io_error)?;
    }
    writeln!(file, "{}", command).map_err(io_error)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o755)).map_err(io_error)?;
    }

    Ok(())
}

fn is_shell(interpreter: &str) -> bool {
    let program = interpreter.split_whitespace().next().unwrap_or_default();
    matches!(
        Path::new(program).file_name().and_then(|n| n.to_str()),
        Some("bash" | "sh" | "zsh" | "dash")
    )
}

/// A command that runs `script` with `interpreter`, which may carry its own
/// arguments (`/bin/bash -eu`).
pub(crate) fn interpreter_command(interpreter: &str, script: &Path) -> Command {
    let mut parts = interpreter.split_whitespace();
    let mut cmd = Command::new(parts.next().unwrap_or("/bin/bash"));
    cmd.args(parts).arg(script);
    cmd
}

pub struct LocalTaskManager {
    working_root: PathBuf,
    available_cores: usize,
    running: RunningChildren,
}

impl LocalTaskManager {
    pub fn new(working_root: PathBuf) -> Self {
        Self::with_cores(working_root, num_cpus::get())
    }

    pub fn with_cores(working_root: PathBuf, available_cores: usize) -> Self {
        Self {
            working_root,
            available_cores,
            running: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn layout(&self, attempt_id: AttemptId) -> AttemptLayout {
        AttemptLayout::new(&self.working_root, attempt_id)
    }

    fn spawn(&self, attempt: &TaskAttempt, layout: &AttemptLayout) -> Result<Child, BackendError> {
        let open = |path: &PathBuf| {
            File::create(path).map_err(|source| BackendError::Io {
                action: "create log",
                path: path.clone(),
                source,
            })
        };
        let stdout = open(&layout.files.stdout)?;
        let stderr = open(&layout.files.stderr)?;

        let mut cmd = interpreter_command(&attempt.interpreter, &layout.script);
        cmd.current_dir(&layout.files.work_dir)
            .envs(&attempt.environment)
            .env("SCATTERFLOW_ATTEMPT_ID", attempt.id.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr));

        debug!("Executing in directory: {}", layout.files.work_dir.display());

        cmd.spawn().map_err(|source| BackendError::Io {
            action: "start interpreter for",
            path: layout.script.clone(),
            source,
        })
    }
}

impl TaskManager for LocalTaskManager {
    fn name(&self) -> &'static str {
        "local"
    }

    fn run(&self, attempt: &TaskAttempt, reporter: StatusReporter) -> Result<(), BackendError> {
        if attempt.resources.cores > self.available_cores {
            return Err(BackendError::InsufficientResources {
                requested: attempt.resources.cores,
                available: self.available_cores,
            });
        }

        let layout = self.layout(attempt.id);
        let spawned = layout
            .create_dirs()
            .and_then(|()| write_script(&layout.script, &attempt.interpreter, &attempt.command))
            .and_then(|()| self.spawn(attempt, &layout));
        let child = match spawned {
            Ok(child) => Arc::new(Mutex::new(child)),
            Err(e) => {
                layout.discard();
                return Err(e);
            }
        };
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(attempt.id, Arc::clone(&child));

        info!("Started {} (attempt {})", attempt.step_name, attempt.id);
        reporter.report(attempt.id, AttemptUpdate::Running);

        let id = attempt.id;
        let step_name = attempt.step_name.clone();
        let outputs = attempt.outputs.clone();
        let running = Arc::clone(&self.running);

        thread::spawn(move || {
            let status = wait_for_exit(&child);
            running
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&id);

            let update = match status {
                Ok(status) if status.success() => {
                    match collect_outputs(&outputs, &layout.files) {
                        Ok(outputs) => {
                            debug!("Step '{}' completed successfully", step_name);
                            AttemptUpdate::Finished { outputs }
                        }
                        Err(e) => {
                            error!("Step '{}' produced unusable outputs: {}", step_name, e);
                            AttemptUpdate::Failed {
                                error: e.to_string(),
                            }
                        }
                    }
                }
                Ok(status) => {
                    error!("Step '{}' failed with exit code: {:?}", step_name, status.code());
                    AttemptUpdate::Failed {
                        error: failure_message(status, &layout.files.stderr),
                    }
                }
                Err(e) => AttemptUpdate::Failed {
                    error: format!("Lost track of process: {}", e),
                },
            };

            reporter.report(id, update);
        });

        Ok(())
    }

    fn kill(&self, attempt: &TaskAttempt) -> Result<(), BackendError> {
        let child = self
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&attempt.id)
            .cloned();

        let Some(child) = child else {
            debug!("Attempt {} is not running locally; nothing to kill", attempt.id);
            return Ok(());
        };

        let mut child = child.lock().unwrap_or_else(PoisonError::into_inner);
        match child.kill() {
            Ok(()) => {
                info!("Killed process for attempt {}", attempt.id);
                Ok(())
            }
            // Already exited
            Err(e) if e.kind() == std::io::ErrorKind::InvalidInput => Ok(()),
            Err(source) => Err(BackendError::Io {
                action: "kill process for",
                path: self.layout(attempt.id).script,
                source,
            }),
        }
    }

    fn cleanup(&self, attempt: &TaskAttempt) -> Result<(), BackendError> {
        if let Some(child) = self
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&attempt.id)
        {
            let mut child = child.lock().unwrap_or_else(PoisonError::into_inner);
            if let Ok(None) = child.try_wait() {
                warn!("Reaping attempt {} that was still running", attempt.id);
                let _ = child.kill();
                let _ = child.wait();
            }
        }

        let script = self.layout(attempt.id).script;
        match fs::remove_file(&script) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(BackendError::Io {
                action: "remove script",
                path: script,
                source,
            }),
        }
    }

    fn in_process(&self) -> bool {
        true
    }
}

fn wait_for_exit(child: &Mutex<Child>) -> std::io::Result<ExitStatus> {
    loop {
        {
            let mut child = child.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(status) = child.try_wait()? {
                return Ok(status);
            }
        }
        thread::sleep(WAIT_POLL_INTERVAL);
    }
}

fn failure_message(status: ExitStatus, stderr: &Path) -> String {
    let mut message = match status.code() {
        Some(code) => format!("Command exited with code {}", code),
        None => "Command was terminated by a signal".to_string(),
    };

    if let Ok(text) = fs::read_to_string(stderr) {
        let lines: Vec<&str> = text.lines().collect();
        let tail = &lines[lines.len().saturating_sub(STDERR_TAIL_LINES)..];
        if !tail.is_empty() {
            message.push_str(":\n");
            message.push_str(&tail.join("\n"));
        }
    }
    message
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::AttemptReport;
    use crate::data::{DataContents, DataPath, DataType, DataValue};
    use crate::engine::RunId;
    use crate::scheduler::InputSet;
    use crate::task::{StepSpec, Task};
    use crate::template::{OutputSource, StreamName, Template};
    use std::sync::mpsc;
    use tempfile::tempdir;

    fn attempt(template: Template) -> TaskAttempt {
        let step = StepSpec::from_template(&template).unwrap();
        let task = Task::new(
            RunId::new(),
            &step,
            InputSet {
                data_path: DataPath::root(),
                items: Vec::new(),
            },
        )
        .unwrap();
        TaskAttempt::for_task(&task, 1)
    }

    fn final_report(rx: &mpsc::Receiver<AttemptReport>) -> AttemptUpdate {
        loop {
            let report = rx.recv_timeout(Duration::from_secs(10)).unwrap();
            if report.update != AttemptUpdate::Running {
                return report.update;
            }
        }
    }

    #[test]
    fn test_write_script() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("run.sh");

        write_script(&path, "/bin/bash", "echo 'hello world'").unwrap();

        let content = fs::read_to_string(&path).unwrap();
        assert!(content.starts_with("#!/bin/bash\nset -e\n"));
        assert!(content.contains("echo 'hello world'"));
    }

    #[test]
    fn test_write_script_non_shell() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("run.py");

        write_script(&path, "/usr/bin/python3", "print(1)").unwrap();

        let content = fs::read_to_string(&path).unwrap();
        assert!(!content.contains("set -e"));
    }

    #[test]
    fn test_is_shell() {
        assert!(is_shell("/bin/bash"));
        assert!(is_shell("sh -eu"));
        assert!(!is_shell("python3"));
    }

    #[test]
    fn test_run_reports_stdout_output() {
        let dir = tempdir().unwrap();
        let manager = LocalTaskManager::new(dir.path().to_path_buf());
        let attempt = attempt(Template::leaf("hello", "echo hello").with_output(
            "greeting",
            DataType::String,
            OutputSource::Stream(StreamName::Stdout),
        ));
        let (tx, rx) = mpsc::channel();

        manager.run(&attempt, StatusReporter::new(tx)).unwrap();

        let first = rx.recv_timeout(Duration::from_secs(10)).unwrap();
        assert_eq!(first.update, AttemptUpdate::Running);

        match final_report(&rx) {
            AttemptUpdate::Finished { outputs } => {
                assert_eq!(outputs[0].channel, "greeting");
                assert_eq!(
                    outputs[0].contents,
                    DataContents::Scalar(DataValue::String("hello".into()))
                );
            }
            other => panic!("unexpected update: {:?}", other),
        }
    }

    #[test]
    fn test_run_writes_files_in_work_dir() {
        let dir = tempdir().unwrap();
        let manager = LocalTaskManager::new(dir.path().to_path_buf());
        let attempt = attempt(Template::leaf("write", "echo data > out.txt").with_output(
            "out",
            DataType::File,
            OutputSource::Filename("out.txt".into()),
        ));
        let (tx, rx) = mpsc::channel();

        manager.run(&attempt, StatusReporter::new(tx)).unwrap();

        assert!(matches!(final_report(&rx), AttemptUpdate::Finished { .. }));
        let layout = manager.layout(attempt.id);
        assert!(layout.files.work_dir.join("out.txt").exists());

        manager.cleanup(&attempt).unwrap();
        assert!(!layout.script.exists());
        assert!(layout.files.work_dir.join("out.txt").exists());
    }

    #[test]
    fn test_failing_command_reports_stderr() {
        let dir = tempdir().unwrap();
        let manager = LocalTaskManager::new(dir.path().to_path_buf());
        let attempt = attempt(Template::leaf("boom", "echo broken >&2; exit 3"));
        let (tx, rx) = mpsc::channel();

        manager.run(&attempt, StatusReporter::new(tx)).unwrap();

        match final_report(&rx) {
            AttemptUpdate::Failed { error } => {
                assert!(error.contains("code 3"), "{}", error);
                assert!(error.contains("broken"), "{}", error);
            }
            other => panic!("unexpected update: {:?}", other),
        }
    }

    #[test]
    fn test_kill_running_attempt() {
        let dir = tempdir().unwrap();
        let manager = LocalTaskManager::new(dir.path().to_path_buf());
        let attempt = attempt(Template::leaf("sleepy", "sleep 30"));
        let (tx, rx) = mpsc::channel();

        manager.run(&attempt, StatusReporter::new(tx)).unwrap();
        manager.kill(&attempt).unwrap();

        assert!(matches!(final_report(&rx), AttemptUpdate::Failed { .. }));
        // A second kill is a no-op.
        manager.kill(&attempt).unwrap();
    }

    #[test]
    fn test_refuses_too_many_cores() {
        let dir = tempdir().unwrap();
        let manager = LocalTaskManager::with_cores(dir.path().to_path_buf(), 2);
        let attempt = attempt(Template::leaf("big", "true").with_cores(8));
        let (tx, _rx) = mpsc::channel();

        let result = manager.run(&attempt, StatusReporter::new(tx));

        assert!(matches!(
            result,
            Err(BackendError::InsufficientResources {
                requested: 8,
                available: 2
            })
        ));
        assert!(!manager.layout(attempt.id).dir.exists());
    }

    #[test]
    fn test_spawn_failure_removes_attempt_dir() {
        let dir = tempdir().unwrap();
        let manager = LocalTaskManager::new(dir.path().to_path_buf());
        let attempt = attempt(
            Template::leaf("missing", "true").with_interpreter("/nonexistent/interpreter"),
        );
        let (tx, rx) = mpsc::channel();

        let result = manager.run(&attempt, StatusReporter::new(tx));

        assert!(matches!(result, Err(BackendError::Io { .. })));
        assert!(!manager.layout(attempt.id).dir.exists());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_cleanup_without_run() {
        let dir = tempdir().unwrap();
        let manager = LocalTaskManager::new(dir.path().to_path_buf());
        let attempt = attempt(Template::leaf("never", "true"));

        assert!(manager.cleanup(&attempt).is_ok());
    }
}
