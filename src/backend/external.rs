//! External Task Managers
//!
//! Backends whose workers run outside this process. They only hand the
//! attempt off; the worker reports progress through the engine's
//! `report_attempt_status` and `report_heartbeat` entry points.
//!
//! Submission commands can be slow, so they run on their own thread and a
//! failed submission comes back as [`AttemptUpdate::LaunchFailed`].
//!
//! - [`ClusterTaskManager`]: submits a script to a batch scheduler
//! - [`CloudTaskManager`]: calls configured launch and cleanup hooks

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;

use log::{debug, info, warn};

use super::local::{write_script, AttemptLayout};
use super::{AttemptUpdate, BackendError, StatusReporter, TaskManager};
use crate::config::{CloudSettings, ClusterSettings};
use crate::task::{AttemptId, TaskAttempt};

/// Runs `cmd` to completion and returns its trimmed stdout.
fn run_command(mut cmd: Command, description: &str) -> Result<String, BackendError> {
    debug!("Running {}: {:?}", description, cmd);

    let output = cmd
        .stdin(Stdio::null())
        .output()
        .map_err(|e| BackendError::CommandFailed {
            command: description.to_string(),
            detail: e.to_string(),
        })?;

    if !output.status.success() {
        return Err(BackendError::CommandFailed {
            command: description.to_string(),
            detail: format!(
                "exit code {:?}: {}",
                output.status.code(),
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

fn attempt_env(cmd: &mut Command, attempt: &TaskAttempt) {
    cmd.envs(&attempt.environment)
        .env("SCATTERFLOW_ATTEMPT_ID", attempt.id.to_string())
        .env("SCATTERFLOW_ATTEMPT_STEP", &attempt.step_name)
        .env("SCATTERFLOW_ATTEMPT_COMMAND", &attempt.command)
        .env("SCATTERFLOW_ATTEMPT_INTERPRETER", &attempt.interpreter)
        .env("SCATTERFLOW_ATTEMPT_CORES", attempt.resources.cores.to_string());
    if let Some(memory) = attempt.resources.memory_gb {
        cmd.env("SCATTERFLOW_ATTEMPT_MEMORY_GB", memory.to_string());
    }
}

/// Runs `launch` on its own thread and reports its error, if any, as a
/// launch failure.
fn launch_in_background<F>(attempt_id: AttemptId, reporter: StatusReporter, launch: F)
where
    F: FnOnce() -> Result<(), BackendError> + Send + 'static,
{
    thread::spawn(move || {
        if let Err(e) = launch() {
            warn!("Launch of attempt {} failed: {}", attempt_id, e);
            reporter.report(
                attempt_id,
                AttemptUpdate::LaunchFailed {
                    error: e.to_string(),
                },
            );
        }
    });
}

/// Job bookkeeping shared with submission threads.
#[derive(Debug, Default)]
struct ClusterJobs {
    ids: HashMap<AttemptId, String>,
    /// Attempts killed or cleaned up before their submission returned
    abandoned: HashSet<AttemptId>,
}

/// Submits attempts to a batch scheduler (`sbatch` by default).
pub struct ClusterTaskManager {
    settings: ClusterSettings,
    shared_dir: PathBuf,
    jobs: Arc<Mutex<ClusterJobs>>,
}

impl ClusterTaskManager {
    pub fn new(settings: ClusterSettings, working_root: PathBuf) -> Self {
        let shared_dir = settings.shared_dir.clone().unwrap_or(working_root);
        Self {
            settings,
            shared_dir,
            jobs: Arc::new(Mutex::new(ClusterJobs::default())),
        }
    }

    pub fn job_id(&self, attempt_id: AttemptId) -> Option<String> {
        self.jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .ids
            .get(&attempt_id)
            .cloned()
    }

    fn submit_command(&self, attempt: &TaskAttempt, layout: &AttemptLayout) -> Command {
        let mut cmd = Command::new(&self.settings.submit_command);
        cmd.arg("--parsable")
            .arg(format!("--job-name={}", attempt.step_name))
            .arg(format!("--cpus-per-task={}", attempt.resources.cores))
            .arg(format!("--chdir={}", layout.files.work_dir.display()))
            .arg(format!("--output={}", layout.files.stdout.display()))
            .arg(format!("--error={}", layout.files.stderr.display()));
        if let Some(memory) = attempt.resources.memory_gb {
            cmd.arg(format!("--mem={}G", memory.ceil() as u64));
        }
        cmd.args(&self.settings.extra_args).arg(format!(
            "--wrap={} {}",
            attempt.interpreter,
            layout.script.display()
        ));
        attempt_env(&mut cmd, attempt);
        cmd
    }
}

fn cancel_job(cancel_command: &str, job_id: &str) -> Result<(), BackendError> {
    let mut cmd = Command::new(cancel_command);
    cmd.arg(job_id);
    run_command(cmd, cancel_command)?;
    info!("Cancelled cluster job {}", job_id);
    Ok(())
}

fn parse_job_id(stdout: &str, submit_command: &str) -> Result<String, BackendError> {
    // --parsable prints "jobid" or "jobid;cluster"
    stdout
        .lines()
        .last()
        .and_then(|line| line.split(';').next())
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .ok_or_else(|| BackendError::CommandFailed {
            command: submit_command.to_string(),
            detail: "no job id in output".to_string(),
        })
}

/// Submits the job and records its id. A job whose attempt was abandoned
/// while the submission ran is cancelled straight away.
fn submit_job(
    cmd: Command,
    submit_command: &str,
    cancel_command: &str,
    attempt_id: AttemptId,
    step_name: &str,
    jobs: &Mutex<ClusterJobs>,
) -> Result<(), BackendError> {
    let submitted =
        run_command(cmd, submit_command).and_then(|stdout| parse_job_id(&stdout, submit_command));

    let abandoned = {
        let mut jobs = jobs.lock().unwrap_or_else(PoisonError::into_inner);
        let abandoned = jobs.abandoned.remove(&attempt_id);
        if let (Ok(job_id), false) = (&submitted, abandoned) {
            jobs.ids.insert(attempt_id, job_id.clone());
        }
        abandoned
    };

    let job_id = submitted?;
    info!("Submitted {} as cluster job {}", step_name, job_id);
    if abandoned {
        debug!("Attempt {} was abandoned during submission", attempt_id);
        cancel_job(cancel_command, &job_id)?;
    }
    Ok(())
}

impl TaskManager for ClusterTaskManager {
    fn name(&self) -> &'static str {
        "cluster"
    }

    fn run(&self, attempt: &TaskAttempt, reporter: StatusReporter) -> Result<(), BackendError> {
        let layout = AttemptLayout::new(&self.shared_dir, attempt.id);
        layout.create_dirs()?;
        write_script(&layout.script, &attempt.interpreter, &attempt.command)?;

        let cmd = self.submit_command(attempt, &layout);
        let submit_command = self.settings.submit_command.clone();
        let cancel_command = self.settings.cancel_command.clone();
        let step_name = attempt.step_name.clone();
        let jobs = Arc::clone(&self.jobs);
        let attempt_id = attempt.id;

        launch_in_background(attempt_id, reporter, move || {
            submit_job(cmd, &submit_command, &cancel_command, attempt_id, &step_name, &jobs)
        });
        Ok(())
    }

    fn kill(&self, attempt: &TaskAttempt) -> Result<(), BackendError> {
        let job_id = {
            let mut jobs = self.jobs.lock().unwrap_or_else(PoisonError::into_inner);
            match jobs.ids.get(&attempt.id) {
                Some(job_id) => Some(job_id.clone()),
                None => {
                    jobs.abandoned.insert(attempt.id);
                    None
                }
            }
        };
        match job_id {
            Some(job_id) => cancel_job(&self.settings.cancel_command, &job_id),
            None => Ok(()),
        }
    }

    fn cleanup(&self, attempt: &TaskAttempt) -> Result<(), BackendError> {
        let job_id = {
            let mut jobs = self.jobs.lock().unwrap_or_else(PoisonError::into_inner);
            let job_id = jobs.ids.remove(&attempt.id);
            if job_id.is_none() {
                jobs.abandoned.insert(attempt.id);
            }
            job_id
        };

        if let Some(job_id) = job_id {
            if let Err(e) = cancel_job(&self.settings.cancel_command, &job_id) {
                // Finished jobs can no longer be cancelled.
                debug!("Cancel during cleanup of {} failed: {}", attempt.id, e);
            }
        }
        Ok(())
    }
}

/// Provisions a worker per attempt through configured hook commands.
pub struct CloudTaskManager {
    settings: CloudSettings,
}

impl CloudTaskManager {
    pub fn new(settings: CloudSettings) -> Self {
        Self { settings }
    }
}

fn run_hook(command: &str, attempt: &TaskAttempt) -> Result<String, BackendError> {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(command);
    attempt_env(&mut cmd, attempt);
    run_command(cmd, command)
}

impl TaskManager for CloudTaskManager {
    fn name(&self) -> &'static str {
        "cloud"
    }

    fn run(&self, attempt: &TaskAttempt, reporter: StatusReporter) -> Result<(), BackendError> {
        let command = self
            .settings
            .launch_command
            .clone()
            .ok_or_else(|| BackendError::NotConfigured("cloud.launch_command is not set".into()))?;

        let attempt = attempt.clone();
        launch_in_background(attempt.id, reporter, move || {
            let output = run_hook(&command, &attempt)?;
            info!("Launched worker for {} (attempt {})", attempt.step_name, attempt.id);
            if !output.is_empty() {
                debug!("Launch output: {}", output);
            }
            Ok(())
        });
        Ok(())
    }

    fn kill(&self, attempt: &TaskAttempt) -> Result<(), BackendError> {
        self.cleanup(attempt)
    }

    fn cleanup(&self, attempt: &TaskAttempt) -> Result<(), BackendError> {
        match self.settings.cleanup_command.as_deref() {
            Some(command) => run_hook(command, attempt).map(|_| ()),
            None => {
                warn!(
                    "No cloud.cleanup_command configured; worker for attempt {} left running",
                    attempt.id
                );
                Ok(())
            }
        }
    }
}
