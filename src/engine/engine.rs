//! Workflow Execution Engine
//!
//! Drives runs from submission to completion:
//! - Instantiates the run tree and wires channels between sibling steps
//! - Evaluates input readiness whenever data arrives and creates tasks
//! - Launches attempts on the configured backend and applies the retry policy
//! - Writes task outputs and triggers downstream steps
//! - Kills run trees on cancellation or failure
//!
//! Nothing blocks waiting for data. Work happens in response to submissions
//! and reports; the only wall-clock loops are heartbeat supervision, delayed
//! retries and the periodic system check in [`Engine::wait_for_run`].
//!
//! Locks are always taken in the order scheduler, tasks, then data or
//! attempts.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use chrono::Utc;
use log::{debug, error, info, warn};

use super::run::{Run, RunId, RunOutput, RunStatus};
use super::status::{AttemptSummary, OutputSummary, RunSummary, TaskSummary};
use crate::backend::{
    create_task_manager, AttemptOutput, AttemptReport, AttemptUpdate, StatusReporter, TaskManager,
};
use crate::config::Settings;
use crate::data::{Channel, DataContents, DataNodeError, DataPath, DataStore, NodeId, SharedDataStore};
use crate::error::EngineError;
use crate::scheduler::InputManager;
use crate::task::{
    AttemptId, AttemptStatus, AttemptStore, FailureKind, StepSpec, StoreError, Task, TaskAttempt,
    TaskAttemptMonitor, TaskId, TaskStatus, TaskStore,
};
use crate::template::{validate_template, OutputMode, RunInputs, Template};

/// Longest single wait for a backend report inside `wait_for_run`.
const WAIT_SLICE: Duration = Duration::from_millis(200);

/// What to do with an attempt's backend resources when it fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Teardown {
    /// Nothing was started
    Nothing,
    Cleanup,
    /// The attempt may still be executing
    KillAndCleanup,
}

#[derive(Debug, Default)]
struct Scheduler {
    runs: HashMap<RunId, Run>,
    /// Leaf runs reading each data tree, with the input name they use
    subscribers: HashMap<NodeId, Vec<(RunId, String)>>,
    /// Tasks waiting out a retry delay, with the time they may relaunch
    delayed: Vec<(Instant, TaskId)>,
}

impl Scheduler {
    fn run(&self, id: RunId) -> Result<&Run, EngineError> {
        self.runs.get(&id).ok_or(EngineError::RunNotFound(id))
    }

    fn run_mut(&mut self, id: RunId) -> Result<&mut Run, EngineError> {
        self.runs.get_mut(&id).ok_or(EngineError::RunNotFound(id))
    }

    fn root_of(&self, id: RunId) -> RunId {
        let mut current = id;
        while let Some(parent) = self.runs.get(&current).and_then(|run| run.parent) {
            current = parent;
        }
        current
    }

    /// `id` and every run below it, parents before children.
    fn descendants(&self, id: RunId) -> Vec<RunId> {
        let mut found = Vec::new();
        let mut pending = vec![id];
        while let Some(current) = pending.pop() {
            if let Some(run) = self.runs.get(&current) {
                found.push(current);
                pending.extend(run.children.iter().rev().copied());
            }
        }
        found
    }
}

/// Workflow execution engine.
///
/// # Example
///
/// ```rust,no_run
/// use scatterflow::config::Settings;
/// use scatterflow::engine::Engine;
/// use scatterflow::template::{load_inputs, load_template};
///
/// fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let template = load_template("pipeline.yaml")?;
///     let inputs = load_inputs("inputs.yaml")?;
///
///     let engine = Engine::from_settings(Settings::load(None)?);
///     let run_id = engine.submit_run(template, inputs)?;
///     let status = engine.wait_for_run(run_id, None)?;
///     println!("Run {} {}", run_id, status);
///     Ok(())
/// }
/// ```
pub struct Engine {
    settings: Settings,
    data: SharedDataStore,
    scheduler: Mutex<Scheduler>,
    tasks: TaskStore,
    attempts: Arc<AttemptStore>,
    backend: Arc<dyn TaskManager>,
    monitor: TaskAttemptMonitor,
    sender: Sender<AttemptReport>,
    receiver: Mutex<Receiver<AttemptReport>>,
}

impl Engine {
    pub fn new(settings: Settings, backend: Arc<dyn TaskManager>) -> Self {
        let attempts = Arc::new(AttemptStore::with_retries(settings.heartbeat_write_retries));
        let monitor = TaskAttemptMonitor::new(Arc::clone(&attempts), &settings);
        let (sender, receiver) = mpsc::channel();

        Self {
            settings,
            data: DataStore::shared(),
            scheduler: Mutex::new(Scheduler::default()),
            tasks: TaskStore::new(),
            attempts,
            backend,
            monitor,
            sender,
            receiver: Mutex::new(receiver),
        }
    }

    /// Creates an engine with the backend selected by `settings`.
    pub fn from_settings(settings: Settings) -> Self {
        let backend = create_task_manager(&settings);
        Self::new(settings, backend)
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    // ------------------------------------------------------------------
    // Front-end entry points
    // ------------------------------------------------------------------

    /// Instantiates `template` as a new run, writes its inputs and starts
    /// every step whose inputs are ready.
    ///
    /// Each top-level input takes its value from `inputs`, falling back to
    /// the template's own `data`.
    pub fn submit_run(&self, template: Template, inputs: RunInputs) -> Result<RunId, EngineError> {
        validate_template(&template)?;

        if let Some(unknown) = inputs.keys().find(|name| template.input(name).is_none()) {
            return Err(EngineError::UnknownInput(unknown.clone()));
        }

        let mut values = Vec::with_capacity(template.inputs.len());
        for input in &template.inputs {
            let value = inputs
                .get(&input.channel)
                .or(input.data.as_ref())
                .cloned()
                .ok_or_else(|| EngineError::MissingInput(input.channel.clone()))?;
            values.push((input.channel.clone(), value));
        }

        let mut sched = self.lock_scheduler();
        let (root_id, bindings) = {
            let mut data = self.write_data();
            let mut bindings = BTreeMap::new();
            for input in &template.inputs {
                bindings.insert(input.channel.clone(), data.create_root(input.data_type));
            }
            for output in &template.outputs {
                bindings.insert(output.channel.clone(), data.create_root(output.data_type));
            }
            let root_id = instantiate(&mut sched, &template, None, &bindings, &mut data)?;
            (root_id, bindings)
        };

        info!(
            "Submitted run {} for '{}' ({} steps)",
            root_id,
            template.name,
            template.leaf_count()
        );

        let written: Result<(), DataNodeError> = {
            let mut data = self.write_data();
            values.iter().try_for_each(|(channel, value)| {
                data.add_yaml(bindings[channel], &DataPath::root(), value)
            })
        };
        if let Err(e) = written {
            error!("Invalid input for run {}: {}", root_id, e);
            sched
                .run_mut(root_id)?
                .terminate(RunStatus::Failed, format!("Invalid input: {}", e), true);
            return Err(e.into());
        }

        let leaves: Vec<RunId> = sched
            .descendants(root_id)
            .into_iter()
            .filter(|id| sched.runs.get(id).map(Run::is_leaf).unwrap_or(false))
            .collect();
        for leaf in leaves {
            self.evaluate(&mut sched, leaf, None)?;
        }

        Ok(root_id)
    }

    /// Snapshot of a run and everything below it.
    pub fn run_status(&self, run_id: RunId) -> Result<RunSummary, EngineError> {
        let sched = self.lock_scheduler();
        self.summarize(&sched, run_id)
    }

    pub fn status(&self, run_id: RunId) -> Result<RunStatus, EngineError> {
        Ok(self.lock_scheduler().run(run_id)?.status)
    }

    /// Kills the whole run tree containing `run_id`. Cancelling a run that
    /// already ended does nothing.
    pub fn cancel_run(&self, run_id: RunId) -> Result<(), EngineError> {
        let mut sched = self.lock_scheduler();
        sched.run(run_id)?;

        let root = sched.root_of(run_id);
        if sched.run(root)?.status.is_terminal() {
            debug!("Run {} already ended; nothing to cancel", root);
            return Ok(());
        }

        info!("Cancelling run {}", root);
        self.kill_tree(&mut sched, root, "Killed by request")
    }

    /// Applies a status report for an attempt. Reports for attempts that are
    /// no longer active, or already ended, are ignored.
    pub fn report_attempt_status(
        &self,
        attempt_id: AttemptId,
        update: AttemptUpdate,
    ) -> Result<(), EngineError> {
        let mut sched = self.lock_scheduler();
        self.apply_update(&mut sched, attempt_id, update)
    }

    /// Records a heartbeat sent by a worker. Returns `false` when the
    /// heartbeat was ignored.
    pub fn report_heartbeat(&self, attempt_id: AttemptId) -> Result<bool, EngineError> {
        Ok(self.monitor.record_heartbeat(attempt_id)?)
    }

    /// Applies every backend report received so far and returns how many
    /// there were. Retries whose delay has passed are launched first.
    pub fn process_pending_events(&self) -> usize {
        self.relaunch_due();
        let mut handled = 0;
        loop {
            let next = self
                .receiver
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .try_recv();
            match next {
                Ok(report) => {
                    self.handle_report(report);
                    handled += 1;
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => return handled,
            }
        }
    }

    /// Processes backend reports until the run ends. Every
    /// `system_check_interval` it also fails stalled attempts and retries
    /// cleanups that were missed.
    pub fn wait_for_run(
        &self,
        run_id: RunId,
        timeout: Option<Duration>,
    ) -> Result<RunStatus, EngineError> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let check_interval = self.settings.system_check_interval();
        let mut last_check = Instant::now();

        loop {
            let status = self.status(run_id)?;
            if status.is_terminal() {
                return Ok(status);
            }
            if deadline.map(|d| Instant::now() >= d).unwrap_or(false) {
                return Err(EngineError::WaitTimeout(run_id));
            }

            let wait = WAIT_SLICE.min(check_interval.saturating_sub(last_check.elapsed()));
            let next = self
                .receiver
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .recv_timeout(wait.max(Duration::from_millis(1)));
            match next {
                Ok(report) => self.handle_report(report),
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {}
            }
            self.relaunch_due();

            if last_check.elapsed() >= check_interval {
                self.check_for_stalled()?;
                self.check_for_missed_cleanup();
                last_check = Instant::now();
            }
        }
    }

    /// Fails attempts that stopped sending heartbeats (a system failure) or
    /// ran past their time limit (a timeout failure). Returns how many were
    /// failed.
    pub fn check_for_stalled(&self) -> Result<usize, EngineError> {
        let stalled = self.monitor.find_stalled(
            Utc::now(),
            self.settings.heartbeat_timeout(),
            self.settings.task_timeout(),
        );
        if stalled.is_empty() {
            return Ok(0);
        }

        let mut sched = self.lock_scheduler();
        let mut failed = 0;
        for stall in stalled {
            let attempt = self.attempts.get(stall.attempt_id)?.value;
            if !attempt.active || attempt.status.is_terminal() {
                continue;
            }

            warn!(
                "Attempt {} of step '{}' stalled: {}",
                attempt.id, attempt.step_name, stall.reason
            );
            self.fail_attempt(
                &mut sched,
                stall.attempt_id,
                stall.kind,
                stall.reason,
                Teardown::KillAndCleanup,
            )?;
            failed += 1;
        }
        Ok(failed)
    }

    /// Cleans up ended attempts whose cleanup never succeeded. Failed
    /// attempts are left alone when `preserve_on_failure` is set, and nothing
    /// is cleaned when `preserve_all` is set. Returns how many were cleaned.
    pub fn check_for_missed_cleanup(&self) -> usize {
        if self.settings.preserve_all {
            return 0;
        }

        let missed: Vec<TaskAttempt> = self
            .attempts
            .list()
            .into_iter()
            .filter(|a| a.status.is_terminal() && !a.cleaned_up && !self.preserves(a))
            .collect();
        if !missed.is_empty() {
            info!("Retrying cleanup of {} attempt(s)", missed.len());
        }

        missed
            .iter()
            .filter(|attempt| self.cleanup_attempt(attempt))
            .count()
    }

    /// Every attempt ever created for `task_id`, oldest first.
    pub fn attempts_for(&self, task_id: &TaskId) -> Vec<TaskAttempt> {
        self.attempts.for_task(task_id)
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn lock_scheduler(&self) -> MutexGuard<'_, Scheduler> {
        self.scheduler.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn read_data(&self) -> RwLockReadGuard<'_, DataStore> {
        self.data.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_data(&self) -> RwLockWriteGuard<'_, DataStore> {
        self.data.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn reporter(&self) -> StatusReporter {
        StatusReporter::new(self.sender.clone())
    }

    fn handle_report(&self, report: AttemptReport) {
        let attempt_id = report.attempt_id;
        if let Err(e) = self.report_attempt_status(attempt_id, report.update) {
            error!("Failed to apply report for attempt {}: {}", attempt_id, e);
        }
    }

    fn apply_update(
        &self,
        sched: &mut Scheduler,
        attempt_id: AttemptId,
        update: AttemptUpdate,
    ) -> Result<(), EngineError> {
        let attempt = self.attempts.get(attempt_id)?.value;
        if !attempt.active || attempt.status.is_terminal() {
            debug!(
                "Ignoring {} report for attempt {} (status {}, active {})",
                update.status(),
                attempt_id,
                attempt.status,
                attempt.active
            );
            return Ok(());
        }

        match update {
            AttemptUpdate::Running => {
                if attempt.status != AttemptStatus::Running {
                    self.attempts.update(attempt_id, |a| {
                        if a.status == AttemptStatus::NotStarted {
                            a.transition(AttemptStatus::Launching)?;
                        }
                        a.transition(AttemptStatus::Running)
                    })?;
                    debug!("Attempt {} of step '{}' is running", attempt_id, attempt.step_name);
                }
                Ok(())
            }
            AttemptUpdate::Finished { outputs } => self.finish_attempt(sched, attempt, outputs),
            AttemptUpdate::Failed { error } => {
                warn!("Attempt {} of step '{}' failed: {}", attempt_id, attempt.step_name, error);
                self.fail_attempt(sched, attempt_id, FailureKind::Analysis, error, Teardown::Cleanup)
            }
            AttemptUpdate::LaunchFailed { error } => {
                warn!("Failed to launch step '{}': {}", attempt.step_name, error);
                self.fail_attempt(
                    sched,
                    attempt_id,
                    FailureKind::System,
                    format!("Failed to launch: {}", error),
                    Teardown::Nothing,
                )
            }
        }
    }

    /// Creates tasks for the input sets of a leaf run that are ready, and
    /// launches the new ones. `trigger` restricts the search to data that
    /// just arrived on one input.
    fn evaluate(
        &self,
        sched: &mut Scheduler,
        run_id: RunId,
        trigger: Option<(&str, &DataPath)>,
    ) -> Result<(), EngineError> {
        let run = sched.run(run_id)?;
        if run.status.is_terminal() {
            return Ok(());
        }
        let Some(step) = run.step.clone() else {
            return Ok(());
        };
        let inputs = run.inputs.clone();

        let sets = {
            let data = self.read_data();
            let manager = InputManager::new(&inputs);
            match trigger {
                Some((channel, path)) => manager.get_ready_input_sets(&data, channel, path),
                None => manager.all_ready_input_sets(&data),
            }
        };
        let sets = match sets {
            Ok(sets) => sets,
            Err(e) => {
                error!("Input matching failed for step '{}': {}", step.name, e);
                return self.fail_run(sched, run_id, format!("Input matching failed: {}", e));
            }
        };

        let mut created = Vec::new();
        for set in sets {
            let task_id = TaskId::fingerprint(&run_id, &set.data_path);
            match self.tasks.create_or_fetch(&task_id, || Task::new(run_id, &step, set)) {
                Ok((task, true)) => {
                    debug!(
                        "Created task {} for step '{}' at {}",
                        task.id.short(),
                        step.name,
                        task.data_path
                    );
                    created.push(task.id);
                }
                Ok((_, false)) => {}
                Err(e) => {
                    error!("Failed to prepare task for step '{}': {}", step.name, e);
                    return self.fail_run(sched, run_id, format!("Failed to prepare task: {}", e));
                }
            }
        }

        sched.run_mut(run_id)?.tasks.extend(created.iter().cloned());
        for task_id in &created {
            self.launch_task(sched, task_id)?;
        }

        self.check_leaf_complete(sched, run_id)
    }

    /// Creates a fresh attempt for the task and hands it to the backend.
    fn launch_task(&self, sched: &mut Scheduler, task_id: &TaskId) -> Result<(), EngineError> {
        let task = self
            .tasks
            .get(task_id)
            .ok_or_else(|| StoreError::TaskNotFound(task_id.clone()))?;
        if task.status.is_terminal() || sched.run(task.run_id)?.status.is_terminal() {
            return Ok(());
        }

        let attempt = self
            .tasks
            .update(task_id, |task| task.create_and_activate_attempt(&self.attempts))??;
        let attempt = self
            .attempts
            .update(attempt.id, |a| a.transition(AttemptStatus::Launching))?;
        self.mark_running(sched, task.run_id);

        debug!(
            "Launching attempt {} of step '{}' at {}",
            attempt.attempt_number, attempt.step_name, task.data_path
        );

        // Backends hand slow submissions to their own threads, so this does
        // not hold up the scheduler lock.
        match self.backend.run(&attempt, self.reporter()) {
            Ok(()) => {
                if self.backend.in_process() {
                    self.monitor.supervise(attempt.id);
                }
                Ok(())
            }
            Err(e) => {
                warn!("Failed to launch step '{}': {}", attempt.step_name, e);
                self.fail_attempt(
                    sched,
                    attempt.id,
                    FailureKind::System,
                    format!("Failed to launch: {}", e),
                    Teardown::Nothing,
                )
            }
        }
    }

    /// Records an attempt failure and either retries the task or fails it.
    fn fail_attempt(
        &self,
        sched: &mut Scheduler,
        attempt_id: AttemptId,
        kind: FailureKind,
        error: String,
        teardown: Teardown,
    ) -> Result<(), EngineError> {
        let attempt = self.attempts.update(attempt_id, |a| a.fail(error.clone()))?;
        self.monitor.stop(attempt_id);

        match teardown {
            Teardown::Nothing => self.mark_cleaned_up(attempt_id),
            Teardown::Cleanup => {
                self.cleanup_attempt(&attempt);
            }
            Teardown::KillAndCleanup => {
                self.kill_attempt_process(&attempt);
                self.cleanup_attempt(&attempt);
            }
        }

        let task_id = attempt.task_id.clone();
        let (retry, failures) = self.tasks.update(&task_id, |task| {
            let retry = task.record_failure(kind, &self.settings.retries);
            (retry, task.failures.get(kind))
        })?;
        if retry {
            let delay = match kind {
                FailureKind::System => self.settings.system_retry_delay(failures),
                FailureKind::Analysis | FailureKind::Timeout => Duration::ZERO,
            };
            if delay.is_zero() {
                info!(
                    "Retrying step '{}' after {} failure of attempt {}",
                    attempt.step_name, kind, attempt.attempt_number
                );
                return self.launch_task(sched, &task_id);
            }

            info!(
                "Retrying step '{}' in {:.1}s after {} failure of attempt {}",
                attempt.step_name,
                delay.as_secs_f64(),
                kind,
                attempt.attempt_number
            );
            sched.delayed.push((Instant::now() + delay, task_id));
            return Ok(());
        }

        let task = self.tasks.update(&task_id, |task| {
            task.terminate(TaskStatus::Failed);
            task.clone()
        })?;
        error!(
            "Step '{}' failed at {} after {} {} failure(s): {}",
            task.step_name,
            task.data_path,
            task.failures.get(kind),
            kind,
            error
        );
        self.fail_run(
            sched,
            task.run_id,
            format!("Task at {} failed: {}", task.data_path, error),
        )
    }

    /// Stores the outputs of a finished attempt and triggers the steps that
    /// read them.
    fn finish_attempt(
        &self,
        sched: &mut Scheduler,
        attempt: TaskAttempt,
        outputs: Vec<AttemptOutput>,
    ) -> Result<(), EngineError> {
        let task = self
            .tasks
            .get(&attempt.task_id)
            .ok_or_else(|| StoreError::TaskNotFound(attempt.task_id.clone()))?;
        let run = sched.run(task.run_id)?;
        let run_outputs = run.outputs.clone();
        let step_name = run.name.clone();

        let mut writes = Vec::with_capacity(run_outputs.len());
        for output in &run_outputs {
            let reported = outputs.iter().find(|o| o.channel == output.channel);
            match check_output(&step_name, output, reported) {
                Ok(contents) => writes.push((output.root, contents)),
                Err(e) => {
                    warn!("Attempt {} of step '{}': {}", attempt.id, step_name, e);
                    return self.fail_attempt(
                        sched,
                        attempt.id,
                        FailureKind::Analysis,
                        e.to_string(),
                        Teardown::Cleanup,
                    );
                }
            }
        }

        self.attempts
            .update(attempt.id, |a| a.transition(AttemptStatus::Finished))?;
        self.monitor.stop(attempt.id);

        let written: Result<(), DataNodeError> = {
            let mut data = self.write_data();
            writes
                .iter()
                .try_for_each(|(root, contents)| write_output(&mut data, *root, &task.data_path, contents))
        };
        if let Err(e) = written {
            error!("Failed to store outputs of step '{}': {}", step_name, e);
            return self.fail_run(sched, task.run_id, format!("Failed to store outputs: {}", e));
        }

        let task = self.tasks.update(&task.id, |task| {
            task.finish();
            task.clone()
        })?;
        info!("Step '{}' finished task at {}", step_name, task.data_path);

        for attempt in self.attempts.for_task(&task.id) {
            self.cleanup_attempt(&attempt);
        }

        let roots: Vec<NodeId> = run_outputs.iter().map(|o| o.root).collect();
        self.trigger(sched, &roots, &task.data_path)?;
        self.check_leaf_complete(sched, task.run_id)
    }

    /// Re-evaluates every leaf run reading one of `roots`.
    fn trigger(
        &self,
        sched: &mut Scheduler,
        roots: &[NodeId],
        data_path: &DataPath,
    ) -> Result<(), EngineError> {
        for root in roots {
            let subscribers = sched.subscribers.get(root).cloned().unwrap_or_default();
            for (consumer, channel) in subscribers {
                self.evaluate(sched, consumer, Some((channel.as_str(), data_path)))?;
            }
        }
        Ok(())
    }

    /// Finishes a leaf run once all of its inputs have arrived and every
    /// input set has a finished task.
    ///
    /// Zero-length input arrays produce no tasks, so the matching zero-length
    /// arrays are written to the run's outputs here.
    fn check_leaf_complete(&self, sched: &mut Scheduler, run_id: RunId) -> Result<(), EngineError> {
        let run = sched.run(run_id)?;
        if run.status.is_terminal() || !run.is_leaf() {
            return Ok(());
        }
        let inputs = run.inputs.clone();
        let outputs = run.outputs.clone();

        let (sets, mut empty_paths) = {
            let data = self.read_data();
            if !inputs.iter().all(|c| c.is_ready(&data, &DataPath::root())) {
                return Ok(());
            }
            let Ok(sets) = InputManager::new(&inputs).all_ready_input_sets(&data) else {
                return Ok(());
            };
            (sets, empty_input_paths(&data, &inputs))
        };

        for set in &sets {
            let task_id = TaskId::fingerprint(&run_id, &set.data_path);
            match self.tasks.get(&task_id) {
                Some(task) if task.status == TaskStatus::Finished => {}
                _ => return Ok(()),
            }
        }

        if sets.is_empty() && empty_paths.is_empty() {
            empty_paths.push(DataPath::root());
        }

        if !empty_paths.is_empty() && !outputs.is_empty() {
            {
                let mut data = self.write_data();
                for output in &outputs {
                    for path in &empty_paths {
                        if let Err(e) = data.ensure_branch(output.root, path, 0) {
                            warn!(
                                "Could not mark output '{}' empty at {}: {}",
                                output.channel, path, e
                            );
                        }
                    }
                }
            }

            let roots: Vec<NodeId> = outputs.iter().map(|o| o.root).collect();
            for path in &empty_paths {
                self.trigger(sched, &roots, path)?;
            }
        }

        self.finish_run(sched, run_id)
    }

    fn finish_run(&self, sched: &mut Scheduler, run_id: RunId) -> Result<(), EngineError> {
        let run = sched.run_mut(run_id)?;
        if !run.terminate(RunStatus::Finished, "Run finished", false) {
            return Ok(());
        }
        info!("Step '{}' finished", run.name);

        let Some(parent) = run.parent else {
            return Ok(());
        };
        let all_finished = sched.run(parent)?.children.iter().all(|child| {
            sched
                .runs
                .get(child)
                .map(|r| r.status == RunStatus::Finished)
                .unwrap_or(false)
        });
        if all_finished {
            self.finish_run(sched, parent)?;
        }
        Ok(())
    }

    /// Fails `run_id` and its ancestors, then kills whatever is still
    /// running in the tree.
    fn fail_run(&self, sched: &mut Scheduler, run_id: RunId, reason: String) -> Result<(), EngineError> {
        let mut current = run_id;
        let mut message = reason;

        loop {
            let run = sched.run_mut(current)?;
            if !run.terminate(RunStatus::Failed, message.clone(), true) {
                break;
            }
            error!("Step '{}' failed: {}", run.name, message);

            match run.parent {
                Some(parent) => {
                    message = format!("Step '{}' failed", run.name);
                    current = parent;
                }
                None => break,
            }
        }

        let root = sched.root_of(run_id);
        self.kill_tree(sched, root, "Killed after a failure elsewhere in the run")
    }

    /// Kills every unfinished run and task at or below `root`.
    fn kill_tree(&self, sched: &mut Scheduler, root: RunId, reason: &str) -> Result<(), EngineError> {
        for id in sched.descendants(root) {
            let run = sched.run_mut(id)?;
            if run.terminate(RunStatus::Killed, reason, false) {
                debug!("Killed step '{}'", run.name);
            }
            for task_id in run.tasks.clone() {
                self.kill_task(&task_id)?;
            }
        }
        Ok(())
    }

    fn kill_task(&self, task_id: &TaskId) -> Result<(), EngineError> {
        let active = self.tasks.update(task_id, |task| {
            if task.status.is_terminal() {
                return None;
            }
            task.terminate(TaskStatus::Killed);
            Some(task.active_attempt)
        })?;

        let Some(Some(attempt_id)) = active else {
            return Ok(());
        };
        if self.attempts.get(attempt_id)?.value.status.is_terminal() {
            return Ok(());
        }

        let attempt = self.attempts.update(attempt_id, |a| {
            if a.status.is_terminal() {
                Ok(())
            } else {
                a.transition(AttemptStatus::Killed)
            }
        })?;
        self.monitor.stop(attempt_id);
        self.kill_attempt_process(&attempt);
        self.cleanup_attempt(&attempt);
        Ok(())
    }

    fn kill_attempt_process(&self, attempt: &TaskAttempt) {
        if let Err(e) = self.backend.kill(attempt) {
            warn!("Failed to kill attempt {}: {}", attempt.id, e);
        }
    }

    fn preserves(&self, attempt: &TaskAttempt) -> bool {
        self.settings.preserve_all
            || (self.settings.preserve_on_failure && attempt.status == AttemptStatus::Failed)
    }

    /// Releases the attempt's backend resources. Returns whether the attempt
    /// is now cleaned up; a failed cleanup is retried by
    /// [`Engine::check_for_missed_cleanup`].
    fn cleanup_attempt(&self, attempt: &TaskAttempt) -> bool {
        if attempt.cleaned_up {
            return true;
        }
        if self.preserves(attempt) {
            debug!("Preserving files of attempt {}", attempt.id);
            return false;
        }

        match self.backend.cleanup(attempt) {
            Ok(()) => {
                self.mark_cleaned_up(attempt.id);
                true
            }
            Err(e) => {
                warn!("Failed to clean up attempt {}: {}", attempt.id, e);
                if let Err(e) = self.attempts.update(attempt.id, |a| {
                    a.add_event(format!("Cleanup failed: {}", e), true);
                    Ok(())
                }) {
                    debug!("Could not record cleanup error of {}: {}", attempt.id, e);
                }
                false
            }
        }
    }

    fn mark_cleaned_up(&self, attempt_id: AttemptId) {
        if let Err(e) = self.attempts.update(attempt_id, |a| {
            a.cleaned_up = true;
            Ok(())
        }) {
            warn!("Failed to record cleanup of attempt {}: {}", attempt_id, e);
        }
    }

    /// Launches the tasks whose retry delay has passed.
    fn relaunch_due(&self) {
        let mut sched = self.lock_scheduler();
        if sched.delayed.is_empty() {
            return;
        }

        let now = Instant::now();
        let (due, waiting): (Vec<_>, Vec<_>) =
            sched.delayed.drain(..).partition(|(at, _)| *at <= now);
        sched.delayed = waiting;

        for (_, task_id) in due {
            if let Err(e) = self.launch_task(&mut sched, &task_id) {
                error!("Failed to relaunch task {}: {}", task_id.short(), e);
            }
        }
    }

    fn mark_running(&self, sched: &mut Scheduler, run_id: RunId) {
        let mut current = Some(run_id);
        while let Some(id) = current {
            let Some(run) = sched.runs.get_mut(&id) else { break };
            if run.status != RunStatus::Waiting {
                break;
            }
            run.status = RunStatus::Running;
            current = run.parent;
        }
    }

    fn summarize(&self, sched: &Scheduler, run_id: RunId) -> Result<RunSummary, EngineError> {
        let run = sched.run(run_id)?;

        let outputs = {
            let data = self.read_data();
            run.outputs
                .iter()
                .map(|output| OutputSummary {
                    channel: output.channel.clone(),
                    contents: data.ready_contents(output.root),
                })
                .collect()
        };

        let mut tasks: Vec<TaskSummary> = run
            .tasks
            .iter()
            .filter_map(|id| self.tasks.get(id))
            .map(|task| TaskSummary {
                attempts: self
                    .attempts
                    .for_task(&task.id)
                    .into_iter()
                    .map(|a| AttemptSummary {
                        id: a.id,
                        number: a.attempt_number,
                        status: a.status,
                        active: a.active,
                        error: a.error,
                    })
                    .collect(),
                id: task.id,
                data_path: task.data_path,
                status: task.status,
                command: task.command,
                failures: task.failures,
            })
            .collect();
        tasks.sort_by(|a, b| a.data_path.cmp(&b.data_path));

        let steps = run
            .children
            .iter()
            .map(|child| self.summarize(sched, *child))
            .collect::<Result<_, _>>()?;

        Ok(RunSummary {
            id: run.id,
            name: run.name.clone(),
            status: run.status,
            created_at: run.created_at,
            finished_at: run.finished_at,
            events: run.events.clone(),
            outputs,
            tasks,
            steps,
        })
    }
}

/// Creates the run for `template` and, for branches, its whole subtree.
///
/// `bindings` maps each of the template's input and output names to the
/// data tree it reads or writes.
fn instantiate(
    sched: &mut Scheduler,
    template: &Template,
    parent: Option<RunId>,
    bindings: &BTreeMap<String, NodeId>,
    data: &mut DataStore,
) -> Result<RunId, EngineError> {
    let bound = |channel: &str| {
        bindings
            .get(channel)
            .copied()
            .ok_or_else(|| EngineError::UnconnectedChannel {
                step: template.name.clone(),
                channel: channel.to_string(),
            })
    };

    let mut run = Run::new(&template.name, parent, StepSpec::from_template(template));
    for input in &template.inputs {
        run.inputs.push(
            Channel::new(&input.channel, input.data_type, bound(&input.channel)?)
                .with_group(input.group)
                .with_mode(input.mode),
        );
    }
    for output in &template.outputs {
        run.outputs.push(RunOutput {
            channel: output.channel.clone(),
            data_type: output.data_type,
            mode: output.mode,
            root: bound(&output.channel)?,
        });
    }
    let id = run.id;

    if run.is_leaf() {
        for channel in &run.inputs {
            sched
                .subscribers
                .entry(channel.root)
                .or_default()
                .push((id, channel.name.clone()));
        }
    } else {
        let mut scope: BTreeMap<String, NodeId> = run
            .inputs
            .iter()
            .map(|c| (c.name.clone(), c.root))
            .collect();

        for output in template.steps.iter().flat_map(|s| &s.outputs) {
            let root = match run.outputs.iter().find(|o| o.channel == output.channel) {
                Some(own) => own.root,
                None => {
                    let root = data.create_root(output.data_type);
                    run.connectors.insert(output.channel.clone(), root);
                    root
                }
            };
            scope.insert(output.channel.clone(), root);
        }

        for child in &template.steps {
            let child_id = instantiate(sched, child, Some(id), &scope, data)?;
            run.children.push(child_id);
        }
    }

    sched.runs.insert(id, run);
    Ok(id)
}

/// Checks that a reported output has the shape its port declares.
fn check_output(
    step: &str,
    output: &RunOutput,
    reported: Option<&AttemptOutput>,
) -> Result<DataContents, EngineError> {
    let expected = match output.mode {
        OutputMode::NoScatter => "a single value",
        OutputMode::Scatter => "an array",
    };
    let shape_error = |found| EngineError::OutputShape {
        step: step.to_string(),
        channel: output.channel.clone(),
        expected,
        found,
    };

    let Some(reported) = reported else {
        return Err(shape_error("nothing"));
    };
    match (&reported.contents, output.mode) {
        (DataContents::Scalar(_), OutputMode::NoScatter)
        | (DataContents::Array(_), OutputMode::Scatter) => Ok(reported.contents.clone()),
        (DataContents::Scalar(_), OutputMode::Scatter) => Err(shape_error("a single value")),
        (DataContents::Array(_), OutputMode::NoScatter) => Err(shape_error("an array")),
    }
}

/// Writes one task output at `path`; arrays become a branch of their length.
fn write_output(
    data: &mut DataStore,
    root: NodeId,
    path: &DataPath,
    contents: &DataContents,
) -> Result<(), DataNodeError> {
    match contents {
        DataContents::Scalar(value) => {
            data.add_data_object(root, path, value.clone())?;
        }
        DataContents::Array(values) if values.is_empty() => {
            data.ensure_branch(root, path, 0)?;
        }
        DataContents::Array(values) => {
            for (index, value) in values.iter().enumerate() {
                data.add_data_object(root, &path.child(index, values.len()), value.clone())?;
            }
        }
    }
    Ok(())
}

/// Zero-length arrays in the scattered inputs of a single-group step.
///
/// These positions get no task; the step's outputs mirror them as empty
/// arrays so that downstream gathers see a complete tree. Cross products
/// are left alone.
fn empty_input_paths(data: &DataStore, inputs: &[Channel]) -> Vec<DataPath> {
    let groups: BTreeSet<u32> = inputs.iter().map(|c| c.group).collect();
    if groups.len() != 1 {
        return Vec::new();
    }

    let paths: BTreeSet<DataPath> = inputs
        .iter()
        .filter(|c| !c.mode.is_gathered())
        .flat_map(|c| data.empty_branches(c.root))
        .collect();
    paths.into_iter().collect()
}
