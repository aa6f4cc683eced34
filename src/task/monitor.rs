//! Task Attempt Monitor
//!
//! Keeps attempt heartbeats fresh and finds attempts that went quiet.
//!
//! Heartbeats are written with a versioned compare-and-swap. When another
//! writer (a status report, a kill) updates the attempt at the same moment,
//! the heartbeat re-reads and tries again a bounded number of times, then
//! gives up with a warning. A missed heartbeat is harmless; the next
//! interval writes a new one.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use log::{debug, warn};

use super::attempt::{AttemptId, AttemptStatus};
use super::store::{AttemptStore, StoreError};
use super::task::FailureKind;
use crate::config::Settings;

/// Upper bound on how long a supervisor sleeps between checks.
const MAX_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// An attempt that should be failed by the engine.
#[derive(Debug, Clone, PartialEq)]
pub struct StalledAttempt {
    pub attempt_id: AttemptId,
    pub kind: FailureKind,
    pub reason: String,
}

#[derive(Debug, Clone)]
struct HeartbeatWriter {
    attempts: Arc<AttemptStore>,
    write_retries: u32,
}

impl HeartbeatWriter {
    fn record(&self, id: AttemptId) -> Result<bool, StoreError> {
        for _ in 0..=self.write_retries {
            let current = self.attempts.get(id)?;
            if !is_live(current.value.active, current.value.status) {
                debug!("Ignoring heartbeat for inactive attempt {}", id);
                return Ok(false);
            }

            let mut attempt = current.value;
            attempt.last_heartbeat_at = Some(Utc::now());

            match self.attempts.compare_and_swap(id, current.version, attempt) {
                Ok(_) => return Ok(true),
                Err(StoreError::ConcurrentModification(_)) => {
                    debug!("Heartbeat for attempt {} conflicted with another write", id);
                }
                Err(e) => return Err(e),
            }
        }

        warn!(
            "Skipping heartbeat for attempt {} after {} conflicting writes",
            id,
            self.write_retries + 1
        );
        Ok(false)
    }

    fn is_live(&self, id: AttemptId) -> bool {
        self.attempts
            .get(id)
            .map(|entry| is_live(entry.value.active, entry.value.status))
            .unwrap_or(false)
    }
}

fn is_live(active: bool, status: AttemptStatus) -> bool {
    active && matches!(status, AttemptStatus::Launching | AttemptStatus::Running)
}

type Supervisors = Arc<Mutex<HashMap<AttemptId, Arc<AtomicBool>>>>;

pub struct TaskAttemptMonitor {
    writer: HeartbeatWriter,
    interval: Duration,
    poll_interval: Duration,
    supervisors: Supervisors,
}

impl TaskAttemptMonitor {
    pub fn new(attempts: Arc<AttemptStore>, settings: &Settings) -> Self {
        Self::with_interval(
            attempts,
            settings.heartbeat_interval(),
            settings.heartbeat_write_retries,
        )
    }

    pub fn with_interval(attempts: Arc<AttemptStore>, interval: Duration, write_retries: u32) -> Self {
        let poll_interval = (interval / 4)
            .min(MAX_POLL_INTERVAL)
            .max(Duration::from_millis(1));

        Self {
            writer: HeartbeatWriter {
                attempts,
                write_retries,
            },
            interval,
            poll_interval,
            supervisors: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Stamps a heartbeat on the attempt.
    ///
    /// Returns `Ok(false)` when the attempt is no longer active or running,
    /// or when the write kept conflicting; both are not errors.
    pub fn record_heartbeat(&self, id: AttemptId) -> Result<bool, StoreError> {
        self.writer.record(id)
    }

    /// Starts a background thread that beats for `id` every interval until
    /// the attempt stops running or [`stop`](Self::stop) is called.
    pub fn supervise(&self, id: AttemptId) {
        let running = Arc::new(AtomicBool::new(true));
        let previous = self
            .supervisors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, Arc::clone(&running));
        if let Some(previous) = previous {
            previous.store(false, Ordering::Relaxed);
        }

        let writer = self.writer.clone();
        let supervisors = Arc::clone(&self.supervisors);
        let interval = self.interval;
        let poll = self.poll_interval;

        thread::spawn(move || {
            debug!("Heartbeat supervisor started for attempt {}", id);
            let mut last_beat = Instant::now();

            while running.load(Ordering::Relaxed) {
                thread::sleep(poll);
                if !running.load(Ordering::Relaxed) {
                    break;
                }
                if last_beat.elapsed() + poll < interval {
                    continue;
                }

                match writer.record(id) {
                    Ok(true) => last_beat = Instant::now(),
                    Ok(false) if writer.is_live(id) => last_beat = Instant::now(),
                    Ok(false) => break,
                    Err(e) => {
                        warn!("Heartbeat supervisor for attempt {} stopping: {}", id, e);
                        break;
                    }
                }
            }

            // A newer supervisor for the same attempt keeps its entry.
            let mut supervisors = supervisors.lock().unwrap_or_else(PoisonError::into_inner);
            if supervisors
                .get(&id)
                .map(|flag| Arc::ptr_eq(flag, &running))
                .unwrap_or(false)
            {
                supervisors.remove(&id);
            }
            debug!("Heartbeat supervisor stopped for attempt {}", id);
        });
    }

    /// Number of attempts with a supervisor thread.
    pub fn supervised_count(&self) -> usize {
        self.supervisors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn stop(&self, id: AttemptId) {
        if let Some(flag) = self
            .supervisors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
        {
            flag.store(false, Ordering::Relaxed);
        }
    }

    pub fn stop_all(&self) {
        let mut supervisors = self
            .supervisors
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        for (_, flag) in supervisors.drain() {
            flag.store(false, Ordering::Relaxed);
        }
    }

    /// Finds live attempts whose heartbeat is older than `heartbeat_timeout`
    /// (a system failure) or that have run longer than their time limit (a
    /// timeout failure). `default_task_timeout` applies to attempts without
    /// a limit of their own.
    pub fn find_stalled(
        &self,
        now: DateTime<Utc>,
        heartbeat_timeout: Duration,
        default_task_timeout: Duration,
    ) -> Vec<StalledAttempt> {
        let mut stalled = Vec::new();

        for attempt in self.writer.attempts.list() {
            if !is_live(attempt.active, attempt.status) {
                continue;
            }

            let quiet = (now - attempt.last_seen()).to_std().unwrap_or_default();
            if quiet > heartbeat_timeout {
                stalled.push(StalledAttempt {
                    attempt_id: attempt.id,
                    kind: FailureKind::System,
                    reason: format!(
                        "Task attempt stopped sending heartbeats ({:.0}s since last heartbeat)",
                        quiet.as_secs_f64()
                    ),
                });
                continue;
            }

            let limit = attempt
                .timeout_hours
                .filter(|hours| hours.is_finite() && *hours > 0.0)
                .map(|hours| Duration::from_secs_f64(hours * 3600.0))
                .unwrap_or(default_task_timeout);
            let started = attempt.started_at.unwrap_or(attempt.created_at);
            let elapsed = (now - started).to_std().unwrap_or_default();
            if elapsed > limit {
                stalled.push(StalledAttempt {
                    attempt_id: attempt.id,
                    kind: FailureKind::Timeout,
                    reason: format!(
                        "Task attempt exceeded its time limit of {:.1} hours",
                        limit.as_secs_f64() / 3600.0
                    ),
                });
            }
        }

        stalled
    }
}

impl Drop for TaskAttemptMonitor {
    fn drop(&mut self) {
        self.stop_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::DataPath;
    use crate::engine::RunId;
    use crate::scheduler::InputSet;
    use crate::task::{StepSpec, Task, TaskAttempt};
    use crate::template::Template;

    fn attempt() -> TaskAttempt {
        let step = StepSpec::from_template(&Template::leaf("sleepy", "sleep 1")).unwrap();
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

    fn running(store: &AttemptStore) -> AttemptId {
        let mut attempt = attempt();
        attempt.transition(AttemptStatus::Launching).unwrap();
        attempt.transition(AttemptStatus::Running).unwrap();
        let id = attempt.id;
        store.insert(attempt);
        id
    }

    #[test]
    fn test_record_heartbeat_updates_timestamp() {
        let store = Arc::new(AttemptStore::new());
        let id = running(&store);
        let before = store.get(id).unwrap().value.last_heartbeat_at;

        let monitor = TaskAttemptMonitor::with_interval(Arc::clone(&store), Duration::from_secs(60), 5);
        thread::sleep(Duration::from_millis(5));

        assert!(monitor.record_heartbeat(id).unwrap());
        let entry = store.get(id).unwrap();
        assert_eq!(entry.version, 1);
        assert!(entry.value.last_heartbeat_at > before);
    }

    #[test]
    fn test_heartbeat_ignored_for_inactive_attempt() {
        let store = Arc::new(AttemptStore::new());
        let mut attempt = attempt();
        attempt.active = false;
        let id = attempt.id;
        store.insert(attempt);

        let monitor = TaskAttemptMonitor::with_interval(Arc::clone(&store), Duration::from_secs(60), 5);

        assert!(!monitor.record_heartbeat(id).unwrap());
        assert_eq!(store.get(id).unwrap().version, 0);
    }

    #[test]
    fn test_heartbeat_unknown_attempt() {
        let store = Arc::new(AttemptStore::new());
        let monitor = TaskAttemptMonitor::with_interval(store, Duration::from_secs(60), 5);

        assert!(matches!(
            monitor.record_heartbeat(AttemptId::new()),
            Err(StoreError::AttemptNotFound(_))
        ));
    }

    #[test]
    fn test_supervisor_beats_and_stops() {
        let store = Arc::new(AttemptStore::new());
        let id = running(&store);
        let monitor =
            TaskAttemptMonitor::with_interval(Arc::clone(&store), Duration::from_millis(20), 5);

        monitor.supervise(id);
        thread::sleep(Duration::from_millis(150));
        monitor.stop(id);

        let beats = store.get(id).unwrap().version;
        assert!(beats >= 2, "expected several heartbeats, got {}", beats);

        thread::sleep(Duration::from_millis(60));
        let after_stop = store.get(id).unwrap().version;
        thread::sleep(Duration::from_millis(60));
        assert_eq!(store.get(id).unwrap().version, after_stop);
    }

    #[test]
    fn test_supervisor_forgets_attempt_that_ended() {
        let store = Arc::new(AttemptStore::new());
        let id = running(&store);
        let monitor =
            TaskAttemptMonitor::with_interval(Arc::clone(&store), Duration::from_millis(20), 5);

        monitor.supervise(id);
        assert_eq!(monitor.supervised_count(), 1);

        store
            .update(id, |a| a.transition(AttemptStatus::Finished))
            .unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while monitor.supervised_count() > 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(monitor.supervised_count(), 0);
    }

    #[test]
    fn test_replaced_supervisor_keeps_new_entry() {
        let store = Arc::new(AttemptStore::new());
        let id = running(&store);
        let monitor =
            TaskAttemptMonitor::with_interval(Arc::clone(&store), Duration::from_millis(20), 5);

        monitor.supervise(id);
        monitor.supervise(id);
        thread::sleep(Duration::from_millis(100));

        assert_eq!(monitor.supervised_count(), 1);
        monitor.stop(id);
        assert_eq!(monitor.supervised_count(), 0);
    }

    #[test]
    fn test_find_stalled_by_heartbeat() {
        let store = Arc::new(AttemptStore::new());
        let id = running(&store);
        let monitor = TaskAttemptMonitor::with_interval(Arc::clone(&store), Duration::from_secs(1), 5);

        let later = Utc::now() + chrono::Duration::seconds(10);
        let stalled = monitor.find_stalled(later, Duration::from_secs(3), Duration::from_secs(3600));

        assert_eq!(stalled.len(), 1);
        assert_eq!(stalled[0].attempt_id, id);
        assert_eq!(stalled[0].kind, FailureKind::System);

        assert!(monitor
            .find_stalled(Utc::now(), Duration::from_secs(3), Duration::from_secs(3600))
            .is_empty());
    }

    #[test]
    fn test_find_stalled_by_timeout() {
        let store = Arc::new(AttemptStore::new());
        let id = running(&store);
        let monitor = TaskAttemptMonitor::with_interval(Arc::clone(&store), Duration::from_secs(1), 5);

        let later = Utc::now() + chrono::Duration::seconds(10);
        let stalled = monitor.find_stalled(later, Duration::from_secs(60), Duration::from_secs(5));

        assert_eq!(stalled.len(), 1);
        assert_eq!(stalled[0].attempt_id, id);
        assert_eq!(stalled[0].kind, FailureKind::Timeout);
    }

    #[test]
    fn test_finished_attempts_are_not_stalled() {
        let store = Arc::new(AttemptStore::new());
        let id = running(&store);
        store
            .update(id, |a| a.transition(AttemptStatus::Finished))
            .unwrap();
        let monitor = TaskAttemptMonitor::with_interval(Arc::clone(&store), Duration::from_secs(1), 5);

        let later = Utc::now() + chrono::Duration::hours(48);
        assert!(monitor
            .find_stalled(later, Duration::from_secs(1), Duration::from_secs(1))
            .is_empty());
    }
}
