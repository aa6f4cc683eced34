//! Task and Attempt Stores
//!
//! In-memory persistence for tasks and attempts. Attempts are versioned:
//! every write goes through [`AttemptStore::compare_and_swap`], so a writer
//! working from a stale copy is told to re-read instead of silently
//! clobbering a concurrent update.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use log::debug;
use thiserror::Error;

use super::attempt::{AttemptId, AttemptStatus, TaskAttempt};
use super::task::{Task, TaskId};

/// Conflicts tolerated by [`AttemptStore::update`] before giving up.
pub const DEFAULT_CONFLICT_RETRIES: u32 = 5;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Task attempt {0} not found")]
    AttemptNotFound(AttemptId),

    #[error("Task {0} not found")]
    TaskNotFound(TaskId),

    #[error("Task attempt {0} was modified concurrently")]
    ConcurrentModification(AttemptId),

    #[error("Task attempt {id} cannot move from {from} to {to}")]
    IllegalTransition {
        id: AttemptId,
        from: AttemptStatus,
        to: AttemptStatus,
    },

    #[error("Gave up updating task attempt {id} after {retries} concurrent modifications")]
    RetriesExhausted { id: AttemptId, retries: u32 },
}

/// A stored value together with its write counter.
#[derive(Debug, Clone, PartialEq)]
pub struct Versioned<T> {
    pub version: u64,
    pub value: T,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug)]
pub struct AttemptStore {
    entries: Mutex<HashMap<AttemptId, Versioned<TaskAttempt>>>,
    conflict_retries: u32,
}

impl Default for AttemptStore {
    fn default() -> Self {
        Self::new()
    }
}

impl AttemptStore {
    pub fn new() -> Self {
        Self::with_retries(DEFAULT_CONFLICT_RETRIES)
    }

    pub fn with_retries(conflict_retries: u32) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            conflict_retries,
        }
    }

    pub fn insert(&self, attempt: TaskAttempt) {
        lock(&self.entries).insert(
            attempt.id,
            Versioned {
                version: 0,
                value: attempt,
            },
        );
    }

    pub fn get(&self, id: AttemptId) -> Result<Versioned<TaskAttempt>, StoreError> {
        lock(&self.entries)
            .get(&id)
            .cloned()
            .ok_or(StoreError::AttemptNotFound(id))
    }

    /// Writes `attempt` only if the stored version is still `expected`.
    /// Returns the new version.
    pub fn compare_and_swap(
        &self,
        id: AttemptId,
        expected: u64,
        attempt: TaskAttempt,
    ) -> Result<u64, StoreError> {
        let mut entries = lock(&self.entries);
        let entry = entries.get_mut(&id).ok_or(StoreError::AttemptNotFound(id))?;

        if entry.version != expected {
            return Err(StoreError::ConcurrentModification(id));
        }

        entry.version += 1;
        entry.value = attempt;
        Ok(entry.version)
    }

    /// Read-modify-write with bounded retries on conflict.
    ///
    /// `modify` runs against a fresh copy on every try and may be called
    /// more than once. Errors it returns abort the update unchanged.
    pub fn update<F>(&self, id: AttemptId, mut modify: F) -> Result<TaskAttempt, StoreError>
    where
        F: FnMut(&mut TaskAttempt) -> Result<(), StoreError>,
    {
        for _ in 0..=self.conflict_retries {
            let current = self.get(id)?;
            let mut attempt = current.value;
            modify(&mut attempt)?;

            match self.compare_and_swap(id, current.version, attempt.clone()) {
                Ok(_) => return Ok(attempt),
                Err(StoreError::ConcurrentModification(_)) => {
                    debug!("Conflict updating attempt {}, retrying", id);
                }
                Err(e) => return Err(e),
            }
        }

        Err(StoreError::RetriesExhausted {
            id,
            retries: self.conflict_retries,
        })
    }

    pub fn list(&self) -> Vec<TaskAttempt> {
        lock(&self.entries)
            .values()
            .map(|entry| entry.value.clone())
            .collect()
    }

    pub fn for_task(&self, task_id: &TaskId) -> Vec<TaskAttempt> {
        let mut attempts: Vec<_> = lock(&self.entries)
            .values()
            .filter(|entry| &entry.value.task_id == task_id)
            .map(|entry| entry.value.clone())
            .collect();
        attempts.sort_by_key(|a| a.attempt_number);
        attempts
    }
}

#[derive(Debug, Default)]
pub struct TaskStore {
    tasks: Mutex<HashMap<TaskId, Task>>,
}

impl TaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the task stored under `id`, creating it with `make` first if
    /// it does not exist. The flag is `true` when the task was created.
    pub fn create_or_fetch<F, E>(&self, id: &TaskId, make: F) -> Result<(Task, bool), E>
    where
        F: FnOnce() -> Result<Task, E>,
    {
        let mut tasks = lock(&self.tasks);
        if let Some(task) = tasks.get(id) {
            return Ok((task.clone(), false));
        }

        let task = make()?;
        tasks.insert(id.clone(), task.clone());
        Ok((task, true))
    }

    pub fn get(&self, id: &TaskId) -> Option<Task> {
        lock(&self.tasks).get(id).cloned()
    }

    pub fn contains(&self, id: &TaskId) -> bool {
        lock(&self.tasks).contains_key(id)
    }

    /// Runs `f` on the stored task under the store lock.
    pub fn update<R>(&self, id: &TaskId, f: impl FnOnce(&mut Task) -> R) -> Result<R, StoreError> {
        let mut tasks = lock(&self.tasks);
        let task = tasks
            .get_mut(id)
            .ok_or_else(|| StoreError::TaskNotFound(id.clone()))?;
        Ok(f(task))
    }

    pub fn list(&self) -> Vec<Task> {
        lock(&self.tasks).values().cloned().collect()
    }
}
