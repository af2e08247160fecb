//! One-shot completion signal for background tasks.
//!
//! A [`Completer`] is moved into the worker thread; any number of cloned
//! [`TaskHandle`]s can block on the result. Waiting parks on a condvar, it
//! never polls.

use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use crate::Error;

/// Terminal result of a task. The error is shared between all waiters.
pub type TaskResult<T> = std::result::Result<T, Arc<Error>>;

struct Shared<T> {
    name: String,
    outcome: Mutex<Option<TaskResult<T>>>,
    done: Condvar,
}

impl<T> Shared<T> {
    fn publish(&self, outcome: TaskResult<T>) {
        let mut slot = self.outcome.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_none() {
            *slot = Some(outcome);
            self.done.notify_all();
        }
    }
}

/// Write side of a task's completion signal.
///
/// Dropping a completer without calling [`complete`](Completer::complete)
/// (including by unwinding) completes the task with
/// [`Error::TaskAbandoned`].
pub struct Completer<T> {
    shared: Arc<Shared<T>>,
    completed: bool,
}

impl<T> Completer<T> {
    pub fn complete(mut self, outcome: crate::Result<T>) {
        self.completed = true;
        self.shared.publish(outcome.map_err(Arc::new));
    }
}

impl<T> Drop for Completer<T> {
    fn drop(&mut self) {
        if !self.completed {
            let name = self.shared.name.clone();
            self.shared
                .publish(Err(Arc::new(Error::TaskAbandoned(name))));
        }
    }
}

/// Read side of a task's completion signal.
pub struct TaskHandle<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for TaskHandle<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> std::fmt::Debug for TaskHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandle")
            .field("name", &self.shared.name)
            .field("finished", &self.is_finished())
            .finish()
    }
}

impl<T: Clone> TaskHandle<T> {
    /// Block until the task reaches a terminal state.
    pub fn wait(&self) -> TaskResult<T> {
        let mut slot = self.shared.outcome.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if let Some(outcome) = slot.as_ref() {
                return outcome.clone();
            }
            slot = self
                .shared
                .done
                .wait(slot)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Block for at most `timeout`; `None` if the task is still running.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<TaskResult<T>> {
        let deadline = Instant::now() + timeout;
        let mut slot = self.shared.outcome.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if let Some(outcome) = slot.as_ref() {
                return Some(outcome.clone());
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            slot = self
                .shared
                .done
                .wait_timeout(slot, remaining)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }
}

impl<T> TaskHandle<T> {
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn is_finished(&self) -> bool {
        self.shared
            .outcome
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }
}

/// Create an unfinished task signal.
pub fn task_pair<T>(name: impl Into<String>) -> (Completer<T>, TaskHandle<T>) {
    let shared = Arc::new(Shared {
        name: name.into(),
        outcome: Mutex::new(None),
        done: Condvar::new(),
    });
    (
        Completer {
            shared: Arc::clone(&shared),
            completed: false,
        },
        TaskHandle { shared },
    )
}

/// Run `work` on a dedicated named thread and return its completion handle.
pub fn spawn_task<T, F>(name: impl Into<String>, work: F) -> crate::Result<TaskHandle<T>>
where
    T: Send + 'static,
    F: FnOnce() -> crate::Result<T> + Send + 'static,
{
    let name = name.into();
    let (completer, handle) = task_pair(name.clone());
    thread::Builder::new()
        .name(name)
        .spawn(move || completer.complete(work()))
        .map_err(|e| Error::TaskSpawn(e.to_string()))?;
    Ok(handle)
}
