// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! Cancellable units of native work

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;

use crate::library::ClassifierLibrary;
use crate::{ClassqError, Result};

/// Identity of a submitted task, unique within one queue
pub type TaskId = u64;

/// How a task ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Succeeded,
    Failed(String),
    Cancelled,
}

/// Lifecycle of a task; `Finished` is final
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskState {
    Pending,
    Running,
    Finished(TaskOutcome),
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Finished(_))
    }

    pub fn outcome(&self) -> Option<&TaskOutcome> {
        match self {
            TaskState::Finished(outcome) => Some(outcome),
            _ => None,
        }
    }
}

/// Named stop signal shared by a task, its canceller and the native code
///
/// The signal string is what the native library polls; the flag is what
/// Rust-side task code checks between steps.
#[derive(Clone)]
pub struct CancelToken {
    signal: Arc<str>,
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    /// Create a token for a task name; the name must not be blank
    pub fn new(name: &str) -> Result<Self> {
        let stem: String = name
            .trim()
            .chars()
            .map(|c| if c.is_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
            .collect();
        if stem.is_empty() {
            return Err(ClassqError::InvalidTaskName(name.to_string()));
        }
        let signal = format!("{}-{}", stem, uuid::Uuid::new_v4().simple());
        Ok(Self {
            signal: Arc::from(signal),
            cancelled: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Signal name passed to every native call of the task
    pub fn signal(&self) -> &str {
        &self.signal
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// `Err(Cancelled)` once the token is raised; for use between steps
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(ClassqError::Cancelled(self.signal.to_string()));
        }
        Ok(())
    }

    /// Raise the flag; true only for the first call
    pub(crate) fn raise(&self) -> bool {
        !self.cancelled.swap(true, Ordering::AcqRel)
    }
}

impl fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelToken")
            .field("signal", &self.signal)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Work executed on the queue's worker thread against the native library
pub trait ClassifierTask: Send + 'static {
    type Output: Send + 'static;

    /// Human-readable name; also the stem of the cancel signal
    fn name(&self) -> &str;

    /// Perform the work. Iterative tasks check `cancel` between steps.
    fn run(self, library: &mut dyn ClassifierLibrary, cancel: &CancelToken) -> Result<Self::Output>;
}

/// State shared between the worker, the canceller and every handle
pub(crate) struct TaskShared {
    pub(crate) id: TaskId,
    pub(crate) name: String,
    pub(crate) token: CancelToken,
    state: watch::Sender<TaskState>,
}

impl TaskShared {
    pub(crate) fn new(id: TaskId, name: String, token: CancelToken) -> Self {
        let (state, _) = watch::channel(TaskState::Pending);
        Self { id, name, token, state }
    }

    pub(crate) fn state(&self) -> TaskState {
        self.state.borrow().clone()
    }

    /// Pending -> Running; false if the task already left Pending
    pub(crate) fn mark_running(&self) -> bool {
        self.state.send_if_modified(|state| {
            if *state == TaskState::Pending {
                *state = TaskState::Running;
                true
            } else {
                false
            }
        })
    }

    /// Move to a terminal state; false if one was already reached
    pub(crate) fn finish(&self, outcome: TaskOutcome) -> bool {
        self.state.send_if_modified(|state| {
            if state.is_terminal() {
                false
            } else {
                *state = TaskState::Finished(outcome);
                true
            }
        })
    }
}

/// Type-erased task as stored in the queue
pub(crate) type JobFn = Box<dyn FnOnce(&mut dyn ClassifierLibrary, &CancelToken) -> Result<()> + Send>;

pub(crate) struct Job {
    pub(crate) shared: Arc<TaskShared>,
    pub(crate) run: JobFn,
}

impl Job {
    /// Wrap a task, storing its output in the returned handle on success
    pub(crate) fn new<T: ClassifierTask>(id: TaskId, task: T) -> Result<(Self, TaskHandle<T::Output>)> {
        let token = CancelToken::new(task.name())?;
        let shared = Arc::new(TaskShared::new(id, task.name().to_string(), token));
        let output: Arc<Mutex<Option<T::Output>>> = Arc::new(Mutex::new(None));

        let slot = Arc::clone(&output);
        let run: JobFn = Box::new(move |library, cancel| {
            let value = task.run(library, cancel)?;
            *slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(value);
            Ok(())
        });

        let handle = TaskHandle { shared: Arc::clone(&shared), output };
        Ok((Self { shared, run }, handle))
    }
}

/// Producer-side view of a submitted task
pub struct TaskHandle<O> {
    pub(crate) shared: Arc<TaskShared>,
    output: Arc<Mutex<Option<O>>>,
}

impl<O> Clone for TaskHandle<O> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            output: Arc::clone(&self.output),
        }
    }
}

impl<O> fmt::Debug for TaskHandle<O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("id", &self.shared.id)
            .field("name", &self.shared.name)
            .field("state", &self.shared.state())
            .finish()
    }
}

impl<O> TaskHandle<O> {
    pub fn id(&self) -> TaskId {
        self.shared.id
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.shared.token
    }

    pub fn state(&self) -> TaskState {
        self.shared.state()
    }

    pub fn outcome(&self) -> Option<TaskOutcome> {
        self.state().outcome().cloned()
    }

    /// True only after a successful run
    pub fn is_finished(&self) -> bool {
        matches!(self.state(), TaskState::Finished(TaskOutcome::Succeeded))
    }

    /// True once the task was cancelled or its run failed
    pub fn is_cancelled(&self) -> bool {
        matches!(
            self.state(),
            TaskState::Finished(TaskOutcome::Cancelled) | TaskState::Finished(TaskOutcome::Failed(_))
        )
    }

    /// Wait until the task reaches a terminal state
    pub async fn wait(&self) -> TaskOutcome {
        let mut rx = self.shared.state.subscribe();
        let outcome = match rx.wait_for(TaskState::is_terminal).await {
            Ok(state) => state.outcome().cloned().unwrap_or(TaskOutcome::Cancelled),
            // the sender lives in `shared`, which this handle keeps alive
            Err(_) => TaskOutcome::Cancelled,
        };
        outcome
    }

    /// Like [`TaskHandle::wait`], giving up after `timeout`
    pub async fn wait_timeout(&self, timeout: Duration) -> Option<TaskOutcome> {
        tokio::time::timeout(timeout, self.wait()).await.ok()
    }

    /// Take the value produced by a successful run
    pub fn take_output(&self) -> Option<O> {
        self.output.lock().unwrap_or_else(PoisonError::into_inner).take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_pending, assert_ready_eq};

    struct Noop;

    impl ClassifierTask for Noop {
        type Output = u32;

        fn name(&self) -> &str {
            "noop"
        }

        fn run(self, _library: &mut dyn ClassifierLibrary, _cancel: &CancelToken) -> Result<u32> {
            Ok(7)
        }
    }

    #[test]
    fn test_token_requires_name() {
        assert!(matches!(CancelToken::new("  "), Err(ClassqError::InvalidTaskName(_))));
    }

    #[test]
    fn test_tokens_are_unique() {
        let a = CancelToken::new("run benthic").unwrap();
        let b = CancelToken::new("run benthic").unwrap();
        assert_ne!(a.signal(), b.signal());
        assert!(a.signal().starts_with("run_benthic-"));
    }

    #[test]
    fn test_raise_is_first_only() {
        let token = CancelToken::new("t").unwrap();
        assert!(token.check().is_ok());
        assert!(token.raise());
        assert!(!token.raise());
        assert!(token.check().unwrap_err().is_cancelled());
    }

    #[test]
    fn test_terminal_state_is_final() {
        let (job, handle) = Job::new(1, Noop).unwrap();
        assert!(job.shared.mark_running());
        assert!(!job.shared.mark_running());
        assert!(job.shared.finish(TaskOutcome::Succeeded));
        assert!(!job.shared.finish(TaskOutcome::Cancelled));

        for _ in 0..3 {
            assert!(handle.is_finished());
            assert!(!handle.is_cancelled());
            assert_eq!(handle.outcome(), Some(TaskOutcome::Succeeded));
        }
    }

    #[test]
    fn test_failed_counts_as_cancelled() {
        let (job, handle) = Job::new(1, Noop).unwrap();
        job.shared.finish(TaskOutcome::Failed("boom".to_string()));
        assert!(handle.is_cancelled());
        assert!(!handle.is_finished());
    }

    #[test]
    fn test_wait_resolves_on_finish() {
        let (job, handle) = Job::new(3, Noop).unwrap();
        let mut wait = tokio_test::task::spawn(handle.wait());
        assert_pending!(wait.poll());

        job.shared.mark_running();
        assert_pending!(wait.poll());

        job.shared.finish(TaskOutcome::Cancelled);
        assert!(wait.is_woken());
        assert_ready_eq!(wait.poll(), TaskOutcome::Cancelled);
    }
}
