// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! Serialized task queue over the native classifier library
//!
//! One worker thread owns the library for the whole life of the queue and
//! runs submitted tasks strictly one at a time, in submission order. The
//! library is opened before the first task and closed on shutdown (or on
//! request, in which case the next task opens it again).
//!
//! Cancellation is cooperative: cancelling raises the task's kill flag in
//! the native layer, but a native call that is already running stops only
//! when the library notices the flag. How long that takes is up to the
//! library.

pub mod task;

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, info, trace, warn};

use crate::config::{platform_flag, ClassifierConfig};
use crate::library::{ClassifierLibrary, KillSwitch};
use crate::logtail::LogReader;
use crate::{ClassqError, Result};

use task::{ClassifierTask, Job, TaskHandle, TaskId, TaskOutcome, TaskShared};

/// Completion notice, emitted once for every task the worker dequeues
#[derive(Debug, Clone, PartialEq)]
pub struct TaskEvent {
    pub id: TaskId,
    pub name: String,
    pub outcome: TaskOutcome,
}

/// Queue construction settings
#[derive(Debug, Clone)]
pub struct QueueOptions {
    /// Log file handed to the library at init
    pub log_path: PathBuf,
    pub platform_flag: i32,
    /// How long the idle worker sleeps before re-checking for shutdown
    pub idle_poll: Duration,
}

impl From<&ClassifierConfig> for QueueOptions {
    fn from(config: &ClassifierConfig) -> Self {
        Self {
            log_path: config.log_path(),
            platform_flag: platform_flag(),
            idle_poll: config.idle_poll(),
        }
    }
}

struct QueueState {
    jobs: VecDeque<Job>,
    exit: bool,
    close_requested: bool,
}

struct Shared {
    state: Mutex<QueueState>,
    available: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Single-consumer queue serializing all calls into the classifier library
pub struct TaskQueue {
    shared: Arc<Shared>,
    kill: Arc<dyn KillSwitch>,
    events: broadcast::Sender<TaskEvent>,
    log_path: PathBuf,
    worker: Mutex<Option<JoinHandle<()>>>,
    next_id: AtomicU64,
}

impl TaskQueue {
    /// Start the worker thread; `library` is moved onto it
    pub fn start<L>(library: L, options: QueueOptions) -> Result<Self>
    where
        L: ClassifierLibrary + 'static,
    {
        let shared = Arc::new(Shared {
            state: Mutex::new(QueueState {
                jobs: VecDeque::new(),
                exit: false,
                close_requested: false,
            }),
            available: Condvar::new(),
        });
        let (events, _) = broadcast::channel(256);
        let kill = library.kill_switch();
        let log_path = options.log_path.clone();

        let worker = Worker {
            library,
            opened: false,
            shared: Arc::clone(&shared),
            events: events.clone(),
            options,
        };
        let handle = thread::Builder::new()
            .name("classifier-worker".to_string())
            .spawn(move || worker.run())?;

        info!("Classifier task queue started");

        Ok(Self {
            shared,
            kill,
            events,
            log_path,
            worker: Mutex::new(Some(handle)),
            next_id: AtomicU64::new(1),
        })
    }

    /// Append a task to the tail of the queue
    pub fn submit<T: ClassifierTask>(&self, task: T) -> Result<TaskHandle<T::Output>> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (job, handle) = Job::new(id, task)?;

        {
            let mut state = self.shared.lock();
            if state.exit {
                return Err(ClassqError::QueueShutDown);
            }
            state.jobs.push_back(job);
            debug!("Queued task {} '{}' ({} pending)", id, handle.name(), state.jobs.len());
        }
        self.shared.available.notify_one();

        Ok(handle)
    }

    /// Cancel a pending or running task
    ///
    /// Returns false when the task had already reached a terminal state, in
    /// which case nothing changes.
    pub fn cancel<O>(&self, handle: &TaskHandle<O>) -> bool {
        cancel_shared(&handle.shared, self.kill.as_ref())
    }

    /// Ask the worker to close the library between tasks
    pub fn close_library(&self) {
        self.shared.lock().close_requested = true;
        self.shared.available.notify_one();
    }

    /// Stop the worker after its current task and close the library
    ///
    /// Tasks still pending are never run; they end as cancelled.
    pub fn shutdown(&self) {
        {
            let mut state = self.shared.lock();
            if !state.exit {
                info!("Shutting down classifier task queue");
            }
            state.exit = true;
        }
        self.shared.available.notify_all();

        let handle = self.worker.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(handle) = handle {
            if handle.thread().id() == thread::current().id() {
                warn!("Queue shut down from its own worker; not joining");
                return;
            }
            match handle.join() {
                Ok(()) => debug!("Classifier worker joined"),
                Err(_) => error!("Classifier worker panicked"),
            }
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.shared.lock().exit
    }

    /// Completion notices for every task dequeued from now on
    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.events.subscribe()
    }

    /// Reader over the library's log, positioned at its current end
    pub fn log_reader(&self) -> Result<LogReader> {
        LogReader::open_at_end(&self.log_path)
    }

    pub fn log_path(&self) -> &std::path::Path {
        &self.log_path
    }

    /// Number of tasks waiting to run
    pub fn pending_len(&self) -> usize {
        self.shared.lock().jobs.len()
    }
}

impl Drop for TaskQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn cancel_shared(shared: &TaskShared, kill: &dyn KillSwitch) -> bool {
    if shared.state().is_terminal() || !shared.token.raise() {
        trace!("Task {} already finished; cancel ignored", shared.id);
        return false;
    }
    // the flag goes up before the state changes, so whoever sees the
    // terminal state also sees the raised token
    kill.set_kill(shared.token.signal(), true);
    if shared.finish(TaskOutcome::Cancelled) {
        info!("Cancelled task {} '{}'", shared.id, shared.name);
        true
    } else {
        trace!("Task {} finished before its cancel landed", shared.id);
        kill.set_kill(shared.token.signal(), false);
        false
    }
}

enum Command {
    Run(Job),
    Close,
    Exit,
}

/// Owner of the library, living on the worker thread
struct Worker<L> {
    library: L,
    opened: bool,
    shared: Arc<Shared>,
    events: broadcast::Sender<TaskEvent>,
    options: QueueOptions,
}

impl<L: ClassifierLibrary> Worker<L> {
    fn run(mut self) {
        debug!("Classifier worker started");

        loop {
            match self.next_command() {
                Command::Run(job) => self.execute(job),
                Command::Close => self.close_library(),
                Command::Exit => break,
            }
        }

        let abandoned: Vec<Job> = self.shared.lock().jobs.drain(..).collect();
        for job in abandoned {
            self.complete(&job.shared, TaskOutcome::Cancelled);
        }

        self.close_library();
        debug!("Classifier worker exiting");
    }

    fn next_command(&self) -> Command {
        let mut state = self.shared.lock();
        loop {
            if state.exit {
                return Command::Exit;
            }
            if state.close_requested {
                state.close_requested = false;
                return Command::Close;
            }
            if let Some(job) = state.jobs.pop_front() {
                return Command::Run(job);
            }

            let (guard, timeout) = self
                .shared
                .available
                .wait_timeout(state, self.options.idle_poll)
                .unwrap_or_else(PoisonError::into_inner);
            state = guard;
            if timeout.timed_out() {
                trace!("Classifier worker idle");
            }
        }
    }

    fn execute(&mut self, job: Job) {
        let shared = Arc::clone(&job.shared);

        if shared.token.is_cancelled() || shared.state().is_terminal() {
            debug!("Skipping cancelled task {} '{}'", shared.id, shared.name);
            self.complete(&shared, TaskOutcome::Cancelled);
            return;
        }

        if let Err(e) = self.ensure_open() {
            error!("Task {} '{}' not run: {}", shared.id, shared.name, e);
            self.complete(&shared, TaskOutcome::Failed(e.to_string()));
            return;
        }

        if !shared.mark_running() {
            self.complete(&shared, TaskOutcome::Cancelled);
            return;
        }
        debug!("Running task {} '{}'", shared.id, shared.name);

        let token = shared.token.clone();
        let run = job.run;
        let library: &mut dyn ClassifierLibrary = &mut self.library;
        let result = panic::catch_unwind(AssertUnwindSafe(move || run(library, &token)));

        let outcome = match result {
            Ok(Ok(())) => TaskOutcome::Succeeded,
            Ok(Err(e)) if e.is_cancelled() || shared.token.is_cancelled() => {
                debug!("Task {} '{}' stopped: {}", shared.id, shared.name, e);
                TaskOutcome::Cancelled
            }
            Ok(Err(e)) => {
                error!("Task {} '{}' failed: {}", shared.id, shared.name, e);
                TaskOutcome::Failed(e.to_string())
            }
            Err(payload) => {
                let reason = panic_message(payload.as_ref());
                error!("Task {} '{}' panicked: {}", shared.id, shared.name, reason);
                TaskOutcome::Failed(format!("task panicked: {}", reason))
            }
        };
        self.complete(&shared, outcome);
    }

    /// Settle a dequeued task: record its outcome, drop its kill flag, notify
    ///
    /// A canceller raises the flag before it changes the state, so checking
    /// the token after `finish` never leaves a flag behind.
    fn complete(&mut self, shared: &TaskShared, outcome: TaskOutcome) {
        shared.finish(outcome);
        if shared.token.is_cancelled() {
            self.library.kill_switch().set_kill(shared.token.signal(), false);
        }
        self.notify(shared);
    }

    fn ensure_open(&mut self) -> Result<()> {
        if self.opened {
            return Ok(());
        }
        info!("Opening classifier library (log: {:?})", self.options.log_path);
        self.library
            .init(&self.options.log_path, self.options.platform_flag)
            .map_err(|e| ClassqError::LibraryUnavailable(e.to_string()))?;
        self.opened = true;
        Ok(())
    }

    fn close_library(&mut self) {
        if !self.opened {
            return;
        }
        self.opened = false;
        match self.library.close() {
            Ok(()) => info!("Classifier library closed"),
            Err(e) => warn!("Closing classifier library failed: {}", e),
        }
    }

    fn notify(&self, shared: &TaskShared) {
        let outcome = shared.state().outcome().cloned().unwrap_or(TaskOutcome::Cancelled);
        let _ = self.events.send(TaskEvent {
            id: shared.id,
            name: shared.name.clone(),
            outcome,
        });
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
pub(crate) mod testing;
