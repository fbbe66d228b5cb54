// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! Batch classification of event files
//!
//! Items run one after another through import, transcode, classify, export
//! and cleanup. A user stop aborts the whole batch; any other failure only
//! fails the item at hand and the batch moves on.

pub mod item;
pub mod source;
pub mod stages;

use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, warn};

use crate::config::AppConfig;
use crate::library::{TrainingModel, VotingMethod};
use crate::queue::task::{TaskHandle, TaskOutcome};
use crate::queue::TaskQueue;
use crate::results::{create_entry, ResultsLedger};
use crate::tasks::{ClassificationReport, RunClassifierTask};
use crate::{ClassqError, Result};

pub use item::{BatchItem, BatchStatus};
pub use source::SourceResolver;
pub use stages::{BatchStages, CommandStages, ImportReport, StageOutcome, TranscodeReport};

/// Receiving end of a batch stop request
pub type StopSignal = watch::Receiver<bool>;

/// Resolve once `stop` turns true; never resolves if the sender is gone
pub async fn wait_stopped(stop: &mut StopSignal) {
    if stop.wait_for(|stopped| *stopped).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Everything a batch run needs besides its items
#[derive(Debug, Clone)]
pub struct BatchSettings {
    pub training_model: Option<TrainingModel>,
    pub output_dir: PathBuf,
    pub scratch_dir: PathBuf,
    pub min_prob_threshold: f32,
    pub voting_method: VotingMethod,
    /// How often a waiting runner reports on the classify task
    pub poll_interval: Duration,
    pub download_timeout: Duration,
}

impl BatchSettings {
    pub fn from_config(config: &AppConfig, training_model: Option<TrainingModel>) -> Self {
        Self {
            training_model,
            output_dir: PathBuf::from(&config.batch.output_dir),
            scratch_dir: PathBuf::from(&config.classifier.scratch_dir),
            min_prob_threshold: config.batch.min_prob_threshold,
            voting_method: config.batch.voting_method,
            poll_interval: config.batch.poll_interval(),
            download_timeout: Duration::from_secs(600),
        }
    }
}

/// Counts of a finished run
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatchSummary {
    pub done: usize,
    pub failed: usize,
    pub stopped: usize,
    /// Items already Done before the run
    pub skipped: usize,
    /// True when a stop ended the run early
    pub aborted: bool,
}

#[derive(Debug, Clone)]
pub enum BatchEvent {
    StatusChanged {
        index: usize,
        source: PathBuf,
        status: BatchStatus,
    },
    /// Message meant for the user
    Notice(String),
    Finished(BatchSummary),
}

enum Flow {
    Continue,
    Abort,
}

pub struct BatchRunner {
    queue: Arc<TaskQueue>,
    stages: Arc<dyn BatchStages>,
    resolver: SourceResolver,
    settings: BatchSettings,
    items: Mutex<Vec<BatchItem>>,
    stop_tx: watch::Sender<bool>,
    current: Mutex<Option<TaskHandle<ClassificationReport>>>,
    events: broadcast::Sender<BatchEvent>,
    running: AtomicBool,
}

impl BatchRunner {
    pub fn new(queue: Arc<TaskQueue>, stages: Arc<dyn BatchStages>, settings: BatchSettings) -> Result<Self> {
        let resolver = SourceResolver::new(&settings.scratch_dir, settings.download_timeout)?;
        let (stop_tx, _) = watch::channel(false);
        let (events, _) = broadcast::channel(256);
        Ok(Self {
            queue,
            stages,
            resolver,
            settings,
            items: Mutex::new(Vec::new()),
            stop_tx,
            current: Mutex::new(None),
            events,
            running: AtomicBool::new(false),
        })
    }

    fn lock_items(&self) -> MutexGuard<'_, Vec<BatchItem>> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_current(&self) -> MutexGuard<'_, Option<TaskHandle<ClassificationReport>>> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replace the selection
    pub fn set_sources<I>(&self, sources: I)
    where
        I: IntoIterator<Item = PathBuf>,
    {
        *self.lock_items() = sources.into_iter().map(BatchItem::new).collect();
    }

    pub fn add_source(&self, source: PathBuf) {
        self.lock_items().push(BatchItem::new(source));
    }

    pub fn clear(&self) {
        self.lock_items().clear();
    }

    /// Snapshot of the items and their status
    pub fn items(&self) -> Vec<BatchItem> {
        self.lock_items().clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BatchEvent> {
        self.events.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn settings(&self) -> &BatchSettings {
        &self.settings
    }

    /// Ask the current run to stop
    ///
    /// The running stage sees the stop signal and an in-flight classify
    /// task is cancelled through the queue.
    pub fn stop(&self) {
        self.stop_tx.send_replace(true);
        if let Some(handle) = self.lock_current().as_ref() {
            if self.queue.cancel(handle) {
                info!("Cancelled classify task {}", handle.name());
            }
        }
    }

    /// Check everything a run needs before touching any item
    pub fn validate(&self) -> Result<&TrainingModel> {
        if self.lock_items().is_empty() {
            return Err(ClassqError::Batch("select at least one event file".to_string()));
        }
        let training = self
            .settings
            .training_model
            .as_ref()
            .ok_or_else(|| ClassqError::Batch("select a training library".to_string()))?;
        check_writable(&self.settings.output_dir)?;
        Ok(training)
    }

    /// Run every item not already Done
    pub async fn run(&self) -> Result<BatchSummary> {
        let training = self.validate()?.clone();
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(ClassqError::Batch("a batch is already running".to_string()));
        }
        self.stop_tx.send_replace(false);

        let ledger = ResultsLedger::in_dir(&self.settings.output_dir);
        let count = self.lock_items().len();
        let mut summary = BatchSummary::default();
        info!("Starting batch of {} items with {}", count, training.name);

        for index in 0..count {
            let already_done = match self.lock_items().get_mut(index) {
                Some(item) if item.is_done() => true,
                Some(item) => {
                    item.begin_run();
                    false
                }
                None => break,
            };
            if already_done {
                summary.skipped += 1;
                continue;
            }

            let flow = match self.process_item(index, &training, &ledger).await {
                Ok(flow) => flow,
                Err(e) => {
                    error!("Batch item {} failed: {}", index, e);
                    self.fail_item(index, e.to_string());
                    self.record(&ledger, index, &training);
                    Flow::Continue
                }
            };

            match self.lock_items().get(index).map(|item| item.status) {
                Some(BatchStatus::Done) => summary.done += 1,
                Some(BatchStatus::Failed) => summary.failed += 1,
                Some(BatchStatus::Stopped) => summary.stopped += 1,
                _ => {}
            }
            if let Flow::Abort = flow {
                summary.aborted = true;
                break;
            }
        }

        self.running.store(false, Ordering::SeqCst);
        info!(
            "Batch finished: {} done, {} failed, {} stopped, {} skipped",
            summary.done, summary.failed, summary.stopped, summary.skipped
        );
        let _ = self.events.send(BatchEvent::Finished(summary.clone()));
        Ok(summary)
    }

    async fn process_item(&self, index: usize, training: &TrainingModel, ledger: &ResultsLedger) -> Result<Flow> {
        let stop = self.stop_tx.subscribe();
        let source = self.source_of(index)?;

        self.set_status(index, BatchStatus::Importing)?;
        let import = match self.stages.import(&source, &stop).await? {
            StageOutcome::Completed(report) => report,
            StageOutcome::Cancelled => return Ok(self.stopped(index, training, ledger)),
        };
        if import.event_count == 0 {
            info!("No events in {:?}", source);
            self.set_status(index, BatchStatus::Done)?;
            self.record(ledger, index, training);
            return Ok(Flow::Continue);
        }

        self.set_status(index, BatchStatus::Transcoding)?;
        let video = match self.resolver.resolve(&import.video_source, &stop).await? {
            StageOutcome::Completed(path) => path,
            StageOutcome::Cancelled => return Ok(self.stopped(index, training, ledger)),
        };
        let transcode = match self.stages.transcode(&video, &import, &stop).await? {
            StageOutcome::Completed(report) => report,
            StageOutcome::Cancelled => return Ok(self.stopped(index, training, ledger)),
        };

        self.set_status(index, BatchStatus::Classifying)?;
        let test_dir = test_images_dir(&transcode.frame_dir)?;
        tokio::fs::create_dir_all(&test_dir).await?;
        if *stop.borrow() {
            return Ok(self.stopped(index, training, ledger));
        }

        let task = RunClassifierTask::new(
            training.clone(),
            test_dir,
            self.settings.min_prob_threshold,
            self.settings.voting_method,
        )
        .with_actual_classes(import.known_classes.clone());
        let handle = self.queue.submit(task)?;
        *self.lock_current() = Some(handle.clone());
        // a stop that landed before the handle was visible
        if *stop.borrow() {
            self.queue.cancel(&handle);
        }
        let outcome = self.wait_for_task(&handle).await;
        *self.lock_current() = None;

        match outcome {
            TaskOutcome::Succeeded => {}
            TaskOutcome::Cancelled => return Ok(self.stopped(index, training, ledger)),
            TaskOutcome::Failed(reason) => {
                warn!("Classifying {:?} failed: {}", source, reason);
                self.fail_item(index, reason);
                self.record(ledger, index, training);
                return Ok(Flow::Continue);
            }
        }
        let report = handle
            .take_output()
            .ok_or_else(|| ClassqError::Batch("classifier produced no report".to_string()))?;
        if let Some(item) = self.lock_items().get_mut(index) {
            item.class_totals = report.class_totals.clone();
        }

        self.set_status(index, BatchStatus::Exporting)?;
        if let StageOutcome::Cancelled = self
            .stages
            .export(&source, &report, &self.settings.output_dir, &stop)
            .await?
        {
            return Ok(self.stopped(index, training, ledger));
        }

        self.set_status(index, BatchStatus::CleaningUp)?;
        if let StageOutcome::Cancelled = self.stages.cleanup(&transcode, &stop).await? {
            return Ok(self.stopped(index, training, ledger));
        }

        self.set_status(index, BatchStatus::Done)?;
        self.record(ledger, index, training);
        Ok(Flow::Continue)
    }

    async fn wait_for_task(&self, handle: &TaskHandle<ClassificationReport>) -> TaskOutcome {
        loop {
            if let Some(outcome) = handle.wait_timeout(self.settings.poll_interval).await {
                return outcome;
            }
            info!("Waiting for {} ({:?})", handle.name(), handle.state());
        }
    }

    fn source_of(&self, index: usize) -> Result<PathBuf> {
        self.lock_items()
            .get(index)
            .map(|item| item.source.clone())
            .ok_or_else(|| ClassqError::Batch(format!("no batch item {}", index)))
    }

    fn set_status(&self, index: usize, status: BatchStatus) -> Result<()> {
        let source = {
            let mut items = self.lock_items();
            let item = items
                .get_mut(index)
                .ok_or_else(|| ClassqError::Batch(format!("no batch item {}", index)))?;
            item.advance(status)?;
            item.source.clone()
        };
        debug!("{:?}: {}", source, status);
        let _ = self.events.send(BatchEvent::StatusChanged { index, source, status });
        Ok(())
    }

    fn fail_item(&self, index: usize, message: String) {
        if let Some(item) = self.lock_items().get_mut(index) {
            item.message = Some(message);
        }
        if let Err(e) = self.set_status(index, BatchStatus::Failed) {
            warn!("Could not mark item {} failed: {}", index, e);
        }
    }

    fn stopped(&self, index: usize, training: &TrainingModel, ledger: &ResultsLedger) -> Flow {
        let notice = format!("{} classification stopped", training.name);
        if let Some(item) = self.lock_items().get_mut(index) {
            item.message = Some(notice.clone());
        }
        if let Err(e) = self.set_status(index, BatchStatus::Stopped) {
            warn!("Could not mark item {} stopped: {}", index, e);
        }
        info!("{}", notice);
        let _ = self.events.send(BatchEvent::Notice(notice));
        self.record(ledger, index, training);
        Flow::Abort
    }

    fn record(&self, ledger: &ResultsLedger, index: usize, training: &TrainingModel) {
        let Some(item) = self.lock_items().get(index).cloned() else {
            return;
        };
        let entry = create_entry(&item, &training.name, item.message.clone(), |i| {
            training.class_label(i).to_string()
        });
        if let Err(e) = ledger.append(&entry) {
            warn!("Could not append to {:?}: {}", ledger.path(), e);
        }
    }
}

/// `<frame_dir>/testimages_<frame_dir name>`
pub fn test_images_dir(frame_dir: &Path) -> Result<PathBuf> {
    let name = frame_dir
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .ok_or_else(|| ClassqError::Batch(format!("bad frame directory {:?}", frame_dir)))?;
    Ok(frame_dir.join(format!("testimages_{}", name)))
}

fn check_writable(dir: &Path) -> Result<()> {
    if !dir.is_dir() {
        return Err(ClassqError::Batch(format!(
            "output directory {:?} does not exist",
            dir
        )));
    }
    let marker = dir.join(format!(".classq-write-{}", uuid::Uuid::new_v4().simple()));
    std::fs::write(&marker, b"")
        .and_then(|_| std::fs::remove_file(&marker))
        .map_err(|e| ClassqError::Batch(format!("output directory {:?} is not writable: {}", dir, e)))
}
