// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! Instrumented classifier stub shared by unit tests

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use super::task::{CancelToken, ClassifierTask};
use super::QueueOptions;
use crate::library::debug::DebugKillSwitch;
use crate::library::{
    ClassModel, ClassifierLibrary, ColorSpace, KillSwitch, RunTestOutput, RunTestRequest,
    TestClassOutput, TestClassRequest, TrainRequest, TrainingModel,
};
use crate::{ClassqError, Result};

/// Counters observed by the tests
#[derive(Default)]
pub(crate) struct CallLog {
    pub inits: AtomicUsize,
    pub closes: AtomicUsize,
    pub fail_inits: AtomicUsize,
    pub max_in_flight: AtomicUsize,
    in_flight: AtomicUsize,
    pub calls: Mutex<Vec<String>>,
}

impl CallLog {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

/// Library whose calls sleep, record themselves and honour kill flags
pub(crate) struct ScriptedLibrary {
    pub calls_log: Arc<CallLog>,
    pub kill: Arc<DebugKillSwitch>,
    call_time: Duration,
    winners: Vec<i32>,
}

impl ScriptedLibrary {
    pub fn new(call_time: Duration) -> Self {
        Self {
            calls_log: Arc::new(CallLog::default()),
            kill: Arc::new(DebugKillSwitch::default()),
            call_time,
            winners: Vec::new(),
        }
    }

    /// Winner index returned for each event by `run_test`
    pub fn with_winners(mut self, winners: Vec<i32>) -> Self {
        self.winners = winners;
        self
    }

    fn call(&self, signal: &str, label: String) -> Result<()> {
        let before = self.calls_log.in_flight.fetch_add(1, Ordering::SeqCst);
        self.calls_log.max_in_flight.fetch_max(before + 1, Ordering::SeqCst);

        let started = Instant::now();
        let result = loop {
            if self.kill.is_raised(signal) {
                break Err(ClassqError::Cancelled(signal.to_string()));
            }
            if started.elapsed() >= self.call_time {
                break Ok(());
            }
            std::thread::sleep(Duration::from_millis(5));
        };

        self.calls_log.calls.lock().unwrap().push(label);
        self.calls_log.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

impl ClassifierLibrary for ScriptedLibrary {
    fn init(&mut self, _log_path: &Path, _platform_flag: i32) -> Result<()> {
        let pending_failures = self.calls_log.fail_inits.load(Ordering::SeqCst);
        if pending_failures > 0 {
            self.calls_log.fail_inits.store(pending_failures - 1, Ordering::SeqCst);
            return Err(ClassqError::Library("runtime missing".to_string()));
        }
        self.calls_log.inits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.calls_log.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn kill_switch(&self) -> Arc<dyn KillSwitch> {
        self.kill.clone()
    }

    fn collect_class(&mut self, signal: &str, class: &ClassModel) -> Result<()> {
        self.call(signal, format!("collect_class:{}", class.name))
    }

    fn delete_class(&mut self, signal: &str, name: &str, _root: &Path, _cs: ColorSpace) -> Result<()> {
        self.call(signal, format!("delete_class:{}", name))
    }

    fn train_classes(&mut self, signal: &str, request: &TrainRequest) -> Result<()> {
        self.call(signal, format!("train_classes:{}", request.alias))
    }

    fn collect_tests(&mut self, signal: &str, test_dir: &Path, _root: &Path, _cs: ColorSpace) -> Result<()> {
        self.call(signal, format!("collect_tests:{}", test_dir.display()))
    }

    fn run_test(&mut self, signal: &str, request: &RunTestRequest) -> Result<RunTestOutput> {
        self.call(signal, format!("run_test:{}", request.test_dir_name))?;
        let n = self.winners.len();
        Ok(RunTestOutput {
            event_ids: (0..n).map(|i| format!("evt{}", i)).collect(),
            majority_winner: self.winners.clone(),
            probability_winner: self.winners.clone(),
            max_probability_winner: self.winners.clone(),
            probability: vec![0.9; n],
        })
    }

    fn test_class(&mut self, signal: &str, request: &TestClassRequest) -> Result<TestClassOutput> {
        self.call(signal, format!("test_class:{}", request.test_class_name))?;
        Ok(TestClassOutput {
            event_files: vec!["a".to_string(), "b".to_string(), "c".to_string()],
            class_index: vec![1, 1, 2],
            probability: vec![0.9, 0.8, 0.7],
        })
    }

    fn get_collected_classes(&mut self, root: &Path) -> Result<Vec<ClassModel>> {
        self.call("", format!("get_collected_classes:{}", root.display()))?;
        Ok(Vec::new())
    }

    fn get_training_classes(&mut self, root: &Path) -> Result<Vec<TrainingModel>> {
        self.call("", format!("get_training_classes:{}", root.display()))?;
        Ok(Vec::new())
    }
}

pub(crate) fn options() -> QueueOptions {
    QueueOptions {
        log_path: PathBuf::from("/nonexistent/classifier.log"),
        platform_flag: 0,
        idle_poll: Duration::from_millis(50),
    }
}

/// One native call, recording when it ran
pub(crate) struct RecordingTask {
    pub name: String,
    pub spans: Arc<Mutex<Vec<(String, Instant, Instant)>>>,
}

impl RecordingTask {
    pub fn new(name: &str, spans: &Arc<Mutex<Vec<(String, Instant, Instant)>>>) -> Self {
        Self {
            name: name.to_string(),
            spans: Arc::clone(spans),
        }
    }
}

impl ClassifierTask for RecordingTask {
    type Output = String;

    fn name(&self) -> &str {
        &self.name
    }

    fn run(self, library: &mut dyn ClassifierLibrary, cancel: &CancelToken) -> Result<String> {
        let start = Instant::now();
        library.collect_tests(cancel.signal(), Path::new(&self.name), Path::new("/db"), ColorSpace::Rgb)?;
        self.spans.lock().unwrap().push((self.name.clone(), start, Instant::now()));
        Ok(self.name)
    }
}

/// Fails without touching the library
pub(crate) struct FailingTask;

impl ClassifierTask for FailingTask {
    type Output = ();

    fn name(&self) -> &str {
        "failing"
    }

    fn run(self, _library: &mut dyn ClassifierLibrary, _cancel: &CancelToken) -> Result<()> {
        Err(ClassqError::Library("matrix dimensions must agree".to_string()))
    }
}

pub(crate) struct PanickingTask;

impl ClassifierTask for PanickingTask {
    type Output = ();

    fn name(&self) -> &str {
        "panicking"
    }

    fn run(self, _library: &mut dyn ClassifierLibrary, _cancel: &CancelToken) -> Result<()> {
        panic!("native layer crashed")
    }
}
