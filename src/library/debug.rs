// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! Debug classifier backend
//!
//! Stands in for the native library when it is not loaded. Every call is
//! written to the classifier log; results are deterministic and empty of
//! any real classification (all events are assigned to Unknown). Collected
//! classes and training libraries are kept in a small JSON catalog under the
//! database root so separate runs see each other's models.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::debug;

use super::{
    ClassModel, ClassifierLibrary, ColorSpace, KillSwitch, RunTestOutput, RunTestRequest,
    TestClassOutput, TestClassRequest, TrainRequest, TrainingModel,
};
use crate::{ClassqError, Result};

/// Kill flags shared between the library and its cancellers
#[derive(Debug, Default)]
pub struct DebugKillSwitch {
    raised: Mutex<HashSet<String>>,
}

impl DebugKillSwitch {
    pub fn is_raised(&self, signal: &str) -> bool {
        self.raised.lock().map(|r| r.contains(signal)).unwrap_or(false)
    }
}

impl KillSwitch for DebugKillSwitch {
    fn set_kill(&self, signal: &str, kill: bool) {
        if let Ok(mut raised) = self.raised.lock() {
            if kill {
                raised.insert(signal.to_string());
            } else {
                raised.remove(signal);
            }
        }
    }
}

/// Catalog file kept under each database root
pub const CATALOG_FILE: &str = "debug_catalog.json";

#[derive(Debug, Default, Serialize, Deserialize)]
struct Catalog {
    #[serde(default)]
    classes: Vec<ClassModel>,
    #[serde(default)]
    trainings: Vec<TrainingModel>,
}

/// Classifier backend that only logs
pub struct DebugLibrary {
    log: Option<File>,
    kill: Arc<DebugKillSwitch>,
    classes: BTreeMap<String, ClassModel>,
    trainings: BTreeMap<String, TrainingModel>,
    collected_tests: HashSet<PathBuf>,
    loaded_roots: HashSet<PathBuf>,
}

impl DebugLibrary {
    pub fn new() -> Self {
        Self {
            log: None,
            kill: Arc::new(DebugKillSwitch::default()),
            classes: BTreeMap::new(),
            trainings: BTreeMap::new(),
            collected_tests: HashSet::new(),
            loaded_roots: HashSet::new(),
        }
    }

    /// Merge the catalog of `root` into memory, once per root
    fn load_catalog(&mut self, root: &Path) -> Result<()> {
        if !self.loaded_roots.insert(root.to_path_buf()) {
            return Ok(());
        }
        let path = root.join(CATALOG_FILE);
        if !path.exists() {
            return Ok(());
        }
        let catalog: Catalog = serde_json::from_str(&std::fs::read_to_string(&path)?)?;
        for class in catalog.classes {
            self.classes.entry(class.name.clone()).or_insert(class);
        }
        for training in catalog.trainings {
            self.trainings.entry(training.name.clone()).or_insert(training);
        }
        Ok(())
    }

    fn save_catalog(&self, root: &Path) -> Result<()> {
        let catalog = Catalog {
            classes: self.classes.values().filter(|c| c.database_root == root).cloned().collect(),
            trainings: self.trainings.values().filter(|t| t.database_root == root).cloned().collect(),
        };
        std::fs::create_dir_all(root)?;
        std::fs::write(root.join(CATALOG_FILE), serde_json::to_string_pretty(&catalog)?)?;
        Ok(())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.log.is_none() {
            return Err(ClassqError::Library("library not initialized".to_string()));
        }
        Ok(())
    }

    fn write_log(&mut self, line: &str) -> Result<()> {
        debug!("debug classifier: {}", line);
        if let Some(log) = self.log.as_mut() {
            writeln!(log, "{} {}", chrono::Local::now().format("%H:%M:%S"), line)?;
        }
        Ok(())
    }

    fn check_kill(&self, signal: &str) -> Result<()> {
        if self.kill.is_raised(signal) {
            return Err(ClassqError::Cancelled(signal.to_string()));
        }
        Ok(())
    }
}

impl Default for DebugLibrary {
    fn default() -> Self {
        Self::new()
    }
}

impl ClassifierLibrary for DebugLibrary {
    fn init(&mut self, log_path: &Path, platform_flag: i32) -> Result<()> {
        if let Some(parent) = log_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(log_path)?;
        self.log = Some(file);
        self.write_log(&format!("init platform={}", platform_flag))
    }

    fn close(&mut self) -> Result<()> {
        self.write_log("close")?;
        self.log = None;
        Ok(())
    }

    fn kill_switch(&self) -> Arc<dyn KillSwitch> {
        self.kill.clone()
    }

    fn collect_class(&mut self, signal: &str, class: &ClassModel) -> Result<()> {
        self.ensure_open()?;
        self.check_kill(signal)?;
        self.write_log(&format!(
            "collect_class {} from {}",
            class.name,
            class.squared_image_dir.display()
        ))?;
        self.load_catalog(&class.database_root)?;
        self.classes.insert(class.name.clone(), class.clone());
        self.save_catalog(&class.database_root)
    }

    fn delete_class(
        &mut self,
        signal: &str,
        class_name: &str,
        database_root: &Path,
        _color_space: ColorSpace,
    ) -> Result<()> {
        self.ensure_open()?;
        self.check_kill(signal)?;
        self.load_catalog(database_root)?;
        self.write_log(&format!("delete_class {}", class_name))?;
        self.classes.remove(class_name);
        self.save_catalog(database_root)
    }

    fn train_classes(&mut self, signal: &str, request: &TrainRequest) -> Result<()> {
        self.ensure_open()?;
        self.load_catalog(&request.database_root)?;
        for class in &request.classes {
            self.check_kill(signal)?;
            if !self.classes.contains_key(class) {
                return Err(ClassqError::Library(format!("class {} has not been collected", class)));
            }
        }
        self.write_log(&format!("train_classes {} = {}", request.alias, request.classes.join(",")))?;
        self.trainings.insert(
            request.alias.clone(),
            TrainingModel {
                name: request.alias.clone(),
                classes: request.classes.clone(),
                description: request.description.clone(),
                color_space: request.color_space,
                database_root: request.database_root.clone(),
            },
        );
        self.save_catalog(&request.database_root)
    }

    fn collect_tests(
        &mut self,
        signal: &str,
        test_dir: &Path,
        _database_root: &Path,
        _color_space: ColorSpace,
    ) -> Result<()> {
        self.ensure_open()?;
        self.check_kill(signal)?;
        self.write_log(&format!("collect_tests {}", test_dir.display()))?;
        self.collected_tests.insert(test_dir.to_path_buf());
        Ok(())
    }

    fn run_test(&mut self, signal: &str, request: &RunTestRequest) -> Result<RunTestOutput> {
        self.ensure_open()?;
        let test_dir = self
            .collected_tests
            .iter()
            .find(|d| d.file_name().map(|n| n.to_string_lossy() == request.test_dir_name).unwrap_or(false))
            .cloned()
            .ok_or_else(|| ClassqError::Library(format!("tests {} not collected", request.test_dir_name)))?;

        let mut names: Vec<String> = std::fs::read_dir(&test_dir)?
            .filter_map(|e| e.ok())
            .filter(|e| e.path().is_file())
            .filter_map(|e| e.path().file_stem().map(|s| s.to_string_lossy().to_string()))
            .collect();
        names.sort();

        let mut output = RunTestOutput::default();
        for name in names {
            self.check_kill(signal)?;
            output.event_ids.push(name);
            output.majority_winner.push(0);
            output.probability_winner.push(0);
            output.max_probability_winner.push(0);
            output.probability.push(0.0);
        }

        self.write_log(&format!(
            "run_test {} against {} ({} events)",
            request.test_dir_name,
            request.training_alias,
            output.event_ids.len()
        ))?;
        Ok(output)
    }

    fn test_class(&mut self, signal: &str, request: &TestClassRequest) -> Result<TestClassOutput> {
        self.ensure_open()?;
        self.check_kill(signal)?;
        self.load_catalog(&request.database_root)?;
        let training = self
            .trainings
            .get(&request.training_alias)
            .ok_or_else(|| ClassqError::Library(format!("unknown training library {}", request.training_alias)))?;
        let index = training
            .classes
            .iter()
            .position(|c| c == &request.test_class_name)
            .map(|i| i as i32 + 1)
            .unwrap_or(0);
        let line = format!("test_class {} against {}", request.test_class_name, request.training_alias);
        self.write_log(&line)?;
        Ok(TestClassOutput {
            event_files: vec![format!("{}_sample", request.test_class_name)],
            class_index: vec![index],
            probability: vec![1.0],
        })
    }

    fn get_collected_classes(&mut self, database_root: &Path) -> Result<Vec<ClassModel>> {
        self.ensure_open()?;
        self.load_catalog(database_root)?;
        Ok(self
            .classes
            .values()
            .filter(|c| c.database_root == database_root)
            .cloned()
            .collect())
    }

    fn get_training_classes(&mut self, database_root: &Path) -> Result<Vec<TrainingModel>> {
        self.ensure_open()?;
        self.load_catalog(database_root)?;
        Ok(self
            .trainings
            .values()
            .filter(|t| t.database_root == database_root)
            .cloned()
            .collect())
    }
}
