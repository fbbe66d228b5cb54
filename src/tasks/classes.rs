// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! Class and training library maintenance

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::library::{
    ClassModel, ClassifierLibrary, ColorSpace, TestClassRequest, TrainRequest, TrainingModel,
};
use crate::queue::task::{CancelToken, ClassifierTask};
use crate::{ClassqError, Result};

/// Build a class from a directory of example images
pub struct CollectClassTask {
    name: String,
    pub class: ClassModel,
}

impl CollectClassTask {
    pub fn new(class: ClassModel) -> Self {
        Self {
            name: format!("collect {}", class.name),
            class,
        }
    }
}

impl ClassifierTask for CollectClassTask {
    type Output = ();

    fn name(&self) -> &str {
        &self.name
    }

    fn run(self, library: &mut dyn ClassifierLibrary, cancel: &CancelToken) -> Result<()> {
        if !self.class.raw_image_dir.is_dir() {
            return Err(ClassqError::InvalidSource(format!(
                "class image directory {:?} does not exist",
                self.class.raw_image_dir
            )));
        }
        std::fs::create_dir_all(&self.class.squared_image_dir)?;
        library.collect_class(cancel.signal(), &self.class)?;
        info!("Collected class {}", self.class.name);
        Ok(())
    }
}

pub struct DeleteClassTask {
    name: String,
    pub class_name: String,
    pub database_root: PathBuf,
    pub color_space: ColorSpace,
}

impl DeleteClassTask {
    pub fn new(class_name: &str, database_root: &Path, color_space: ColorSpace) -> Self {
        Self {
            name: format!("delete {}", class_name),
            class_name: class_name.to_string(),
            database_root: database_root.to_path_buf(),
            color_space,
        }
    }
}

impl ClassifierTask for DeleteClassTask {
    type Output = ();

    fn name(&self) -> &str {
        &self.name
    }

    fn run(self, library: &mut dyn ClassifierLibrary, cancel: &CancelToken) -> Result<()> {
        library.delete_class(cancel.signal(), &self.class_name, &self.database_root, self.color_space)?;
        info!("Deleted class {}", self.class_name);
        Ok(())
    }
}

/// Train a library from collected classes
pub struct TrainClassesTask {
    name: String,
    pub request: TrainRequest,
}

impl TrainClassesTask {
    /// Fails unless at least two distinct classes are selected
    pub fn new(request: TrainRequest) -> Result<Self> {
        let mut distinct = request.classes.clone();
        distinct.sort();
        distinct.dedup();
        if distinct.len() < 2 {
            return Err(ClassqError::Config(format!(
                "training {} needs at least two classes, got {}",
                request.alias,
                distinct.len()
            )));
        }
        if request.alias.trim().is_empty() {
            return Err(ClassqError::Config("training library needs a name".to_string()));
        }
        Ok(Self {
            name: format!("train {}", request.alias),
            request,
        })
    }
}

impl ClassifierTask for TrainClassesTask {
    type Output = ();

    fn name(&self) -> &str {
        &self.name
    }

    fn run(self, library: &mut dyn ClassifierLibrary, cancel: &CancelToken) -> Result<()> {
        library.train_classes(cancel.signal(), &self.request)?;
        info!(
            "Trained {} from {} classes",
            self.request.alias,
            self.request.classes.len()
        );
        Ok(())
    }
}

/// How the images of one class scored against a training library
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestClassReport {
    pub test_class: String,
    pub training_model: String,
    pub total: u64,
    /// Events assigned to the tested class itself
    pub correct: u64,
    /// Events per assigned class label
    pub hits: BTreeMap<String, u64>,
}

impl TestClassReport {
    pub fn accuracy(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.correct as f64 / self.total as f64
    }
}

pub struct TestClassTask {
    name: String,
    pub training: TrainingModel,
    pub test_class: String,
    pub min_prob_threshold: f32,
}

impl TestClassTask {
    pub fn new(training: TrainingModel, test_class: &str, min_prob_threshold: f32) -> Self {
        Self {
            name: format!("test {}", test_class),
            training,
            test_class: test_class.to_string(),
            min_prob_threshold,
        }
    }
}

impl ClassifierTask for TestClassTask {
    type Output = TestClassReport;

    fn name(&self) -> &str {
        &self.name
    }

    fn run(self, library: &mut dyn ClassifierLibrary, cancel: &CancelToken) -> Result<TestClassReport> {
        let request = TestClassRequest {
            test_class_name: self.test_class.clone(),
            training_alias: self.training.name.clone(),
            min_prob_threshold: self.min_prob_threshold,
            database_root: self.training.database_root.clone(),
        };
        let output = library.test_class(cancel.signal(), &request)?;
        cancel.check()?;

        let mut hits = BTreeMap::new();
        let mut correct = 0;
        for &index in &output.class_index {
            let label = usize::try_from(index)
                .map(|i| self.training.class_label(i))
                .unwrap_or(crate::library::UNKNOWN_CLASS_LABEL);
            if label == self.test_class {
                correct += 1;
            }
            *hits.entry(label.to_string()).or_insert(0) += 1;
        }

        let report = TestClassReport {
            test_class: self.test_class,
            training_model: self.training.name,
            total: output.class_index.len() as u64,
            correct,
            hits,
        };
        info!(
            "Tested {} against {}: {}/{} correct",
            report.test_class, report.training_model, report.correct, report.total
        );
        Ok(report)
    }
}

/// Everything the classifier knows about under one database root
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoadedModels {
    pub classes: Vec<ClassModel>,
    pub trainings: Vec<TrainingModel>,
}

impl LoadedModels {
    pub fn training(&self, name: &str) -> Option<&TrainingModel> {
        self.trainings.iter().find(|t| t.name == name)
    }
}

pub struct LoadModelsTask {
    pub database_root: PathBuf,
}

impl LoadModelsTask {
    pub fn new(database_root: &Path) -> Self {
        Self {
            database_root: database_root.to_path_buf(),
        }
    }
}

impl ClassifierTask for LoadModelsTask {
    type Output = LoadedModels;

    fn name(&self) -> &str {
        "load models"
    }

    fn run(self, library: &mut dyn ClassifierLibrary, cancel: &CancelToken) -> Result<LoadedModels> {
        for sub in ["features/class", "training/class"] {
            let dir = self.database_root.join(sub);
            if !dir.exists() {
                debug!("Creating {:?}", dir);
                std::fs::create_dir_all(&dir)?;
            }
        }

        let classes = library.get_collected_classes(&self.database_root)?;
        cancel.check()?;
        let trainings = library.get_training_classes(&self.database_root)?;
        debug!(
            "Loaded {} classes and {} training libraries from {:?}",
            classes.len(),
            trainings.len(),
            self.database_root
        );
        Ok(LoadedModels { classes, trainings })
    }
}
