// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! Run the classifier over a directory of event images

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use tracing::info;

use crate::library::{ClassifierLibrary, RunTestOutput, RunTestRequest, TrainingModel, VotingMethod};
use crate::queue::task::{CancelToken, ClassifierTask};
use crate::{ClassqError, Result};

/// Predicted class of one event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventPrediction {
    pub event_id: String,
    /// 0 is Unknown, n is the n-th training class
    pub class_index: usize,
    pub class_name: String,
    pub probability: f32,
}

/// Outcome of a classifier run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationReport {
    pub training_model: String,
    pub voting_method: VotingMethod,
    pub min_prob_threshold: f32,
    pub predictions: Vec<EventPrediction>,
    /// Number of events predicted per class index
    pub class_totals: BTreeMap<usize, u64>,
    /// `confusion[predicted][actual]`, for events whose class is known
    pub confusion: Vec<Vec<u64>>,
}

impl ClassificationReport {
    /// Build the report from raw winners
    ///
    /// `actual` maps event ids to the class an operator already assigned,
    /// when there is one.
    pub fn from_output(
        training: &TrainingModel,
        method: VotingMethod,
        min_prob_threshold: f32,
        output: &RunTestOutput,
        actual: &HashMap<String, String>,
    ) -> Result<Self> {
        let n = output.event_ids.len();
        let winners = match method {
            VotingMethod::Majority => &output.majority_winner,
            VotingMethod::Probability => &output.probability_winner,
            VotingMethod::MaxProbability => &output.max_probability_winner,
        };
        if winners.len() != n || output.probability.len() != n {
            return Err(ClassqError::Library(format!(
                "run_test returned {} events but {} winners and {} probabilities",
                n,
                winners.len(),
                output.probability.len()
            )));
        }

        let columns = training.num_classes() + 1;
        let mut confusion = vec![vec![0u64; columns]; columns];
        let mut class_totals = BTreeMap::new();
        let mut predictions = Vec::with_capacity(n);

        for ((event_id, &winner), &probability) in output.event_ids.iter().zip(winners).zip(&output.probability) {
            let class_index = usize::try_from(winner)
                .ok()
                .filter(|&w| w >= 1 && w < columns)
                .unwrap_or(0);
            *class_totals.entry(class_index).or_insert(0) += 1;

            if let Some(actual_name) = actual.get(event_id) {
                confusion[class_index][training.class_index(actual_name)] += 1;
            }

            predictions.push(EventPrediction {
                event_id: event_id.clone(),
                class_index,
                class_name: training.class_label(class_index).to_string(),
                probability,
            });
        }

        Ok(Self {
            training_model: training.name.clone(),
            voting_method: method,
            min_prob_threshold,
            predictions,
            class_totals,
            confusion,
        })
    }
}

/// Collect the test images of a directory, then classify them
pub struct RunClassifierTask {
    name: String,
    pub training: TrainingModel,
    pub test_dir: PathBuf,
    pub min_prob_threshold: f32,
    pub voting_method: VotingMethod,
    pub actual_classes: HashMap<String, String>,
}

impl RunClassifierTask {
    pub fn new(training: TrainingModel, test_dir: PathBuf, min_prob_threshold: f32, voting_method: VotingMethod) -> Self {
        Self {
            name: format!("classify {}", training.name),
            training,
            test_dir,
            min_prob_threshold,
            voting_method,
            actual_classes: HashMap::new(),
        }
    }

    pub fn with_actual_classes(mut self, actual: HashMap<String, String>) -> Self {
        self.actual_classes = actual;
        self
    }
}

impl ClassifierTask for RunClassifierTask {
    type Output = ClassificationReport;

    fn name(&self) -> &str {
        &self.name
    }

    fn run(self, library: &mut dyn ClassifierLibrary, cancel: &CancelToken) -> Result<ClassificationReport> {
        let test_dir_name = self
            .test_dir
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .ok_or_else(|| ClassqError::InvalidSource(format!("bad test directory {:?}", self.test_dir)))?;
        std::fs::create_dir_all(&self.test_dir)?;

        cancel.check()?;
        library.collect_tests(
            cancel.signal(),
            &self.test_dir,
            &self.training.database_root,
            self.training.color_space,
        )?;

        cancel.check()?;
        let request = RunTestRequest {
            test_dir_name,
            training_alias: self.training.name.clone(),
            min_prob_threshold: self.min_prob_threshold,
            database_root: self.training.database_root.clone(),
            color_space: self.training.color_space,
        };
        let output = library.run_test(cancel.signal(), &request)?;

        cancel.check()?;
        let report = ClassificationReport::from_output(
            &self.training,
            self.voting_method,
            self.min_prob_threshold,
            &output,
            &self.actual_classes,
        )?;
        info!(
            "Classified {} events with {} ({:?})",
            report.predictions.len(),
            self.training.name,
            self.voting_method
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::library::ColorSpace;
    use crate::queue::task::TaskOutcome;
    use crate::queue::testing::{options, ScriptedLibrary};
    use crate::queue::TaskQueue;
    use std::time::Duration;

    fn training(root: &std::path::Path) -> TrainingModel {
        TrainingModel {
            name: "midwater".to_string(),
            classes: vec!["ctenophore".to_string(), "siphonophore".to_string()],
            description: String::new(),
            color_space: ColorSpace::Ycbcr,
            database_root: root.to_path_buf(),
        }
    }

    #[test]
    fn test_voting_method_selects_winners() {
        let output = RunTestOutput {
            event_ids: vec!["e1".to_string(), "e2".to_string()],
            majority_winner: vec![1, 1],
            probability_winner: vec![2, 0],
            max_probability_winner: vec![2, 2],
            probability: vec![0.9, 0.4],
        };
        let model = training(std::path::Path::new("/db"));
        let none = HashMap::new();

        let majority = ClassificationReport::from_output(&model, VotingMethod::Majority, 0.8, &output, &none).unwrap();
        assert_eq!(majority.class_totals, BTreeMap::from([(1, 2)]));

        let probability = ClassificationReport::from_output(&model, VotingMethod::Probability, 0.8, &output, &none).unwrap();
        assert_eq!(probability.class_totals, BTreeMap::from([(0, 1), (2, 1)]));
        assert_eq!(probability.predictions[1].class_name, "Unknown");
        assert_eq!(probability.predictions[0].class_name, "siphonophore");
    }

    #[test]
    fn test_confusion_matrix_uses_known_classes() {
        let output = RunTestOutput {
            event_ids: vec!["e1".to_string(), "e2".to_string(), "e3".to_string()],
            majority_winner: vec![1, 2, 1],
            probability_winner: vec![0; 3],
            max_probability_winner: vec![0; 3],
            probability: vec![0.9; 3],
        };
        let actual = HashMap::from([
            ("e1".to_string(), "ctenophore".to_string()),
            ("e2".to_string(), "ctenophore".to_string()),
        ]);
        let model = training(std::path::Path::new("/db"));
        let report = ClassificationReport::from_output(&model, VotingMethod::Majority, 0.8, &output, &actual).unwrap();

        assert_eq!(report.confusion[1][1], 1);
        assert_eq!(report.confusion[2][1], 1);
        assert_eq!(report.confusion.iter().flatten().sum::<u64>(), 2);
    }

    #[test]
    fn test_mismatched_arrays_rejected() {
        let output = RunTestOutput {
            event_ids: vec!["e1".to_string()],
            ..RunTestOutput::default()
        };
        let model = training(std::path::Path::new("/db"));
        let err = ClassificationReport::from_output(&model, VotingMethod::Majority, 0.8, &output, &HashMap::new());
        assert!(matches!(err, Err(ClassqError::Library(_))));
    }

    #[tokio::test]
    async fn test_task_collects_then_runs() {
        let dir = tempfile::tempdir().unwrap();
        let library = ScriptedLibrary::new(Duration::ZERO).with_winners(vec![1, 2, 2, 0, 7]);
        let calls_log = std::sync::Arc::clone(&library.calls_log);
        let queue = TaskQueue::start(library, options()).unwrap();

        let test_dir = dir.path().join("frames").join("testimages_frames");
        let task = RunClassifierTask::new(training(dir.path()), test_dir.clone(), 0.8, VotingMethod::Majority);
        let handle = queue.submit(task).unwrap();

        assert_eq!(handle.wait_timeout(Duration::from_secs(10)).await, Some(TaskOutcome::Succeeded));
        let report = handle.take_output().unwrap();
        assert_eq!(report.class_totals, BTreeMap::from([(0, 2), (1, 1), (2, 2)]));
        assert!(test_dir.is_dir());

        let calls = calls_log.calls();
        assert!(calls[0].starts_with("collect_tests:"));
        assert_eq!(calls[1], "run_test:testimages_frames");
    }
}
