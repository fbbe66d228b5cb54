// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! Call interface of the native image classifier
//!
//! The classifier is a blocking, stateful, non-reentrant library. Every
//! method of [`ClassifierLibrary`] is meant to be called from the queue's
//! worker thread only. The single exception is the kill flag, reached
//! through the thread-safe [`KillSwitch`] handed out at construction.

pub mod debug;

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::Result;

pub use debug::DebugLibrary;

/// Label of the class assigned when no training class wins
pub const UNKNOWN_CLASS_LABEL: &str = "Unknown";

/// Color space features are computed in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ColorSpace {
    #[default]
    Rgb,
    Ycbcr,
    Gray,
}

/// Rule used to pick the winning class of an event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum VotingMethod {
    /// Class chosen for the majority of the event's frames
    #[default]
    Majority,
    /// Class of highest probability in at least 30% of the frames
    Probability,
    /// Class of highest single-frame probability
    MaxProbability,
}

impl std::str::FromStr for VotingMethod {
    type Err = crate::ClassqError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "majority" => Ok(Self::Majority),
            "probability" => Ok(Self::Probability),
            "max_probability" | "maxprobability" => Ok(Self::MaxProbability),
            other => Err(crate::ClassqError::Config(format!("unknown voting method: {}", other))),
        }
    }
}

/// A collected class: a named set of example images
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassModel {
    pub name: String,
    /// Directory of the raw images the class was built from
    pub raw_image_dir: PathBuf,
    /// Directory of the squared images fed to feature extraction
    pub squared_image_dir: PathBuf,
    /// Knowledge-base concept this class stands for
    pub vars_class_name: String,
    pub description: String,
    pub color_space: ColorSpace,
    pub database_root: PathBuf,
}

/// A training library: two or more collected classes trained together
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingModel {
    pub name: String,
    /// Member class names, in class-index order
    pub classes: Vec<String>,
    pub description: String,
    pub color_space: ColorSpace,
    pub database_root: PathBuf,
}

impl TrainingModel {
    pub fn num_classes(&self) -> usize {
        self.classes.len()
    }

    /// Name of a class by result index, where 0 is the Unknown class
    /// and `n` is the n-th member class
    pub fn class_label(&self, index: usize) -> &str {
        match index {
            0 => UNKNOWN_CLASS_LABEL,
            n => self.classes.get(n - 1).map(String::as_str).unwrap_or(UNKNOWN_CLASS_LABEL),
        }
    }

    /// Inverse of [`TrainingModel::class_label`]
    pub fn class_index(&self, name: &str) -> usize {
        self.classes
            .iter()
            .position(|c| c == name)
            .map(|i| i + 1)
            .unwrap_or(0)
    }
}

/// Arguments of a `train_classes` call
#[derive(Debug, Clone)]
pub struct TrainRequest {
    pub classes: Vec<String>,
    pub alias: String,
    pub database_root: PathBuf,
    pub description: String,
    pub color_space: ColorSpace,
}

/// Arguments of a `run_test` call
#[derive(Debug, Clone)]
pub struct RunTestRequest {
    /// Name of the directory previously passed to `collect_tests`
    pub test_dir_name: String,
    pub training_alias: String,
    pub min_prob_threshold: f32,
    pub database_root: PathBuf,
    pub color_space: ColorSpace,
}

/// Arguments of a `test_class` call
#[derive(Debug, Clone)]
pub struct TestClassRequest {
    pub test_class_name: String,
    pub training_alias: String,
    pub min_prob_threshold: f32,
    pub database_root: PathBuf,
}

/// Per-event winners of a `run_test` call
///
/// Winner indexes are 1-based indexes into the training classes; any
/// value outside `1..=num_classes` means Unknown.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunTestOutput {
    pub event_ids: Vec<String>,
    pub majority_winner: Vec<i32>,
    pub probability_winner: Vec<i32>,
    pub max_probability_winner: Vec<i32>,
    pub probability: Vec<f32>,
}

/// Result of testing a class against a training library
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TestClassOutput {
    pub event_files: Vec<String>,
    pub class_index: Vec<i32>,
    pub probability: Vec<f32>,
}

/// Side channel used to stop a running native call
///
/// The native code polls the named flag and returns early once it is set.
pub trait KillSwitch: Send + Sync {
    fn set_kill(&self, signal: &str, kill: bool);
}

/// The native classifier library
pub trait ClassifierLibrary: Send {
    /// Open the library; must precede any other call
    fn init(&mut self, log_path: &Path, platform_flag: i32) -> Result<()>;

    /// Release the library; `init` may be called again afterwards
    fn close(&mut self) -> Result<()>;

    /// Thread-safe handle to the kill flags of this library
    fn kill_switch(&self) -> Arc<dyn KillSwitch>;

    fn collect_class(&mut self, signal: &str, class: &ClassModel) -> Result<()>;

    fn delete_class(
        &mut self,
        signal: &str,
        class_name: &str,
        database_root: &Path,
        color_space: ColorSpace,
    ) -> Result<()>;

    fn train_classes(&mut self, signal: &str, request: &TrainRequest) -> Result<()>;

    fn collect_tests(
        &mut self,
        signal: &str,
        test_dir: &Path,
        database_root: &Path,
        color_space: ColorSpace,
    ) -> Result<()>;

    fn run_test(&mut self, signal: &str, request: &RunTestRequest) -> Result<RunTestOutput>;

    fn test_class(&mut self, signal: &str, request: &TestClassRequest) -> Result<TestClassOutput>;

    fn get_collected_classes(&mut self, database_root: &Path) -> Result<Vec<ClassModel>>;

    fn get_training_classes(&mut self, database_root: &Path) -> Result<Vec<TrainingModel>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model() -> TrainingModel {
        TrainingModel {
            name: "benthic".to_string(),
            classes: vec!["rathbunaster".to_string(), "otherfish".to_string()],
            description: String::new(),
            color_space: ColorSpace::Rgb,
            database_root: PathBuf::from("/db"),
        }
    }

    #[test]
    fn test_class_label_and_index_agree() {
        let m = model();
        assert_eq!(m.class_label(0), UNKNOWN_CLASS_LABEL);
        assert_eq!(m.class_label(2), "otherfish");
        assert_eq!(m.class_label(9), UNKNOWN_CLASS_LABEL);
        assert_eq!(m.class_index("rathbunaster"), 1);
        assert_eq!(m.class_index("jelly"), 0);
    }

    #[test]
    fn test_voting_method_parse() {
        assert_eq!("max-probability".parse::<VotingMethod>().unwrap(), VotingMethod::MaxProbability);
        assert_eq!("Majority".parse::<VotingMethod>().unwrap(), VotingMethod::Majority);
        assert!("plurality".parse::<VotingMethod>().is_err());
    }
}
