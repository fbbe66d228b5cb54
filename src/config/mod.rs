// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! Configuration management for classq

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::library::VotingMethod;

/// Main application configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct AppConfig {
    /// Native classifier settings
    #[serde(default)]
    pub classifier: ClassifierConfig,

    /// Batch run settings
    #[serde(default)]
    pub batch: BatchConfig,

    /// External commands for the batch stages
    #[serde(default)]
    pub stages: StageCommands,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ClassifierConfig {
    /// Scratch directory for the native log and downloaded videos
    #[serde(default = "default_scratch_dir")]
    pub scratch_dir: String,
    /// Root of the classifier's class/training database
    #[serde(default = "default_database_root")]
    pub database_root: String,
    /// Use the logging debug backend instead of the native library
    #[serde(default = "default_true")]
    pub debug_library: bool,
    /// Seconds the idle worker waits before re-checking for shutdown
    #[serde(default = "default_idle_poll")]
    pub idle_poll_secs: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct BatchConfig {
    /// Directory receiving exported results
    #[serde(default = "default_output_dir")]
    pub output_dir: String,
    /// Seconds between progress checks while a classify task runs
    #[serde(default = "default_batch_poll")]
    pub poll_secs: u64,
    /// Minimum probability for a class assignment (0.0 - 1.0)
    #[serde(default = "default_min_prob")]
    pub min_prob_threshold: f32,
    #[serde(default)]
    pub voting_method: VotingMethod,
    /// Training library used when none is given on the command line
    #[serde(default)]
    pub training_model: Option<String>,
}

/// A program and its argument template
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct CommandTemplate {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct StageCommands {
    #[serde(default)]
    pub import: Option<CommandTemplate>,
    #[serde(default)]
    pub transcode: Option<CommandTemplate>,
    #[serde(default)]
    pub export: Option<CommandTemplate>,
    /// Optional; the transcoded frame directory is removed when unset
    #[serde(default)]
    pub cleanup: Option<CommandTemplate>,
}

// Default value functions
fn default_true() -> bool { true }
fn default_idle_poll() -> u64 { 2 }
fn default_batch_poll() -> u64 { 3 }
fn default_min_prob() -> f32 { 0.8 }
fn default_database_root() -> String { "classifier_db".to_string() }
fn default_output_dir() -> String { "batch_output".to_string() }

fn default_scratch_dir() -> String {
    std::env::temp_dir().join("classq").to_string_lossy().to_string()
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            classifier: ClassifierConfig::default(),
            batch: BatchConfig::default(),
            stages: StageCommands::default(),
        }
    }
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            scratch_dir: default_scratch_dir(),
            database_root: default_database_root(),
            debug_library: true,
            idle_poll_secs: default_idle_poll(),
        }
    }
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            poll_secs: default_batch_poll(),
            min_prob_threshold: default_min_prob(),
            voting_method: VotingMethod::default(),
            training_model: None,
        }
    }
}

impl ClassifierConfig {
    /// Path of the log file written by the native library
    ///
    /// One log per user so that several sessions sharing a scratch
    /// directory do not interleave their output.
    pub fn log_path(&self) -> PathBuf {
        Path::new(&self.scratch_dir).join(format!("classifier_{}.log", current_user()))
    }

    pub fn idle_poll(&self) -> Duration {
        Duration::from_secs(self.idle_poll_secs.max(1))
    }
}

impl BatchConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_secs.max(1))
    }
}

/// Name of the user running this process
pub fn current_user() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .ok()
        .filter(|u| !u.trim().is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Platform flag passed to the native library at init: 1 on macOS, 0 elsewhere
pub fn platform_flag() -> i32 {
    if cfg!(target_os = "macos") { 1 } else { 0 }
}

impl AppConfig {
    /// Load configuration from a JSON file
    pub fn load(path: &Path) -> crate::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Self = serde_json::from_str(&content)
                .map_err(|e| crate::ClassqError::Config(format!("Failed to parse config: {}", e)))?;
            config.validate()?;
            Ok(config)
        } else {
            tracing::info!("Config file not found at {:?}, using defaults", path);
            Ok(Self::default())
        }
    }

    /// Save configuration to a JSON file
    pub fn save(&self, path: &Path) -> crate::Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Check values that serde cannot
    pub fn validate(&self) -> crate::Result<()> {
        let threshold = self.batch.min_prob_threshold;
        if !(0.0..=1.0).contains(&threshold) {
            return Err(crate::ClassqError::Config(format!(
                "min_prob_threshold must be between 0 and 1, got {}",
                threshold
            )));
        }
        if self.classifier.scratch_dir.trim().is_empty() {
            return Err(crate::ClassqError::Config("scratch_dir is empty".to_string()));
        }
        Ok(())
    }
}
