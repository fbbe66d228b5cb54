// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! Error types for classq

use thiserror::Error;

/// Result type alias for classq operations
pub type Result<T> = std::result::Result<T, ClassqError>;

/// classq error types
#[derive(Error, Debug)]
pub enum ClassqError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("File system error: {0}")]
    FileSystem(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A native classifier call reported an error
    #[error("Classifier library error: {0}")]
    Library(String),

    /// The native classifier library could not be opened
    #[error("Classifier library unavailable: {0}")]
    LibraryUnavailable(String),

    /// The work was stopped through its cancel token
    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("Task queue has been shut down")]
    QueueShutDown,

    #[error("Invalid task name: {0:?}")]
    InvalidTaskName(String),

    #[error("Invalid image source: {0}")]
    InvalidSource(String),

    #[error("Stage '{stage}' failed: {reason}")]
    Stage { stage: &'static str, reason: String },

    #[error("Invalid status transition from {from:?} to {to:?}")]
    InvalidTransition { from: String, to: String },

    #[error("Batch error: {0}")]
    Batch(String),
}

impl ClassqError {
    /// True when this error only reports a cooperative stop
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ClassqError::Cancelled(_))
    }
}
