// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! classq: serialized access to a single-threaded native image classifier
//!
//! A dedicated worker thread owns the classifier library handle and runs
//! submitted tasks one at a time. The batch runner drives event files through
//! import, transcode, classify, export and cleanup on top of that queue.

pub mod batch;
pub mod config;
pub mod error;
pub mod library;
pub mod logtail;
pub mod queue;
pub mod results;
pub mod tasks;

pub use config::AppConfig;
pub use error::{ClassqError, Result};
pub use queue::task::{CancelToken, ClassifierTask, TaskHandle, TaskOutcome, TaskState};
pub use queue::TaskQueue;
