// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! Tasks submitted to the classifier queue
//!
//! Each task wraps one or more native calls. Nothing here may be called
//! outside the queue's worker; producers build a task and submit it.

pub mod classes;
pub mod classify;

pub use classes::{
    CollectClassTask, DeleteClassTask, LoadModelsTask, LoadedModels, TestClassReport, TestClassTask,
    TrainClassesTask,
};
pub use classify::{ClassificationReport, EventPrediction, RunClassifierTask};
