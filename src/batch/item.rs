// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! One event file of a batch and its progress

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use crate::{ClassqError, Result};

/// Progress of a batch item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    #[default]
    Pending,
    Importing,
    Transcoding,
    Classifying,
    Exporting,
    CleaningUp,
    Done,
    Failed,
    Stopped,
}

impl BatchStatus {
    /// Text shown in the status column
    pub fn label(self) -> &'static str {
        match self {
            BatchStatus::Pending => "",
            BatchStatus::Importing => "Importing…",
            BatchStatus::Transcoding => "Transcoding…",
            BatchStatus::Classifying => "Classifying…",
            BatchStatus::Exporting => "Export…",
            BatchStatus::CleaningUp => "Cleanup…",
            BatchStatus::Done => "Done",
            BatchStatus::Failed => "Failed",
            BatchStatus::Stopped => "Stopped",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, BatchStatus::Done | BatchStatus::Failed | BatchStatus::Stopped)
    }

    fn rank(self) -> u8 {
        match self {
            BatchStatus::Pending => 0,
            BatchStatus::Importing => 1,
            BatchStatus::Transcoding => 2,
            BatchStatus::Classifying => 3,
            BatchStatus::Exporting => 4,
            BatchStatus::CleaningUp => 5,
            BatchStatus::Done | BatchStatus::Failed | BatchStatus::Stopped => 6,
        }
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BatchStatus::Pending => f.write_str("Pending"),
            other => f.write_str(other.label()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchItem {
    /// Event XML file
    pub source: PathBuf,
    pub status: BatchStatus,
    /// Events per class index, 0 being Unknown
    pub class_totals: BTreeMap<usize, u64>,
    /// Why the item failed or stopped
    pub message: Option<String>,
}

impl BatchItem {
    pub fn new(source: PathBuf) -> Self {
        Self {
            source,
            status: BatchStatus::Pending,
            class_totals: BTreeMap::new(),
            message: None,
        }
    }

    pub fn is_done(&self) -> bool {
        self.status == BatchStatus::Done
    }

    /// Reset to Pending for a new run
    pub fn begin_run(&mut self) {
        self.status = BatchStatus::Pending;
        self.class_totals.clear();
        self.message = None;
    }

    /// Move forward to `next`
    ///
    /// Stages only move forward within a run. Failed and Stopped may follow
    /// any non-terminal status; nothing follows a terminal one.
    pub fn advance(&mut self, next: BatchStatus) -> Result<()> {
        let allowed = !self.status.is_terminal()
            && (matches!(next, BatchStatus::Failed | BatchStatus::Stopped) || next.rank() > self.status.rank());
        if !allowed {
            return Err(ClassqError::InvalidTransition {
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        self.status = next;
        Ok(())
    }

    pub fn total_events(&self) -> u64 {
        self.class_totals.values().sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stages_move_forward_only() {
        let mut item = BatchItem::new(PathBuf::from("d1.xml"));
        item.advance(BatchStatus::Importing).unwrap();
        item.advance(BatchStatus::Classifying).unwrap();
        assert!(item.advance(BatchStatus::Transcoding).is_err());
        assert!(item.advance(BatchStatus::Classifying).is_err());
        assert_eq!(item.status, BatchStatus::Classifying);

        item.advance(BatchStatus::Done).unwrap();
        assert!(item.advance(BatchStatus::Failed).is_err());
    }

    #[test]
    fn test_failure_follows_any_stage() {
        for stage in [BatchStatus::Pending, BatchStatus::Importing, BatchStatus::CleaningUp] {
            let mut item = BatchItem::new(PathBuf::from("d1.xml"));
            item.status = stage;
            item.advance(BatchStatus::Stopped).unwrap();
        }
    }

    #[test]
    fn test_begin_run_resets() {
        let mut item = BatchItem::new(PathBuf::from("d1.xml"));
        item.advance(BatchStatus::Failed).unwrap();
        item.class_totals.insert(1, 4);
        item.message = Some("boom".to_string());

        item.begin_run();
        assert_eq!(item.status, BatchStatus::Pending);
        assert_eq!(item.total_events(), 0);
        item.advance(BatchStatus::Importing).unwrap();
    }

    #[test]
    fn test_labels() {
        assert_eq!(BatchStatus::Exporting.label(), "Export…");
        assert_eq!(BatchStatus::Pending.label(), "");
        assert_eq!(BatchStatus::Pending.to_string(), "Pending");
        assert_eq!(serde_json::to_string(&BatchStatus::CleaningUp).unwrap(), "\"cleaning_up\"");
    }
}
