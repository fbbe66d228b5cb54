// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! Ledger of finished batch items

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use crate::batch::item::{BatchItem, BatchStatus};
use crate::Result;

/// File name of the ledger inside a batch output directory
pub const RESULTS_FILE: &str = "results.jsonl";

/// One finished item
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultEntry {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub source: PathBuf,
    pub status: BatchStatus,
    pub training_model: String,
    /// Class label to event count
    pub class_totals: BTreeMap<String, u64>,
    pub message: Option<String>,
}

/// Append-only JSON-lines file of batch results
pub struct ResultsLedger {
    path: PathBuf,
}

impl ResultsLedger {
    /// Ledger stored in `output_dir`
    pub fn in_dir(output_dir: &Path) -> Self {
        Self {
            path: output_dir.join(RESULTS_FILE),
        }
    }

    pub fn append(&self, entry: &ResultEntry) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;

        let json = serde_json::to_string(entry)?;
        writeln!(file, "{}", json)?;

        Ok(())
    }

    /// Read all entries, skipping lines that do not parse
    pub fn read_all(&self) -> Result<Vec<ResultEntry>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }

        let reader = BufReader::new(File::open(&self.path)?);

        let mut entries = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(&line) {
                Ok(entry) => entries.push(entry),
                Err(e) => {
                    tracing::warn!("Failed to parse results entry: {}", e);
                }
            }
        }

        Ok(entries)
    }

    /// The most recent `count` entries, newest first
    pub fn get_recent(&self, count: usize) -> Result<Vec<ResultEntry>> {
        let mut entries = self.read_all()?;
        entries.reverse();
        entries.truncate(count);
        Ok(entries)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Snapshot an item into a ledger entry, naming classes through `label`
pub fn create_entry<F>(item: &BatchItem, training_model: &str, message: Option<String>, label: F) -> ResultEntry
where
    F: Fn(usize) -> String,
{
    ResultEntry {
        id: uuid::Uuid::new_v4().to_string(),
        timestamp: Utc::now(),
        source: item.source.clone(),
        status: item.status,
        training_model: training_model.to_string(),
        class_totals: item
            .class_totals
            .iter()
            .map(|(&index, &count)| (label(index), count))
            .collect(),
        message,
    }
}
