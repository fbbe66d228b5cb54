// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! Follow the native classifier's log file

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::watch;
use tracing::debug;

use crate::Result;

/// Read cursor over the classifier log
///
/// Only text appended after the reader was opened is returned.
pub struct LogReader {
    path: PathBuf,
    reader: BufReader<File>,
    partial: String,
}

impl LogReader {
    /// Open `path` (creating it if needed) with the cursor at end-of-file
    pub fn open_at_end(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new().create(true).append(true).read(true).open(path)?;
        let end = file.seek(SeekFrom::End(0))?;
        debug!("Following {:?} from offset {}", path, end);

        Ok(Self {
            path: path.to_path_buf(),
            reader: BufReader::new(file),
            partial: String::new(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Complete lines written since the last call
    ///
    /// A trailing line without a newline is held back until it is finished.
    pub fn read_new_lines(&mut self) -> Result<Vec<String>> {
        let mut lines = Vec::new();
        loop {
            let mut chunk = String::new();
            let n = self.reader.read_line(&mut chunk)?;
            if n == 0 {
                break;
            }
            self.partial.push_str(&chunk);
            if self.partial.ends_with('\n') {
                let line = std::mem::take(&mut self.partial);
                lines.push(line.trim_end_matches(['\r', '\n']).to_string());
            }
        }
        Ok(lines)
    }

    /// Pass every new line to `sink` until `stop` turns true
    pub async fn follow<F>(mut self, interval: Duration, mut stop: watch::Receiver<bool>, mut sink: F) -> Result<()>
    where
        F: FnMut(&str),
    {
        loop {
            for line in self.read_new_lines()? {
                sink(&line);
            }
            if *stop.borrow() {
                return Ok(());
            }
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                changed = stop.changed() => {
                    if changed.is_err() {
                        return Ok(());
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn append(path: &Path, text: &str) {
        let mut f = OpenOptions::new().append(true).open(path).unwrap();
        f.write_all(text.as_bytes()).unwrap();
    }

    #[test]
    fn test_starts_at_end_of_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("classifier.log");
        std::fs::write(&path, "old line\n").unwrap();

        let mut reader = LogReader::open_at_end(&path).unwrap();
        assert!(reader.read_new_lines().unwrap().is_empty());

        append(&path, "collect_tests\nrun_test\n");
        assert_eq!(reader.read_new_lines().unwrap(), vec!["collect_tests", "run_test"]);
    }

    #[test]
    fn test_partial_line_held_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("classifier.log");
        let mut reader = LogReader::open_at_end(&path).unwrap();

        append(&path, "progress 5");
        assert!(reader.read_new_lines().unwrap().is_empty());
        append(&path, "0%\n");
        assert_eq!(reader.read_new_lines().unwrap(), vec!["progress 50%"]);
    }

    #[tokio::test]
    async fn test_follow_stops_on_signal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("classifier.log");
        let reader = LogReader::open_at_end(&path).unwrap();
        append(&path, "a\nb\n");

        let (stop_tx, stop_rx) = watch::channel(false);
        let mut seen = Vec::new();
        stop_tx.send(true).unwrap();
        reader
            .follow(Duration::from_millis(10), stop_rx, |line| seen.push(line.to_string()))
            .await
            .unwrap();
        assert_eq!(seen, vec!["a", "b"]);
    }
}
