// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! External stages of a batch: import, transcode, export, cleanup

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::{wait_stopped, StopSignal};
use crate::config::{CommandTemplate, StageCommands};
use crate::tasks::ClassificationReport;
use crate::{ClassqError, Result};

/// Result of a stage that may be stopped by the user
#[derive(Debug, Clone, PartialEq)]
pub enum StageOutcome<T> {
    Completed(T),
    Cancelled,
}

/// What the importer found in an event file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportReport {
    pub event_count: usize,
    /// Last frame any event refers to
    #[serde(default)]
    pub max_event_frame: u64,
    /// Video reference: a path, `file:` or `http(s):` URL
    #[serde(default)]
    pub video_source: String,
    /// Event id to class already assigned by an operator
    #[serde(default)]
    pub known_classes: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TranscodeReport {
    pub frame_dir: PathBuf,
}

/// The non-classifier stages the batch runner drives
#[async_trait]
pub trait BatchStages: Send + Sync {
    async fn import(&self, xml: &Path, stop: &StopSignal) -> Result<StageOutcome<ImportReport>>;

    async fn transcode(
        &self,
        video: &Path,
        import: &ImportReport,
        stop: &StopSignal,
    ) -> Result<StageOutcome<TranscodeReport>>;

    async fn export(
        &self,
        xml: &Path,
        report: &ClassificationReport,
        output_dir: &Path,
        stop: &StopSignal,
    ) -> Result<StageOutcome<()>>;

    async fn cleanup(&self, transcode: &TranscodeReport, stop: &StopSignal) -> Result<StageOutcome<()>>;
}

/// Stages run as configured external programs
///
/// Arguments may use `{xml}`, `{video}`, `{frames}`, `{output}` and
/// `{max_frame}`. The import program prints an [`ImportReport`] as JSON on
/// stdout. Without an export program the report is written as JSON next to
/// the other results; without a cleanup program the frame directory is
/// removed.
pub struct CommandStages {
    commands: StageCommands,
    scratch_dir: PathBuf,
}

impl CommandStages {
    pub fn new(commands: StageCommands, scratch_dir: &Path) -> Self {
        Self {
            commands,
            scratch_dir: scratch_dir.to_path_buf(),
        }
    }

    /// Directory frames of `video` are transcoded into
    pub fn frame_dir(&self, video: &Path) -> PathBuf {
        let stem = video
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "frames".to_string());
        self.scratch_dir.join(stem)
    }

    fn required<'a>(&'a self, stage: &'static str, template: &'a Option<CommandTemplate>) -> Result<&'a CommandTemplate> {
        template.as_ref().ok_or_else(|| ClassqError::Stage {
            stage,
            reason: "no command configured".to_string(),
        })
    }
}

/// Replace `{name}` placeholders in `arg`
pub fn substitute(arg: &str, vars: &[(&str, String)]) -> String {
    vars.iter()
        .fold(arg.to_string(), |acc, (name, value)| acc.replace(&format!("{{{}}}", name), value))
}

/// Run one external command; a stop request kills it
async fn run_command(
    stage: &'static str,
    template: &CommandTemplate,
    vars: &[(&str, String)],
    stop: &StopSignal,
) -> Result<StageOutcome<String>> {
    if *stop.borrow() {
        return Ok(StageOutcome::Cancelled);
    }

    let args: Vec<String> = template.args.iter().map(|a| substitute(a, vars)).collect();
    debug!("{}: {} {:?}", stage, template.program, args);

    let child = Command::new(&template.program)
        .args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| ClassqError::Stage {
            stage,
            reason: format!("cannot start {}: {}", template.program, e),
        })?;

    let mut stop = stop.clone();
    tokio::select! {
        output = child.wait_with_output() => {
            let output = output?;
            if !output.status.success() {
                let stderr = String::from_utf8_lossy(&output.stderr);
                return Err(ClassqError::Stage {
                    stage,
                    reason: format!("{} exited with {}: {}", template.program, output.status, stderr.trim()),
                });
            }
            Ok(StageOutcome::Completed(String::from_utf8_lossy(&output.stdout).to_string()))
        }
        _ = wait_stopped(&mut stop) => {
            info!("{} stopped, killing {}", stage, template.program);
            Ok(StageOutcome::Cancelled)
        }
    }
}

#[async_trait]
impl BatchStages for CommandStages {
    async fn import(&self, xml: &Path, stop: &StopSignal) -> Result<StageOutcome<ImportReport>> {
        let template = self.required("import", &self.commands.import)?;
        let vars = [("xml", xml.display().to_string())];

        match run_command("import", template, &vars, stop).await? {
            StageOutcome::Completed(stdout) => {
                let report: ImportReport = serde_json::from_str(stdout.trim()).map_err(|e| ClassqError::Stage {
                    stage: "import",
                    reason: format!("unreadable import report: {}", e),
                })?;
                Ok(StageOutcome::Completed(report))
            }
            StageOutcome::Cancelled => Ok(StageOutcome::Cancelled),
        }
    }

    async fn transcode(
        &self,
        video: &Path,
        import: &ImportReport,
        stop: &StopSignal,
    ) -> Result<StageOutcome<TranscodeReport>> {
        let template = self.required("transcode", &self.commands.transcode)?;
        let frame_dir = self.frame_dir(video);
        tokio::fs::create_dir_all(&frame_dir).await?;

        let vars = [
            ("video", video.display().to_string()),
            ("frames", frame_dir.display().to_string()),
            ("max_frame", import.max_event_frame.to_string()),
        ];
        match run_command("transcode", template, &vars, stop).await? {
            StageOutcome::Completed(_) => Ok(StageOutcome::Completed(TranscodeReport { frame_dir })),
            StageOutcome::Cancelled => Ok(StageOutcome::Cancelled),
        }
    }

    async fn export(
        &self,
        xml: &Path,
        report: &ClassificationReport,
        output_dir: &Path,
        stop: &StopSignal,
    ) -> Result<StageOutcome<()>> {
        let stem = xml
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "events".to_string());
        let report_path = output_dir.join(format!("{}_classes.json", stem));
        tokio::fs::write(&report_path, serde_json::to_string_pretty(report)?).await?;

        let Some(template) = &self.commands.export else {
            debug!("Wrote {:?}", report_path);
            return Ok(StageOutcome::Completed(()));
        };
        let vars = [
            ("xml", xml.display().to_string()),
            ("output", report_path.display().to_string()),
        ];
        match run_command("export", template, &vars, stop).await? {
            StageOutcome::Completed(_) => Ok(StageOutcome::Completed(())),
            StageOutcome::Cancelled => Ok(StageOutcome::Cancelled),
        }
    }

    async fn cleanup(&self, transcode: &TranscodeReport, stop: &StopSignal) -> Result<StageOutcome<()>> {
        match &self.commands.cleanup {
            Some(template) => {
                let vars = [("frames", transcode.frame_dir.display().to_string())];
                match run_command("cleanup", template, &vars, stop).await? {
                    StageOutcome::Completed(_) => Ok(StageOutcome::Completed(())),
                    StageOutcome::Cancelled => Ok(StageOutcome::Cancelled),
                }
            }
            None => {
                if let Err(e) = tokio::fs::remove_dir_all(&transcode.frame_dir).await {
                    warn!("Could not remove {:?}: {}", transcode.frame_dir, e);
                }
                Ok(StageOutcome::Completed(()))
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};
    use tokio::sync::watch;

    fn sh(script: &str) -> CommandTemplate {
        CommandTemplate {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
        }
    }

    #[test]
    fn test_substitute_placeholders() {
        let vars = [("frames", "/tmp/f".to_string()), ("max_frame", "120".to_string())];
        assert_eq!(substitute("--out={frames} --to {max_frame}", &vars), "--out=/tmp/f --to 120");
        assert_eq!(substitute("{unknown}", &vars), "{unknown}");
    }

    #[tokio::test]
    async fn test_import_parses_report() {
        let dir = tempfile::tempdir().unwrap();
        let commands = StageCommands {
            import: Some(sh(r#"echo '{"event_count": 2, "max_event_frame": 90, "video_source": "{xml}.mov"}'"#)),
            ..StageCommands::default()
        };
        let stages = CommandStages::new(commands, dir.path());
        let (_tx, stop) = watch::channel(false);

        let outcome = stages.import(Path::new("/dives/d1.xml"), &stop).await.unwrap();
        let StageOutcome::Completed(report) = outcome else {
            panic!("import was cancelled");
        };
        assert_eq!(report.event_count, 2);
        assert_eq!(report.video_source, "/dives/d1.xml.mov");
    }

    #[tokio::test]
    async fn test_failing_command_is_stage_error() {
        let dir = tempfile::tempdir().unwrap();
        let commands = StageCommands {
            import: Some(sh("echo broken >&2; exit 3")),
            ..StageCommands::default()
        };
        let stages = CommandStages::new(commands, dir.path());
        let (_tx, stop) = watch::channel(false);

        match stages.import(Path::new("d1.xml"), &stop).await {
            Err(ClassqError::Stage { stage, reason }) => {
                assert_eq!(stage, "import");
                assert!(reason.contains("broken"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_stop_kills_running_command() {
        let dir = tempfile::tempdir().unwrap();
        let commands = StageCommands {
            transcode: Some(sh("sleep 30")),
            ..StageCommands::default()
        };
        let stages = CommandStages::new(commands, dir.path());
        let (tx, stop) = watch::channel(false);

        let started = Instant::now();
        let import = ImportReport {
            event_count: 1,
            max_event_frame: 10,
            video_source: String::new(),
            known_classes: HashMap::new(),
        };
        let stopper = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            tx.send(true).unwrap();
            tx
        });
        let outcome = stages.transcode(Path::new("/video/d1.mov"), &import, &stop).await.unwrap();
        assert_eq!(outcome, StageOutcome::Cancelled);
        assert!(started.elapsed() < Duration::from_secs(10));
        drop(stopper.await.unwrap());
    }

    #[tokio::test]
    async fn test_default_cleanup_removes_frames() {
        let dir = tempfile::tempdir().unwrap();
        let stages = CommandStages::new(StageCommands::default(), dir.path());
        let frame_dir = stages.frame_dir(Path::new("/video/d1.mov"));
        std::fs::create_dir_all(frame_dir.join("testimages_d1")).unwrap();
        let (_tx, stop) = watch::channel(false);

        let outcome = stages.cleanup(&TranscodeReport { frame_dir: frame_dir.clone() }, &stop).await.unwrap();
        assert_eq!(outcome, StageOutcome::Completed(()));
        assert!(!frame_dir.exists());
    }

    #[tokio::test]
    async fn test_missing_import_command() {
        let dir = tempfile::tempdir().unwrap();
        let stages = CommandStages::new(StageCommands::default(), dir.path());
        let (_tx, stop) = watch::channel(false);
        assert!(matches!(
            stages.import(Path::new("d1.xml"), &stop).await,
            Err(ClassqError::Stage { stage: "import", .. })
        ));
    }
}
