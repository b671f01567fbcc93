use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use loopctl_types::{CommandLogEntry, CommandSource, RedundancySuggestion};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::Mutex;

/// Appends one JSON line per external command execution. Shared across the
/// process via cheap `Clone`; the inner handle serializes writers so a
/// single buffered `write_all` per line stays atomic against interleaving.
#[derive(Clone)]
pub struct CommandLogger {
    path: PathBuf,
    file: Arc<Mutex<()>>,
}

impl CommandLogger {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: Arc::new(Mutex::new(())),
        }
    }

    pub async fn log(&self, entry: &CommandLogEntry) -> anyhow::Result<()> {
        let mut line = serde_json::to_string(entry)?;
        line.push('\n');
        let _guard = self.file.lock().await;
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await.ok();
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        Ok(())
    }

    /// Runs `program args..` under a shell, logging start/finish and exit
    /// code. Returns the exit code and the combined stdout+stderr text.
    pub async fn exec(
        &self,
        source: CommandSource,
        command: &str,
        iteration: u32,
        story_id: &str,
    ) -> anyhow::Result<(i32, String)> {
        let start = Instant::now();
        let output = Command::new("sh").arg("-c").arg(command).output().await?;
        let duration_ms = start.elapsed().as_millis() as u64;
        let exit_code = output.status.code().unwrap_or(-1);

        self.log(&CommandLogEntry {
            timestamp: Utc::now(),
            source,
            command: command.to_string(),
            exit_code,
            duration_ms,
            iteration,
            story_id: story_id.to_string(),
        })
        .await?;

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));
        Ok((exit_code, combined))
    }
}

/// Scans an iteration-log JSONL file for `tool_use` events and back-fills
/// zero-duration command-log entries, since the AI subprocess does not
/// report its own command timing.
pub fn backfill_from_iteration_log(
    contents: &str,
    iteration: u32,
    story_id: &str,
) -> Vec<CommandLogEntry> {
    let mut entries = Vec::new();
    for line in contents.lines() {
        let Ok(value) = serde_json::from_str::<serde_json::Value>(line) else {
            continue;
        };
        if value.get("type").and_then(|t| t.as_str()) != Some("tool_use") {
            continue;
        }
        let Some(command) = value
            .get("input")
            .and_then(|i| i.get("command"))
            .and_then(|c| c.as_str())
        else {
            continue;
        };
        entries.push(CommandLogEntry {
            timestamp: Utc::now(),
            source: CommandSource::AiStream,
            command: command.to_string(),
            exit_code: 0,
            duration_ms: 0,
            iteration,
            story_id: story_id.to_string(),
        });
    }
    entries
}

#[derive(Debug, Clone, PartialEq)]
pub struct RedundancyReport {
    pub command: String,
    pub iteration: u32,
    pub count: usize,
    pub redundant_duration_ms: u64,
    pub suggestion: RedundancySuggestion,
}

/// Groups entries by `(command, iteration)` and reports ones executed more
/// than once in that iteration, by any combination of sources.
pub fn analyze_redundancy(entries: &[CommandLogEntry]) -> Vec<RedundancyReport> {
    let mut groups: HashMap<(String, u32), Vec<&CommandLogEntry>> = HashMap::new();
    for entry in entries {
        groups
            .entry((entry.command.clone(), entry.iteration))
            .or_default()
            .push(entry);
    }

    let mut reports = Vec::new();
    for ((command, iteration), group) in groups {
        if group.len() < 2 {
            continue;
        }
        let total: u64 = group.iter().map(|e| e.duration_ms).sum();
        let min = group.iter().map(|e| e.duration_ms).min().unwrap_or(0);
        let redundant_duration_ms = total.saturating_sub(min);

        let quality_gate_count = group
            .iter()
            .filter(|e| e.source == CommandSource::QualityGate)
            .count();
        let success_criteria_count = group
            .iter()
            .filter(|e| e.source == CommandSource::SuccessCriteria)
            .count();
        let same_source = group.iter().all(|e| e.source == group[0].source);

        let suggestion = if quality_gate_count > 1 {
            RedundancySuggestion::QualityGateRedundancy
        } else if success_criteria_count > 1 {
            RedundancySuggestion::SuccessCriteriaRedundancy
        } else if same_source {
            RedundancySuggestion::RepeatedExecution
        } else {
            RedundancySuggestion::Generic
        };

        reports.push(RedundancyReport {
            command,
            iteration,
            count: group.len(),
            redundant_duration_ms,
            suggestion,
        });
    }
    reports
}
