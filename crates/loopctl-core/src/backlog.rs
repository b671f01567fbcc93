//! Persistence for the story backlog and its companion progress log.
//! Pure backlog invariants (ordering, sequential-completion, rollback
//! arithmetic) live on `loopctl_types::Backlog`; this module is only
//! concerned with reading/writing those types atomically to disk.

use std::path::{Path, PathBuf};

use loopctl_types::Backlog;

use crate::atomic_io::{append_line, read_to_string_opt, write_atomic_str};

const BLOCK_SEPARATOR: &str = "\n---\n";

/// Owns the two files backing one feature's backlog: `backlog.json` and
/// the append-only `progress.txt`.
pub struct BacklogStore {
    backlog_path: PathBuf,
    progress_log_path: PathBuf,
}

impl BacklogStore {
    pub fn new(feature_dir: &Path) -> Self {
        Self {
            backlog_path: feature_dir.join("backlog.json"),
            progress_log_path: feature_dir.join("progress.txt"),
        }
    }

    pub async fn load(&self) -> anyhow::Result<Backlog> {
        let raw = tokio::fs::read_to_string(&self.backlog_path).await?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub async fn save(&self, backlog: &Backlog) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(backlog)?;
        write_atomic_str(&self.backlog_path, &json).await
    }

    /// Append a human-readable progress block, terminated by the `---`
    /// separator line the rollback routine looks for.
    pub async fn append_progress_block(&self, block: &str) -> anyhow::Result<()> {
        let mut line = block.trim_end_matches('\n').to_string();
        line.push_str(BLOCK_SEPARATOR);
        append_line(&self.progress_log_path, &line).await
    }

    /// Flip `backlog`'s flags back per `snapshot` and persist the result.
    /// The forward path appends to the progress log before flipping the
    /// backlog flag; rollback reverses both steps in reverse order — the
    /// progress log is truncated first, then the flag flip is persisted —
    /// so a crash mid-rollback never leaves a progress-log block
    /// referencing a story the backlog no longer marks complete. Tolerates
    /// a progress log with fewer trailing blocks than reverted stories (a
    /// process may have crashed between the backlog flip and the log
    /// append on the way in).
    pub async fn rollback_to(&self, backlog: &mut Backlog, snapshot: &str) -> anyhow::Result<usize> {
        let reverted = backlog.rollback_to(snapshot)?;
        if reverted > 0 {
            self.truncate_progress_log(reverted).await?;
        }
        self.save(backlog).await?;
        Ok(reverted)
    }

    async fn truncate_progress_log(&self, blocks: usize) -> anyhow::Result<()> {
        let Some(contents) = read_to_string_opt(&self.progress_log_path).await? else {
            return Ok(());
        };
        let mut parts: Vec<&str> = contents
            .split(BLOCK_SEPARATOR)
            .filter(|p| !p.is_empty())
            .collect();
        let keep = parts.len().saturating_sub(blocks);
        parts.truncate(keep);
        let mut rebuilt = parts.join(BLOCK_SEPARATOR);
        if !parts.is_empty() {
            rebuilt.push_str(BLOCK_SEPARATOR);
        }
        write_atomic_str(&self.progress_log_path, &rebuilt).await
    }
}
