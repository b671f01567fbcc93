//! Detects a stuck loop via two independent trip conditions: no
//! end-of-iteration progress, or the same normalized error repeating.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::PathBuf;

use loopctl_subprocess::normalize_error;
use loopctl_types::CircuitBreakerState;

use crate::atomic_io::{read_to_string_opt, write_atomic_str};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TripReason {
    NoProgress,
    SameError,
}

pub struct CircuitBreaker {
    path: PathBuf,
    no_progress_threshold: u32,
    same_error_threshold: u32,
    state: CircuitBreakerState,
}

impl CircuitBreaker {
    pub fn new(path: impl Into<PathBuf>, no_progress_threshold: u32, same_error_threshold: u32) -> Self {
        Self {
            path: path.into(),
            no_progress_threshold,
            same_error_threshold,
            state: CircuitBreakerState::default(),
        }
    }

    pub fn state(&self) -> &CircuitBreakerState {
        &self.state
    }

    pub async fn load(&mut self) -> anyhow::Result<()> {
        if let Some(contents) = read_to_string_opt(&self.path).await? {
            self.state = CircuitBreakerState::parse(&contents);
        }
        Ok(())
    }

    pub async fn save(&self) -> anyhow::Result<()> {
        write_atomic_str(&self.path, &self.state.to_file_contents()).await
    }

    /// Compare the backlog's `passes_snapshot` at the start and end of
    /// the iteration; reset the no-progress counter on any change.
    pub async fn record_progress(&mut self, snapshot_before: &str, snapshot_after: &str) -> anyhow::Result<()> {
        if snapshot_before == snapshot_after {
            self.state.no_progress_count += 1;
        } else {
            self.state.no_progress_count = 0;
        }
        self.state.last_passes_state = snapshot_after.to_string();
        self.save().await
    }

    /// Normalize `raw_error`, hash it, and compare against the last
    /// recorded hash. Equal hashes increment the repeated-error counter;
    /// a new hash resets it to 1.
    pub async fn record_error(&mut self, raw_error: &str) -> anyhow::Result<()> {
        let normalized = normalize_error(raw_error);
        let mut hasher = DefaultHasher::new();
        normalized.hash(&mut hasher);
        let hash = hasher.finish();

        if self.state.last_error_hash == Some(hash) {
            self.state.same_error_count += 1;
        } else {
            self.state.same_error_count = 1;
            self.state.last_error_hash = Some(hash);
        }
        self.save().await
    }

    pub fn tripped(&self) -> Option<TripReason> {
        if self.state.no_progress_count >= self.no_progress_threshold {
            Some(TripReason::NoProgress)
        } else if self.state.same_error_count >= self.same_error_threshold {
            Some(TripReason::SameError)
        } else {
            None
        }
    }

    /// Clear all counters and persist, for `loopctl reset-circuit`.
    pub async fn reset(&mut self) -> anyhow::Result<()> {
        self.state = CircuitBreakerState::default();
        self.save().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn repeated_no_progress_trips_after_threshold() {
        let dir = tempdir().unwrap();
        let mut cb = CircuitBreaker::new(dir.path().join("state"), 2, 5);
        cb.record_progress("0,0", "0,0").await.unwrap();
        assert!(cb.tripped().is_none());
        cb.record_progress("0,0", "0,0").await.unwrap();
        assert_eq!(cb.tripped(), Some(TripReason::NoProgress));
    }

    #[tokio::test]
    async fn progress_resets_no_progress_counter() {
        let dir = tempdir().unwrap();
        let mut cb = CircuitBreaker::new(dir.path().join("state"), 2, 5);
        cb.record_progress("0,0", "0,0").await.unwrap();
        cb.record_progress("0,0", "1,0").await.unwrap();
        assert_eq!(cb.state().no_progress_count, 0);
    }

    #[tokio::test]
    async fn normalized_equal_errors_increment_same_error_counter() {
        let dir = tempdir().unwrap();
        let mut cb = CircuitBreaker::new(dir.path().join("state"), 3, 2);
        cb.record_error("2024-01-15T14:30:00Z Error: x at file.py:42")
            .await
            .unwrap();
        cb.record_error("[2024-01-15 14:30:00] Error: x at file.py:99")
            .await
            .unwrap();
        assert_eq!(cb.state().same_error_count, 2);
        assert_eq!(cb.tripped(), Some(TripReason::SameError));
    }

    #[tokio::test]
    async fn distinct_errors_reset_counter_to_one() {
        let dir = tempdir().unwrap();
        let mut cb = CircuitBreaker::new(dir.path().join("state"), 3, 5);
        cb.record_error("Error: database connection refused").await.unwrap();
        cb.record_error("Error: out of memory").await.unwrap();
        assert_eq!(cb.state().same_error_count, 1);
    }

    #[tokio::test]
    async fn reset_clears_persisted_state() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state");
        let mut cb = CircuitBreaker::new(&path, 1, 1);
        cb.record_progress("0", "0").await.unwrap();
        assert!(cb.tripped().is_some());
        cb.reset().await.unwrap();
        assert!(cb.tripped().is_none());

        let mut reloaded = CircuitBreaker::new(&path, 1, 1);
        reloaded.load().await.unwrap();
        assert_eq!(reloaded.state().no_progress_count, 0);
    }
}
