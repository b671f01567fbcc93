use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Paused,
    Complete,
    Error,
    Interrupted,
}

/// The status record: rewritten at iteration boundaries, consumed only by
/// optional dashboards. Writing it is always best-effort.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusRecord {
    pub iteration: u32,
    #[serde(rename = "maxIterations")]
    pub max_iterations: u32,
    pub status: RunStatus,
    pub feature: String,
    #[serde(rename = "storiesComplete")]
    pub stories_complete: usize,
    #[serde(rename = "storiesTotal")]
    pub stories_total: usize,
    #[serde(rename = "currentStory", skip_serializing_if = "Option::is_none")]
    pub current_story: Option<String>,
    #[serde(rename = "apiCallsUsed")]
    pub api_calls_used: u32,
    #[serde(rename = "apiCallsLimit")]
    pub api_calls_limit: u32,
    #[serde(rename = "rateLimitResetsAt")]
    pub rate_limit_resets_at: DateTime<Utc>,
    #[serde(rename = "startedAt")]
    pub started_at: DateTime<Utc>,
    #[serde(rename = "lastUpdated")]
    pub last_updated: DateTime<Utc>,
}

/// Persisted pair `(call_count, hour_start)`. `hour_start` is the current
/// wall-clock hour rounded down to the epoch-seconds boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RateLimiterState {
    pub call_count: u32,
    pub hour_start: i64,
}

impl RateLimiterState {
    pub fn to_file_contents(&self) -> String {
        format!(
            "CALL_COUNT={}\nHOUR_START={}\n",
            self.call_count, self.hour_start
        )
    }

    pub fn parse(contents: &str) -> Self {
        let mut state = RateLimiterState::default();
        for line in contents.lines() {
            if let Some((key, value)) = line.split_once('=') {
                match key.trim() {
                    "CALL_COUNT" => state.call_count = value.trim().parse().unwrap_or(0),
                    "HOUR_START" => state.hour_start = value.trim().parse().unwrap_or(0),
                    _ => {}
                }
            }
        }
        state
    }
}

/// Four fields persisted together: the two trip counters, the hash of the
/// last normalized error seen, and the last observed passes snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CircuitBreakerState {
    pub no_progress_count: u32,
    pub same_error_count: u32,
    pub last_error_hash: Option<u64>,
    pub last_passes_state: String,
}

impl CircuitBreakerState {
    pub fn to_file_contents(&self) -> String {
        format!(
            "NO_PROGRESS_COUNT={}\nSAME_ERROR_COUNT={}\nLAST_ERROR_HASH={}\nLAST_PASSES_STATE={}\n",
            self.no_progress_count,
            self.same_error_count,
            self.last_error_hash.map(|h| h.to_string()).unwrap_or_default(),
            self.last_passes_state,
        )
    }

    pub fn parse(contents: &str) -> Self {
        let mut state = CircuitBreakerState::default();
        for line in contents.lines() {
            if let Some((key, value)) = line.split_once('=') {
                let value = value.trim();
                match key.trim() {
                    "NO_PROGRESS_COUNT" => state.no_progress_count = value.parse().unwrap_or(0),
                    "SAME_ERROR_COUNT" => state.same_error_count = value.parse().unwrap_or(0),
                    "LAST_ERROR_HASH" => {
                        state.last_error_hash = if value.is_empty() {
                            None
                        } else {
                            value.parse().ok()
                        }
                    }
                    "LAST_PASSES_STATE" => state.last_passes_state = value.to_string(),
                    _ => {}
                }
            }
        }
        state
    }
}
