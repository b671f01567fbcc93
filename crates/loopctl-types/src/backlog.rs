use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::LoopError;

/// A story identifier of the form `STORY-<int>` or `STORY-<int>.<dec>`.
/// Decimal suffixes order between the surrounding integers and compare as
/// integers, not as decimal fractions: `STORY-2.9 < STORY-2.10`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StoryId {
    pub major: u32,
    pub minor: Option<u32>,
}

impl StoryId {
    pub fn new(major: u32) -> Self {
        Self { major, minor: None }
    }

    pub fn with_minor(major: u32, minor: u32) -> Self {
        Self {
            major,
            minor: Some(minor),
        }
    }

    fn sort_key(&self) -> (u32, u32) {
        (self.major, self.minor.unwrap_or(0))
    }

    /// Generate the next decimal id after `self` given the full set of
    /// existing ids sharing the same major component.
    pub fn next_decimal(&self, existing: &[StoryId]) -> StoryId {
        let max_minor = existing
            .iter()
            .filter(|id| id.major == self.major)
            .filter_map(|id| id.minor)
            .max();
        match max_minor {
            Some(m) => StoryId::with_minor(self.major, m + 1),
            None => StoryId::with_minor(self.major, 1),
        }
    }

    /// Generate an id that sorts strictly between `a` and `b`. Both must
    /// share the same major component and `a` must sort before `b`.
    ///
    /// Minors compare as plain integers (per `sort_key`), so when `a` and
    /// `b` are adjacent integers (e.g. 9 and 10 — the common case once two
    /// decimals sit back-to-back) there is no integer strictly between
    /// them. In that case every existing id sharing the major is
    /// renumbered to ten times its minor, which widens every gap to at
    /// least 10 while preserving relative order, and the midpoint is taken
    /// in the renumbered space. Callers must apply `renumbered` to every
    /// story in the backlog before inserting the returned id.
    pub fn midpoint(a: &StoryId, b: &StoryId, existing: &[StoryId]) -> Result<MidpointResult, LoopError> {
        if a.major != b.major {
            return Err(LoopError::Configuration(format!(
                "cannot compute midpoint across majors: {a} and {b}"
            )));
        }
        if a.sort_key() >= b.sort_key() {
            return Err(LoopError::Configuration(format!(
                "midpoint requires a < b, got {a} and {b}"
            )));
        }
        let da = a.minor.unwrap_or(0) as u64;
        let db = b.minor.unwrap_or(0) as u64;
        if db - da > 1 {
            let mean = (da + db) / 2;
            return Ok(MidpointResult {
                id: StoryId::with_minor(a.major, mean as u32),
                renumbered: Vec::new(),
            });
        }

        let mut renumbered = Vec::new();
        for id in existing.iter().filter(|id| id.major == a.major) {
            let new_minor = id.minor.unwrap_or(0) * 10;
            let new_id = StoryId::with_minor(id.major, new_minor);
            if new_id != *id {
                renumbered.push((*id, new_id));
            }
        }
        let mean = (da * 10 + db * 10) / 2;
        Ok(MidpointResult {
            id: StoryId::with_minor(a.major, mean as u32),
            renumbered,
        })
    }
}

/// Result of [`StoryId::midpoint`]: the new id to insert, plus any
/// existing ids that had to be renumbered to make room for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MidpointResult {
    pub id: StoryId,
    pub renumbered: Vec<(StoryId, StoryId)>,
}

impl fmt::Display for StoryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.minor {
            Some(m) => write!(f, "STORY-{:03}.{}", self.major, m),
            None => write!(f, "STORY-{:03}", self.major),
        }
    }
}

impl FromStr for StoryId {
    type Err = LoopError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let rest = s.strip_prefix("STORY-").ok_or_else(|| {
            LoopError::Configuration(format!("invalid story id (missing STORY- prefix): {s}"))
        })?;
        let mut parts = rest.splitn(2, '.');
        let major_part = parts.next().unwrap_or("");
        let major: u32 = major_part
            .parse()
            .map_err(|_| LoopError::Configuration(format!("invalid story id: {s}")))?;
        let minor = match parts.next() {
            Some(dec) if !dec.is_empty() => Some(
                dec.parse::<u32>()
                    .map_err(|_| LoopError::Configuration(format!("invalid story id: {s}")))?,
            ),
            _ => None,
        };
        Ok(StoryId { major, minor })
    }
}

impl PartialOrd for StoryId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for StoryId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.sort_key().cmp(&other.sort_key())
    }
}

impl Serialize for StoryId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for StoryId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Story {
    pub id: StoryId,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "acceptanceCriteria", default)]
    pub acceptance_criteria: Vec<String>,
    #[serde(default)]
    pub priority: i64,
    #[serde(default)]
    pub passes: bool,
    #[serde(default)]
    pub notes: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(
        rename = "mcpServers",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub mcp_servers: Option<Vec<String>>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Backlog {
    pub description: String,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
    #[serde(rename = "userStories")]
    pub user_stories: Vec<Story>,
    /// Backlog-level override for the success-criteria command. Lowest
    /// priority in the CLI-flag > project-config > backlog-file
    /// resolution order.
    #[serde(
        rename = "successCriteriaCommand",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub success_criteria_command: Option<String>,
}

/// A gap in an otherwise-sequential backlog: a story marked incomplete
/// followed somewhere later by a story marked complete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequentialGap {
    pub incomplete_index: usize,
    pub incomplete_id: StoryId,
    pub complete_index: usize,
    pub complete_id: StoryId,
}

impl Backlog {
    /// Stories in canonical ascending-id order. Does not mutate storage;
    /// callers that need persisted canonical order should sort in place
    /// before saving.
    pub fn canonical_order(&self) -> Vec<&Story> {
        let mut stories: Vec<&Story> = self.user_stories.iter().collect();
        stories.sort_by(|a, b| a.id.cmp(&b.id));
        stories
    }

    pub fn total(&self) -> usize {
        self.user_stories.len()
    }

    pub fn passes_count(&self) -> usize {
        self.user_stories.iter().filter(|s| s.passes).count()
    }

    pub fn all_complete(&self) -> bool {
        !self.user_stories.is_empty() && self.user_stories.iter().all(|s| s.passes)
    }

    /// A comma-joined sequence of `0`/`1` in canonical id order, suitable
    /// for bitwise comparison against a previously captured snapshot.
    pub fn passes_snapshot(&self) -> String {
        self.canonical_order()
            .iter()
            .map(|s| if s.passes { "1" } else { "0" })
            .collect::<Vec<_>>()
            .join(",")
    }

    pub fn first_incomplete(&self) -> Option<&Story> {
        self.canonical_order().into_iter().find(|s| !s.passes)
    }

    pub fn find(&self, id: &StoryId) -> Option<&Story> {
        self.user_stories.iter().find(|s| &s.id == id)
    }

    pub fn find_mut(&mut self, id: &StoryId) -> Option<&mut Story> {
        self.user_stories.iter_mut().find(|s| &s.id == id)
    }

    /// Ordered list of sequential-completion violations: a `passes=false`
    /// story preceding (in canonical order) any `passes=true` story.
    pub fn check_sequential(&self) -> Vec<SequentialGap> {
        let ordered = self.canonical_order();
        let mut gaps = Vec::new();
        for (k, story) in ordered.iter().enumerate() {
            if story.passes {
                continue;
            }
            for (j, later) in ordered.iter().enumerate().skip(k + 1) {
                if later.passes {
                    gaps.push(SequentialGap {
                        incomplete_index: k,
                        incomplete_id: story.id,
                        complete_index: j,
                        complete_id: later.id,
                    });
                }
            }
        }
        gaps
    }

    pub fn mark_complete(&mut self, id: &StoryId) -> Result<(), LoopError> {
        let story = self
            .find_mut(id)
            .ok_or_else(|| LoopError::Configuration(format!("unknown story id: {id}")))?;
        story.passes = true;
        Ok(())
    }

    /// Flip back to `false` any story whose current flag is `true` but
    /// whose flag in `snapshot` was `false`. Returns how many stories
    /// were reverted, so the caller can truncate that many trailing
    /// progress-log blocks.
    pub fn rollback_to(&mut self, snapshot: &str) -> Result<usize, LoopError> {
        let before: Vec<bool> = snapshot
            .split(',')
            .filter(|s| !s.is_empty())
            .map(|s| s == "1")
            .collect();
        let ordered_ids: Vec<StoryId> = self.canonical_order().iter().map(|s| s.id).collect();
        if before.len() != ordered_ids.len() {
            return Err(LoopError::Configuration(format!(
                "snapshot length {} does not match backlog length {}",
                before.len(),
                ordered_ids.len()
            )));
        }
        let mut reverted = 0;
        for (id, was_passing) in ordered_ids.iter().zip(before.iter()) {
            if *was_passing {
                continue;
            }
            if let Some(story) = self.find_mut(id) {
                if story.passes {
                    story.passes = false;
                    reverted += 1;
                }
            }
        }
        Ok(reverted)
    }
}
