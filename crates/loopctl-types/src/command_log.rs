use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Source tag for a logged command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandSource {
    QualityGate,
    Hook,
    SuccessCriteria,
    AiStream,
    Other,
}

impl std::fmt::Display for CommandSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CommandSource::QualityGate => "quality_gate",
            CommandSource::Hook => "hook",
            CommandSource::SuccessCriteria => "success_criteria",
            CommandSource::AiStream => "ai_stream",
            CommandSource::Other => "other",
        };
        write!(f, "{s}")
    }
}

/// One entry in `logs/commands.jsonl`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandLogEntry {
    pub timestamp: DateTime<Utc>,
    pub source: CommandSource,
    pub command: String,
    pub exit_code: i32,
    pub duration_ms: u64,
    pub iteration: u32,
    pub story_id: String,
}

/// A suggestion emitted by the redundancy analyser.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RedundancySuggestion {
    QualityGateRedundancy,
    SuccessCriteriaRedundancy,
    RepeatedExecution,
    Generic,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_source_serializes_snake_case() {
        let json = serde_json::to_string(&CommandSource::SuccessCriteria).unwrap();
        assert_eq!(json, "\"success_criteria\"");
    }
}
