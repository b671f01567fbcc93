//! Verification gates run in fixed order after the AI reports completing
//! a story: quality gate, success-criteria gate, post-iteration hook.

use std::path::Path;
use std::time::Duration;

use chrono::Utc;
use loopctl_observability::CommandLogger;
use loopctl_types::CommandSource;
use serde::Serialize;

use crate::atomic_io::write_atomic_str;

const DEFAULT_QUALITY_GATE_TIMEOUT: Duration = Duration::from_secs(300);

/// Outcome of one gate run. `VerificationFailed` is distinct from `Fail`
/// because only the hook's exit 75 feeds the circuit breaker's error
/// channel as a dedicated "verification failed" kind rather than a
/// generic failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateOutcome {
    Pass,
    Fail { output: String },
    Timeout,
    VerificationFailed { output: String },
}

impl GateOutcome {
    pub fn is_pass(&self) -> bool {
        matches!(self, GateOutcome::Pass)
    }
}

async fn run_with_timeout(
    logger: &CommandLogger,
    source: CommandSource,
    command: &str,
    timeout: Duration,
    iteration: u32,
    story_id: &str,
) -> anyhow::Result<(i32, String)> {
    match tokio::time::timeout(timeout, logger.exec(source, command, iteration, story_id)).await {
        Ok(result) => result,
        Err(_) => Ok((124, String::new())),
    }
}

/// Quality gate: optional. No commands configured warns and passes.
/// `commands` is either a single `("all", cmd)` pair or a `("backend",
/// cmd)` / `("frontend", cmd)` pair — when both are configured, both must
/// run and both must pass; the first to fail or time out short-circuits
/// the rest.
pub async fn run_quality_gate(
    logger: &CommandLogger,
    commands: &[(&str, &str)],
    iteration: u32,
    story_id: &str,
) -> anyhow::Result<GateOutcome> {
    if commands.is_empty() {
        tracing::warn!(story_id, "no quality check command configured, passing by default");
        return Ok(GateOutcome::Pass);
    }

    for (label, command) in commands {
        let (exit_code, output) = run_with_timeout(
            logger,
            CommandSource::QualityGate,
            command,
            DEFAULT_QUALITY_GATE_TIMEOUT,
            iteration,
            story_id,
        )
        .await?;

        match exit_code {
            0 => continue,
            124 => return Ok(GateOutcome::Timeout),
            _ => {
                return Ok(GateOutcome::Fail {
                    output: format!("[{label}] {output}"),
                })
            }
        }
    }
    Ok(GateOutcome::Pass)
}

/// Success-criteria gate: mandatory once a command is configured. On
/// failure or timeout, writes `last_error.txt` into the feature
/// directory so the next iteration's prompt can reference it.
pub async fn run_success_criteria_gate(
    logger: &CommandLogger,
    command: &str,
    timeout: Duration,
    feature_dir: &Path,
    iteration: u32,
    story_id: &str,
) -> anyhow::Result<GateOutcome> {
    let (exit_code, output) =
        run_with_timeout(logger, CommandSource::SuccessCriteria, command, timeout, iteration, story_id)
            .await?;

    match exit_code {
        0 => Ok(GateOutcome::Pass),
        124 => {
            write_atomic_str(
                &feature_dir.join("last_error.txt"),
                "success criteria command timed out\n",
            )
            .await?;
            Ok(GateOutcome::Timeout)
        }
        _ => {
            write_atomic_str(&feature_dir.join("last_error.txt"), &output).await?;
            Ok(GateOutcome::Fail { output })
        }
    }
}

#[derive(Debug, Clone, Serialize)]
struct HookContext<'a> {
    story_id: &'a str,
    iteration: u32,
    feature_dir: String,
    output_file: String,
    timestamp: chrono::DateTime<Utc>,
}

/// Post-iteration hook: a user-defined command invoked with the path to
/// an ephemeral JSON context file. Exit 0 passes; exit 75 is a distinct
/// "verification failed" outcome (feeds the breaker's error channel,
/// never treated as a warning); exit 124 is a timeout; anything else is
/// a generic failure.
pub async fn run_post_iteration_hook(
    logger: &CommandLogger,
    hook_command: Option<&str>,
    feature_dir: &Path,
    output_file: &Path,
    timeout: Duration,
    iteration: u32,
    story_id: &str,
) -> anyhow::Result<GateOutcome> {
    let Some(hook_command) = hook_command else {
        return Ok(GateOutcome::Pass);
    };

    let context = HookContext {
        story_id,
        iteration,
        feature_dir: feature_dir.display().to_string(),
        output_file: output_file.display().to_string(),
        timestamp: Utc::now(),
    };
    let context_path = feature_dir.join(format!("hook-context-{iteration}.json"));
    write_atomic_str(&context_path, &serde_json::to_string_pretty(&context)?).await?;

    let command = format!("{hook_command} {}", context_path.display());
    let (exit_code, output) =
        run_with_timeout(logger, CommandSource::Hook, &command, timeout, iteration, story_id).await?;

    let _ = tokio::fs::remove_file(&context_path).await;

    Ok(match exit_code {
        0 => GateOutcome::Pass,
        75 => GateOutcome::VerificationFailed { output },
        124 => GateOutcome::Timeout,
        _ => GateOutcome::Fail { output },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn quality_gate_passes_when_unset() {
        let dir = tempdir().unwrap();
        let logger = CommandLogger::new(dir.path().join("commands.jsonl"));
        let outcome = run_quality_gate(&logger, &[], 1, "STORY-001").await.unwrap();
        assert_eq!(outcome, GateOutcome::Pass);
    }

    #[tokio::test]
    async fn quality_gate_fails_on_nonzero_exit() {
        let dir = tempdir().unwrap();
        let logger = CommandLogger::new(dir.path().join("commands.jsonl"));
        let outcome = run_quality_gate(&logger, &[("all", "false")], 1, "STORY-001")
            .await
            .unwrap();
        assert!(matches!(outcome, GateOutcome::Fail { .. }));
    }

    #[tokio::test]
    async fn quality_gate_runs_both_backend_and_frontend_when_configured() {
        let dir = tempdir().unwrap();
        let logger = CommandLogger::new(dir.path().join("commands.jsonl"));
        let outcome = run_quality_gate(
            &logger,
            &[("backend", "true"), ("frontend", "true")],
            1,
            "STORY-001",
        )
        .await
        .unwrap();
        assert_eq!(outcome, GateOutcome::Pass);
    }

    #[tokio::test]
    async fn quality_gate_fails_when_frontend_command_fails_even_if_backend_passes() {
        let dir = tempdir().unwrap();
        let logger = CommandLogger::new(dir.path().join("commands.jsonl"));
        let outcome = run_quality_gate(
            &logger,
            &[("backend", "true"), ("frontend", "false")],
            1,
            "STORY-001",
        )
        .await
        .unwrap();
        match outcome {
            GateOutcome::Fail { output } => assert!(output.starts_with("[frontend]")),
            other => panic!("expected Fail, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn success_criteria_gate_writes_last_error_on_failure() {
        let dir = tempdir().unwrap();
        let logger = CommandLogger::new(dir.path().join("commands.jsonl"));
        let outcome = run_success_criteria_gate(
            &logger,
            "echo boom 1>&2; exit 1",
            Duration::from_secs(5),
            dir.path(),
            1,
            "STORY-001",
        )
        .await
        .unwrap();
        assert!(matches!(outcome, GateOutcome::Fail { .. }));
        let last_error = tokio::fs::read_to_string(dir.path().join("last_error.txt"))
            .await
            .unwrap();
        assert!(last_error.contains("boom"));
    }

    #[tokio::test]
    async fn success_criteria_gate_passes_on_zero_exit() {
        let dir = tempdir().unwrap();
        let logger = CommandLogger::new(dir.path().join("commands.jsonl"));
        let outcome = run_success_criteria_gate(
            &logger,
            "true",
            Duration::from_secs(5),
            dir.path(),
            1,
            "STORY-001",
        )
        .await
        .unwrap();
        assert_eq!(outcome, GateOutcome::Pass);
    }

    #[tokio::test]
    async fn hook_exit_75_is_verification_failed_not_generic() {
        let dir = tempdir().unwrap();
        let logger = CommandLogger::new(dir.path().join("commands.jsonl"));
        let outcome = run_post_iteration_hook(
            &logger,
            Some("sh -c 'exit 75' --"),
            dir.path(),
            &dir.path().join("out.log"),
            Duration::from_secs(5),
            1,
            "STORY-001",
        )
        .await
        .unwrap();
        assert!(matches!(outcome, GateOutcome::VerificationFailed { .. }));
    }

    #[tokio::test]
    async fn hook_passes_when_unset() {
        let dir = tempdir().unwrap();
        let logger = CommandLogger::new(dir.path().join("commands.jsonl"));
        let outcome = run_post_iteration_hook(
            &logger,
            None,
            dir.path(),
            &dir.path().join("out.log"),
            Duration::from_secs(5),
            1,
            "STORY-001",
        )
        .await
        .unwrap();
        assert_eq!(outcome, GateOutcome::Pass);
    }
}
