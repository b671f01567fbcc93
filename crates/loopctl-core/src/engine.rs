//! The run engine: the per-iteration state machine orchestrating every
//! other component. One `Engine` drives one feature to completion, a
//! circuit-breaker trip, a backlog corruption, the iteration cap, or a
//! user interrupt.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use loopctl_observability::CommandLogger;
use loopctl_research::ResearchPool;
use loopctl_subprocess::detector::{classify, extract_error, Signal};
use loopctl_subprocess::invoker::{self, InvokerConfig};
use loopctl_types::{Backlog, LoopError, RunStatus, StatusRecord};
use tokio_util::sync::CancellationToken;

use crate::atomic_io::write_atomic_str;
use crate::backlog::BacklogStore;
use crate::circuit_breaker::{CircuitBreaker, TripReason};
use crate::config::{Config, STORY_COMPLETE_TOKEN};
use crate::gates::{run_post_iteration_hook, run_quality_gate, run_success_criteria_gate, GateOutcome};
use crate::lockfile::LockfileCoordinator;
use crate::rate_limiter::{InteractivePrompt, RateLimiter, StdinPrompt, WaitOrExitChoice};
use crate::task_generator::write_task_file;

/// Default timeout for the interactive wait-or-exit prompt, per spec.md
/// §4.2.
const WAIT_OR_EXIT_TIMEOUT: Duration = Duration::from_secs(30);

/// Why a run terminated. Mirrors spec.md's `terminal(...)` states.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineOutcome {
    Success,
    CircuitBroken(TripReason),
    Corrupt { gaps: usize },
    MaxIterationsReached,
    Interrupted,
    UserExit,
}

impl EngineOutcome {
    /// The process exit code a CLI entry point should return for this
    /// outcome, per spec.md §6's exit-code table.
    pub fn exit_code(&self) -> i32 {
        match self {
            EngineOutcome::Success => 0,
            EngineOutcome::CircuitBroken(_) => 1,
            EngineOutcome::Corrupt { .. } => 1,
            EngineOutcome::MaxIterationsReached => 1,
            EngineOutcome::UserExit => 2,
            EngineOutcome::Interrupted => 130,
        }
    }
}

/// Everything the engine needs that is not already captured by `Config`:
/// filesystem locations and the AI subprocess's invocation shape.
pub struct EngineOptions {
    pub feature_dir: PathBuf,
    pub working_tree_root: PathBuf,
    pub lockfiles_dir: PathBuf,
    pub ai_program: String,
    pub ai_extra_args: Vec<String>,
    pub ai_output_format: Option<String>,
    pub ai_json: bool,
    pub hook_command: Option<String>,
    pub project_description: String,
    pub spec_text: Option<String>,
    /// Whether to prompt the user to wait or exit when the rate limit is
    /// hit, instead of unconditionally waiting for the hourly reset.
    pub interactive: bool,
}

pub struct Engine {
    opts: EngineOptions,
    config: Config,
    research_pool: ResearchPool,
    prompt: Arc<dyn InteractivePrompt>,
}

impl Engine {
    pub fn new(opts: EngineOptions, config: Config) -> Self {
        let research_pool = ResearchPool::new(config.research_max_agents as usize);
        Self {
            opts,
            config,
            research_pool,
            prompt: Arc::new(StdinPrompt),
        }
    }

    /// Override the interactive wait-or-exit prompt, e.g. with a fixed
    /// choice in tests.
    pub fn set_prompt(&mut self, prompt: Arc<dyn InteractivePrompt>) {
        self.prompt = prompt;
    }

    /// The quality-gate commands to run this iteration: either the single
    /// `all` command, or both `backend` and `frontend` when configured —
    /// spec.md's `quality_checks.all` (or `.backend` + `.frontend`) means
    /// a backend/frontend pair must *both* run and pass, not whichever
    /// one happens to be configured first.
    fn quality_check_commands(&self) -> Vec<(&str, &str)> {
        if let Some(all) = self.config.quality_check_all.as_deref() {
            return vec![("all", all)];
        }
        let mut commands = Vec::new();
        if let Some(backend) = self.config.quality_check_backend.as_deref() {
            commands.push(("backend", backend));
        }
        if let Some(frontend) = self.config.quality_check_frontend.as_deref() {
            commands.push(("frontend", frontend));
        }
        commands
    }

    fn invoker_config(&self) -> InvokerConfig {
        InvokerConfig {
            program: self.opts.ai_program.clone(),
            extra_args: self.opts.ai_extra_args.clone(),
            output_format: self.opts.ai_output_format.clone(),
            json: self.opts.ai_json,
            timeout: Duration::from_secs(self.config.timeout_minutes * 60),
        }
    }

    /// Spawn a research worker alongside the main loop. Exposed for
    /// callers (the CLI) that want to fire off background research
    /// before or during a run; the main iteration loop never calls this
    /// itself.
    pub async fn spawn_research(&mut self, topic: impl Into<String>, output_dir: PathBuf) {
        self.research_pool
            .spawn(topic, output_dir, self.invoker_config())
            .await;
    }

    async fn write_status_best_effort(
        &self,
        status: RunStatus,
        iteration: u32,
        backlog: &Backlog,
        current_story: Option<String>,
        rate_limiter: &RateLimiter,
        started_at: DateTime<Utc>,
    ) {
        let rl_state = rate_limiter.state();
        let record = StatusRecord {
            iteration,
            max_iterations: self.config.max_iterations,
            status,
            feature: self
                .opts
                .feature_dir
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            stories_complete: backlog.passes_count(),
            stories_total: backlog.total(),
            current_story,
            api_calls_used: rl_state.call_count,
            api_calls_limit: self.config.rate_limit_per_hour,
            rate_limit_resets_at: DateTime::from_timestamp(rl_state.hour_start + 3600, 0)
                .unwrap_or(started_at),
            started_at,
            last_updated: Utc::now(),
        };
        let path = self.opts.feature_dir.join("status.json");
        let json = match serde_json::to_string_pretty(&record) {
            Ok(json) => json,
            Err(err) => {
                tracing::warn!(error = %err, "failed to serialize status record");
                return;
            }
        };
        if let Err(err) = write_atomic_str(&path, &json).await {
            tracing::warn!(error = %err, "failed to write status record (best-effort)");
        }
    }

    /// Drive the feature to completion or a terminal failure. Checks
    /// `cancel` before starting each new iteration; a user interrupt
    /// never truncates state mid-iteration.
    pub async fn run(&mut self, cancel: CancellationToken) -> anyhow::Result<EngineOutcome> {
        tokio::fs::create_dir_all(&self.opts.feature_dir).await?;
        tokio::fs::create_dir_all(self.opts.feature_dir.join("logs")).await?;

        let lockfiles = LockfileCoordinator::new(self.opts.lockfiles_dir.clone());
        let _lock = lockfiles
            .acquire(&self.opts.feature_dir)
            .await
            .map_err(|err| LoopError::Environment(err.to_string()))?;

        let backlog_store = BacklogStore::new(&self.opts.feature_dir);
        let mut backlog = backlog_store.load().await?;

        let mut rate_limiter = RateLimiter::new(
            self.opts.feature_dir.join("rate_limiter.state"),
            self.config.rate_limit_per_hour,
        );
        rate_limiter.load().await?;

        let mut breaker = CircuitBreaker::new(
            self.opts.feature_dir.join("circuit_breaker.state"),
            self.config.no_progress_threshold,
            self.config.same_error_threshold,
        );
        breaker.load().await?;

        let logger = CommandLogger::new(self.opts.feature_dir.join("logs").join("commands.jsonl"));
        let started_at = Utc::now();

        if backlog.all_complete() {
            self.write_status_best_effort(
                RunStatus::Complete,
                0,
                &backlog,
                None,
                &rate_limiter,
                started_at,
            )
            .await;
            return Ok(EngineOutcome::Success);
        }

        for iteration in 1..=self.config.max_iterations {
            if cancel.is_cancelled() {
                self.write_status_best_effort(
                    RunStatus::Interrupted,
                    iteration,
                    &backlog,
                    None,
                    &rate_limiter,
                    started_at,
                )
                .await;
                self.research_pool.kill_all();
                return Ok(EngineOutcome::Interrupted);
            }

            rate_limiter.check_hour_reset();
            if !rate_limiter.check() {
                if self.opts.interactive
                    && self.prompt.ask_wait_or_exit(WAIT_OR_EXIT_TIMEOUT).await == WaitOrExitChoice::Exit
                {
                    self.write_status_best_effort(
                        RunStatus::Interrupted,
                        iteration,
                        &backlog,
                        None,
                        &rate_limiter,
                        started_at,
                    )
                    .await;
                    self.research_pool.kill_all();
                    return Ok(EngineOutcome::UserExit);
                }
                rate_limiter.wait_for_reset().await?;
            }

            let Some(story) = backlog.first_incomplete() else {
                self.write_status_best_effort(
                    RunStatus::Complete,
                    iteration,
                    &backlog,
                    None,
                    &rate_limiter,
                    started_at,
                )
                .await;
                return Ok(EngineOutcome::Success);
            };
            let story_id = story.id;
            let story = story.clone();

            let snapshot_before = backlog.passes_snapshot();

            let previous_error = tokio::fs::read_to_string(self.opts.feature_dir.join("last_error.txt"))
                .await
                .ok();
            let spec_excerpt = self.opts.spec_text.as_deref().and_then(|spec| {
                crate::task_generator::extract_story_section(spec, &story.title)
                    .map(|s| s.to_string())
            });

            write_task_file(
                &self.opts.feature_dir,
                &self.opts.working_tree_root,
                &self.opts.project_description,
                &story,
                spec_excerpt.as_deref(),
                previous_error.as_deref(),
            )
            .await?;

            let prompt = crate::task_generator::render_task_prompt(
                &self.opts.project_description,
                &story,
                spec_excerpt.as_deref(),
                previous_error.as_deref(),
            );

            let iteration_log_path = self
                .opts
                .feature_dir
                .join("logs")
                .join(format!("iteration-{iteration}.log"));
            let mut iteration_log = String::new();
            let invoker_config = self.invoker_config();
            let result = invoker::run(&invoker_config, &prompt, |line| {
                iteration_log.push_str(line);
                iteration_log.push('\n');
            })
            .await?;
            let _ = tokio::fs::write(&iteration_log_path, &iteration_log).await;

            rate_limiter.record_call().await?;
            logger
                .log(&loopctl_types::CommandLogEntry {
                    timestamp: Utc::now(),
                    source: loopctl_types::CommandSource::AiStream,
                    command: invoker_config.program.clone(),
                    exit_code: result.exit.code(),
                    duration_ms: 0,
                    iteration,
                    story_id: story_id.to_string(),
                })
                .await?;

            let signal = classify(
                &result.output,
                &backlog,
                &self.config.completion_promise,
                STORY_COMPLETE_TOKEN,
                &self.config.completion_custom_patterns,
            );

            let mut error_this_iteration: Option<String> = None;

            match signal {
                Signal::Complete => {
                    self.write_status_best_effort(
                        RunStatus::Complete,
                        iteration,
                        &backlog,
                        None,
                        &rate_limiter,
                        started_at,
                    )
                    .await;
                    return Ok(EngineOutcome::Success);
                }
                Signal::StoryComplete => {
                    let quality = run_quality_gate(
                        &logger,
                        &self.quality_check_commands(),
                        iteration,
                        &story_id.to_string(),
                    )
                    .await?;
                    let success = match &self.config.success_criteria_command {
                        Some(command) => {
                            run_success_criteria_gate(
                                &logger,
                                command,
                                Duration::from_secs(self.config.success_criteria_timeout),
                                &self.opts.feature_dir,
                                iteration,
                                &story_id.to_string(),
                            )
                            .await?
                        }
                        None => GateOutcome::Pass,
                    };
                    let hook = if self.config.hooks_enabled {
                        run_post_iteration_hook(
                            &logger,
                            self.opts.hook_command.as_deref(),
                            &self.opts.feature_dir,
                            &iteration_log_path,
                            Duration::from_secs(300),
                            iteration,
                            &story_id.to_string(),
                        )
                        .await?
                    } else {
                        GateOutcome::Pass
                    };

                    if quality.is_pass() && success.is_pass() && hook.is_pass() {
                        backlog.mark_complete(&story_id)?;
                        backlog_store.save(&backlog).await?;
                        backlog_store
                            .append_progress_block(&format!(
                                "{story_id} completed at iteration {iteration}"
                            ))
                            .await?;
                        let _ = tokio::fs::remove_file(self.opts.feature_dir.join("last_error.txt")).await;
                    } else {
                        backlog_store.rollback_to(&mut backlog, &snapshot_before).await?;
                        error_this_iteration = [quality, success, hook]
                            .into_iter()
                            .find_map(|outcome| match outcome {
                                GateOutcome::Fail { output } | GateOutcome::VerificationFailed { output } => {
                                    Some(output)
                                }
                                GateOutcome::Timeout => Some("gate timed out".to_string()),
                                GateOutcome::Pass => None,
                            });
                    }
                }
                Signal::ApiLimit => {
                    rate_limiter.wait_for_reset().await?;
                    continue;
                }
                Signal::Continue => {
                    error_this_iteration = extract_error(&result.output);
                }
            }

            if let Some(err) = &error_this_iteration {
                breaker.record_error(err).await?;
            }
            let snapshot_after = backlog.passes_snapshot();
            breaker.record_progress(&snapshot_before, &snapshot_after).await?;

            if let Some(reason) = breaker.tripped() {
                self.write_status_best_effort(
                    RunStatus::Error,
                    iteration,
                    &backlog,
                    Some(story_id.to_string()),
                    &rate_limiter,
                    started_at,
                )
                .await;
                self.research_pool.kill_all();
                return Ok(EngineOutcome::CircuitBroken(reason));
            }

            let gaps = backlog.check_sequential();
            if !gaps.is_empty() {
                self.write_status_best_effort(
                    RunStatus::Error,
                    iteration,
                    &backlog,
                    Some(story_id.to_string()),
                    &rate_limiter,
                    started_at,
                )
                .await;
                self.research_pool.kill_all();
                return Ok(EngineOutcome::Corrupt { gaps: gaps.len() });
            }

            self.write_status_best_effort(
                RunStatus::Running,
                iteration,
                &backlog,
                Some(story_id.to_string()),
                &rate_limiter,
                started_at,
            )
            .await;
        }

        self.write_status_best_effort(
            RunStatus::Error,
            self.config.max_iterations,
            &backlog,
            None,
            &rate_limiter,
            started_at,
        )
        .await;
        Ok(EngineOutcome::MaxIterationsReached)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc as ChronoUtc;
    use loopctl_types::{Story, StoryId};
    use tempfile::tempdir;

    fn backlog_with(passes: &[bool]) -> Backlog {
        Backlog {
            description: "demo".into(),
            created_at: ChronoUtc::now(),
            user_stories: passes
                .iter()
                .enumerate()
                .map(|(i, &p)| Story {
                    id: StoryId::new(i as u32 + 1),
                    title: format!("story {i}"),
                    description: String::new(),
                    acceptance_criteria: vec![],
                    priority: 0,
                    passes: p,
                    notes: String::new(),
                    model: None,
                    mcp_servers: None,
                    extra: Default::default(),
                })
                .collect(),
            success_criteria_command: None,
        }
    }

    fn test_options(feature_dir: PathBuf, lockfiles_dir: PathBuf) -> EngineOptions {
        EngineOptions {
            working_tree_root: feature_dir.clone(),
            feature_dir,
            lockfiles_dir,
            ai_program: "sh".into(),
            ai_extra_args: vec![],
            ai_output_format: None,
            ai_json: false,
            hook_command: None,
            project_description: "demo project".into(),
            spec_text: None,
            interactive: false,
        }
    }

    #[tokio::test]
    async fn run_returns_success_immediately_when_backlog_is_already_complete() {
        let dir = tempdir().unwrap();
        let locks = tempdir().unwrap();
        let store = BacklogStore::new(dir.path());
        store.save(&backlog_with(&[true, true])).await.unwrap();

        let mut engine = Engine::new(
            test_options(dir.path().to_path_buf(), locks.path().to_path_buf()),
            Config::default(),
        );
        let outcome = engine.run(CancellationToken::new()).await.unwrap();
        assert_eq!(outcome, EngineOutcome::Success);
    }

    struct FixedPrompt(crate::rate_limiter::WaitOrExitChoice);

    #[async_trait::async_trait]
    impl crate::rate_limiter::InteractivePrompt for FixedPrompt {
        async fn ask_wait_or_exit(&self, _timeout: Duration) -> crate::rate_limiter::WaitOrExitChoice {
            self.0
        }
    }

    #[tokio::test]
    async fn interactive_exit_choice_stops_the_run_with_user_exit() {
        let dir = tempdir().unwrap();
        let locks = tempdir().unwrap();
        let store = BacklogStore::new(dir.path());
        store.save(&backlog_with(&[false])).await.unwrap();

        let mut opts = test_options(dir.path().to_path_buf(), locks.path().to_path_buf());
        opts.interactive = true;
        let mut config = Config::default();
        config.rate_limit_per_hour = 0;
        let mut engine = Engine::new(opts, config);
        engine.set_prompt(Arc::new(FixedPrompt(crate::rate_limiter::WaitOrExitChoice::Exit)));

        let outcome = engine.run(CancellationToken::new()).await.unwrap();
        assert_eq!(outcome, EngineOutcome::UserExit);
        assert_eq!(outcome.exit_code(), 2);
    }

    #[tokio::test]
    async fn run_reports_interrupted_when_cancel_is_already_set() {
        let dir = tempdir().unwrap();
        let locks = tempdir().unwrap();
        let store = BacklogStore::new(dir.path());
        store.save(&backlog_with(&[false])).await.unwrap();

        let mut engine = Engine::new(
            test_options(dir.path().to_path_buf(), locks.path().to_path_buf()),
            Config::default(),
        );
        let cancel = CancellationToken::new();
        cancel.cancel();
        let outcome = engine.run(cancel).await.unwrap();
        assert_eq!(outcome, EngineOutcome::Interrupted);
    }
}
