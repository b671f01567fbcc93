use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::Utc;
use clap::{Parser, Subcommand};
use loopctl_core::{
    feature_dir_for_branch, load_config, resolve_current_branch, resolve_user_config_path,
    sanitize_branch_name, BacklogStore, CircuitBreaker, Engine, EngineOptions, EngineOutcome,
    LockfileCoordinator,
};
use loopctl_observability::{analyze_redundancy, init_process_logging, ProcessKind};
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "loopctl")]
#[command(about = "Drives an iterative AI-assisted story loop over a project backlog")]
struct Cli {
    /// Project root directory. Defaults to the current directory.
    #[arg(long, global = true, default_value = ".")]
    project_root: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the loop against the current feature's backlog until it
    /// completes, trips the circuit breaker, or exhausts its iteration cap.
    Run {
        /// AI subprocess command to invoke (claude/codex/gemini family, or
        /// an alias; unknown names fall back to the Claude shape).
        #[arg(long, env = "LOOPCTL_AI_PROGRAM", default_value = "claude")]
        ai_program: String,
        /// Extra arguments forwarded verbatim to the AI subprocess.
        #[arg(long = "ai-arg")]
        ai_extra_args: Vec<String>,
        /// `--output-format` value passed to Claude/Gemini-family commands.
        #[arg(long)]
        ai_output_format: Option<String>,
        /// Pass `--json` to Codex-family commands.
        #[arg(long)]
        ai_json: bool,
        /// Post-iteration hook command (receives the context-file path as
        /// its final argument).
        #[arg(long)]
        hook_command: Option<String>,
        /// Path to the long-form specification, relative to the project
        /// root. Its matching section is excerpted into each story's
        /// prompt when a heading matches the story title.
        #[arg(long, default_value = "spec.md")]
        spec_path: PathBuf,
        /// Exit 100 instead of 0 when this invocation is the one that
        /// drove the backlog to completion (0 is used in every other
        /// success case, including "already complete on entry").
        #[arg(long)]
        distinct_success_code: bool,
        /// Success-criteria command, overriding any project config or
        /// backlog-file value. Resolution order is CLI flag, then project
        /// config, then the backlog file's own `successCriteriaCommand`.
        #[arg(long)]
        success_criteria_command: Option<String>,
        /// Prompt to wait or exit (default 30s timeout) when the rate
        /// limit is hit, instead of always waiting for the hourly reset.
        #[arg(long)]
        interactive: bool,
    },
    /// Print the current feature's status record.
    Status,
    /// Report lockfile conflicts and circuit-breaker trips with
    /// actionable next steps.
    Doctor,
    /// Clear a tripped circuit breaker's persisted counters.
    ResetCircuit,
    /// Release the lockfile for an absolute feature path.
    ReleaseLock {
        /// Absolute feature path whose lock should be released.
        path: PathBuf,
    },
    /// Report commands executed more than once within one iteration,
    /// grouped by (command, iteration).
    AnalyzeCommands,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let project_root = cli
        .project_root
        .canonicalize()
        .unwrap_or(cli.project_root.clone());
    let core_dir = project_root.join(".loopctl");
    let feature_dir = resolve_feature_dir(&project_root, &core_dir)?;

    let _guard = init_process_logging(
        ProcessKind::Engine,
        &feature_dir.join("logs"),
        30,
    )
    .ok();

    match cli.command {
        Command::Run {
            ai_program,
            ai_extra_args,
            ai_output_format,
            ai_json,
            hook_command,
            spec_path,
            distinct_success_code,
            success_criteria_command,
            interactive,
        } => {
            run(
                &project_root,
                &feature_dir,
                ai_program,
                ai_extra_args,
                ai_output_format,
                ai_json,
                hook_command,
                spec_path,
                distinct_success_code,
                success_criteria_command,
                interactive,
            )
            .await
        }
        Command::Status => status(&feature_dir).await,
        Command::Doctor => doctor(&project_root, &feature_dir).await,
        Command::ResetCircuit => reset_circuit(&feature_dir).await,
        Command::ReleaseLock { path } => release_lock(&path).await,
        Command::AnalyzeCommands => analyze_commands(&feature_dir).await,
    }
}

/// `.loopctl/<sanitized-branch>`, keyed by the working tree's current
/// git branch. Falls back to a fixed `default` key outside a git
/// repository so every command still has somewhere to read/write.
fn resolve_feature_dir(project_root: &Path, core_dir: &Path) -> anyhow::Result<PathBuf> {
    match resolve_current_branch(project_root) {
        Ok(branch) => Ok(feature_dir_for_branch(core_dir, &branch)),
        Err(_) => Ok(core_dir.join(sanitize_branch_name("default"))),
    }
}

/// Central, per-user lockfile directory (shared across every project on
/// the host), overridable for tests and unusual environments.
fn lockfiles_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("LOOPCTL_LOCKFILES_DIR") {
        return PathBuf::from(dir);
    }
    match dirs::data_dir() {
        Some(dir) => dir.join("loopctl").join("lockfiles"),
        None => PathBuf::from(".loopctl-lockfiles"),
    }
}

#[allow(clippy::too_many_arguments)]
async fn run(
    project_root: &Path,
    feature_dir: &Path,
    ai_program: String,
    ai_extra_args: Vec<String>,
    ai_output_format: Option<String>,
    ai_json: bool,
    hook_command: Option<String>,
    spec_path: PathBuf,
    distinct_success_code: bool,
    success_criteria_command: Option<String>,
    interactive: bool,
) -> anyhow::Result<()> {
    tokio::fs::create_dir_all(feature_dir).await?;

    let project_config_path = project_root.join(".loopctl").join("config.yaml");
    let mut config = load_config(&project_config_path).await?;

    let spec_text = tokio::fs::read_to_string(project_root.join(&spec_path))
        .await
        .ok();

    let backlog_store = BacklogStore::new(feature_dir);
    let backlog = backlog_store
        .load()
        .await
        .context("failed to load backlog.json; run the planning phase first")?;
    let project_description = backlog.description.clone();
    let was_already_complete = backlog.all_complete();

    // CLI flag, then project/user config + env, then the backlog file's
    // own override — first-found wins.
    config.success_criteria_command = success_criteria_command
        .or(config.success_criteria_command)
        .or_else(|| backlog.success_criteria_command.clone());

    let opts = EngineOptions {
        feature_dir: feature_dir.to_path_buf(),
        working_tree_root: project_root.to_path_buf(),
        lockfiles_dir: lockfiles_dir(),
        ai_program,
        ai_extra_args,
        ai_output_format,
        ai_json,
        hook_command,
        project_description,
        spec_text,
        interactive,
    };

    let mut engine = Engine::new(opts, config);

    let cancel = CancellationToken::new();
    let cancel_for_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, stopping before the next iteration");
            cancel_for_signal.cancel();
        }
    });

    let outcome = engine.run(cancel).await?;

    print_outcome(&outcome);

    let exit_code = match (&outcome, distinct_success_code) {
        (EngineOutcome::Success, true) if !was_already_complete => 100,
        _ => outcome.exit_code(),
    };
    std::process::exit(exit_code);
}

fn print_outcome(outcome: &EngineOutcome) {
    match outcome {
        EngineOutcome::Success => println!("loopctl: all stories pass"),
        EngineOutcome::CircuitBroken(reason) => {
            println!(
                "loopctl: circuit breaker tripped ({reason:?}). Run `loopctl reset-circuit` \
                 after addressing the underlying cause."
            );
        }
        EngineOutcome::Corrupt { gaps } => {
            println!(
                "loopctl: backlog is corrupt ({gaps} sequential gap(s)). A story later in the \
                 backlog is marked complete while an earlier one is not; fix the backlog before \
                 re-running."
            );
        }
        EngineOutcome::MaxIterationsReached => {
            println!("loopctl: reached the maximum iteration count without completing the backlog");
        }
        EngineOutcome::Interrupted => println!("loopctl: interrupted by user"),
        EngineOutcome::UserExit => {
            println!("loopctl: exited at user request after hitting the rate limit")
        }
    }
}

async fn status(feature_dir: &Path) -> anyhow::Result<()> {
    let path = feature_dir.join("status.json");
    match tokio::fs::read_to_string(&path).await {
        Ok(raw) => {
            let value: serde_json::Value = serde_json::from_str(&raw)?;
            println!("{}", serde_json::to_string_pretty(&value)?);
        }
        Err(_) => println!("loopctl: no status record yet at {}", path.display()),
    }
    Ok(())
}

async fn doctor(project_root: &Path, feature_dir: &Path) -> anyhow::Result<()> {
    println!("loopctl doctor — {}", feature_dir.display());

    let lockfiles = LockfileCoordinator::new(lockfiles_dir());
    match lockfiles.acquire(feature_dir).await {
        Ok(_held) => println!("  lockfile: no conflicting run holds this feature path"),
        Err(err) => println!(
            "  lockfile: CONFLICT — {err}\n    next step: if the owning process is gone, run \
             `loopctl release-lock <path>`"
        ),
    }

    let breaker_path = feature_dir.join("circuit_breaker.state");
    let mut breaker = CircuitBreaker::new(&breaker_path, u32::MAX, u32::MAX);
    breaker.load().await?;
    let state = breaker.state();
    if state.no_progress_count > 0 || state.same_error_count > 0 {
        println!(
            "  circuit breaker: no_progress={} same_error={}\n    next step: run \
             `loopctl reset-circuit` once the underlying issue is fixed",
            state.no_progress_count, state.same_error_count
        );
    } else {
        println!("  circuit breaker: clean");
    }

    let backlog_store = BacklogStore::new(feature_dir);
    match backlog_store.load().await {
        Ok(backlog) => {
            let gaps = backlog.check_sequential();
            if gaps.is_empty() {
                println!(
                    "  backlog: {}/{} stories complete, sequential",
                    backlog.passes_count(),
                    backlog.total()
                );
            } else {
                println!(
                    "  backlog: CORRUPT — {} sequential gap(s)\n    next step: fix the backlog \
                     file by hand, the loop refuses to continue until it is sequential again",
                    gaps.len()
                );
            }
        }
        Err(_) => println!(
            "  backlog: none found under {}\n    next step: run the planning phase to create \
             backlog.json",
            feature_dir.display()
        ),
    }

    let project_config_path = project_root.join(".loopctl").join("config.yaml");
    println!(
        "  config layers: user={} project={}",
        resolve_user_config_path().display(),
        project_config_path.display()
    );

    Ok(())
}

async fn reset_circuit(feature_dir: &Path) -> anyhow::Result<()> {
    let mut breaker = CircuitBreaker::new(feature_dir.join("circuit_breaker.state"), 0, 0);
    breaker.reset().await?;
    println!("loopctl: circuit breaker state cleared at {}", Utc::now().to_rfc3339());
    Ok(())
}

async fn release_lock(path: &Path) -> anyhow::Result<()> {
    let lockfiles = LockfileCoordinator::new(lockfiles_dir());
    let target = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    if lockfiles.release(&target).await? {
        println!("loopctl: released lock for {}", target.display());
    } else {
        println!(
            "loopctl: no lock owned by this process was found for {}",
            target.display()
        );
    }
    Ok(())
}

async fn analyze_commands(feature_dir: &Path) -> anyhow::Result<()> {
    let path = feature_dir.join("logs").join("commands.jsonl");
    let raw = tokio::fs::read_to_string(&path)
        .await
        .with_context(|| format!("no command log at {}", path.display()))?;

    let entries: Vec<loopctl_types::CommandLogEntry> = raw
        .lines()
        .filter(|l| !l.trim().is_empty())
        .filter_map(|l| serde_json::from_str(l).ok())
        .collect();

    let reports = analyze_redundancy(&entries);
    if reports.is_empty() {
        println!("loopctl: no redundant command executions found");
        return Ok(());
    }

    for report in reports {
        println!(
            "iteration {:>3}  {:<28}  ran {}x  wasted {}ms  [{:?}]",
            report.iteration, report.command, report.count, report.redundant_duration_ms, report.suggestion
        );
    }
    Ok(())
}
