use std::process::Stdio;
use std::time::Duration;

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::time::timeout;

/// The three AI tool command families the invoker can assemble an
/// argument vector for. Unknown program names fall through to `Claude`,
/// which also covers user-configured aliases of the same shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandFamily {
    Claude,
    Codex,
    Gemini,
}

impl CommandFamily {
    /// Detect a family from a program's basename. Matching is a
    /// case-insensitive substring check against the basename only, so a
    /// full path like `/usr/local/bin/claude-beta` still matches.
    pub fn detect(program: &str) -> Self {
        let basename = program
            .rsplit(['/', '\\'])
            .next()
            .unwrap_or(program)
            .to_lowercase();
        if basename.contains("codex") {
            CommandFamily::Codex
        } else if basename.contains("gemini") {
            CommandFamily::Gemini
        } else {
            CommandFamily::Claude
        }
    }
}

/// Configuration needed to assemble and run one AI subprocess invocation.
#[derive(Debug, Clone)]
pub struct InvokerConfig {
    pub program: String,
    pub extra_args: Vec<String>,
    pub output_format: Option<String>,
    pub json: bool,
    pub timeout: Duration,
}

impl InvokerConfig {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            extra_args: Vec::new(),
            output_format: None,
            json: false,
            timeout: Duration::from_secs(15 * 60),
        }
    }

    /// Build the full argument vector for this program's detected family.
    pub fn build_args(&self) -> Vec<String> {
        let family = CommandFamily::detect(&self.program);
        let mut args = Vec::new();
        match family {
            CommandFamily::Claude => {
                args.push("-p".to_string());
                args.extend(self.extra_args.clone());
                if let Some(fmt) = &self.output_format {
                    args.push("--output-format".to_string());
                    args.push(fmt.clone());
                }
                args.push("--verbose".to_string());
            }
            CommandFamily::Codex => {
                args.push("exec".to_string());
                args.push("-".to_string());
                args.extend(self.extra_args.clone());
                if self.json {
                    args.push("--json".to_string());
                }
            }
            CommandFamily::Gemini => {
                args.push("-p".to_string());
                args.extend(self.extra_args.clone());
                if let Some(fmt) = &self.output_format {
                    args.push("--output-format".to_string());
                    args.push(fmt.clone());
                }
            }
        }
        args
    }
}

/// The exit status of one invocation, distinguishing a timeout (124) from
/// whatever code the subprocess itself returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvocationExit {
    Exited(i32),
    TimedOut,
}

impl InvocationExit {
    pub fn code(&self) -> i32 {
        match self {
            InvocationExit::Exited(code) => *code,
            InvocationExit::TimedOut => 124,
        }
    }
}

#[derive(Debug, Clone)]
pub struct InvocationResult {
    pub exit: InvocationExit,
    pub output: String,
}

/// Run `config`'s program with `prompt` delivered on stdin, streaming
/// combined stdout/stderr line-by-line to `on_line` while also
/// accumulating the full text for the caller. Runs under `config.timeout`;
/// on expiry the child is killed and the result reports `TimedOut`.
pub async fn run(
    config: &InvokerConfig,
    prompt: &str,
    on_line: impl FnMut(&str),
) -> anyhow::Result<InvocationResult> {
    run_raw(&config.program, &config.build_args(), prompt, config.timeout, on_line).await
}

/// Lower-level variant of [`run`] that takes an already-assembled program
/// and argument vector, used directly by callers (and tests) that do not
/// need family detection.
pub async fn run_raw(
    program: &str,
    args: &[String],
    prompt: &str,
    timeout_duration: Duration,
    mut on_line: impl FnMut(&str),
) -> anyhow::Result<InvocationResult> {
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .with_context(|| format!("failed to spawn {program}"))?;

    let mut stdin = child.stdin.take().context("child stdin not piped")?;
    let prompt = prompt.to_string();
    let write_task = tokio::spawn(async move {
        let _ = stdin.write_all(prompt.as_bytes()).await;
        let _ = stdin.shutdown().await;
    });

    let stdout = child.stdout.take().context("child stdout not piped")?;
    let stderr = child.stderr.take().context("child stderr not piped")?;
    let mut stdout_lines = BufReader::new(stdout).lines();
    let mut stderr_lines = BufReader::new(stderr).lines();

    let mut output = String::new();
    let read_and_wait = async {
        let mut stdout_done = false;
        let mut stderr_done = false;
        while !stdout_done || !stderr_done {
            tokio::select! {
                line = stdout_lines.next_line(), if !stdout_done => {
                    match line? {
                        Some(line) => {
                            on_line(&line);
                            output.push_str(&line);
                            output.push('\n');
                        }
                        None => stdout_done = true,
                    }
                }
                line = stderr_lines.next_line(), if !stderr_done => {
                    match line? {
                        Some(line) => {
                            on_line(&line);
                            output.push_str(&line);
                            output.push('\n');
                        }
                        None => stderr_done = true,
                    }
                }
            }
        }
        let status = child.wait().await?;
        anyhow::Ok(status.code().unwrap_or(-1))
    };

    let result = timeout(timeout_duration, read_and_wait).await;
    let _ = write_task.await;

    match result {
        Ok(Ok(code)) => Ok(InvocationResult {
            exit: InvocationExit::Exited(code),
            output,
        }),
        Ok(Err(err)) => Err(err),
        Err(_) => {
            let _ = child.start_kill();
            Ok(InvocationResult {
                exit: InvocationExit::TimedOut,
                output,
            })
        }
    }
}
