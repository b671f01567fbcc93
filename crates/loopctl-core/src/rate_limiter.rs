//! Hour-windowed token bucket pacing AI subprocess invocations.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use loopctl_types::RateLimiterState;
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::atomic_io::{read_to_string_opt, write_atomic_str};

/// The user's choice when the rate limit is hit during an interactive run,
/// per spec.md §4.2's "wait or exit" prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOrExitChoice {
    Wait,
    Exit,
}

/// Abstracts the interactive wait-or-exit prompt so the engine's rate-limit
/// path can be tested without a real terminal.
#[async_trait]
pub trait InteractivePrompt: Send + Sync {
    async fn ask_wait_or_exit(&self, timeout: Duration) -> WaitOrExitChoice;
}

/// Prompts on stdout and reads a line from stdin: `e`/`exit` (any case)
/// chooses `Exit`, anything else — including a timeout or a read error —
/// defaults to `Wait`.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdinPrompt;

#[async_trait]
impl InteractivePrompt for StdinPrompt {
    async fn ask_wait_or_exit(&self, timeout: Duration) -> WaitOrExitChoice {
        println!(
            "Rate limit reached. Wait for reset or exit? [w/e] (defaults to wait in {}s): ",
            timeout.as_secs()
        );
        let mut line = String::new();
        let mut reader = BufReader::new(tokio::io::stdin());
        match tokio::time::timeout(timeout, reader.read_line(&mut line)).await {
            Ok(Ok(_)) => match line.trim().to_lowercase().as_str() {
                "e" | "exit" => WaitOrExitChoice::Exit,
                _ => WaitOrExitChoice::Wait,
            },
            _ => WaitOrExitChoice::Wait,
        }
    }
}

/// Abstracts wall-clock reads and sleeping so the hour-rollover path can
/// be tested without a real 3600-second wait.
#[async_trait]
pub trait Clock: Send + Sync {
    fn now_secs(&self) -> i64;
    async fn sleep(&self, duration: Duration);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now_secs(&self) -> i64 {
        Utc::now().timestamp()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Round `t` down to the start of its containing wall-clock hour.
fn hour_start(t: i64) -> i64 {
    t - t.rem_euclid(3600)
}

pub struct RateLimiter<C: Clock = SystemClock> {
    path: PathBuf,
    limit: u32,
    clock: C,
    state: RateLimiterState,
}

impl RateLimiter<SystemClock> {
    pub fn new(path: impl Into<PathBuf>, limit: u32) -> Self {
        Self::with_clock(path, limit, SystemClock)
    }
}

impl<C: Clock> RateLimiter<C> {
    pub fn with_clock(path: impl Into<PathBuf>, limit: u32, clock: C) -> Self {
        Self {
            path: path.into(),
            limit,
            clock,
            state: RateLimiterState::default(),
        }
    }

    pub fn state(&self) -> RateLimiterState {
        self.state
    }

    /// Load persisted state, or initialize a fresh window at the current
    /// hour if no state file exists yet.
    pub async fn load(&mut self) -> anyhow::Result<()> {
        match read_to_string_opt(&self.path).await? {
            Some(contents) => self.state = RateLimiterState::parse(&contents),
            None => {
                self.state = RateLimiterState {
                    call_count: 0,
                    hour_start: hour_start(self.clock.now_secs()),
                };
            }
        }
        Ok(())
    }

    pub async fn save(&self) -> anyhow::Result<()> {
        write_atomic_str(&self.path, &self.state.to_file_contents()).await
    }

    /// If the wall clock has advanced into a new hour window, reset the
    /// counter and move `hour_start` forward. Returns whether a reset
    /// occurred.
    pub fn check_hour_reset(&mut self) -> bool {
        let current_hour = hour_start(self.clock.now_secs());
        if current_hour > self.state.hour_start {
            self.state.call_count = 0;
            self.state.hour_start = current_hour;
            true
        } else {
            false
        }
    }

    pub fn check(&self) -> bool {
        self.state.call_count < self.limit
    }

    pub async fn record_call(&mut self) -> anyhow::Result<()> {
        self.state.call_count += 1;
        self.save().await
    }

    /// Sleep in 60-second increments (logging a countdown each chunk)
    /// until the hour boundary passes, then reset and return. With a
    /// fake `Clock` whose `sleep` simply advances the mock clock, this
    /// resolves without any real wall-clock delay.
    pub async fn wait_for_reset(&mut self) -> anyhow::Result<()> {
        loop {
            if self.check_hour_reset() {
                self.save().await?;
                return Ok(());
            }
            let now = self.clock.now_secs();
            let remaining = (self.state.hour_start + 3600 - now).max(1);
            tracing::info!(remaining_secs = remaining, "rate limit reached, waiting for hourly reset");
            let step = Duration::from_secs(remaining.min(60) as u64);
            self.clock.sleep(step).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI64, Ordering};
    use std::sync::Arc;
    use tempfile::tempdir;

    struct FakeClock {
        now: Arc<AtomicI64>,
    }

    #[async_trait]
    impl Clock for FakeClock {
        fn now_secs(&self) -> i64 {
            self.now.load(Ordering::SeqCst)
        }

        async fn sleep(&self, duration: Duration) {
            self.now.fetch_add(duration.as_secs() as i64, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn record_call_persists_incremented_count() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("rate_limiter.state");
        let clock = Arc::new(AtomicI64::new(1_700_000_000));
        let mut rl = RateLimiter::with_clock(&path, 5, FakeClock { now: clock.clone() });
        rl.load().await.unwrap();
        rl.record_call().await.unwrap();
        rl.record_call().await.unwrap();

        let mut reloaded = RateLimiter::with_clock(&path, 5, FakeClock { now: clock });
        reloaded.load().await.unwrap();
        assert_eq!(reloaded.state().call_count, 2);
    }

    #[tokio::test]
    async fn hour_rollover_resets_count() {
        let now = Arc::new(AtomicI64::new(1_700_000_000));
        let mut rl = RateLimiter::with_clock(
            tempdir().unwrap().path().join("state"),
            1,
            FakeClock { now: now.clone() },
        );
        rl.load().await.unwrap();
        rl.record_call().await.unwrap();
        assert!(!rl.check());

        now.fetch_add(3600, Ordering::SeqCst);
        let reset = rl.check_hour_reset();
        assert!(reset);
        assert!(rl.check());
        assert_eq!(rl.state().call_count, 0);
    }

    #[tokio::test]
    async fn wait_for_reset_resolves_once_clock_crosses_hour_boundary() {
        let now = Arc::new(AtomicI64::new(1_700_000_000));
        let mut rl = RateLimiter::with_clock(
            tempdir().unwrap().path().join("state"),
            1,
            FakeClock { now: now.clone() },
        );
        rl.load().await.unwrap();
        rl.record_call().await.unwrap();
        assert!(!rl.check());

        rl.wait_for_reset().await.unwrap();
        assert!(rl.check());
        assert_eq!(rl.state().call_count, 0);
    }

    struct FixedPrompt(WaitOrExitChoice);

    #[async_trait]
    impl InteractivePrompt for FixedPrompt {
        async fn ask_wait_or_exit(&self, _timeout: Duration) -> WaitOrExitChoice {
            self.0
        }
    }

    #[tokio::test]
    async fn fixed_prompt_returns_configured_choice() {
        let prompt = FixedPrompt(WaitOrExitChoice::Exit);
        assert_eq!(
            prompt.ask_wait_or_exit(Duration::from_secs(30)).await,
            WaitOrExitChoice::Exit
        );
    }

    #[tokio::test]
    async fn count_never_exceeds_limit_within_one_hour_window() {
        let now = Arc::new(AtomicI64::new(1_700_000_000));
        let mut rl = RateLimiter::with_clock(
            tempdir().unwrap().path().join("state"),
            3,
            FakeClock { now: now.clone() },
        );
        rl.load().await.unwrap();
        for _ in 0..3 {
            rl.check_hour_reset();
            if rl.check() {
                rl.record_call().await.unwrap();
            }
        }
        assert_eq!(rl.state().call_count, 3);
        assert!(!rl.check());
    }
}
