use std::path::PathBuf;
use std::sync::Arc;

use loopctl_subprocess::invoker::{self, InvocationExit, InvokerConfig};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

/// Outcome of one research worker.
#[derive(Debug, Clone)]
pub struct ResearchOutcome {
    pub topic: String,
    pub slug: String,
    pub output_path: PathBuf,
    pub exit: InvocationExit,
    pub timed_out: bool,
}

/// Lowercase, spaces to hyphens, drop non-`[a-z0-9-]`, collapse runs of
/// `-`, trim leading/trailing `-`.
pub fn slugify(topic: &str) -> String {
    let lowered = topic.to_lowercase().replace(' ', "-");
    let filtered: String = lowered
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-')
        .collect();
    let mut collapsed = String::with_capacity(filtered.len());
    let mut last_was_dash = false;
    for c in filtered.chars() {
        if c == '-' {
            if last_was_dash {
                continue;
            }
            last_was_dash = true;
        } else {
            last_was_dash = false;
        }
        collapsed.push(c);
    }
    collapsed.trim_matches('-').to_string()
}

/// A bounded-concurrency spawner of background research AI calls.
/// Workers share no state; the pool's only cross-worker invariant is the
/// concurrency cap `capacity`.
pub struct ResearchPool {
    capacity: usize,
    semaphore: Arc<Semaphore>,
    tasks: JoinSet<ResearchOutcome>,
}

impl ResearchPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            semaphore: Arc::new(Semaphore::new(capacity)),
            tasks: JoinSet::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn active_count(&self) -> usize {
        self.tasks.len()
    }

    /// Spawn a research worker for `topic`. Blocks until a concurrency
    /// slot is available when the pool is already at `capacity`.
    pub async fn spawn(&mut self, topic: impl Into<String>, output_dir: PathBuf, config: InvokerConfig) {
        let topic = topic.into();
        let slug = slugify(&topic);
        let output_path = output_dir.join(format!("RESEARCH-{slug}.md"));
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .expect("semaphore is never closed while the pool is alive");

        self.tasks.spawn(async move {
            let _permit = permit;
            run_worker(topic, slug, output_path, config).await
        });
    }

    /// Wait for the next worker to finish, if any are active.
    pub async fn wait_any(&mut self) -> Option<ResearchOutcome> {
        match self.tasks.join_next().await {
            Some(Ok(outcome)) => Some(outcome),
            Some(Err(_join_err)) => None,
            None => None,
        }
    }

    /// Wait for every currently active worker to finish.
    pub async fn wait_all(&mut self) -> Vec<ResearchOutcome> {
        let mut outcomes = Vec::new();
        while let Some(outcome) = self.wait_any().await {
            outcomes.push(outcome);
        }
        outcomes
    }

    /// Abort every active worker without waiting for it to finish.
    pub fn kill_all(&mut self) {
        self.tasks.abort_all();
    }

    /// Abort any active workers and restore a clean pool at full
    /// capacity, ready for reuse.
    pub async fn reset(&mut self) {
        self.kill_all();
        while self.tasks.join_next().await.is_some() {}
        self.semaphore = Arc::new(Semaphore::new(self.capacity));
    }
}

async fn run_worker(
    topic: String,
    slug: String,
    output_path: PathBuf,
    config: InvokerConfig,
) -> ResearchOutcome {
    let prompt = format!("Research topic: {topic}\n\nProduce findings as markdown.");
    let mut collected = String::new();
    let result = invoker::run(&config, &prompt, |line| {
        collected.push_str(line);
        collected.push('\n');
    })
    .await;

    let (exit, timed_out, mut body) = match result {
        Ok(result) => {
            let timed_out = result.exit == InvocationExit::TimedOut;
            (result.exit, timed_out, result.output)
        }
        Err(err) => (
            InvocationExit::Exited(-1),
            false,
            format!("research worker failed to run: {err}"),
        ),
    };

    if timed_out {
        body.push_str(&format!(
            "\n\n---\n**Research agent timed out after {:?} investigating \"{topic}\".**\n",
            config.timeout
        ));
    }

    if let Some(parent) = output_path.parent() {
        let _ = tokio::fs::create_dir_all(parent).await;
    }
    let _ = tokio::fs::write(&output_path, body).await;

    ResearchOutcome {
        topic,
        slug,
        output_path,
        exit,
        timed_out,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::tempdir;

    #[test]
    fn slugify_normalizes_topic() {
        assert_eq!(
            slugify("  How Does  OAuth 2.0 Work?!  "),
            "how-does-oauth-20-work"
        );
    }

    #[tokio::test]
    async fn pool_enforces_concurrency_cap() {
        let dir = tempdir().unwrap();
        let mut pool = ResearchPool::new(2);

        for i in 0..3 {
            let config = InvokerConfig {
                program: "sleep".into(),
                extra_args: vec!["0.2".into()],
                output_format: None,
                json: false,
                timeout: Duration::from_secs(5),
            };
            pool.spawn(format!("topic-{i}"), dir.path().to_path_buf(), config)
                .await;
            if i < 2 {
                assert!(pool.active_count() <= 2);
            }
        }

        assert!(pool.active_count() <= 2);
        let outcomes = pool.wait_all().await;
        assert_eq!(outcomes.len(), 3);
        for outcome in &outcomes {
            assert!(outcome.output_path.exists());
        }
    }
}
