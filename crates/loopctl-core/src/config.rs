use std::path::{Path, PathBuf};

use loopctl_types::{
    CircuitBreakerLayer, CompletionLayer, ConfigLayer, DefaultsLayer, HooksLayer,
    QualityChecksLayer, ResearchLayer, SuccessCriteriaLayer,
};

pub const DEFAULT_PROMISE: &str = "<promise>COMPLETE</promise>";
pub const STORY_COMPLETE_TOKEN: &str = "<promise>STORY_COMPLETE</promise>";

/// The fully resolved configuration, with every key-specific default
/// applied, used directly by the run engine and its gates.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub max_iterations: u32,
    pub timeout_minutes: u64,
    pub rate_limit_per_hour: u32,
    pub no_progress_threshold: u32,
    pub same_error_threshold: u32,
    pub completion_promise: String,
    pub completion_custom_patterns: Vec<String>,
    pub success_criteria_command: Option<String>,
    pub success_criteria_timeout: u64,
    pub quality_check_all: Option<String>,
    pub quality_check_backend: Option<String>,
    pub quality_check_frontend: Option<String>,
    pub hooks_enabled: bool,
    pub research_max_agents: u32,
    pub research_timeout: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_iterations: 50,
            timeout_minutes: 15,
            rate_limit_per_hour: 100,
            no_progress_threshold: 3,
            same_error_threshold: 5,
            completion_promise: DEFAULT_PROMISE.to_string(),
            completion_custom_patterns: Vec::new(),
            success_criteria_command: None,
            success_criteria_timeout: 300,
            quality_check_all: None,
            quality_check_backend: None,
            quality_check_frontend: None,
            hooks_enabled: false,
            research_max_agents: 3,
            research_timeout: 600,
        }
    }
}

impl Config {
    fn apply_layer(&mut self, layer: &ConfigLayer) {
        if let Some(d) = &layer.defaults {
            if let Some(v) = d.max_iterations {
                self.max_iterations = v;
            }
            if let Some(v) = d.timeout_minutes {
                self.timeout_minutes = v;
            }
            if let Some(v) = d.rate_limit_per_hour {
                self.rate_limit_per_hour = v;
            }
        }
        if let Some(c) = &layer.circuit_breaker {
            if let Some(v) = c.no_progress_threshold {
                self.no_progress_threshold = v;
            }
            if let Some(v) = c.same_error_threshold {
                self.same_error_threshold = v;
            }
        }
        if let Some(c) = &layer.completion {
            if let Some(v) = &c.promise {
                self.completion_promise = v.clone();
            }
            if let Some(v) = &c.custom_patterns {
                self.completion_custom_patterns = v.clone();
            }
        }
        if let Some(s) = &layer.success_criteria {
            if let Some(v) = &s.command {
                self.success_criteria_command = Some(v.clone());
            }
            if let Some(v) = s.timeout {
                self.success_criteria_timeout = v;
            }
        }
        if let Some(q) = &layer.quality_checks {
            if let Some(v) = &q.all {
                self.quality_check_all = Some(v.clone());
            }
            if let Some(v) = &q.backend {
                self.quality_check_backend = Some(v.clone());
            }
            if let Some(v) = &q.frontend {
                self.quality_check_frontend = Some(v.clone());
            }
        }
        if let Some(h) = &layer.hooks {
            if let Some(v) = h.enabled {
                self.hooks_enabled = v;
            }
        }
        if let Some(r) = &layer.research {
            if let Some(v) = r.max_agents {
                self.research_max_agents = v;
            }
            if let Some(v) = r.timeout {
                self.research_timeout = v;
            }
        }
    }
}

async fn read_yaml_layer(path: &Path) -> anyhow::Result<ConfigLayer> {
    if !path.exists() {
        return Ok(ConfigLayer::default());
    }
    let raw = tokio::fs::read_to_string(path).await?;
    if raw.trim().is_empty() {
        return Ok(ConfigLayer::default());
    }
    Ok(serde_yaml::from_str(&raw)?)
}

/// The user-level config path: `$XDG_CONFIG_HOME/loopctl/config.yaml` (or
/// platform equivalent via `dirs::config_dir`), falling back to a
/// repo-relative dotfile when no config directory can be resolved.
pub fn resolve_user_config_path() -> PathBuf {
    if let Ok(path) = std::env::var("LOOPCTL_GLOBAL_CONFIG") {
        return PathBuf::from(path);
    }
    match dirs::config_dir() {
        Some(dir) => dir.join("loopctl").join("config.yaml"),
        None => PathBuf::from(".loopctl/global_config.yaml"),
    }
}

/// Build the environment-variable overlay. Each recognized key has a
/// corresponding `LOOPCTL_*` override applied last, after both YAML
/// layers.
fn env_layer() -> ConfigLayer {
    let mut layer = ConfigLayer::default();

    let defaults = DefaultsLayer {
        max_iterations: env_u32("LOOPCTL_MAX_ITERATIONS"),
        timeout_minutes: env_u64("LOOPCTL_TIMEOUT_MINUTES"),
        rate_limit_per_hour: env_u32("LOOPCTL_RATE_LIMIT_PER_HOUR"),
    };
    if defaults != DefaultsLayer::default() {
        layer.defaults = Some(defaults);
    }

    let circuit_breaker = CircuitBreakerLayer {
        no_progress_threshold: env_u32("LOOPCTL_NO_PROGRESS_THRESHOLD"),
        same_error_threshold: env_u32("LOOPCTL_SAME_ERROR_THRESHOLD"),
    };
    if circuit_breaker != CircuitBreakerLayer::default() {
        layer.circuit_breaker = Some(circuit_breaker);
    }

    let completion = CompletionLayer {
        promise: std::env::var("LOOPCTL_COMPLETION_PROMISE").ok(),
        custom_patterns: std::env::var("LOOPCTL_COMPLETION_CUSTOM_PATTERNS")
            .ok()
            .map(|v| v.split(',').map(|s| s.trim().to_string()).collect()),
    };
    if completion != CompletionLayer::default() {
        layer.completion = Some(completion);
    }

    let success_criteria = SuccessCriteriaLayer {
        command: std::env::var("LOOPCTL_SUCCESS_CRITERIA_COMMAND").ok(),
        timeout: env_u64("LOOPCTL_SUCCESS_CRITERIA_TIMEOUT"),
    };
    if success_criteria != SuccessCriteriaLayer::default() {
        layer.success_criteria = Some(success_criteria);
    }

    let quality_checks = QualityChecksLayer {
        all: std::env::var("LOOPCTL_QUALITY_CHECK_ALL").ok(),
        backend: std::env::var("LOOPCTL_QUALITY_CHECK_BACKEND").ok(),
        frontend: std::env::var("LOOPCTL_QUALITY_CHECK_FRONTEND").ok(),
    };
    if quality_checks != QualityChecksLayer::default() {
        layer.quality_checks = Some(quality_checks);
    }

    let hooks = HooksLayer {
        enabled: std::env::var("LOOPCTL_HOOKS_ENABLED")
            .ok()
            .and_then(|v| parse_bool_like(&v)),
    };
    if hooks != HooksLayer::default() {
        layer.hooks = Some(hooks);
    }

    let research = ResearchLayer {
        max_agents: env_u32("LOOPCTL_RESEARCH_MAX_AGENTS"),
        timeout: env_u64("LOOPCTL_RESEARCH_TIMEOUT"),
    };
    if research != ResearchLayer::default() {
        layer.research = Some(research);
    }

    layer
}

fn env_u32(key: &str) -> Option<u32> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

fn parse_bool_like(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Load the two YAML layers (user-level then project-level) plus the
/// environment overlay and resolve them, later layers winning, into one
/// `Config`.
pub async fn load_config(project_config_path: &Path) -> anyhow::Result<Config> {
    let user_path = resolve_user_config_path();
    let user_layer = read_yaml_layer(&user_path).await?;
    let project_layer = read_yaml_layer(project_config_path).await?;
    let env = env_layer();

    let mut config = Config::default();
    config.apply_layer(&user_layer);
    config.apply_layer(&project_layer);
    config.apply_layer(&env);
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::tempdir;

    #[tokio::test]
    #[serial]
    async fn project_layer_overrides_user_layer() {
        let dir = tempdir().unwrap();
        let user_path = dir.path().join("user.yaml");
        let project_path = dir.path().join("project.yaml");

        tokio::fs::write(&user_path, "defaults:\n  max_iterations: 10\n")
            .await
            .unwrap();
        tokio::fs::write(&project_path, "defaults:\n  max_iterations: 99\n")
            .await
            .unwrap();

        let user_layer = read_yaml_layer(&user_path).await.unwrap();
        let project_layer = read_yaml_layer(&project_path).await.unwrap();

        let mut config = Config::default();
        config.apply_layer(&user_layer);
        config.apply_layer(&project_layer);
        assert_eq!(config.max_iterations, 99);
    }

    #[tokio::test]
    #[serial]
    async fn env_override_wins_over_both_yaml_layers() {
        let dir = tempdir().unwrap();
        let project_path = dir.path().join("project.yaml");
        tokio::fs::write(&project_path, "defaults:\n  max_iterations: 42\n")
            .await
            .unwrap();

        std::env::set_var("LOOPCTL_MAX_ITERATIONS", "7");
        std::env::set_var("LOOPCTL_GLOBAL_CONFIG", dir.path().join("no_such.yaml"));
        let config = load_config(&project_path).await.unwrap();
        std::env::remove_var("LOOPCTL_MAX_ITERATIONS");
        std::env::remove_var("LOOPCTL_GLOBAL_CONFIG");

        assert_eq!(config.max_iterations, 7);
    }

    #[tokio::test]
    #[serial]
    async fn missing_files_resolve_to_defaults() {
        let dir = tempdir().unwrap();
        let config = load_config(&dir.path().join("missing.yaml")).await.unwrap();
        assert_eq!(config, Config::default());
    }
}
