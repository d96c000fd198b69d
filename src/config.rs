//! Runner configuration.
//!
//! Loaded from an optional YAML file, then overlaid with environment
//! variables, then validated. Durations are configured in milliseconds.
//!
//! ```yaml
//! database_url: postgres://localhost/plugin_runner
//! redis_url: redis://127.0.0.1:6379
//! queue: default
//! default_budget_ms: 5000
//! pool:
//!   capacity: 8
//! plugins:
//!   - task_kind: geoip
//!     path: plugins/geoip.js
//!     budget_ms: 250
//! ```

use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::orchestrator::{ExponentialBackoff, OrchestratorConfig};
use crate::pool::{PoolConfig, RuntimeCommand};
use crate::store::{DEFAULT_MAX_ATTEMPTS, DEFAULT_QUEUE};

/// Shortest renewal interval the lock TTL must leave room for.
const MIN_RENEW_INTERVAL_MS: u64 = 100;

fn task_kind_pattern() -> Result<&'static Regex, ConfigError> {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    if let Some(pattern) = PATTERN.get() {
        return Ok(pattern);
    }
    let pattern = Regex::new(r"^[a-z0-9][a-z0-9_.-]*$")?;
    Ok(PATTERN.get_or_init(|| pattern))
}

/// Whether `task_kind` is an acceptable plugin name.
pub fn is_valid_task_kind(task_kind: &str) -> Result<bool, ConfigError> {
    Ok(task_kind_pattern()?.is_match(task_kind))
}

/// Worker pool settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    pub capacity: usize,
    pub resume_threshold: f64,
    pub kill_grace_ms: u64,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            capacity: 4,
            resume_threshold: 0.5,
            kill_grace_ms: 500,
        }
    }
}

/// Orchestrator timing settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorSettings {
    pub lock_ttl_ms: u64,
    pub acquire_interval_ms: u64,
    pub poll_interval_ms: u64,
    pub claim_batch_size: usize,
    pub drain_grace_ms: u64,
    /// Claims older than this are recovered by the stale-claim sweep.
    pub claim_timeout_ms: u64,
    pub sweep_interval_ms: u64,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            lock_ttl_ms: 15_000,
            acquire_interval_ms: 2_000,
            poll_interval_ms: 500,
            claim_batch_size: 16,
            drain_grace_ms: 30_000,
            claim_timeout_ms: 600_000,
            sweep_interval_ms: 60_000,
        }
    }
}

/// Job retry backoff.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub initial_ms: u64,
    pub max_ms: u64,
    pub factor: f64,
    /// Relative spread applied to each delay, `0.0..=1.0`.
    pub jitter: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            initial_ms: 1_000,
            max_ms: 300_000,
            factor: 2.0,
            jitter: 0.2,
        }
    }
}

/// One plugin to load at startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginSource {
    pub task_kind: String,
    pub path: PathBuf,
    /// Overrides `default_budget_ms` for this task kind.
    #[serde(default)]
    pub budget_ms: Option<u64>,
}

/// Complete runner configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    pub database_url: String,
    pub redis_url: String,
    pub queue: String,
    /// Lock holder id; generated from pid and a random suffix when unset.
    pub node_id: Option<String>,
    pub default_budget_ms: u64,
    pub max_attempts: u32,
    pub pool: PoolSettings,
    pub runtime: RuntimeCommand,
    pub orchestrator: OrchestratorSettings,
    pub retry: RetrySettings,
    pub plugins: Vec<PluginSource>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            database_url: "postgres://localhost/plugin_runner".to_string(),
            redis_url: "redis://127.0.0.1:6379".to_string(),
            queue: DEFAULT_QUEUE.to_string(),
            node_id: None,
            default_budget_ms: 5_000,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            pool: PoolSettings::default(),
            runtime: RuntimeCommand::default(),
            orchestrator: OrchestratorSettings::default(),
            retry: RetrySettings::default(),
            plugins: Vec::new(),
        }
    }
}

impl RunnerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses YAML; missing fields take their defaults. Not validated.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Reads a YAML file. Relative plugin paths resolve against the file's
    /// directory. Not validated.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        let mut config = Self::from_yaml_str(&text)?;
        if let Some(base) = path.parent() {
            for plugin in &mut config.plugins {
                if plugin.path.is_relative() {
                    plugin.path = base.join(&plugin.path);
                }
            }
        }
        Ok(config)
    }

    /// Defaults overlaid with the environment, validated.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    /// File (if given) overlaid with the environment, validated.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Overlays values looked up by variable name.
    ///
    /// # Environment Variables
    ///
    /// - `DATABASE_URL`, `REDIS_URL`
    /// - `PLUGIN_RUNNER_QUEUE`, `PLUGIN_RUNNER_NODE_ID`
    /// - `PLUGIN_RUNNER_RUNTIME`: interpreter program
    /// - `PLUGIN_RUNNER_DEFAULT_BUDGET_MS`, `PLUGIN_RUNNER_MAX_ATTEMPTS`
    /// - `PLUGIN_RUNNER_POOL_CAPACITY`, `PLUGIN_RUNNER_RESUME_THRESHOLD`,
    ///   `PLUGIN_RUNNER_KILL_GRACE_MS`
    /// - `PLUGIN_RUNNER_LOCK_TTL_MS`, `PLUGIN_RUNNER_CLAIM_BATCH_SIZE`,
    ///   `PLUGIN_RUNNER_DRAIN_GRACE_MS`, `PLUGIN_RUNNER_CLAIM_TIMEOUT_MS`
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(val) = lookup("DATABASE_URL") {
            self.database_url = val;
        }
        if let Some(val) = lookup("REDIS_URL") {
            self.redis_url = val;
        }
        if let Some(val) = lookup("PLUGIN_RUNNER_QUEUE") {
            self.queue = val;
        }
        if let Some(val) = lookup("PLUGIN_RUNNER_NODE_ID") {
            self.node_id = Some(val);
        }
        if let Some(val) = lookup("PLUGIN_RUNNER_RUNTIME") {
            self.runtime.program = val;
        }

        let key = "PLUGIN_RUNNER_DEFAULT_BUDGET_MS";
        if let Some(val) = lookup(key) {
            self.default_budget_ms = parse_env_value(&val, key)?;
        }
        let key = "PLUGIN_RUNNER_MAX_ATTEMPTS";
        if let Some(val) = lookup(key) {
            self.max_attempts = parse_env_value(&val, key)?;
        }
        let key = "PLUGIN_RUNNER_POOL_CAPACITY";
        if let Some(val) = lookup(key) {
            self.pool.capacity = parse_env_value(&val, key)?;
        }
        let key = "PLUGIN_RUNNER_RESUME_THRESHOLD";
        if let Some(val) = lookup(key) {
            self.pool.resume_threshold = parse_env_value(&val, key)?;
        }
        let key = "PLUGIN_RUNNER_KILL_GRACE_MS";
        if let Some(val) = lookup(key) {
            self.pool.kill_grace_ms = parse_env_value(&val, key)?;
        }
        let key = "PLUGIN_RUNNER_LOCK_TTL_MS";
        if let Some(val) = lookup(key) {
            self.orchestrator.lock_ttl_ms = parse_env_value(&val, key)?;
        }
        let key = "PLUGIN_RUNNER_CLAIM_BATCH_SIZE";
        if let Some(val) = lookup(key) {
            self.orchestrator.claim_batch_size = parse_env_value(&val, key)?;
        }
        let key = "PLUGIN_RUNNER_DRAIN_GRACE_MS";
        if let Some(val) = lookup(key) {
            self.orchestrator.drain_grace_ms = parse_env_value(&val, key)?;
        }
        let key = "PLUGIN_RUNNER_CLAIM_TIMEOUT_MS";
        if let Some(val) = lookup(key) {
            self.orchestrator.claim_timeout_ms = parse_env_value(&val, key)?;
        }
        Ok(())
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` naming the first invalid value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "queue cannot be empty".to_string(),
            ));
        }

        if self.runtime.program.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "runtime.program cannot be empty".to_string(),
            ));
        }

        if self.default_budget_ms == 0 {
            return Err(ConfigError::ValidationFailed(
                "default_budget_ms must be greater than 0".to_string(),
            ));
        }

        if self.max_attempts == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_attempts must be greater than 0".to_string(),
            ));
        }

        if self.pool.capacity == 0 {
            return Err(ConfigError::ValidationFailed(
                "pool.capacity must be greater than 0".to_string(),
            ));
        }

        if !(0.0..=1.0).contains(&self.pool.resume_threshold) {
            return Err(ConfigError::ValidationFailed(
                "pool.resume_threshold must be between 0.0 and 1.0".to_string(),
            ));
        }

        let orchestrator = &self.orchestrator;
        if orchestrator.lock_ttl_ms < 3 * MIN_RENEW_INTERVAL_MS {
            return Err(ConfigError::ValidationFailed(format!(
                "orchestrator.lock_ttl_ms must be at least {} ms",
                3 * MIN_RENEW_INTERVAL_MS
            )));
        }

        if orchestrator.claim_batch_size == 0 {
            return Err(ConfigError::ValidationFailed(
                "orchestrator.claim_batch_size must be greater than 0".to_string(),
            ));
        }

        if orchestrator.poll_interval_ms == 0 || orchestrator.acquire_interval_ms == 0 {
            return Err(ConfigError::ValidationFailed(
                "orchestrator poll and acquire intervals must be greater than 0".to_string(),
            ));
        }

        if orchestrator.sweep_interval_ms == 0 {
            return Err(ConfigError::ValidationFailed(
                "orchestrator.sweep_interval_ms must be greater than 0".to_string(),
            ));
        }

        if self.retry.initial_ms == 0 || self.retry.max_ms < self.retry.initial_ms {
            return Err(ConfigError::ValidationFailed(
                "retry.initial_ms must be positive and not exceed retry.max_ms".to_string(),
            ));
        }

        if self.retry.factor < 1.0 {
            return Err(ConfigError::ValidationFailed(
                "retry.factor must be at least 1.0".to_string(),
            ));
        }

        if !(0.0..=1.0).contains(&self.retry.jitter) {
            return Err(ConfigError::ValidationFailed(
                "retry.jitter must be between 0.0 and 1.0".to_string(),
            ));
        }

        let mut seen = std::collections::HashSet::new();
        for plugin in &self.plugins {
            if !is_valid_task_kind(&plugin.task_kind)? {
                return Err(ConfigError::ValidationFailed(format!(
                    "invalid task kind '{}': expected lowercase letters, digits, '_', '.', '-'",
                    plugin.task_kind
                )));
            }
            if !seen.insert(plugin.task_kind.as_str()) {
                return Err(ConfigError::ValidationFailed(format!(
                    "task kind '{}' is configured twice",
                    plugin.task_kind
                )));
            }
            if plugin.budget_ms == Some(0) {
                return Err(ConfigError::ValidationFailed(format!(
                    "budget_ms for '{}' must be greater than 0",
                    plugin.task_kind
                )));
            }
            // A running job must never look stale to the sweep.
            let longest = self.plugin_budget(plugin) + self.kill_grace();
            if Duration::from_millis(orchestrator.claim_timeout_ms) <= longest {
                return Err(ConfigError::ValidationFailed(format!(
                    "orchestrator.claim_timeout_ms must exceed the budget plus kill grace of '{}'",
                    plugin.task_kind
                )));
            }
        }

        Ok(())
    }

    pub fn default_budget(&self) -> Duration {
        Duration::from_millis(self.default_budget_ms)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.pool.kill_grace_ms)
    }

    pub fn plugin_budget(&self, plugin: &PluginSource) -> Duration {
        plugin
            .budget_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| self.default_budget())
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig::new(self.pool.capacity)
            .with_resume_threshold(self.pool.resume_threshold)
            .with_kill_grace(self.kill_grace())
    }

    pub fn retry_backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff::new(
            Duration::from_millis(self.retry.initial_ms),
            Duration::from_millis(self.retry.max_ms),
        )
        .with_factor(self.retry.factor)
        .with_jitter(self.retry.jitter)
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        let settings = &self.orchestrator;
        OrchestratorConfig::new(&self.queue)
            .with_lock_ttl(Duration::from_millis(settings.lock_ttl_ms))
            .with_acquire_interval(Duration::from_millis(settings.acquire_interval_ms))
            .with_poll_interval(Duration::from_millis(settings.poll_interval_ms))
            .with_claim_batch_size(settings.claim_batch_size)
            .with_drain_grace(Duration::from_millis(settings.drain_grace_ms))
            .with_claim_timeout(Duration::from_millis(settings.claim_timeout_ms))
            .with_sweep_interval(Duration::from_millis(settings.sweep_interval_ms))
            .with_retry_backoff(self.retry_backoff())
    }

    pub fn with_database_url(mut self, url: impl Into<String>) -> Self {
        self.database_url = url.into();
        self
    }

    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    pub fn with_pool_capacity(mut self, capacity: usize) -> Self {
        self.pool.capacity = capacity;
        self
    }

    pub fn with_plugin(mut self, task_kind: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        self.plugins.push(PluginSource {
            task_kind: task_kind.into(),
            path: path.into(),
            budget_ms: None,
        });
        self
    }
}

/// Parse an environment variable value into the target type.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config_is_valid() {
        let config = RunnerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.queue, DEFAULT_QUEUE);
        assert_eq!(config.runtime.program, "node");
    }

    #[test]
    fn test_yaml_parsing_with_partial_sections() {
        let yaml = r#"
queue: ingest
default_budget_ms: 250
pool:
  capacity: 8
runtime:
  program: deno
  args: ["run", "--allow-none"]
plugins:
  - task_kind: geoip
    path: /opt/plugins/geoip.js
    budget_ms: 100
  - task_kind: enrich.v2
    path: /opt/plugins/enrich.js
"#;
        let config = RunnerConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.queue, "ingest");
        assert_eq!(config.pool.capacity, 8);
        assert!((config.pool.resume_threshold - 0.5).abs() < f64::EPSILON);
        assert_eq!(config.runtime.args, vec!["run", "--allow-none"]);
        assert_eq!(config.plugin_budget(&config.plugins[0]), Duration::from_millis(100));
        assert_eq!(config.plugin_budget(&config.plugins[1]), Duration::from_millis(250));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_file_resolves_relative_plugin_paths() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runner.yaml");
        std::fs::write(&path, "plugins:\n  - task_kind: geoip\n    path: plugins/geoip.js\n")
            .unwrap();

        let config = RunnerConfig::from_file(&path).unwrap();
        assert_eq!(config.plugins[0].path, dir.path().join("plugins/geoip.js"));
    }

    #[test]
    fn test_overrides() {
        let vars: HashMap<&str, &str> = [
            ("DATABASE_URL", "postgres://db/jobs"),
            ("PLUGIN_RUNNER_POOL_CAPACITY", "12"),
            ("PLUGIN_RUNNER_LOCK_TTL_MS", "9000"),
            ("PLUGIN_RUNNER_NODE_ID", "node-a"),
        ]
        .into_iter()
        .collect();

        let mut config = RunnerConfig::default();
        config
            .apply_overrides(|key| vars.get(key).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.database_url, "postgres://db/jobs");
        assert_eq!(config.pool.capacity, 12);
        assert_eq!(config.orchestrator.lock_ttl_ms, 9000);
        assert_eq!(config.node_id.as_deref(), Some("node-a"));
    }

    #[test]
    fn test_invalid_override_value() {
        let mut config = RunnerConfig::default();
        let err = config
            .apply_overrides(|key| (key == "PLUGIN_RUNNER_POOL_CAPACITY").then(|| "many".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { key, .. } if key == "PLUGIN_RUNNER_POOL_CAPACITY"));
    }

    #[test]
    fn test_validation_rejects_zero_capacity_and_budget() {
        let config = RunnerConfig::default().with_pool_capacity(0);
        assert!(config.validate().is_err());

        let mut config = RunnerConfig::default();
        config.default_budget_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_short_lock_ttl() {
        let mut config = RunnerConfig::default();
        config.orchestrator.lock_ttl_ms = 200;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_bad_task_kinds() {
        for kind in ["GeoIP", "-geo", "geo ip", ""] {
            let config = RunnerConfig::default().with_plugin(kind, "/tmp/p.js");
            assert!(config.validate().is_err(), "{kind:?} should be rejected");
        }
        let config = RunnerConfig::default()
            .with_plugin("geoip", "/tmp/a.js")
            .with_plugin("geoip", "/tmp/b.js");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_claim_timeout_below_budget() {
        let mut config = RunnerConfig::default().with_plugin("geoip", "/tmp/p.js");
        config.orchestrator.claim_timeout_ms = 1_000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_derived_configs() {
        let config = RunnerConfig::default().with_queue("ingest");
        let pool = config.pool_config();
        assert_eq!(pool.capacity, 4);
        assert_eq!(pool.kill_grace, Duration::from_millis(500));

        let orchestrator = config.orchestrator_config();
        assert_eq!(orchestrator.queue, "ingest");
        assert_eq!(orchestrator.lock_resource, "job-consumer:ingest");
        assert_eq!(orchestrator.lock_ttl, Duration::from_secs(15));
    }
}
