//! Plugin registry: task kind → plugin source and execution budget.
//!
//! Plugins are loaded once at startup; their instrumented form is produced
//! lazily through the shared [`TransformCache`], so every job of a kind
//! reuses the same compiled script.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::RunnerConfig;
use crate::error::{ConfigError, JobFailure};
use crate::transform::{CodeTransformer, CompiledScript, TransformCache};

/// A loaded plugin.
#[derive(Debug, Clone)]
pub struct Plugin {
    pub task_kind: String,
    pub source: String,
    pub budget: Duration,
    /// File the source was read from, if any.
    pub path: Option<PathBuf>,
}

impl Plugin {
    pub fn transformer(&self) -> CodeTransformer {
        CodeTransformer::new(self.budget)
    }
}

/// Registry of plugins by task kind.
pub struct PluginRegistry {
    plugins: HashMap<String, Plugin>,
    cache: TransformCache,
}

impl Default for PluginRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self {
            plugins: HashMap::new(),
            cache: TransformCache::default(),
        }
    }

    pub fn with_cache_capacity(mut self, max_entries: usize) -> Self {
        self.cache = TransformCache::new(max_entries);
        self
    }

    /// Loads every plugin listed in `config`.
    pub fn from_config(config: &RunnerConfig) -> Result<Self, ConfigError> {
        let mut registry = Self::new();
        for entry in &config.plugins {
            let budget = config.plugin_budget(entry);
            registry.load(&entry.task_kind, &entry.path, budget)?;
        }
        info!(plugins = registry.len(), "Plugin registry loaded");
        Ok(registry)
    }

    /// Registers in-memory source for `task_kind`, replacing any previous plugin.
    pub fn register(
        &mut self,
        task_kind: impl Into<String>,
        source: impl Into<String>,
        budget: Duration,
    ) -> &mut Self {
        let task_kind = task_kind.into();
        debug!(task_kind = %task_kind, budget_ms = budget.as_millis() as u64, "Registering plugin");
        self.plugins.insert(
            task_kind.clone(),
            Plugin {
                task_kind,
                source: source.into(),
                budget,
                path: None,
            },
        );
        self
    }

    /// Reads a plugin from `path`.
    ///
    /// Source that fails to instrument is still registered: its jobs fail
    /// individually when dispatched.
    pub fn load(&mut self, task_kind: &str, path: &Path, budget: Duration) -> Result<(), ConfigError> {
        let source = std::fs::read_to_string(path).map_err(|e| ConfigError::PluginLoad {
            task_kind: task_kind.to_string(),
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;

        if let Err(e) = self.cache.get_or_transform(&CodeTransformer::new(budget), &source) {
            warn!(task_kind, path = %path.display(), error = %e, "Plugin does not instrument cleanly");
        }

        self.plugins.insert(
            task_kind.to_string(),
            Plugin {
                task_kind: task_kind.to_string(),
                source,
                budget,
                path: Some(path.to_path_buf()),
            },
        );
        Ok(())
    }

    pub fn get(&self, task_kind: &str) -> Option<&Plugin> {
        self.plugins.get(task_kind)
    }

    pub fn contains(&self, task_kind: &str) -> bool {
        self.plugins.contains_key(task_kind)
    }

    /// Registered task kinds, sorted.
    pub fn task_kinds(&self) -> Vec<&str> {
        let mut kinds: Vec<&str> = self.plugins.keys().map(String::as_str).collect();
        kinds.sort_unstable();
        kinds
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    pub fn cache(&self) -> &TransformCache {
        &self.cache
    }

    /// Instrumented script for `task_kind`.
    ///
    /// Both error cases are permanent for the job: retrying cannot make an
    /// unknown kind known or broken source valid.
    pub fn compile(&self, task_kind: &str) -> Result<Arc<CompiledScript>, JobFailure> {
        let plugin = self
            .plugins
            .get(task_kind)
            .ok_or_else(|| JobFailure::UnknownTaskKind(task_kind.to_string()))?;
        self.cache
            .get_or_transform(&plugin.transformer(), &plugin.source)
            .map_err(JobFailure::Transform)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_compile_known_kind_is_cached() {
        let mut registry = PluginRegistry::new();
        registry.register("echo", "function run(p) { return p; }", Duration::from_millis(50));

        let first = registry.compile("echo").unwrap();
        let second = registry.compile("echo").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.budget, Duration::from_millis(50));
        assert_eq!(registry.cache().stats().hits, 1);
    }

    #[test]
    fn test_unknown_kind_is_permanent_failure() {
        let registry = PluginRegistry::new();
        let err = registry.compile("missing").unwrap_err();
        assert_eq!(err, JobFailure::UnknownTaskKind("missing".to_string()));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_broken_source_is_permanent_failure() {
        let mut registry = PluginRegistry::new();
        registry.register("broken", "function run( {", Duration::from_secs(1));
        let err = registry.compile("broken").unwrap_err();
        assert!(matches!(err, JobFailure::Transform(_)));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "module.exports.run = async (p) => p;").unwrap();

        let mut registry = PluginRegistry::new();
        registry
            .load("geoip", file.path(), Duration::from_secs(2))
            .unwrap();
        registry.register("echo", "function run(p) { return p; }", Duration::from_secs(1));

        assert_eq!(registry.task_kinds(), vec!["echo", "geoip"]);
        let plugin = registry.get("geoip").unwrap();
        assert_eq!(plugin.path.as_deref(), Some(file.path()));
        assert!(registry.compile("geoip").is_ok());
    }

    #[test]
    fn test_load_missing_file() {
        let mut registry = PluginRegistry::new();
        let err = registry
            .load("geoip", Path::new("/nonexistent/plugin.js"), Duration::from_secs(1))
            .unwrap_err();
        assert!(matches!(err, ConfigError::PluginLoad { .. }));
        assert!(registry.is_empty());
    }
}
