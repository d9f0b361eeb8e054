// Grader configuration loading for the xval worker
use anyhow::{bail, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use xval_common::config::GraderConfig;

pub const DEFAULT_CONFIG_PATH: &str = "config/grader.json";
pub const CONFIG_ENV: &str = "XVAL_CONFIG";

/// Grader configuration manager
#[derive(Debug, Clone)]
pub struct ConfigManager {
    config: GraderConfig,
    source: Option<PathBuf>,
}

impl ConfigManager {
    /// Load grader configuration from a JSON file
    pub fn load(config_path: &Path) -> Result<Self> {
        if !config_path.exists() {
            bail!("Grader config file not found: {}", config_path.display());
        }

        let content = fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read {}", config_path.display()))?;

        let config: GraderConfig = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse {}", config_path.display()))?;

        let manager = Self {
            config,
            source: Some(config_path.to_path_buf()),
        };
        manager.validate()?;
        Ok(manager)
    }

    /// Load from `XVAL_CONFIG`, else `config/grader.json`, else built-in defaults
    ///
    /// A path named explicitly through the environment must exist.
    pub fn load_default() -> Result<Self> {
        if let Ok(path) = std::env::var(CONFIG_ENV) {
            return Self::load(Path::new(&path));
        }

        let default_path = Path::new(DEFAULT_CONFIG_PATH);
        if default_path.exists() {
            Self::load(default_path)
        } else {
            Self::from_config(GraderConfig::default())
        }
    }

    pub fn from_config(config: GraderConfig) -> Result<Self> {
        let manager = Self {
            config,
            source: None,
        };
        manager.validate()?;
        Ok(manager)
    }

    fn validate(&self) -> Result<()> {
        let config = &self.config;
        if config.compiler.program.trim().is_empty() {
            bail!("compiler.program must not be empty");
        }
        if config.runtime.program.trim().is_empty() {
            bail!("runtime.program must not be empty");
        }
        if config.runtime.timeout_ms == 0 || config.compiler.timeout_ms == 0 {
            bail!("timeouts must be greater than zero");
        }
        if !config.runtime.args.iter().any(|a| a.contains("{bundle}")) {
            bail!("runtime.args must reference {{bundle}}");
        }
        if config.rewrite.suite_file_name.is_empty() || config.rewrite.bundle_file_name.is_empty() {
            bail!("rewrite file names must not be empty");
        }
        if config.concurrency.max_parallel_jobs == Some(0) {
            bail!("concurrency.max_parallel_jobs must be at least 1");
        }
        Ok(())
    }

    pub fn config(&self) -> &GraderConfig {
        &self.config
    }

    /// File the configuration was read from, `None` for built-in defaults
    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }

    /// Worker pool size: configured value, else host parallelism
    pub fn max_parallel_jobs(&self) -> usize {
        self.config.concurrency.max_parallel_jobs.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("grader.json");
        fs::write(
            &path,
            r#"{ "runtime": { "program": "sh", "timeout_ms": 500 }, "concurrency": { "max_parallel_jobs": 3 } }"#,
        )
        .unwrap();

        let manager = ConfigManager::load(&path).unwrap();
        assert_eq!(manager.config().runtime.program, "sh");
        assert_eq!(manager.config().runtime.timeout_ms, 500);
        assert_eq!(manager.max_parallel_jobs(), 3);
        assert_eq!(manager.source(), Some(path.as_path()));
    }

    #[test]
    fn test_missing_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(ConfigManager::load(&dir.path().join("absent.json")).is_err());
    }

    #[test]
    fn test_rejects_runtime_without_bundle_placeholder() {
        let mut config = GraderConfig::default();
        config.runtime.args = vec!["main.js".to_string()];
        assert!(ConfigManager::from_config(config).is_err());
    }

    #[test]
    fn test_rejects_zero_workers() {
        let mut config = GraderConfig::default();
        config.concurrency.max_parallel_jobs = Some(0);
        assert!(ConfigManager::from_config(config).is_err());
    }

    #[test]
    fn test_defaults_are_valid() {
        let manager = ConfigManager::from_config(GraderConfig::default()).unwrap();
        assert!(manager.max_parallel_jobs() >= 1);
        assert!(manager.source().is_none());
    }
}
