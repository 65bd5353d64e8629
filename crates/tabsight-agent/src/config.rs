//! Analyst settings
//!
//! Operational settings live in `config.yaml`; the API key comes from the
//! process environment, usually through a `.env` file. `TABSIGHT_*` and the
//! `LOG_*` variables take precedence over the file.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

const API_KEY_VAR: &str = "OPENAI_API_KEY";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid settings in {path}: {source}")]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("{0} is not set")]
    MissingEnvVar(&'static str),
}

/// Language model endpoint and call policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub model: String,

    /// Model used for requests that ask for extended reasoning
    pub thinking_model: String,

    /// OpenAI-compatible endpoint; `None` uses the OpenAI default
    pub base_url: Option<String>,

    pub timeout_secs: u64,

    /// Retries for transient errors, on top of the first call
    pub transient_retries: u32,

    pub backoff_ms: u64,

    /// Use the thinking model for planning and code generation
    pub thinking: bool,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            model: "gpt-4o-mini".to_string(),
            thinking_model: "o3-mini".to_string(),
            base_url: None,
            timeout_secs: 120,
            transient_retries: 2,
            backoff_ms: 500,
            thinking: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfilerConfig {
    pub sample_size: usize,
}

impl Default for ProfilerConfig {
    fn default() -> Self {
        Self { sample_size: 10 }
    }
}

/// Plan-level retry loop
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    pub max_attempts: u32,

    /// Allowed join growth over the larger input, as a fraction (0.0 = none)
    pub expansion_tolerance: f64,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            expansion_tolerance: 0.0,
        }
    }
}

/// Sandbox limits for generated programs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    pub timeout_ms: u64,
    pub max_rows: u64,
    /// DuckDB `memory_limit` per execution
    pub max_memory_mb: u64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            max_rows: 5_000_000,
            max_memory_mb: 2048,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    /// SQLite database file; in-memory history when unset
    pub database: Option<String>,
}

/// Mirrors the `LOG_*` variables read by [`crate::logging`]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `RUST_LOG` directive, e.g. `info` or `tabsight_agent=debug`
    pub level: String,
    pub format: String,
    pub output: String,
    pub directory: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: String::from("info"),
            format: String::from("pretty"),
            output: String::from("stdout"),
            directory: String::from("./logs"),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub llm: LlmConfig,
    pub profiler: ProfilerConfig,
    pub analysis: AnalysisConfig,
    pub execution: ExecutionConfig,
    pub history: HistoryConfig,
    pub logging: LoggingConfig,
}

impl Config {
    /// Parse `path`, then apply environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let parsed: Config = serde_yaml::from_str(&raw).map_err(|source| ConfigError::Yaml {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(parsed.with_env_overrides())
    }

    /// Like [`Config::load`], but a missing file means defaults
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        match path.as_ref().try_exists() {
            Ok(true) => Self::load(path),
            _ => Ok(Config::default().with_env_overrides()),
        }
    }

    pub fn with_env_overrides(mut self) -> Self {
        self.apply_env_overrides();
        self
    }

    pub fn apply_env_overrides(&mut self) {
        let text = |name: &str| std::env::var(name).ok();

        if let Some(model) = text("TABSIGHT_MODEL") {
            self.llm.model = model;
        }
        if let Some(model) = text("TABSIGHT_THINKING_MODEL") {
            self.llm.thinking_model = model;
        }
        if let Some(url) = text("TABSIGHT_LLM_BASE_URL") {
            self.llm.base_url = Some(url);
        }
        if let Some(secs) = parsed_env("TABSIGHT_LLM_TIMEOUT_SECS") {
            self.llm.timeout_secs = secs;
        }

        if let Some(attempts) = parsed_env("TABSIGHT_MAX_ATTEMPTS") {
            self.analysis.max_attempts = attempts;
        }
        if let Some(tolerance) = parsed_env("TABSIGHT_EXPANSION_TOLERANCE") {
            self.analysis.expansion_tolerance = tolerance;
        }
        if let Some(ms) = parsed_env("TABSIGHT_EXEC_TIMEOUT_MS") {
            self.execution.timeout_ms = ms;
        }
        if let Some(mb) = parsed_env("TABSIGHT_EXEC_MEMORY_MB") {
            self.execution.max_memory_mb = mb;
        }
        if let Some(size) = parsed_env("TABSIGHT_SAMPLE_SIZE") {
            self.profiler.sample_size = size;
        }
        if let Some(path) = text("TABSIGHT_HISTORY_DB") {
            self.history.database = Some(path);
        }

        let logging = &mut self.logging;
        for (name, slot) in [
            ("RUST_LOG", &mut logging.level),
            ("LOG_FORMAT", &mut logging.format),
            ("LOG_OUTPUT", &mut logging.output),
            ("LOG_DIR", &mut logging.directory),
        ] {
            if let Some(value) = text(name) {
                *slot = value;
            }
        }
    }

    pub fn get_openai_api_key() -> Result<String, ConfigError> {
        std::env::var(API_KEY_VAR).map_err(|_| ConfigError::MissingEnvVar(API_KEY_VAR))
    }

    /// Export the logging section for [`crate::logging::init`]
    pub fn apply_logging_env(&self) {
        let logging = &self.logging;
        for (name, value) in [
            ("RUST_LOG", &logging.level),
            ("LOG_FORMAT", &logging.format),
            ("LOG_OUTPUT", &logging.output),
            ("LOG_DIR", &logging.directory),
        ] {
            std::env::set_var(name, value);
        }
    }
}

fn parsed_env<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|raw| raw.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.profiler.sample_size, 10);
        assert_eq!(config.analysis.max_attempts, 3);
        assert_eq!(config.analysis.expansion_tolerance, 0.0);
        assert_eq!(config.execution.timeout_ms, 30_000);
        assert_eq!(config.llm.timeout_secs, 120);
        assert_eq!(config.llm.transient_retries, 2);
        assert!(config.history.database.is_none());
        assert_eq!(config.logging.format, "pretty");
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let config: Config = serde_yaml::from_str(
            r#"
analysis:
  max_attempts: 5
llm:
  model: "local-model"
  base_url: "http://localhost:8000/v1"
"#,
        )
        .unwrap();

        assert_eq!(config.analysis.max_attempts, 5);
        assert_eq!(config.analysis.expansion_tolerance, 0.0);
        assert_eq!(config.llm.model, "local-model");
        assert_eq!(config.llm.base_url.as_deref(), Some("http://localhost:8000/v1"));
        assert_eq!(config.llm.timeout_secs, 120);
        assert_eq!(config.profiler.sample_size, 10);
    }

    #[test]
    fn test_missing_file_is_reported_with_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.yaml");

        let err = Config::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
        assert!(err.to_string().contains("absent.yaml"));
        assert!(Config::load_or_default(&path).is_ok());
    }

    #[test]
    fn test_env_overrides_file_values() {
        std::env::set_var("TABSIGHT_MAX_ATTEMPTS", "4");
        std::env::set_var("TABSIGHT_EXPANSION_TOLERANCE", "0.25");
        std::env::set_var("TABSIGHT_SAMPLE_SIZE", "not-a-number");

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "analysis:\n  max_attempts: 2\nprofiler:\n  sample_size: 7\n").unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.analysis.max_attempts, 4);
        assert_eq!(config.analysis.expansion_tolerance, 0.25);
        // unparseable values are ignored
        assert_eq!(config.profiler.sample_size, 7);

        std::env::remove_var("TABSIGHT_MAX_ATTEMPTS");
        std::env::remove_var("TABSIGHT_EXPANSION_TOLERANCE");
        std::env::remove_var("TABSIGHT_SAMPLE_SIZE");
    }
}
