//! Configuration structures for the converter service.
//!
//! Configuration is loaded from TOML files. Job definitions are partial
//! [`JobConfigFragment`]s that are merged along their inheritance chain by
//! the [`ConfigResolver`].

mod job;
mod resolver;

pub use job::*;
pub use resolver::{baseline, merge, ConfigResolver};

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;

/// Main configuration structure.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    /// Job scheduler configuration
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Known rawdata sources
    #[serde(default)]
    pub rawdata_sources: Vec<RawdataSourceConfig>,

    /// Converter job fragments
    #[serde(default)]
    pub jobs: Vec<JobConfigFragment>,

    /// Reference converter selection
    #[serde(default)]
    pub converter: ConverterConfig,

    /// Monitoring configuration
    #[serde(default)]
    pub monitoring: MonitoringConfig,
}

/// Job scheduler configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SchedulerConfig {
    /// Maximum number of non-stopped jobs
    #[serde(default = "default_max_concurrent_jobs")]
    pub max_concurrent_jobs: usize,

    /// Source poll timeout in milliseconds
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,

    /// Schedule every non-prototype job fragment on startup
    #[serde(default = "default_enabled")]
    pub schedule_predefined_jobs: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: default_max_concurrent_jobs(),
            poll_timeout_ms: default_poll_timeout_ms(),
            schedule_predefined_jobs: default_enabled(),
        }
    }
}

/// A named rawdata source.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RawdataSourceConfig {
    /// Source name referenced by `rawdata_source.name`
    pub name: String,

    /// Client implementation
    #[serde(default)]
    pub kind: SourceKind,

    /// Directory holding `<topic>.jsonl` files (jsonl sources)
    pub directory: Option<PathBuf>,

    /// Encryption settings
    #[serde(default)]
    pub encryption: EncryptionConfig,
}

/// Rawdata client implementation.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// In-process topics
    #[default]
    Memory,
    /// Directory of JSON lines files
    Jsonl,
}

/// Source encryption settings. Decryption is active when both are set.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct EncryptionConfig {
    #[serde(skip_serializing)]
    pub key: Option<String>,
    #[serde(skip_serializing)]
    pub salt: Option<String>,
}

impl EncryptionConfig {
    /// Whether decryption is configured.
    pub fn is_configured(&self) -> bool {
        self.key.as_deref().map_or(false, |k| !k.is_empty())
            && self.salt.as_deref().map_or(false, |s| !s.is_empty())
    }
}

/// Reference converter selection.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ConverterConfig {
    /// Converter implementation
    #[serde(default)]
    pub kind: ConverterKind,

    /// Entry parsed as the record body
    #[serde(default = "default_converter_entry")]
    pub entry: String,
}

impl Default for ConverterConfig {
    fn default() -> Self {
        Self {
            kind: ConverterKind::default(),
            entry: default_converter_entry(),
        }
    }
}

/// Available converter implementations.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum ConverterKind {
    /// Parse one entry as a JSON object
    #[default]
    JsonEntry,
}

/// Monitoring configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MonitoringConfig {
    /// Log level
    #[serde(default)]
    pub log_level: LogLevel,

    /// Log format
    #[serde(default)]
    pub log_format: LogFormat,

    /// HTTP control plane port
    #[serde(default = "default_http_port")]
    pub http_port: u16,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            log_level: LogLevel::default(),
            log_format: LogFormat::default(),
            http_port: default_http_port(),
        }
    }
}

/// Log level.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Filter directive for this level.
    pub fn as_filter(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// Log format.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// JSON structured logging
    #[default]
    Json,
    /// Human-readable text
    Text,
}

// Default value functions

fn default_max_concurrent_jobs() -> usize {
    1
}
fn default_poll_timeout_ms() -> u64 {
    1000
}
fn default_enabled() -> bool {
    true
}
fn default_converter_entry() -> String {
    "entry".to_string()
}
fn default_http_port() -> u16 {
    8080
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(content: &str) -> crate::Result<Self> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Validate configuration.
    ///
    /// Job fragments are checked by resolving every predefined job.
    pub fn validate(&self) -> crate::Result<()> {
        if self.scheduler.max_concurrent_jobs == 0 {
            return Err(invalid("scheduler.max_concurrent_jobs", "must be at least 1"));
        }
        if self.scheduler.poll_timeout_ms == 0 {
            return Err(invalid("scheduler.poll_timeout_ms", "must be positive"));
        }

        let mut names = HashSet::new();
        for source in &self.rawdata_sources {
            if source.name.is_empty() {
                return Err(invalid("rawdata_sources.name", "cannot be empty"));
            }
            if !names.insert(source.name.as_str()) {
                return Err(invalid(
                    "rawdata_sources.name",
                    &format!("duplicate source '{}'", source.name),
                ));
            }
            if source.kind == SourceKind::Jsonl && source.directory.is_none() {
                return Err(invalid(
                    "rawdata_sources.directory",
                    &format!("required for jsonl source '{}'", source.name),
                ));
            }
        }

        let mut job_names = HashSet::new();
        for job in &self.jobs {
            if job.name.is_empty() {
                return Err(invalid("jobs.name", "cannot be empty"));
            }
            if !job_names.insert(job.name.as_str()) {
                return Err(invalid("jobs.name", &format!("duplicate job '{}'", job.name)));
            }
        }

        self.resolver().predefined()?;
        Ok(())
    }

    /// Build a resolver over the configured fragments and sources.
    pub fn resolver(&self) -> ConfigResolver {
        ConfigResolver::new(
            self.jobs.iter().cloned(),
            self.rawdata_sources.iter().map(|s| s.name.clone()),
        )
    }
}

fn invalid(property: &str, message: &str) -> crate::Error {
    ConfigError::InvalidValue {
        property: property.to_string(),
        message: message.to_string(),
    }
    .into()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        [scheduler]
        max_concurrent_jobs = 2

        [[rawdata_sources]]
        name = "local"
        kind = "jsonl"
        directory = "/var/rawdata"

        [[jobs]]
        name = "base"
        prototype = true
        [jobs.rawdata_source]
        name = "local"
        [jobs.target_storage]
        root = "file:///tmp/datasets"

        [[jobs]]
        name = "freg"
        parent = "base"
        [jobs.rawdata_source]
        topic = "freg-playground"
        initial_position = "FIRST"
        [jobs.target_storage]
        path = "/kilde/freg"
        version = "1"

        [monitoring]
        log_format = "text"
    "#;

    #[test]
    fn test_default_scheduler_config() {
        let config = SchedulerConfig::default();
        assert_eq!(config.max_concurrent_jobs, 1);
        assert_eq!(config.poll_timeout_ms, 1000);
        assert!(config.schedule_predefined_jobs);
    }

    #[test]
    fn test_default_monitoring_config() {
        let config = MonitoringConfig::default();
        assert_eq!(config.http_port, 8080);
        assert_eq!(config.log_format, LogFormat::Json);
        assert_eq!(config.log_level.as_filter(), "info");
    }

    #[test]
    fn test_parse_and_validate() {
        let config = Config::from_toml(SAMPLE).unwrap();
        assert_eq!(config.scheduler.max_concurrent_jobs, 2);
        assert_eq!(config.rawdata_sources[0].kind, SourceKind::Jsonl);
        assert_eq!(config.jobs.len(), 2);
        assert_eq!(config.monitoring.log_format, LogFormat::Text);
        config.validate().unwrap();

        let predefined = config.resolver().predefined().unwrap();
        assert_eq!(predefined.len(), 1);
        assert_eq!(predefined[0].rawdata_source.topic, "freg-playground");
        assert_eq!(predefined[0].target_storage.root, "file:///tmp/datasets");
    }

    #[test]
    fn test_validation_rejects_zero_capacity() {
        let mut config = Config::from_toml(SAMPLE).unwrap();
        config.scheduler.max_concurrent_jobs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_jsonl_without_directory() {
        let mut config = Config::from_toml(SAMPLE).unwrap();
        config.rawdata_sources[0].directory = None;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_duplicate_jobs() {
        let mut config = Config::from_toml(SAMPLE).unwrap();
        let dup = config.jobs[1].clone();
        config.jobs.push(dup);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate job 'freg'"));
    }

    #[test]
    fn test_encryption_configured_requires_key_and_salt() {
        let mut enc = EncryptionConfig::default();
        assert!(!enc.is_configured());
        enc.key = Some("key".into());
        assert!(!enc.is_configured());
        enc.salt = Some("salt".into());
        assert!(enc.is_configured());
    }

    #[test]
    fn test_log_format_variants() {
        assert_eq!(LogFormat::default(), LogFormat::Json);
        let parsed: MonitoringConfig = toml::from_str("log_format = \"text\"").unwrap();
        assert_eq!(parsed.log_format, LogFormat::Text);
    }
}
