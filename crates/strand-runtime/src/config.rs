//! Node configuration
//!
//! Loaded in layers: built-in defaults, then an optional TOML file, then
//! `STRAND_*` environment overrides, and finally validated.
//!
//! ```toml
//! [node]
//! identity = "O=Bank A, L=London, C=GB"
//!
//! [scheduler]
//! max_workers = 8
//! redelivery_ms = 250
//!
//! [checkpoints]
//! directory = "/var/lib/strand/checkpoints"
//! retention_secs = 0
//!
//! [snapshots]
//! directory = "/var/log/strand"
//!
//! [logging]
//! level = "info"
//! json = false
//!
//! [permissions]
//! alice = ["StartFlow.Issue", "StartFlow.Settle"]
//!
//! [peers]
//! "O=Bank B, L=New York, C=US" = "tcp://bank-b:10002"
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Configuration loading failures
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The file could not be read
    #[error("Failed to read config file {path}: {reason}")]
    Io {
        /// File that was read
        path: PathBuf,
        /// Underlying failure
        reason: String,
    },

    /// The file is not valid TOML for [`NodeConfig`]
    #[error("Invalid TOML in {path}: {reason}")]
    Parse {
        /// File that was parsed
        path: PathBuf,
        /// Parser message
        reason: String,
    },

    /// An environment override could not be parsed
    #[error("Invalid value for {variable}: {reason}")]
    Environment {
        /// Environment variable
        variable: String,
        /// Why the value was refused
        reason: String,
    },

    /// A setting is out of range
    #[error("Invalid configuration {field}: {reason}")]
    Invalid {
        /// Offending field
        field: &'static str,
        /// Why the value was refused
        reason: String,
    },
}

impl ConfigError {
    fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

/// `[node]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeSection {
    /// Legal name this node acts as
    pub identity: String,
}

impl Default for NodeSection {
    fn default() -> Self {
        Self {
            identity: "O=Strand Node, L=London, C=GB".to_string(),
        }
    }
}

/// `[scheduler]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Flows allowed to execute a step at the same time
    pub max_workers: usize,
    /// Pause before retrying envelopes the transport refused
    pub redelivery_ms: u64,
}

impl SchedulerConfig {
    /// Pause between hand-off attempts
    pub fn redelivery(&self) -> Duration {
        Duration::from_millis(self.redelivery_ms)
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_workers: 4,
            redelivery_ms: 250,
        }
    }
}

/// `[checkpoints]`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    /// Directory of the filesystem store; in-memory when unset
    pub directory: Option<PathBuf>,
    /// Seconds a terminal checkpoint is kept after its flow resolves
    pub retention_secs: u64,
}

impl CheckpointConfig {
    /// Retention window
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }
}

/// `[snapshots]`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotConfig {
    /// Base directory for persisted stack snapshots; dropped when unset
    pub directory: Option<PathBuf>,
}

/// `[logging]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive, overridden by `RUST_LOG`
    pub level: String,
    /// Emit JSON lines instead of human-readable output
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// Complete node configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Node identity
    pub node: NodeSection,
    /// Worker pool
    pub scheduler: SchedulerConfig,
    /// Checkpoint persistence
    pub checkpoints: CheckpointConfig,
    /// Stack snapshot persistence
    pub snapshots: SnapshotConfig,
    /// Log output
    pub logging: LoggingConfig,
    /// Principal to granted permissions
    pub permissions: BTreeMap<String, Vec<String>>,
    /// Party name to transport address
    pub peers: BTreeMap<String, String>,
}

impl NodeConfig {
    /// Defaults, then `path` if given, then the process environment
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::load_from_file(path)?,
            None => Self::default(),
        };
        config.merge_with_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML file
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    /// Apply `STRAND_*` overrides from the process environment
    pub fn merge_with_env(&mut self) -> Result<(), ConfigError> {
        self.merge_with_vars(|name| std::env::var(name).ok())
    }

    /// Apply `STRAND_*` overrides from an arbitrary lookup
    pub fn merge_with_vars(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(identity) = lookup("STRAND_NODE_IDENTITY") {
            self.node.identity = identity;
        }
        if let Some(workers) = lookup("STRAND_MAX_WORKERS") {
            self.scheduler.max_workers = parse_var("STRAND_MAX_WORKERS", &workers)?;
        }
        if let Some(delay) = lookup("STRAND_REDELIVERY_MS") {
            self.scheduler.redelivery_ms = parse_var("STRAND_REDELIVERY_MS", &delay)?;
        }
        if let Some(directory) = lookup("STRAND_CHECKPOINT_DIR") {
            self.checkpoints.directory = Some(PathBuf::from(directory));
        }
        if let Some(retention) = lookup("STRAND_RETENTION_SECS") {
            self.checkpoints.retention_secs = parse_var("STRAND_RETENTION_SECS", &retention)?;
        }
        if let Some(directory) = lookup("STRAND_SNAPSHOT_DIR") {
            self.snapshots.directory = Some(PathBuf::from(directory));
        }
        if let Some(level) = lookup("STRAND_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(json) = lookup("STRAND_LOG_JSON") {
            self.logging.json = parse_var("STRAND_LOG_JSON", &json)?;
        }
        Ok(())
    }

    /// Check ranges and required values
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node.identity.trim().is_empty() {
            return Err(ConfigError::invalid("node.identity", "must not be empty"));
        }
        if self.scheduler.max_workers == 0 {
            return Err(ConfigError::invalid(
                "scheduler.max_workers",
                "must be at least 1",
            ));
        }
        if self.logging.level.trim().is_empty() {
            return Err(ConfigError::invalid("logging.level", "must not be empty"));
        }
        if let Some((principal, _)) = self.permissions.iter().find(|(p, _)| p.is_empty()) {
            return Err(ConfigError::invalid(
                "permissions",
                format!("empty principal name {principal:?}"),
            ));
        }
        Ok(())
    }
}

fn parse_var<T>(variable: &str, value: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| ConfigError::Environment {
        variable: variable.to_string(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn defaults_are_valid() {
        let config = NodeConfig::default();
        config.validate().unwrap();
        assert_eq!(config.scheduler.max_workers, 4);
        assert_eq!(config.scheduler.redelivery(), Duration::from_millis(250));
        assert!(config.checkpoints.retention().is_zero());
        assert!(config.checkpoints.directory.is_none());
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[node]
identity = "O=Bank A"

[checkpoints]
retention_secs = 30

[permissions]
alice = ["StartFlow.Issue"]
"#
        )
        .unwrap();

        let config = NodeConfig::load_from_file(file.path()).unwrap();
        assert_eq!(config.node.identity, "O=Bank A");
        assert_eq!(config.checkpoints.retention(), Duration::from_secs(30));
        assert_eq!(config.scheduler, SchedulerConfig::default());
        assert_eq!(config.logging, LoggingConfig::default());
        assert_eq!(config.permissions["alice"], vec!["StartFlow.Issue".to_string()]);
    }

    #[test]
    fn malformed_file_is_a_parse_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[scheduler]\nmax_workers = \"many\"").unwrap();
        assert!(matches!(
            NodeConfig::load_from_file(file.path()),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn environment_overrides_file_values() {
        let vars = HashMap::from([
            ("STRAND_MAX_WORKERS", "16"),
            ("STRAND_CHECKPOINT_DIR", "/tmp/strand"),
            ("STRAND_LOG_JSON", "true"),
            ("STRAND_REDELIVERY_MS", "40"),
        ]);
        let mut config = NodeConfig::default();
        config
            .merge_with_vars(|name| vars.get(name).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.scheduler.max_workers, 16);
        assert_eq!(config.scheduler.redelivery(), Duration::from_millis(40));
        assert_eq!(
            config.checkpoints.directory.as_deref(),
            Some(Path::new("/tmp/strand"))
        );
        assert!(config.logging.json);
    }

    #[test]
    fn bad_override_names_the_variable() {
        let mut config = NodeConfig::default();
        let err = config
            .merge_with_vars(|name| (name == "STRAND_RETENTION_SECS").then(|| "soon".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("STRAND_RETENTION_SECS"));
    }

    #[test]
    fn zero_workers_is_rejected() {
        let mut config = NodeConfig::default();
        config.scheduler.max_workers = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid {
                field: "scheduler.max_workers",
                ..
            })
        ));
    }
}
