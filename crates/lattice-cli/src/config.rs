//! CLI configuration management.
//!
//! Settings come from an optional YAML file in the platform config directory,
//! overlaid by `LATTICE_*` environment variables.

use lattice_core::params::Parameters;
use lattice_scheduler::{AgentProfile, SchedulerConfig};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

const ENV_PREFIX: &str = "LATTICE";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Could not determine config directory")]
    NoConfigDir,

    #[error("Unknown config key: {0}")]
    UnknownKey(String),

    #[error("Invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },

    #[error(transparent)]
    Load(#[from] config::ConfigError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
}

/// CLI configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CliConfig {
    /// Payloads running at once.
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,
    /// Jobs work in `<workspace_root>/<job id>`.
    #[serde(default = "default_workspace_root")]
    pub workspace_root: PathBuf,
    /// Where published artifacts are kept.
    #[serde(default = "default_artifact_root")]
    pub artifact_root: PathBuf,
    /// Timeout for jobs that declare none; `0` disables it.
    #[serde(default)]
    pub default_timeout_minutes: u32,
    #[serde(default = "default_shell")]
    pub shell: String,
    #[serde(default)]
    pub log_format: LogFormat,
    /// Agent name to the parameters it advertises.
    #[serde(default)]
    pub agents: BTreeMap<String, Parameters>,
}

fn default_max_parallel() -> usize {
    4
}

fn default_workspace_root() -> PathBuf {
    PathBuf::from(".lattice/work")
}

fn default_artifact_root() -> PathBuf {
    PathBuf::from(".lattice/artifacts")
}

fn default_shell() -> String {
    "sh".to_string()
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            max_parallel: default_max_parallel(),
            workspace_root: default_workspace_root(),
            artifact_root: default_artifact_root(),
            default_timeout_minutes: 0,
            shell: default_shell(),
            log_format: LogFormat::default(),
            agents: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl CliConfig {
    /// Load configuration from the default file and the environment.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&Self::config_path()?)
    }

    /// Load configuration from `path` (if it exists) and the environment.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path).required(false))
            .add_source(config::Environment::with_prefix(ENV_PREFIX).try_parsing(true))
            .build()?;
        Ok(settings.try_deserialize()?)
    }

    /// Save configuration to the default file.
    pub fn save(&self) -> Result<(), ConfigError> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_yaml::to_string(self)?)?;
        Ok(())
    }

    /// Get the configuration file path.
    pub fn config_path() -> Result<PathBuf, ConfigError> {
        let dirs = directories::ProjectDirs::from("dev", "lattice", "lattice")
            .ok_or(ConfigError::NoConfigDir)?;
        Ok(dirs.config_dir().join("config.yaml"))
    }

    /// Set a configuration value.
    pub fn set(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        let invalid = || ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
        };
        match key {
            "max_parallel" => {
                self.max_parallel = value.parse().ok().filter(|&n| n > 0).ok_or_else(invalid)?
            }
            "workspace_root" => self.workspace_root = PathBuf::from(value),
            "artifact_root" => self.artifact_root = PathBuf::from(value),
            "default_timeout_minutes" => {
                self.default_timeout_minutes = value.parse().map_err(|_| invalid())?
            }
            "shell" => self.shell = value.to_string(),
            "log_format" => {
                self.log_format = match value {
                    "pretty" => LogFormat::Pretty,
                    "json" => LogFormat::Json,
                    _ => return Err(invalid()),
                }
            }
            _ => {
                // agents.<name>.<param>
                let Some((agent, param)) = key
                    .strip_prefix("agents.")
                    .and_then(|rest| rest.split_once('.'))
                else {
                    return Err(ConfigError::UnknownKey(key.to_string()));
                };
                self.agents
                    .entry(agent.to_string())
                    .or_default()
                    .insert(param.to_string(), value.to_string());
            }
        }
        Ok(())
    }

    pub fn default_timeout(&self) -> Option<Duration> {
        (self.default_timeout_minutes > 0)
            .then(|| Duration::from_secs(u64::from(self.default_timeout_minutes) * 60))
    }

    pub fn agent_profiles(&self) -> Vec<AgentProfile> {
        self.agents
            .iter()
            .map(|(name, params)| AgentProfile::new(name.clone(), params.clone()))
            .collect()
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        let config = SchedulerConfig::new()
            .with_max_parallel(self.max_parallel)
            .with_workspace_root(self.workspace_root.clone())
            .with_agents(self.agent_profiles());
        match self.default_timeout() {
            Some(timeout) => config.with_default_timeout(timeout),
            None => config,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = CliConfig::load_from(&dir.path().join("config.yaml")).unwrap();
        assert_eq!(config.max_parallel, 4);
        assert_eq!(config.shell, "sh");
        assert!(config.default_timeout().is_none());
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.yaml");

        let mut config = CliConfig::default();
        config.set("max_parallel", "8").unwrap();
        config.set("default_timeout_minutes", "30").unwrap();
        config.set("agents.linux-1.os", "Linux").unwrap();
        config.save_to(&path).unwrap();

        let loaded = CliConfig::load_from(&path).unwrap();
        assert_eq!(loaded.max_parallel, 8);
        assert_eq!(loaded.default_timeout(), Some(Duration::from_secs(1800)));
        assert_eq!(loaded.agents["linux-1"]["os"], "Linux");

        let scheduler = loaded.scheduler_config();
        assert_eq!(scheduler.max_parallel, 8);
        assert_eq!(scheduler.agents.len(), 1);
    }

    #[test]
    fn test_set_rejects_bad_values() {
        let mut config = CliConfig::default();
        assert!(matches!(
            config.set("max_parallel", "0"),
            Err(ConfigError::InvalidValue { .. })
        ));
        assert!(matches!(
            config.set("log_format", "xml"),
            Err(ConfigError::InvalidValue { .. })
        ));
        assert!(matches!(
            config.set("api_url", "http://localhost"),
            Err(ConfigError::UnknownKey(_))
        ));
    }
}
