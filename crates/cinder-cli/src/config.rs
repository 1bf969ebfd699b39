//! CLI configuration management.

use anyhow::{Context, bail};
use cinder_core::cache::Compression;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// CLI configuration, stored as YAML in the platform config directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    /// Worker pool size; the number of CPUs when unset.
    pub max_parallel: Option<usize>,
    /// Root for job workspaces; a temporary directory when unset.
    pub workspace_dir: Option<PathBuf>,
    /// Root for the cache, artifacts and run records.
    pub data_dir: Option<PathBuf>,
    pub secrets_file: Option<PathBuf>,
    /// Prefix of environment variables read as secrets.
    pub secret_env_prefix: String,
    pub cache_compression: Compression,
    pub cache_max_bytes: u64,
    pub cache_ttl_days: u32,
    /// Attempts per step on infrastructure errors, including the first.
    pub step_attempts: u32,
    pub log_format: LogFormat,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            max_parallel: None,
            workspace_dir: None,
            data_dir: None,
            secrets_file: None,
            secret_env_prefix: "CINDER_SECRET".to_string(),
            cache_compression: Compression::Zstd,
            cache_max_bytes: 10 * 1024 * 1024 * 1024,
            cache_ttl_days: 7,
            step_attempts: 3,
            log_format: LogFormat::Pretty,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl CliConfig {
    /// Load from `path`, or from the default location. A missing file yields defaults.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => Self::config_path()?,
        };
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&content).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn save(&self, path: Option<&Path>) -> anyhow::Result<PathBuf> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => Self::config_path()?,
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, serde_yaml::to_string(self)?)
            .with_context(|| format!("writing {}", path.display()))?;
        Ok(path)
    }

    pub fn config_path() -> anyhow::Result<PathBuf> {
        Ok(project_dirs()?.config_dir().join("config.yaml"))
    }

    pub fn data_dir(&self) -> anyhow::Result<PathBuf> {
        match &self.data_dir {
            Some(dir) => Ok(dir.clone()),
            None => Ok(project_dirs()?.data_dir().to_path_buf()),
        }
    }

    pub fn cache_dir(&self) -> anyhow::Result<PathBuf> {
        Ok(self.data_dir()?.join("cache"))
    }

    pub fn artifacts_dir(&self) -> anyhow::Result<PathBuf> {
        Ok(self.data_dir()?.join("artifacts"))
    }

    pub fn runs_dir(&self) -> anyhow::Result<PathBuf> {
        Ok(self.data_dir()?.join("runs"))
    }

    /// Set a configuration value. An empty value unsets optional keys.
    pub fn set(&mut self, key: &str, value: &str) -> anyhow::Result<()> {
        let optional_path = |value: &str| (!value.is_empty()).then(|| PathBuf::from(value));
        match key {
            "max_parallel" => {
                self.max_parallel = if value.is_empty() {
                    None
                } else {
                    let n: usize = value.parse().context("max_parallel must be a number")?;
                    if n == 0 {
                        bail!("max_parallel must be at least 1");
                    }
                    Some(n)
                }
            }
            "workspace_dir" => self.workspace_dir = optional_path(value),
            "data_dir" => self.data_dir = optional_path(value),
            "secrets_file" => self.secrets_file = optional_path(value),
            "secret_env_prefix" => self.secret_env_prefix = value.to_string(),
            "cache_compression" => {
                self.cache_compression = match value {
                    "zstd" => Compression::Zstd,
                    "gzip" => Compression::Gzip,
                    "lz4" => Compression::Lz4,
                    "none" => Compression::None,
                    _ => bail!("Invalid compression: {value} (zstd, gzip, lz4, none)"),
                }
            }
            "cache_max_bytes" => {
                self.cache_max_bytes = value.parse().context("cache_max_bytes must be a number")?
            }
            "cache_ttl_days" => {
                self.cache_ttl_days = value.parse().context("cache_ttl_days must be a number")?
            }
            "step_attempts" => {
                self.step_attempts = value.parse().context("step_attempts must be a number")?
            }
            "log_format" => {
                self.log_format = match value {
                    "pretty" => LogFormat::Pretty,
                    "json" => LogFormat::Json,
                    _ => bail!("Invalid log format: {value} (pretty, json)"),
                }
            }
            _ => bail!("Unknown config key: {key}"),
        }
        Ok(())
    }
}

fn project_dirs() -> anyhow::Result<directories::ProjectDirs> {
    directories::ProjectDirs::from("build", "cinder", "cinder")
        .context("Could not determine config directory")
}
