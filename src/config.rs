use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Daemon configuration. Every field has a default, an empty file is valid.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub container: ContainerConfig,
    #[serde(default)]
    pub master: MasterConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ContainerConfig {
    /// Shell that runs a service's commands.
    #[serde(default = "default_shell")]
    pub shell: String,
    /// Where container stdout/stderr go. Discarded when unset.
    #[serde(default)]
    pub log_directory: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MasterConfig {
    /// Capacity of the channel carrying resource manager notifications.
    #[serde(default = "default_event_buffer_size")]
    pub event_buffer_size: usize,
    /// Upper bound on the live containers of one service.
    #[serde(default = "default_max_containers_per_service")]
    pub max_containers_per_service: usize,
}

fn default_shell() -> String {
    "/bin/sh".to_owned()
}

fn default_event_buffer_size() -> usize {
    100
}

fn default_max_containers_per_service() -> usize {
    crate::scaling::DEFAULT_MAX_CONTAINERS
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            shell: default_shell(),
            log_directory: None,
        }
    }
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            event_buffer_size: default_event_buffer_size(),
            max_containers_per_service: default_max_containers_per_service(),
        }
    }
}

impl Config {
    #[tracing::instrument(name = "Config::from_file", skip_all, fields(
        file_path = ?file_path.as_ref()
    ))]
    pub async fn from_file(file_path: impl AsRef<Path>) -> Result<Self> {
        let file_contents = tokio::fs::read_to_string(file_path.as_ref())
            .await
            .with_context(|| format!("reading {}", file_path.as_ref().display()))?;

        if file_contents.trim().is_empty() {
            return Ok(Config::default());
        }

        let config: Config = serde_yaml::from_str(&file_contents)?;

        if config.master.event_buffer_size == 0 {
            anyhow::bail!("master.event_buffer_size must be positive");
        }

        if config.master.max_containers_per_service == 0 {
            anyhow::bail!("master.max_containers_per_service must be positive");
        }

        Ok(config)
    }
}
