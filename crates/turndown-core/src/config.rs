//! turndown.toml configuration parser.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::duration::parse_duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TurndownConfig {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub agent: AgentConfig,
    pub schedule: ScheduleConfig,
    pub turndown: TurndownTiming,
    pub singleton: SingletonConfig,
    pub snapshot: SnapshotConfig,
    pub aws: AwsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { port: 9731 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/var/configs"),
        }
    }
}

/// Where the agent itself runs inside the cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub node_name: Option<String>,
    pub namespace: String,
    pub deployment: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            node_name: None,
            namespace: "turndown".to_string(),
            deployment: "cluster-turndown".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    pub check_interval: String,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            check_interval: "60s".to_string(),
        }
    }
}

/// Interval and timeout for convergence polls against the cloud.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TurndownTiming {
    pub poll_interval: String,
    pub poll_timeout: String,
}

impl Default for TurndownTiming {
    fn default() -> Self {
        Self {
            poll_interval: "10s".to_string(),
            poll_timeout: "10m".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SingletonConfig {
    pub pool_name: String,
    pub gke_machine_type: String,
    pub aws_instance_type: String,
}

impl Default for SingletonConfig {
    fn default() -> Self {
        Self {
            pool_name: "cluster-turndown".to_string(),
            gke_machine_type: "e2-small".to_string(),
            aws_instance_type: "t3.small".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotConfig {
    pub config_map: String,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            config_map: "cluster-turndown-sizes".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AwsConfig {
    pub cluster_name: Option<String>,
}

impl TurndownConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: TurndownConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Reject duration strings that cannot be parsed.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.check_interval()?;
        self.poll_interval()?;
        self.poll_timeout()?;
        Ok(())
    }

    pub fn check_interval(&self) -> anyhow::Result<Duration> {
        duration_field("schedule.check_interval", &self.schedule.check_interval)
    }

    pub fn poll_interval(&self) -> anyhow::Result<Duration> {
        duration_field("turndown.poll_interval", &self.turndown.poll_interval)
    }

    pub fn poll_timeout(&self) -> anyhow::Result<Duration> {
        duration_field("turndown.poll_timeout", &self.turndown.poll_timeout)
    }

    /// Path of the schedule store inside the data directory.
    pub fn store_path(&self) -> PathBuf {
        self.storage.data_dir.join("turndown.redb")
    }
}

fn duration_field(name: &str, value: &str) -> anyhow::Result<Duration> {
    match parse_duration(value) {
        Some(d) if !d.is_zero() => Ok(d),
        _ => anyhow::bail!("invalid duration for {name}: {value:?}"),
    }
}
