//! Command-line interface and configuration layering.
//!
//! Precedence: CLI flag (or its environment variable), then the TOML
//! file given by `--config`, then built-in defaults.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use turndown_core::TurndownConfig;

#[derive(Parser)]
#[command(name = "turndownd", about = "Cluster turndown daemon", version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the agent: scheduler loop plus HTTP control surface.
    Run(RunArgs),
    /// Print the detected cloud provider and exit.
    Detect,
}

#[derive(Args, Debug, Default)]
pub struct RunArgs {
    /// TOML configuration file.
    #[arg(long, env = "TURNDOWN_CONFIG")]
    pub config: Option<PathBuf>,

    /// Port of the HTTP control surface.
    #[arg(long)]
    pub port: Option<u16>,

    /// Data directory for the schedule store.
    #[arg(long)]
    pub data_dir: Option<PathBuf>,

    /// Name of the node this process runs on.
    #[arg(long, env = "NODE_NAME")]
    pub node_name: Option<String>,

    /// Namespace of the agent Deployment.
    #[arg(long, env = "TURNDOWN_NAMESPACE")]
    pub namespace: Option<String>,

    /// Name of the agent Deployment.
    #[arg(long, env = "TURNDOWN_DEPLOYMENT")]
    pub deployment: Option<String>,

    /// Scheduler tick, e.g. "60s".
    #[arg(long)]
    pub check_interval: Option<String>,

    /// Interval between convergence checks, e.g. "10s".
    #[arg(long)]
    pub poll_interval: Option<String>,

    /// Give up on convergence after this long, e.g. "10m".
    #[arg(long)]
    pub poll_timeout: Option<String>,

    /// Cluster name, required on EKS and self-managed AWS.
    #[arg(long, env = "CLUSTER_NAME")]
    pub cluster_name: Option<String>,
}

impl RunArgs {
    /// Load the config file (if any) and apply flag overrides.
    pub fn resolve(&self) -> anyhow::Result<TurndownConfig> {
        let mut config = match &self.config {
            Some(path) => TurndownConfig::from_file(path)?,
            None => TurndownConfig::default(),
        };
        self.apply(&mut config);
        config.validate()?;
        Ok(config)
    }

    fn apply(&self, config: &mut TurndownConfig) {
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(dir) = &self.data_dir {
            config.storage.data_dir = dir.clone();
        }
        if let Some(node) = &self.node_name {
            config.agent.node_name = Some(node.clone());
        }
        if let Some(ns) = &self.namespace {
            config.agent.namespace = ns.clone();
        }
        if let Some(deployment) = &self.deployment {
            config.agent.deployment = deployment.clone();
        }
        if let Some(v) = &self.check_interval {
            config.schedule.check_interval = v.clone();
        }
        if let Some(v) = &self.poll_interval {
            config.turndown.poll_interval = v.clone();
        }
        if let Some(v) = &self.poll_timeout {
            config.turndown.poll_timeout = v.clone();
        }
        if let Some(name) = &self.cluster_name {
            config.aws.cluster_name = Some(name.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::time::Duration;

    #[test]
    fn flags_override_defaults() {
        let args = RunArgs {
            port: Some(8080),
            node_name: Some("node-a".to_string()),
            check_interval: Some("5m".to_string()),
            ..Default::default()
        };
        let config = args.resolve().unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.agent.node_name.as_deref(), Some("node-a"));
        assert_eq!(config.check_interval().unwrap(), Duration::from_secs(300));
        assert_eq!(config.agent.namespace, "turndown");
    }

    #[test]
    fn flags_override_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[agent]\nnamespace = \"kubecost\"\n\n[server]\nport = 9000\n\n[aws]\ncluster_name = \"prod\""
        )
        .unwrap();

        let args = RunArgs {
            config: Some(file.path().to_path_buf()),
            port: Some(9100),
            ..Default::default()
        };
        let config = args.resolve().unwrap();
        assert_eq!(config.server.port, 9100);
        assert_eq!(config.agent.namespace, "kubecost");
        assert_eq!(config.aws.cluster_name.as_deref(), Some("prod"));
    }

    #[test]
    fn bad_duration_flag_is_rejected() {
        let args = RunArgs {
            poll_timeout: Some("forever".to_string()),
            ..Default::default()
        };
        assert!(args.resolve().is_err());
    }

    #[test]
    fn parses_run_subcommand() {
        let cli = Cli::try_parse_from(["turndownd", "run", "--port", "9731", "--node-name", "n1"]).unwrap();
        match cli.command {
            Command::Run(args) => {
                assert_eq!(args.port, Some(9731));
                assert_eq!(args.node_name.as_deref(), Some("n1"));
            }
            Command::Detect => panic!("expected run"),
        }
    }
}
