use std::net::IpAddr;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::config::P2PConfig;
use crate::network::identity::Identity;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a node until interrupted
    Run(NodeArgs),

    /// Print the peer id stored in the data directory, creating a key if needed
    Id(NodeArgs),
}

#[derive(Args, Debug, Clone, Default)]
pub struct NodeArgs {
    /// JSON config file; flags override its values
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// TCP listen port
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Bind this address instead of the first external IPv4 address
    #[arg(long)]
    pub listen_ip: Option<IpAddr>,

    /// Directory for the node key and the routing table
    #[arg(short, long)]
    pub data_dir: Option<PathBuf>,

    /// Seed node, `/ip4/<ip>/tcp/<port>/peer/<id>` (repeatable)
    #[arg(short, long = "seed")]
    pub seeds: Vec<String>,

    #[arg(long)]
    pub chain_id: Option<u32>,

    /// Protocol version
    #[arg(long = "protocol-version")]
    pub protocol_version: Option<u16>,

    /// Skip NAT port mapping
    #[arg(long)]
    pub no_nat: bool,
}

impl NodeArgs {
    /// Loads the config file, if any, and applies the flags on top.
    pub fn into_config(self) -> anyhow::Result<P2PConfig> {
        let mut config = match &self.config {
            Some(path) => P2PConfig::from_file(path)?,
            None => P2PConfig::default(),
        };

        if let Some(port) = self.port {
            config.listen_port = port;
        }
        if self.listen_ip.is_some() {
            config.listen_ip = self.listen_ip;
        }
        if let Some(dir) = self.data_dir {
            config.data_path = dir;
        }
        if !self.seeds.is_empty() {
            config.seed_nodes = self.seeds;
        }
        if let Some(chain_id) = self.chain_id {
            config.chain_id = chain_id;
        }
        if let Some(version) = self.protocol_version {
            config.version = version;
        }
        if self.no_nat {
            config.nat_port_map = false;
        }

        config.validate()?;
        Ok(config)
    }
}

/// Loads (or creates) the node key under the configured data directory.
pub fn load_identity(config: &P2PConfig) -> anyhow::Result<Identity> {
    Ok(Identity::load_or_create(&config.key_path())?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    #[test]
    fn test_flags_override_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("node.json");
        std::fs::write(&path, r#"{ "listen_port": 4000, "chain_id": 3 }"#).unwrap();

        let cli = Cli::parse_from([
            "tamchain-node",
            "run",
            "--config",
            path.to_str().unwrap(),
            "--port",
            "5000",
            "--no-nat",
        ]);
        let Commands::Run(args) = cli.command else {
            panic!("expected run");
        };
        let config = args.into_config().unwrap();
        assert_eq!(config.listen_port, 5000);
        assert_eq!(config.chain_id, 3);
        assert!(!config.nat_port_map);
    }

    #[test]
    fn test_bad_seed_flag_fails() {
        let args = NodeArgs {
            seeds: vec!["not-an-address".to_string()],
            ..NodeArgs::default()
        };
        assert!(args.into_config().is_err());
    }

    #[test]
    fn test_id_is_stable() {
        let dir = tempdir().unwrap();
        let config = P2PConfig {
            data_path: dir.path().to_path_buf(),
            ..P2PConfig::default()
        };
        let first = load_identity(&config).unwrap().peer_id();
        assert_eq!(load_identity(&config).unwrap().peer_id(), first);
    }
}
