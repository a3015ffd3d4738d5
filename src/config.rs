//! CLI/environment surface (spec §6.2) and the validated runtime
//! configuration, including the knob table of spec §6.4.
//!
//! Grounded on the teacher's `config::Config::{load, validate,
//! apply_env_overrides}` layering, with its `serde_json`-backed `toml`
//! shim replaced by the real `toml` crate, and its hand-parsed `argv`
//! loop replaced by `clap`.

use std::collections::HashMap;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;

use clap::Parser;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::types::NodeId;

/// Process bootstrap flags (spec §6.2). Command-line parsing and process
/// bootstrap are themselves out of scope for this spec (external
/// collaborator) — this struct is the documented interface to them.
#[derive(Debug, Parser)]
#[command(name = "sraft", about = "Sub-leader Raft consensus node")]
pub struct Cli {
    /// Node identifier. If omitted, inferred by matching the bind address
    /// against an entry in `--peers`.
    #[arg(long, env = "SRAFT_NODE_ID")]
    pub node_id: Option<NodeId>,

    #[arg(long, env = "SRAFT_BIND_HOST", default_value = "0.0.0.0")]
    pub bind_host: String,

    #[arg(long, env = "SRAFT_BIND_PORT", default_value_t = 5000)]
    pub bind_port: u16,

    /// Comma-separated `host:port` list, in the same order on every node
    /// — list position (1-based) is the node's id unless overridden by
    /// `--node-id`.
    #[arg(long, env = "SRAFT_PEERS")]
    pub peers: String,

    #[arg(long, env = "SRAFT_DEBUG", default_value_t = false)]
    pub debug: bool,

    /// Disables the S-Raft extension; only classical election runs.
    #[arg(long = "original-raft", env = "SRAFT_ORIGINAL_RAFT", default_value_t = false)]
    pub original_raft: bool,

    #[arg(long, env = "SRAFT_METRICS_PATH")]
    pub metrics_path: Option<PathBuf>,

    /// Optional TOML file carrying the knob table of spec §6.4.
    #[arg(long, env = "SRAFT_CONFIG")]
    pub config: Option<PathBuf>,
}

/// A `[min, max]` millisecond interval for a randomized timeout family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutRange {
    pub min_ms: u64,
    pub max_ms: u64,
}

impl TimeoutRange {
    pub fn new(min_ms: u64, max_ms: u64) -> Self {
        Self { min_ms, max_ms }
    }
}

/// The knob table of spec §6.4.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsensusKnobs {
    pub heartbeat_interval_ms: u64,
    pub enable_subleader: bool,
    pub subleader_ratio: f64,
    pub primary_timeout: TimeoutRange,
    pub secondary_timeout: TimeoutRange,
    pub follower_timeout: TimeoutRange,
    pub rtt_ewma_alpha: f64,
    pub rtt_stale_ms: u64,
    /// Heartbeat rounds between sub-leader re-ranking (spec §4.3, K=5).
    pub rerank_every_rounds: u32,
}

impl Default for ConsensusKnobs {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 50,
            enable_subleader: true,
            subleader_ratio: 0.4,
            primary_timeout: TimeoutRange::new(150, 200),
            secondary_timeout: TimeoutRange::new(250, 350),
            follower_timeout: TimeoutRange::new(300, 1000),
            rtt_ewma_alpha: 0.3,
            rtt_stale_ms: 5000,
            rerank_every_rounds: 5,
        }
    }
}

impl ConsensusKnobs {
    /// The ordering invariant spec §6.4 mandates:
    /// `primary.max < secondary.min < follower.min`.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.primary_timeout.min_ms >= self.primary_timeout.max_ms {
            return Err(ConfigError::Invalid("primary_timeout min must be < max".into()));
        }
        if self.secondary_timeout.min_ms >= self.secondary_timeout.max_ms {
            return Err(ConfigError::Invalid("secondary_timeout min must be < max".into()));
        }
        if self.follower_timeout.min_ms >= self.follower_timeout.max_ms {
            return Err(ConfigError::Invalid("follower_timeout min must be < max".into()));
        }
        if !(self.primary_timeout.max_ms < self.secondary_timeout.min_ms
            && self.secondary_timeout.min_ms < self.follower_timeout.min_ms)
        {
            return Err(ConfigError::Invalid(
                "timeout ladder must satisfy primary.max < secondary.min < follower.min".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.subleader_ratio) {
            return Err(ConfigError::Invalid("subleader_ratio must be in [0, 1]".into()));
        }
        if self.rerank_every_rounds == 0 {
            return Err(ConfigError::Invalid("rerank_every_rounds must be >= 1".into()));
        }
        Ok(())
    }

    /// `max(1, floor(ratio * n))`, the sub-leader count cap of spec §4.3.
    pub fn subleader_cap(&self, cluster_size: usize) -> usize {
        ((self.subleader_ratio * cluster_size as f64).floor() as usize).max(1)
    }

    fn apply_env_overrides(&mut self) {
        use std::env;
        if let Ok(v) = env::var("SRAFT_HEARTBEAT_INTERVAL_MS") {
            if let Ok(n) = v.parse() {
                self.heartbeat_interval_ms = n;
            }
        }
        if let Ok(v) = env::var("SRAFT_ENABLE_SUBLEADER") {
            self.enable_subleader = v == "true" || v == "1";
        }
        if let Ok(v) = env::var("SRAFT_SUBLEADER_RATIO") {
            if let Ok(n) = v.parse() {
                self.subleader_ratio = n;
            }
        }
    }
}

/// Fully resolved, validated runtime configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub node_id: NodeId,
    pub bind_addr: SocketAddr,
    pub peers: HashMap<NodeId, SocketAddr>,
    pub debug: bool,
    pub original_raft: bool,
    pub metrics_path: Option<PathBuf>,
    pub knobs: ConsensusKnobs,
}

impl Config {
    /// Merge flags (+ their `env` fallbacks, already applied by `clap`) >
    /// knob file > built-in defaults, then validate (spec §7: "Config
    /// invalid at startup: abort with non-zero exit before any network
    /// I/O").
    pub fn from_cli(cli: Cli) -> Result<Self, ConfigError> {
        let bind_addr = resolve_one(&format!("{}:{}", cli.bind_host, cli.bind_port))?;

        let peer_addrs = parse_peer_list(&cli.peers)?;
        let mut peers: HashMap<NodeId, SocketAddr> = HashMap::new();
        for (i, addr) in peer_addrs.iter().enumerate() {
            peers.insert((i + 1) as NodeId, *addr);
        }

        let node_id = match cli.node_id {
            Some(id) => id,
            None => peer_addrs
                .iter()
                .position(|addr| addrs_match(*addr, bind_addr))
                .map(|idx| (idx + 1) as NodeId)
                .ok_or_else(|| {
                    ConfigError::Invalid(
                        "node id not given and bind address does not match any peer entry".into(),
                    )
                })?,
        };

        let mut knobs = match &cli.config {
            Some(path) => load_knobs(path)?,
            None => ConsensusKnobs::default(),
        };
        knobs.apply_env_overrides();
        if cli.original_raft {
            knobs.enable_subleader = false;
        }
        knobs.validate()?;

        if peers.len() < 1 {
            return Err(ConfigError::Invalid("peer list must not be empty".into()));
        }

        Ok(Config {
            node_id,
            bind_addr,
            peers,
            debug: cli.debug,
            original_raft: cli.original_raft,
            metrics_path: cli.metrics_path,
            knobs,
        })
    }

    /// The peer ids other than this node's own — the addressees of every
    /// broadcast.
    pub fn peer_ids(&self) -> Vec<NodeId> {
        self.peers
            .keys()
            .copied()
            .filter(|&id| id != self.node_id)
            .collect()
    }

    pub fn cluster_size(&self) -> usize {
        self.peers.len()
    }

    pub fn majority(&self) -> usize {
        self.cluster_size() / 2 + 1
    }
}

fn load_knobs(path: &PathBuf) -> Result<ConsensusKnobs, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })?;
    toml::from_str(&contents).map_err(|e| ConfigError::Parse(e.to_string()))
}

fn parse_peer_list(raw: &str) -> Result<Vec<SocketAddr>, ConfigError> {
    if raw.trim().is_empty() {
        return Err(ConfigError::Invalid("peer list must not be empty".into()));
    }
    raw.split(',').map(|s| resolve_one(s.trim())).collect()
}

fn resolve_one(host_port: &str) -> Result<SocketAddr, ConfigError> {
    host_port
        .to_socket_addrs()
        .map_err(|_| ConfigError::Invalid(format!("malformed address: {host_port}")))?
        .next()
        .ok_or_else(|| ConfigError::Invalid(format!("could not resolve: {host_port}")))
}

fn addrs_match(a: SocketAddr, b: SocketAddr) -> bool {
    a.port() == b.port()
        && (a.ip() == b.ip() || a.ip().is_unspecified() || b.ip().is_unspecified())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn knob_defaults_satisfy_timeout_ladder() {
        ConsensusKnobs::default().validate().unwrap();
    }

    #[test]
    fn knob_validation_rejects_broken_ladder() {
        let mut knobs = ConsensusKnobs::default();
        knobs.secondary_timeout = TimeoutRange::new(100, 140); // overlaps primary
        assert!(knobs.validate().is_err());
    }

    #[test]
    fn subleader_cap_is_at_least_one() {
        let knobs = ConsensusKnobs::default();
        assert_eq!(knobs.subleader_cap(3), 1);
        assert_eq!(knobs.subleader_cap(5), 2);
        assert_eq!(knobs.subleader_cap(1), 1);
    }

    #[test]
    fn node_id_inferred_from_bind_address() {
        let cli = Cli {
            node_id: None,
            bind_host: "127.0.0.1".into(),
            bind_port: 5002,
            peers: "127.0.0.1:5001,127.0.0.1:5002,127.0.0.1:5003".into(),
            debug: false,
            original_raft: false,
            metrics_path: None,
            config: None,
        };
        let config = Config::from_cli(cli).unwrap();
        assert_eq!(config.node_id, 2);
        assert_eq!(config.cluster_size(), 3);
        assert_eq!(config.majority(), 2);
    }

    #[test]
    fn explicit_node_id_overrides_inference() {
        let cli = Cli {
            node_id: Some(9),
            bind_host: "127.0.0.1".into(),
            bind_port: 5001,
            peers: "127.0.0.1:5001,127.0.0.1:5002".into(),
            debug: false,
            original_raft: false,
            metrics_path: None,
            config: None,
        };
        let config = Config::from_cli(cli).unwrap();
        assert_eq!(config.node_id, 9);
    }

    #[test]
    fn original_raft_flag_disables_subleader_knob() {
        let cli = Cli {
            node_id: Some(1),
            bind_host: "127.0.0.1".into(),
            bind_port: 5001,
            peers: "127.0.0.1:5001,127.0.0.1:5002".into(),
            debug: false,
            original_raft: true,
            metrics_path: None,
            config: None,
        };
        let config = Config::from_cli(cli).unwrap();
        assert!(!config.knobs.enable_subleader);
    }

    #[test]
    fn empty_peer_list_is_rejected() {
        let cli = Cli {
            node_id: Some(1),
            bind_host: "127.0.0.1".into(),
            bind_port: 5001,
            peers: "".into(),
            debug: false,
            original_raft: false,
            metrics_path: None,
            config: None,
        };
        assert!(Config::from_cli(cli).is_err());
    }
}
