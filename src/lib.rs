//! S-Raft: a Raft consensus variant that layers RTT-ranked sub-leaders
//! onto classical leader election, trading a small amount of steady-state
//! heartbeat traffic for sub-200ms leader failover on the common path.
//!
//! The crate is organized the way the node actually depends on things:
//! wire codec, then transport, then persistence and metrics, then the
//! consensus core itself, with the role scheduler and the S-Raft
//! extension sitting alongside classical Raft inside [`raft`].

pub mod codec;
pub mod config;
pub mod error;
pub mod logstore;
pub mod metrics;
pub mod raft;
pub mod transport;
pub mod types;

pub use config::{Cli, Config, ConsensusKnobs};
pub use error::{Error, Result};
pub use raft::{AdminCommand, Engine, Event};
pub use types::{LogEntry, LogIndex, NodeId, NodeSnapshot, Rank, Role, SubRole, Term};
