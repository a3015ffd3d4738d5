//! Crate-wide error types, partitioned per the error-handling design in
//! SPEC_FULL.md §7: transient network errors are logged and retried,
//! protocol violations are dropped, log-store failures are fatal, and
//! config errors abort before any network I/O.

use thiserror::Error;

use crate::types::NodeId;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("unknown peer {0}")]
    UnknownPeer(NodeId),

    #[error("connect to {peer} failed: {source}")]
    Connect {
        peer: NodeId,
        #[source]
        source: std::io::Error,
    },

    #[error("send to {peer} failed: {source}")]
    Send {
        peer: NodeId,
        #[source]
        source: std::io::Error,
    },

    #[error("receive failed: {source}")]
    Receive {
        #[source]
        source: std::io::Error,
    },

    #[error("frame codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("bind failed on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("malformed frame: {0}")]
    Malformed(String),

    #[error("term field out of range")]
    TermOutOfRange,

    #[error("serialize error: {0}")]
    Serialize(String),

    #[error("deserialize error: {0}")]
    Deserialize(String),
}

#[derive(Debug, Error)]
pub enum LogStoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt record: {0}")]
    Corrupt(String),

    #[error("encode error: {0}")]
    Encode(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("parse error: {0}")]
    Parse(String),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Errors raised by the driver (`Engine`) itself, as opposed to its
/// collaborators.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("node {0} is not the leader")]
    NotLeader(NodeId),

    #[error("log store failure, node must restart: {0}")]
    LogStoreFatal(#[from] LogStoreError),
}

/// Top-level crate error.
#[derive(Debug, Error)]
pub enum Error {
    #[error("transport: {0}")]
    Transport(#[from] TransportError),

    #[error("engine: {0}")]
    Engine(#[from] EngineError),

    #[error("config: {0}")]
    Config(#[from] ConfigError),

    #[error("log store: {0}")]
    LogStore(#[from] LogStoreError),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
