//! The consensus engine: classical Raft (`core`), the S-Raft sub-leader
//! extension (`subraft`), the role scheduler (`scheduler`), and the
//! single-writer driver that ties them together (`engine`).

pub mod core;
pub mod engine;
pub mod scheduler;
pub mod subraft;

pub use engine::{AdminCommand, Engine, Event};
