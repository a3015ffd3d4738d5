//! Common types shared across the wire codec, the Raft core, and the
//! S-Raft extension.

use serde::{Deserialize, Serialize};

/// Identifier of a peer in the (fixed) cluster membership.
pub type NodeId = u64;

/// Monotonically non-decreasing election epoch.
pub type Term = u64;

/// 1-based index into the replicated log. Index 0 means "no entry".
pub type LogIndex = u64;

/// A single replicated log entry. The payload is opaque to the consensus
/// core — no client-visible semantics are attached to it here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub term: Term,
    pub payload: Vec<u8>,
}

/// The three classical Raft roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

/// S-Raft sub-leader rank. Wire protocol only defines ranks 0 and 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Rank {
    Primary = 0,
    Secondary = 1,
}

impl Rank {
    pub fn from_u8(v: u8) -> Option<Rank> {
        match v {
            0 => Some(Rank::Primary),
            1 => Some(Rank::Secondary),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl std::fmt::Display for Rank {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Rank::Primary => write!(f, "primary"),
            Rank::Secondary => write!(f, "secondary"),
        }
    }
}

/// The orthogonal sub-role a non-leader node may carry alongside
/// `Role::Follower` (spec §3.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubRole {
    None,
    Assigned(Rank),
}

impl SubRole {
    pub fn rank(self) -> Option<Rank> {
        match self {
            SubRole::None => None,
            SubRole::Assigned(r) => Some(r),
        }
    }
}

/// A point-in-time, read-only view of a node's consensus state, used for
/// admin/status queries (§4.7 in SPEC_FULL.md) and for tests.
#[derive(Debug, Clone)]
pub struct NodeSnapshot {
    pub id: NodeId,
    pub role: Role,
    pub sub_role: SubRole,
    pub term: Term,
    pub commit_index: LogIndex,
    pub last_applied: LogIndex,
    pub leader_id: Option<NodeId>,
}

/// Returns whether `(cand_last_log_term, cand_last_log_index)` is at least
/// as up-to-date as `(our_last_log_term, our_last_log_index)`, the shared
/// predicate used by both RequestVote (spec §4.2) and PromoteLeader
/// (spec §4.4).
pub fn is_at_least_as_up_to_date(
    cand_last_log_term: Term,
    cand_last_log_index: LogIndex,
    our_last_log_term: Term,
    our_last_log_index: LogIndex,
) -> bool {
    cand_last_log_term > our_last_log_term
        || (cand_last_log_term == our_last_log_term && cand_last_log_index >= our_last_log_index)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rank_round_trips_through_u8() {
        assert_eq!(Rank::from_u8(0), Some(Rank::Primary));
        assert_eq!(Rank::from_u8(1), Some(Rank::Secondary));
        assert_eq!(Rank::from_u8(2), None);
        assert_eq!(Rank::Primary.as_u8(), 0);
        assert_eq!(Rank::Secondary.as_u8(), 1);
    }

    #[test]
    fn up_to_date_predicate_prefers_higher_term() {
        assert!(is_at_least_as_up_to_date(5, 0, 4, 100));
        assert!(!is_at_least_as_up_to_date(4, 100, 5, 0));
    }

    #[test]
    fn up_to_date_predicate_prefers_longer_log_on_tie() {
        assert!(is_at_least_as_up_to_date(3, 10, 3, 9));
        assert!(!is_at_least_as_up_to_date(3, 8, 3, 9));
        assert!(is_at_least_as_up_to_date(3, 9, 3, 9));
    }
}
