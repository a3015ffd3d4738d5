//! Wire message taxonomy (spec §6.1) and length-prefixed framing.
//!
//! All messages carry `{ type, term, sender_id }` plus type-specific
//! fields. Framing itself (the raw length-prefixed byte stream) is the
//! transport's concern; this module only handles the logical
//! encode/decode of one frame's payload, mirroring the teacher's
//! `network::{serialize_message, deserialize_message}` split between
//! "what goes on the wire" and "how bytes move".

use serde::{Deserialize, Serialize};

use crate::error::CodecError;
use crate::types::{LogEntry, LogIndex, NodeId, Term};

/// A cap well above any term this cluster could plausibly reach; a frame
/// claiming a term beyond it is treated as malformed (spec §4.6).
pub const MAX_TERM: Term = (1u64 << 63) - 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntries {
    pub term: Term,
    pub sender_id: NodeId,
    pub prev_log_index: LogIndex,
    pub prev_log_term: Term,
    pub entries: Vec<LogEntry>,
    pub leader_commit: LogIndex,
    /// Monotonically increasing probe id, echoed back for RTT sampling.
    pub probe_id: u64,
    /// Leader-side send timestamp, in milliseconds since an arbitrary
    /// monotonic epoch private to the sending leader. Only meaningful to
    /// the leader that sent it (it subtracts its own clock on reply).
    pub send_ts_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesReply {
    pub term: Term,
    pub sender_id: NodeId,
    pub success: bool,
    pub match_index: LogIndex,
    pub probe_id: u64,
    pub send_ts_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestVote {
    pub term: Term,
    pub sender_id: NodeId,
    pub last_log_index: LogIndex,
    pub last_log_term: Term,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestVoteReply {
    pub term: Term,
    pub sender_id: NodeId,
    pub vote_granted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubLeaderAssign {
    pub term: Term,
    pub sender_id: NodeId,
    pub rank: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubLeaderRevoke {
    pub term: Term,
    pub sender_id: NodeId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromoteLeader {
    pub term: Term,
    pub sender_id: NodeId,
    pub rank: u8,
    pub last_log_index: LogIndex,
    pub last_log_term: Term,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromoteAck {
    pub term: Term,
    pub sender_id: NodeId,
    pub accept: bool,
}

/// The complete wire taxonomy of spec §6.1.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    AppendEntries(AppendEntries),
    AppendEntriesReply(AppendEntriesReply),
    RequestVote(RequestVote),
    RequestVoteReply(RequestVoteReply),
    SubLeaderAssign(SubLeaderAssign),
    SubLeaderRevoke(SubLeaderRevoke),
    PromoteLeader(PromoteLeader),
    PromoteAck(PromoteAck),
}

impl Message {
    pub fn term(&self) -> Term {
        match self {
            Message::AppendEntries(m) => m.term,
            Message::AppendEntriesReply(m) => m.term,
            Message::RequestVote(m) => m.term,
            Message::RequestVoteReply(m) => m.term,
            Message::SubLeaderAssign(m) => m.term,
            Message::SubLeaderRevoke(m) => m.term,
            Message::PromoteLeader(m) => m.term,
            Message::PromoteAck(m) => m.term,
        }
    }

    pub fn sender_id(&self) -> NodeId {
        match self {
            Message::AppendEntries(m) => m.sender_id,
            Message::AppendEntriesReply(m) => m.sender_id,
            Message::RequestVote(m) => m.sender_id,
            Message::RequestVoteReply(m) => m.sender_id,
            Message::SubLeaderAssign(m) => m.sender_id,
            Message::SubLeaderRevoke(m) => m.sender_id,
            Message::PromoteLeader(m) => m.sender_id,
            Message::PromoteAck(m) => m.sender_id,
        }
    }

    /// A short tag for logging/metrics, never for wire representation.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::AppendEntries(_) => "append_entries",
            Message::AppendEntriesReply(_) => "append_entries_reply",
            Message::RequestVote(_) => "request_vote",
            Message::RequestVoteReply(_) => "request_vote_reply",
            Message::SubLeaderAssign(_) => "sub_leader_assign",
            Message::SubLeaderRevoke(_) => "sub_leader_revoke",
            Message::PromoteLeader(_) => "promote_leader",
            Message::PromoteAck(_) => "promote_ack",
        }
    }
}

/// Validate a decoded frame's term field against the malformed-frame rule
/// of spec §4.6.
pub fn validate_term(term: Term) -> Result<(), CodecError> {
    if term > MAX_TERM {
        Err(CodecError::TermOutOfRange)
    } else {
        Ok(())
    }
}

/// Encode a message to bytes (no length prefix — the transport adds that).
pub fn encode(msg: &Message) -> Result<Vec<u8>, CodecError> {
    bincode::serialize(msg).map_err(|e| CodecError::Serialize(e.to_string()))
}

/// Decode a message from bytes, validating the term field.
pub fn decode(bytes: &[u8]) -> Result<Message, CodecError> {
    let msg: Message =
        bincode::deserialize(bytes).map_err(|e| CodecError::Deserialize(e.to_string()))?;
    validate_term(msg.term())?;
    Ok(msg)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_messages() -> Vec<Message> {
        vec![
            Message::AppendEntries(AppendEntries {
                term: 3,
                sender_id: 1,
                prev_log_index: 10,
                prev_log_term: 2,
                entries: vec![LogEntry {
                    term: 3,
                    payload: vec![1, 2, 3],
                }],
                leader_commit: 9,
                probe_id: 42,
                send_ts_ms: 1234,
            }),
            Message::AppendEntriesReply(AppendEntriesReply {
                term: 3,
                sender_id: 2,
                success: true,
                match_index: 11,
                probe_id: 42,
                send_ts_ms: 1234,
            }),
            Message::RequestVote(RequestVote {
                term: 4,
                sender_id: 1,
                last_log_index: 11,
                last_log_term: 3,
            }),
            Message::RequestVoteReply(RequestVoteReply {
                term: 4,
                sender_id: 2,
                vote_granted: false,
            }),
            Message::SubLeaderAssign(SubLeaderAssign {
                term: 4,
                sender_id: 1,
                rank: 0,
            }),
            Message::SubLeaderRevoke(SubLeaderRevoke {
                term: 4,
                sender_id: 1,
            }),
            Message::PromoteLeader(PromoteLeader {
                term: 5,
                sender_id: 2,
                rank: 0,
                last_log_index: 11,
                last_log_term: 3,
            }),
            Message::PromoteAck(PromoteAck {
                term: 5,
                sender_id: 3,
                accept: true,
            }),
        ]
    }

    #[test]
    fn encode_then_decode_round_trips_every_variant() {
        for msg in sample_messages() {
            let bytes = encode(&msg).expect("encode");
            let decoded = decode(&bytes).expect("decode");
            assert_eq!(decoded.kind(), msg.kind());
            assert_eq!(decoded.term(), msg.term());
            assert_eq!(decoded.sender_id(), msg.sender_id());
        }
    }

    #[test]
    fn term_above_cap_is_rejected() {
        assert!(validate_term(MAX_TERM).is_ok());
        assert!(validate_term(MAX_TERM + 1).is_err());
    }
}
