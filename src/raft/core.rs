//! Classical Raft path: leader election, log replication, and the
//! current-term commit rule (spec §4.2).
//!
//! Grounded on the teacher's per-message handler functions in
//! `core/raft.rs` (`handle_append_entries`, `handle_request_vote`, ...),
//! generalized to add the conflicting-suffix truncation and the
//! current-term-only commit advance that the teacher's version omits.

use std::collections::HashSet;

use tracing::{debug, info, warn};

use crate::codec::{AppendEntries, AppendEntriesReply, Message, RequestVote, RequestVoteReply};
use crate::logstore::LogStore;
use crate::metrics::MetricEvent;
use crate::raft::engine::{CandidateState, Engine, FollowerSub, LeaderState, RoleState};
use crate::transport::Transport;
use crate::types::{LogIndex, Role};

impl<T: Transport, L: LogStore, M: crate::metrics::MetricsSink> Engine<T, L, M> {
    /// Follower/Candidate deadline expiry with no sub-leader assignment:
    /// run a classical election (spec §4.2).
    pub(crate) fn start_election(&mut self) {
        self.current_term += 1;
        let term = self.current_term;
        self.voted_for = Some(self.id);
        self.persist_term_and_vote(term, Some(self.id));
        self.leader_id = None;

        let mut votes = HashSet::new();
        votes.insert(self.id);
        self.role = RoleState::Candidate(CandidateState { votes_received: votes });
        self.election_started_at = Some(std::time::Instant::now());
        self.record_event(MetricEvent::ElectionStarted);
        info!(term, "starting election");

        let last_log_index = self.log.last_index();
        let last_log_term = self.log.last_term();
        self.broadcast(|_| {
            Message::RequestVote(RequestVote {
                term,
                sender_id: self.id,
                last_log_index,
                last_log_term,
            })
        });

        self.rearm();

        // A single-node cluster (no peers) wins immediately.
        self.maybe_become_leader();
    }

    pub(crate) fn on_request_vote(&mut self, m: RequestVote) {
        let grant = m.term == self.current_term
            && (self.voted_for.is_none() || self.voted_for == Some(m.sender_id))
            && self.up_to_date(m.last_log_term, m.last_log_index);

        if grant {
            self.voted_for = Some(m.sender_id);
            self.persist_term_and_vote(self.current_term, Some(m.sender_id));
            self.rearm();
        }

        debug!(candidate = m.sender_id, grant, "request_vote");
        self.send(
            m.sender_id,
            Message::RequestVoteReply(RequestVoteReply {
                term: self.current_term,
                sender_id: self.id,
                vote_granted: grant,
            }),
        );
    }

    pub(crate) fn on_request_vote_reply(&mut self, m: RequestVoteReply) {
        if m.term != self.current_term || !m.vote_granted {
            return;
        }
        let RoleState::Candidate(candidate) = &mut self.role else {
            return;
        };
        candidate.votes_received.insert(m.sender_id);
        self.maybe_become_leader();
    }

    fn maybe_become_leader(&mut self) {
        let RoleState::Candidate(candidate) = &self.role else {
            return;
        };
        if candidate.votes_received.len() < self.majority {
            return;
        }
        let term = self.current_term;
        let duration_ms = self
            .election_started_at
            .map(|t| t.elapsed().as_millis() as u64)
            .unwrap_or(0);

        self.leader_id = Some(self.id);
        self.role = RoleState::Leader(LeaderState::new(&self.peers));
        self.record_event(MetricEvent::ElectionWon { term, duration_ms });
        info!(term, duration_ms, "won election");

        self.rearm();
        self.send_heartbeats();
    }

    /// Leader heartbeat/replicate duty, fired every `heartbeat_interval_ms`
    /// (spec §4.1) and also immediately on becoming leader.
    pub(crate) fn send_heartbeats(&mut self) {
        if !matches!(self.role, RoleState::Leader(_)) {
            return;
        }
        let term = self.current_term;
        let commit_index = self.commit_index;
        let send_ts_ms = self.clock_origin.elapsed().as_millis() as u64;

        let probe_id = {
            let RoleState::Leader(leader) = &mut self.role else { unreachable!() };
            let id = leader.next_probe_id;
            leader.next_probe_id += 1;
            id
        };

        // Build each peer's frame from the log and `next_index` first, so
        // no borrow of `self.role` is alive while `self.send` borrows
        // `self` again.
        let mut outgoing = Vec::with_capacity(self.peers.len());
        for &peer in &self.peers {
            let next = {
                let RoleState::Leader(leader) = &self.role else { unreachable!() };
                *leader.next_index.get(&peer).unwrap_or(&1)
            };
            let prev_log_index = next.saturating_sub(1);
            let prev_log_term = if prev_log_index == 0 {
                0
            } else {
                self.log.term_at(prev_log_index).unwrap_or(0)
            };
            let entries = self.log.entries_from(next);
            outgoing.push((
                peer,
                AppendEntries {
                    term,
                    sender_id: self.id,
                    prev_log_index,
                    prev_log_term,
                    entries,
                    leader_commit: commit_index,
                    probe_id,
                    send_ts_ms,
                },
            ));
        }

        if let RoleState::Leader(leader) = &mut self.role {
            for (peer, _) in &outgoing {
                leader.outstanding_probe.insert(*peer, probe_id);
            }
        }

        for (peer, frame) in outgoing {
            self.send(peer, Message::AppendEntries(frame));
        }

        self.rearm();
        self.maybe_rerank_subleaders();
    }

    pub(crate) fn on_append_entries(&mut self, m: AppendEntries) {
        if m.term < self.current_term {
            self.send(
                m.sender_id,
                Message::AppendEntriesReply(AppendEntriesReply {
                    term: self.current_term,
                    sender_id: self.id,
                    success: false,
                    match_index: 0,
                    probe_id: m.probe_id,
                    send_ts_ms: m.send_ts_ms,
                }),
            );
            return;
        }

        // A valid leader for our term demotes us from Candidate (or keeps
        // us a plain Follower) and resets the election/promotion clock.
        if !matches!(self.role, RoleState::Follower(_)) {
            self.role = RoleState::Follower(FollowerSub::Plain);
        } else if let RoleState::Follower(FollowerSub::InstantPromoting(_)) = &self.role {
            warn!(leader = m.sender_id, "abandoning promotion attempt, leader heartbeat observed");
            self.role = RoleState::Follower(FollowerSub::Plain);
        }
        self.leader_id = Some(m.sender_id);
        self.last_leader_contact_at = Some(std::time::Instant::now());
        self.rearm();

        let log_ok = m.prev_log_index == 0
            || self.log.term_at(m.prev_log_index) == Some(m.prev_log_term);

        if !log_ok {
            self.send(
                m.sender_id,
                Message::AppendEntriesReply(AppendEntriesReply {
                    term: self.current_term,
                    sender_id: self.id,
                    success: false,
                    match_index: 0,
                    probe_id: m.probe_id,
                    send_ts_ms: m.send_ts_ms,
                }),
            );
            return;
        }

        let mut match_index = m.prev_log_index;
        if !m.entries.is_empty() {
            if let Err(e) = self.log.append(m.prev_log_index + 1, &m.entries) {
                self.abort_on_log_store_failure(e);
            }
            match_index = m.prev_log_index + m.entries.len() as LogIndex;
        }

        if m.leader_commit > self.commit_index {
            self.commit_index = m.leader_commit.min(self.log.last_index());
        }

        self.send(
            m.sender_id,
            Message::AppendEntriesReply(AppendEntriesReply {
                term: self.current_term,
                sender_id: self.id,
                success: true,
                match_index,
                probe_id: m.probe_id,
                send_ts_ms: m.send_ts_ms,
            }),
        );
    }

    pub(crate) fn on_append_entries_reply(&mut self, m: AppendEntriesReply) {
        self.sample_rtt(m.sender_id, m.probe_id, m.send_ts_ms);

        let RoleState::Leader(leader) = &mut self.role else {
            return;
        };

        if !m.success {
            let next = leader.next_index.entry(m.sender_id).or_insert(1);
            *next = next.saturating_sub(1).max(1);
            return;
        }

        leader.match_index.insert(m.sender_id, m.match_index);
        leader.next_index.insert(m.sender_id, m.match_index + 1);

        self.advance_commit_index();
    }

    /// Only commits entries replicated to a majority AND written in the
    /// current term, per Raft's commit-safety rule (spec §4.2).
    fn advance_commit_index(&mut self) {
        let RoleState::Leader(leader) = &self.role else {
            return;
        };
        let last = self.log.last_index();
        let mut n = last;
        while n > self.commit_index {
            let term_at_n = self.log.term_at(n);
            if term_at_n == Some(self.current_term) {
                let count = 1 + leader
                    .match_index
                    .values()
                    .filter(|&&idx| idx >= n)
                    .count();
                if count >= self.majority {
                    self.commit_index = n;
                    break;
                }
            }
            n -= 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConsensusKnobs;
    use crate::logstore::InMemoryLogStore;
    use crate::metrics::RecordingMetricsSink;
    use crate::transport::ChannelTransport;

    fn engine(id: u64, peers: Vec<u64>) -> Engine<ChannelTransport, InMemoryLogStore, RecordingMetricsSink> {
        let mut all = peers.clone();
        all.push(id);
        let mut cluster = ChannelTransport::cluster(&all);
        let (transport, _rx) = cluster.remove(&id).unwrap();
        Engine::new(
            id,
            peers,
            ConsensusKnobs::default(),
            InMemoryLogStore::default(),
            transport,
            RecordingMetricsSink::default(),
        )
    }

    #[test]
    fn single_node_cluster_wins_election_immediately() {
        let mut e = engine(1, vec![]);
        e.start_election();
        assert_eq!(e.role(), Role::Leader);
        assert_eq!(e.current_term(), 1);
    }

    #[test]
    fn candidate_becomes_leader_after_majority_votes() {
        let mut e = engine(1, vec![2, 3]);
        e.start_election();
        assert_eq!(e.role(), Role::Candidate);

        e.on_request_vote_reply(RequestVoteReply {
            term: 1,
            sender_id: 2,
            vote_granted: true,
        });
        assert_eq!(e.role(), Role::Leader);
    }

    #[test]
    fn append_entries_with_stale_term_is_rejected() {
        let mut e = engine(1, vec![2]);
        e.current_term = 5;
        e.on_append_entries(AppendEntries {
            term: 3,
            sender_id: 2,
            prev_log_index: 0,
            prev_log_term: 0,
            entries: vec![],
            leader_commit: 0,
            probe_id: 0,
            send_ts_ms: 0,
        });
        assert_eq!(e.current_term(), 5);
    }

    #[test]
    fn append_entries_truncates_conflicting_suffix() {
        let mut e = engine(1, vec![2]);
        e.current_term = 1;
        e.log
            .append(
                1,
                &[
                    crate::types::LogEntry { term: 1, payload: vec![1] },
                    crate::types::LogEntry { term: 1, payload: vec![2] },
                ],
            )
            .unwrap();

        e.on_append_entries(AppendEntries {
            term: 2,
            sender_id: 2,
            prev_log_index: 1,
            prev_log_term: 1,
            entries: vec![crate::types::LogEntry { term: 2, payload: vec![9] }],
            leader_commit: 0,
            probe_id: 0,
            send_ts_ms: 0,
        });

        assert_eq!(e.log.last_index(), 2);
        assert_eq!(e.log.entries_from(1)[1].term, 2);
    }

    #[test]
    fn commit_index_only_advances_for_current_term_entries() {
        let mut e = engine(1, vec![2, 3]);
        e.current_term = 2;
        e.log
            .append(1, &[crate::types::LogEntry { term: 1, payload: vec![1] }])
            .unwrap();
        e.log
            .append(2, &[crate::types::LogEntry { term: 2, payload: vec![2] }])
            .unwrap();
        e.role = RoleState::Leader(LeaderState::new(&[2, 3]));

        e.on_append_entries_reply(AppendEntriesReply {
            term: 2,
            sender_id: 2,
            success: true,
            match_index: 1,
            probe_id: 0,
            send_ts_ms: 0,
        });
        // match_index 1 is term 1, not the current term: no commit yet.
        assert_eq!(e.commit_index, 0);

        e.on_append_entries_reply(AppendEntriesReply {
            term: 2,
            sender_id: 2,
            success: true,
            match_index: 2,
            probe_id: 0,
            send_ts_ms: 0,
        });
        assert_eq!(e.commit_index, 2);
    }
}
