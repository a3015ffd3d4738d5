//! The S-Raft extension: RTT-ranked sub-leaders and instant promotion
//! (spec §3.2, §4.3, §4.4). This is the part of the design with no
//! teacher counterpart — there is no sub-leader concept anywhere in
//! `core/raft.rs` — so it is built in the teacher's handler-per-message
//! idiom rather than copied from any one function.

use tracing::{debug, info, warn};

use crate::codec::{Message, PromoteAck, PromoteLeader, SubLeaderAssign, SubLeaderRevoke};
use crate::logstore::LogStore;
use crate::metrics::MetricEvent;
use crate::raft::engine::{Engine, FollowerSub, PromotionAttempt, RoleState};
use crate::raft::scheduler::{interval_for, TimerKind};
use crate::transport::Transport;
use crate::types::{NodeId, Rank, Role};

/// Hard cap on distinct sub-leader ranks: the wire protocol only defines
/// rank 0 (Primary) and rank 1 (Secondary), so `subleader_ratio` can never
/// push the count past 2 regardless of cluster size (Open Question
/// decision, recorded in DESIGN.md).
const MAX_SUBLEADER_RANKS: usize = 2;

impl<T: Transport, L: LogStore, M: crate::metrics::MetricsSink> Engine<T, L, M> {
    /// Update the leader's RTT EWMA for `peer` from a matching
    /// `AppendEntriesReply` (spec §4.3). Replies whose `probe_id` no
    /// longer matches the most recently sent probe for that peer are
    /// stale and discarded.
    pub(crate) fn sample_rtt(&mut self, peer: NodeId, probe_id: u64, send_ts_ms: u64) {
        let RoleState::Leader(leader) = &mut self.role else {
            return;
        };
        if leader.outstanding_probe.get(&peer) != Some(&probe_id) {
            return;
        }
        let now_ms = self.clock_origin.elapsed().as_millis() as u64;
        let rtt_ms = now_ms.saturating_sub(send_ts_ms) as f64;

        let alpha = self.knobs.rtt_ewma_alpha;
        let updated = match leader.rtt_estimate.get(&peer) {
            Some(&prev) => alpha * rtt_ms + (1.0 - alpha) * prev,
            None => rtt_ms,
        };
        leader.rtt_estimate.insert(peer, updated);
        leader.rtt_sampled_at.insert(peer, std::time::Instant::now());

        self.record_event(MetricEvent::HeartbeatRtt { peer, rtt_ms: updated });
    }

    /// Re-rank sub-leaders every `rerank_every_rounds` heartbeat rounds
    /// (spec §4.3). Picks the `MAX_SUBLEADER_RANKS` peers with the lowest
    /// fresh RTT estimate; stale samples (older than `rtt_stale_ms`) are
    /// excluded from ranking.
    pub(crate) fn maybe_rerank_subleaders(&mut self) {
        if !self.knobs.enable_subleader {
            return;
        }
        {
            let RoleState::Leader(leader) = &mut self.role else {
                return;
            };
            leader.rounds_since_rerank += 1;
            if leader.rounds_since_rerank < self.knobs.rerank_every_rounds {
                return;
            }
            leader.rounds_since_rerank = 0;
        }

        let stale_after = std::time::Duration::from_millis(self.knobs.rtt_stale_ms);
        let cap = self
            .knobs
            .subleader_cap(self.peers.len() + 1)
            .min(MAX_SUBLEADER_RANKS);

        let mut ranked: Vec<(NodeId, f64)> = {
            let RoleState::Leader(leader) = &self.role else { return };
            let now = std::time::Instant::now();
            leader
                .rtt_estimate
                .iter()
                .filter(|(peer, _)| {
                    leader
                        .rtt_sampled_at
                        .get(*peer)
                        .map(|&at| now.duration_since(at) < stale_after)
                        .unwrap_or(false)
                })
                .map(|(&peer, &rtt)| (peer, rtt))
                .collect()
        };
        ranked.sort_by(|a, b| a.1.total_cmp(&b.1));
        ranked.truncate(cap);

        let new_primary = ranked.first().map(|(id, _)| *id);
        let new_secondary = ranked.get(1).map(|(id, _)| *id);

        let (old_primary, old_secondary) = {
            let RoleState::Leader(leader) = &self.role else { return };
            leader.subleaders
        };

        if new_primary == old_primary && new_secondary == old_secondary {
            return;
        }

        if let Some(peer) = old_primary {
            if Some(peer) != new_primary {
                self.send(peer, Message::SubLeaderRevoke(SubLeaderRevoke { term: self.current_term, sender_id: self.id }));
            }
        }
        if let Some(peer) = old_secondary {
            if Some(peer) != new_secondary {
                self.send(peer, Message::SubLeaderRevoke(SubLeaderRevoke { term: self.current_term, sender_id: self.id }));
            }
        }
        if let Some(peer) = new_primary {
            if Some(peer) != old_primary {
                self.assign_subleader(peer, Rank::Primary);
            }
        }
        if let Some(peer) = new_secondary {
            if Some(peer) != old_secondary {
                self.assign_subleader(peer, Rank::Secondary);
            }
        }

        if let RoleState::Leader(leader) = &mut self.role {
            leader.subleaders = (new_primary, new_secondary);
        }
    }

    fn assign_subleader(&mut self, peer: NodeId, rank: Rank) {
        self.record_event(MetricEvent::SubleaderAssigned { rank: rank.into(), peer });
        info!(peer, rank = %rank, "assigning sub-leader");
        self.send(
            peer,
            Message::SubLeaderAssign(SubLeaderAssign {
                term: self.current_term,
                sender_id: self.id,
                rank: rank.as_u8(),
            }),
        );
    }

    pub(crate) fn on_subleader_assign(&mut self, m: SubLeaderAssign) {
        if !self.knobs.enable_subleader {
            return;
        }
        if m.term != self.current_term || self.leader_id != Some(m.sender_id) {
            return;
        }
        let Some(rank) = Rank::from_u8(m.rank) else {
            debug!(rank = m.rank, "ignoring sub_leader_assign with unknown rank");
            return;
        };
        if matches!(self.role, RoleState::Follower(_)) {
            self.role = RoleState::Follower(FollowerSub::SubLeader(rank));
            self.rearm();
        }
    }

    pub(crate) fn on_subleader_revoke(&mut self, m: SubLeaderRevoke) {
        if m.term != self.current_term || self.leader_id != Some(m.sender_id) {
            return;
        }
        if let RoleState::Follower(FollowerSub::SubLeader(_)) = &self.role {
            self.role = RoleState::Follower(FollowerSub::Plain);
            self.rearm();
        }
    }

    /// Primary/Secondary's deadline expired with no leader heartbeat
    /// observed: start an instant-promotion attempt (spec §4.4).
    pub(crate) fn attempt_instant_promotion(&mut self) {
        let rank = match &self.role {
            RoleState::Follower(FollowerSub::SubLeader(rank)) => *rank,
            _ => return,
        };

        // Open Question decision: the promoter always claims term+1,
        // regardless of how far behind its last observed term is. Adopted
        // immediately, not deferred to success (spec §4.4 step 1) — each
        // attempt consumes a term whether or not it wins a majority.
        let new_term = self.current_term + 1;
        self.current_term = new_term;
        self.voted_for = Some(self.id);
        self.persist_term_and_vote(new_term, Some(self.id));

        let mut acks = std::collections::HashSet::new();
        acks.insert(self.id);
        self.role = RoleState::Follower(FollowerSub::InstantPromoting(PromotionAttempt {
            rank,
            new_term,
            acks,
        }));
        self.promotion_started_at = Some(std::time::Instant::now());
        self.record_event(MetricEvent::PromotionStarted { rank: rank.into() });
        info!(rank = %rank, new_term, "starting instant promotion");

        let last_log_index = self.log.last_index();
        let last_log_term = self.log.last_term();
        self.broadcast(|_| {
            Message::PromoteLeader(PromoteLeader {
                term: new_term,
                sender_id: self.id,
                rank: rank.as_u8(),
                last_log_index,
                last_log_term,
            })
        });

        // Reuse this rank's own interval as the ack-wait deadline, so the
        // whole attempt stays inside that rank's timeout budget rather
        // than falling through to the (much longer) follower window.
        let kind = if rank == Rank::Primary { TimerKind::Primary } else { TimerKind::Secondary };
        let interval = interval_for(kind, &self.knobs);
        self.scheduler.rearm(interval);
    }

    pub(crate) fn on_promote_leader(&mut self, m: PromoteLeader) {
        // `PromoteLeader` is a request, not a reply (spec §6.1); its term
        // is only a claim, so `handle_message` does not step us down for
        // it.
        //
        // Third accept condition (spec §4.4): the sender must have been
        // our recorded sub-leader last term, or our recorded leader must
        // now be silent. Only a Leader can know the former directly
        // (spec §3.3's `subleaders` is leader-only volatile state); an
        // ordinary follower always falls through to the silence check.
        let recorded_as_subleader = match &self.role {
            RoleState::Leader(leader) => {
                leader.subleaders.0 == Some(m.sender_id) || leader.subleaders.1 == Some(m.sender_id)
            }
            _ => false,
        };
        // A live Leader is its own recorded leader and is by definition
        // not silent to itself; only a non-Leader peer's separately
        // tracked `last_leader_contact_at` can go stale.
        let leader_is_silent = if matches!(self.role, RoleState::Leader(_)) {
            false
        } else {
            match self.last_leader_contact_at {
                Some(at) => {
                    at.elapsed() >= std::time::Duration::from_millis(self.knobs.follower_timeout.min_ms)
                }
                None => true,
            }
        };
        let legitimate = recorded_as_subleader || leader_is_silent;

        let accept = m.term >= self.current_term
            && legitimate
            && self.up_to_date(m.last_log_term, m.last_log_index)
            && (self.voted_for.is_none() || self.voted_for == Some(m.sender_id));

        if accept {
            // On accept, adopt the new term, sender as both vote and
            // leader, and step down to a plain Follower — whatever role
            // we held (Leader, Candidate, sub-leader) is no longer valid
            // once another peer's promotion is accepted (spec §4.4).
            self.current_term = m.term;
            self.voted_for = Some(m.sender_id);
            self.leader_id = Some(m.sender_id);
            self.role = RoleState::Follower(FollowerSub::Plain);
            self.persist_term_and_vote(m.term, Some(m.sender_id));
            self.rearm();
        }

        debug!(promoter = m.sender_id, rank = m.rank, accept, "promote_leader");
        self.send(
            m.sender_id,
            Message::PromoteAck(PromoteAck {
                term: self.current_term,
                sender_id: self.id,
                accept,
            }),
        );
    }

    pub(crate) fn on_promote_ack(&mut self, m: PromoteAck) {
        let RoleState::Follower(FollowerSub::InstantPromoting(attempt)) = &mut self.role else {
            return;
        };
        if m.term != attempt.new_term || !m.accept {
            return;
        }
        attempt.acks.insert(m.sender_id);
        if attempt.acks.len() < self.majority {
            return;
        }

        let rank = attempt.rank;
        let term = attempt.new_term;
        let duration_ms = self
            .promotion_started_at
            .map(|t| t.elapsed().as_millis() as u64)
            .unwrap_or(0);

        self.current_term = term;
        self.persist_term_and_vote(term, Some(self.id));
        self.leader_id = Some(self.id);
        self.role = RoleState::Leader(crate::raft::engine::LeaderState::new(&self.peers));
        self.record_event(MetricEvent::PromotionSucceeded { rank: rank.into(), duration_ms });
        info!(rank = %rank, term, duration_ms, "instant promotion succeeded");

        self.rearm();
        self.send_heartbeats();
    }

    /// The ack-wait deadline for an in-flight promotion attempt expired
    /// without a majority: fall back. The node gives up its sub-leader
    /// rank and reverts to a plain follower, so the timer ladder hands
    /// the next attempt to the next rank down (Primary -> Secondary ->
    /// classical candidacy among all followers).
    pub(crate) fn handle_promotion_deadline(&mut self) {
        let RoleState::Follower(FollowerSub::InstantPromoting(attempt)) = &self.role else {
            return;
        };
        let rank = attempt.rank;
        warn!(rank = %rank, "instant promotion attempt timed out without majority");
        self.record_event(MetricEvent::PromotionFailed {
            rank: rank.into(),
            reason: "ack_deadline_expired".to_string(),
        });
        self.role = RoleState::Follower(FollowerSub::Plain);
        self.rearm();
    }
}
