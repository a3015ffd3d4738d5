//! The driver loop: a single-writer event-driven agent owning all
//! consensus state (spec §2/§5). `Engine` is generic over its three
//! external collaborators (`Transport`, `LogStore`, `MetricsSink`) so the
//! consensus core never depends on sockets, files, or a metrics backend.
//!
//! Grounded on the teacher's `distributed::DistributedNode` (the
//! "wire everything together" shape) and on spec §2's dependency order:
//! codec -> transport -> metrics -> raft core -> s-raft extension ->
//! role scheduler -> driver.

use std::collections::{HashMap, HashSet};
use std::time::Instant;

use tracing::{debug, info};

use crate::codec::Message;
use crate::config::ConsensusKnobs;
use crate::logstore::LogStore;
use crate::metrics::MetricsSink;
use crate::raft::scheduler::{interval_for, timer_kind_for, Scheduler};
use crate::transport::Transport;
use crate::types::{LogIndex, NodeId, Rank, Role, SubRole, Term};

/// Per-candidacy vote tally.
#[derive(Debug, Default)]
pub(crate) struct CandidateState {
    pub votes_received: HashSet<NodeId>,
}

/// Leader-only volatile state (spec §3.3).
pub(crate) struct LeaderState {
    pub next_index: HashMap<NodeId, LogIndex>,
    pub match_index: HashMap<NodeId, LogIndex>,
    pub rtt_estimate: HashMap<NodeId, f64>,
    pub rtt_sampled_at: HashMap<NodeId, Instant>,
    pub subleaders: (Option<NodeId>, Option<NodeId>),
    pub rounds_since_rerank: u32,
    pub next_probe_id: u64,
    /// Most recent outstanding probe id per peer, so a stale reply (wrong
    /// probe id) is discarded (spec §4.3 "Samples with reply term != probe
    /// term are discarded" generalizes to probe id here).
    pub outstanding_probe: HashMap<NodeId, u64>,
}

impl LeaderState {
    pub(crate) fn new(peers: &[NodeId]) -> Self {
        let mut next_index = HashMap::new();
        let mut match_index = HashMap::new();
        for &p in peers {
            next_index.insert(p, 1);
            match_index.insert(p, 0);
        }
        Self {
            next_index,
            match_index,
            rtt_estimate: HashMap::new(),
            rtt_sampled_at: HashMap::new(),
            subleaders: (None, None),
            rounds_since_rerank: 0,
            next_probe_id: 0,
            outstanding_probe: HashMap::new(),
        }
    }
}

/// An in-flight instant-promotion attempt (spec §4.4).
pub(crate) struct PromotionAttempt {
    pub rank: Rank,
    pub new_term: Term,
    pub acks: HashSet<NodeId>,
}

/// What a Follower is doing besides replicating (spec §3.4).
pub(crate) enum FollowerSub {
    Plain,
    SubLeader(Rank),
    InstantPromoting(PromotionAttempt),
}

pub(crate) enum RoleState {
    Follower(FollowerSub),
    Candidate(CandidateState),
    Leader(LeaderState),
}

impl RoleState {
    pub(crate) fn role(&self) -> Role {
        match self {
            RoleState::Follower(_) => Role::Follower,
            RoleState::Candidate(_) => Role::Candidate,
            RoleState::Leader(_) => Role::Leader,
        }
    }

    pub(crate) fn sub_role(&self) -> SubRole {
        match self {
            RoleState::Follower(FollowerSub::SubLeader(r)) => SubRole::Assigned(*r),
            _ => SubRole::None,
        }
    }
}

/// One event the driver consumes per iteration (spec §2 "driver loop").
pub enum Event {
    Inbound(Message),
    Timer { epoch: u64 },
    Admin(AdminCommand),
}

/// Admin surface (SPEC_FULL.md §4.7) — named by spec.md but never
/// enumerated there.
pub enum AdminCommand {
    Propose(Vec<u8>, tokio::sync::oneshot::Sender<Result<LogIndex, crate::error::EngineError>>),
    DumpState(tokio::sync::oneshot::Sender<crate::types::NodeSnapshot>),
    /// Graceful drain request. `Engine` itself has no shutdown state to
    /// mutate — the driver loop is what owns the process lifetime — so
    /// this only acknowledges; the caller is expected to stop polling
    /// events after it resolves.
    Shutdown(tokio::sync::oneshot::Sender<()>),
}

/// The single-writer consensus agent.
pub struct Engine<T: Transport, L: LogStore, M: MetricsSink> {
    pub(crate) id: NodeId,
    pub(crate) peers: Vec<NodeId>,
    pub(crate) knobs: ConsensusKnobs,
    pub(crate) majority: usize,

    pub(crate) current_term: Term,
    pub(crate) voted_for: Option<NodeId>,
    pub(crate) log: L,
    pub(crate) commit_index: LogIndex,
    pub(crate) last_applied: LogIndex,
    pub(crate) leader_id: Option<NodeId>,

    pub(crate) role: RoleState,
    pub(crate) scheduler: Scheduler,

    pub(crate) transport: T,
    pub(crate) metrics: M,

    /// Election start time, for `election_won` duration metrics.
    pub(crate) election_started_at: Option<Instant>,
    /// Instant-promotion start time, for `promotion_*` duration metrics.
    pub(crate) promotion_started_at: Option<Instant>,
    /// Last time a valid `AppendEntries` was observed from `leader_id`
    /// (spec §4.4's third accept condition: "the peer's recorded leader of
    /// the previous term is now silent").
    pub(crate) last_leader_contact_at: Option<Instant>,

    /// Monotonic base used to turn `Instant`s into millisecond offsets
    /// carried on the wire (AppendEntries `send_ts_ms`), since `Instant`
    /// itself cannot be serialized or compared across nodes.
    pub(crate) clock_origin: Instant,
}

impl<T: Transport, L: LogStore, M: MetricsSink> Engine<T, L, M> {
    pub fn new(id: NodeId, peers: Vec<NodeId>, knobs: ConsensusKnobs, log: L, transport: T, metrics: M) -> Self {
        let (current_term, voted_for) = log.load_term_and_vote();
        let majority = peers.len() + 1 /* self */;
        let majority = majority / 2 + 1;
        let kind = timer_kind_for(Role::Follower, SubRole::None);
        let scheduler = Scheduler::new(interval_for(kind, &knobs));

        Self {
            id,
            peers,
            knobs,
            majority,
            current_term,
            voted_for,
            log,
            commit_index: 0,
            last_applied: 0,
            leader_id: None,
            role: RoleState::Follower(FollowerSub::Plain),
            scheduler,
            transport,
            metrics,
            election_started_at: None,
            promotion_started_at: None,
            last_leader_contact_at: None,
            clock_origin: Instant::now(),
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn commit_index(&self) -> LogIndex {
        self.commit_index
    }

    /// Read a single log entry at `index`, for introspection/tests. Real
    /// clients only ever see committed state through their own state
    /// machine, which is out of scope here (spec §1's opaque-log
    /// boundary) — this is a debug accessor, not a replicated read.
    pub fn log_entry(&self, index: LogIndex) -> Option<crate::types::LogEntry> {
        self.log.entries_from(index).into_iter().next()
    }

    pub fn role(&self) -> Role {
        self.role.role()
    }

    pub fn sub_role(&self) -> SubRole {
        self.role.sub_role()
    }

    pub fn current_term(&self) -> Term {
        self.current_term
    }

    pub fn snapshot(&self) -> crate::types::NodeSnapshot {
        crate::types::NodeSnapshot {
            id: self.id,
            role: self.role(),
            sub_role: self.sub_role(),
            term: self.current_term,
            commit_index: self.commit_index,
            last_applied: self.last_applied,
            leader_id: self.leader_id,
        }
    }

    /// Current scheduler epoch, so the caller can arm a timer future.
    pub fn timer_epoch(&self) -> u64 {
        self.scheduler.epoch()
    }

    pub fn timer_deadline(&self) -> Instant {
        self.scheduler.deadline()
    }

    fn now_ms(&self) -> u64 {
        self.clock_origin.elapsed().as_millis() as u64
    }

    /// Rearm the scheduler for the current role/sub-role and return the
    /// new epoch.
    pub(crate) fn rearm(&mut self) -> u64 {
        let kind = timer_kind_for(self.role(), self.sub_role());
        let interval = interval_for(kind, &self.knobs);
        self.scheduler.rearm(interval)
    }

    /// Step down to Follower at `term`, clearing vote and sub-leader
    /// assignment (spec §4.2/§4.6 "higher term observed").
    pub(crate) fn step_down(&mut self, term: Term, reason: &str) {
        self.current_term = term;
        self.voted_for = None;
        self.leader_id = None;
        self.role = RoleState::Follower(FollowerSub::Plain);
        self.persist_term_and_vote(term, None);
        self.record_event(crate::metrics::MetricEvent::StepDown {
            reason: reason.to_string(),
        });
        info!(term, reason, "stepped down");
        self.rearm();
    }

    /// Persist `current_term`/`voted_for`, aborting the process on failure
    /// (spec §4.6/§7: a log-store write failure is fatal — the node must
    /// never keep running on persistent state it can no longer trust, since
    /// that risks two leaders voting in the same term).
    pub(crate) fn persist_term_and_vote(&mut self, term: Term, voted_for: Option<NodeId>) {
        if let Err(err) = self.log.save_term_and_vote(term, voted_for) {
            self.abort_on_log_store_failure(err);
        }
    }

    /// Log and abort on an unrecoverable log-store error (spec §4.6/§7).
    pub(crate) fn abort_on_log_store_failure(&self, err: crate::error::LogStoreError) -> ! {
        let err = crate::error::EngineError::LogStoreFatal(err);
        tracing::error!(node = self.id, error = %err, "log store failure, aborting process");
        std::process::exit(1);
    }

    pub(crate) fn record_event(&self, event: crate::metrics::MetricEvent) {
        self.metrics.record(self.id, self.now_ms(), event);
    }

    pub(crate) fn send(&self, to: NodeId, msg: Message) {
        self.transport.send(to, msg);
    }

    pub(crate) fn broadcast(&self, make: impl Fn(NodeId) -> Message) {
        for &peer in &self.peers {
            self.send(peer, make(peer));
        }
    }

    fn last_log_index(&self) -> LogIndex {
        self.log.last_index()
    }

    fn last_log_term(&self) -> Term {
        self.log.last_term()
    }

    /// One step of the driver: apply `event` to completion, as spec §2/§5
    /// require ("the driver pulls one event at a time ... and applies it
    /// atomically").
    pub fn handle(&mut self, event: Event) {
        match event {
            Event::Inbound(msg) => self.handle_message(msg),
            Event::Timer { epoch } => {
                if !self.scheduler.is_current(epoch) {
                    debug!(epoch, "discarding stale timer");
                    return;
                }
                self.handle_timer();
            }
            Event::Admin(cmd) => self.handle_admin(cmd),
        }
    }

    fn handle_admin(&mut self, cmd: AdminCommand) {
        match cmd {
            AdminCommand::Propose(payload, reply) => {
                let result = self.propose(payload);
                let _ = reply.send(result);
            }
            AdminCommand::DumpState(reply) => {
                let _ = reply.send(self.snapshot());
            }
            AdminCommand::Shutdown(reply) => {
                let _ = reply.send(());
            }
        }
    }

    fn propose(&mut self, payload: Vec<u8>) -> Result<LogIndex, crate::error::EngineError> {
        if self.role() != Role::Leader {
            return Err(crate::error::EngineError::NotLeader(self.id));
        }
        let index = self.last_log_index() + 1;
        let entry = crate::types::LogEntry {
            term: self.current_term,
            payload,
        };
        self.log.append(index, std::slice::from_ref(&entry))?;
        Ok(index)
    }

    fn handle_timer(&mut self) {
        match &self.role {
            RoleState::Leader(_) => self.send_heartbeats(),
            RoleState::Follower(FollowerSub::SubLeader(_)) => self.attempt_instant_promotion(),
            RoleState::Follower(FollowerSub::InstantPromoting(_)) => {
                self.handle_promotion_deadline();
            }
            RoleState::Follower(FollowerSub::Plain) | RoleState::Candidate(_) => {
                self.start_election();
            }
        }
    }

    fn handle_message(&mut self, msg: Message) {
        // Any reply/request with a higher term forces a step down before
        // its semantic content is processed (spec §6.1) — except
        // `PromoteLeader`, whose term is only a claim. Spec §4.4: a peer
        // that rejects the promotion "takes no further action"; adopting
        // the term here would tear down a live leader's healthy term on a
        // promotion that later gets refused. `on_promote_leader` adopts the
        // term itself, only in its accept branch.
        if msg.term() > self.current_term && !matches!(msg, Message::PromoteLeader(_)) {
            self.step_down(msg.term(), "higher term observed");
        }

        match msg {
            Message::AppendEntries(m) => self.on_append_entries(m),
            Message::AppendEntriesReply(m) => self.on_append_entries_reply(m),
            Message::RequestVote(m) => self.on_request_vote(m),
            Message::RequestVoteReply(m) => self.on_request_vote_reply(m),
            Message::SubLeaderAssign(m) => self.on_subleader_assign(m),
            Message::SubLeaderRevoke(m) => self.on_subleader_revoke(m),
            Message::PromoteLeader(m) => self.on_promote_leader(m),
            Message::PromoteAck(m) => self.on_promote_ack(m),
        }
    }

    pub(crate) fn up_to_date(&self, cand_last_term: Term, cand_last_index: LogIndex) -> bool {
        crate::types::is_at_least_as_up_to_date(
            cand_last_term,
            cand_last_index,
            self.last_log_term(),
            self.last_log_index(),
        )
    }
}
