//! Role scheduler: the single authoritative deadline governing a node's
//! role, and the four randomized interval families of spec §4.1.
//!
//! Timers are never cancelled (spec §5 "Cancellation"/§9 "Timer
//! epoching"): each armed deadline is tagged with the epoch it was armed
//! at, and a timer firing with a stale epoch is silently discarded by the
//! driver. This sidesteps cancellation races entirely.

use std::time::{Duration, Instant};

use rand::Rng;

use crate::config::{ConsensusKnobs, TimeoutRange};
use crate::types::{Rank, Role, SubRole};

/// Which interval family applies, derived from the node's current
/// role/sub-role (spec §4.1's table).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    LeaderHeartbeat,
    Primary,
    Secondary,
    FollowerOrCandidate,
}

pub fn timer_kind_for(role: Role, sub_role: SubRole) -> TimerKind {
    match (role, sub_role) {
        (Role::Leader, _) => TimerKind::LeaderHeartbeat,
        (_, SubRole::Assigned(Rank::Primary)) => TimerKind::Primary,
        (_, SubRole::Assigned(Rank::Secondary)) => TimerKind::Secondary,
        _ => TimerKind::FollowerOrCandidate,
    }
}

/// Draw a randomized (or fixed, for the leader) interval for `kind`.
pub fn interval_for(kind: TimerKind, knobs: &ConsensusKnobs) -> Duration {
    match kind {
        TimerKind::LeaderHeartbeat => Duration::from_millis(knobs.heartbeat_interval_ms),
        TimerKind::Primary => uniform(knobs.primary_timeout),
        TimerKind::Secondary => uniform(knobs.secondary_timeout),
        TimerKind::FollowerOrCandidate => uniform(knobs.follower_timeout),
    }
}

fn uniform(range: TimeoutRange) -> Duration {
    let ms = if range.min_ms >= range.max_ms {
        range.min_ms
    } else {
        rand::thread_rng().gen_range(range.min_ms..range.max_ms)
    };
    Duration::from_millis(ms)
}

/// The single authoritative deadline. `epoch` increments every time the
/// deadline is rearmed; a timer fired for a past `epoch` is stale.
#[derive(Debug, Clone, Copy)]
pub struct Scheduler {
    epoch: u64,
    deadline: Instant,
}

impl Scheduler {
    pub fn new(initial_interval: Duration) -> Self {
        Self {
            epoch: 0,
            deadline: Instant::now() + initial_interval,
        }
    }

    /// Rearm the deadline `interval` from now, bumping the epoch. Returns
    /// the new epoch so the caller can tag the scheduled timer future.
    pub fn rearm(&mut self, interval: Duration) -> u64 {
        self.epoch += 1;
        self.deadline = Instant::now() + interval;
        self.epoch
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Whether a timer firing for `fired_epoch` is still the live one.
    pub fn is_current(&self, fired_epoch: u64) -> bool {
        fired_epoch == self.epoch
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timer_kind_prefers_leader_over_subrole() {
        assert_eq!(
            timer_kind_for(Role::Leader, SubRole::Assigned(Rank::Primary)),
            TimerKind::LeaderHeartbeat
        );
    }

    #[test]
    fn timer_kind_picks_rank_when_follower() {
        assert_eq!(
            timer_kind_for(Role::Follower, SubRole::Assigned(Rank::Secondary)),
            TimerKind::Secondary
        );
        assert_eq!(
            timer_kind_for(Role::Follower, SubRole::None),
            TimerKind::FollowerOrCandidate
        );
        assert_eq!(
            timer_kind_for(Role::Candidate, SubRole::None),
            TimerKind::FollowerOrCandidate
        );
    }

    #[test]
    fn stale_epoch_is_detected_after_rearm() {
        let mut s = Scheduler::new(Duration::from_millis(10));
        let e1 = s.epoch();
        let e2 = s.rearm(Duration::from_millis(10));
        assert_ne!(e1, e2);
        assert!(!s.is_current(e1));
        assert!(s.is_current(e2));
    }

    #[test]
    fn interval_ladder_matches_spec_defaults() {
        let knobs = ConsensusKnobs::default();
        for _ in 0..50 {
            let p = interval_for(TimerKind::Primary, &knobs);
            let s = interval_for(TimerKind::Secondary, &knobs);
            let f = interval_for(TimerKind::FollowerOrCandidate, &knobs);
            assert!(p < s);
            assert!(s < f);
        }
    }
}
