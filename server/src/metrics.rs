use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Successful joins are bucketed by the share of the join timeout they waited.
const JOIN_WAIT_TENTHS: usize = 10;

#[derive(Clone, Debug, Serialize)]
pub struct JoinWaitSnapshot {
    /// `by_tenth_of_timeout[i]` counts joins that waited between `i` and `i + 1`
    /// tenths of the join timeout.
    pub by_tenth_of_timeout: [u64; JOIN_WAIT_TENTHS],
    /// Joins that only landed during the grace polls after the deadline.
    pub past_deadline: u64,
    pub joined: u64,
    pub avg_wait_ms: f64,
    pub longest_wait_ms: u64,
}

#[derive(Default)]
struct JoinWaitMetrics {
    by_tenth: [AtomicU64; JOIN_WAIT_TENTHS],
    past_deadline: AtomicU64,
    joined: AtomicU64,
    total_ms: AtomicU64,
    longest_ms: AtomicU64,
}

impl JoinWaitMetrics {
    fn record(&self, waited: Duration, timeout: Duration) {
        let ms = waited.as_millis() as u64;
        self.joined.fetch_add(1, Ordering::Relaxed);
        self.total_ms.fetch_add(ms, Ordering::Relaxed);
        self.longest_ms.fetch_max(ms, Ordering::Relaxed);

        let timeout_ms = (timeout.as_millis() as u64).max(1);
        let tenth = (ms.saturating_mul(JOIN_WAIT_TENTHS as u64) / timeout_ms) as usize;
        match self.by_tenth.get(tenth) {
            Some(bucket) => bucket.fetch_add(1, Ordering::Relaxed),
            None => self.past_deadline.fetch_add(1, Ordering::Relaxed),
        };
    }

    fn snapshot(&self) -> JoinWaitSnapshot {
        let joined = self.joined.load(Ordering::Relaxed);
        let avg_wait_ms = match joined {
            0 => 0.0,
            n => self.total_ms.load(Ordering::Relaxed) as f64 / n as f64,
        };
        JoinWaitSnapshot {
            by_tenth_of_timeout: std::array::from_fn(|tenth| {
                self.by_tenth[tenth].load(Ordering::Relaxed)
            }),
            past_deadline: self.past_deadline.load(Ordering::Relaxed),
            joined,
            avg_wait_ms,
            longest_wait_ms: self.longest_ms.load(Ordering::Relaxed),
        }
    }
}

#[derive(Default)]
pub struct TournamentMetrics {
    matchmaking_ticks: AtomicU64,
    matchmaking_idle_ticks: AtomicU64,
    groups_dispatched: AtomicU64,
    groups_formed: AtomicU64,
    formation_failures: AtomicU64,
    players_requeued: AtomicU64,
    consistency_faults: AtomicU64,
    joins_started: AtomicU64,
    joins_succeeded: AtomicU64,
    joins_timed_out: AtomicU64,
    joins_cancelled: AtomicU64,
    score_events_applied: AtomicU64,
    score_events_dropped: AtomicU64,
    settlements: AtomicU64,
    rebuilds: AtomicU64,
    join_wait: JoinWaitMetrics,
}

#[derive(Clone, Debug, Serialize)]
pub struct TournamentMetricsSnapshot {
    pub matchmaking_ticks: u64,
    pub matchmaking_idle_ticks: u64,
    pub groups_dispatched: u64,
    pub groups_formed: u64,
    pub formation_failures: u64,
    pub players_requeued: u64,
    pub consistency_faults: u64,
    pub joins_started: u64,
    pub joins_succeeded: u64,
    pub joins_timed_out: u64,
    pub joins_cancelled: u64,
    pub score_events_applied: u64,
    pub score_events_dropped: u64,
    pub settlements: u64,
    pub rebuilds: u64,
    pub join_wait: JoinWaitSnapshot,
}

impl TournamentMetrics {
    pub fn snapshot(&self) -> TournamentMetricsSnapshot {
        TournamentMetricsSnapshot {
            matchmaking_ticks: self.matchmaking_ticks.load(Ordering::Relaxed),
            matchmaking_idle_ticks: self.matchmaking_idle_ticks.load(Ordering::Relaxed),
            groups_dispatched: self.groups_dispatched.load(Ordering::Relaxed),
            groups_formed: self.groups_formed.load(Ordering::Relaxed),
            formation_failures: self.formation_failures.load(Ordering::Relaxed),
            players_requeued: self.players_requeued.load(Ordering::Relaxed),
            consistency_faults: self.consistency_faults.load(Ordering::Relaxed),
            joins_started: self.joins_started.load(Ordering::Relaxed),
            joins_succeeded: self.joins_succeeded.load(Ordering::Relaxed),
            joins_timed_out: self.joins_timed_out.load(Ordering::Relaxed),
            joins_cancelled: self.joins_cancelled.load(Ordering::Relaxed),
            score_events_applied: self.score_events_applied.load(Ordering::Relaxed),
            score_events_dropped: self.score_events_dropped.load(Ordering::Relaxed),
            settlements: self.settlements.load(Ordering::Relaxed),
            rebuilds: self.rebuilds.load(Ordering::Relaxed),
            join_wait: self.join_wait.snapshot(),
        }
    }

    pub fn inc_matchmaking_tick(&self) {
        self.matchmaking_ticks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_matchmaking_idle_tick(&self) {
        self.matchmaking_idle_ticks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_group_dispatched(&self) {
        self.groups_dispatched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_group_formed(&self) {
        self.groups_formed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_formation_failure(&self) {
        self.formation_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_player_requeued(&self) {
        self.players_requeued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_consistency_fault(&self) {
        self.consistency_faults.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_join_started(&self) {
        self.joins_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_join_succeeded(&self) {
        self.joins_succeeded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_join_timed_out(&self) {
        self.joins_timed_out.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_join_cancelled(&self) {
        self.joins_cancelled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_score_event_applied(&self) {
        self.score_events_applied.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_score_event_dropped(&self) {
        self.score_events_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_settlement(&self) {
        self.settlements.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_rebuild(&self) {
        self.rebuilds.fetch_add(1, Ordering::Relaxed);
    }

    /// Records how long a successful join waited against the configured timeout.
    pub fn record_join_wait(&self, waited: Duration, timeout: Duration) {
        self.join_wait.record(waited, timeout);
    }
}
