use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tourney_types::{
    GroupId, GroupLeaderboard, Player, PlayerId, TournamentWindow, ENTRANCE_FEE, MIN_COINS,
    MIN_LEVEL,
};
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::coordinator::Coordinator;
use crate::durable::DurableStore;
use crate::error::{Rejection, Result, TournamentError};
use crate::fast::FastStore;
use crate::metrics::TournamentMetrics;

/// Extra polls after a popped player times out. Two polls span one matchmaking
/// interval.
const POPPED_GRACE_POLLS: u32 = 2;

/// Bounded wait between joining a country queue and landing in a group.
pub struct JoinProtocol<F, D> {
    fast: Arc<F>,
    durable: Arc<D>,
    coordinator: Coordinator<F, D>,
    clock: Clock,
    poll_interval: Duration,
    max_polls: u32,
    metrics: Arc<TournamentMetrics>,
}

impl<F: FastStore, D: DurableStore> JoinProtocol<F, D> {
    pub fn new(
        fast: Arc<F>,
        durable: Arc<D>,
        coordinator: Coordinator<F, D>,
        clock: Clock,
        poll_interval: Duration,
        max_polls: u32,
        metrics: Arc<TournamentMetrics>,
    ) -> Self {
        Self {
            fast,
            durable,
            coordinator,
            clock,
            poll_interval,
            max_polls,
            metrics,
        }
    }

    /// Checks every entry condition without side effects.
    pub async fn eligibility(&self, player: PlayerId) -> Result<Player> {
        let profile = self
            .durable
            .player(player)
            .await?
            .ok_or(TournamentError::UnknownPlayer(player))?;
        if !TournamentWindow::is_active(self.clock.now()) {
            return Err(Rejection::OutsideWindow.into());
        }
        if profile.level < MIN_LEVEL {
            return Err(Rejection::LevelTooLow { min: MIN_LEVEL }.into());
        }
        if profile.coins < MIN_COINS {
            return Err(Rejection::InsufficientCoins { fee: ENTRANCE_FEE }.into());
        }
        if self.coordinator.player_group(player, true).await?.is_some() {
            return Err(Rejection::AlreadyInTournament.into());
        }
        if self.durable.has_unclaimed_reward(player).await? {
            return Err(Rejection::UnclaimedRewards.into());
        }
        Ok(profile)
    }

    /// Queues `player` and waits for their group.
    ///
    /// On timeout or cancellation the player is taken out of their queue.
    pub async fn enter(
        &self,
        player: PlayerId,
        cancel: CancellationToken,
    ) -> Result<GroupLeaderboard> {
        let profile = self.eligibility(player).await?;
        let enqueued_at_ms = self.clock.now().timestamp_millis();
        if !self
            .fast
            .enqueue(profile.country, player, enqueued_at_ms)
            .await?
        {
            return Err(Rejection::AlreadyQueued.into());
        }
        self.metrics.inc_join_started();
        debug!(%player, country = %profile.country, "player queued");

        let started = Instant::now();
        for _ in 0..self.max_polls {
            if let Some(group) = self.coordinator.player_group(player, false).await? {
                return self.joined(player, group, started).await;
            }
            tokio::select! {
                _ = cancel.cancelled() => {
                    return self.abandon(&profile, started, TournamentError::Cancelled).await;
                }
                _ = self.clock.sleep(self.poll_interval) => {}
            }
        }
        self.abandon(&profile, started, TournamentError::Timeout).await
    }

    async fn joined(
        &self,
        player: PlayerId,
        group: GroupId,
        started: Instant,
    ) -> Result<GroupLeaderboard> {
        let waited = started.elapsed();
        self.metrics.record_join_wait(waited, self.poll_interval * self.max_polls);
        self.metrics.inc_join_succeeded();
        info!(%player, %group, waited_ms = waited.as_millis() as u64, "player joined group");
        self.coordinator
            .group_leaderboard(group, true)
            .await?
            .ok_or(TournamentError::NoSuchGroup(group))
    }

    async fn abandon(
        &self,
        profile: &Player,
        started: Instant,
        reason: TournamentError,
    ) -> Result<GroupLeaderboard> {
        let removed = self.fast.dequeue(profile.country, profile.id).await?;
        if !removed {
            // Popped by the matchmaker while we gave up. Formation publishes the
            // pointer within about one matchmaking interval.
            for attempt in 0..=POPPED_GRACE_POLLS {
                if let Some(group) = self.coordinator.player_group(profile.id, false).await? {
                    return self.joined(profile.id, group, started).await;
                }
                if attempt < POPPED_GRACE_POLLS {
                    self.clock.sleep(self.poll_interval).await;
                }
            }
            // A failed formation may have put the player back in their queue.
            if self.fast.dequeue(profile.country, profile.id).await? {
                debug!(player = %profile.id, "player requeued after formation failure");
            } else {
                warn!(player = %profile.id, "player left the queue during formation");
            }
        }
        match reason {
            TournamentError::Cancelled => self.metrics.inc_join_cancelled(),
            _ => self.metrics.inc_join_timed_out(),
        }
        info!(player = %profile.id, %reason, "join abandoned");
        Err(reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::durable::SqliteStore;
    use crate::fast::MemoryFastStore;
    use chrono::{TimeZone, Utc};
    use tourney_types::{Country, GroupEntry};

    struct Fixture {
        fast: Arc<MemoryFastStore>,
        durable: Arc<SqliteStore>,
        clock: Clock,
        join: Arc<JoinProtocol<MemoryFastStore, SqliteStore>>,
    }

    fn fixture() -> Fixture {
        let fast = Arc::new(MemoryFastStore::new());
        let durable = Arc::new(SqliteStore::open_in_memory().unwrap());
        let clock = Clock::manual(Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap());
        let metrics = Arc::new(TournamentMetrics::default());
        let coordinator = Coordinator::new(
            fast.clone(),
            durable.clone(),
            clock.clone(),
            Duration::from_secs(600),
            Duration::from_secs(600),
            metrics.clone(),
        );
        let join = Arc::new(JoinProtocol::new(
            fast.clone(),
            durable.clone(),
            coordinator,
            clock.clone(),
            Duration::from_millis(500),
            10,
            metrics,
        ));
        Fixture {
            fast,
            durable,
            clock,
            join,
        }
    }

    /// Creates a player with enough level and coins to enter.
    async fn veteran(durable: &SqliteStore, name: &str, country: Country) -> PlayerId {
        let created = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let player = Player::new(name.to_string(), country, created).unwrap();
        let id = player.id;
        durable.create_player(player).await.unwrap();
        for _ in 1..MIN_LEVEL {
            durable.level_up(id).await.unwrap();
        }
        id
    }

    #[tokio::test]
    async fn test_rejects_low_level() {
        let f = fixture();
        let created = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let player = Player::new("rookie".to_string(), Country::France, created).unwrap();
        let id = player.id;
        f.durable.create_player(player).await.unwrap();
        let err = f.join.enter(id, CancellationToken::new()).await.unwrap_err();
        assert!(matches!(
            err,
            TournamentError::Rejected(Rejection::LevelTooLow { min: 20 })
        ));
        assert!(f.fast.snapshot().queues.iter().all(|queue| queue.is_empty()));
    }

    #[tokio::test]
    async fn test_rejects_outside_window() {
        let f = fixture();
        let id = veteran(&f.durable, "late", Country::Germany).await;
        f.clock.set(Utc.with_ymd_and_hms(2024, 5, 1, 20, 0, 0).unwrap());
        let err = f.join.enter(id, CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, TournamentError::Rejected(Rejection::OutsideWindow)));
        assert_eq!(
            err.to_string(),
            "Daily tournaments are held between 00.00 and 20.00 UTC"
        );
    }

    #[tokio::test]
    async fn test_rejects_player_already_in_group() {
        let f = fixture();
        let id = veteran(&f.durable, "grouped", Country::Turkey).await;
        f.fast
            .set_player_group(id, GroupId(1), Duration::from_secs(60))
            .await
            .unwrap();
        let err = f.join.eligibility(id).await.unwrap_err();
        assert!(matches!(
            err,
            TournamentError::Rejected(Rejection::AlreadyInTournament)
        ));
    }

    #[tokio::test]
    async fn test_rejects_unknown_player() {
        let f = fixture();
        let id = PlayerId::random();
        assert!(matches!(
            f.join.eligibility(id).await,
            Err(TournamentError::UnknownPlayer(missing)) if missing == id
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_dequeues_and_allows_reentry() {
        let f = fixture();
        let id = veteran(&f.durable, "alone", Country::UnitedKingdom).await;

        let err = f.join.enter(id, CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, TournamentError::Timeout));
        assert_eq!(f.fast.queue_len(Country::UnitedKingdom).await.unwrap(), 0);

        let join = f.join.clone();
        let second = tokio::spawn(async move { join.enter(id, CancellationToken::new()).await });
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(f.fast.queue_len(Country::UnitedKingdom).await.unwrap(), 1);
        assert!(matches!(
            second.await.unwrap(),
            Err(TournamentError::Timeout)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_enter_is_already_queued() {
        let f = fixture();
        let id = veteran(&f.durable, "twice", Country::France).await;
        let join = f.join.clone();
        let first = tokio::spawn(async move { join.enter(id, CancellationToken::new()).await });
        tokio::time::sleep(Duration::from_millis(100)).await;
        let err = f.join.enter(id, CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, TournamentError::Rejected(Rejection::AlreadyQueued)));
        assert!(matches!(first.await.unwrap(), Err(TournamentError::Timeout)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_dequeues() {
        let f = fixture();
        let id = veteran(&f.durable, "leaver", Country::UnitedStates).await;
        let cancel = CancellationToken::new();
        let join = f.join.clone();
        let token = cancel.clone();
        let task = tokio::spawn(async move { join.enter(id, token).await });
        tokio::time::sleep(Duration::from_millis(700)).await;
        cancel.cancel();
        assert!(matches!(task.await.unwrap(), Err(TournamentError::Cancelled)));
        assert_eq!(f.fast.queue_len(Country::UnitedStates).await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pointer_observed_returns_leaderboard() {
        let f = fixture();
        let id = veteran(&f.durable, "lucky", Country::Germany).await;
        let join = f.join.clone();
        let task = tokio::spawn(async move { join.enter(id, CancellationToken::new()).await });
        tokio::time::sleep(Duration::from_millis(1_200)).await;

        // Simulate formation: entry first, then pointer.
        f.fast.dequeue(Country::Germany, id).await.unwrap();
        let entry = GroupEntry {
            player_id: id,
            username: "lucky".to_string(),
            country: Country::Germany,
            score: 0,
            seat: 4,
        };
        f.fast
            .put_group_entry(GroupId(7), entry, Duration::from_secs(60))
            .await
            .unwrap();
        f.fast
            .set_player_group(id, GroupId(7), Duration::from_secs(60))
            .await
            .unwrap();

        let leaderboard = task.await.unwrap().unwrap();
        assert_eq!(leaderboard.group_id, GroupId(7));
        assert!(leaderboard.entries.iter().any(|entry| entry.player_id == id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_popped_at_deadline_waits_for_pointer() {
        let f = fixture();
        let id = veteran(&f.durable, "lastcall", Country::France).await;
        let join = f.join.clone();
        let task = tokio::spawn(async move { join.enter(id, CancellationToken::new()).await });

        // The matchmaker pops the player just before the deadline.
        tokio::time::sleep(Duration::from_millis(4_900)).await;
        assert!(f.fast.dequeue(Country::France, id).await.unwrap());
        // Formation publishes after the join would have timed out.
        tokio::time::sleep(Duration::from_millis(400)).await;
        let entry = GroupEntry {
            player_id: id,
            username: "lastcall".to_string(),
            country: Country::France,
            score: 0,
            seat: 3,
        };
        f.fast
            .put_group_entry(GroupId(9), entry, Duration::from_secs(60))
            .await
            .unwrap();
        f.fast
            .set_player_group(id, GroupId(9), Duration::from_secs(60))
            .await
            .unwrap();

        let leaderboard = task.await.unwrap().unwrap();
        assert_eq!(leaderboard.group_id, GroupId(9));
        let waits = f.join.metrics.snapshot().join_wait;
        assert_eq!(waits.joined, 1);
        assert_eq!(waits.past_deadline, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_popped_then_requeued_times_out_and_leaves_queue() {
        let f = fixture();
        let id = veteran(&f.durable, "bounced", Country::Turkey).await;
        let join = f.join.clone();
        let task = tokio::spawn(async move { join.enter(id, CancellationToken::new()).await });

        tokio::time::sleep(Duration::from_millis(4_900)).await;
        assert!(f.fast.dequeue(Country::Turkey, id).await.unwrap());
        // Formation fails and puts the player back with the original timestamp.
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(f.fast.enqueue(Country::Turkey, id, 0).await.unwrap());

        assert!(matches!(task.await.unwrap(), Err(TournamentError::Timeout)));
        assert_eq!(f.fast.queue_len(Country::Turkey).await.unwrap(), 0);
    }
}
