use chrono::NaiveDate;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tourney_types::{
    Country, CountryLeaderboard, GroupLeaderboard, Player, PlayerId, TournamentWindow,
};
use tracing::{info, warn};

mod api;
pub use api::Api;

pub mod clock;
pub use clock::Clock;
pub mod config;
pub use config::{ConfigError, TournamentConfig};
pub mod coordinator;
pub use coordinator::Coordinator;
pub mod durable;
pub use durable::{DurableStore, SqliteStore};
pub mod error;
pub use error::{Rejection, StoreError, TournamentError};
pub mod fast;
pub use fast::{FastStore, MemoryFastStore, RedisFastStore};
pub mod formation;
pub use formation::{FormationHandle, FormationWorker, RequeuePolicy};
pub mod join;
pub use join::JoinProtocol;
pub mod lifecycle;
pub use lifecycle::{Lifecycle, Rebuild, Settlement};
pub mod matchmaker;
pub use matchmaker::Matchmaker;
pub mod metrics;
pub use metrics::{TournamentMetrics, TournamentMetricsSnapshot};
pub mod score;
pub use score::{ScoreEvent, ScoreSync, ScoreSyncHandle, ScoreSyncWorker};

use error::Result;

/// The tournament service: stores, workers and every player-facing operation.
pub struct Tournament<F, D> {
    config: TournamentConfig,
    fast: Arc<F>,
    durable: Arc<D>,
    clock: Clock,
    coordinator: Coordinator<F, D>,
    join: JoinProtocol<F, D>,
    score: ScoreSync<F, D>,
    formation: FormationHandle,
    metrics: Arc<TournamentMetrics>,
    ready: AtomicBool,
}

impl<F: FastStore, D: DurableStore> Tournament<F, D> {
    /// Validates `config` and spawns the formation and score sync workers.
    ///
    /// Must be called from within a tokio runtime. The service is not ready until
    /// [`Tournament::rebuild`] has completed.
    pub fn new(
        config: TournamentConfig,
        fast: Arc<F>,
        durable: Arc<D>,
        clock: Clock,
    ) -> std::result::Result<Self, ConfigError> {
        config.validate()?;
        let metrics = Arc::new(TournamentMetrics::default());
        let coordinator = Coordinator::new(
            fast.clone(),
            durable.clone(),
            clock.clone(),
            config.group_ttl,
            config.pointer_ttl,
            metrics.clone(),
        );
        let policy = if config.requeue_on_formation_failure {
            RequeuePolicy::Requeue
        } else {
            RequeuePolicy::Drop
        };
        let formation = FormationWorker::new(
            fast.clone(),
            durable.clone(),
            coordinator.clone(),
            clock.clone(),
            policy,
            metrics.clone(),
        )
        .spawn(config.formation_buffer);
        let score_handle = ScoreSyncWorker::new(coordinator.clone(), metrics.clone())
            .spawn(config.score_sync_buffer);
        let score = ScoreSync::new(
            durable.clone(),
            coordinator.clone(),
            clock.clone(),
            score_handle,
        );
        let join = JoinProtocol::new(
            fast.clone(),
            durable.clone(),
            coordinator.clone(),
            clock.clone(),
            config.poll_interval(),
            config.max_polls(),
            metrics.clone(),
        );

        Ok(Self {
            config,
            fast,
            durable,
            clock,
            coordinator,
            join,
            score,
            formation,
            metrics,
            ready: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &TournamentConfig {
        &self.config
    }

    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub fn metrics(&self) -> TournamentMetricsSnapshot {
        self.metrics.snapshot()
    }

    fn lifecycle(&self) -> Lifecycle<F, D> {
        Lifecycle::new(
            self.fast.clone(),
            self.durable.clone(),
            self.coordinator.clone(),
            self.clock.clone(),
            self.metrics.clone(),
        )
    }

    /// Registers a new player in a randomly assigned country.
    pub async fn create_player(&self, username: String) -> Result<Player> {
        let country = Country::random(&mut rand::thread_rng());
        let player = Player::new(username, country, self.clock.now())?;
        self.durable.create_player(player.clone()).await?;
        info!(player = %player.id, %country, "player created");
        Ok(player)
    }

    pub async fn player(&self, player: PlayerId) -> Result<Player> {
        self.durable
            .player(player)
            .await?
            .ok_or(TournamentError::UnknownPlayer(player))
    }

    /// Completes a level. While the player is grouped this also scores a point.
    pub async fn level_up(&self, player: PlayerId) -> Result<Player> {
        let profile = self
            .durable
            .level_up(player)
            .await?
            .ok_or(TournamentError::UnknownPlayer(player))?;
        if let Err(err) = self.score.score_point(&profile).await {
            warn!(%player, ?err, "level recorded but tournament score was not");
        }
        Ok(profile)
    }

    /// Queues `player` and waits for their group to form.
    pub async fn enter(
        &self,
        player: PlayerId,
        cancel: CancellationToken,
    ) -> Result<GroupLeaderboard> {
        self.join.enter(player, cancel).await
    }

    pub async fn group_leaderboard_for(&self, player: PlayerId) -> Result<GroupLeaderboard> {
        let group = self
            .coordinator
            .player_group(player, true)
            .await?
            .ok_or(TournamentError::NotInTournament)?;
        self.coordinator
            .group_leaderboard(group, true)
            .await?
            .ok_or(TournamentError::NoSuchGroup(group))
    }

    pub async fn country_leaderboard(&self) -> Result<CountryLeaderboard> {
        if !TournamentWindow::is_active(self.clock.now()) {
            return Err(Rejection::OutsideWindow.into());
        }
        self.coordinator.country_leaderboard().await
    }

    /// Rank of `player` inside the group they played in on `day`.
    pub async fn rank_on(&self, player: PlayerId, day: NaiveDate) -> Result<u32> {
        self.durable
            .rank_on(player, day)
            .await?
            .ok_or(TournamentError::NotInTournamentOn(day))
    }

    /// Credits every unclaimed reward and returns the updated profile.
    pub async fn claim_reward(&self, player: PlayerId) -> Result<Player> {
        self.player(player).await?;
        let credited = self.durable.claim_rewards(player).await?;
        if credited == 0 {
            return Err(Rejection::NoRewardsToClaim.into());
        }
        info!(%player, credited, "rewards claimed");
        self.player(player).await
    }

    /// Rebuilds the fast store from durable state and marks the service ready.
    pub async fn rebuild(&self) -> Result<Rebuild> {
        let rebuild = self.lifecycle().rebuild().await?;
        self.ready.store(true, Ordering::Release);
        Ok(rebuild)
    }

    pub async fn settle(&self, day: NaiveDate) -> Result<Settlement> {
        self.lifecycle().settle(day).await
    }

    /// Starts the matchmaker and the daily rollover. Both stop when `cancel` fires.
    pub fn spawn_background(&self, cancel: CancellationToken) -> Vec<JoinHandle<()>> {
        let matchmaker = Matchmaker::new(
            self.fast.clone(),
            self.formation.clone(),
            self.clock.clone(),
            self.config.matchmaking_interval,
            self.metrics.clone(),
        );
        vec![
            tokio::spawn(matchmaker.run(cancel.clone())),
            tokio::spawn(self.lifecycle().run_rollover(cancel)),
        ]
    }
}
