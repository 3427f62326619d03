use std::sync::Arc;
use tokio::sync::mpsc;
use tourney_types::{Country, GroupId, Player, PlayerId, TournamentWindow};
use tracing::{debug, error, warn};

use crate::clock::Clock;
use crate::coordinator::Coordinator;
use crate::durable::DurableStore;
use crate::error::Result;
use crate::fast::FastStore;
use crate::metrics::TournamentMetrics;

/// One point scored by a grouped player, already recorded durably.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ScoreEvent {
    pub player: PlayerId,
    pub group: GroupId,
    pub country: Country,
}

/// Sending side of the score sync worker.
#[derive(Clone)]
pub struct ScoreSyncHandle {
    sender: mpsc::Sender<ScoreEvent>,
    metrics: Arc<TournamentMetrics>,
}

impl ScoreSyncHandle {
    pub async fn dispatch(&self, event: ScoreEvent) -> bool {
        match self.sender.try_send(event) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(event)) => {
                warn!("Score sync channel full; waiting for capacity");
                if self.sender.send(event).await.is_ok() {
                    return true;
                }
                self.metrics.inc_score_event_dropped();
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.metrics.inc_score_event_dropped();
                error!("Score sync worker stopped; live leaderboards will lag until rebuild");
                false
            }
        }
    }
}

/// Applies score events to the live leaderboards.
pub struct ScoreSyncWorker<F, D> {
    coordinator: Coordinator<F, D>,
    metrics: Arc<TournamentMetrics>,
}

impl<F: FastStore, D: DurableStore> ScoreSyncWorker<F, D> {
    pub fn new(coordinator: Coordinator<F, D>, metrics: Arc<TournamentMetrics>) -> Self {
        Self {
            coordinator,
            metrics,
        }
    }

    pub fn spawn(self, buffer: usize) -> ScoreSyncHandle {
        let (sender, mut receiver) = mpsc::channel::<ScoreEvent>(buffer.max(1));
        let metrics = self.metrics.clone();
        tokio::spawn(async move {
            while let Some(event) = receiver.recv().await {
                if let Err(err) = self.apply(event).await {
                    warn!(player = %event.player, ?err, "score sync failed");
                }
            }
        });
        ScoreSyncHandle { sender, metrics }
    }

    /// Bumps the country aggregate, then the player's cached entry if present.
    ///
    /// Returns false when the entry was missing and the entry update was dropped.
    pub async fn apply(&self, event: ScoreEvent) -> Result<bool> {
        self.coordinator.increment_country(event.country, 1).await?;
        let Some(mut entry) = self.coordinator.entry(event.group, event.player).await? else {
            self.metrics.inc_score_event_dropped();
            debug!(player = %event.player, group = %event.group, "entry not cached; dropping update");
            return Ok(false);
        };
        entry.score += 1;
        self.coordinator.upsert_entry(event.group, entry).await?;
        self.metrics.inc_score_event_applied();
        Ok(true)
    }
}

/// Records scoring events durably and forwards them to the worker.
pub struct ScoreSync<F, D> {
    durable: Arc<D>,
    coordinator: Coordinator<F, D>,
    clock: Clock,
    handle: ScoreSyncHandle,
}

impl<F: FastStore, D: DurableStore> ScoreSync<F, D> {
    pub fn new(
        durable: Arc<D>,
        coordinator: Coordinator<F, D>,
        clock: Clock,
        handle: ScoreSyncHandle,
    ) -> Self {
        Self {
            durable,
            coordinator,
            clock,
            handle,
        }
    }

    /// Adds one point for `player` in today's group. Returns the event if one was
    /// recorded; scores are frozen outside the window.
    pub async fn score_point(&self, player: &Player) -> Result<Option<ScoreEvent>> {
        if !TournamentWindow::is_active(self.clock.now()) {
            return Ok(None);
        }
        let Some(group) = self.coordinator.player_group(player.id, true).await? else {
            return Ok(None);
        };
        if self.durable.increment_score(player.id, group).await? == 0 {
            debug!(player = %player.id, %group, "no membership row to score");
            return Ok(None);
        }
        let event = ScoreEvent {
            player: player.id,
            group,
            country: player.country,
        };
        self.handle.dispatch(event).await;
        Ok(Some(event))
    }
}
