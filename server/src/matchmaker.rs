use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tourney_types::TournamentWindow;
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::error::Result;
use crate::fast::{FastStore, PoppedGroup};
use crate::formation::FormationHandle;
use crate::metrics::TournamentMetrics;

/// Drains one player per country queue each tick and hands them to formation.
pub struct Matchmaker<F> {
    fast: Arc<F>,
    formation: FormationHandle,
    clock: Clock,
    interval: Duration,
    metrics: Arc<TournamentMetrics>,
}

impl<F: FastStore> Matchmaker<F> {
    pub fn new(
        fast: Arc<F>,
        formation: FormationHandle,
        clock: Clock,
        interval: Duration,
        metrics: Arc<TournamentMetrics>,
    ) -> Self {
        Self {
            fast,
            formation,
            clock,
            interval,
            metrics,
        }
    }

    /// Runs one matchmaking attempt. Returns the dispatched group, if any.
    pub async fn tick(&self) -> Result<Option<PoppedGroup>> {
        self.metrics.inc_matchmaking_tick();
        if !TournamentWindow::is_active(self.clock.now()) {
            self.metrics.inc_matchmaking_idle_tick();
            return Ok(None);
        }

        let Some(popped) = self.fast.pop_group().await? else {
            self.metrics.inc_matchmaking_idle_tick();
            return Ok(None);
        };
        debug!(players = ?popped.map(|queued| queued.player_id), "matched one player per country");

        if self.formation.dispatch(popped).await {
            self.metrics.inc_group_dispatched();
            return Ok(Some(popped));
        }

        // The worker is gone; put everyone back where they were.
        for queued in &popped {
            if let Err(err) = self
                .fast
                .enqueue(queued.country, queued.player_id, queued.enqueued_at_ms)
                .await
            {
                error!(player = %queued.player_id, ?err, "failed to requeue undispatched player");
            }
        }
        Ok(None)
    }

    pub async fn run(self, cancel: CancellationToken) {
        info!(interval_ms = self.interval.as_millis() as u64, "matchmaker started");
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(err) = self.tick().await {
                        warn!(?err, "matchmaking tick failed");
                    }
                }
            }
        }
        info!("matchmaker stopped");
    }
}
