use std::sync::Arc;
use tokio::sync::mpsc;
use tourney_types::{GroupEntry, GroupId, Player, PlayerId, TournamentWindow, ENTRANCE_FEE};
use tracing::{error, info, warn};

use crate::clock::Clock;
use crate::coordinator::Coordinator;
use crate::durable::DurableStore;
use crate::error::{Result, StoreError, TournamentError};
use crate::fast::{FastStore, PoppedGroup};
use crate::metrics::TournamentMetrics;

/// What happens to popped players whose group could not be created.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequeuePolicy {
    /// Put them back with their original enqueue time, ahead of later joiners.
    Requeue,
    /// Leave them out of every queue; their joins time out.
    Drop,
}

/// Sending side of the formation worker.
#[derive(Clone)]
pub struct FormationHandle {
    sender: mpsc::Sender<PoppedGroup>,
}

impl FormationHandle {
    /// Hands a popped group to the worker. Returns false if the worker is gone.
    pub async fn dispatch(&self, group: PoppedGroup) -> bool {
        match self.sender.try_send(group) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(group)) => {
                warn!("Formation channel full; waiting for capacity");
                self.sender.send(group).await.is_ok()
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                error!("Formation worker stopped; group not dispatched");
                false
            }
        }
    }
}

pub struct FormationWorker<F, D> {
    fast: Arc<F>,
    durable: Arc<D>,
    coordinator: Coordinator<F, D>,
    clock: Clock,
    policy: RequeuePolicy,
    metrics: Arc<TournamentMetrics>,
}

impl<F: FastStore, D: DurableStore> FormationWorker<F, D> {
    pub fn new(
        fast: Arc<F>,
        durable: Arc<D>,
        coordinator: Coordinator<F, D>,
        clock: Clock,
        policy: RequeuePolicy,
        metrics: Arc<TournamentMetrics>,
    ) -> Self {
        Self {
            fast,
            durable,
            coordinator,
            clock,
            policy,
            metrics,
        }
    }

    pub fn spawn(self, buffer: usize) -> FormationHandle {
        let (sender, mut receiver) = mpsc::channel::<PoppedGroup>(buffer.max(1));
        tokio::spawn(async move {
            while let Some(popped) = receiver.recv().await {
                if let Err(err) = self.form(popped).await {
                    warn!(?err, "group formation failed");
                }
            }
        });
        FormationHandle { sender }
    }

    /// Forms one group. Safe to call again with the same five players.
    ///
    /// Order: group row, leaderboard entries, pointers, memberships, entrance fees.
    pub async fn form(&self, popped: PoppedGroup) -> Result<Option<GroupId>> {
        let now = self.clock.now();
        let today = TournamentWindow::day(now);

        // Redelivery of an already formed group is a no-op.
        let mut existing = Vec::with_capacity(popped.len());
        for queued in &popped {
            if let Some(row) = self.durable.membership_on(queued.player_id, today).await? {
                existing.push((queued.player_id, row.group_id));
            }
        }
        if existing.len() == popped.len() && existing.iter().all(|(_, g)| *g == existing[0].1) {
            info!(group = %existing[0].1, "group already formed; skipping duplicate dispatch");
            return Ok(Some(existing[0].1));
        }
        if !existing.is_empty() {
            let grouped = existing.iter().map(|(player, _)| *player).collect::<Vec<_>>();
            warn!(?grouped, "popped players already belong to a group today");
            self.metrics.inc_formation_failure();
            self.requeue_except(&popped, &grouped).await;
            return Ok(None);
        }

        let mut players = Vec::with_capacity(popped.len());
        for queued in &popped {
            match self.durable.player(queued.player_id).await {
                Ok(Some(player)) => players.push(player),
                Ok(None) => {
                    self.metrics.inc_formation_failure();
                    self.requeue_except(&popped, &[queued.player_id]).await;
                    return Err(TournamentError::UnknownPlayer(queued.player_id));
                }
                Err(err) => {
                    self.metrics.inc_formation_failure();
                    self.requeue_except(&popped, &[]).await;
                    return Err(err.into());
                }
            }
        }

        let group = match self.durable.insert_group(now).await {
            Ok(group) => group,
            Err(StoreError::WindowClosed) => {
                self.metrics.inc_consistency_fault();
                error!(%now, "durable store rejected group creation outside the tournament window");
                return Err(TournamentError::Consistency(
                    "group created outside tournament window".to_string(),
                ));
            }
            Err(err) => {
                self.metrics.inc_formation_failure();
                warn!(?err, "failed to create group");
                self.requeue_except(&popped, &[]).await;
                return Err(err.into());
            }
        };

        if let Err(err) = self.publish(group, &players).await {
            self.metrics.inc_formation_failure();
            error!(%group, ?err, "failed to publish group to fast store");
            self.requeue_except(&popped, &[]).await;
            return Err(err);
        }

        let ids = players.iter().map(|player| player.id).collect::<Vec<_>>();
        if let Err(err) = self.durable.insert_memberships(group, ids.clone()).await {
            return Err(self.cache_ahead(group, "memberships", err));
        }
        if let Err(err) = self.durable.debit_coins(ids, ENTRANCE_FEE).await {
            return Err(self.cache_ahead(group, "entrance fees", err));
        }

        self.metrics.inc_group_formed();
        info!(%group, "group formed");
        Ok(Some(group))
    }

    /// Writes all five entries, then all five pointers.
    async fn publish(&self, group: GroupId, players: &[Player]) -> Result<()> {
        for (seat, player) in players.iter().enumerate() {
            let entry = GroupEntry {
                player_id: player.id,
                username: player.username.clone(),
                country: player.country,
                score: 0,
                seat: seat as u8,
            };
            self.coordinator.upsert_entry(group, entry).await?;
        }
        for player in players {
            self.coordinator.set_pointer(player.id, group).await?;
        }
        Ok(())
    }

    fn cache_ahead(&self, group: GroupId, step: &'static str, err: StoreError) -> TournamentError {
        self.metrics.inc_consistency_fault();
        error!(%group, step, ?err, "durable write failed after group was published; cache ahead of durable store until rebuild");
        TournamentError::Consistency(format!("group {group}: {step} not persisted"))
    }

    async fn requeue_except(&self, popped: &PoppedGroup, skip: &[PlayerId]) {
        if self.policy == RequeuePolicy::Drop {
            return;
        }
        for queued in popped.iter().filter(|q| !skip.contains(&q.player_id)) {
            match self
                .fast
                .enqueue(queued.country, queued.player_id, queued.enqueued_at_ms)
                .await
            {
                Ok(_) => self.metrics.inc_player_requeued(),
                Err(err) => warn!(player = %queued.player_id, ?err, "failed to requeue player"),
            }
        }
    }
}
