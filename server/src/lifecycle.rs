use chrono::NaiveDate;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tourney_types::{
    Country, MemberRow, TournamentWindow, FIRST_PLACE_REWARD, SECOND_PLACE_REWARD,
};
use tracing::{error, info};

use crate::clock::Clock;
use crate::coordinator::Coordinator;
use crate::durable::DurableStore;
use crate::error::Result;
use crate::fast::FastStore;
use crate::metrics::TournamentMetrics;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct Settlement {
    pub first_place: usize,
    pub second_place: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct Rebuild {
    pub groups: usize,
    pub players: usize,
}

/// Daily rollover and cold-start reconstruction of the fast store.
pub struct Lifecycle<F, D> {
    fast: Arc<F>,
    durable: Arc<D>,
    coordinator: Coordinator<F, D>,
    clock: Clock,
    metrics: Arc<TournamentMetrics>,
}

impl<F: FastStore, D: DurableStore> Lifecycle<F, D> {
    pub fn new(
        fast: Arc<F>,
        durable: Arc<D>,
        coordinator: Coordinator<F, D>,
        clock: Clock,
        metrics: Arc<TournamentMetrics>,
    ) -> Self {
        Self {
            fast,
            durable,
            coordinator,
            clock,
            metrics,
        }
    }

    /// Awards the top two distinct scores of every group formed on `day`, then
    /// clears the fast store for the new day. The country leaderboard starts the
    /// new day at zero for every country.
    pub async fn settle(&self, day: NaiveDate) -> Result<Settlement> {
        let first = self.durable.top_scorers_on(day).await?;
        let second = self.durable.runner_ups_on(day).await?;
        let settlement = Settlement {
            first_place: first.len(),
            second_place: second.len(),
        };
        self.durable.set_rewards(first, FIRST_PLACE_REWARD).await?;
        self.durable.set_rewards(second, SECOND_PLACE_REWARD).await?;
        self.fast.flush().await?;
        self.fast
            .seed_countries(Country::ALL.map(|country| (country, 0)).to_vec())
            .await?;

        self.metrics.inc_settlement();
        info!(
            %day,
            first_place = settlement.first_place,
            second_place = settlement.second_place,
            "tournament settled"
        );
        Ok(settlement)
    }

    /// Flushes the fast store and rebuilds it from today's durable state.
    ///
    /// Running it twice yields the same cache contents as running it once.
    pub async fn rebuild(&self) -> Result<Rebuild> {
        self.fast.flush().await?;
        let today = TournamentWindow::day(self.clock.now());

        let sums = self
            .durable
            .country_scores_on(today)
            .await?
            .into_iter()
            .collect::<HashMap<_, _>>();
        let seed = Country::ALL
            .into_iter()
            .map(|country| (country, sums.get(&country).copied().unwrap_or(0)))
            .collect();
        self.fast.seed_countries(seed).await?;

        let mut groups: BTreeMap<_, Vec<MemberRow>> = BTreeMap::new();
        for member in self.durable.members_on(today).await? {
            groups.entry(member.group_id).or_default().push(member);
        }
        let mut players = 0;
        for (group, members) in &groups {
            self.coordinator.restore_group(*group, members).await?;
            players += members.len();
        }

        self.metrics.inc_rebuild();
        let rebuild = Rebuild {
            groups: groups.len(),
            players,
        };
        info!(%today, groups = rebuild.groups, players = rebuild.players, "fast store rebuilt");
        Ok(rebuild)
    }

    /// Settles each day at the following UTC midnight until cancelled.
    pub async fn run_rollover(self, cancel: CancellationToken) {
        loop {
            let now = self.clock.now();
            let day = TournamentWindow::day(now);
            let midnight = TournamentWindow::next_midnight(now);
            info!(%day, %midnight, "next settlement scheduled");
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.wait_until(midnight) => {}
            }
            if let Err(err) = self.settle(day).await {
                error!(%day, ?err, "settlement failed");
            }
        }
        info!("rollover stopped");
    }

    async fn wait_until(&self, at: chrono::DateTime<chrono::Utc>) {
        while self.clock.now() < at {
            self.clock.sleep_until(at).await;
        }
    }
}
