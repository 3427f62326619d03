use std::sync::Arc;
use std::time::Duration;
use tourney_types::{
    Country, CountryLeaderboard, GroupEntry, GroupId, GroupLeaderboard, MemberRow, PlayerId,
    TournamentWindow,
};
use tracing::{debug, error};

use crate::clock::Clock;
use crate::durable::DurableStore;
use crate::error::{Result, TournamentError};
use crate::fast::FastStore;
use crate::metrics::TournamentMetrics;

/// Cache-aside access to live leaderboards and player pointers.
///
/// A pointer is only ever written after every entry of its group, so a caller that
/// observes a pointer can always read a complete leaderboard.
pub struct Coordinator<F, D> {
    fast: Arc<F>,
    durable: Arc<D>,
    clock: Clock,
    group_ttl: Duration,
    pointer_ttl: Duration,
    metrics: Arc<TournamentMetrics>,
}

impl<F, D> Clone for Coordinator<F, D> {
    fn clone(&self) -> Self {
        Self {
            fast: self.fast.clone(),
            durable: self.durable.clone(),
            clock: self.clock.clone(),
            group_ttl: self.group_ttl,
            pointer_ttl: self.pointer_ttl,
            metrics: self.metrics.clone(),
        }
    }
}

impl<F: FastStore, D: DurableStore> Coordinator<F, D> {
    pub fn new(
        fast: Arc<F>,
        durable: Arc<D>,
        clock: Clock,
        group_ttl: Duration,
        pointer_ttl: Duration,
        metrics: Arc<TournamentMetrics>,
    ) -> Self {
        Self {
            fast,
            durable,
            clock,
            group_ttl,
            pointer_ttl,
            metrics,
        }
    }

    /// Reads a group leaderboard, reloading it from the durable store on a miss
    /// when `fallback` is set.
    ///
    /// Returns `Ok(None)` on a miss without fallback and [`TournamentError::NoSuchGroup`]
    /// if the durable store has no members either.
    pub async fn group_leaderboard(
        &self,
        group: GroupId,
        fallback: bool,
    ) -> Result<Option<GroupLeaderboard>> {
        let entries = self.fast.group_entries(group).await?;
        if !entries.is_empty() {
            self.fast.touch_group(group, self.group_ttl).await?;
            return Ok(Some(GroupLeaderboard::new(group, entries)));
        }
        if !fallback {
            return Ok(None);
        }

        debug!(%group, "group leaderboard miss; reloading from durable store");
        let members = self.durable.group_members(group).await?;
        if members.is_empty() {
            return Err(TournamentError::NoSuchGroup(group));
        }
        let entries = self.write_entries(group, &members).await?;
        Ok(Some(GroupLeaderboard::new(group, entries)))
    }

    /// Resolves the group `player` belongs to today.
    ///
    /// On a miss with `fallback`, the player's whole group is restored from the
    /// durable store, entries first and pointers second.
    pub async fn player_group(&self, player: PlayerId, fallback: bool) -> Result<Option<GroupId>> {
        if let Some(group) = self.fast.player_group(player, self.pointer_ttl).await? {
            return Ok(Some(group));
        }
        if !fallback {
            return Ok(None);
        }

        let today = TournamentWindow::day(self.clock.now());
        let Some(membership) = self.durable.membership_on(player, today).await? else {
            return Ok(None);
        };
        debug!(%player, group = %membership.group_id, "player pointer miss; restoring group");
        let members = self.durable.group_members(membership.group_id).await?;
        self.restore_group(membership.group_id, &members).await?;
        Ok(Some(membership.group_id))
    }

    /// Writes every entry of `group`, then every member's pointer.
    pub async fn restore_group(&self, group: GroupId, members: &[MemberRow]) -> Result<()> {
        self.write_entries(group, members).await?;
        for member in members {
            self.fast
                .set_player_group(member.player_id, group, self.pointer_ttl)
                .await?;
        }
        Ok(())
    }

    async fn write_entries(&self, group: GroupId, members: &[MemberRow]) -> Result<Vec<GroupEntry>> {
        let mut entries = Vec::with_capacity(members.len());
        for member in members {
            let entry = member.entry();
            self.fast
                .put_group_entry(group, entry.clone(), self.group_ttl)
                .await?;
            entries.push(entry);
        }
        Ok(entries)
    }

    pub async fn set_pointer(&self, player: PlayerId, group: GroupId) -> Result<()> {
        self.fast
            .set_player_group(player, group, self.pointer_ttl)
            .await?;
        Ok(())
    }

    /// The country leaderboard is seeded at startup and never recomputed on read.
    pub async fn country_leaderboard(&self) -> Result<CountryLeaderboard> {
        match self.fast.country_scores().await? {
            Some(scores) => Ok(CountryLeaderboard::new(scores)),
            None => {
                self.metrics.inc_consistency_fault();
                error!("country leaderboard missing from fast store; rebuild required");
                Err(TournamentError::Consistency(
                    "country leaderboard missing".to_string(),
                ))
            }
        }
    }

    pub async fn increment_country(&self, country: Country, delta: u64) -> Result<()> {
        self.fast.increment_country(country, delta).await?;
        Ok(())
    }

    /// Write-through upsert of one entry; refreshes the group's idle TTL.
    pub async fn upsert_entry(&self, group: GroupId, entry: GroupEntry) -> Result<()> {
        self.fast
            .put_group_entry(group, entry, self.group_ttl)
            .await?;
        Ok(())
    }

    /// Cache-only read of one entry.
    pub async fn entry(&self, group: GroupId, player: PlayerId) -> Result<Option<GroupEntry>> {
        Ok(self.fast.group_entry(group, player).await?)
    }
}
