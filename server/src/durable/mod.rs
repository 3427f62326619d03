//! Source of truth for players, groups and memberships.

use chrono::{DateTime, NaiveDate, Utc};
use std::future::Future;
use tourney_types::{Country, GroupId, MemberRow, Player, PlayerId};

use crate::error::StoreError;

mod sqlite;
pub use sqlite::SqliteStore;

pub trait DurableStore: Send + Sync + 'static {
    fn create_player(&self, player: Player) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn player(
        &self,
        player: PlayerId,
    ) -> impl Future<Output = Result<Option<Player>, StoreError>> + Send;

    /// Adds one level and the per-level coin grant. `None` if the player is unknown.
    fn level_up(
        &self,
        player: PlayerId,
    ) -> impl Future<Output = Result<Option<Player>, StoreError>> + Send;

    /// Fails with [`StoreError::WindowClosed`] outside the daily window.
    fn insert_group(
        &self,
        formed_at: DateTime<Utc>,
    ) -> impl Future<Output = Result<GroupId, StoreError>> + Send;

    /// Inserts one zero-score membership per player; seats follow slice order.
    fn insert_memberships(
        &self,
        group: GroupId,
        players: Vec<PlayerId>,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn debit_coins(
        &self,
        players: Vec<PlayerId>,
        amount: u64,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// The membership `player` holds in a group formed on `day`.
    fn membership_on(
        &self,
        player: PlayerId,
        day: NaiveDate,
    ) -> impl Future<Output = Result<Option<MemberRow>, StoreError>> + Send;

    fn group_members(
        &self,
        group: GroupId,
    ) -> impl Future<Output = Result<Vec<MemberRow>, StoreError>> + Send;

    fn members_on(
        &self,
        day: NaiveDate,
    ) -> impl Future<Output = Result<Vec<MemberRow>, StoreError>> + Send;

    /// Sum of member scores per country for groups formed on `day`.
    fn country_scores_on(
        &self,
        day: NaiveDate,
    ) -> impl Future<Output = Result<Vec<(Country, u64)>, StoreError>> + Send;

    /// Adds one point. Returns the number of rows updated.
    fn increment_score(
        &self,
        player: PlayerId,
        group: GroupId,
    ) -> impl Future<Output = Result<u64, StoreError>> + Send;

    /// Members holding their group's highest score, ties included.
    fn top_scorers_on(
        &self,
        day: NaiveDate,
    ) -> impl Future<Output = Result<Vec<(GroupId, PlayerId)>, StoreError>> + Send;

    /// Members holding their group's second highest distinct score, ties included.
    fn runner_ups_on(
        &self,
        day: NaiveDate,
    ) -> impl Future<Output = Result<Vec<(GroupId, PlayerId)>, StoreError>> + Send;

    /// Sets `reward = amount` and `claimed = false` on every listed membership.
    fn set_rewards(
        &self,
        members: Vec<(GroupId, PlayerId)>,
        amount: u64,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn has_unclaimed_reward(
        &self,
        player: PlayerId,
    ) -> impl Future<Output = Result<bool, StoreError>> + Send;

    /// Marks every unclaimed reward claimed and credits the total. Returns the total.
    fn claim_rewards(
        &self,
        player: PlayerId,
    ) -> impl Future<Output = Result<u64, StoreError>> + Send;

    /// `1 + count of group members with a strictly greater score`.
    fn rank_on(
        &self,
        player: PlayerId,
        day: NaiveDate,
    ) -> impl Future<Output = Result<Option<u32>, StoreError>> + Send;
}
