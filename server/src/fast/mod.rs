//! Low-latency store for queues, live leaderboards and player pointers.
//!
//! Everything held here can be rebuilt from the durable store.

use std::future::Future;
use std::time::Duration;
use tourney_types::{Country, GroupEntry, GroupId, PlayerId, QueuedPlayer, GROUP_SIZE};

use crate::error::StoreError;

mod memory;
pub use memory::{MemoryFastStore, MemorySnapshot};
mod redis_store;
pub use redis_store::{RedisFastStore, DEFAULT_KEY_PREFIX};

/// One popped player per country, in [`Country::ALL`] order.
pub type PoppedGroup = [QueuedPlayer; GROUP_SIZE];

pub trait FastStore: Send + Sync + 'static {
    /// Adds `player` to the queue of `country`. Returns false if already queued.
    fn enqueue(
        &self,
        country: Country,
        player: PlayerId,
        enqueued_at_ms: i64,
    ) -> impl Future<Output = Result<bool, StoreError>> + Send;

    /// Removes `player` from the queue of `country`. Returns false if not queued.
    fn dequeue(
        &self,
        country: Country,
        player: PlayerId,
    ) -> impl Future<Output = Result<bool, StoreError>> + Send;

    fn queue_len(&self, country: Country) -> impl Future<Output = Result<u64, StoreError>> + Send;

    /// Atomically removes the earliest player from every country queue.
    ///
    /// Returns `None` without touching any queue if one of them is empty or if a
    /// concurrent writer invalidated the attempt.
    fn pop_group(&self) -> impl Future<Output = Result<Option<PoppedGroup>, StoreError>> + Send;

    fn group_entries(
        &self,
        group: GroupId,
    ) -> impl Future<Output = Result<Vec<GroupEntry>, StoreError>> + Send;

    fn group_entry(
        &self,
        group: GroupId,
        player: PlayerId,
    ) -> impl Future<Output = Result<Option<GroupEntry>, StoreError>> + Send;

    /// Upserts one entry and resets the group's idle TTL.
    fn put_group_entry(
        &self,
        group: GroupId,
        entry: GroupEntry,
        ttl: Duration,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn touch_group(
        &self,
        group: GroupId,
        ttl: Duration,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Reads the pointer and, on hit, resets its idle TTL.
    fn player_group(
        &self,
        player: PlayerId,
        ttl: Duration,
    ) -> impl Future<Output = Result<Option<GroupId>, StoreError>> + Send;

    fn set_player_group(
        &self,
        player: PlayerId,
        group: GroupId,
        ttl: Duration,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// `None` when the country leaderboard has not been seeded.
    fn country_scores(
        &self,
    ) -> impl Future<Output = Result<Option<Vec<(Country, u64)>>, StoreError>> + Send;

    fn increment_country(
        &self,
        country: Country,
        delta: u64,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Replaces the whole country leaderboard.
    fn seed_countries(
        &self,
        scores: Vec<(Country, u64)>,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Drops every queue, leaderboard and pointer.
    fn flush(&self) -> impl Future<Output = Result<(), StoreError>> + Send;
}
