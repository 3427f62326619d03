use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use tourney_types::{Country, GroupEntry, GroupId, PlayerId, QueuedPlayer};

use super::{FastStore, PoppedGroup};
use crate::error::StoreError;

struct Expiring<T> {
    value: T,
    expires_at: Instant,
}

impl<T> Expiring<T> {
    fn new(value: T, ttl: Duration) -> Self {
        Self {
            value,
            expires_at: Instant::now() + ttl,
        }
    }

    fn live(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

#[derive(Default)]
struct Queue {
    order: BTreeSet<(i64, PlayerId)>,
    scores: HashMap<PlayerId, i64>,
}

impl Queue {
    fn insert(&mut self, player: PlayerId, score: i64) -> bool {
        if self.scores.contains_key(&player) {
            return false;
        }
        self.scores.insert(player, score);
        self.order.insert((score, player));
        true
    }

    fn remove(&mut self, player: &PlayerId) -> bool {
        match self.scores.remove(player) {
            Some(score) => self.order.remove(&(score, *player)),
            None => false,
        }
    }

    fn pop_min(&mut self) -> Option<(i64, PlayerId)> {
        let first = self.order.pop_first()?;
        self.scores.remove(&first.1);
        Some(first)
    }
}

#[derive(Default)]
struct Inner {
    queues: [Queue; 5],
    groups: HashMap<GroupId, Expiring<HashMap<PlayerId, GroupEntry>>>,
    pointers: HashMap<PlayerId, Expiring<GroupId>>,
    countries: Option<HashMap<Country, u64>>,
}

impl Inner {
    fn live_group(&mut self, group: GroupId) -> Option<&mut Expiring<HashMap<PlayerId, GroupEntry>>> {
        let now = Instant::now();
        if self.groups.get(&group).is_some_and(|g| !g.live(now)) {
            self.groups.remove(&group);
        }
        self.groups.get_mut(&group)
    }

    fn live_pointer(&mut self, player: PlayerId) -> Option<&mut Expiring<GroupId>> {
        let now = Instant::now();
        if self.pointers.get(&player).is_some_and(|p| !p.live(now)) {
            self.pointers.remove(&player);
        }
        self.pointers.get_mut(&player)
    }
}

/// Comparable view of everything held by a [`MemoryFastStore`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MemorySnapshot {
    pub queues: Vec<Vec<PlayerId>>,
    pub groups: BTreeMap<GroupId, Vec<GroupEntry>>,
    pub pointers: BTreeMap<PlayerId, GroupId>,
    pub countries: Option<BTreeMap<Country, u64>>,
}

/// Single-process fast store. All operations are atomic under one lock.
#[derive(Default)]
pub struct MemoryFastStore {
    inner: Mutex<Inner>,
}

impl MemoryFastStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::warn!("Memory fast store lock poisoned; recovering");
                poisoned.into_inner()
            }
        }
    }

    pub fn snapshot(&self) -> MemorySnapshot {
        let now = Instant::now();
        let inner = self.lock();
        let queues = inner
            .queues
            .iter()
            .map(|queue| queue.order.iter().map(|(_, player)| *player).collect())
            .collect();
        let groups = inner
            .groups
            .iter()
            .filter(|(_, group)| group.live(now))
            .map(|(id, group)| {
                let mut entries = group.value.values().cloned().collect::<Vec<_>>();
                entries.sort_by_key(|entry| entry.seat);
                (*id, entries)
            })
            .collect();
        let pointers = inner
            .pointers
            .iter()
            .filter(|(_, pointer)| pointer.live(now))
            .map(|(player, pointer)| (*player, pointer.value))
            .collect();
        let countries = inner
            .countries
            .as_ref()
            .map(|scores| scores.iter().map(|(c, s)| (*c, *s)).collect());
        MemorySnapshot {
            queues,
            groups,
            pointers,
            countries,
        }
    }
}

impl FastStore for MemoryFastStore {
    async fn enqueue(
        &self,
        country: Country,
        player: PlayerId,
        enqueued_at_ms: i64,
    ) -> Result<bool, StoreError> {
        Ok(self.lock().queues[country.index()].insert(player, enqueued_at_ms))
    }

    async fn dequeue(&self, country: Country, player: PlayerId) -> Result<bool, StoreError> {
        Ok(self.lock().queues[country.index()].remove(&player))
    }

    async fn queue_len(&self, country: Country) -> Result<u64, StoreError> {
        Ok(self.lock().queues[country.index()].order.len() as u64)
    }

    async fn pop_group(&self) -> Result<Option<PoppedGroup>, StoreError> {
        let mut inner = self.lock();
        if inner.queues.iter().any(|queue| queue.order.is_empty()) {
            return Ok(None);
        }
        let mut popped = Vec::with_capacity(Country::ALL.len());
        for country in Country::ALL {
            let Some((score, player_id)) = inner.queues[country.index()].pop_min() else {
                return Err(StoreError::Corrupt {
                    field: "queue pop",
                    value: country.code().to_string(),
                });
            };
            popped.push(QueuedPlayer {
                player_id,
                country,
                enqueued_at_ms: score,
            });
        }
        popped
            .try_into()
            .map(Some)
            .map_err(|players: Vec<QueuedPlayer>| StoreError::Corrupt {
                field: "queue pop",
                value: format!("{} players", players.len()),
            })
    }

    async fn group_entries(&self, group: GroupId) -> Result<Vec<GroupEntry>, StoreError> {
        let mut inner = self.lock();
        Ok(inner
            .live_group(group)
            .map(|group| group.value.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn group_entry(
        &self,
        group: GroupId,
        player: PlayerId,
    ) -> Result<Option<GroupEntry>, StoreError> {
        let mut inner = self.lock();
        Ok(inner
            .live_group(group)
            .and_then(|group| group.value.get(&player).cloned()))
    }

    async fn put_group_entry(
        &self,
        group: GroupId,
        entry: GroupEntry,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock();
        match inner.live_group(group) {
            Some(existing) => {
                existing.value.insert(entry.player_id, entry);
                existing.expires_at = Instant::now() + ttl;
            }
            None => {
                let mut entries = HashMap::new();
                entries.insert(entry.player_id, entry);
                inner.groups.insert(group, Expiring::new(entries, ttl));
            }
        }
        Ok(())
    }

    async fn touch_group(&self, group: GroupId, ttl: Duration) -> Result<(), StoreError> {
        if let Some(existing) = self.lock().live_group(group) {
            existing.expires_at = Instant::now() + ttl;
        }
        Ok(())
    }

    async fn player_group(
        &self,
        player: PlayerId,
        ttl: Duration,
    ) -> Result<Option<GroupId>, StoreError> {
        let mut inner = self.lock();
        Ok(inner.live_pointer(player).map(|pointer| {
            pointer.expires_at = Instant::now() + ttl;
            pointer.value
        }))
    }

    async fn set_player_group(
        &self,
        player: PlayerId,
        group: GroupId,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        self.lock().pointers.insert(player, Expiring::new(group, ttl));
        Ok(())
    }

    async fn country_scores(&self) -> Result<Option<Vec<(Country, u64)>>, StoreError> {
        Ok(self
            .lock()
            .countries
            .as_ref()
            .map(|scores| scores.iter().map(|(c, s)| (*c, *s)).collect()))
    }

    async fn increment_country(&self, country: Country, delta: u64) -> Result<(), StoreError> {
        let mut inner = self.lock();
        *inner
            .countries
            .get_or_insert_with(HashMap::new)
            .entry(country)
            .or_insert(0) += delta;
        Ok(())
    }

    async fn seed_countries(&self, scores: Vec<(Country, u64)>) -> Result<(), StoreError> {
        self.lock().countries = Some(scores.into_iter().collect());
        Ok(())
    }

    async fn flush(&self) -> Result<(), StoreError> {
        *self.lock() = Inner::default();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(player_id: PlayerId, seat: u8) -> GroupEntry {
        GroupEntry {
            player_id,
            username: format!("p{seat}"),
            country: Country::ALL[seat as usize],
            score: 0,
            seat,
        }
    }

    #[tokio::test]
    async fn test_pop_group_is_all_or_nothing() {
        let store = MemoryFastStore::new();
        for (i, country) in Country::ALL.into_iter().take(4).enumerate() {
            assert!(store.enqueue(country, PlayerId::random(), i as i64).await.unwrap());
        }
        let before = store.snapshot();
        assert!(store.pop_group().await.unwrap().is_none());
        assert_eq!(store.snapshot(), before);

        let last = PlayerId::random();
        store.enqueue(Country::Germany, last, 99).await.unwrap();
        let group = store.pop_group().await.unwrap().expect("all queues filled");
        assert_eq!(group[4].player_id, last);
        for (player, country) in group.iter().zip(Country::ALL) {
            assert_eq!(player.country, country);
        }
        for country in Country::ALL {
            assert_eq!(store.queue_len(country).await.unwrap(), 0);
        }
    }

    #[tokio::test]
    async fn test_pop_takes_earliest_enqueued() {
        let store = MemoryFastStore::new();
        let early = PlayerId::random();
        let late = PlayerId::random();
        store.enqueue(Country::Turkey, late, 20).await.unwrap();
        store.enqueue(Country::Turkey, early, 10).await.unwrap();
        for country in Country::ALL.into_iter().skip(1) {
            store.enqueue(country, PlayerId::random(), 5).await.unwrap();
        }
        let group = store.pop_group().await.unwrap().unwrap();
        assert_eq!(group[0].player_id, early);
        assert_eq!(group[0].enqueued_at_ms, 10);
        assert_eq!(store.queue_len(Country::Turkey).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_enqueue_rejects_duplicates() {
        let store = MemoryFastStore::new();
        let player = PlayerId::random();
        assert!(store.enqueue(Country::France, player, 1).await.unwrap());
        assert!(!store.enqueue(Country::France, player, 2).await.unwrap());
        assert!(store.dequeue(Country::France, player).await.unwrap());
        assert!(!store.dequeue(Country::France, player).await.unwrap());
        assert!(store.enqueue(Country::France, player, 3).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_pointer_ttl_refreshes_on_read() {
        let store = MemoryFastStore::new();
        let player = PlayerId::random();
        let ttl = Duration::from_secs(10);
        store.set_player_group(player, GroupId(1), ttl).await.unwrap();

        tokio::time::advance(Duration::from_secs(8)).await;
        assert_eq!(store.player_group(player, ttl).await.unwrap(), Some(GroupId(1)));
        tokio::time::advance(Duration::from_secs(8)).await;
        assert_eq!(store.player_group(player, ttl).await.unwrap(), Some(GroupId(1)));
        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(store.player_group(player, ttl).await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_group_expires_when_idle() {
        let store = MemoryFastStore::new();
        let ttl = Duration::from_secs(5);
        let player = PlayerId::random();
        store
            .put_group_entry(GroupId(3), entry(player, 0), ttl)
            .await
            .unwrap();
        tokio::time::advance(Duration::from_secs(4)).await;
        store.touch_group(GroupId(3), ttl).await.unwrap();
        tokio::time::advance(Duration::from_secs(4)).await;
        assert!(store.group_entry(GroupId(3), player).await.unwrap().is_some());
        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(store.group_entries(GroupId(3)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_country_scores_missing_until_seeded() {
        let store = MemoryFastStore::new();
        assert!(store.country_scores().await.unwrap().is_none());
        store
            .seed_countries(Country::ALL.map(|c| (c, 0)).to_vec())
            .await
            .unwrap();
        store.increment_country(Country::Germany, 3).await.unwrap();
        let scores = store.country_scores().await.unwrap().unwrap();
        assert!(scores.contains(&(Country::Germany, 3)));
        assert_eq!(scores.len(), 5);

        store.flush().await.unwrap();
        assert!(store.country_scores().await.unwrap().is_none());
    }
}
