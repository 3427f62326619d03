use redis::aio::{ConnectionManager, MultiplexedConnection};
use redis::AsyncCommands;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tourney_types::{Country, GroupEntry, GroupId, PlayerId, QueuedPlayer};

use super::{FastStore, PoppedGroup};
use crate::error::StoreError;

pub const DEFAULT_KEY_PREFIX: &str = "tourney:";

pub struct RedisFastStore {
    client: redis::Client,
    connection: Mutex<Option<ConnectionManager>>,
    /// Dedicated connection for WATCH/MULTI, since WATCH state is per connection.
    transactions: Mutex<Option<MultiplexedConnection>>,
    prefix: String,
}

impl RedisFastStore {
    pub fn new(url: &str, prefix: String) -> Result<Self, redis::RedisError> {
        let client = redis::Client::open(url)?;
        Ok(Self {
            client,
            connection: Mutex::new(None),
            transactions: Mutex::new(None),
            prefix,
        })
    }

    fn queue_key(&self, country: Country) -> String {
        format!("{}queue:{}", self.prefix, country.code())
    }

    fn group_key(&self, group: GroupId) -> String {
        format!("{}group:{}", self.prefix, group)
    }

    fn pointer_key(&self, player: PlayerId) -> String {
        format!("{}player:{}", self.prefix, player)
    }

    fn countries_key(&self) -> String {
        format!("{}countries", self.prefix)
    }

    async fn ensure_connection(&self) -> Result<ConnectionManager, StoreError> {
        let mut guard = self.connection.lock().await;
        if let Some(conn) = guard.as_ref() {
            return Ok(conn.clone());
        }
        let conn = self.client.get_connection_manager().await?;
        *guard = Some(conn.clone());
        Ok(conn)
    }

    async fn ensure_transactions(
        &self,
    ) -> Result<tokio::sync::MutexGuard<'_, Option<MultiplexedConnection>>, redis::RedisError> {
        let mut guard = self.transactions.lock().await;
        if guard.is_none() {
            *guard = Some(self.client.get_multiplexed_async_connection().await?);
        }
        Ok(guard)
    }

    async fn pop_watched(
        &self,
        conn: &mut MultiplexedConnection,
    ) -> Result<Option<PoppedGroup>, StoreError> {
        if !self.watch_queues(conn).await? {
            return Ok(None);
        }
        self.exec_pop(conn).await
    }

    /// Watches every queue. Returns false, with the watch released, if any is empty.
    async fn watch_queues(&self, conn: &mut MultiplexedConnection) -> Result<bool, StoreError> {
        let keys = Country::ALL.map(|country| self.queue_key(country));
        let _: () = redis::cmd("WATCH").arg(&keys[..]).query_async(conn).await?;

        for key in &keys {
            let len: u64 = conn.zcard(key).await?;
            if len == 0 {
                let _: () = redis::cmd("UNWATCH").query_async(conn).await?;
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn exec_pop(
        &self,
        conn: &mut MultiplexedConnection,
    ) -> Result<Option<PoppedGroup>, StoreError> {
        let mut pipe = redis::pipe();
        pipe.atomic();
        for country in Country::ALL {
            pipe.cmd("ZPOPMIN").arg(self.queue_key(country));
        }
        let reply: Option<Vec<Vec<(String, f64)>>> = pipe.query_async(conn).await?;
        decode_popped(reply)
    }
}

/// Decodes the EXEC reply of the five ZPOPMIN commands, one per queue in
/// [`Country::ALL`] order. A nil reply means a watched queue changed and EXEC
/// was discarded.
fn decode_popped(
    reply: Option<Vec<Vec<(String, f64)>>>,
) -> Result<Option<PoppedGroup>, StoreError> {
    let Some(popped) = reply else {
        return Ok(None);
    };
    if popped.len() != Country::ALL.len() {
        return Err(StoreError::Corrupt {
            field: "queue pop",
            value: format!("{} replies", popped.len()),
        });
    }

    let mut players = Vec::with_capacity(Country::ALL.len());
    for (country, members) in Country::ALL.into_iter().zip(popped) {
        let Some((member, score)) = members.into_iter().next() else {
            return Err(StoreError::Corrupt {
                field: "queue pop",
                value: country.code().to_string(),
            });
        };
        players.push(QueuedPlayer {
            player_id: parse_player(&member)?,
            country,
            enqueued_at_ms: score as i64,
        });
    }
    players
        .try_into()
        .map(Some)
        .map_err(|players: Vec<QueuedPlayer>| StoreError::Corrupt {
            field: "queue pop",
            value: format!("{} players", players.len()),
        })
}

/// Decodes a ZREVRANGE WITHSCORES reply of the country aggregate. An empty
/// reply means the aggregate does not exist.
fn decode_countries(raw: Vec<(String, f64)>) -> Result<Option<Vec<(Country, u64)>>, StoreError> {
    if raw.is_empty() {
        return Ok(None);
    }
    raw.into_iter()
        .map(|(code, score)| {
            let country = code.parse::<Country>().map_err(|_| StoreError::Corrupt {
                field: "country",
                value: code.clone(),
            })?;
            Ok((country, score.max(0.0) as u64))
        })
        .collect::<Result<Vec<_>, _>>()
        .map(Some)
}

fn parse_player(value: &str) -> Result<PlayerId, StoreError> {
    value.parse().map_err(|_| StoreError::Corrupt {
        field: "player id",
        value: value.to_string(),
    })
}

fn parse_group(value: &str) -> Result<GroupId, StoreError> {
    value.parse().map_err(|_| StoreError::Corrupt {
        field: "group id",
        value: value.to_string(),
    })
}

fn ttl_seconds(ttl: Duration) -> i64 {
    ttl.as_secs().max(1) as i64
}

impl FastStore for RedisFastStore {
    async fn enqueue(
        &self,
        country: Country,
        player: PlayerId,
        enqueued_at_ms: i64,
    ) -> Result<bool, StoreError> {
        let mut conn = self.ensure_connection().await?;
        let added: i64 = redis::cmd("ZADD")
            .arg(self.queue_key(country))
            .arg("NX")
            .arg(enqueued_at_ms)
            .arg(player.to_string())
            .query_async(&mut conn)
            .await?;
        Ok(added == 1)
    }

    async fn dequeue(&self, country: Country, player: PlayerId) -> Result<bool, StoreError> {
        let mut conn = self.ensure_connection().await?;
        let removed: i64 = conn
            .zrem(self.queue_key(country), player.to_string())
            .await?;
        Ok(removed == 1)
    }

    async fn queue_len(&self, country: Country) -> Result<u64, StoreError> {
        let mut conn = self.ensure_connection().await?;
        Ok(conn.zcard(self.queue_key(country)).await?)
    }

    async fn pop_group(&self) -> Result<Option<PoppedGroup>, StoreError> {
        let mut guard = self.ensure_transactions().await?;
        let Some(conn) = guard.as_mut() else {
            return Ok(None);
        };
        let result = self.pop_watched(conn).await;
        if let Err(StoreError::Redis(err)) = &result {
            tracing::warn!("Redis transaction connection reset: {err}");
            *guard = None;
        }
        result
    }

    async fn group_entries(&self, group: GroupId) -> Result<Vec<GroupEntry>, StoreError> {
        let mut conn = self.ensure_connection().await?;
        let raw: HashMap<String, String> = conn.hgetall(self.group_key(group)).await?;
        raw.values()
            .map(|value| serde_json::from_str(value).map_err(StoreError::from))
            .collect()
    }

    async fn group_entry(
        &self,
        group: GroupId,
        player: PlayerId,
    ) -> Result<Option<GroupEntry>, StoreError> {
        let mut conn = self.ensure_connection().await?;
        let raw: Option<String> = conn
            .hget(self.group_key(group), player.to_string())
            .await?;
        raw.map(|value| serde_json::from_str(&value).map_err(StoreError::from))
            .transpose()
    }

    async fn put_group_entry(
        &self,
        group: GroupId,
        entry: GroupEntry,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let key = self.group_key(group);
        let value = serde_json::to_string(&entry)?;
        let mut conn = self.ensure_connection().await?;
        let mut pipe = redis::pipe();
        pipe.atomic()
            .hset(&key, entry.player_id.to_string(), value)
            .ignore()
            .expire(&key, ttl_seconds(ttl))
            .ignore();
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    async fn touch_group(&self, group: GroupId, ttl: Duration) -> Result<(), StoreError> {
        let mut conn = self.ensure_connection().await?;
        let _: i64 = conn.expire(self.group_key(group), ttl_seconds(ttl)).await?;
        Ok(())
    }

    async fn player_group(
        &self,
        player: PlayerId,
        ttl: Duration,
    ) -> Result<Option<GroupId>, StoreError> {
        let mut conn = self.ensure_connection().await?;
        let raw: Option<String> = redis::cmd("GETEX")
            .arg(self.pointer_key(player))
            .arg("EX")
            .arg(ttl_seconds(ttl))
            .query_async(&mut conn)
            .await?;
        raw.as_deref().map(parse_group).transpose()
    }

    async fn set_player_group(
        &self,
        player: PlayerId,
        group: GroupId,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let mut conn = self.ensure_connection().await?;
        let _: () = redis::cmd("SET")
            .arg(self.pointer_key(player))
            .arg(group.to_string())
            .arg("EX")
            .arg(ttl_seconds(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn country_scores(&self) -> Result<Option<Vec<(Country, u64)>>, StoreError> {
        let mut conn = self.ensure_connection().await?;
        let raw: Vec<(String, f64)> = conn
            .zrevrange_withscores(self.countries_key(), 0, -1)
            .await?;
        decode_countries(raw)
    }

    async fn increment_country(&self, country: Country, delta: u64) -> Result<(), StoreError> {
        let mut conn = self.ensure_connection().await?;
        let _: f64 = conn
            .zincr(self.countries_key(), country.code(), delta as f64)
            .await?;
        Ok(())
    }

    async fn seed_countries(&self, scores: Vec<(Country, u64)>) -> Result<(), StoreError> {
        let key = self.countries_key();
        let mut conn = self.ensure_connection().await?;
        let mut pipe = redis::pipe();
        pipe.atomic().del(&key).ignore();
        for (country, score) in scores {
            pipe.zadd(&key, country.code(), score as f64).ignore();
        }
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    async fn flush(&self) -> Result<(), StoreError> {
        let mut conn = self.ensure_connection().await?;
        let _: () = redis::cmd("FLUSHDB").query_async(&mut conn).await?;
        Ok(())
    }
}
