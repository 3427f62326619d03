use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tourney_types::{Country, GroupId, MemberRow, Player, PlayerId, TournamentWindow};

use super::DurableStore;
use crate::error::StoreError;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
const WINDOW_CLOSED_MESSAGE: &str = "tournament window closed";

const MEMBER_SELECT: &str = "SELECT m.group_id, m.player_id, p.username, p.country, m.seat, m.score, m.reward, m.reward_claimed
     FROM group_members m
     JOIN players p ON p.id = m.player_id
     JOIN tournament_groups g ON g.id = m.group_id";

/// SQLite-backed durable store. One connection, used from blocking tasks.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        init_schema_sqlite(&conn)?;
        Ok(Self::from_connection(conn))
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        init_schema_sqlite(&conn)?;
        Ok(Self::from_connection(conn))
    }

    fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
        }
    }

    async fn call<T, F>(&self, op: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = match conn.lock() {
                Ok(guard) => guard,
                Err(poisoned) => {
                    tracing::warn!("SQLite connection lock poisoned; recovering");
                    poisoned.into_inner()
                }
            };
            op(&mut conn)
        })
        .await?
    }
}

fn init_schema_sqlite(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "PRAGMA journal_mode=WAL;
         PRAGMA synchronous=NORMAL;
         PRAGMA foreign_keys=ON;
         CREATE TABLE IF NOT EXISTS players (
             id TEXT PRIMARY KEY,
             username TEXT NOT NULL UNIQUE,
             country TEXT NOT NULL,
             level INTEGER NOT NULL,
             coins INTEGER NOT NULL CHECK (coins >= 0),
             created_at TEXT NOT NULL
         );
         CREATE TABLE IF NOT EXISTS tournament_groups (
             id INTEGER PRIMARY KEY AUTOINCREMENT,
             formed_at TEXT NOT NULL
         );
         CREATE INDEX IF NOT EXISTS tournament_groups_formed_at
             ON tournament_groups (formed_at);
         CREATE TRIGGER IF NOT EXISTS tournament_groups_window
         BEFORE INSERT ON tournament_groups
         WHEN CAST(strftime('%H', NEW.formed_at) AS INTEGER) >= 20
         BEGIN
             SELECT RAISE(ABORT, 'tournament window closed');
         END;
         CREATE TABLE IF NOT EXISTS group_members (
             group_id INTEGER NOT NULL REFERENCES tournament_groups (id),
             player_id TEXT NOT NULL REFERENCES players (id),
             seat INTEGER NOT NULL,
             score INTEGER NOT NULL DEFAULT 0 CHECK (score >= 0),
             reward INTEGER,
             reward_claimed INTEGER,
             CHECK ((reward IS NULL) = (reward_claimed IS NULL)),
             PRIMARY KEY (group_id, player_id)
         );
         CREATE INDEX IF NOT EXISTS group_members_player
             ON group_members (player_id);",
    )?;
    Ok(())
}

fn format_timestamp(at: DateTime<Utc>) -> String {
    at.format(TIMESTAMP_FORMAT).to_string()
}

fn format_day(day: NaiveDate) -> String {
    TournamentWindow::format_day(day)
}

fn conversion_error<E>(idx: usize, err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

fn player_id_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<PlayerId> {
    row.get::<_, String>(idx)?
        .parse()
        .map_err(|err| conversion_error(idx, err))
}

fn country_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<Country> {
    row.get::<_, String>(idx)?
        .parse()
        .map_err(|err| conversion_error(idx, err))
}

fn player_row(row: &Row<'_>) -> rusqlite::Result<Player> {
    let created_at = row.get::<_, String>(5)?;
    let created_at = NaiveDateTime::parse_from_str(&created_at, TIMESTAMP_FORMAT)
        .map_err(|err| conversion_error(5, err))?
        .and_utc();
    Ok(Player {
        id: player_id_at(row, 0)?,
        username: row.get(1)?,
        country: country_at(row, 2)?,
        level: row.get::<_, i64>(3)? as u32,
        coins: row.get::<_, i64>(4)? as u64,
        created_at,
    })
}

fn member_row(row: &Row<'_>) -> rusqlite::Result<MemberRow> {
    Ok(MemberRow {
        group_id: GroupId(row.get(0)?),
        player_id: player_id_at(row, 1)?,
        username: row.get(2)?,
        country: country_at(row, 3)?,
        seat: row.get::<_, i64>(4)? as u8,
        score: row.get::<_, i64>(5)? as u64,
        reward: row.get::<_, Option<i64>>(6)?.map(|reward| reward as u64),
        reward_claimed: row.get(7)?,
    })
}

fn member_pair(row: &Row<'_>) -> rusqlite::Result<(GroupId, PlayerId)> {
    Ok((GroupId(row.get(0)?), player_id_at(row, 1)?))
}

fn select_player(conn: &Connection, player: PlayerId) -> Result<Option<Player>, StoreError> {
    Ok(conn
        .query_row(
            "SELECT id, username, country, level, coins, created_at FROM players WHERE id = ?1",
            params![player.to_string()],
            player_row,
        )
        .optional()?)
}

fn is_window_closed(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(_, Some(message)) if message.contains(WINDOW_CLOSED_MESSAGE)
    )
}

impl DurableStore for SqliteStore {
    async fn create_player(&self, player: Player) -> Result<(), StoreError> {
        self.call(move |conn| {
            let taken: bool = conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM players WHERE username = ?1)",
                params![player.username],
                |row| row.get(0),
            )?;
            if taken {
                return Err(StoreError::Duplicate {
                    field: "username",
                    value: player.username,
                });
            }
            conn.execute(
                "INSERT INTO players (id, username, country, level, coins, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    player.id.to_string(),
                    player.username,
                    player.country.code(),
                    player.level as i64,
                    player.coins as i64,
                    format_timestamp(player.created_at),
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn player(&self, player: PlayerId) -> Result<Option<Player>, StoreError> {
        self.call(move |conn| select_player(conn, player)).await
    }

    async fn level_up(&self, player: PlayerId) -> Result<Option<Player>, StoreError> {
        self.call(move |conn| {
            let tx = conn.transaction()?;
            let updated = tx.execute(
                "UPDATE players SET level = level + 1, coins = coins + ?2 WHERE id = ?1",
                params![player.to_string(), tourney_types::LEVEL_UP_COINS as i64],
            )?;
            let profile = if updated == 0 {
                None
            } else {
                select_player(&tx, player)?
            };
            tx.commit()?;
            Ok(profile)
        })
        .await
    }

    async fn insert_group(&self, formed_at: DateTime<Utc>) -> Result<GroupId, StoreError> {
        self.call(move |conn| {
            match conn.execute(
                "INSERT INTO tournament_groups (formed_at) VALUES (?1)",
                params![format_timestamp(formed_at)],
            ) {
                Ok(_) => Ok(GroupId(conn.last_insert_rowid())),
                Err(err) if is_window_closed(&err) => Err(StoreError::WindowClosed),
                Err(err) => Err(err.into()),
            }
        })
        .await
    }

    async fn insert_memberships(
        &self,
        group: GroupId,
        players: Vec<PlayerId>,
    ) -> Result<(), StoreError> {
        self.call(move |conn| {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare(
                    "INSERT INTO group_members (group_id, player_id, seat, score, reward, reward_claimed)
                     VALUES (?1, ?2, ?3, 0, NULL, NULL)",
                )?;
                for (seat, player) in players.iter().enumerate() {
                    stmt.execute(params![group.0, player.to_string(), seat as i64])?;
                }
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn debit_coins(&self, players: Vec<PlayerId>, amount: u64) -> Result<(), StoreError> {
        self.call(move |conn| {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare("UPDATE players SET coins = coins - ?2 WHERE id = ?1")?;
                for player in &players {
                    stmt.execute(params![player.to_string(), amount as i64])?;
                }
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn membership_on(
        &self,
        player: PlayerId,
        day: NaiveDate,
    ) -> Result<Option<MemberRow>, StoreError> {
        self.call(move |conn| {
            let query = format!(
                "{MEMBER_SELECT} WHERE m.player_id = ?1 AND date(g.formed_at) = ?2 LIMIT 1"
            );
            Ok(conn
                .query_row(&query, params![player.to_string(), format_day(day)], member_row)
                .optional()?)
        })
        .await
    }

    async fn group_members(&self, group: GroupId) -> Result<Vec<MemberRow>, StoreError> {
        self.call(move |conn| {
            let query = format!("{MEMBER_SELECT} WHERE m.group_id = ?1 ORDER BY m.seat");
            let mut stmt = conn.prepare(&query)?;
            let rows = stmt.query_map(params![group.0], member_row)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
        .await
    }

    async fn members_on(&self, day: NaiveDate) -> Result<Vec<MemberRow>, StoreError> {
        self.call(move |conn| {
            let query = format!(
                "{MEMBER_SELECT} WHERE date(g.formed_at) = ?1 ORDER BY m.group_id, m.seat"
            );
            let mut stmt = conn.prepare(&query)?;
            let rows = stmt.query_map(params![format_day(day)], member_row)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
        .await
    }

    async fn country_scores_on(&self, day: NaiveDate) -> Result<Vec<(Country, u64)>, StoreError> {
        self.call(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT p.country, SUM(m.score)
                 FROM group_members m
                 JOIN players p ON p.id = m.player_id
                 JOIN tournament_groups g ON g.id = m.group_id
                 WHERE date(g.formed_at) = ?1
                 GROUP BY p.country",
            )?;
            let rows = stmt.query_map(params![format_day(day)], |row| {
                Ok((country_at(row, 0)?, row.get::<_, i64>(1)? as u64))
            })?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
        .await
    }

    async fn increment_score(&self, player: PlayerId, group: GroupId) -> Result<u64, StoreError> {
        self.call(move |conn| {
            let updated = conn.execute(
                "UPDATE group_members SET score = score + 1 WHERE group_id = ?1 AND player_id = ?2",
                params![group.0, player.to_string()],
            )?;
            Ok(updated as u64)
        })
        .await
    }

    async fn top_scorers_on(&self, day: NaiveDate) -> Result<Vec<(GroupId, PlayerId)>, StoreError> {
        self.call(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT m.group_id, m.player_id
                 FROM group_members m
                 JOIN tournament_groups g ON g.id = m.group_id
                 WHERE date(g.formed_at) = ?1
                   AND m.score = (SELECT MAX(o.score) FROM group_members o WHERE o.group_id = m.group_id)
                 ORDER BY m.group_id, m.seat",
            )?;
            let rows = stmt.query_map(params![format_day(day)], member_pair)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
        .await
    }

    async fn runner_ups_on(&self, day: NaiveDate) -> Result<Vec<(GroupId, PlayerId)>, StoreError> {
        self.call(move |conn| {
            // The inner MAX is NULL when every member shares the top score.
            let mut stmt = conn.prepare(
                "SELECT m.group_id, m.player_id
                 FROM group_members m
                 JOIN tournament_groups g ON g.id = m.group_id
                 WHERE date(g.formed_at) = ?1
                   AND m.score = (
                       SELECT MAX(o.score) FROM group_members o
                       WHERE o.group_id = m.group_id
                         AND o.score < (SELECT MAX(t.score) FROM group_members t WHERE t.group_id = m.group_id)
                   )
                 ORDER BY m.group_id, m.seat",
            )?;
            let rows = stmt.query_map(params![format_day(day)], member_pair)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
        .await
    }

    async fn set_rewards(
        &self,
        members: Vec<(GroupId, PlayerId)>,
        amount: u64,
    ) -> Result<(), StoreError> {
        self.call(move |conn| {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare(
                    "UPDATE group_members SET reward = ?3, reward_claimed = 0
                     WHERE group_id = ?1 AND player_id = ?2",
                )?;
                for (group, player) in &members {
                    stmt.execute(params![group.0, player.to_string(), amount as i64])?;
                }
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn has_unclaimed_reward(&self, player: PlayerId) -> Result<bool, StoreError> {
        self.call(move |conn| {
            Ok(conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM group_members WHERE player_id = ?1 AND reward_claimed = 0)",
                params![player.to_string()],
                |row| row.get(0),
            )?)
        })
        .await
    }

    async fn claim_rewards(&self, player: PlayerId) -> Result<u64, StoreError> {
        self.call(move |conn| {
            let id = player.to_string();
            let tx = conn.transaction()?;
            let total: i64 = tx.query_row(
                "SELECT COALESCE(SUM(reward), 0) FROM group_members
                 WHERE player_id = ?1 AND reward_claimed = 0",
                params![id],
                |row| row.get(0),
            )?;
            if total > 0 {
                tx.execute(
                    "UPDATE group_members SET reward_claimed = 1
                     WHERE player_id = ?1 AND reward_claimed = 0",
                    params![id],
                )?;
                tx.execute(
                    "UPDATE players SET coins = coins + ?2 WHERE id = ?1",
                    params![id, total],
                )?;
            }
            tx.commit()?;
            Ok(total as u64)
        })
        .await
    }

    async fn rank_on(&self, player: PlayerId, day: NaiveDate) -> Result<Option<u32>, StoreError> {
        self.call(move |conn| {
            let rank: Option<i64> = conn
                .query_row(
                    "SELECT 1 + (SELECT COUNT(*) FROM group_members o
                                 WHERE o.group_id = m.group_id AND o.score > m.score)
                     FROM group_members m
                     JOIN tournament_groups g ON g.id = m.group_id
                     WHERE m.player_id = ?1 AND date(g.formed_at) = ?2
                     LIMIT 1",
                    params![player.to_string(), format_day(day)],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(rank.map(|rank| rank as u32))
        })
        .await
    }
}
