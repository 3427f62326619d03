use chrono::NaiveDate;
use thiserror::Error as ThisError;
use tourney_types::{GroupId, PlayerError, PlayerId};

/// Failure talking to the fast or durable store.
#[derive(Debug, ThisError)]
pub enum StoreError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("blocking task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
    /// The durable store refused to create a group outside the daily window.
    #[error("tournament window closed")]
    WindowClosed,
    #[error("{field} already taken: {value}")]
    Duplicate { field: &'static str, value: String },
    #[error("corrupt {field} in store: {value}")]
    Corrupt { field: &'static str, value: String },
}

/// Eligibility failures. Reported to the caller, never retried, no side effects.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ThisError)]
pub enum Rejection {
    #[error("Daily tournaments are held between 00.00 and 20.00 UTC")]
    OutsideWindow,
    #[error("You must be at least level {min} in order to participate in a tournament")]
    LevelTooLow { min: u32 },
    #[error("It costs {fee} coins to participate in a tournament")]
    InsufficientCoins { fee: u64 },
    #[error("You are already in the tournament")]
    AlreadyInTournament,
    #[error("You have unclaimed rewards. You must claim your rewards from the previous tournament to participate in the new one")]
    UnclaimedRewards,
    #[error("You are already in a queue")]
    AlreadyQueued,
    #[error("No rewards to claim")]
    NoRewardsToClaim,
}

#[derive(Debug, ThisError)]
pub enum TournamentError {
    #[error("{0}")]
    Rejected(#[from] Rejection),
    #[error("A timeout occurred while waiting for other players")]
    Timeout,
    #[error("join cancelled before a group formed")]
    Cancelled,
    #[error("You are not in the tournament at the moment")]
    NotInTournament,
    #[error("You were not in a tournament on {0}")]
    NotInTournamentOn(NaiveDate),
    #[error("no such group: {0}")]
    NoSuchGroup(GroupId),
    #[error("unknown player: {0}")]
    UnknownPlayer(PlayerId),
    #[error("invalid player: {0}")]
    InvalidPlayer(#[from] PlayerError),
    #[error("consistency fault: {0}")]
    Consistency(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type Result<T, E = TournamentError> = std::result::Result<T, E>;
