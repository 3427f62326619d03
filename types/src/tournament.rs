use chrono::{DateTime, Datelike, Days, NaiveDate, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::{Country, PlayerId, WINDOW_CLOSE_HOUR};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupId(pub i64);

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for GroupId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse().map(Self)
    }
}

/// One member's row in a live group leaderboard.
///
/// `seat` is the order in which the member was placed into the group and breaks
/// score ties when the leaderboard is sorted.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupEntry {
    pub player_id: PlayerId,
    pub username: String,
    pub country: Country,
    pub score: u64,
    pub seat: u8,
}

/// Durable membership joined with the owning player's profile.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MemberRow {
    pub group_id: GroupId,
    pub player_id: PlayerId,
    pub username: String,
    pub country: Country,
    pub seat: u8,
    pub score: u64,
    pub reward: Option<u64>,
    pub reward_claimed: Option<bool>,
}

impl MemberRow {
    pub fn entry(&self) -> GroupEntry {
        GroupEntry {
            player_id: self.player_id,
            username: self.username.clone(),
            country: self.country,
            score: self.score,
            seat: self.seat,
        }
    }
}

/// A player popped from a country queue by the matchmaker.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedPlayer {
    pub player_id: PlayerId,
    pub country: Country,
    /// Milliseconds since the unix epoch at which the player was enqueued.
    pub enqueued_at_ms: i64,
}

/// Daily window arithmetic. The active window is `[00:00, 20:00)` UTC.
pub struct TournamentWindow;

impl TournamentWindow {
    pub fn is_active(now: DateTime<Utc>) -> bool {
        now.hour() < WINDOW_CLOSE_HOUR
    }

    /// The tournament day `now` belongs to.
    pub fn day(now: DateTime<Utc>) -> NaiveDate {
        now.date_naive()
    }

    pub fn next_midnight(now: DateTime<Utc>) -> DateTime<Utc> {
        let today = now.date_naive();
        let tomorrow = today
            .checked_add_days(Days::new(1))
            .unwrap_or(today)
            .and_hms_opt(0, 0, 0)
            .unwrap_or_default();
        Utc.from_utc_datetime(&tomorrow)
    }

    /// Parses a `YYYY-MM-DD` tournament date.
    pub fn parse_day(value: &str) -> Result<NaiveDate, chrono::ParseError> {
        NaiveDate::parse_from_str(value, "%Y-%m-%d")
    }

    pub fn format_day(day: NaiveDate) -> String {
        format!("{:04}-{:02}-{:02}", day.year(), day.month(), day.day())
    }
}
