use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error as ThisError;
use uuid::Uuid;

use crate::{Country, MAX_USERNAME_LENGTH, STARTING_COINS, STARTING_LEVEL};

#[derive(Debug, ThisError, PartialEq, Eq)]
pub enum PlayerError {
    #[error("username must not be empty")]
    EmptyUsername,
    #[error("username too long (len={len}, max={max})")]
    UsernameTooLong { len: usize, max: usize },
    #[error("username may only contain printable ASCII characters without spaces")]
    InvalidCharacter,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlayerId(pub Uuid);

impl PlayerId {
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for PlayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for PlayerId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Player profile as stored durably.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Player {
    pub id: PlayerId,
    pub username: String,
    pub country: Country,
    pub level: u32,
    pub coins: u64,
    pub created_at: DateTime<Utc>,
}

impl Player {
    /// Creates a fresh profile, validating the username first.
    pub fn new(
        username: String,
        country: Country,
        created_at: DateTime<Utc>,
    ) -> Result<Self, PlayerError> {
        validate_username(&username)?;
        Ok(Self {
            id: PlayerId::random(),
            username,
            country,
            level: STARTING_LEVEL,
            coins: STARTING_COINS,
            created_at,
        })
    }
}

/// Usernames are 1 to 16 visible ASCII characters (0x21 through 0x7E).
pub fn validate_username(username: &str) -> Result<(), PlayerError> {
    if username.is_empty() {
        return Err(PlayerError::EmptyUsername);
    }
    if username.len() > MAX_USERNAME_LENGTH {
        return Err(PlayerError::UsernameTooLong {
            len: username.len(),
            max: MAX_USERNAME_LENGTH,
        });
    }
    if !username.bytes().all(|b| b.is_ascii_graphic()) {
        return Err(PlayerError::InvalidCharacter);
    }
    Ok(())
}
