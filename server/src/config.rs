use std::time::Duration;
use thiserror::Error as ThisError;

pub const DEFAULT_MATCHMAKING_INTERVAL_MS: u64 = 1_000;
pub const DEFAULT_JOIN_TIMEOUT_MS: u64 = 60_000;
pub const DEFAULT_GROUP_TTL_SECONDS: u64 = 30 * 60;
pub const DEFAULT_POINTER_TTL_SECONDS: u64 = 30 * 60;
pub const DEFAULT_FORMATION_BUFFER: usize = 1_024;
pub const DEFAULT_SCORE_SYNC_BUFFER: usize = 1_024;

#[derive(Debug, ThisError, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{field} must be > 0 (got {value})")]
    InvalidNonZero { field: &'static str, value: u64 },
    #[error("join_timeout ({timeout_ms}ms) must be at least one poll interval ({poll_ms}ms)")]
    TimeoutShorterThanPoll { timeout_ms: u64, poll_ms: u64 },
}

#[derive(Clone, Debug)]
pub struct TournamentConfig {
    /// Period of the matchmaking tick.
    pub matchmaking_interval: Duration,
    /// Upper bound on how long a joining player waits for a group.
    pub join_timeout: Duration,
    /// Idle TTL of a live group leaderboard.
    pub group_ttl: Duration,
    /// Idle TTL of a player to group pointer.
    pub pointer_ttl: Duration,
    /// Put popped players back into their queues when their group cannot be created.
    pub requeue_on_formation_failure: bool,
    pub formation_buffer: usize,
    pub score_sync_buffer: usize,
}

impl Default for TournamentConfig {
    fn default() -> Self {
        Self {
            matchmaking_interval: Duration::from_millis(DEFAULT_MATCHMAKING_INTERVAL_MS),
            join_timeout: Duration::from_millis(DEFAULT_JOIN_TIMEOUT_MS),
            group_ttl: Duration::from_secs(DEFAULT_GROUP_TTL_SECONDS),
            pointer_ttl: Duration::from_secs(DEFAULT_POINTER_TTL_SECONDS),
            requeue_on_formation_failure: true,
            formation_buffer: DEFAULT_FORMATION_BUFFER,
            score_sync_buffer: DEFAULT_SCORE_SYNC_BUFFER,
        }
    }
}

impl TournamentConfig {
    /// Joiners poll at half the matchmaking tick.
    pub fn poll_interval(&self) -> Duration {
        (self.matchmaking_interval / 2).max(Duration::from_millis(1))
    }

    /// Number of polls a joiner performs before giving up.
    pub fn max_polls(&self) -> u32 {
        let polls = self.join_timeout.as_millis() / self.poll_interval().as_millis().max(1);
        polls.clamp(1, u32::MAX as u128) as u32
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        ensure_nonzero("matchmaking_interval", self.matchmaking_interval.as_millis() as u64)?;
        ensure_nonzero("join_timeout", self.join_timeout.as_millis() as u64)?;
        ensure_nonzero("group_ttl", self.group_ttl.as_secs())?;
        ensure_nonzero("pointer_ttl", self.pointer_ttl.as_secs())?;
        ensure_nonzero("formation_buffer", self.formation_buffer as u64)?;
        ensure_nonzero("score_sync_buffer", self.score_sync_buffer as u64)?;
        if self.join_timeout < self.poll_interval() {
            return Err(ConfigError::TimeoutShorterThanPoll {
                timeout_ms: self.join_timeout.as_millis() as u64,
                poll_ms: self.poll_interval().as_millis() as u64,
            });
        }
        Ok(())
    }
}

fn ensure_nonzero(field: &'static str, value: u64) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::InvalidNonZero { field, value });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = TournamentConfig::default();
        config.validate().expect("defaults should validate");
        assert_eq!(config.poll_interval(), Duration::from_millis(500));
        assert_eq!(config.max_polls(), 120);
    }

    #[test]
    fn test_rejects_zero_ttl() {
        let config = TournamentConfig {
            group_ttl: Duration::ZERO,
            ..TournamentConfig::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidNonZero {
                field: "group_ttl",
                value: 0
            })
        );
    }

    #[test]
    fn test_rejects_timeout_shorter_than_poll() {
        let config = TournamentConfig {
            matchmaking_interval: Duration::from_secs(10),
            join_timeout: Duration::from_secs(1),
            ..TournamentConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::TimeoutShorterThanPoll { .. })
        ));
    }

    #[test]
    fn test_tiny_interval_still_polls() {
        let config = TournamentConfig {
            matchmaking_interval: Duration::from_millis(1),
            join_timeout: Duration::from_millis(10),
            ..TournamentConfig::default()
        };
        assert_eq!(config.poll_interval(), Duration::from_millis(1));
        assert_eq!(config.max_polls(), 10);
    }
}
