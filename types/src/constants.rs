/// Number of players in every group (one per country).
pub const GROUP_SIZE: usize = 5;

/// Coins debited from each member when their group forms.
pub const ENTRANCE_FEE: u64 = 1_000;

/// Minimum level required to enter a tournament.
pub const MIN_LEVEL: u32 = 20;

/// Minimum coin balance required to enter a tournament.
pub const MIN_COINS: u64 = ENTRANCE_FEE;

/// Reward for every player holding the highest score in their group.
pub const FIRST_PLACE_REWARD: u64 = 10_000;

/// Reward for every player holding the second highest distinct score in their group.
pub const SECOND_PLACE_REWARD: u64 = 5_000;

/// Coins granted per level gained.
pub const LEVEL_UP_COINS: u64 = 25;

/// Starting balance for new players
pub const STARTING_COINS: u64 = 5_000;

/// Starting level for new players
pub const STARTING_LEVEL: u32 = 1;

/// Maximum username length.
pub const MAX_USERNAME_LENGTH: usize = 16;

/// UTC hour at which the daily window closes and settlement blackout begins.
pub const WINDOW_CLOSE_HOUR: u32 = 20;
