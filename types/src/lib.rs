pub mod constants;
pub use constants::*;
pub mod country;
pub use country::Country;
pub mod leaderboard;
pub use leaderboard::{CountryLeaderboard, CountryStanding, GroupLeaderboard};
pub mod player;
pub use player::{Player, PlayerError, PlayerId};
pub mod tournament;
pub use tournament::{GroupEntry, GroupId, MemberRow, QueuedPlayer, TournamentWindow};
