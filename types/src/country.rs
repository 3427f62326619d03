use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error as ThisError;

/// The five countries that take part in every tournament.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Country {
    #[serde(rename = "Turkey")]
    Turkey,
    #[serde(rename = "the United States")]
    UnitedStates,
    #[serde(rename = "the United Kingdom")]
    UnitedKingdom,
    #[serde(rename = "France")]
    France,
    #[serde(rename = "Germany")]
    Germany,
}

#[derive(Debug, ThisError, PartialEq, Eq)]
#[error("unknown country: {0}")]
pub struct UnknownCountry(pub String);

impl Country {
    /// Every participating country, in queue order. Each has exactly one queue.
    pub const ALL: [Country; 5] = [
        Country::Turkey,
        Country::UnitedStates,
        Country::UnitedKingdom,
        Country::France,
        Country::Germany,
    ];

    /// Short code used for storage keys and durable rows.
    pub const fn code(self) -> &'static str {
        match self {
            Country::Turkey => "TR",
            Country::UnitedStates => "US",
            Country::UnitedKingdom => "GB",
            Country::France => "FR",
            Country::Germany => "DE",
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            Country::Turkey => "Turkey",
            Country::UnitedStates => "the United States",
            Country::UnitedKingdom => "the United Kingdom",
            Country::France => "France",
            Country::Germany => "Germany",
        }
    }

    /// Position of this country in [`Country::ALL`].
    pub const fn index(self) -> usize {
        match self {
            Country::Turkey => 0,
            Country::UnitedStates => 1,
            Country::UnitedKingdom => 2,
            Country::France => 3,
            Country::Germany => 4,
        }
    }

    /// Assigns a country uniformly at random (used at player creation).
    pub fn random<R: Rng + ?Sized>(rng: &mut R) -> Self {
        Self::ALL[rng.gen_range(0..Self::ALL.len())]
    }
}

impl fmt::Display for Country {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Country {
    type Err = UnknownCountry;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|country| country.code() == s || country.name() == s)
            .ok_or_else(|| UnknownCountry(s.to_string()))
    }
}
