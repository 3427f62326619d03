use serde::{Deserialize, Serialize};

use crate::{Country, GroupEntry, GroupId, GROUP_SIZE};

/// Live leaderboard of a single group, highest score first.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupLeaderboard {
    pub group_id: GroupId,
    pub entries: Vec<GroupEntry>,
}

impl GroupLeaderboard {
    /// Builds a leaderboard from unordered entries.
    ///
    /// Entries are only sorted once the group is complete; ties keep seat order.
    pub fn new(group_id: GroupId, mut entries: Vec<GroupEntry>) -> Self {
        entries.sort_by_key(|entry| entry.seat);
        if entries.len() >= GROUP_SIZE {
            entries.sort_by(|a, b| b.score.cmp(&a.score));
        }
        entries.truncate(GROUP_SIZE);
        Self { group_id, entries }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountryStanding {
    pub country: Country,
    pub score: u64,
}

/// Aggregate score per country, highest first.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountryLeaderboard {
    pub standings: Vec<CountryStanding>,
}

impl CountryLeaderboard {
    pub fn new(scores: impl IntoIterator<Item = (Country, u64)>) -> Self {
        let mut standings = scores
            .into_iter()
            .map(|(country, score)| CountryStanding { country, score })
            .collect::<Vec<_>>();
        standings.sort_by(|a, b| {
            b.score
                .cmp(&a.score)
                .then_with(|| a.country.index().cmp(&b.country.index()))
        });
        standings.truncate(Country::ALL.len());
        Self { standings }
    }

    pub fn score(&self, country: Country) -> Option<u64> {
        self.standings
            .iter()
            .find(|standing| standing.country == country)
            .map(|standing| standing.score)
    }
}
