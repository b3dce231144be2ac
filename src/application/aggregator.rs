use crate::domain::models::{Participant, VoteKind};
use crate::domain::vote_set::VoteSet;
use chrono::NaiveDate;
use serde::Serialize;
use std::collections::BTreeMap;
use std::ops::RangeInclusive;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParticipantFilter {
    Everyone,
    Participant(String),
    /// Everyone, restricted to dates tied for the highest available count
    /// across all votes (not only the visible range).
    MostPopular,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum HeatTier {
    None,
    Faint,
    Light,
    Strong,
    Full,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(tag = "kind", content = "tier", rename_all = "snake_case")]
pub enum CellShade {
    PerfectMatch,
    Heat(HeatTier),
    UnavailableOnly,
    Empty,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct DayTally {
    pub available_count: usize,
    pub unavailable_count: usize,
    /// Counted voters in vote-set order (user id).
    pub voters: Vec<String>,
    pub is_perfect_match: bool,
    pub heat: HeatTier,
}

impl DayTally {
    pub fn shade(&self) -> CellShade {
        if self.is_perfect_match {
            CellShade::PerfectMatch
        } else if self.available_count > 0 {
            CellShade::Heat(self.heat)
        } else if self.unavailable_count > 0 {
            CellShade::UnavailableOnly
        } else {
            CellShade::Empty
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Aggregation {
    pub denominator: usize,
    /// Global maximum available count; only computed for `MostPopular`.
    pub max_available: Option<usize>,
    pub days: BTreeMap<NaiveDate, DayTally>,
}

impl Aggregation {
    pub fn tally(&self, date: NaiveDate) -> Option<&DayTally> {
        self.days.get(&date)
    }

    pub fn shade(&self, date: NaiveDate) -> CellShade {
        self.days
            .get(&date)
            .map(DayTally::shade)
            .unwrap_or(CellShade::Empty)
    }
}

pub fn heat_tier(available: usize, denominator: usize) -> HeatTier {
    if available == 0 || denominator == 0 {
        return HeatTier::None;
    }
    let ratio = available as f64 / denominator as f64;
    if ratio >= 0.75 {
        HeatTier::Full
    } else if ratio >= 0.5 {
        HeatTier::Strong
    } else if ratio >= 0.25 {
        HeatTier::Light
    } else {
        HeatTier::Faint
    }
}

/// Highest number of available votes on any single date.
pub fn max_available_count(votes: &VoteSet) -> usize {
    votes
        .dates()
        .map(|(_, users)| {
            users
                .values()
                .filter(|kind| **kind == VoteKind::Available)
                .count()
        })
        .max()
        .unwrap_or(0)
}

pub fn aggregate(
    votes: &VoteSet,
    participants: &[Participant],
    filter: &ParticipantFilter,
    visible: RangeInclusive<NaiveDate>,
) -> Aggregation {
    let denominator = match filter {
        ParticipantFilter::Participant(_) => 1,
        ParticipantFilter::Everyone | ParticipantFilter::MostPopular => participants.len(),
    };
    let max_available = match filter {
        ParticipantFilter::MostPopular => Some(max_available_count(votes)),
        _ => None,
    };

    let mut days = BTreeMap::new();
    for (date, users) in votes.dates_in(visible) {
        let mut available_count = 0;
        let mut unavailable_count = 0;
        let mut voters = Vec::new();
        for (user_id, kind) in users {
            if matches!(filter, ParticipantFilter::Participant(selected) if selected != user_id) {
                continue;
            }
            match kind {
                VoteKind::Available => available_count += 1,
                VoteKind::Unavailable => unavailable_count += 1,
            }
            voters.push(user_id.clone());
        }

        if max_available.is_some_and(|max| max == 0 || available_count != max) {
            continue;
        }
        if voters.is_empty() {
            continue;
        }

        days.insert(
            date,
            DayTally {
                available_count,
                unavailable_count,
                voters,
                is_perfect_match: denominator > 0 && available_count == denominator,
                heat: heat_tier(available_count, denominator),
            },
        );
    }

    Aggregation {
        denominator,
        max_available,
        days,
    }
}
