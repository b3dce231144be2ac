use crate::domain::models::{Vote, VoteAction, VoteKind};
use chrono::NaiveDate;
use std::collections::{BTreeMap, BTreeSet};
use std::ops::RangeInclusive;

/// Votes indexed by date, then by user. A (date, user) pair holds at most one
/// vote; inserting again replaces it. Dates with no votes left are removed so
/// that equal collections compare equal.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VoteSet {
    by_date: BTreeMap<NaiveDate, BTreeMap<String, VoteKind>>,
}

impl VoteSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Later votes for the same (date, user) win.
    pub fn from_votes(votes: impl IntoIterator<Item = Vote>) -> Self {
        let mut set = Self::new();
        for vote in votes {
            set.insert(vote);
        }
        set
    }

    pub fn len(&self) -> usize {
        self.by_date.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.by_date.is_empty()
    }

    pub fn get(&self, date: NaiveDate, user_id: &str) -> Option<VoteKind> {
        self.by_date
            .get(&date)
            .and_then(|users| users.get(user_id))
            .copied()
    }

    pub fn insert(&mut self, vote: Vote) -> Option<VoteKind> {
        self.by_date
            .entry(vote.date)
            .or_default()
            .insert(vote.user_id, vote.kind)
    }

    pub fn remove(&mut self, date: NaiveDate, user_id: &str) -> Option<VoteKind> {
        let users = self.by_date.get_mut(&date)?;
        let removed = users.remove(user_id);
        if users.is_empty() {
            self.by_date.remove(&date);
        }
        removed
    }

    /// Writes `value` for one (date, user) pair; `None` removes it.
    pub fn put(&mut self, date: NaiveDate, user_id: &str, value: Option<VoteKind>) {
        match value {
            Some(kind) => {
                self.insert(Vote::new(date, user_id, kind));
            }
            None => {
                self.remove(date, user_id);
            }
        }
    }

    /// Applies one action to every date for `user_id` and returns the value
    /// each date held before, so the caller can undo exactly this change.
    pub fn apply(
        &mut self,
        dates: &BTreeSet<NaiveDate>,
        user_id: &str,
        action: VoteAction,
    ) -> BTreeMap<NaiveDate, Option<VoteKind>> {
        let mut previous = BTreeMap::new();
        for date in dates {
            let before = self.remove(*date, user_id);
            if let VoteAction::Set(kind) = action {
                self.insert(Vote::new(*date, user_id, kind));
            }
            previous.insert(*date, before);
        }
        previous
    }

    pub fn votes_on(&self, date: NaiveDate) -> impl Iterator<Item = (&str, VoteKind)> + '_ {
        self.by_date
            .get(&date)
            .into_iter()
            .flat_map(|users| users.iter().map(|(user, kind)| (user.as_str(), *kind)))
    }

    pub fn dates_in(
        &self,
        range: RangeInclusive<NaiveDate>,
    ) -> impl Iterator<Item = (NaiveDate, &BTreeMap<String, VoteKind>)> + '_ {
        self.by_date.range(range).map(|(date, users)| (*date, users))
    }

    pub fn dates(&self) -> impl Iterator<Item = (NaiveDate, &BTreeMap<String, VoteKind>)> + '_ {
        self.by_date.iter().map(|(date, users)| (*date, users))
    }

    pub fn iter(&self) -> impl Iterator<Item = Vote> + '_ {
        self.by_date.iter().flat_map(|(date, users)| {
            users
                .iter()
                .map(move |(user, kind)| Vote::new(*date, user.clone(), *kind))
        })
    }

    pub fn to_votes(&self) -> Vec<Vote> {
        self.iter().collect()
    }

    pub fn votes_for_user(&self, user_id: &str) -> Vec<Vote> {
        self.iter().filter(|vote| vote.user_id == user_id).collect()
    }
}
