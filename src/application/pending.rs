use crate::domain::models::VoteKind;
use crate::domain::vote_set::VoteSet;
use chrono::NaiveDate;
use std::collections::{BTreeMap, BTreeSet};

/// One optimistic run whose remote write has not resolved yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingMutation {
    pub run_id: u64,
    pub user_id: String,
    pub affected_dates: BTreeSet<NaiveDate>,
    /// Value each (date, user) held right before this run touched it.
    pub previous: BTreeMap<NaiveDate, Option<VoteKind>>,
}

/// In-flight runs plus, per (date, user), the newest run that touched it.
/// A run only ever restores entries it still owns.
#[derive(Debug, Clone, Default)]
pub struct PendingLedger {
    runs: BTreeMap<u64, PendingMutation>,
    owners: BTreeMap<(NaiveDate, String), u64>,
}

impl PendingLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.runs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }

    pub fn get(&self, run_id: u64) -> Option<&PendingMutation> {
        self.runs.get(&run_id)
    }

    pub fn begin(&mut self, mutation: PendingMutation) {
        for date in &mutation.affected_dates {
            self.owners
                .insert((*date, mutation.user_id.clone()), mutation.run_id);
        }
        self.runs.insert(mutation.run_id, mutation);
    }

    /// Drops the record after a confirmed write.
    pub fn complete(&mut self, run_id: u64) -> Option<PendingMutation> {
        let mutation = self.runs.remove(&run_id)?;
        self.release(&mutation);
        Some(mutation)
    }

    /// Restores the run's own snapshot on `votes` for every entry no newer
    /// run has touched, returning the restored dates.
    pub fn rollback(&mut self, run_id: u64, votes: &mut VoteSet) -> Vec<NaiveDate> {
        let Some(mutation) = self.runs.remove(&run_id) else {
            return Vec::new();
        };
        let mut restored = Vec::new();
        for (date, previous) in &mutation.previous {
            if self.owner_of(*date, &mutation.user_id) == Some(run_id) {
                votes.put(*date, &mutation.user_id, *previous);
                restored.push(*date);
            }
        }
        self.release(&mutation);
        restored
    }

    pub fn owner_of(&self, date: NaiveDate, user_id: &str) -> Option<u64> {
        self.owners.get(&(date, user_id.to_string())).copied()
    }

    /// Entries whose local value must survive an authoritative refresh.
    pub fn protected_keys(&self) -> impl Iterator<Item = (NaiveDate, &str)> + '_ {
        self.owners.keys().map(|(date, user)| (*date, user.as_str()))
    }

    fn release(&mut self, mutation: &PendingMutation) {
        for date in &mutation.affected_dates {
            let key = (*date, mutation.user_id.clone());
            if self.owners.get(&key) == Some(&mutation.run_id) {
                self.owners.remove(&key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::{Vote, VoteAction};

    fn date(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 7, day).expect("valid date")
    }

    fn run(
        ledger: &mut PendingLedger,
        votes: &mut VoteSet,
        run_id: u64,
        dates: &[NaiveDate],
        action: VoteAction,
    ) {
        let affected: BTreeSet<_> = dates.iter().copied().collect();
        let previous = votes.apply(&affected, "me", action);
        ledger.begin(PendingMutation {
            run_id,
            user_id: "me".to_string(),
            affected_dates: affected,
            previous,
        });
    }

    #[test]
    fn rollback_restores_own_snapshot() {
        let mut votes = VoteSet::new();
        let mut ledger = PendingLedger::new();
        run(&mut ledger, &mut votes, 1, &[date(1), date(2)], VoteAction::Set(VoteKind::Available));
        assert_eq!(votes.len(), 2);

        let restored = ledger.rollback(1, &mut votes);
        assert_eq!(restored, vec![date(1), date(2)]);
        assert!(votes.is_empty());
        assert!(ledger.is_empty());
        assert_eq!(ledger.protected_keys().count(), 0);
    }

    #[test]
    fn older_rollback_leaves_newer_run_dates_alone() {
        let mut votes = VoteSet::new();
        let mut ledger = PendingLedger::new();
        run(&mut ledger, &mut votes, 1, &[date(1), date(2)], VoteAction::Set(VoteKind::Available));
        run(&mut ledger, &mut votes, 2, &[date(2), date(3)], VoteAction::Set(VoteKind::Unavailable));

        let restored = ledger.rollback(1, &mut votes);
        assert_eq!(restored, vec![date(1)]);
        assert_eq!(votes.get(date(1), "me"), None);
        assert_eq!(votes.get(date(2), "me"), Some(VoteKind::Unavailable));
        assert_eq!(ledger.owner_of(date(2), "me"), Some(2));
    }

    #[test]
    fn completing_older_run_keeps_newer_ownership() {
        let mut votes = VoteSet::from_votes([Vote::new(date(1), "me", VoteKind::Unavailable)]);
        let mut ledger = PendingLedger::new();
        run(&mut ledger, &mut votes, 1, &[date(1)], VoteAction::Clear);
        run(&mut ledger, &mut votes, 2, &[date(1)], VoteAction::Set(VoteKind::Available));

        assert!(ledger.complete(1).is_some());
        assert_eq!(ledger.owner_of(date(1), "me"), Some(2));
        assert_eq!(ledger.len(), 1);

        ledger.rollback(2, &mut votes);
        assert_eq!(votes.get(date(1), "me"), None);
    }
}
