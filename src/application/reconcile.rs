use crate::application::pending::PendingLedger;
use crate::domain::models::{Participant, Vote};
use crate::domain::vote_set::VoteSet;

/// Replaces local votes with the authoritative set while keeping every
/// entry an in-flight local run still owns.
pub fn merge_authoritative(remote: Vec<Vote>, local: &VoteSet, pending: &PendingLedger) -> VoteSet {
    let mut merged = VoteSet::from_votes(remote);
    for (date, user_id) in pending.protected_keys() {
        merged.put(date, user_id, local.get(date, user_id));
    }
    merged
}

/// Participant lists compare by id and name in join order.
pub fn participants_differ(current: &[Participant], incoming: &[Participant]) -> bool {
    current != incoming
}
