use crate::infrastructure::change_feed::{ChangeEvent, ChangeTable};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Counts local writes that are still travelling to the backend.
#[derive(Debug, Clone, Default)]
pub struct InFlight {
    count: Arc<AtomicUsize>,
}

impl InFlight {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(&self) -> InFlightTicket {
        self.count.fetch_add(1, Ordering::SeqCst);
        InFlightTicket {
            count: Arc::clone(&self.count),
        }
    }

    pub fn is_active(&self) -> bool {
        self.count.load(Ordering::SeqCst) > 0
    }
}

/// Held for the duration of one write; dropping it ends the write.
#[derive(Debug)]
pub struct InFlightTicket {
    count: Arc<AtomicUsize>,
}

impl Drop for InFlightTicket {
    fn drop(&mut self) {
        self.count.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Decides whether a change notification was caused by this instance.
#[derive(Debug, Clone, Default)]
pub struct EchoGuard {
    votes: InFlight,
    destination: InFlight,
}

impl EchoGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn votes(&self) -> &InFlight {
        &self.votes
    }

    pub fn destination(&self) -> &InFlight {
        &self.destination
    }

    pub fn is_self_echo(&self, event: &ChangeEvent, local_user: Option<&str>) -> bool {
        match event.table {
            ChangeTable::Votes => match (event.actor.as_deref(), local_user) {
                (Some(actor), Some(user)) => actor == user,
                // Anonymous notifications during our own write are assumed to be ours;
                // the backstop poll picks up anything else.
                (None, _) => self.votes.is_active(),
                (Some(_), None) => false,
            },
            ChangeTable::Trip => self.destination.is_active(),
            ChangeTable::Participants => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::change_feed::ChangeKind;

    fn event(table: ChangeTable, actor: Option<&str>) -> ChangeEvent {
        ChangeEvent {
            trip_id: "trip-1".to_string(),
            table,
            kind: ChangeKind::Update,
            actor: actor.map(ToOwned::to_owned),
        }
    }

    #[test]
    fn tickets_release_on_drop() {
        let in_flight = InFlight::new();
        let first = in_flight.begin();
        let second = in_flight.begin();
        drop(first);
        assert!(in_flight.is_active());
        drop(second);
        assert!(!in_flight.is_active());
    }

    #[test]
    fn own_vote_notifications_are_echoes() {
        let guard = EchoGuard::new();
        assert!(guard.is_self_echo(&event(ChangeTable::Votes, Some("me")), Some("me")));
        assert!(!guard.is_self_echo(&event(ChangeTable::Votes, Some("you")), Some("me")));
        assert!(!guard.is_self_echo(&event(ChangeTable::Votes, Some("me")), None));
    }

    #[test]
    fn anonymous_vote_notifications_depend_on_in_flight_writes() {
        let guard = EchoGuard::new();
        let anonymous = event(ChangeTable::Votes, None);
        assert!(!guard.is_self_echo(&anonymous, Some("me")));
        let _ticket = guard.votes().begin();
        assert!(guard.is_self_echo(&anonymous, Some("me")));
    }

    #[test]
    fn trip_notifications_are_echoes_while_destination_write_runs() {
        let guard = EchoGuard::new();
        let trip = event(ChangeTable::Trip, None);
        assert!(!guard.is_self_echo(&trip, Some("me")));
        {
            let _ticket = guard.destination().begin();
            assert!(guard.is_self_echo(&trip, Some("me")));
        }
        assert!(!guard.is_self_echo(&trip, Some("me")));
        assert!(!guard.is_self_echo(&event(ChangeTable::Participants, Some("me")), Some("me")));
    }
}
