//! Change feed for the hosted backend.
//!
//! The trip's rows are re-read on a short interval and every row that differs
//! from the previous read is reported as its own event, carrying the user the
//! row belongs to.

use crate::domain::models::{Trip, VoteKind};
use crate::infrastructure::change_feed::{
    ChangeEvent, ChangeFeed, ChangeKind, ChangeTable, Subscription,
};
use crate::infrastructure::error::InfraError;
use crate::infrastructure::postgrest_store::PostgrestTripStore;
use crate::infrastructure::trip_store::TripStore;
use async_trait::async_trait;
use chrono::NaiveDate;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct PostgrestChangeFeed {
    store: PostgrestTripStore,
    interval: Duration,
}

impl PostgrestChangeFeed {
    pub fn new(store: PostgrestTripStore, interval: Duration) -> Self {
        Self { store, interval }
    }
}

#[async_trait]
impl ChangeFeed for PostgrestChangeFeed {
    async fn subscribe(&self, trip_id: &str) -> Result<Subscription, InfraError> {
        let baseline = TripRows::fetch(&self.store, trip_id)
            .await
            .map_err(|error| InfraError::Subscription(format!("cannot watch trip {trip_id}: {error}")))?;

        let (sender, receiver) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        tokio::spawn(watch_rows(
            self.store.clone(),
            trip_id.to_string(),
            self.interval,
            baseline,
            sender,
            cancel.clone(),
        ));
        debug!(%trip_id, interval_ms = self.interval.as_millis() as u64, "watching trip rows");
        Ok(Subscription::new(receiver, move || cancel.cancel()))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct TripRows {
    trip: Option<Trip>,
    votes: BTreeMap<(NaiveDate, String), VoteKind>,
    participants: BTreeMap<String, String>,
}

impl TripRows {
    async fn fetch(store: &PostgrestTripStore, trip_id: &str) -> Result<Self, InfraError> {
        let (trip, votes, participants) = tokio::try_join!(
            store.get_trip(trip_id),
            store.get_votes(trip_id),
            store.get_participants(trip_id),
        )?;
        Ok(Self {
            trip: Some(trip),
            votes: votes
                .into_iter()
                .map(|vote| ((vote.date, vote.user_id), vote.kind))
                .collect(),
            participants: participants
                .into_iter()
                .map(|participant| (participant.id, participant.display_name))
                .collect(),
        })
    }

    fn changes_since(&self, previous: &Self, trip_id: &str) -> Vec<ChangeEvent> {
        let event = |table, kind, actor: Option<&String>| ChangeEvent {
            trip_id: trip_id.to_string(),
            table,
            kind,
            actor: actor.cloned(),
        };

        let mut events = Vec::new();
        if self.trip != previous.trip {
            events.push(event(ChangeTable::Trip, ChangeKind::Update, None));
        }
        for ((_, user_id), kind) in diff_rows(&previous.votes, &self.votes) {
            events.push(event(ChangeTable::Votes, kind, Some(user_id)));
        }
        for (user_id, kind) in diff_rows(&previous.participants, &self.participants) {
            events.push(event(ChangeTable::Participants, kind, Some(user_id)));
        }
        events
    }
}

fn diff_rows<'a, K: Ord, V: PartialEq>(
    previous: &'a BTreeMap<K, V>,
    current: &'a BTreeMap<K, V>,
) -> Vec<(&'a K, ChangeKind)> {
    let mut changes: Vec<(&K, ChangeKind)> = current
        .iter()
        .filter_map(|(key, value)| match previous.get(key) {
            None => Some((key, ChangeKind::Insert)),
            Some(before) if before != value => Some((key, ChangeKind::Update)),
            Some(_) => None,
        })
        .collect();
    changes.extend(
        previous
            .keys()
            .filter(|key| !current.contains_key(*key))
            .map(|key| (key, ChangeKind::Delete)),
    );
    changes
}

async fn watch_rows(
    store: PostgrestTripStore,
    trip_id: String,
    interval: Duration,
    mut baseline: TripRows,
    sender: mpsc::UnboundedSender<ChangeEvent>,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = sender.closed() => break,
            _ = ticker.tick() => {}
        }
        let fetched = tokio::select! {
            _ = cancel.cancelled() => break,
            fetched = TripRows::fetch(&store, &trip_id) => fetched,
        };
        let current = match fetched {
            Ok(current) => current,
            Err(error) => {
                warn!(%trip_id, %error, "row watch read failed");
                continue;
            }
        };
        for event in current.changes_since(&baseline, &trip_id) {
            if sender.send(event).is_err() {
                return;
            }
        }
        baseline = current;
    }
    debug!(%trip_id, "row watch stopped");
}
