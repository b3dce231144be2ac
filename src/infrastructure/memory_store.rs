use crate::domain::models::{Participant, Trip, Vote};
use crate::domain::vote_set::VoteSet;
use crate::infrastructure::change_feed::{ChangeEvent, ChangeFeed, ChangeKind, ChangeTable, Subscription};
use crate::infrastructure::error::InfraError;
use crate::infrastructure::trip_store::TripStore;
use async_trait::async_trait;
use chrono::NaiveDate;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;

#[derive(Debug, Clone)]
struct TripRecord {
    trip: Trip,
    participants: Vec<Participant>,
    votes: VoteSet,
}

type Subscribers = Arc<Mutex<HashMap<u64, (String, mpsc::UnboundedSender<ChangeEvent>)>>>;

/// Process-local store with push notifications, used for demo sessions that
/// never leave the device and as the shared backend in tests.
#[derive(Debug, Default)]
pub struct InMemoryTripStore {
    trips: Mutex<HashMap<String, TripRecord>>,
    subscribers: Subscribers,
    next_subscription: AtomicU64,
}

impl InMemoryTripStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_trip(&self, trip: Trip) -> Result<(), InfraError> {
        trip.validate().map_err(InfraError::InvalidConfig)?;
        let mut trips = self.lock_trips()?;
        trips.insert(
            trip.id.clone(),
            TripRecord {
                trip,
                participants: Vec::new(),
                votes: VoteSet::new(),
            },
        );
        Ok(())
    }

    /// Adds or renames a participant, keeping join order.
    pub fn upsert_participant(&self, trip_id: &str, participant: Participant) -> Result<(), InfraError> {
        participant.validate().map_err(InfraError::InvalidConfig)?;
        let kind = {
            let mut trips = self.lock_trips()?;
            let record = Self::record_mut(&mut trips, trip_id)?;
            match record
                .participants
                .iter_mut()
                .find(|existing| existing.id == participant.id)
            {
                Some(existing) => {
                    existing.display_name = participant.display_name.clone();
                    ChangeKind::Update
                }
                None => {
                    record.participants.push(participant.clone());
                    ChangeKind::Insert
                }
            }
        };
        self.publish(trip_id, ChangeTable::Participants, kind, Some(participant.id));
        Ok(())
    }

    pub fn subscriber_count(&self, trip_id: &str) -> usize {
        self.subscribers
            .lock()
            .map(|subscribers| subscribers.values().filter(|(id, _)| id == trip_id).count())
            .unwrap_or(0)
    }

    fn lock_trips(&self) -> Result<MutexGuard<'_, HashMap<String, TripRecord>>, InfraError> {
        self.trips
            .lock()
            .map_err(|error| InfraError::LockPoisoned(format!("trip store lock poisoned: {error}")))
    }

    fn record_mut<'a>(
        trips: &'a mut HashMap<String, TripRecord>,
        trip_id: &str,
    ) -> Result<&'a mut TripRecord, InfraError> {
        trips
            .get_mut(trip_id)
            .ok_or_else(|| InfraError::NotFound(format!("trip {trip_id}")))
    }

    fn read<T>(&self, trip_id: &str, read: impl FnOnce(&TripRecord) -> T) -> Result<T, InfraError> {
        let trips = self.lock_trips()?;
        trips
            .get(trip_id)
            .map(read)
            .ok_or_else(|| InfraError::NotFound(format!("trip {trip_id}")))
    }

    fn publish(&self, trip_id: &str, table: ChangeTable, kind: ChangeKind, actor: Option<String>) {
        let Ok(mut subscribers) = self.subscribers.lock() else {
            return;
        };
        subscribers.retain(|_, (subscribed_trip, sender)| {
            if subscribed_trip.as_str() != trip_id {
                return true;
            }
            sender
                .send(ChangeEvent {
                    trip_id: trip_id.to_string(),
                    table,
                    kind,
                    actor: actor.clone(),
                })
                .is_ok()
        });
    }
}

#[async_trait]
impl TripStore for InMemoryTripStore {
    async fn get_trip(&self, trip_id: &str) -> Result<Trip, InfraError> {
        self.read(trip_id, |record| record.trip.clone())
    }

    async fn get_votes(&self, trip_id: &str) -> Result<Vec<Vote>, InfraError> {
        self.read(trip_id, |record| record.votes.to_votes())
    }

    async fn upsert_votes(&self, trip_id: &str, votes: &[Vote]) -> Result<(), InfraError> {
        for vote in votes {
            vote.validate().map_err(InfraError::InvalidConfig)?;
        }
        let mut changes = Vec::with_capacity(votes.len());
        {
            let mut trips = self.lock_trips()?;
            let record = Self::record_mut(&mut trips, trip_id)?;
            for vote in votes {
                let kind = match record.votes.insert(vote.clone()) {
                    Some(_) => ChangeKind::Update,
                    None => ChangeKind::Insert,
                };
                changes.push((kind, vote.user_id.clone()));
            }
        }
        for (kind, user_id) in changes {
            self.publish(trip_id, ChangeTable::Votes, kind, Some(user_id));
        }
        Ok(())
    }

    async fn delete_votes(
        &self,
        trip_id: &str,
        dates: &[NaiveDate],
        user_id: &str,
    ) -> Result<(), InfraError> {
        let removed = {
            let mut trips = self.lock_trips()?;
            let record = Self::record_mut(&mut trips, trip_id)?;
            dates
                .iter()
                .filter(|date| record.votes.remove(**date, user_id).is_some())
                .count()
        };
        for _ in 0..removed {
            self.publish(trip_id, ChangeTable::Votes, ChangeKind::Delete, Some(user_id.to_string()));
        }
        Ok(())
    }

    async fn get_participants(&self, trip_id: &str) -> Result<Vec<Participant>, InfraError> {
        self.read(trip_id, |record| record.participants.clone())
    }

    async fn update_destination(&self, trip_id: &str, destination: &str) -> Result<(), InfraError> {
        {
            let mut trips = self.lock_trips()?;
            let record = Self::record_mut(&mut trips, trip_id)?;
            record.trip.destination = destination.to_string();
        }
        self.publish(trip_id, ChangeTable::Trip, ChangeKind::Update, None);
        Ok(())
    }
}

#[async_trait]
impl ChangeFeed for InMemoryTripStore {
    async fn subscribe(&self, trip_id: &str) -> Result<Subscription, InfraError> {
        self.read(trip_id, |_| ())?;
        let (sender, receiver) = mpsc::unbounded_channel();
        let id = self.next_subscription.fetch_add(1, Ordering::Relaxed);
        self.subscribers
            .lock()
            .map_err(|error| InfraError::LockPoisoned(format!("subscriber lock poisoned: {error}")))?
            .insert(id, (trip_id.to_string(), sender));

        let subscribers = Arc::clone(&self.subscribers);
        Ok(Subscription::new(receiver, move || {
            if let Ok(mut subscribers) = subscribers.lock() {
                subscribers.remove(&id);
            }
        }))
    }
}
