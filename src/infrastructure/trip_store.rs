use crate::domain::models::{Participant, Trip, Vote};
use crate::infrastructure::error::InfraError;
use async_trait::async_trait;
use chrono::NaiveDate;

/// Remote source of truth for one or more trips.
#[async_trait]
pub trait TripStore: Send + Sync {
    async fn get_trip(&self, trip_id: &str) -> Result<Trip, InfraError>;

    async fn get_votes(&self, trip_id: &str) -> Result<Vec<Vote>, InfraError>;

    /// Inserts or replaces rows keyed by (trip, date, user).
    async fn upsert_votes(&self, trip_id: &str, votes: &[Vote]) -> Result<(), InfraError>;

    async fn delete_votes(
        &self,
        trip_id: &str,
        dates: &[NaiveDate],
        user_id: &str,
    ) -> Result<(), InfraError>;

    async fn get_participants(&self, trip_id: &str) -> Result<Vec<Participant>, InfraError>;

    async fn update_destination(&self, trip_id: &str, destination: &str) -> Result<(), InfraError>;
}
