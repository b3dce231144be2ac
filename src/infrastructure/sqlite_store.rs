use crate::domain::models::{Participant, Trip, Vote, iso_key};
use crate::infrastructure::error::InfraError;
use crate::infrastructure::record_mapper::{
    RawParticipantRow, RawTripRow, RawVoteRow, decode_participants, decode_trip, decode_votes,
};
use crate::infrastructure::storage::open_connection;
use crate::infrastructure::trip_store::TripStore;
use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use std::path::{Path, PathBuf};

/// Trips kept on this device only (demo sessions); no push delivery.
#[derive(Debug, Clone)]
pub struct SqliteTripStore {
    db_path: PathBuf,
}

impl SqliteTripStore {
    pub fn new(db_path: impl AsRef<Path>) -> Self {
        Self {
            db_path: db_path.as_ref().to_path_buf(),
        }
    }

    fn connect(&self) -> Result<Connection, InfraError> {
        open_connection(&self.db_path)
    }

    pub fn create_trip(&self, trip: &Trip) -> Result<(), InfraError> {
        trip.validate().map_err(InfraError::InvalidConfig)?;
        let now = Utc::now().to_rfc3339();
        let connection = self.connect()?;
        connection.execute(
            "INSERT INTO trips (id, destination, start_date, end_date, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)
             ON CONFLICT(id) DO UPDATE SET
               destination = excluded.destination,
               start_date = excluded.start_date,
               end_date = excluded.end_date,
               updated_at = excluded.updated_at",
            params![
                trip.id,
                trip.destination,
                trip.window.map(|window| iso_key(window.start)),
                trip.window.map(|window| iso_key(window.end)),
                now
            ],
        )?;
        Ok(())
    }

    /// Adds a participant or renames an existing one without changing join order.
    pub fn upsert_participant(&self, trip_id: &str, participant: &Participant) -> Result<(), InfraError> {
        participant.validate().map_err(InfraError::InvalidConfig)?;
        let connection = self.connect()?;
        self.ensure_trip(&connection, trip_id)?;
        connection.execute(
            "INSERT INTO trip_users (trip_id, user_id, name, created_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(trip_id, user_id) DO UPDATE SET name = excluded.name",
            params![trip_id, participant.id, participant.display_name, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    fn ensure_trip(&self, connection: &Connection, trip_id: &str) -> Result<(), InfraError> {
        let exists: Option<i64> = connection
            .query_row("SELECT 1 FROM trips WHERE id = ?1", params![trip_id], |row| row.get(0))
            .optional()?;
        if exists.is_none() {
            return Err(InfraError::NotFound(format!("trip {trip_id}")));
        }
        Ok(())
    }
}

#[async_trait]
impl TripStore for SqliteTripStore {
    async fn get_trip(&self, trip_id: &str) -> Result<Trip, InfraError> {
        let connection = self.connect()?;
        let row = connection
            .query_row(
                "SELECT id, destination, start_date, end_date FROM trips WHERE id = ?1",
                params![trip_id],
                |row| {
                    Ok(RawTripRow {
                        id: row.get(0)?,
                        destination: row.get(1)?,
                        start_date: row.get(2)?,
                        end_date: row.get(3)?,
                    })
                },
            )
            .optional()?
            .ok_or_else(|| InfraError::NotFound(format!("trip {trip_id}")))?;
        decode_trip(&row).map_err(InfraError::InvalidConfig)
    }

    async fn get_votes(&self, trip_id: &str) -> Result<Vec<Vote>, InfraError> {
        let connection = self.connect()?;
        self.ensure_trip(&connection, trip_id)?;
        let mut statement = connection.prepare(
            "SELECT date, user_id, vote_type FROM date_votes WHERE trip_id = ?1 ORDER BY date, user_id",
        )?;
        let rows = statement
            .query_map(params![trip_id], |row| {
                Ok(RawVoteRow {
                    date: row.get(0)?,
                    user_id: row.get(1)?,
                    vote_type: row.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(decode_votes(&rows))
    }

    async fn upsert_votes(&self, trip_id: &str, votes: &[Vote]) -> Result<(), InfraError> {
        for vote in votes {
            vote.validate().map_err(InfraError::InvalidConfig)?;
        }
        let mut connection = self.connect()?;
        self.ensure_trip(&connection, trip_id)?;
        let now = Utc::now().to_rfc3339();
        let transaction = connection.transaction()?;
        for vote in votes {
            transaction.execute(
                "INSERT INTO date_votes (trip_id, date, user_id, vote_type, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(trip_id, date, user_id) DO UPDATE SET
                   vote_type = excluded.vote_type,
                   created_at = excluded.created_at",
                params![trip_id, iso_key(vote.date), vote.user_id, vote.kind.as_str(), now],
            )?;
        }
        transaction.commit()?;
        Ok(())
    }

    async fn delete_votes(
        &self,
        trip_id: &str,
        dates: &[NaiveDate],
        user_id: &str,
    ) -> Result<(), InfraError> {
        let mut connection = self.connect()?;
        self.ensure_trip(&connection, trip_id)?;
        let transaction = connection.transaction()?;
        for date in dates {
            transaction.execute(
                "DELETE FROM date_votes WHERE trip_id = ?1 AND date = ?2 AND user_id = ?3",
                params![trip_id, iso_key(*date), user_id],
            )?;
        }
        transaction.commit()?;
        Ok(())
    }

    async fn get_participants(&self, trip_id: &str) -> Result<Vec<Participant>, InfraError> {
        let connection = self.connect()?;
        self.ensure_trip(&connection, trip_id)?;
        let mut statement = connection.prepare(
            "SELECT user_id, name FROM trip_users WHERE trip_id = ?1 ORDER BY created_at ASC, rowid ASC",
        )?;
        let rows = statement
            .query_map(params![trip_id], |row| {
                Ok(RawParticipantRow {
                    user_id: row.get(0)?,
                    name: row.get(1)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(decode_participants(&rows))
    }

    async fn update_destination(&self, trip_id: &str, destination: &str) -> Result<(), InfraError> {
        let connection = self.connect()?;
        let updated = connection.execute(
            "UPDATE trips SET destination = ?2, updated_at = ?3 WHERE id = ?1",
            params![trip_id, destination, Utc::now().to_rfc3339()],
        )?;
        if updated == 0 {
            return Err(InfraError::NotFound(format!("trip {trip_id}")));
        }
        Ok(())
    }
}
