use crate::domain::models::{Participant, Trip, Vote, iso_key};
use crate::infrastructure::error::InfraError;
use crate::infrastructure::record_mapper::{
    RawParticipantRow, RawTripRow, RawVoteRow, decode_participants, decode_trip, decode_votes,
    encode_vote_row,
};
use crate::infrastructure::trip_store::TripStore;
use async_trait::async_trait;
use chrono::NaiveDate;
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use tracing::debug;
use url::Url;

const TRIPS_TABLE: &str = "trips";
const PARTICIPANTS_TABLE: &str = "trip_users";
const VOTES_TABLE: &str = "date_votes";
const VOTE_CONFLICT_COLUMNS: &str = "trip_id,date,user_id";

/// `TripStore` over a PostgREST-style HTTP API (`/rest/v1/<table>`).
#[derive(Debug, Clone)]
pub struct PostgrestTripStore {
    client: Client,
    base_url: Url,
    api_key: String,
}

impl PostgrestTripStore {
    pub fn new(base_url: &str, api_key: &str) -> Result<Self, InfraError> {
        Self::ensure_non_empty(base_url, "base url")?;
        Self::ensure_non_empty(api_key, "api key")?;
        let base_url = Url::parse(base_url.trim())
            .map_err(|error| InfraError::InvalidConfig(format!("invalid backend base url: {error}")))?;
        if base_url.cannot_be_a_base() {
            return Err(InfraError::InvalidConfig(
                "backend base url cannot be a base".to_string(),
            ));
        }
        Ok(Self {
            client: Client::new(),
            base_url,
            api_key: api_key.trim().to_string(),
        })
    }

    fn ensure_non_empty(value: &str, field: &str) -> Result<(), InfraError> {
        if value.trim().is_empty() {
            return Err(InfraError::InvalidConfig(format!("{field} must not be empty")));
        }
        Ok(())
    }

    fn table_endpoint(&self, table: &str) -> Result<Url, InfraError> {
        let mut url = self.base_url.clone();
        {
            let mut segments = url.path_segments_mut().map_err(|_| {
                InfraError::InvalidConfig("backend base url cannot be a base".to_string())
            })?;
            segments.pop_if_empty().push("rest").push("v1").push(table);
        }
        Ok(url)
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        request
            .header("apikey", &self.api_key)
            .bearer_auth(&self.api_key)
    }

    async fn send(&self, request: RequestBuilder, action: &str) -> Result<String, InfraError> {
        let response = self
            .authorized(request)
            .send()
            .await
            .map_err(|error| InfraError::Http(format!("network error while {action}: {error}")))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|error| InfraError::Http(format!("failed reading response while {action}: {error}")))?;

        if !status.is_success() {
            return Err(InfraError::Rejected {
                status: status.as_u16(),
                body,
            });
        }
        Ok(body)
    }

    async fn fetch_rows<T: DeserializeOwned>(
        &self,
        table: &str,
        query: &[(&str, String)],
        action: &str,
    ) -> Result<Vec<T>, InfraError> {
        let endpoint = self.table_endpoint(table)?;
        let body = self
            .send(self.client.get(endpoint).query(query), action)
            .await?;
        serde_json::from_str(&body).map_err(|error| {
            InfraError::Http(format!("invalid {table} payload: {error}; body={body}"))
        })
    }
}

fn eq(value: &str) -> String {
    format!("eq.{value}")
}

#[async_trait]
impl TripStore for PostgrestTripStore {
    async fn get_trip(&self, trip_id: &str) -> Result<Trip, InfraError> {
        Self::ensure_non_empty(trip_id, "trip id")?;
        let rows: Vec<RawTripRow> = self
            .fetch_rows(
                TRIPS_TABLE,
                &[
                    ("select", "id,destination,start_date,end_date".to_string()),
                    ("id", eq(trip_id)),
                ],
                "loading trip",
            )
            .await?;
        let row = rows
            .first()
            .ok_or_else(|| InfraError::NotFound(format!("trip {trip_id}")))?;
        decode_trip(row).map_err(|reason| InfraError::Http(format!("invalid trip row: {reason}")))
    }

    async fn get_votes(&self, trip_id: &str) -> Result<Vec<Vote>, InfraError> {
        Self::ensure_non_empty(trip_id, "trip id")?;
        let rows: Vec<RawVoteRow> = self
            .fetch_rows(
                VOTES_TABLE,
                &[
                    ("select", "date,user_id,vote_type".to_string()),
                    ("trip_id", eq(trip_id)),
                ],
                "loading votes",
            )
            .await?;
        Ok(decode_votes(&rows))
    }

    async fn upsert_votes(&self, trip_id: &str, votes: &[Vote]) -> Result<(), InfraError> {
        Self::ensure_non_empty(trip_id, "trip id")?;
        if votes.is_empty() {
            return Ok(());
        }
        let payload: Vec<_> = votes.iter().map(|vote| encode_vote_row(trip_id, vote)).collect();
        let endpoint = self.table_endpoint(VOTES_TABLE)?;
        let request = self
            .client
            .post(endpoint)
            .query(&[("on_conflict", VOTE_CONFLICT_COLUMNS)])
            .header("Prefer", "resolution=merge-duplicates,return=minimal")
            .json(&payload);
        self.send(request, "upserting votes").await?;
        debug!(trip_id, rows = votes.len(), "upserted votes");
        Ok(())
    }

    async fn delete_votes(
        &self,
        trip_id: &str,
        dates: &[NaiveDate],
        user_id: &str,
    ) -> Result<(), InfraError> {
        Self::ensure_non_empty(trip_id, "trip id")?;
        Self::ensure_non_empty(user_id, "user id")?;
        if dates.is_empty() {
            return Ok(());
        }
        let dates = dates.iter().map(|date| iso_key(*date)).collect::<Vec<_>>().join(",");
        let endpoint = self.table_endpoint(VOTES_TABLE)?;
        let request = self.client.delete(endpoint).query(&[
            ("trip_id", eq(trip_id)),
            ("user_id", eq(user_id)),
            ("date", format!("in.({dates})")),
        ]);
        self.send(request, "deleting votes").await?;
        Ok(())
    }

    async fn get_participants(&self, trip_id: &str) -> Result<Vec<Participant>, InfraError> {
        Self::ensure_non_empty(trip_id, "trip id")?;
        let rows: Vec<RawParticipantRow> = self
            .fetch_rows(
                PARTICIPANTS_TABLE,
                &[
                    ("select", "user_id,name".to_string()),
                    ("trip_id", eq(trip_id)),
                    ("order", "created_at.asc".to_string()),
                ],
                "loading participants",
            )
            .await?;
        Ok(decode_participants(&rows))
    }

    async fn update_destination(&self, trip_id: &str, destination: &str) -> Result<(), InfraError> {
        Self::ensure_non_empty(trip_id, "trip id")?;
        let endpoint = self.table_endpoint(TRIPS_TABLE)?;
        let request = self
            .client
            .patch(endpoint)
            .query(&[("id", eq(trip_id))])
            .json(&serde_json::json!({ "destination": destination }));
        self.send(request, "updating destination").await?;
        Ok(())
    }
}
