use crate::domain::models::{Participant, Trip, TripWindow, Vote, VoteKind, iso_key, parse_iso_date};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// A `date_votes` row as the backend sends it; every field may be missing or
/// malformed until it passes [`decode_vote`].
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawVoteRow {
    #[serde(default)]
    pub date: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default, alias = "type")]
    pub vote_type: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawParticipantRow {
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawTripRow {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub destination: Option<String>,
    #[serde(default)]
    pub start_date: Option<String>,
    #[serde(default)]
    pub end_date: Option<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct VoteRowPayload<'a> {
    pub trip_id: &'a str,
    pub date: String,
    pub user_id: &'a str,
    pub vote_type: &'static str,
}

pub fn encode_vote_row<'a>(trip_id: &'a str, vote: &'a Vote) -> VoteRowPayload<'a> {
    VoteRowPayload {
        trip_id,
        date: iso_key(vote.date),
        user_id: &vote.user_id,
        vote_type: vote.kind.as_str(),
    }
}

pub fn decode_vote(row: &RawVoteRow) -> Result<Vote, String> {
    let date = row
        .date
        .as_deref()
        .ok_or_else(|| "vote row is missing date".to_string())?;
    // Timestamp-typed columns arrive as "YYYY-MM-DDT..."; only the calendar part counts.
    let date = parse_iso_date(date.get(..10).unwrap_or(date))?;
    let user_id = row
        .user_id
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| "vote row is missing user_id".to_string())?;
    let kind = row
        .vote_type
        .as_deref()
        .and_then(VoteKind::parse)
        .ok_or_else(|| format!("vote row has unknown vote_type {:?}", row.vote_type))?;
    let vote = Vote::new(date, user_id, kind);
    vote.validate()?;
    Ok(vote)
}

/// Keeps well-formed rows and drops the rest with a warning.
pub fn decode_votes(rows: &[RawVoteRow]) -> Vec<Vote> {
    rows.iter()
        .filter_map(|row| match decode_vote(row) {
            Ok(vote) => Some(vote),
            Err(reason) => {
                warn!(%reason, "dropping malformed vote row");
                None
            }
        })
        .collect()
}

pub fn decode_participants(rows: &[RawParticipantRow]) -> Vec<Participant> {
    rows.iter()
        .filter_map(|row| {
            let id = row.user_id.as_deref().map(str::trim).unwrap_or_default();
            let name = row.name.as_deref().map(str::trim).unwrap_or_default();
            let participant = Participant::new(id, name);
            match participant.validate() {
                Ok(()) => Some(participant),
                Err(reason) => {
                    warn!(%reason, "dropping malformed participant row");
                    None
                }
            }
        })
        .collect()
}

pub fn decode_trip(row: &RawTripRow) -> Result<Trip, String> {
    let id = row
        .id
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| "trip row is missing id".to_string())?;
    let start = row.start_date.as_deref().map(parse_iso_date).transpose()?;
    let end = row.end_date.as_deref().map(parse_iso_date).transpose()?;
    let window = match (start, end) {
        (Some(start), Some(end)) => Some(TripWindow::new(start, end)?),
        _ => None,
    };
    let trip = Trip {
        id: id.to_string(),
        destination: row.destination.clone().unwrap_or_default(),
        window,
    };
    trip.validate()?;
    Ok(trip)
}
