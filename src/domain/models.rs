use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

const ISO_DATE_FORMAT: &str = "%Y-%m-%d";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum VoteKind {
    Available,
    Unavailable,
}

impl VoteKind {
    pub fn as_str(self) -> &'static str {
        match self {
            VoteKind::Available => "available",
            VoteKind::Unavailable => "unavailable",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "available" => Some(VoteKind::Available),
            "unavailable" => Some(VoteKind::Unavailable),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Vote {
    pub date: NaiveDate,
    pub user_id: String,
    pub kind: VoteKind,
}

impl Vote {
    pub fn new(date: NaiveDate, user_id: impl Into<String>, kind: VoteKind) -> Self {
        Self {
            date,
            user_id: user_id.into(),
            kind,
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        validate_non_empty(&self.user_id, "vote.user_id")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Participant {
    pub id: String,
    pub display_name: String,
}

impl Participant {
    pub fn new(id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        validate_non_empty(&self.id, "participant.id")?;
        validate_non_empty(&self.display_name, "participant.display_name")
    }
}

/// What a mutation does to every (date, user) pair it touches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoteAction {
    Set(VoteKind),
    Clear,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct TripWindow {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl TripWindow {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self, String> {
        if end < start {
            return Err("trip.window.end must be on or after trip.window.start".to_string());
        }
        Ok(Self { start, end })
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date <= self.end
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Trip {
    pub id: String,
    pub destination: String,
    pub window: Option<TripWindow>,
}

impl Trip {
    pub fn validate(&self) -> Result<(), String> {
        validate_non_empty(&self.id, "trip.id")?;
        if let Some(window) = &self.window {
            TripWindow::new(window.start, window.end)?;
        }
        Ok(())
    }
}

/// Which dates a viewer may select: the trip window when one is set,
/// otherwise today onward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SelectionBounds {
    pub window: Option<TripWindow>,
    pub today: NaiveDate,
}

impl SelectionBounds {
    pub fn new(window: Option<TripWindow>, today: NaiveDate) -> Self {
        Self { window, today }
    }

    pub fn is_selectable(&self, date: NaiveDate) -> bool {
        match &self.window {
            Some(window) => window.contains(date),
            None => date >= self.today,
        }
    }
}

/// Formats a date from its calendar fields, never through a timestamp.
pub fn iso_key(date: NaiveDate) -> String {
    date.format(ISO_DATE_FORMAT).to_string()
}

pub fn parse_iso_date(value: &str) -> Result<NaiveDate, String> {
    NaiveDate::parse_from_str(value.trim(), ISO_DATE_FORMAT)
        .map_err(|_| format!("'{value}' must be YYYY-MM-DD"))
}

fn validate_non_empty(value: &str, field_name: &str) -> Result<(), String> {
    if value.trim().is_empty() {
        return Err(format!("{field_name} must not be empty"));
    }
    Ok(())
}
