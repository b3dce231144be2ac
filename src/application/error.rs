use crate::infrastructure::error::InfraError;
use chrono::NaiveDate;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("no active user is selected")]
    NoActiveUser,
    #[error("invalid request: {0}")]
    Validation(String),
    #[error("dates outside the selectable range: {0:?}")]
    OutsideWindow(Vec<NaiveDate>),
    #[error("remote write failed; local change was rolled back: {0}")]
    RemoteWrite(#[source] InfraError),
    #[error("cannot load trip: {0}")]
    InitialLoad(#[source] InfraError),
    #[error("refresh failed: {0}")]
    Refresh(#[source] InfraError),
    #[error("engine state unavailable: {0}")]
    State(String),
}

impl EngineError {
    /// Blocking errors leave the view without usable data.
    pub fn is_blocking(&self) -> bool {
        matches!(self, EngineError::InitialLoad(_))
    }
}
