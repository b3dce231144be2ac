use crate::application::aggregator::{CellShade, ParticipantFilter, aggregate};
use crate::application::bootstrap::bootstrap_workspace;
use crate::application::destination::EditOutcome;
use crate::application::engine::{
    EngineOptions, EngineSnapshot, MutationOutcome, TodayProvider, VoteSyncEngine,
};
use crate::application::error::EngineError;
use crate::application::summary::{BestDates, best_dates};
use crate::domain::calendar::{DayCell, YearMonth, build_month};
use crate::domain::holidays::is_weekend;
use crate::domain::models::{
    Participant, SelectionBounds, Trip, TripWindow, VoteAction, VoteKind, parse_iso_date,
};
use crate::infrastructure::change_feed::{ChangeFeed, DisabledChangeFeed};
use crate::infrastructure::config::{BackendKind, TripsyncConfig};
use crate::infrastructure::error::InfraError;
use crate::infrastructure::memory_store::InMemoryTripStore;
use crate::infrastructure::postgrest_feed::PostgrestChangeFeed;
use crate::infrastructure::postgrest_store::PostgrestTripStore;
use crate::infrastructure::sqlite_store::SqliteTripStore;
use crate::infrastructure::trip_store::TripStore;
use chrono::{Local, NaiveDate, Utc, Weekday};
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{error, info};

pub type TripEngine = VoteSyncEngine<dyn TripStore, dyn ChangeFeed>;

/// Where trips can be created and joined from this process.
enum LocalTrips {
    Memory(Arc<InMemoryTripStore>),
    Sqlite(Arc<SqliteTripStore>),
    Hosted,
}

pub struct AppState {
    config_dir: PathBuf,
    database_path: PathBuf,
    config: TripsyncConfig,
    store: Arc<dyn TripStore>,
    feed: Arc<dyn ChangeFeed>,
    local: LocalTrips,
    week_start: Weekday,
    today: TodayProvider,
    sessions: Mutex<HashMap<String, Arc<TripEngine>>>,
}

impl AppState {
    pub fn new(workspace_root: PathBuf) -> Result<Self, InfraError> {
        let bootstrap = bootstrap_workspace(&workspace_root)?;
        let config = bootstrap.config;

        let (store, feed, local) = connect_backend(&config, &bootstrap.database_path)?;
        let week_start = config.app.week_start()?;
        let today: TodayProvider = match config.app.time_zone()? {
            Some(zone) => Arc::new(move || Utc::now().with_timezone(&zone).date_naive()),
            None => Arc::new(|| Local::now().date_naive()),
        };

        Ok(Self {
            config_dir: bootstrap.config_dir,
            database_path: bootstrap.database_path,
            config,
            store,
            feed,
            local,
            week_start,
            today,
            sessions: Mutex::new(HashMap::new()),
        })
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    pub fn database_path(&self) -> &Path {
        &self.database_path
    }

    pub fn config(&self) -> &TripsyncConfig {
        &self.config
    }

    pub fn today(&self) -> NaiveDate {
        (self.today)()
    }

    pub fn command_error(&self, command: &str, error: &EngineError) -> String {
        error!(command, %error, blocking = error.is_blocking(), "command failed");
        error.to_string()
    }

    fn lock_sessions(&self) -> Result<MutexGuard<'_, HashMap<String, Arc<TripEngine>>>, EngineError> {
        self.sessions
            .lock()
            .map_err(|error| EngineError::State(format!("session lock poisoned: {error}")))
    }

    fn session(&self, trip_id: &str) -> Result<Arc<TripEngine>, EngineError> {
        self.lock_sessions()?
            .get(trip_id)
            .cloned()
            .ok_or_else(|| EngineError::State(format!("trip {trip_id} is not open")))
    }
}

fn connect_backend(
    config: &TripsyncConfig,
    database_path: &Path,
) -> Result<(Arc<dyn TripStore>, Arc<dyn ChangeFeed>, LocalTrips), InfraError> {
    match config.backend.kind {
        BackendKind::Memory => {
            let memory = Arc::new(InMemoryTripStore::new());
            let store: Arc<dyn TripStore> = memory.clone();
            let feed: Arc<dyn ChangeFeed> = memory.clone();
            Ok((store, feed, LocalTrips::Memory(memory)))
        }
        BackendKind::Sqlite => {
            let sqlite = Arc::new(SqliteTripStore::new(database_path));
            let store: Arc<dyn TripStore> = sqlite.clone();
            Ok((store, Arc::new(DisabledChangeFeed), LocalTrips::Sqlite(sqlite)))
        }
        BackendKind::Postgrest => {
            let base_url = config.backend.base_url.as_deref().unwrap_or_default();
            let api_key = config.backend.api_key.as_deref().unwrap_or_default();
            let hosted = PostgrestTripStore::new(base_url, api_key)?;
            let feed: Arc<dyn ChangeFeed> = Arc::new(PostgrestChangeFeed::new(
                hosted.clone(),
                config.sync.feed_interval(),
            ));
            let store: Arc<dyn TripStore> = Arc::new(hosted);
            Ok((store, feed, LocalTrips::Hosted))
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TripSessionResponse {
    pub trip: Option<Trip>,
    pub participants: Vec<Participant>,
    pub vote_count: usize,
    pub local_user: Option<String>,
    pub mode: VoteKind,
}

impl From<&EngineSnapshot> for TripSessionResponse {
    fn from(snapshot: &EngineSnapshot) -> Self {
        Self {
            trip: snapshot.trip.clone(),
            participants: snapshot.participants.as_ref().clone(),
            vote_count: snapshot.votes.len(),
            local_user: snapshot.local_user.clone(),
            mode: snapshot.mode,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MonthCellResponse {
    #[serde(flatten)]
    pub cell: DayCell,
    pub weekend: bool,
    pub selectable: bool,
    pub shade: CellShade,
    pub available_count: usize,
    pub unavailable_count: usize,
    pub voters: Vec<String>,
    pub own_vote: Option<VoteKind>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MonthViewResponse {
    pub year: i32,
    pub month: u32,
    pub denominator: usize,
    pub cells: Vec<MonthCellResponse>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MutationResponse {
    pub status: &'static str,
    pub run_id: Option<u64>,
    pub dates: Vec<NaiveDate>,
}

impl From<MutationOutcome> for MutationResponse {
    fn from(outcome: MutationOutcome) -> Self {
        match outcome {
            MutationOutcome::Unchanged => Self {
                status: "unchanged",
                run_id: None,
                dates: Vec::new(),
            },
            MutationOutcome::Confirmed { run_id, dates } => Self {
                status: "confirmed",
                run_id: Some(run_id),
                dates,
            },
            MutationOutcome::Discarded { run_id } => Self {
                status: "discarded",
                run_id: Some(run_id),
                dates: Vec::new(),
            },
        }
    }
}

/// `everyone`, `most_popular`, or a participant id.
pub fn parse_filter(value: Option<&str>) -> ParticipantFilter {
    match value.map(str::trim) {
        None | Some("") | Some("everyone") => ParticipantFilter::Everyone,
        Some("most_popular") => ParticipantFilter::MostPopular,
        Some(user_id) => ParticipantFilter::Participant(user_id.to_string()),
    }
}

fn parse_dates(values: &[String]) -> Result<Vec<NaiveDate>, EngineError> {
    values
        .iter()
        .map(|value| parse_iso_date(value).map_err(EngineError::Validation))
        .collect()
}

pub fn create_trip_impl(
    state: &AppState,
    trip_id: String,
    destination: String,
    start_date: Option<String>,
    end_date: Option<String>,
) -> Result<Trip, EngineError> {
    let window = match (start_date, end_date) {
        (Some(start), Some(end)) => {
            let start = parse_iso_date(&start).map_err(EngineError::Validation)?;
            let end = parse_iso_date(&end).map_err(EngineError::Validation)?;
            Some(TripWindow::new(start, end).map_err(EngineError::Validation)?)
        }
        (None, None) => None,
        _ => {
            return Err(EngineError::Validation(
                "start and end dates must be given together".to_string(),
            ));
        }
    };
    let trip = Trip {
        id: trip_id.trim().to_string(),
        destination: destination.trim().to_string(),
        window,
    };
    trip.validate().map_err(EngineError::Validation)?;

    let result = match &state.local {
        LocalTrips::Memory(memory) => memory.insert_trip(trip.clone()),
        LocalTrips::Sqlite(sqlite) => sqlite.create_trip(&trip),
        LocalTrips::Hosted => {
            return Err(EngineError::Validation(
                "trips are created by the hosted service".to_string(),
            ));
        }
    };
    result.map_err(|error| EngineError::State(error.to_string()))?;
    info!(trip_id = %trip.id, "trip created");
    Ok(trip)
}

pub fn join_trip_impl(
    state: &AppState,
    trip_id: String,
    user_id: String,
    display_name: String,
) -> Result<Participant, EngineError> {
    let participant = Participant::new(user_id.trim(), display_name.trim());
    participant.validate().map_err(EngineError::Validation)?;
    let result = match &state.local {
        LocalTrips::Memory(memory) => memory.upsert_participant(&trip_id, participant.clone()),
        LocalTrips::Sqlite(sqlite) => sqlite.upsert_participant(&trip_id, &participant),
        LocalTrips::Hosted => {
            return Err(EngineError::Validation(
                "participants join through the hosted service".to_string(),
            ));
        }
    };
    result.map_err(|error| EngineError::State(error.to_string()))?;
    Ok(participant)
}

/// Loads a trip and keeps its engine running until `close_trip_impl`.
pub async fn open_trip_impl(
    state: &AppState,
    trip_id: String,
    user_id: Option<String>,
) -> Result<TripSessionResponse, EngineError> {
    if let Ok(existing) = state.session(&trip_id) {
        existing.set_local_user(user_id)?;
        return Ok(TripSessionResponse::from(&existing.snapshot()));
    }

    let mut builder = VoteSyncEngine::builder(trip_id.clone(), state.store.clone(), state.feed.clone())
        .with_options(EngineOptions::from(&state.config.sync))
        .with_today_provider(state.today.clone());
    if let Some(user_id) = user_id {
        builder = builder.with_local_user(user_id);
    }
    let engine = Arc::new(builder.build());
    let snapshot = engine.start().await?;

    let replaced = state.lock_sessions()?.insert(trip_id, engine);
    if let Some(replaced) = replaced {
        replaced.shutdown().await;
    }
    Ok(TripSessionResponse::from(&snapshot))
}

pub async fn close_trip_impl(state: &AppState, trip_id: String) -> Result<bool, EngineError> {
    let engine = state.lock_sessions()?.remove(&trip_id);
    match engine {
        Some(engine) => {
            engine.shutdown().await;
            Ok(true)
        }
        None => Ok(false),
    }
}

pub fn set_vote_mode_impl(state: &AppState, trip_id: String, mode: String) -> Result<VoteKind, EngineError> {
    let mode = VoteKind::parse(&mode)
        .ok_or_else(|| EngineError::Validation(format!("unknown vote mode '{mode}'")))?;
    state.session(&trip_id)?.set_vote_mode(mode)?;
    Ok(mode)
}

pub async fn toggle_date_impl(
    state: &AppState,
    trip_id: String,
    date: String,
) -> Result<MutationResponse, EngineError> {
    let date = parse_iso_date(&date).map_err(EngineError::Validation)?;
    let pending = state.session(&trip_id)?.toggle(date)?;
    Ok(pending.settled().await?.into())
}

/// `vote` is `available`, `unavailable` or `clear`.
pub async fn apply_votes_impl(
    state: &AppState,
    trip_id: String,
    dates: Vec<String>,
    vote: String,
) -> Result<MutationResponse, EngineError> {
    let dates = parse_dates(&dates)?;
    let action = match vote.trim() {
        "clear" => VoteAction::Clear,
        other => VoteAction::Set(
            VoteKind::parse(other)
                .ok_or_else(|| EngineError::Validation(format!("unknown vote '{other}'")))?,
        ),
    };
    let pending = state.session(&trip_id)?.apply_vote(dates, action)?;
    Ok(pending.settled().await?.into())
}

pub async fn edit_destination_impl(
    state: &AppState,
    trip_id: String,
    destination: String,
) -> Result<EditOutcome, EngineError> {
    state.session(&trip_id)?.edit_destination(&destination).await
}

pub async fn refresh_trip_impl(state: &AppState, trip_id: String) -> Result<bool, EngineError> {
    state.session(&trip_id)?.refresh().await
}

pub fn month_view_impl(
    state: &AppState,
    trip_id: String,
    year: i32,
    month: u32,
    filter: Option<String>,
) -> Result<MonthViewResponse, EngineError> {
    let engine = state.session(&trip_id)?;
    let month = YearMonth::new(year, month)
        .ok_or_else(|| EngineError::Validation(format!("invalid month {year}-{month}")))?;
    Ok(month_view(
        &engine.snapshot(),
        month,
        state.today(),
        state.week_start,
        &parse_filter(filter.as_deref()),
    ))
}

pub fn best_dates_impl(state: &AppState, trip_id: String) -> Result<Option<BestDates>, EngineError> {
    let snapshot = state.session(&trip_id)?.snapshot();
    Ok(best_dates(&snapshot.votes, &snapshot.participants))
}

/// Builds the month grid with tallies for the given snapshot.
pub fn month_view(
    snapshot: &EngineSnapshot,
    month: YearMonth,
    today: NaiveDate,
    week_start: Weekday,
    filter: &ParticipantFilter,
) -> MonthViewResponse {
    let aggregation = aggregate(
        &snapshot.votes,
        &snapshot.participants,
        filter,
        month.grid_range(week_start),
    );
    let window = snapshot.trip.as_ref().and_then(|trip| trip.window);
    let bounds = SelectionBounds::new(window, today);

    let cells = build_month(month, today, week_start)
        .into_iter()
        .map(|cell| {
            let tally = aggregation.tally(cell.date);
            let own_vote = snapshot
                .local_user
                .as_deref()
                .and_then(|user| snapshot.votes.get(cell.date, user));
            MonthCellResponse {
                weekend: is_weekend(cell.date),
                selectable: bounds.is_selectable(cell.date),
                shade: aggregation.shade(cell.date),
                available_count: tally.map_or(0, |tally| tally.available_count),
                unavailable_count: tally.map_or(0, |tally| tally.unavailable_count),
                voters: tally.map(|tally| tally.voters.clone()).unwrap_or_default(),
                own_vote,
                cell,
            }
        })
        .collect();

    MonthViewResponse {
        year: month.year(),
        month: month.month(),
        denominator: aggregation.denominator,
        cells,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::calendar::GRID_CELLS;
    use std::fs;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static NEXT_TEMP_WORKSPACE: AtomicUsize = AtomicUsize::new(0);

    struct TempWorkspace {
        path: PathBuf,
    }

    impl TempWorkspace {
        fn new(backend: &str) -> Self {
            let sequence = NEXT_TEMP_WORKSPACE.fetch_add(1, Ordering::Relaxed);
            let path = std::env::temp_dir().join(format!(
                "tripsync-command-tests-{}-{}",
                std::process::id(),
                sequence
            ));
            let config_dir = path.join("config");
            fs::create_dir_all(&config_dir).expect("create temp workspace");
            fs::write(
                config_dir.join("backend.json"),
                format!(r#"{{ "schema": 1, "kind": "{backend}" }}"#),
            )
            .expect("write backend config");
            Self { path }
        }

        fn app_state(&self) -> AppState {
            AppState::new(self.path.clone()).expect("initialize app state")
        }
    }

    impl Drop for TempWorkspace {
        fn drop(&mut self) {
            let _ = fs::remove_dir_all(&self.path);
        }
    }

    fn seed(state: &AppState) {
        create_trip_impl(
            state,
            "jeju".to_string(),
            "제주도".to_string(),
            Some("2099-07-01".to_string()),
            Some("2099-07-10".to_string()),
        )
        .expect("create trip");
        for (id, name) in [("a", "민지"), ("b", "지훈")] {
            join_trip_impl(state, "jeju".to_string(), id.to_string(), name.to_string())
                .expect("join trip");
        }
    }

    #[test]
    fn filter_names_map_to_filters() {
        assert_eq!(parse_filter(None), ParticipantFilter::Everyone);
        assert_eq!(parse_filter(Some("most_popular")), ParticipantFilter::MostPopular);
        assert_eq!(
            parse_filter(Some("b")),
            ParticipantFilter::Participant("b".to_string())
        );
    }

    #[test]
    fn create_trip_requires_complete_window() {
        let workspace = TempWorkspace::new("memory");
        let state = workspace.app_state();
        let result = create_trip_impl(
            &state,
            "trip".to_string(),
            "부산".to_string(),
            Some("2099-07-01".to_string()),
            None,
        );
        assert!(matches!(result, Err(EngineError::Validation(_))));
    }

    #[tokio::test]
    async fn votes_flow_into_month_view_and_best_dates() {
        let workspace = TempWorkspace::new("memory");
        let state = workspace.app_state();
        seed(&state);

        let session = open_trip_impl(&state, "jeju".to_string(), Some("a".to_string()))
            .await
            .expect("open trip");
        assert_eq!(session.participants.len(), 2);

        let outcome = apply_votes_impl(
            &state,
            "jeju".to_string(),
            vec!["2099-07-02".to_string(), "2099-07-03".to_string()],
            "available".to_string(),
        )
        .await
        .expect("apply votes");
        assert_eq!(outcome.status, "confirmed");

        let view = month_view_impl(&state, "jeju".to_string(), 2099, 7, None).expect("month view");
        assert_eq!(view.cells.len(), GRID_CELLS);
        assert_eq!(view.denominator, 2);
        let second = view
            .cells
            .iter()
            .find(|cell| cell.cell.iso_key == "2099-07-02")
            .expect("cell");
        assert_eq!(second.available_count, 1);
        assert_eq!(second.own_vote, Some(VoteKind::Available));
        assert!(second.selectable);
        let outside = view
            .cells
            .iter()
            .find(|cell| cell.cell.iso_key == "2099-07-20")
            .expect("cell");
        assert!(!outside.selectable);

        let best = best_dates_impl(&state, "jeju".to_string())
            .expect("best dates")
            .expect("someone is available");
        assert_eq!(best.labels, vec!["7월 2~3일"]);

        let toggled = toggle_date_impl(&state, "jeju".to_string(), "2099-07-02".to_string())
            .await
            .expect("toggle");
        assert_eq!(toggled.status, "confirmed");
        assert!(close_trip_impl(&state, "jeju".to_string()).await.expect("close"));
        assert!(!close_trip_impl(&state, "jeju".to_string()).await.expect("close again"));
    }

    #[tokio::test]
    async fn sqlite_backend_persists_votes_between_sessions() {
        let workspace = TempWorkspace::new("sqlite");
        let state = workspace.app_state();
        seed(&state);

        open_trip_impl(&state, "jeju".to_string(), Some("b".to_string()))
            .await
            .expect("open trip");
        apply_votes_impl(
            &state,
            "jeju".to_string(),
            vec!["2099-07-05".to_string()],
            "unavailable".to_string(),
        )
        .await
        .expect("apply votes");
        close_trip_impl(&state, "jeju".to_string()).await.expect("close");

        let reopened = open_trip_impl(&state, "jeju".to_string(), None)
            .await
            .expect("reopen trip");
        assert_eq!(reopened.vote_count, 1);
        close_trip_impl(&state, "jeju".to_string()).await.expect("close");
    }

    #[tokio::test]
    async fn commands_on_unopened_trip_fail() {
        let workspace = TempWorkspace::new("memory");
        let state = workspace.app_state();
        let result = month_view_impl(&state, "missing".to_string(), 2099, 7, None);
        assert!(matches!(result, Err(EngineError::State(_))));
        let result = set_vote_mode_impl(&state, "missing".to_string(), "available".to_string());
        assert!(result.is_err());
    }
}
