use chrono::Datelike;
use serde::Serialize;
use std::env;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt};
use tripsync::application::commands::{
    AppState, MonthViewResponse, TripSessionResponse, best_dates_impl, close_trip_impl,
    month_view_impl, open_trip_impl,
};
use tripsync::application::summary::BestDates;

const USAGE: &str = "usage: tripsync <trip-id> [YYYY-MM] [everyone|most_popular|<user-id>]";

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TripReport {
    session: TripSessionResponse,
    month_view: MonthViewResponse,
    best_dates: Option<BestDates>,
}

fn parse_month(value: &str) -> Option<(i32, u32)> {
    let (year, month) = value.split_once('-')?;
    Some((year.parse().ok()?, month.parse().ok()?))
}

fn resolve_workspace() -> Result<PathBuf, std::io::Error> {
    match env::var("TRIPSYNC_WORKSPACE") {
        Ok(path) if !path.trim().is_empty() => Ok(PathBuf::from(path)),
        _ => env::current_dir(),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .with_writer(std::io::stderr)
        .init();

    let mut args = env::args().skip(1);
    let Some(trip_id) = args.next() else {
        eprintln!("{USAGE}");
        std::process::exit(2);
    };
    let month = args.next();
    let filter = args.next();

    let state = AppState::new(resolve_workspace()?)?;
    info!(%trip_id, backend = ?state.config().backend.kind, "opening trip");
    let session = open_trip_impl(&state, trip_id.clone(), None)
        .await
        .map_err(|error| state.command_error("open_trip", &error))?;

    let (year, month) = match month.as_deref() {
        Some(value) => parse_month(value).ok_or_else(|| format!("invalid month '{value}'\n{USAGE}"))?,
        None => {
            let anchor = session
                .trip
                .as_ref()
                .and_then(|trip| trip.window)
                .map(|window| window.start)
                .unwrap_or_else(|| state.today());
            (anchor.year(), anchor.month())
        }
    };

    let month_view = month_view_impl(&state, trip_id.clone(), year, month, filter)
        .map_err(|error| state.command_error("month_view", &error))?;
    let best_dates = best_dates_impl(&state, trip_id.clone())
        .map_err(|error| state.command_error("best_dates", &error))?;
    close_trip_impl(&state, trip_id)
        .await
        .map_err(|error| state.command_error("close_trip", &error))?;

    let report = TripReport {
        session,
        month_view,
        best_dates,
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
