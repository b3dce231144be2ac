use crate::domain::gesture::DEFAULT_DRAG_THRESHOLD_PX;
use crate::infrastructure::error::InfraError;
use chrono::Weekday;
use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

const APP_JSON: &str = "app.json";
const BACKEND_JSON: &str = "backend.json";
const SYNC_JSON: &str = "sync.json";
pub const API_KEY_ENV: &str = "TRIPSYNC_API_KEY";
pub const BASE_URL_ENV: &str = "TRIPSYNC_BASE_URL";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppSettings {
    #[serde(default)]
    pub timezone: Option<String>,
    #[serde(default = "default_week_start")]
    pub week_start: String,
}

impl AppSettings {
    pub fn week_start(&self) -> Result<Weekday, InfraError> {
        self.week_start.trim().parse::<Weekday>().map_err(|_| {
            InfraError::InvalidConfig(format!("unknown weekStart '{}'", self.week_start))
        })
    }

    pub fn time_zone(&self) -> Result<Option<chrono_tz::Tz>, InfraError> {
        self.timezone
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(|value| {
                value
                    .parse::<chrono_tz::Tz>()
                    .map_err(|_| InfraError::InvalidConfig(format!("unknown timezone '{value}'")))
            })
            .transpose()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Memory,
    Sqlite,
    Postgrest,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendSettings {
    pub kind: BackendKind,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncSettings {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// How often the hosted backend's change feed diffs rows.
    #[serde(default = "default_feed_interval_ms")]
    pub feed_interval_ms: u64,
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,
    #[serde(default = "default_true")]
    pub refetch_after_write: bool,
    #[serde(default = "default_destination_debounce_ms")]
    pub destination_debounce_ms: u64,
    #[serde(default = "default_drag_threshold_px")]
    pub drag_threshold_px: f64,
}

impl SyncSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn feed_interval(&self) -> Duration {
        Duration::from_millis(self.feed_interval_ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn destination_debounce(&self) -> Duration {
        Duration::from_millis(self.destination_debounce_ms)
    }
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            feed_interval_ms: default_feed_interval_ms(),
            settle_delay_ms: default_settle_delay_ms(),
            refetch_after_write: true,
            destination_debounce_ms: default_destination_debounce_ms(),
            drag_threshold_px: default_drag_threshold_px(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TripsyncConfig {
    pub app: AppSettings,
    pub backend: BackendSettings,
    pub sync: SyncSettings,
}

fn default_week_start() -> String {
    "sunday".to_string()
}

fn default_poll_interval_ms() -> u64 {
    3_000
}

fn default_feed_interval_ms() -> u64 {
    1_000
}

fn default_settle_delay_ms() -> u64 {
    200
}

fn default_destination_debounce_ms() -> u64 {
    500
}

fn default_drag_threshold_px() -> f64 {
    DEFAULT_DRAG_THRESHOLD_PX
}

fn default_true() -> bool {
    true
}

fn default_files() -> HashMap<&'static str, serde_json::Value> {
    HashMap::from([
        (
            APP_JSON,
            serde_json::json!({
                "schema": 1,
                "timezone": "Asia/Seoul",
                "weekStart": "sunday"
            }),
        ),
        (
            BACKEND_JSON,
            serde_json::json!({
                "schema": 1,
                "kind": "sqlite",
                "baseUrl": null,
                "apiKey": null
            }),
        ),
        (
            SYNC_JSON,
            serde_json::json!({
                "schema": 1,
                "pollIntervalMs": default_poll_interval_ms(),
                "feedIntervalMs": default_feed_interval_ms(),
                "settleDelayMs": default_settle_delay_ms(),
                "refetchAfterWrite": true,
                "destinationDebounceMs": default_destination_debounce_ms(),
                "dragThresholdPx": DEFAULT_DRAG_THRESHOLD_PX
            }),
        ),
    ])
}

pub fn ensure_default_configs(config_dir: &Path) -> Result<(), InfraError> {
    for (name, value) in default_files() {
        let path = config_dir.join(name);
        if !path.exists() {
            let formatted = serde_json::to_string_pretty(&value)?;
            fs::write(path, format!("{formatted}\n"))?;
        }
    }
    Ok(())
}

fn read_config(path: &Path) -> Result<serde_json::Value, InfraError> {
    let raw = fs::read_to_string(path)?;
    let parsed: serde_json::Value = serde_json::from_str(&raw)?;
    let schema = parsed
        .get("schema")
        .and_then(serde_json::Value::as_u64)
        .ok_or_else(|| InfraError::InvalidConfig(format!("missing schema in {}", path.display())))?;
    if schema != 1 {
        return Err(InfraError::InvalidConfig(format!(
            "unsupported schema {} in {}",
            schema,
            path.display()
        )));
    }
    Ok(parsed)
}

fn read_typed<T: DeserializeOwned>(path: &Path) -> Result<T, InfraError> {
    let value = read_config(path)?;
    serde_json::from_value(value).map_err(|error| {
        InfraError::InvalidConfig(format!("invalid {}: {error}", path.display()))
    })
}

pub fn load_config(config_dir: &Path) -> Result<TripsyncConfig, InfraError> {
    load_config_with_lookup(config_dir, |key| std::env::var(key).ok())
}

/// Reads all config files, then lets `lookup` override backend credentials.
pub fn load_config_with_lookup<F>(config_dir: &Path, lookup: F) -> Result<TripsyncConfig, InfraError>
where
    F: Fn(&str) -> Option<String>,
{
    let app: AppSettings = read_typed(&config_dir.join(APP_JSON))?;
    let mut backend: BackendSettings = read_typed(&config_dir.join(BACKEND_JSON))?;
    let sync: SyncSettings = read_typed(&config_dir.join(SYNC_JSON))?;

    if let Some(api_key) = lookup(API_KEY_ENV).filter(|value| !value.trim().is_empty()) {
        backend.api_key = Some(api_key);
    }
    if let Some(base_url) = lookup(BASE_URL_ENV).filter(|value| !value.trim().is_empty()) {
        backend.base_url = Some(base_url);
    }

    app.week_start()?;
    app.time_zone()?;
    validate_sync(&sync)?;
    validate_backend(&backend)?;

    Ok(TripsyncConfig { app, backend, sync })
}

fn validate_sync(sync: &SyncSettings) -> Result<(), InfraError> {
    if sync.poll_interval_ms == 0 {
        return Err(InfraError::InvalidConfig(
            "pollIntervalMs must be greater than zero".to_string(),
        ));
    }
    if sync.feed_interval_ms == 0 {
        return Err(InfraError::InvalidConfig(
            "feedIntervalMs must be greater than zero".to_string(),
        ));
    }
    if !sync.drag_threshold_px.is_finite() || sync.drag_threshold_px < 0.0 {
        return Err(InfraError::InvalidConfig(
            "dragThresholdPx must be a non-negative number".to_string(),
        ));
    }
    Ok(())
}

fn validate_backend(backend: &BackendSettings) -> Result<(), InfraError> {
    if backend.kind != BackendKind::Postgrest {
        return Ok(());
    }
    let has = |value: &Option<String>| value.as_deref().is_some_and(|value| !value.trim().is_empty());
    if !has(&backend.base_url) {
        return Err(InfraError::InvalidConfig(
            "backend.baseUrl is required for the postgrest backend".to_string(),
        ));
    }
    if !has(&backend.api_key) {
        return Err(InfraError::InvalidConfig(format!(
            "backend.apiKey or {API_KEY_ENV} is required for the postgrest backend"
        )));
    }
    Ok(())
}
