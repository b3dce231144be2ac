use crate::application::echo::InFlight;
use crate::application::error::EngineError;
use crate::infrastructure::trip_store::TripStore;
use regex::{Regex, RegexSet};
use std::sync::{Arc, LazyLock, Mutex, MutexGuard, OnceLock};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::{Instant, sleep_until};
use tracing::{debug, warn};

pub const MAX_DESTINATION_CHARS: usize = 100;
const MAX_SPECIAL_CHARACTERS: usize = 3;

const FORBIDDEN_KEYWORDS: &[&str] = &[
    "api key", "api_key", "apikey", "api-key", "password", "secret", "token", "ignore", "forget",
    "무시", "잊어", "system", "admin", "root", "prompt", "instruction", "지시", "tell me",
    "알려줘", "말해줘", "show me", "보여줘", "공개",
];

static INJECTION_PATTERNS: LazyLock<RegexSet> = LazyLock::new(|| {
    RegexSet::new([
        r"(?i)ignore\s+(previous|all|above)",
        r"(?i)forget\s+(previous|all|above)",
        r"무시\s*(해|하세요|하라)",
        r"잊어\s*(버려|버리세요)",
        r"(?i)system\s*:",
        r"(?i)user\s*:",
        r"(?i)assistant\s*:",
    ])
    .expect("INJECTION_PATTERNS should compile - this is a bug")
});

static SPECIAL_CHARACTERS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[<>{}\[\]\\|`]").expect("SPECIAL_CHARACTERS should compile - this is a bug")
});

static WHITESPACE_RUNS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+").expect("WHITESPACE_RUNS should compile - this is a bug"));

#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum DestinationError {
    #[error("destination must not be empty")]
    Empty,
    #[error("destination must be at most {MAX_DESTINATION_CHARS} characters")]
    TooLong,
    #[error("destination contains disallowed content")]
    Disallowed,
    #[error("destination contains too many special characters")]
    TooManySpecialCharacters,
}

pub fn validate_destination(input: &str) -> Result<(), DestinationError> {
    if input.trim().is_empty() {
        return Err(DestinationError::Empty);
    }
    if input.chars().count() > MAX_DESTINATION_CHARS {
        return Err(DestinationError::TooLong);
    }
    let lowered = input.to_lowercase();
    if FORBIDDEN_KEYWORDS
        .iter()
        .any(|keyword| lowered.contains(keyword))
    {
        return Err(DestinationError::Disallowed);
    }
    if INJECTION_PATTERNS.is_match(input) {
        return Err(DestinationError::Disallowed);
    }
    if SPECIAL_CHARACTERS.find_iter(input).count() > MAX_SPECIAL_CHARACTERS {
        return Err(DestinationError::TooManySpecialCharacters);
    }
    Ok(())
}

/// Trims, collapses whitespace runs and caps the length.
pub fn sanitize_destination(input: &str) -> String {
    let collapsed = WHITESPACE_RUNS.replace_all(input.trim(), " ");
    collapsed.chars().take(MAX_DESTINATION_CHARS).collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditOutcome {
    /// First edit of a burst, written immediately.
    Written,
    /// Same value as the last write; nothing sent.
    Unchanged,
    /// Held for the trailing write at the end of the burst.
    Scheduled,
}

/// A trailing write that failed after its edit call had already returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DestinationFailure {
    pub attempted: String,
    pub message: String,
}

#[derive(Debug, Default)]
struct BurstState {
    deadline: Option<Instant>,
    trailing: Option<String>,
    last_written: Option<String>,
}

struct EditorInner<S: ?Sized> {
    trip_id: String,
    store: Arc<S>,
    in_flight: InFlight,
    debounce: Duration,
    burst: Mutex<BurstState>,
    write_lane: tokio::sync::Mutex<()>,
    failures: OnceLock<mpsc::UnboundedSender<DestinationFailure>>,
}

/// Writes the trip destination with a leading immediate write and one
/// trailing write once edits stop for `debounce`.
pub struct DestinationEditor<S: TripStore + ?Sized + 'static> {
    inner: Arc<EditorInner<S>>,
}

impl<S: TripStore + ?Sized + 'static> Clone for DestinationEditor<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: TripStore + ?Sized + 'static> DestinationEditor<S> {
    pub fn new(trip_id: impl Into<String>, store: Arc<S>, in_flight: InFlight, debounce: Duration) -> Self {
        Self {
            inner: Arc::new(EditorInner {
                trip_id: trip_id.into(),
                store,
                in_flight,
                debounce,
                burst: Mutex::new(BurstState::default()),
                write_lane: tokio::sync::Mutex::new(()),
                failures: OnceLock::new(),
            }),
        }
    }

    /// Routes failed trailing writes to `sender`. Only the first sender is kept.
    pub fn report_failures(&self, sender: mpsc::UnboundedSender<DestinationFailure>) {
        if self.inner.failures.set(sender).is_err() {
            debug!(trip_id = %self.inner.trip_id, "destination failure reports already routed");
        }
    }

    /// Remembers the value already stored remotely so an identical edit is not re-sent.
    pub fn remember_written(&self, value: impl Into<String>) {
        if let Ok(mut burst) = self.inner.burst.lock() {
            burst.last_written = Some(value.into());
        }
    }

    /// True from the first edit of a burst until its trailing write is due.
    pub fn is_editing(&self) -> bool {
        self.inner
            .burst
            .lock()
            .map(|burst| burst.deadline.is_some())
            .unwrap_or(false)
    }

    pub async fn edit(&self, raw: &str) -> Result<EditOutcome, EngineError> {
        validate_destination(raw).map_err(|error| EngineError::Validation(error.to_string()))?;
        let value = sanitize_destination(raw);

        let leading = {
            let mut burst = lock_burst(&self.inner.burst)?;
            let deadline = Instant::now() + self.inner.debounce;
            let idle = burst.deadline.is_none();
            burst.deadline = Some(deadline);
            if idle {
                burst.trailing = None;
            } else {
                burst.trailing = Some(value.clone());
            }
            idle
        };

        if leading {
            let inner = Arc::clone(&self.inner);
            tokio::spawn(async move { run_trailing_timer(inner).await });
            return self.inner.write(value).await;
        }
        Ok(EditOutcome::Scheduled)
    }

    /// Sends any held trailing value now.
    pub async fn flush(&self) -> Result<EditOutcome, EngineError> {
        let trailing = {
            let mut burst = lock_burst(&self.inner.burst)?;
            burst.deadline = None;
            burst.trailing.take()
        };
        match trailing {
            Some(value) => self.inner.write(value).await,
            None => Ok(EditOutcome::Unchanged),
        }
    }

    pub fn last_written(&self) -> Option<String> {
        self.inner
            .burst
            .lock()
            .ok()
            .and_then(|burst| burst.last_written.clone())
    }
}

impl<S: TripStore + ?Sized> EditorInner<S> {
    async fn write(&self, value: String) -> Result<EditOutcome, EngineError> {
        let _lane = self.write_lane.lock().await;
        let unchanged = lock_burst(&self.burst)?.last_written.as_deref() == Some(value.as_str());
        if unchanged {
            return Ok(EditOutcome::Unchanged);
        }

        let _ticket = self.in_flight.begin();
        self.store
            .update_destination(&self.trip_id, &value)
            .await
            .map_err(|error| {
                warn!(trip_id = %self.trip_id, %error, "destination write failed");
                EngineError::RemoteWrite(error)
            })?;
        debug!(trip_id = %self.trip_id, "destination written");
        lock_burst(&self.burst)?.last_written = Some(value);
        Ok(EditOutcome::Written)
    }
}

fn lock_burst(burst: &Mutex<BurstState>) -> Result<MutexGuard<'_, BurstState>, EngineError> {
    burst
        .lock()
        .map_err(|error| EngineError::State(format!("destination editor lock poisoned: {error}")))
}

async fn run_trailing_timer<S: TripStore + ?Sized>(inner: Arc<EditorInner<S>>) {
    let trailing = loop {
        let Ok(deadline) = lock_burst(&inner.burst).map(|burst| burst.deadline) else {
            return;
        };
        let Some(deadline) = deadline else {
            // Flushed before the burst ended.
            return;
        };
        sleep_until(deadline).await;

        let Ok(mut burst) = lock_burst(&inner.burst) else {
            return;
        };
        if burst.deadline == Some(deadline) {
            burst.deadline = None;
            break burst.trailing.take();
        }
    };

    let Some(value) = trailing else {
        return;
    };
    if let Err(error) = inner.write(value.clone()).await {
        let failure = DestinationFailure {
            attempted: value,
            message: error.to_string(),
        };
        match inner.failures.get() {
            Some(sender) if sender.send(failure).is_ok() => {}
            _ => warn!(trip_id = %inner.trip_id, "trailing destination failure had no listener"),
        }
    }
}
