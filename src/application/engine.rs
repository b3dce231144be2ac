//! Availability synchronization engine for one trip.
//!
//! The engine owns the only writable copy of the trip's vote set. Gestures are
//! applied locally first and then written to the store by a single writer
//! task, in submission order. A failed write restores only the entries its own
//! run still owns. A background loop reacts to change notifications from other
//! users and polls the store as a backstop.

use crate::application::destination::{
    DestinationEditor, DestinationFailure, EditOutcome, sanitize_destination,
    validate_destination,
};
use crate::application::echo::EchoGuard;
use crate::application::error::EngineError;
use crate::application::pending::{PendingLedger, PendingMutation};
use crate::application::reconcile::{merge_authoritative, participants_differ};
use crate::domain::gesture::{
    DEFAULT_DRAG_THRESHOLD_PX, DragIntent, DragPreview, GestureAction, GestureContext,
    GestureRecognizer, PointerEvent,
};
use crate::domain::models::{Participant, SelectionBounds, Trip, Vote, VoteAction, VoteKind};
use crate::domain::vote_set::VoteSet;
use crate::infrastructure::change_feed::{ChangeEvent, ChangeFeed, ChangeTable, Subscription};
use crate::infrastructure::config::SyncSettings;
use crate::infrastructure::error::InfraError;
use crate::infrastructure::trip_store::TripStore;
use chrono::{Local, NaiveDate};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

pub type TodayProvider = Arc<dyn Fn() -> NaiveDate + Send + Sync>;

const NOTICE_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq)]
pub struct EngineOptions {
    pub poll_interval: Duration,
    pub settle_delay: Duration,
    pub refetch_after_write: bool,
    pub destination_debounce: Duration,
    pub drag_threshold_px: f64,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(3),
            settle_delay: Duration::from_millis(200),
            refetch_after_write: true,
            destination_debounce: Duration::from_millis(500),
            drag_threshold_px: DEFAULT_DRAG_THRESHOLD_PX,
        }
    }
}

impl From<&SyncSettings> for EngineOptions {
    fn from(settings: &SyncSettings) -> Self {
        Self {
            poll_interval: settings.poll_interval(),
            settle_delay: settings.settle_delay(),
            refetch_after_write: settings.refetch_after_write,
            destination_debounce: settings.destination_debounce(),
            drag_threshold_px: settings.drag_threshold_px,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MutationOutcome {
    /// Nothing changed locally, so nothing was sent.
    Unchanged,
    Confirmed { run_id: u64, dates: Vec<NaiveDate> },
    /// The write finished after the engine shut down; its result was dropped.
    Discarded { run_id: u64 },
}

/// Non-blocking conditions surfaced to the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineNotice {
    WriteFailed {
        run_id: u64,
        dates: Vec<NaiveDate>,
        message: String,
    },
    RefreshFailed {
        message: String,
    },
    SubscriptionDegraded {
        message: String,
    },
    /// The destination was reverted to the last value the store accepted.
    DestinationWriteFailed {
        attempted: String,
        restored: Option<String>,
        message: String,
    },
}

#[derive(Debug, Clone)]
pub struct EngineSnapshot {
    pub version: u64,
    pub loaded: bool,
    pub trip: Option<Trip>,
    pub votes: Arc<VoteSet>,
    pub participants: Arc<Vec<Participant>>,
    pub local_user: Option<String>,
    pub mode: VoteKind,
    pub pending_runs: usize,
}

impl EngineSnapshot {
    fn empty() -> Self {
        Self {
            version: 0,
            loaded: false,
            trip: None,
            votes: Arc::new(VoteSet::new()),
            participants: Arc::new(Vec::new()),
            local_user: None,
            mode: VoteKind::Available,
            pending_runs: 0,
        }
    }

    pub fn destination(&self) -> Option<&str> {
        self.trip.as_ref().map(|trip| trip.destination.as_str())
    }
}

struct EngineState {
    loaded: bool,
    trip: Option<Trip>,
    votes: VoteSet,
    participants: Vec<Participant>,
    pending: PendingLedger,
    local_user: Option<String>,
    mode: VoteKind,
    recognizer: GestureRecognizer,
    version: u64,
    /// Bumped whenever a remote write resolves; a refresh that straddles a
    /// resolution is dropped.
    write_epoch: u64,
}

struct WriteJob {
    run_id: u64,
    user_id: String,
    dates: Vec<NaiveDate>,
    action: VoteAction,
    reply: oneshot::Sender<Result<MutationOutcome, EngineError>>,
}

/// Resolves once the remote write behind an optimistic change settles.
#[derive(Debug)]
pub struct PendingWrite {
    run_id: Option<u64>,
    receiver: Option<oneshot::Receiver<Result<MutationOutcome, EngineError>>>,
}

impl PendingWrite {
    fn unchanged() -> Self {
        Self {
            run_id: None,
            receiver: None,
        }
    }

    pub fn run_id(&self) -> Option<u64> {
        self.run_id
    }

    pub async fn settled(self) -> Result<MutationOutcome, EngineError> {
        let (Some(run_id), Some(receiver)) = (self.run_id, self.receiver) else {
            return Ok(MutationOutcome::Unchanged);
        };
        match receiver.await {
            Ok(result) => result,
            Err(_) => Ok(MutationOutcome::Discarded { run_id }),
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct RefreshPlan {
    votes: bool,
    participants: bool,
    trip: bool,
}

struct Shared<S: TripStore + ?Sized + 'static, F: ChangeFeed + ?Sized + 'static> {
    trip_id: String,
    store: Arc<S>,
    feed: Arc<F>,
    options: EngineOptions,
    today: TodayProvider,
    state: Mutex<EngineState>,
    snapshots: watch::Sender<EngineSnapshot>,
    notices: broadcast::Sender<EngineNotice>,
    echo: EchoGuard,
    destination: DestinationEditor<S>,
    cancel: CancellationToken,
    closed: AtomicBool,
    next_run: AtomicU64,
    writer: OnceLock<mpsc::UnboundedSender<WriteJob>>,
    destination_failures: Mutex<Option<mpsc::UnboundedReceiver<DestinationFailure>>>,
}

pub struct EngineBuilder<S: TripStore + ?Sized + 'static, F: ChangeFeed + ?Sized + 'static> {
    trip_id: String,
    store: Arc<S>,
    feed: Arc<F>,
    options: EngineOptions,
    today: TodayProvider,
    local_user: Option<String>,
    mode: VoteKind,
}

impl<S: TripStore + ?Sized + 'static, F: ChangeFeed + ?Sized + 'static> EngineBuilder<S, F> {
    pub fn with_options(mut self, options: EngineOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_today_provider(mut self, today: TodayProvider) -> Self {
        self.today = today;
        self
    }

    pub fn with_local_user(mut self, user_id: impl Into<String>) -> Self {
        self.local_user = Some(user_id.into());
        self
    }

    pub fn with_vote_mode(mut self, mode: VoteKind) -> Self {
        self.mode = mode;
        self
    }

    pub fn build(self) -> VoteSyncEngine<S, F> {
        let echo = EchoGuard::new();
        let destination = DestinationEditor::new(
            self.trip_id.clone(),
            Arc::clone(&self.store),
            echo.destination().clone(),
            self.options.destination_debounce,
        );
        let (failure_reports, destination_failures) = mpsc::unbounded_channel();
        destination.report_failures(failure_reports);
        let (notices, _) = broadcast::channel(NOTICE_CAPACITY);
        let (snapshots, _) = watch::channel(EngineSnapshot::empty());
        let state = EngineState {
            loaded: false,
            trip: None,
            votes: VoteSet::new(),
            participants: Vec::new(),
            pending: PendingLedger::new(),
            local_user: self.local_user,
            mode: self.mode,
            recognizer: GestureRecognizer::new(self.options.drag_threshold_px),
            version: 0,
            write_epoch: 0,
        };

        VoteSyncEngine {
            shared: Arc::new(Shared {
                trip_id: self.trip_id,
                store: self.store,
                feed: self.feed,
                options: self.options,
                today: self.today,
                state: Mutex::new(state),
                snapshots,
                notices,
                echo,
                destination,
                cancel: CancellationToken::new(),
                closed: AtomicBool::new(false),
                next_run: AtomicU64::new(1),
                writer: OnceLock::new(),
                destination_failures: Mutex::new(Some(destination_failures)),
            }),
            sync_task: Mutex::new(None),
        }
    }
}

pub struct VoteSyncEngine<S: TripStore + ?Sized + 'static, F: ChangeFeed + ?Sized + 'static> {
    shared: Arc<Shared<S, F>>,
    sync_task: Mutex<Option<JoinHandle<()>>>,
}

impl<S: TripStore + ?Sized + 'static, F: ChangeFeed + ?Sized + 'static> VoteSyncEngine<S, F> {
    pub fn builder(trip_id: impl Into<String>, store: Arc<S>, feed: Arc<F>) -> EngineBuilder<S, F> {
        EngineBuilder {
            trip_id: trip_id.into(),
            store,
            feed,
            options: EngineOptions::default(),
            today: Arc::new(|| Local::now().date_naive()),
            local_user: None,
            mode: VoteKind::Available,
        }
    }

    pub fn trip_id(&self) -> &str {
        &self.shared.trip_id
    }

    /// Loads the trip, subscribes to changes and starts the background tasks.
    /// A failed initial load is blocking and leaves the engine stopped.
    #[instrument(skip(self), fields(trip_id = %self.shared.trip_id))]
    pub async fn start(&self) -> Result<EngineSnapshot, EngineError> {
        let shared = &self.shared;
        if shared.closed.load(Ordering::SeqCst) {
            return Err(EngineError::State("engine is shut down".to_string()));
        }
        if shared.writer.get().is_some() {
            return Err(EngineError::State("engine already started".to_string()));
        }

        let (trip, participants, votes) = tokio::try_join!(
            shared.store.get_trip(&shared.trip_id),
            shared.store.get_participants(&shared.trip_id),
            shared.store.get_votes(&shared.trip_id),
        )
        .map_err(EngineError::InitialLoad)?;
        shared.destination.remember_written(trip.destination.clone());

        let snapshot = {
            let mut state = shared.lock_state()?;
            state.trip = Some(trip);
            state.participants = participants;
            state.votes = VoteSet::from_votes(votes);
            state.loaded = true;
            shared.publish(&mut state)
        };
        info!(
            votes = snapshot.votes.len(),
            participants = snapshot.participants.len(),
            "trip loaded"
        );

        let subscription = match shared.feed.subscribe(&shared.trip_id).await {
            Ok(subscription) => Some(subscription),
            Err(error) => {
                shared.degrade(&error.to_string());
                None
            }
        };

        let (jobs, receiver) = mpsc::unbounded_channel();
        if shared.writer.set(jobs).is_err() {
            return Err(EngineError::State("engine already started".to_string()));
        }
        tokio::spawn(run_writer(
            Arc::downgrade(shared),
            Arc::clone(&shared.store),
            shared.trip_id.clone(),
            shared.echo.clone(),
            receiver,
        ));

        let destination_failures = shared
            .destination_failures
            .lock()
            .map_err(|error| EngineError::State(format!("destination failure lock poisoned: {error}")))?
            .take();
        let handle = tokio::spawn(run_sync_loop(
            Arc::clone(shared),
            subscription,
            destination_failures,
        ));
        *self.lock_task()? = Some(handle);
        Ok(snapshot)
    }

    /// Stops polling and unsubscribes. In-flight writes still reach the store
    /// but their results are discarded.
    pub async fn shutdown(&self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        self.shared.cancel.cancel();
        let handle = self.lock_task().ok().and_then(|mut task| task.take());
        if let Some(handle) = handle {
            if let Err(error) = handle.await {
                warn!(%error, "sync loop ended abnormally");
            }
        }
        info!(trip_id = %self.shared.trip_id, "engine shut down");
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> EngineSnapshot {
        self.shared.snapshots.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<EngineSnapshot> {
        self.shared.snapshots.subscribe()
    }

    pub fn notices(&self) -> broadcast::Receiver<EngineNotice> {
        self.shared.notices.subscribe()
    }

    pub fn set_local_user(&self, user_id: Option<String>) -> Result<(), EngineError> {
        let mut state = self.shared.lock_state()?;
        if state.local_user != user_id {
            state.local_user = user_id;
            self.shared.publish(&mut state);
        }
        Ok(())
    }

    pub fn set_vote_mode(&self, mode: VoteKind) -> Result<(), EngineError> {
        let mut state = self.shared.lock_state()?;
        if state.mode != mode {
            state.mode = mode;
            self.shared.publish(&mut state);
        }
        Ok(())
    }

    pub fn selection_bounds(&self) -> Result<SelectionBounds, EngineError> {
        let state = self.shared.lock_state()?;
        Ok(self.shared.bounds(&state))
    }

    /// Applies `action` to every date for the local user right away and
    /// queues the matching remote write.
    pub fn apply_vote(
        &self,
        dates: impl IntoIterator<Item = NaiveDate>,
        action: VoteAction,
    ) -> Result<PendingWrite, EngineError> {
        let shared = &self.shared;
        if shared.closed.load(Ordering::SeqCst) {
            return Err(EngineError::State("engine is shut down".to_string()));
        }
        let writer = shared
            .writer
            .get()
            .ok_or_else(|| EngineError::State("engine has not been started".to_string()))?;
        let dates: BTreeSet<NaiveDate> = dates.into_iter().collect();

        let (run_id, user_id) = {
            let mut guard = shared.lock_state()?;
            let state = &mut *guard;
            let user_id = state.local_user.clone().ok_or(EngineError::NoActiveUser)?;
            if dates.is_empty() {
                return Err(EngineError::Validation("no dates selected".to_string()));
            }
            let bounds = shared.bounds(state);
            let outside: Vec<NaiveDate> = dates
                .iter()
                .copied()
                .filter(|date| !bounds.is_selectable(*date))
                .collect();
            if !outside.is_empty() {
                return Err(EngineError::OutsideWindow(outside));
            }

            let target = match action {
                VoteAction::Set(kind) => Some(kind),
                VoteAction::Clear => None,
            };
            if dates
                .iter()
                .all(|date| state.votes.get(*date, &user_id) == target)
            {
                return Ok(PendingWrite::unchanged());
            }

            let run_id = shared.next_run.fetch_add(1, Ordering::SeqCst);
            let previous = state.votes.apply(&dates, &user_id, action);
            state.pending.begin(PendingMutation {
                run_id,
                user_id: user_id.clone(),
                affected_dates: dates.clone(),
                previous,
            });
            shared.publish(state);
            (run_id, user_id)
        };
        debug!(run_id, dates = dates.len(), ?action, "optimistic vote applied");

        let (reply, receiver) = oneshot::channel();
        let job = WriteJob {
            run_id,
            user_id,
            dates: dates.into_iter().collect(),
            action,
            reply,
        };
        if writer.send(job).is_err() {
            let mut guard = shared.lock_state()?;
            let state = &mut *guard;
            state.pending.rollback(run_id, &mut state.votes);
            shared.publish(state);
            return Err(EngineError::State("vote writer has stopped".to_string()));
        }

        Ok(PendingWrite {
            run_id: Some(run_id),
            receiver: Some(receiver),
        })
    }

    /// Clears the date when the local user's vote already matches the active
    /// mode, otherwise sets it to the mode.
    pub fn toggle(&self, date: NaiveDate) -> Result<PendingWrite, EngineError> {
        let action = {
            let state = self.shared.lock_state()?;
            let user_id = state.local_user.as_deref().ok_or(EngineError::NoActiveUser)?;
            if state.votes.get(date, user_id) == Some(state.mode) {
                VoteAction::Clear
            } else {
                VoteAction::Set(state.mode)
            }
        };
        self.apply_vote([date], action)
    }

    pub fn commit_gesture(&self, action: GestureAction) -> Result<PendingWrite, EngineError> {
        match action {
            GestureAction::Tap(date) => self.toggle(date),
            GestureAction::DragRange { dates, intent } => {
                let mode = self.shared.lock_state()?.mode;
                let action = match intent {
                    DragIntent::Add => VoteAction::Set(mode),
                    DragIntent::Remove => VoteAction::Clear,
                };
                self.apply_vote(dates, action)
            }
        }
    }

    /// Feeds one pointer event to the gesture recognizer and commits the
    /// resulting action, if any.
    pub fn pointer(&self, event: PointerEvent) -> Result<Option<PendingWrite>, EngineError> {
        let action = {
            let mut guard = self.shared.lock_state()?;
            let state = &mut *guard;
            let bounds = self.shared.bounds(state);
            let user_id = state.local_user.as_deref();
            let votes = &state.votes;
            let own_vote = |date: NaiveDate| user_id.and_then(|user| votes.get(date, user));
            let context = GestureContext {
                bounds,
                mode: state.mode,
                own_vote: &own_vote,
            };
            state.recognizer.handle(event, &context)
        };
        action.map(|action| self.commit_gesture(action)).transpose()
    }

    pub fn drag_preview(&self) -> Result<Option<DragPreview>, EngineError> {
        Ok(self.shared.lock_state()?.recognizer.preview())
    }

    /// Re-reads trip, participants and votes; true when anything changed.
    pub async fn refresh(&self) -> Result<bool, EngineError> {
        self.shared
            .refresh(RefreshPlan {
                votes: true,
                participants: true,
                trip: true,
            })
            .await
    }

    /// Updates the destination locally and writes it through the debounced editor.
    pub async fn edit_destination(&self, raw: &str) -> Result<EditOutcome, EngineError> {
        validate_destination(raw).map_err(|error| EngineError::Validation(error.to_string()))?;
        let value = sanitize_destination(raw);
        {
            let mut state = self.shared.lock_state()?;
            let changed = match state.trip.as_mut() {
                Some(trip) if trip.destination != value => {
                    trip.destination = value.clone();
                    true
                }
                _ => false,
            };
            if changed {
                self.shared.publish(&mut state);
            }
        }
        let result = self.shared.destination.edit(raw).await;
        if let Err(EngineError::RemoteWrite(error)) = &result {
            self.shared.revert_destination(&value, &error.to_string());
        }
        result
    }

    pub async fn flush_destination(&self) -> Result<EditOutcome, EngineError> {
        let attempted = self.snapshot().destination().map(ToOwned::to_owned);
        let result = self.shared.destination.flush().await;
        if let (Err(EngineError::RemoteWrite(error)), Some(attempted)) = (&result, attempted) {
            self.shared.revert_destination(&attempted, &error.to_string());
        }
        result
    }

    fn lock_task(&self) -> Result<MutexGuard<'_, Option<JoinHandle<()>>>, EngineError> {
        self.sync_task
            .lock()
            .map_err(|error| EngineError::State(format!("sync task lock poisoned: {error}")))
    }
}

impl<S: TripStore + ?Sized + 'static, F: ChangeFeed + ?Sized + 'static> Drop for VoteSyncEngine<S, F> {
    fn drop(&mut self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        self.shared.cancel.cancel();
    }
}

impl<S: TripStore + ?Sized + 'static, F: ChangeFeed + ?Sized + 'static> Shared<S, F> {
    fn lock_state(&self) -> Result<MutexGuard<'_, EngineState>, EngineError> {
        self.state
            .lock()
            .map_err(|error| EngineError::State(format!("engine state lock poisoned: {error}")))
    }

    fn bounds(&self, state: &EngineState) -> SelectionBounds {
        SelectionBounds::new(
            state.trip.as_ref().and_then(|trip| trip.window),
            (self.today)(),
        )
    }

    fn publish(&self, state: &mut EngineState) -> EngineSnapshot {
        state.version += 1;
        let snapshot = EngineSnapshot {
            version: state.version,
            loaded: state.loaded,
            trip: state.trip.clone(),
            votes: Arc::new(state.votes.clone()),
            participants: Arc::new(state.participants.clone()),
            local_user: state.local_user.clone(),
            mode: state.mode,
            pending_runs: state.pending.len(),
        };
        self.snapshots.send_replace(snapshot.clone());
        snapshot
    }

    fn notify(&self, notice: EngineNotice) {
        // No receivers is fine; notices are best effort.
        let _ = self.notices.send(notice);
    }

    fn degrade(&self, reason: &str) {
        warn!(trip_id = %self.trip_id, %reason, "change feed unavailable; polling only");
        self.notify(EngineNotice::SubscriptionDegraded {
            message: reason.to_string(),
        });
    }

    fn report_refresh_failure(&self, error: &EngineError) {
        warn!(trip_id = %self.trip_id, %error, "background refresh failed");
        self.notify(EngineNotice::RefreshFailed {
            message: error.to_string(),
        });
    }

    async fn finish_write(
        self: &Arc<Self>,
        job: &WriteJob,
        result: Result<(), InfraError>,
    ) -> Result<MutationOutcome, EngineError> {
        match result {
            Ok(()) => {
                {
                    let mut state = self.lock_state()?;
                    state.pending.complete(job.run_id);
                    state.write_epoch += 1;
                    self.publish(&mut state);
                }
                debug!(run_id = job.run_id, "vote write confirmed");
                if self.options.refetch_after_write {
                    self.schedule_vote_refresh();
                }
                Ok(MutationOutcome::Confirmed {
                    run_id: job.run_id,
                    dates: job.dates.clone(),
                })
            }
            Err(error) => {
                let restored = {
                    let mut guard = self.lock_state()?;
                    let state = &mut *guard;
                    let restored = state.pending.rollback(job.run_id, &mut state.votes);
                    state.write_epoch += 1;
                    self.publish(state);
                    restored
                };
                warn!(
                    run_id = job.run_id,
                    restored = restored.len(),
                    %error,
                    "vote write failed; rolled back"
                );
                if let Err(refresh_error) = self.refresh_votes().await {
                    self.report_refresh_failure(&refresh_error);
                }
                self.notify(EngineNotice::WriteFailed {
                    run_id: job.run_id,
                    dates: job.dates.clone(),
                    message: error.to_string(),
                });
                Err(EngineError::RemoteWrite(error))
            }
        }
    }

    fn schedule_vote_refresh(self: &Arc<Self>) {
        let shared = Arc::downgrade(self);
        let cancel = self.cancel.clone();
        let delay = self.options.settle_delay;
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            let Some(shared) = shared.upgrade() else {
                return;
            };
            if let Err(error) = shared.refresh_votes().await {
                shared.report_refresh_failure(&error);
            }
        });
    }

    async fn refresh(&self, plan: RefreshPlan) -> Result<bool, EngineError> {
        let mut changed = false;
        if plan.votes {
            changed |= self.refresh_votes().await?;
        }
        if plan.participants {
            changed |= self.refresh_participants().await?;
        }
        if plan.trip {
            changed |= self.refresh_trip().await?;
        }
        Ok(changed)
    }

    async fn refresh_votes(&self) -> Result<bool, EngineError> {
        let epoch = self.lock_state()?.write_epoch;
        let remote = self
            .store
            .get_votes(&self.trip_id)
            .await
            .map_err(EngineError::Refresh)?;

        let mut guard = self.lock_state()?;
        let state = &mut *guard;
        if state.write_epoch != epoch {
            debug!("a write resolved during the refresh; keeping local votes");
            return Ok(false);
        }
        let merged = merge_authoritative(remote, &state.votes, &state.pending);
        if merged == state.votes {
            return Ok(false);
        }
        state.votes = merged;
        self.publish(state);
        Ok(true)
    }

    async fn refresh_participants(&self) -> Result<bool, EngineError> {
        let participants = self
            .store
            .get_participants(&self.trip_id)
            .await
            .map_err(EngineError::Refresh)?;
        let mut state = self.lock_state()?;
        if !participants_differ(&state.participants, &participants) {
            return Ok(false);
        }
        state.participants = participants;
        self.publish(&mut state);
        Ok(true)
    }

    async fn refresh_trip(&self) -> Result<bool, EngineError> {
        if self.destination_busy() {
            return Ok(false);
        }
        let trip = self
            .store
            .get_trip(&self.trip_id)
            .await
            .map_err(EngineError::Refresh)?;
        if self.destination_busy() {
            return Ok(false);
        }
        self.destination.remember_written(trip.destination.clone());
        let mut state = self.lock_state()?;
        if state.trip.as_ref() == Some(&trip) {
            return Ok(false);
        }
        state.trip = Some(trip);
        self.publish(&mut state);
        Ok(true)
    }

    /// Puts the last accepted destination back if the view still shows
    /// `attempted`, then tells the user.
    fn revert_destination(&self, attempted: &str, message: &str) {
        let restored = self.destination.last_written();
        warn!(trip_id = %self.trip_id, %attempted, %message, "destination write failed; reverting");
        match self.lock_state() {
            Ok(mut state) => {
                let reverted = match (state.trip.as_mut(), restored.as_ref()) {
                    (Some(trip), Some(restored))
                        if trip.destination == attempted && trip.destination != *restored =>
                    {
                        trip.destination = restored.clone();
                        true
                    }
                    _ => false,
                };
                if reverted {
                    self.publish(&mut state);
                }
            }
            Err(error) => warn!(%error, "cannot revert destination"),
        }
        self.notify(EngineNotice::DestinationWriteFailed {
            attempted: attempted.to_string(),
            restored,
            message: message.to_string(),
        });
    }

    fn destination_busy(&self) -> bool {
        self.echo.destination().is_active() || self.destination.is_editing()
    }

    /// Adds `event` to `plan` unless it is an echo of this instance's own write.
    fn plan_for(&self, event: &ChangeEvent, plan: &mut RefreshPlan) {
        let local_user = self
            .lock_state()
            .ok()
            .and_then(|state| state.local_user.clone());
        if self.echo.is_self_echo(event, local_user.as_deref()) {
            debug!(table = ?event.table, kind = ?event.kind, "ignoring self echo");
            return;
        }
        match event.table {
            ChangeTable::Votes => plan.votes = true,
            ChangeTable::Participants => plan.participants = true,
            ChangeTable::Trip => plan.trip = true,
        }
    }
}

async fn next_event(subscription: &mut Option<Subscription>) -> Option<ChangeEvent> {
    match subscription {
        Some(subscription) => subscription.recv().await,
        None => std::future::pending().await,
    }
}

async fn next_destination_failure(
    failures: &mut Option<mpsc::UnboundedReceiver<DestinationFailure>>,
) -> Option<DestinationFailure> {
    match failures {
        Some(failures) => failures.recv().await,
        None => std::future::pending().await,
    }
}

#[instrument(skip_all, fields(trip_id = %shared.trip_id))]
async fn run_sync_loop<S, F>(
    shared: Arc<Shared<S, F>>,
    mut subscription: Option<Subscription>,
    mut destination_failures: Option<mpsc::UnboundedReceiver<DestinationFailure>>,
) where
    S: TripStore + ?Sized + 'static,
    F: ChangeFeed + ?Sized + 'static,
{
    let interval = shared.options.poll_interval;
    let mut poll = tokio::time::interval_at(Instant::now() + interval, interval);
    poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shared.cancel.cancelled() => {
                debug!("sync loop cancelled");
                break;
            }
            event = next_event(&mut subscription) => {
                let Some(event) = event else {
                    subscription = None;
                    shared.degrade("change feed closed");
                    continue;
                };
                let mut plan = RefreshPlan::default();
                shared.plan_for(&event, &mut plan);
                if plan.votes {
                    tokio::select! {
                        _ = shared.cancel.cancelled() => break,
                        _ = tokio::time::sleep(shared.options.settle_delay) => {}
                    }
                }
                // Coalesce whatever arrived meanwhile into one refresh.
                if let Some(subscription) = subscription.as_mut() {
                    while let Some(event) = subscription.try_recv() {
                        shared.plan_for(&event, &mut plan);
                    }
                }
                if let Err(error) = shared.refresh(plan).await {
                    shared.report_refresh_failure(&error);
                }
            }
            Some(failure) = next_destination_failure(&mut destination_failures) => {
                shared.revert_destination(&failure.attempted, &failure.message);
            }
            _ = poll.tick() => {
                match shared.refresh(RefreshPlan { votes: true, participants: true, trip: true }).await {
                    Ok(true) => debug!("poll picked up remote changes"),
                    Ok(false) => {}
                    Err(error) => shared.report_refresh_failure(&error),
                }
            }
        }
    }
    drop(subscription);
}

async fn write_votes<S: TripStore + ?Sized>(store: &S, trip_id: &str, job: &WriteJob) -> Result<(), InfraError> {
    store.delete_votes(trip_id, &job.dates, &job.user_id).await?;
    if let VoteAction::Set(kind) = job.action {
        let votes: Vec<Vote> = job
            .dates
            .iter()
            .map(|date| Vote::new(*date, job.user_id.clone(), kind))
            .collect();
        store.upsert_votes(trip_id, &votes).await?;
    }
    Ok(())
}

/// Sends queued writes one at a time, in submission order.
async fn run_writer<S, F>(
    shared: Weak<Shared<S, F>>,
    store: Arc<S>,
    trip_id: String,
    echo: EchoGuard,
    mut jobs: mpsc::UnboundedReceiver<WriteJob>,
) where
    S: TripStore + ?Sized + 'static,
    F: ChangeFeed + ?Sized + 'static,
{
    while let Some(job) = jobs.recv().await {
        let result = {
            let _ticket = echo.votes().begin();
            write_votes(store.as_ref(), &trip_id, &job).await
        };
        let outcome = match shared.upgrade() {
            Some(shared) if !shared.closed.load(Ordering::SeqCst) => shared.finish_write(&job, result).await,
            _ => {
                debug!(run_id = job.run_id, "engine closed; discarding write result");
                Ok(MutationOutcome::Discarded { run_id: job.run_id })
            }
        };
        let _ = job.reply.send(outcome);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::gesture::{Point, PointerKind};
    use crate::domain::models::TripWindow;
    use crate::infrastructure::change_feed::DisabledChangeFeed;
    use crate::infrastructure::memory_store::InMemoryTripStore;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    const TRIP: &str = "trip-1";

    fn date(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 7, day).expect("valid date")
    }

    fn seeded_store() -> Arc<InMemoryTripStore> {
        let store = Arc::new(InMemoryTripStore::new());
        store
            .insert_trip(Trip {
                id: TRIP.to_string(),
                destination: "제주도".to_string(),
                window: Some(TripWindow::new(date(1), date(20)).expect("window")),
            })
            .expect("insert trip");
        for (id, name) in [("a", "민지"), ("b", "지훈")] {
            store
                .upsert_participant(TRIP, Participant::new(id, name))
                .expect("participant");
        }
        store
    }

    fn options() -> EngineOptions {
        EngineOptions {
            poll_interval: Duration::from_secs(3),
            settle_delay: Duration::from_millis(200),
            refetch_after_write: true,
            destination_debounce: Duration::from_millis(500),
            drag_threshold_px: 10.0,
        }
    }

    fn engine_for<S: TripStore + ?Sized + 'static, F: ChangeFeed + ?Sized + 'static>(
        store: Arc<S>,
        feed: Arc<F>,
        user: &str,
    ) -> VoteSyncEngine<S, F> {
        VoteSyncEngine::builder(TRIP, store, feed)
            .with_options(options())
            .with_today_provider(Arc::new(|| date(1)))
            .with_local_user(user)
            .build()
    }

    /// Reads from the wrapped store; fails writes that touch `fail_on`.
    struct FlakyStore {
        inner: Arc<InMemoryTripStore>,
        fail_on: Option<NaiveDate>,
        failing_destination: Option<&'static str>,
        vote_reads: AtomicUsize,
    }

    impl FlakyStore {
        fn new(inner: Arc<InMemoryTripStore>, fail_on: Option<NaiveDate>) -> Self {
            Self {
                inner,
                fail_on,
                failing_destination: None,
                vote_reads: AtomicUsize::new(0),
            }
        }

        fn failing_destination(mut self, destination: &'static str) -> Self {
            self.failing_destination = Some(destination);
            self
        }

        fn check(&self, dates: impl IntoIterator<Item = NaiveDate>) -> Result<(), InfraError> {
            let fail_on = self.fail_on;
            if dates.into_iter().any(|date| Some(date) == fail_on) {
                return Err(InfraError::Http("connection reset".to_string()));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl TripStore for FlakyStore {
        async fn get_trip(&self, trip_id: &str) -> Result<Trip, InfraError> {
            self.inner.get_trip(trip_id).await
        }

        async fn get_votes(&self, trip_id: &str) -> Result<Vec<Vote>, InfraError> {
            self.vote_reads.fetch_add(1, Ordering::SeqCst);
            self.inner.get_votes(trip_id).await
        }

        async fn upsert_votes(&self, trip_id: &str, votes: &[Vote]) -> Result<(), InfraError> {
            self.check(votes.iter().map(|vote| vote.date))?;
            self.inner.upsert_votes(trip_id, votes).await
        }

        async fn delete_votes(
            &self,
            trip_id: &str,
            dates: &[NaiveDate],
            user_id: &str,
        ) -> Result<(), InfraError> {
            self.check(dates.iter().copied())?;
            self.inner.delete_votes(trip_id, dates, user_id).await
        }

        async fn get_participants(&self, trip_id: &str) -> Result<Vec<Participant>, InfraError> {
            self.inner.get_participants(trip_id).await
        }

        async fn update_destination(&self, trip_id: &str, destination: &str) -> Result<(), InfraError> {
            if self.failing_destination == Some(destination) {
                return Err(InfraError::Http("offline".to_string()));
            }
            self.inner.update_destination(trip_id, destination).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn optimistic_vote_is_visible_before_confirmation() {
        let store = seeded_store();
        let engine = engine_for(Arc::clone(&store), Arc::clone(&store), "a");
        engine.start().await.expect("start");

        let pending = engine
            .apply_vote([date(2), date(3)], VoteAction::Set(VoteKind::Available))
            .expect("apply");
        let snapshot = engine.snapshot();
        assert_eq!(snapshot.votes.len(), 2);
        assert_eq!(snapshot.pending_runs, 1);

        let outcome = pending.settled().await.expect("confirmed");
        assert_eq!(
            outcome,
            MutationOutcome::Confirmed {
                run_id: 1,
                dates: vec![date(2), date(3)],
            }
        );
        assert_eq!(store.get_votes(TRIP).await.expect("votes").len(), 2);
        assert_eq!(engine.snapshot().pending_runs, 0);
        engine.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn validation_rejects_before_any_change() {
        let store = seeded_store();
        let engine = VoteSyncEngine::builder(TRIP, Arc::clone(&store), Arc::clone(&store))
            .with_today_provider(Arc::new(|| date(1)))
            .build();
        engine.start().await.expect("start");

        assert!(matches!(
            engine.apply_vote([date(2)], VoteAction::Set(VoteKind::Available)),
            Err(EngineError::NoActiveUser)
        ));
        engine.set_local_user(Some("a".to_string())).expect("user");
        assert!(matches!(
            engine.apply_vote(Vec::<NaiveDate>::new(), VoteAction::Clear),
            Err(EngineError::Validation(_))
        ));
        match engine.apply_vote([date(5), date(25)], VoteAction::Set(VoteKind::Available)) {
            Err(EngineError::OutsideWindow(dates)) => assert_eq!(dates, vec![date(25)]),
            other => panic!("expected outside window, got {other:?}"),
        }
        assert!(engine.snapshot().votes.is_empty());
        engine.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn clearing_nothing_is_a_no_op() {
        let store = seeded_store();
        let engine = engine_for(Arc::clone(&store), Arc::clone(&store), "a");
        engine.start().await.expect("start");
        let version = engine.snapshot().version;

        let pending = engine.apply_vote([date(4)], VoteAction::Clear).expect("clear");
        assert_eq!(pending.run_id(), None);
        assert_eq!(pending.settled().await.expect("outcome"), MutationOutcome::Unchanged);
        assert_eq!(engine.snapshot().version, version);
        engine.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn set_then_clear_restores_previous_votes() {
        let store = seeded_store();
        store
            .upsert_votes(TRIP, &[Vote::new(date(3), "b", VoteKind::Unavailable)])
            .await
            .expect("seed");
        let engine = engine_for(Arc::clone(&store), Arc::clone(&store), "a");
        let before = engine.start().await.expect("start").votes;

        let set = engine
            .apply_vote([date(3), date(4)], VoteAction::Set(VoteKind::Available))
            .expect("set");
        let clear = engine.apply_vote([date(3), date(4)], VoteAction::Clear).expect("clear");
        assert_eq!(*engine.snapshot().votes, *before);

        set.settled().await.expect("set confirmed");
        clear.settled().await.expect("clear confirmed");
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(*engine.snapshot().votes, *before);
        engine.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn failed_write_rolls_back_and_notifies() {
        let inner = seeded_store();
        let store = Arc::new(FlakyStore::new(Arc::clone(&inner), Some(date(6))));
        let engine = engine_for(Arc::clone(&store), Arc::new(DisabledChangeFeed), "a");
        let mut notices = engine.notices();
        engine.start().await.expect("start");

        let pending = engine
            .apply_vote([date(6), date(7)], VoteAction::Set(VoteKind::Available))
            .expect("apply");
        assert_eq!(engine.snapshot().votes.len(), 2);

        assert!(matches!(pending.settled().await, Err(EngineError::RemoteWrite(_))));
        let snapshot = engine.snapshot();
        assert!(snapshot.votes.is_empty());
        assert_eq!(snapshot.pending_runs, 0);

        loop {
            match notices.recv().await.expect("notice") {
                EngineNotice::WriteFailed { dates, .. } => {
                    assert_eq!(dates, vec![date(6), date(7)]);
                    break;
                }
                EngineNotice::SubscriptionDegraded { .. } => continue,
                other => panic!("unexpected notice {other:?}"),
            }
        }
        engine.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn older_failure_keeps_newer_optimistic_state() {
        let inner = seeded_store();
        let store = Arc::new(FlakyStore::new(Arc::clone(&inner), Some(date(8))));
        let engine = engine_for(Arc::clone(&store), Arc::new(DisabledChangeFeed), "a");
        engine.start().await.expect("start");

        let first = engine
            .apply_vote([date(8), date(9)], VoteAction::Set(VoteKind::Available))
            .expect("first");
        let second = engine
            .apply_vote([date(9), date(10)], VoteAction::Set(VoteKind::Unavailable))
            .expect("second");

        assert!(first.settled().await.is_err());
        let snapshot = engine.snapshot();
        assert_eq!(snapshot.votes.get(date(8), "a"), None);
        assert_eq!(snapshot.votes.get(date(9), "a"), Some(VoteKind::Unavailable));

        assert!(matches!(
            second.settled().await.expect("second confirmed"),
            MutationOutcome::Confirmed { .. }
        ));
        tokio::time::sleep(Duration::from_secs(1)).await;
        let votes = engine.snapshot().votes;
        assert_eq!(votes.get(date(9), "a"), Some(VoteKind::Unavailable));
        assert_eq!(votes.get(date(10), "a"), Some(VoteKind::Unavailable));
        assert_eq!(votes.len(), 2);
        engine.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_sessions_keep_both_votes() {
        let store = seeded_store();
        let alice = engine_for(Arc::clone(&store), Arc::clone(&store), "a");
        let bob = engine_for(Arc::clone(&store), Arc::clone(&store), "b");
        alice.start().await.expect("start a");
        bob.start().await.expect("start b");

        let from_alice = alice
            .apply_vote([date(12)], VoteAction::Set(VoteKind::Available))
            .expect("alice");
        let from_bob = bob
            .apply_vote([date(12)], VoteAction::Set(VoteKind::Unavailable))
            .expect("bob");
        from_alice.settled().await.expect("alice confirmed");
        from_bob.settled().await.expect("bob confirmed");

        tokio::time::sleep(Duration::from_secs(1)).await;
        for engine in [&alice, &bob] {
            let votes = engine.snapshot().votes;
            assert_eq!(votes.get(date(12), "a"), Some(VoteKind::Available));
            assert_eq!(votes.get(date(12), "b"), Some(VoteKind::Unavailable));
        }
        alice.shutdown().await;
        bob.shutdown().await;
        assert_eq!(store.subscriber_count(TRIP), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn backstop_poll_picks_up_silent_changes_and_stops_on_shutdown() {
        let inner = seeded_store();
        let store = Arc::new(FlakyStore::new(Arc::clone(&inner), None));
        let engine = engine_for(Arc::clone(&store), Arc::new(DisabledChangeFeed), "a");
        engine.start().await.expect("start");

        inner
            .upsert_votes(TRIP, &[Vote::new(date(15), "b", VoteKind::Available)])
            .await
            .expect("remote change");
        tokio::time::sleep(Duration::from_millis(3_100)).await;
        assert_eq!(engine.snapshot().votes.get(date(15), "b"), Some(VoteKind::Available));

        let version = engine.snapshot().version;
        tokio::time::sleep(Duration::from_millis(3_000)).await;
        assert_eq!(engine.snapshot().version, version);

        engine.shutdown().await;
        let reads = store.vote_reads.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(store.vote_reads.load(Ordering::SeqCst), reads);
        assert!(matches!(
            engine.apply_vote([date(2)], VoteAction::Set(VoteKind::Available)),
            Err(EngineError::State(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn write_after_shutdown_is_discarded() {
        let store = seeded_store();
        let engine = engine_for(Arc::clone(&store), Arc::clone(&store), "a");
        engine.start().await.expect("start");

        let pending = engine
            .apply_vote([date(3)], VoteAction::Set(VoteKind::Available))
            .expect("apply");
        engine.shutdown().await;
        assert_eq!(
            pending.settled().await.expect("outcome"),
            MutationOutcome::Discarded { run_id: 1 }
        );
        assert_eq!(store.get_votes(TRIP).await.expect("votes").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn initial_load_failure_is_blocking() {
        let store = Arc::new(InMemoryTripStore::new());
        let engine = engine_for(Arc::clone(&store), Arc::clone(&store), "a");
        let error = engine.start().await.expect_err("missing trip");
        assert!(error.is_blocking());
        assert!(!engine.snapshot().loaded);
    }

    #[tokio::test(start_paused = true)]
    async fn pointer_gestures_drive_mutations() {
        let store = seeded_store();
        let engine = engine_for(Arc::clone(&store), Arc::clone(&store), "a");
        engine.start().await.expect("start");

        let down = PointerEvent::Down {
            date: date(3),
            pointer: PointerKind::Mouse,
            position: Some(Point::new(0.0, 0.0)),
        };
        assert!(engine.pointer(down).expect("down").is_none());
        assert!(engine.pointer(PointerEvent::Enter { date: date(5) }).expect("enter").is_none());
        let preview = engine.drag_preview().expect("preview").expect("dragging");
        assert_eq!(preview.dates, vec![date(3), date(4), date(5)]);
        assert_eq!(preview.intent, DragIntent::Add);

        let write = engine.pointer(PointerEvent::Up).expect("up").expect("drag committed");
        write.settled().await.expect("confirmed");
        assert_eq!(engine.snapshot().votes.votes_for_user("a").len(), 3);

        // Tapping a date that already matches the mode clears it.
        engine.pointer(PointerEvent::Down { date: date(4), pointer: PointerKind::Touch, position: None }).expect("down");
        let tap = engine.pointer(PointerEvent::Up).expect("up").expect("tap committed");
        tap.settled().await.expect("confirmed");
        assert_eq!(engine.snapshot().votes.get(date(4), "a"), None);

        engine.set_vote_mode(VoteKind::Unavailable).expect("mode");
        engine.toggle(date(3)).expect("toggle").settled().await.expect("confirmed");
        assert_eq!(engine.snapshot().votes.get(date(3), "a"), Some(VoteKind::Unavailable));
        engine.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn destination_edits_are_not_overwritten_by_their_echo() {
        let store = seeded_store();
        let engine = engine_for(Arc::clone(&store), Arc::clone(&store), "a");
        engine.start().await.expect("start");

        engine.edit_destination("부산").await.expect("leading");
        engine.edit_destination("부산 해운대").await.expect("trailing");
        assert_eq!(engine.snapshot().destination(), Some("부산 해운대"));

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(store.get_trip(TRIP).await.expect("trip").destination, "부산 해운대");
        assert_eq!(engine.snapshot().destination(), Some("부산 해운대"));
        engine.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn failed_trailing_destination_reverts_to_last_written() {
        let inner = seeded_store();
        let store = Arc::new(FlakyStore::new(Arc::clone(&inner), None).failing_destination("부산 해운대"));
        let engine = engine_for(Arc::clone(&store), Arc::clone(&inner), "a");
        let mut notices = engine.notices();
        engine.start().await.expect("start");

        assert_eq!(engine.edit_destination("부산").await.expect("leading"), EditOutcome::Written);
        assert_eq!(
            engine.edit_destination("부산 해운대").await.expect("trailing"),
            EditOutcome::Scheduled
        );
        assert_eq!(engine.snapshot().destination(), Some("부산 해운대"));

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(engine.snapshot().destination(), Some("부산"));
        assert_eq!(inner.get_trip(TRIP).await.expect("trip").destination, "부산");

        loop {
            match notices.recv().await.expect("notice") {
                EngineNotice::DestinationWriteFailed {
                    attempted,
                    restored,
                    message,
                } => {
                    assert_eq!(attempted, "부산 해운대");
                    assert_eq!(restored.as_deref(), Some("부산"));
                    assert!(message.contains("offline"));
                    break;
                }
                EngineNotice::SubscriptionDegraded { .. } | EngineNotice::RefreshFailed { .. } => continue,
                other => panic!("unexpected notice {other:?}"),
            }
        }
        engine.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn failed_leading_destination_restores_loaded_value() {
        let inner = seeded_store();
        let store = Arc::new(FlakyStore::new(Arc::clone(&inner), None).failing_destination("부산"));
        let engine = engine_for(Arc::clone(&store), Arc::new(DisabledChangeFeed), "a");
        let mut notices = engine.notices();
        engine.start().await.expect("start");

        assert!(matches!(
            engine.edit_destination("부산").await,
            Err(EngineError::RemoteWrite(_))
        ));
        assert_eq!(engine.snapshot().destination(), Some("제주도"));

        loop {
            match notices.recv().await.expect("notice") {
                EngineNotice::DestinationWriteFailed { attempted, restored, .. } => {
                    assert_eq!(attempted, "부산");
                    assert_eq!(restored.as_deref(), Some("제주도"));
                    break;
                }
                EngineNotice::SubscriptionDegraded { .. } => continue,
                other => panic!("unexpected notice {other:?}"),
            }
        }
        engine.shutdown().await;
    }
}
