//! Live console session for one selected task.
//!
//! A session keeps a [`ConsoleState`] current by polling and by realtime inserts. Every
//! selection carries an epoch and its own cancellation token: switching task cancels the old
//! loops, and any result that still arrives for an old `(task, epoch)` pair is discarded by
//! [`reduce`].

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use chrono::{DateTime, Utc};
use enrich_core::{lookup, Alert, Batch, ProgressSnapshot, TaskId, VerificationSnapshot};
use enrich_store::RealtimeFilter;
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::gateway::{ActionOutcome, Confirm, ConsoleAction, GatewayError, MissingEstimate};
use crate::jobs::JobBoard;
use crate::monitor::{detect_stuck, evaluate_health, STUCK_BATCH_THRESHOLD};
use crate::{ActionContext, ActionParams, Console};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConsoleState {
    pub task: TaskId,
    pub stage: Option<String>,
    pub epoch: u64,
    pub snapshot: ProgressSnapshot,
    pub board: JobBoard,
    pub last_refresh: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub last_outcome: Option<ActionOutcome>,
    pub in_flight: BTreeSet<ConsoleAction>,
    pub verification: Option<VerificationSnapshot>,
    pub estimate: Option<MissingEstimate>,
}

impl ConsoleState {
    pub fn new(task: TaskId, stage: Option<String>, epoch: u64) -> Self {
        Self {
            task,
            stage,
            epoch,
            snapshot: ProgressSnapshot::empty(task),
            board: JobBoard::default(),
            last_refresh: None,
            last_error: None,
            last_outcome: None,
            in_flight: BTreeSet::new(),
            verification: None,
            estimate: None,
        }
    }

    pub fn stuck_batches(&self, now: DateTime<Utc>) -> Vec<&Batch> {
        detect_stuck(&self.board.batches, now, STUCK_BATCH_THRESHOLD)
    }

    pub fn health_alerts(&self) -> Vec<Alert> {
        evaluate_health(self.snapshot.source_total, self.snapshot.facets_created, self.task)
    }

    /// True when a fresh verification and a non-empty missing estimate are both on hand.
    pub fn can_complete_missing(&self, now: DateTime<Utc>, max_age: chrono::Duration) -> bool {
        let fresh = self
            .verification
            .as_ref()
            .is_some_and(|v| v.is_fresh_for(self.task, now, max_age));
        fresh && self.estimate.as_ref().is_some_and(|e| e.missing_count > 0)
    }

    pub fn action_context(&self, now: DateTime<Utc>) -> ActionContext {
        ActionContext {
            verification: self.verification.clone(),
            estimate: self.estimate.clone(),
            ..ActionContext::from_parts(&self.snapshot, &self.board, now)
        }
    }
}

/// A result addressed to the selection that produced it.
#[derive(Debug, Clone)]
pub enum SessionUpdate {
    Refreshed {
        task: TaskId,
        epoch: u64,
        snapshot: ProgressSnapshot,
        board: Result<JobBoard, String>,
        at: DateTime<Utc>,
    },
    ActionStarted {
        task: TaskId,
        epoch: u64,
        action: ConsoleAction,
    },
    ActionFinished {
        task: TaskId,
        epoch: u64,
        action: ConsoleAction,
        result: Result<ActionOutcome, String>,
    },
}

impl SessionUpdate {
    fn scope(&self) -> (TaskId, u64) {
        match self {
            SessionUpdate::Refreshed { task, epoch, .. }
            | SessionUpdate::ActionStarted { task, epoch, .. }
            | SessionUpdate::ActionFinished { task, epoch, .. } => (*task, *epoch),
        }
    }
}

/// Applies an update. Returns false when nothing changed, including stale updates.
pub fn reduce(state: &mut ConsoleState, update: SessionUpdate) -> bool {
    let (task, epoch) = update.scope();
    if task != state.task || epoch != state.epoch {
        debug!(%task, epoch, current_task = %state.task, current_epoch = state.epoch, "dropping stale update");
        return false;
    }

    match update {
        SessionUpdate::Refreshed {
            snapshot, board, at, ..
        } => {
            state.snapshot = snapshot;
            match board {
                Ok(board) => {
                    state.board = board;
                    state.last_error = None;
                }
                Err(message) => state.last_error = Some(message),
            }
            state.last_refresh = Some(at);
            true
        }
        SessionUpdate::ActionStarted { action, .. } => state.in_flight.insert(action),
        SessionUpdate::ActionFinished { action, result, .. } => {
            state.in_flight.remove(&action);
            match result {
                Ok(outcome) => {
                    if let Some(verification) = &outcome.verification {
                        state.verification = Some(verification.clone());
                    }
                    if let Some(estimate) = &outcome.estimate {
                        state.estimate = Some(estimate.clone());
                    }
                    if action == ConsoleAction::StartMissing {
                        state.estimate = None;
                    }
                    state.last_error = None;
                    state.last_outcome = Some(outcome);
                }
                Err(message) => state.last_error = Some(message),
            }
            true
        }
    }
}

#[derive(Debug, Clone)]
struct Selection {
    task: TaskId,
    stage: Option<String>,
    epoch: u64,
    cancel: CancellationToken,
}

struct SessionInner {
    console: Arc<Console>,
    state: watch::Sender<ConsoleState>,
    selection: Mutex<Selection>,
}

impl SessionInner {
    fn selection(&self) -> MutexGuard<'_, Selection> {
        self.selection.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn apply(&self, update: SessionUpdate) -> bool {
        self.state.send_if_modified(|state| reduce(state, update))
    }

    async fn refresh_scoped(&self, selection: &Selection) -> bool {
        let task = lookup(selection.task);
        let load = async {
            tokio::join!(
                self.console.snapshot(task, selection.stage.as_deref()),
                self.console.job_board(task)
            )
        };
        let (snapshot, board) = tokio::select! {
            _ = selection.cancel.cancelled() => return false,
            loaded = load => loaded,
        };
        let board = board.map_err(|err| {
            warn!(task = %selection.task, error = %err, "job board refresh failed");
            err.to_string()
        });
        self.apply(SessionUpdate::Refreshed {
            task: selection.task,
            epoch: selection.epoch,
            snapshot,
            board,
            at: Utc::now(),
        })
    }
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        self.selection().cancel.cancel();
    }
}

/// Handle to a running session. Clones share the same state and loops.
#[derive(Clone)]
pub struct ConsoleSession {
    inner: Arc<SessionInner>,
}

impl ConsoleSession {
    /// Starts polling `task`. Must be called from within a Tokio runtime.
    pub fn start(console: Arc<Console>, task: TaskId, stage: Option<String>) -> Self {
        let selection = Selection {
            task,
            stage: stage.clone(),
            epoch: 0,
            cancel: CancellationToken::new(),
        };
        let (state, _) = watch::channel(ConsoleState::new(task, stage, 0));
        let session = Self {
            inner: Arc::new(SessionInner {
                console,
                state,
                selection: Mutex::new(selection.clone()),
            }),
        };
        session.spawn_loops(selection);
        session
    }

    pub fn console(&self) -> &Arc<Console> {
        &self.inner.console
    }

    pub fn subscribe(&self) -> watch::Receiver<ConsoleState> {
        self.inner.state.subscribe()
    }

    pub fn state(&self) -> ConsoleState {
        self.inner.state.borrow().clone()
    }

    /// Switches the session to another task or stage, abandoning all work for the old one.
    pub fn select_task(&self, task: TaskId, stage: Option<String>) {
        let selection = {
            let mut current = self.inner.selection();
            current.cancel.cancel();
            current.task = task;
            current.stage = stage.clone();
            current.epoch += 1;
            current.cancel = CancellationToken::new();
            // State and selection change together under the selection lock.
            self.inner
                .state
                .send_replace(ConsoleState::new(task, stage, current.epoch));
            current.clone()
        };
        info!(%task, epoch = selection.epoch, "console task selected");
        self.spawn_loops(selection);
    }

    /// Refreshes the current selection now. Returns false if the result was stale.
    pub async fn refresh(&self) -> bool {
        let selection = self.inner.selection().clone();
        self.inner.refresh_scoped(&selection).await
    }

    pub fn shutdown(&self) {
        self.inner.selection().cancel.cancel();
    }

    pub async fn run_action(
        &self,
        action: ConsoleAction,
        params: &ActionParams,
        confirm: &dyn Confirm,
    ) -> Result<ActionOutcome, GatewayError> {
        let selection = self.inner.selection().clone();
        let started = self.inner.apply(SessionUpdate::ActionStarted {
            task: selection.task,
            epoch: selection.epoch,
            action,
        });
        if !started {
            return Err(GatewayError::Precondition {
                action,
                reason: format!("{action} is already in progress"),
            });
        }

        let ctx = self.inner.state.borrow().action_context(Utc::now());
        let result = self
            .inner
            .console
            .execute(lookup(selection.task), action, params, &ctx, confirm)
            .await;

        let applied = self.inner.apply(SessionUpdate::ActionFinished {
            task: selection.task,
            epoch: selection.epoch,
            action,
            result: result.as_ref().cloned().map_err(|err| err.to_string()),
        });
        if !applied {
            info!(task = %selection.task, %action, "action finished after the task changed; result discarded");
        }
        if applied && result.as_ref().is_ok_and(|o| o.refresh_required) {
            self.inner.refresh_scoped(&selection).await;
        }
        result
    }

    fn spawn_loops(&self, selection: Selection) {
        let task = lookup(selection.task);

        if let Some(channel) = &task.realtime {
            // Subscribe before spawning so no insert between now and the first poll is missed.
            let mut subscription = self
                .inner
                .console
                .hub()
                .subscribe(RealtimeFilter::for_channel(channel));
            let weak: Weak<SessionInner> = Arc::downgrade(&self.inner);
            let selection = selection.clone();
            tokio::spawn(async move {
                loop {
                    let event = tokio::select! {
                        _ = selection.cancel.cancelled() => break,
                        event = subscription.next() => event,
                    };
                    let Some(event) = event else { break };
                    let Some(inner) = weak.upgrade() else { break };
                    debug!(task = %selection.task, table = %event.table, "realtime insert");
                    inner.refresh_scoped(&selection).await;
                }
                debug!(task = %selection.task, epoch = selection.epoch, "realtime loop stopped");
            });
        }

        let weak: Weak<SessionInner> = Arc::downgrade(&self.inner);
        let period = self.inner.console.config().poll_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = selection.cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let Some(inner) = weak.upgrade() else { break };
                inner.refresh_scoped(&selection).await;
            }
            debug!(task = %selection.task, epoch = selection.epoch, "poll loop stopped");
        });
    }
}
