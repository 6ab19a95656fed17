use crate::bus::{EventBus, StreamGap, Subscription};
use crate::executor::{DispatchRequest, Executor, ExecutorSignal, RunOutcome};
use crate::registry::{
    ActiveRunClaim, ActiveRunRegistry, AdmissionConflict, AdmittedRun, RUN_LABEL,
};
use chrono::{DateTime, Utc};
use runlog_core::events::{
    ActiveState, Event, EventBody, MessageUpdatePayload, RewindStatus, RewindStatusPayload,
    RewindUpdatePayload,
};
use runlog_core::plan::{plan_delta, Plan};
use runlog_core::rewind::{apply_rewind_flags, rewindable_indices};
use runlog_core::{is_new_thread_sentinel, Message, NewMessage, INTERRUPT_USER_MESSAGE};
use runlog_storage::{RunStore, StorageError};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::sync::{watch, Mutex as AsyncMutex};
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Busy(#[from] AdmissionConflict),
    #[error("{0}")]
    Validation(String),
    #[error("thread not found: {0}")]
    NotFound(String),
    #[error("store failure: {0}")]
    Store(StorageError),
    #[error("event encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
    #[error(transparent)]
    Gap(#[from] StreamGap),
}

impl From<StorageError> for RunError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::RunNotFound(thread_id) => RunError::NotFound(thread_id),
            other => RunError::Store(other),
        }
    }
}

/// Rewind bookkeeping for one thread, guarded by the thread's write lock.
#[derive(Debug, Default)]
pub(crate) struct ThreadSlot {
    pub(crate) rewind_status: RewindStatus,
    pub(crate) eligible: BTreeSet<u64>,
    pub(crate) in_flight: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HistorySnapshot {
    pub messages: Vec<Message>,
    pub event_cursor: u64,
    pub rewind_status: RewindStatus,
    pub plan: Option<Plan>,
}

impl HistorySnapshot {
    fn empty() -> Self {
        Self {
            messages: Vec::new(),
            event_cursor: 0,
            rewind_status: RewindStatus::Ready,
            plan: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub thread_id: String,
    pub name: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
    pub message_count: u64,
    pub active: bool,
}

pub struct RunHub {
    store: Mutex<RunStore>,
    bus: EventBus,
    registry: ActiveRunRegistry,
    executor: Arc<dyn Executor>,
    slots: Mutex<HashMap<String, Arc<AsyncMutex<ThreadSlot>>>>,
}

impl RunHub {
    pub fn new(store: RunStore, executor: Arc<dyn Executor>, event_retention: usize) -> Arc<Self> {
        Arc::new(Self {
            store: Mutex::new(store),
            bus: EventBus::new(event_retention),
            registry: ActiveRunRegistry::new(),
            executor,
            slots: Mutex::new(HashMap::new()),
        })
    }

    pub fn registry(&self) -> &ActiveRunRegistry {
        &self.registry
    }

    /// Runs a store call. On a multi-thread runtime the worker is handed
    /// off first so SQLite I/O does not stall other tasks.
    pub(crate) fn with_store<T>(
        &self,
        op: impl FnOnce(&mut RunStore) -> Result<T, StorageError>,
    ) -> Result<T, StorageError> {
        let run = || {
            let mut store = self
                .store
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            op(&mut store)
        };
        match Handle::try_current() {
            Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
                tokio::task::block_in_place(run)
            }
            _ => run(),
        }
    }

    /// The thread's write lock. First use seeds the bus cursor and the
    /// eligibility set from the store.
    pub(crate) fn slot(&self, thread_id: &str) -> Result<Arc<AsyncMutex<ThreadSlot>>, RunError> {
        let mut slots = self
            .slots
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(slot) = slots.get(thread_id) {
            return Ok(slot.clone());
        }

        let (next_cursor, messages) = self.with_store(|store| {
            Ok((store.event_cursor(thread_id)?, store.read(thread_id, 0)?))
        })?;
        self.bus.seed(thread_id, next_cursor);
        let slot = Arc::new(AsyncMutex::new(ThreadSlot {
            eligible: rewindable_indices(&messages, None),
            ..ThreadSlot::default()
        }));
        slots.insert(thread_id.to_string(), slot.clone());
        Ok(slot)
    }

    /// Callers hold the thread's slot, so the head cannot move between
    /// reserving and publishing.
    pub(crate) fn emit(&self, thread_id: &str, body: EventBody) -> Result<Event, RunError> {
        self.reserve_cursor(thread_id)?;
        Ok(self.bus.publish_body(thread_id, body)?)
    }

    /// The claim is released even when the cursor cannot be reserved.
    pub(crate) fn emit_terminal(
        &self,
        claim: &ActiveRunClaim,
        body: EventBody,
    ) -> Result<Event, RunError> {
        if let Err(err) = self.reserve_cursor(&claim.thread_id) {
            self.registry.release(claim.token);
            return Err(err);
        }
        Ok(self.bus.publish_terminal(&self.registry, claim, body)?)
    }

    /// Persists the head past the next event before it is published. A
    /// cursor that was never stored is never handed out.
    fn reserve_cursor(&self, thread_id: &str) -> Result<(), RunError> {
        let next_cursor = self.bus.head(thread_id) + 1;
        self.with_store(|store| store.set_event_cursor(thread_id, next_cursor))
            .map_err(|err| {
                warn!(event = "cursor_persist_failed", thread_id, next_cursor, error = %err);
                RunError::Store(err)
            })
    }

    pub(crate) fn emit_rewind_status(
        &self,
        thread_id: &str,
        slot: &mut ThreadSlot,
        status: RewindStatus,
        message_index: Option<u64>,
        detail: Option<String>,
    ) -> Result<Event, RunError> {
        slot.rewind_status = status;
        self.emit(
            thread_id,
            EventBody::RewindStatus(RewindStatusPayload {
                status,
                message_index,
                detail,
            }),
        )
    }

    /// Recomputes eligibility from the stored log and publishes
    /// `rewind_update` when it changed or `always` is set.
    pub(crate) fn refresh_eligibility(
        &self,
        thread_id: &str,
        slot: &mut ThreadSlot,
        always: bool,
    ) -> Result<(), RunError> {
        let messages = self.with_store(|store| store.read(thread_id, 0))?;
        let eligible = rewindable_indices(&messages, slot.in_flight);
        if always || eligible != slot.eligible {
            slot.eligible = eligible;
            self.emit(
                thread_id,
                EventBody::RewindUpdate(RewindUpdatePayload {
                    rewindable_indices: slot.eligible.iter().copied().collect(),
                }),
            )?;
        }
        Ok(())
    }

    /// Appends under the thread lock and publishes the resulting
    /// `message_update`, then any eligibility change.
    pub(crate) fn append_and_publish(
        &self,
        thread_id: &str,
        slot: &mut ThreadSlot,
        message: NewMessage,
    ) -> Result<Message, RunError> {
        let appended = self.with_store(|store| store.append(thread_id, message, Utc::now()))?;
        let delta = appended
            .plan_change
            .as_ref()
            .map(|change| plan_delta(change.previous.as_ref(), &change.current));
        let mut stored = appended.message;
        apply_rewind_flags(std::slice::from_mut(&mut stored), &slot.eligible);

        self.emit(
            thread_id,
            EventBody::MessageUpdate(MessageUpdatePayload {
                messages: vec![stored.clone()],
                plan_delta: delta,
            }),
        )?;
        self.refresh_eligibility(thread_id, slot, false)?;
        Ok(stored)
    }

    /// Admits a run, records the end-user turn and dispatches the executor.
    /// Returns the thread id, which is freshly minted for a sentinel.
    pub async fn start_run(
        self: &Arc<Self>,
        thread_id: &str,
        text: &str,
    ) -> Result<String, RunError> {
        let thread_id = thread_id.trim();
        if thread_id.is_empty() {
            return Err(RunError::Validation("thread_id must not be blank".to_string()));
        }
        if text.trim().is_empty() {
            return Err(RunError::Validation("message must not be blank".to_string()));
        }

        let is_new = is_new_thread_sentinel(thread_id);
        let name = if is_new {
            None
        } else {
            self.with_store(|store| store.run_info(thread_id))?
                .ok_or_else(|| RunError::NotFound(thread_id.to_string()))?
                .name
        };

        let mut admitted = self.registry.try_admit(thread_id, RUN_LABEL, name)?;
        if is_new {
            match self.with_store(|store| store.create_run(Utc::now())) {
                Ok(created) => {
                    self.registry.assign_thread(admitted.claim.token, &created);
                    admitted.claim.thread_id = created;
                }
                Err(err) => {
                    self.registry.release(admitted.claim.token);
                    return Err(err.into());
                }
            }
        }

        let thread_id = admitted.claim.thread_id.clone();
        if let Err(err) = self.record_turn(&thread_id, NewMessage::end_user(text)).await {
            warn!(event = "run_rejected", thread_id = %thread_id, error = %err);
            self.finish_run(&admitted.claim, RunOutcome::Error(err.to_string()))
                .await;
            return Err(err);
        }

        info!(event = "run_started", thread_id = %thread_id, token = admitted.claim.token);
        tokio::spawn(self.clone().drive(admitted));
        Ok(thread_id)
    }

    async fn record_turn(&self, thread_id: &str, message: NewMessage) -> Result<Message, RunError> {
        let slot = self.slot(thread_id)?;
        let mut guard = slot.lock().await;
        self.append_and_publish(thread_id, &mut guard, message)
    }

    /// Feeds executor output into the log until the run ends, then
    /// publishes the single terminal event for the claim.
    pub(crate) async fn drive(self: Arc<Self>, admitted: AdmittedRun) {
        let AdmittedRun { claim, cancel } = admitted;
        let outcome = self.pump(&claim.thread_id, cancel).await;
        self.finish_run(&claim, outcome).await;
    }

    async fn pump(&self, thread_id: &str, cancel: watch::Receiver<bool>) -> RunOutcome {
        let messages = match self.with_store(|store| store.read(thread_id, 0)) {
            Ok(messages) => messages,
            Err(err) => return RunOutcome::Error(format!("store failure: {err}")),
        };
        let request = DispatchRequest {
            thread_id: thread_id.to_string(),
            messages,
        };
        let mut signals = match self.executor.dispatch(request, cancel) {
            Ok(signals) => signals,
            Err(err) => return RunOutcome::Error(err.to_string()),
        };

        while let Some(signal) = signals.recv().await {
            match signal {
                ExecutorSignal::Message(message) => {
                    if let Err(err) = self.record_turn(thread_id, message).await {
                        warn!(event = "run_append_failed", thread_id, error = %err);
                        self.registry.interrupt(thread_id);
                        return RunOutcome::Error(err.to_string());
                    }
                }
                ExecutorSignal::Finished(outcome) => return outcome,
            }
        }
        RunOutcome::Error("executor stopped without a terminal signal".to_string())
    }

    pub(crate) async fn finish_run(&self, claim: &ActiveRunClaim, outcome: RunOutcome) {
        let thread_id = claim.thread_id.as_str();
        let slot = match self.slot(thread_id) {
            Ok(slot) => slot,
            Err(err) => {
                warn!(event = "run_finish_failed", thread_id, error = %err);
                self.registry.release(claim.token);
                return;
            }
        };
        let mut guard = slot.lock().await;

        if outcome == RunOutcome::Interrupted {
            let marker = NewMessage::end_user(INTERRUPT_USER_MESSAGE);
            if let Err(err) = self.append_and_publish(thread_id, &mut guard, marker) {
                warn!(event = "interrupt_marker_failed", thread_id, error = %err);
            }
        }

        guard.in_flight = None;
        if guard.rewind_status != RewindStatus::Ready {
            if let Err(err) =
                self.emit_rewind_status(thread_id, &mut guard, RewindStatus::Ready, None, None)
            {
                warn!(event = "rewind_status_failed", thread_id, error = %err);
            }
        }
        if let Err(err) = self.refresh_eligibility(thread_id, &mut guard, false) {
            warn!(event = "eligibility_refresh_failed", thread_id, error = %err);
        }
        if let Err(err) = self.with_store(|store| store.touch_run(thread_id, Utc::now())) {
            warn!(event = "run_touch_failed", thread_id, error = %err);
        }

        let body = match &outcome {
            RunOutcome::Done => EventBody::Done,
            RunOutcome::Interrupted => EventBody::Interrupted,
            RunOutcome::Error(detail) => EventBody::error(detail.clone()),
        };
        match self.emit_terminal(claim, body) {
            Ok(event) => info!(
                event = "run_finished",
                thread_id,
                kind = %event.kind,
                cursor = event.cursor,
                token = claim.token
            ),
            Err(err) => warn!(event = "run_finish_failed", thread_id, error = %err),
        }
    }

    pub fn interrupt(&self, thread_id: &str) -> Result<bool, RunError> {
        let thread_id = thread_id.trim();
        if thread_id.is_empty() || is_new_thread_sentinel(thread_id) {
            return Err(RunError::Validation(
                "interrupt needs an existing thread_id".to_string(),
            ));
        }
        Ok(self.registry.interrupt(thread_id))
    }

    /// Messages and the cursor to resume from, read under the thread lock so
    /// no event can land between them.
    pub async fn history(
        &self,
        thread_id: &str,
        force_refresh: bool,
    ) -> Result<HistorySnapshot, RunError> {
        let thread_id = thread_id.trim();
        if thread_id.is_empty() {
            return Err(RunError::Validation("thread_id must not be blank".to_string()));
        }
        if is_new_thread_sentinel(thread_id) {
            return Ok(HistorySnapshot::empty());
        }

        let slot = self.slot(thread_id)?;
        let mut guard = slot.lock().await;
        let (mut messages, plan) = self.with_store(|store| {
            Ok((store.read(thread_id, 0)?, store.latest_plan(thread_id)?))
        })?;
        if force_refresh {
            guard.eligible = rewindable_indices(&messages, guard.in_flight);
        }
        apply_rewind_flags(&mut messages, &guard.eligible);
        Ok(HistorySnapshot {
            messages,
            event_cursor: self.bus.head(thread_id),
            rewind_status: guard.rewind_status,
            plan,
        })
    }

    pub fn subscribe(&self, thread_id: &str, from_cursor: u64) -> Result<Subscription, RunError> {
        let thread_id = thread_id.trim();
        if thread_id.is_empty() || is_new_thread_sentinel(thread_id) {
            return Err(RunError::Validation(
                "events need an existing thread_id".to_string(),
            ));
        }
        let _slot = self.slot(thread_id)?;
        Ok(self.bus.subscribe(thread_id, from_cursor)?)
    }

    /// Forgets threads nobody has touched for `idle_after`: no subscriber,
    /// no claim, no pending rewind and no caller holding the slot. They are
    /// re-seeded from the store on next use.
    pub fn evict_idle(&self, idle_after: Duration) -> usize {
        let active = self.registry.current().map(|claim| claim.thread_id);
        let mut slots = self
            .slots
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let before = slots.len();
        slots.retain(|thread_id, slot| {
            if active.as_deref() == Some(thread_id.as_str()) || Arc::strong_count(slot) > 1 {
                return true;
            }
            let settled = match slot.try_lock() {
                Ok(guard) => {
                    guard.rewind_status == RewindStatus::Ready && guard.in_flight.is_none()
                }
                Err(_) => false,
            };
            !(settled && self.bus.evict_if_idle(thread_id, idle_after))
        });
        let evicted = before - slots.len();
        if evicted > 0 {
            debug!(event = "threads_evicted", evicted, remaining = slots.len());
        }
        evicted
    }

    /// Sweeps idle threads every half `idle_after`. Zero disables it.
    pub fn spawn_idle_reaper(self: &Arc<Self>, idle_after: Duration) {
        if idle_after.is_zero() {
            return;
        }
        let interval = (idle_after / 2).max(Duration::from_millis(10));
        let hub = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let Some(hub) = hub.upgrade() else {
                    return;
                };
                hub.evict_idle(idle_after);
            }
        });
    }

    pub fn list_runs(&self) -> Result<Vec<RunSummary>, RunError> {
        let active = self.registry.current().map(|claim| claim.thread_id);
        let runs = self.with_store(|store| store.list_runs())?;
        Ok(runs
            .into_iter()
            .map(|run| RunSummary {
                active: active.as_deref() == Some(run.thread_id.as_str()),
                thread_id: run.thread_id,
                name: run.name,
                created_at: run.created_at,
                last_updated_at: run.last_updated_at,
                message_count: run.message_count,
            })
            .collect())
    }

    pub fn rename_run(&self, thread_id: &str, name: &str) -> Result<(), RunError> {
        let thread_id = thread_id.trim();
        if thread_id.is_empty() || is_new_thread_sentinel(thread_id) {
            return Err(RunError::Validation(
                "rename needs an existing thread_id".to_string(),
            ));
        }
        self.with_store(|store| store.rename_run(thread_id, name))?;
        let trimmed = name.trim();
        self.registry
            .rename(thread_id, (!trimmed.is_empty()).then(|| trimmed.to_string()));
        info!(event = "run_renamed", thread_id);
        Ok(())
    }

    pub fn active_state(&self) -> ActiveState {
        self.registry.active_state()
    }

    pub fn watch_active(&self) -> watch::Receiver<ActiveState> {
        self.registry.watch()
    }
}
