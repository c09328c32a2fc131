mod process;
mod registry;

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::core::bot::{BotId, BotStatus};
use crate::core::error::{FailureReason, StoreError, SupervisorError};
use crate::core::state::{BotState, TransitionEvent, can_transition};
use crate::core::store::StatusStore;

pub use process::{BotLauncher, ExitOutcome, READY_MARKER, SelfExecLauncher, TrackedProcess};
use registry::{BotEntry, Registry, Slot, StopRequests};

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub observation_window: Duration,
    pub grace_period: Duration,
    pub stderr_tail_lines: usize,
    /// Upper bound on waiting for the exit after a forced kill.
    pub reap_timeout: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            observation_window: Duration::from_millis(1500),
            grace_period: Duration::from_millis(5000),
            stderr_tail_lines: 20,
            reap_timeout: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMode {
    /// Leave `online` in the store so the next boot resumes those bots.
    Preserve,
    /// Persist `offline` for every stopped bot.
    Clean,
}

#[derive(Debug, Clone, Serialize)]
pub struct BotSnapshot {
    pub id: BotId,
    pub state: BotState,
    pub pid: Option<u32>,
    pub stderr_tail: Vec<String>,
}

enum Observed {
    Ready,
    WindowElapsed,
    Exited(ExitOutcome),
    StopRequested,
}

const EVENT_CAPACITY: usize = 256;

/// Owns every bot process and keeps the recorded status in line with it.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

struct Inner {
    registry: Registry,
    store: Arc<dyn StatusStore>,
    launcher: Arc<dyn BotLauncher>,
    config: SupervisorConfig,
    events: broadcast::Sender<TransitionEvent>,
}

impl Supervisor {
    pub fn new(
        store: Arc<dyn StatusStore>,
        launcher: Arc<dyn BotLauncher>,
        config: SupervisorConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                registry: Registry::default(),
                store,
                launcher,
                config,
                events,
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TransitionEvent> {
        self.inner.events.subscribe()
    }

    pub fn get_running_ids(&self) -> BTreeSet<BotId> {
        self.inner.registry.running_ids()
    }

    pub fn snapshot(&self, id: &BotId) -> BotSnapshot {
        match self.inner.registry.get(id) {
            Some(entry) => {
                let view = entry.view();
                BotSnapshot {
                    id: id.clone(),
                    state: view.state,
                    pid: view.pid,
                    stderr_tail: view.stderr.map(|t| t.lines()).unwrap_or_default(),
                }
            }
            None => BotSnapshot {
                id: id.clone(),
                state: BotState::Stopped,
                pid: None,
                stderr_tail: Vec::new(),
            },
        }
    }

    pub async fn start(&self, id: &BotId) -> Result<BotState, SupervisorError> {
        let supervisor = self.clone();
        let entry = self.inner.registry.entry(id);
        let mut stop_requests = entry.stop_requests();
        self.detached(id, async move {
            let mut slot = entry.slot.lock().await;
            supervisor
                .start_locked(&entry, &mut slot, &mut stop_requests)
                .await
        })
        .await
    }

    pub async fn stop(&self, id: &BotId) -> Result<BotState, SupervisorError> {
        let supervisor = self.clone();
        let entry = self.inner.registry.entry(id);
        let requested = entry.request_stop();
        self.detached(id, async move {
            let (state, untouched) = {
                let mut slot = entry.slot.lock().await;
                slot.stops_handled = slot.stops_handled.max(requested);
                let untouched = slot.generation == 0 && slot.process.is_none();
                if requested <= slot.started_after {
                    debug!(bot_id = %entry.id, "Stop request predates the current start");
                    (slot.state, false)
                } else {
                    (supervisor.stop_locked(&entry, &mut slot, true).await, untouched)
                }
            };
            if untouched {
                debug!(bot_id = %entry.id, "Stop requested for untracked bot");
                supervisor.inner.registry.release(&entry);
            }
            Ok(state)
        })
        .await
    }

    pub async fn restart(&self, id: &BotId) -> Result<BotState, SupervisorError> {
        let supervisor = self.clone();
        let entry = self.inner.registry.entry(id);
        let requested = entry.request_stop();
        let mut stop_requests = entry.stop_requests();
        self.detached(id, async move {
            let mut slot = entry.slot.lock().await;
            slot.stops_handled = slot.stops_handled.max(requested);
            supervisor.stop_locked(&entry, &mut slot, true).await;
            supervisor
                .start_locked(&entry, &mut slot, &mut stop_requests)
                .await
        })
        .await
    }

    /// Force-stops the bot and removes its record. Returns whether a record
    /// existed.
    pub async fn delete(&self, id: &BotId) -> Result<bool, SupervisorError> {
        let supervisor = self.clone();
        let entry = self.inner.registry.entry(id);
        let requested = entry.request_stop();
        self.detached(id, async move {
            let existed = {
                let mut slot = entry.slot.lock().await;
                slot.stops_handled = slot.stops_handled.max(requested);
                supervisor.stop_locked(&entry, &mut slot, true).await;
                slot.pending = None;
                supervisor.inner.store.delete_bot(&entry.id).await?
            };
            supervisor.inner.registry.retire(&entry);
            info!(bot_id = %entry.id, existed, "Bot deleted");
            Ok(existed)
        })
        .await
    }

    /// Reconciles bots the store still lists as online although nothing in
    /// this process tracks them.
    pub async fn resume_on_boot(
        &self,
        online: Vec<BotId>,
        restart: bool,
    ) -> Vec<(BotId, Result<BotState, SupervisorError>)> {
        let mut results = Vec::with_capacity(online.len());
        for id in online {
            if let Err(e) = self
                .inner
                .store
                .update_status(&id, BotStatus::Offline, None)
                .await
            {
                warn!(bot_id = %id, "Failed to reset stale online status: {}", e);
            }
            if !restart {
                results.push((id, Ok(BotState::Stopped)));
                continue;
            }
            info!(bot_id = %id, "Resuming bot that was online at last shutdown");
            let result = self.start(&id).await;
            if let Err(e) = &result {
                warn!(bot_id = %id, "Resume failed: {}", e);
            }
            results.push((id, result));
        }
        results
    }

    /// Stops every tracked process concurrently.
    pub async fn shutdown(&self, mode: ShutdownMode) {
        let persist = mode == ShutdownMode::Clean;
        let mut tasks = JoinSet::new();
        for entry in self.inner.registry.all() {
            let supervisor = self.clone();
            tasks.spawn(async move {
                let requested = entry.request_stop();
                let mut slot = entry.slot.lock().await;
                slot.stops_handled = slot.stops_handled.max(requested);
                supervisor.stop_locked(&entry, &mut slot, persist).await;
            });
        }
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!("Shutdown task failed: {}", e);
            }
        }
        info!("Supervisor shut down ({:?})", mode);
    }

    /// Runs a lifecycle operation on its own task, so a caller that stops
    /// waiting cannot leave the bot halfway through a transition.
    async fn detached<T, F>(&self, id: &BotId, op: F) -> Result<T, SupervisorError>
    where
        T: Send + 'static,
        F: Future<Output = Result<T, SupervisorError>> + Send + 'static,
    {
        match tokio::spawn(op).await {
            Ok(result) => result,
            Err(e) => {
                error!(bot_id = %id, "Lifecycle task failed: {}", e);
                Err(SupervisorError::TaskFailed {
                    id: id.clone(),
                    reason: e.to_string(),
                })
            }
        }
    }

    async fn start_locked(
        &self,
        entry: &Arc<BotEntry>,
        slot: &mut Slot,
        stop_requests: &mut StopRequests,
    ) -> Result<BotState, SupervisorError> {
        // A stop issued after this start and still waiting for the lock wins
        // before anything is spawned.
        if let Some(requested) = stop_requests.pending()
            && requested > slot.stops_handled
        {
            info!(bot_id = %entry.id, "Start given up for a queued stop request");
            return Err(SupervisorError::Cancelled(entry.id.clone()));
        }

        match slot.process.as_ref().map(|p| p.exit_outcome().is_some()) {
            Some(false) => return Err(SupervisorError::AlreadyRunning(entry.id.clone())),
            Some(true) => {
                self.reconcile_exit(entry, slot).await;
            }
            None => {}
        }

        if self.inner.store.get_status(&entry.id).await?.is_none() {
            return Err(StoreError::NotFound(entry.id.clone()).into());
        }

        slot.generation += 1;
        slot.started_after = stop_requests.since;
        let generation = slot.generation;
        if !self
            .transition(entry, slot, BotState::Starting, None, Vec::new(), true)
            .await
        {
            return Err(SupervisorError::InvalidState {
                id: entry.id.clone(),
                state: slot.state,
            });
        }

        let spawned = TrackedProcess::spawn(
            self.inner.launcher.as_ref(),
            &entry.id,
            generation,
            self.inner.config.stderr_tail_lines,
        );
        let process = match spawned {
            Ok(process) => process,
            Err(e) => {
                let reason = FailureReason::SpawnFailure(e.to_string());
                self.transition(
                    entry,
                    slot,
                    BotState::Errored,
                    Some(reason.to_string()),
                    Vec::new(),
                    true,
                )
                .await;
                return Err(SupervisorError::SpawnFailure {
                    id: entry.id.clone(),
                    reason: e.to_string(),
                });
            }
        };
        info!(bot_id = %entry.id, pid = process.pid, generation, "Spawned bot process");

        self.spawn_reconciler(entry.clone(), generation, process.exit_receiver());
        slot.process = Some(process);
        entry.publish(slot);

        let observed = match slot.process.as_ref() {
            Some(process) => {
                tokio::select! {
                    biased;
                    outcome = process.wait_exit() => Observed::Exited(outcome),
                    _ = process.wait_ready() => Observed::Ready,
                    _ = stop_requests.changed() => Observed::StopRequested,
                    _ = tokio::time::sleep(self.inner.config.observation_window) => {
                        Observed::WindowElapsed
                    }
                }
            }
            None => Observed::Exited(ExitOutcome::WaitFailed("process handle lost".into())),
        };

        match observed {
            Observed::Ready => Ok(self.mark_running(entry, slot, "ready marker received").await),
            Observed::WindowElapsed => {
                Ok(self.mark_running(entry, slot, "observation window elapsed").await)
            }
            Observed::Exited(_) => {
                let (state, failure, stderr_tail) = self.reconcile_exit(entry, slot).await;
                match failure {
                    None => Ok(state),
                    Some(reason) => Err(SupervisorError::StartFailed {
                        id: entry.id.clone(),
                        reason,
                        stderr_tail,
                    }),
                }
            }
            Observed::StopRequested => {
                info!(bot_id = %entry.id, "Start interrupted by stop request");
                Err(SupervisorError::Cancelled(entry.id.clone()))
            }
        }
    }

    async fn mark_running(&self, entry: &BotEntry, slot: &mut Slot, reason: &str) -> BotState {
        self.transition(
            entry,
            slot,
            BotState::Running,
            Some(reason.to_string()),
            Vec::new(),
            true,
        )
        .await;
        slot.state
    }

    /// Terminates the tracked process, escalating to a kill after the grace
    /// period. With `persist` false the final state is not written, which
    /// keeps `online` in the store across a preserving shutdown.
    async fn stop_locked(&self, entry: &BotEntry, slot: &mut Slot, persist: bool) -> BotState {
        match slot.process.as_ref().map(|p| p.exit_outcome().is_some()) {
            None => return slot.state,
            Some(true) => return self.reconcile_exit(entry, slot).await.0,
            Some(false) => {}
        }

        self.transition(
            entry,
            slot,
            BotState::Stopping,
            Some("stop requested".into()),
            Vec::new(),
            persist,
        )
        .await;

        let outcome = match slot.process.as_ref() {
            Some(process) => self.terminate(entry, process).await,
            None => ExitOutcome::WaitFailed("process handle lost".into()),
        };
        if let Some(process) = slot.process.take() {
            slot.last_stderr = Some(process.stderr.clone());
        }

        self.transition(
            entry,
            slot,
            BotState::Stopped,
            Some(format!("stopped ({})", outcome)),
            Vec::new(),
            persist,
        )
        .await;
        slot.state
    }

    async fn terminate(&self, entry: &BotEntry, process: &TrackedProcess) -> ExitOutcome {
        let grace = self.inner.config.grace_period;
        process.terminate().await;
        if let Ok(outcome) = tokio::time::timeout(grace, process.wait_exit()).await {
            return outcome;
        }

        warn!(
            bot_id = %entry.id,
            pid = process.pid,
            "Bot did not exit within {:?}, killing",
            grace
        );
        process.kill().await;
        match tokio::time::timeout(self.inner.config.reap_timeout, process.wait_exit()).await {
            Ok(outcome) => outcome,
            Err(_) => {
                error!(bot_id = %entry.id, pid = process.pid, "Bot process not reaped after kill");
                ExitOutcome::WaitFailed("not reaped after kill".into())
            }
        }
    }

    /// Applies an exit nobody asked for: a clean exit stops the bot, any
    /// other ends in `Errored`. An exit seen while stopping completes the
    /// stop however the process ended.
    async fn reconcile_exit(
        &self,
        entry: &BotEntry,
        slot: &mut Slot,
    ) -> (BotState, Option<FailureReason>, Vec<String>) {
        let Some(process) = slot.process.take() else {
            return (slot.state, None, Vec::new());
        };
        let outcome = process.wait_exit().await;
        let stderr_tail = process.stderr_tail().await;
        slot.last_stderr = Some(process.stderr.clone());

        if slot.state == BotState::Stopping {
            self.transition(
                entry,
                slot,
                BotState::Stopped,
                Some(format!("stopped ({})", outcome)),
                Vec::new(),
                true,
            )
            .await;
            return (slot.state, None, Vec::new());
        }

        match outcome.failure() {
            None => {
                self.transition(
                    entry,
                    slot,
                    BotState::Stopped,
                    Some("exited cleanly".into()),
                    Vec::new(),
                    true,
                )
                .await;
                (slot.state, None, Vec::new())
            }
            Some(reason) => {
                self.transition(
                    entry,
                    slot,
                    BotState::Errored,
                    Some(reason.to_string()),
                    stderr_tail.clone(),
                    true,
                )
                .await;
                (slot.state, Some(reason), stderr_tail)
            }
        }
    }

    fn spawn_reconciler(
        &self,
        entry: Arc<BotEntry>,
        generation: u64,
        exit: watch::Receiver<Option<ExitOutcome>>,
    ) {
        let supervisor = self.clone();
        tokio::spawn(async move {
            process::wait_for_exit(exit).await;
            let mut slot = entry.slot.lock().await;
            let current = slot
                .process
                .as_ref()
                .is_some_and(|p| p.generation == generation);
            if !current {
                return;
            }
            warn!(bot_id = %entry.id, generation, "Bot process exited unexpectedly");
            supervisor.reconcile_exit(&entry, &mut slot).await;
        });
    }

    /// Moves the slot to `to` and republishes its view. Returns false, with
    /// the state left as it was, when the edge is not allowed.
    async fn transition(
        &self,
        entry: &BotEntry,
        slot: &mut Slot,
        to: BotState,
        reason: Option<String>,
        stderr_tail: Vec<String>,
        persist: bool,
    ) -> bool {
        let from = slot.state;
        if from != to {
            if !can_transition(from, to) {
                error!(
                    bot_id = %entry.id,
                    "Refusing illegal transition {} -> {}",
                    from.as_str(),
                    to.as_str()
                );
                entry.publish(slot);
                return false;
            }
            slot.state = to;
            entry.publish(slot);

            let event = TransitionEvent {
                bot_id: entry.id.clone(),
                from,
                to,
                at: Utc::now(),
                reason,
                stderr_tail,
            };
            if to == BotState::Errored {
                warn!(
                    bot_id = %event.bot_id,
                    reason = event.reason.as_deref().unwrap_or(""),
                    stderr = %event.stderr_tail.join(" | "),
                    "{} -> {}",
                    from.as_str(),
                    to.as_str()
                );
            } else {
                info!(
                    bot_id = %event.bot_id,
                    reason = event.reason.as_deref().unwrap_or(""),
                    "{} -> {}",
                    from.as_str(),
                    to.as_str()
                );
            }
            let _ = self.inner.events.send(event);
        } else {
            entry.publish(slot);
        }

        if persist && let Some(status) = to.persisted() {
            slot.pending = Some(status);
        }
        self.flush(&entry.id, slot).await;
        true
    }

    /// Writes the pending status, keeping it for the next transition when
    /// the store is unavailable.
    async fn flush(&self, id: &BotId, slot: &mut Slot) {
        let Some(status) = slot.pending else {
            return;
        };
        match self
            .inner
            .store
            .update_status(id, status, Some(Utc::now()))
            .await
        {
            Ok(()) => slot.pending = None,
            Err(StoreError::NotFound(_)) => {
                debug!(bot_id = %id, "Record gone, dropping status {}", status);
                slot.pending = None;
            }
            Err(e) => {
                warn!(
                    bot_id = %id,
                    "PersistenceFailure: could not record status {}: {}",
                    status,
                    e
                );
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests;
