use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use tokio::sync::watch;

use super::process::{StderrTail, TrackedProcess};
use crate::core::bot::{BotId, BotStatus};
use crate::core::state::BotState;

/// Mutable per-bot state, only touched under the entry's async lock.
pub(super) struct Slot {
    pub state: BotState,
    pub process: Option<TrackedProcess>,
    /// Bumped on every spawn; exit notifications from older spawns are stale.
    pub generation: u64,
    /// Stop sequence a start had seen when it spawned the current process.
    /// Stop requests at or below it are older than that process.
    pub started_after: u64,
    /// Status that still has to reach the store after a failed write.
    pub pending: Option<BotStatus>,
    /// Highest stop request a stop has already been applied for.
    pub stops_handled: u64,
    /// Tail of the last process, kept after it has been reaped.
    pub last_stderr: Option<StderrTail>,
}

impl Slot {
    fn new() -> Self {
        Self {
            state: BotState::Stopped,
            process: None,
            generation: 0,
            started_after: 0,
            pending: None,
            stops_handled: 0,
            last_stderr: None,
        }
    }
}

/// Stop requests seen from the point a lifecycle call subscribed.
pub(super) struct StopRequests {
    rx: watch::Receiver<u64>,
    pub since: u64,
}

impl StopRequests {
    /// The newest stop request, if one was issued after subscribing.
    pub fn pending(&mut self) -> Option<u64> {
        let latest = *self.rx.borrow_and_update();
        (latest > self.since).then_some(latest)
    }

    /// Resolves on the next stop request.
    pub async fn changed(&mut self) {
        if self.rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Lock-free view of an entry, republished after every change to its slot.
#[derive(Debug, Clone)]
pub(super) struct EntryView {
    pub state: BotState,
    pub pid: Option<u32>,
    pub stderr: Option<StderrTail>,
}

pub(super) struct BotEntry {
    pub id: BotId,
    pub slot: tokio::sync::Mutex<Slot>,
    stop_seq: watch::Sender<u64>,
    view: watch::Sender<EntryView>,
}

impl BotEntry {
    fn new(id: BotId) -> Self {
        let (stop_seq, _) = watch::channel(0);
        let (view, _) = watch::channel(EntryView {
            state: BotState::Stopped,
            pid: None,
            stderr: None,
        });
        Self {
            id,
            slot: tokio::sync::Mutex::new(Slot::new()),
            stop_seq,
            view,
        }
    }

    /// Announces a stop without waiting for the slot lock, so an in-flight
    /// start can give way.
    pub fn request_stop(&self) -> u64 {
        let mut requested = 0;
        self.stop_seq.send_modify(|seq| {
            *seq += 1;
            requested = *seq;
        });
        requested
    }

    /// Stop requests issued after this call.
    pub fn stop_requests(&self) -> StopRequests {
        let mut rx = self.stop_seq.subscribe();
        let since = *rx.borrow_and_update();
        StopRequests { rx, since }
    }

    pub fn publish(&self, slot: &Slot) {
        let stderr = slot
            .process
            .as_ref()
            .map(|p| p.stderr.clone())
            .or_else(|| slot.last_stderr.clone());
        self.view.send_replace(EntryView {
            state: slot.state,
            pid: slot.process.as_ref().map(|p| p.pid),
            stderr,
        });
    }

    pub fn view(&self) -> EntryView {
        self.view.borrow().clone()
    }
}

/// All bot entries keyed by id. Entries are created on first use and only
/// dropped by `release` once nobody else holds them, so a per-id lock is
/// never replaced while someone waits on it.
#[derive(Default)]
pub(super) struct Registry {
    entries: Mutex<HashMap<BotId, Arc<BotEntry>>>,
}

impl Registry {
    pub fn entry(&self, id: &BotId) -> Arc<BotEntry> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries
            .entry(id.clone())
            .or_insert_with(|| Arc::new(BotEntry::new(id.clone())))
            .clone()
    }

    pub fn get(&self, id: &BotId) -> Option<Arc<BotEntry>> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.get(id).cloned()
    }

    /// Removes `entry` if the map and the caller hold its only references
    /// and no process is attached. Returns whether it was removed.
    pub fn release(&self, entry: &Arc<BotEntry>) -> bool {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let current = entries
            .get(&entry.id)
            .is_some_and(|held| Arc::ptr_eq(held, entry));
        if !current || Arc::strong_count(entry) != 2 {
            return false;
        }
        let idle = entry
            .slot
            .try_lock()
            .is_ok_and(|slot| slot.process.is_none());
        if idle {
            entries.remove(&entry.id);
        }
        idle
    }

    /// Drops the entry of a deleted bot. Operations still queued on its lock
    /// find no record and do nothing.
    pub fn retire(&self, entry: &Arc<BotEntry>) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        if entries
            .get(&entry.id)
            .is_some_and(|held| Arc::ptr_eq(held, entry))
        {
            entries.remove(&entry.id);
        }
    }

    pub fn all(&self) -> Vec<Arc<BotEntry>> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.values().cloned().collect()
    }

    pub fn running_ids(&self) -> BTreeSet<BotId> {
        self.all()
            .into_iter()
            .filter(|entry| entry.view().pid.is_some())
            .map(|entry| entry.id.clone())
            .collect()
    }
}
