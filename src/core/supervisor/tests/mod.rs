mod concurrency;
mod stop;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::process::Command;

use super::{BotLauncher, Supervisor, SupervisorConfig};
use crate::core::bot::{BotId, BotStatus, BotType, NewBot, Platform};
use crate::core::error::StoreError;
use crate::core::state::{BotState, TransitionEvent};
use crate::core::store::{SqliteStore, StatusStore};

pub(super) const READY: &str = "echo BOTDECK_READY; exec sleep 30";
pub(super) const SILENT: &str = "exec sleep 30";
pub(super) const CLEAN_EXIT: &str = "exit 0";
pub(super) const BAD_TOKEN: &str = "echo 'starting adapter' >&2; echo 'invalid token' >&2; exit 3";
pub(super) const IGNORES_TERM: &str =
    "trap '' TERM; echo BOTDECK_READY; while :; do sleep 1; done";

/// Runs each bot as `sh -c <script>`, with a per-bot override.
pub(super) struct ScriptLauncher {
    default: String,
    scripts: Mutex<HashMap<BotId, String>>,
    pub spawns: AtomicUsize,
}

impl ScriptLauncher {
    pub fn new(default: &str) -> Self {
        Self {
            default: default.to_string(),
            scripts: Mutex::new(HashMap::new()),
            spawns: AtomicUsize::new(0),
        }
    }

    pub fn set_script(&self, id: &BotId, script: impl Into<String>) {
        self.scripts.lock().unwrap().insert(id.clone(), script.into());
    }

    pub fn spawn_count(&self) -> usize {
        self.spawns.load(Ordering::SeqCst)
    }
}

impl BotLauncher for ScriptLauncher {
    fn command(&self, id: &BotId) -> std::io::Result<Command> {
        self.spawns.fetch_add(1, Ordering::SeqCst);
        let script = self
            .scripts
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .unwrap_or_else(|| self.default.clone());
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script).env("BOT_ID", id.as_str());
        Ok(cmd)
    }
}

/// Wraps the real store and fails status writes on demand.
pub(super) struct FlakyStore {
    pub inner: SqliteStore,
    failing: AtomicBool,
    written: Mutex<Vec<BotStatus>>,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self {
            inner: SqliteStore::open_in_memory().unwrap(),
            failing: AtomicBool::new(false),
            written: Mutex::new(Vec::new()),
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn written(&self) -> Vec<BotStatus> {
        self.written.lock().unwrap().clone()
    }
}

#[async_trait]
impl StatusStore for FlakyStore {
    async fn update_status(
        &self,
        id: &BotId,
        status: BotStatus,
        last_active: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::Io(std::io::Error::other("disk unavailable")));
        }
        self.inner.update_status(id, status, last_active).await?;
        self.written.lock().unwrap().push(status);
        Ok(())
    }

    async fn get_status(&self, id: &BotId) -> Result<Option<BotStatus>, StoreError> {
        self.inner.get_status(id).await
    }

    async fn touch(&self, id: &BotId, at: DateTime<Utc>) -> Result<(), StoreError> {
        self.inner.touch(id, at).await
    }

    async fn delete_bot(&self, id: &BotId) -> Result<bool, StoreError> {
        self.inner.delete_bot(id).await
    }
}

pub(super) struct Harness {
    pub supervisor: Supervisor,
    pub store: Arc<FlakyStore>,
    pub launcher: Arc<ScriptLauncher>,
}

pub(super) fn fast_config() -> SupervisorConfig {
    SupervisorConfig {
        observation_window: Duration::from_millis(300),
        grace_period: Duration::from_millis(1000),
        stderr_tail_lines: 20,
        reap_timeout: Duration::from_secs(2),
    }
}

pub(super) fn harness(default_script: &str) -> Harness {
    harness_with(default_script, fast_config())
}

pub(super) fn harness_with(default_script: &str, config: SupervisorConfig) -> Harness {
    let store = Arc::new(FlakyStore::new());
    let launcher = Arc::new(ScriptLauncher::new(default_script));
    let supervisor = Supervisor::new(store.clone(), launcher.clone(), config);
    Harness {
        supervisor,
        store,
        launcher,
    }
}

impl Harness {
    pub async fn add_bot(&self, name: &str) -> BotId {
        self.store
            .inner
            .create_bot(NewBot {
                name: name.to_string(),
                platform: Platform::Discord,
                bot_type: BotType::Standard,
                config: serde_json::json!({ "token": "unused" }),
            })
            .await
            .unwrap()
            .id
    }

    pub async fn status(&self, id: &BotId) -> BotStatus {
        self.store.inner.get_status(id).await.unwrap().unwrap()
    }

    pub async fn last_active(&self, id: &BotId) -> Option<DateTime<Utc>> {
        self.store
            .inner
            .get_bot(id)
            .await
            .unwrap()
            .unwrap()
            .last_active
    }
}

/// Waits for the next transition of `id` into `to`.
pub(super) async fn wait_for_transition(
    events: &mut tokio::sync::broadcast::Receiver<TransitionEvent>,
    id: &BotId,
    to: BotState,
) -> TransitionEvent {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let event = events.recv().await.unwrap();
            if &event.bot_id == id && event.to == to {
                return event;
            }
        }
    })
    .await
    .expect("transition not observed in time")
}

/// Polls until `pid` no longer exists.
pub(super) async fn assert_pid_gone(pid: u32) {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    for _ in 0..40 {
        if kill(Pid::from_raw(pid as i32), None).is_err() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("process {} is still alive", pid);
}
