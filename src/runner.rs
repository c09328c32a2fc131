//! Entry point of a single bot process (`botdeck run-bot`).
//!
//! The runner owns one platform adapter for its whole life. It reports
//! readiness with a marker line on stdout, logs to stderr, and encodes
//! the way it ended in its exit code so the supervisor can classify it.

use chrono::Utc;
use std::io::Write;
use std::path::Path;
use std::time::Duration;
use tracing::{Level, error, info, warn};

use crate::adapters::{BotAdapter, build_adapter};
use crate::config::{BotdeckConfig, DB_FILE, RunnerSettings};
use crate::core::bot::BotId;
use crate::core::error::{
    AdapterError, EXIT_CLEAN, EXIT_CONFIG_INVALID, EXIT_UNKNOWN,
};
use crate::core::store::{SqliteStore, StatusStore};
use crate::core::supervisor::READY_MARKER;
use crate::logging;

/// Runs the bot until it is told to stop or its session ends, returning
/// the process exit code.
pub async fn run_bot(id: BotId, data_dir: &Path) -> i32 {
    let config = BotdeckConfig::load(data_dir).await;
    let level = config
        .as_ref()
        .map(BotdeckConfig::log_level)
        .unwrap_or(Level::INFO);
    logging::init_runner(level);

    let config = match config {
        Ok(config) => config,
        Err(e) => {
            error!("[{}] {}", id, e);
            return EXIT_CONFIG_INVALID;
        }
    };

    let store = match SqliteStore::open(&data_dir.join(DB_FILE)).await {
        Ok(store) => store,
        Err(e) => {
            error!("[{}] Failed to open the bot store: {}", id, e);
            return EXIT_UNKNOWN;
        }
    };

    let mut adapter = match prepare(&store, &id).await {
        Ok(adapter) => adapter,
        Err(e) => {
            error!("[{}] {}", id, e);
            return e.exit_code();
        }
    };

    info!("[{}] Connecting {} adapter...", id, adapter.platform());
    if let Err(e) = adapter.start().await {
        error!("[{}] Adapter start failed: {}", id, e);
        stop_adapter(&id, adapter.as_mut(), &config.runner).await;
        return e.exit_code();
    }

    if let Err(e) = announce_ready() {
        error!("[{}] Failed to report readiness: {}", id, e);
        stop_adapter(&id, adapter.as_mut(), &config.runner).await;
        return EXIT_UNKNOWN;
    }
    info!("[{}] Bot is online", id);

    supervise(&id, adapter.as_mut(), &store, &config.runner).await
}

async fn prepare(store: &SqliteStore, id: &BotId) -> Result<Box<dyn BotAdapter>, AdapterError> {
    let record = store
        .get_bot(id)
        .await
        .map_err(|e| AdapterError::config(format!("cannot read bot record: {}", e)))?
        .ok_or_else(|| AdapterError::config(format!("bot {} does not exist", id)))?;
    let platform_config = store
        .load_config(id)
        .await
        .map_err(|e| AdapterError::config(format!("cannot load bot configuration: {}", e)))?;
    build_adapter(record.platform, record.bot_type, &platform_config)
}

fn announce_ready() -> std::io::Result<()> {
    let mut stdout = std::io::stdout().lock();
    writeln!(stdout, "{}", READY_MARKER)?;
    stdout.flush()
}

async fn supervise(
    id: &BotId,
    adapter: &mut dyn BotAdapter,
    store: &SqliteStore,
    settings: &RunnerSettings,
) -> i32 {
    let mut heartbeat =
        tokio::time::interval(Duration::from_secs(settings.heartbeat_secs.max(1)));
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("[{}] Shutdown requested, stopping adapter...", id);
                stop_adapter(id, adapter, settings).await;
                return EXIT_CLEAN;
            }
            closed = adapter.wait_closed() => {
                return match closed {
                    Ok(()) => {
                        info!("[{}] Platform session closed", id);
                        EXIT_CLEAN
                    }
                    Err(e) => {
                        error!("[{}] {}", id, e);
                        e.exit_code()
                    }
                };
            }
            _ = heartbeat.tick() => {
                if let Err(e) = store.touch(id, Utc::now()).await {
                    warn!("[{}] Heartbeat write failed: {}", id, e);
                }
            }
        }
    }
}

async fn stop_adapter(id: &BotId, adapter: &mut dyn BotAdapter, settings: &RunnerSettings) {
    let limit = Duration::from_millis(settings.stop_timeout_ms);
    match tokio::time::timeout(limit, adapter.stop()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("[{}] Adapter stop failed: {}", id, e),
        Err(_) => warn!("[{}] Adapter did not stop within {:?}", id, limit),
    }
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = term.recv() => {}
                _ = tokio::signal::ctrl_c() => {}
            }
        }
        Err(e) => {
            warn!("Cannot listen for SIGTERM: {}", e);
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(windows)]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
