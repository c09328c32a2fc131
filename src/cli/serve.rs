use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::terminal;
use crate::api::{ApiServer, ApiServerConfig};
use crate::config::{BotdeckConfig, DB_FILE};
use crate::core::bot::{BotId, BotStatus};
use crate::core::store::{SqliteStore, StatusStore};
use crate::core::supervisor::{SelfExecLauncher, ShutdownMode, Supervisor};
use crate::host::{Host, NativeHost};
use crate::logging;

pub async fn run_serve(data_dir: PathBuf, host: Option<String>, port: Option<u16>) -> Result<()> {
    let mut config = BotdeckConfig::load(&data_dir).await?;
    if let Some(host) = host {
        config.api.host = host;
    }
    if let Some(port) = port {
        config.api.port = port;
    }

    let log_tx = logging::init_daemon(config.log_level());
    info!("Starting botdeck supervisor (data dir: {})", data_dir.display());

    if !data_dir.exists() {
        tokio::fs::create_dir_all(&data_dir)
            .await
            .with_context(|| format!("creating {}", data_dir.display()))?;
        NativeHost::restrict_dir_permissions(&data_dir);
    }

    let store = Arc::new(SqliteStore::open(&data_dir.join(DB_FILE)).await?);
    let launcher = SelfExecLauncher::current(data_dir.clone())
        .context("cannot locate the botdeck executable")?;
    let supervisor = Supervisor::new(
        store.clone() as Arc<dyn StatusStore>,
        Arc::new(launcher),
        config.supervisor_config(),
    );

    let stale: Vec<BotId> = store
        .list_by_status(BotStatus::Online)
        .await?
        .into_iter()
        .map(|record| record.id)
        .collect();
    if !stale.is_empty() {
        info!("{} bot(s) were online at last shutdown", stale.len());
        let resumer = supervisor.clone();
        let restart = config.supervisor.resume_on_boot;
        tokio::spawn(async move {
            resumer.resume_on_boot(stale, restart).await;
        });
    }

    let shutdown = CancellationToken::new();
    let server = ApiServer::new(ApiServerConfig {
        supervisor: supervisor.clone(),
        store,
        log_tx,
        api_host: config.api.host.clone(),
        api_port: config.api.port,
        token: config.api.token.clone(),
    });
    let mut server_task = tokio::spawn(server.serve(shutdown.clone().cancelled_owned()));

    terminal::print_launch("botdeck is running. Press Ctrl+C to stop.");
    terminal::print_link(
        "API",
        &format!("http://{}:{}/api", config.api.host, config.api.port),
    );

    tokio::select! {
        _ = wait_for_signal() => {
            info!("Shutting down botdeck...");
        }
        joined = &mut server_task => {
            // The API went down on its own; take the bots down with it.
            match joined {
                Ok(Ok(())) => warn!("API server exited"),
                Ok(Err(e)) => error!("API server failed: {:#}", e),
                Err(e) => error!("API server task panicked: {}", e),
            }
            supervisor.shutdown(ShutdownMode::Preserve).await;
            anyhow::bail!("API server stopped unexpectedly");
        }
    }

    shutdown.cancel();
    supervisor.shutdown(ShutdownMode::Preserve).await;
    match server_task.await {
        Ok(result) => result?,
        Err(e) => error!("API server task panicked: {}", e),
    }
    terminal::print_success("All bots stopped. Goodbye!");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = term.recv() => {}
                _ = tokio::signal::ctrl_c() => {}
            }
        }
        Err(_) => {
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(windows)]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
