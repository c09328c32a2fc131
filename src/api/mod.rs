pub(crate) mod auth;
mod handlers;
mod router;

use anyhow::Result;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::info;

use crate::core::store::SqliteStore;
use crate::core::supervisor::Supervisor;

pub use router::build_api_router;

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) supervisor: Supervisor,
    pub(crate) store: Arc<SqliteStore>,
    pub(crate) log_tx: broadcast::Sender<String>,
    pub(crate) api_host: String,
    pub(crate) api_port: u16,
    pub(crate) token: Option<String>,
}

pub struct ApiServerConfig {
    pub supervisor: Supervisor,
    pub store: Arc<SqliteStore>,
    pub log_tx: broadcast::Sender<String>,
    pub api_host: String,
    pub api_port: u16,
    pub token: Option<String>,
}

/// HTTP lifecycle surface over the supervisor.
pub struct ApiServer {
    state: AppState,
}

impl ApiServer {
    pub fn new(config: ApiServerConfig) -> Self {
        Self {
            state: AppState {
                supervisor: config.supervisor,
                store: config.store,
                log_tx: config.log_tx,
                api_host: config.api_host,
                api_port: config.api_port,
                token: config.token.filter(|t| !t.trim().is_empty()),
            },
        }
    }

    /// Binds and serves until `shutdown` resolves.
    pub async fn serve<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = format!("{}:{}", self.state.api_host, self.state.api_port);
        if self.state.token.is_none() && !auth::is_loopback(&self.state.api_host) {
            tracing::warn!(
                "API bound to {} without api.token; every request will be refused",
                addr
            );
        }
        let app = build_api_router(self.state);
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        info!("API Server running at http://{}", addr);
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await?;
        info!("API Server stopped");
        Ok(())
    }
}
