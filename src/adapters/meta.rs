//! Messenger and Instagram share the Graph API and the webhook format; only
//! the subscribed object and the default port differ.

use async_trait::async_trait;
use axum::{
    Router,
    body::Bytes,
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
};
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{BotAdapter, Responder, SessionTask, optional_port, optional_str, required_str};
use crate::core::bot::Platform;
use crate::core::error::AdapterError;

const DEFAULT_GRAPH_BASE: &str = "https://graph.facebook.com/v19.0";

/// Platform-specific knobs for a Meta webhook bot.
#[derive(Debug, Clone, Copy)]
pub(crate) struct MetaFlavor {
    pub platform: Platform,
    /// Value of `object` in webhook payloads.
    pub object: &'static str,
    pub path: &'static str,
    pub default_port: u16,
}

#[derive(Clone)]
struct WebhookState {
    flavor: MetaFlavor,
    responder: Arc<Responder>,
    app_secret: String,
    verify_token: String,
    graph: GraphClient,
}

#[derive(Clone)]
struct GraphClient {
    http: reqwest::Client,
    base: String,
    access_token: String,
}

impl GraphClient {
    async fn verify(&self) -> Result<String, AdapterError> {
        let res = self
            .http
            .get(format!("{}/me", self.base))
            .query(&[("fields", "id,name"), ("access_token", self.access_token.as_str())])
            .send()
            .await
            .map_err(AdapterError::network)?;

        let status = res.status();
        if matches!(status.as_u16(), 400 | 401 | 403) {
            let detail = res.text().await.unwrap_or_default();
            return Err(AdapterError::AuthenticationFailed(format!(
                "Graph API rejected the page token ({}): {}",
                status, detail
            )));
        }
        if !status.is_success() {
            return Err(AdapterError::network(format!(
                "Graph API returned {}",
                status
            )));
        }
        let me: serde_json::Value = res.json().await.map_err(AdapterError::network)?;
        Ok(me
            .get("name")
            .or_else(|| me.get("id"))
            .and_then(|v| v.as_str())
            .unwrap_or("unknown")
            .to_string())
    }

    async fn send_text(&self, recipient: &str, text: &str) -> Result<(), reqwest::Error> {
        self.http
            .post(format!("{}/me/messages", self.base))
            .query(&[("access_token", self.access_token.as_str())])
            .json(&serde_json::json!({
                "recipient": { "id": recipient },
                "messaging_type": "RESPONSE",
                "message": { "text": text },
            }))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

pub struct MetaAdapter {
    flavor: MetaFlavor,
    app_secret: String,
    verify_token: String,
    host: String,
    port: u16,
    graph: GraphClient,
    responder: Arc<Responder>,
    started: bool,
    local_addr: Option<SocketAddr>,
    session: Option<SessionTask>,
}

impl MetaAdapter {
    pub(crate) fn from_config(
        config: &serde_json::Value,
        flavor: MetaFlavor,
    ) -> Result<Self, AdapterError> {
        let graph = GraphClient {
            http: reqwest::Client::new(),
            base: optional_str(config, "graph_base")
                .unwrap_or_else(|| DEFAULT_GRAPH_BASE.to_string())
                .trim_end_matches('/')
                .to_string(),
            access_token: required_str(config, "page_access_token")?,
        };
        Ok(Self {
            flavor,
            app_secret: required_str(config, "app_secret")?,
            verify_token: required_str(config, "verify_token")?,
            host: optional_str(config, "webhook_host").unwrap_or_else(|| "127.0.0.1".to_string()),
            port: optional_port(config, "webhook_port", flavor.default_port)?,
            graph,
            responder: Arc::new(Responder::from_config(config)?),
            started: false,
            local_addr: None,
            session: None,
        })
    }
}

#[derive(Deserialize)]
struct VerifyQuery {
    #[serde(rename = "hub.mode")]
    mode: Option<String>,
    #[serde(rename = "hub.verify_token")]
    verify_token: Option<String>,
    #[serde(rename = "hub.challenge")]
    challenge: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WebhookPayload {
    object: String,
    #[serde(default)]
    entry: Vec<WebhookEntry>,
}

#[derive(Debug, Deserialize)]
struct WebhookEntry {
    #[serde(default)]
    messaging: Vec<MessagingEvent>,
}

#[derive(Debug, Deserialize)]
struct MessagingEvent {
    sender: Participant,
    message: Option<InboundMessage>,
}

#[derive(Debug, Deserialize)]
struct Participant {
    id: String,
}

#[derive(Debug, Deserialize)]
struct InboundMessage {
    text: Option<String>,
    #[serde(default)]
    is_echo: bool,
}

/// Checks `X-Hub-Signature-256: sha256=<hex>` against the raw body.
fn verify_hub_signature(headers: &HeaderMap, body: &[u8], app_secret: &str) -> bool {
    use hmac::Mac;
    type HmacSha256 = hmac::Hmac<sha2::Sha256>;

    let Some(sig) = headers
        .get("x-hub-signature-256")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("sha256="))
        .and_then(|hex_sig| hex::decode(hex_sig).ok())
    else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(app_secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&sig).is_ok()
}

async fn verify_subscription(
    State(state): State<WebhookState>,
    Query(query): Query<VerifyQuery>,
) -> Response {
    if query.mode.as_deref() == Some("subscribe")
        && query.verify_token.as_deref() == Some(state.verify_token.as_str())
    {
        info!("{} webhook subscription verified", state.flavor.platform);
        return (StatusCode::OK, query.challenge.unwrap_or_default()).into_response();
    }
    (StatusCode::FORBIDDEN, "Verification failed").into_response()
}

async fn receive_events(
    State(state): State<WebhookState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if !verify_hub_signature(&headers, &body, &state.app_secret) {
        warn!("{} webhook signature verification failed", state.flavor.platform);
        return (StatusCode::UNAUTHORIZED, "Invalid signature").into_response();
    }

    let payload: WebhookPayload = match serde_json::from_slice(&body) {
        Ok(p) => p,
        Err(e) => {
            debug!("Ignoring malformed webhook payload: {}", e);
            return (StatusCode::BAD_REQUEST, "Malformed payload").into_response();
        }
    };
    if payload.object != state.flavor.object {
        return StatusCode::NOT_FOUND.into_response();
    }

    for event in payload.entry.into_iter().flat_map(|e| e.messaging) {
        let Some(message) = event.message else {
            continue;
        };
        if message.is_echo {
            continue;
        }
        let Some(reply) = message
            .text
            .as_deref()
            .and_then(|text| state.responder.reply_to(text))
        else {
            continue;
        };

        let graph = state.graph.clone();
        let platform = state.flavor.platform;
        let recipient = event.sender.id;
        tokio::spawn(async move {
            if let Err(e) = graph.send_text(&recipient, &reply).await {
                error!("Failed to send {} reply to {}: {}", platform, recipient, e);
            }
        });
    }

    // Meta retries anything but a fast 200.
    (StatusCode::OK, "EVENT_RECEIVED").into_response()
}

#[async_trait]
impl BotAdapter for MetaAdapter {
    fn platform(&self) -> Platform {
        self.flavor.platform
    }

    async fn start(&mut self) -> Result<(), AdapterError> {
        if self.started {
            return Err(AdapterError::config("already started"));
        }
        self.started = true;

        let page = self.graph.verify().await?;
        info!("{} page token valid for '{}'", self.flavor.platform, page);

        let listener = tokio::net::TcpListener::bind((self.host.as_str(), self.port))
            .await
            .map_err(|e| {
                AdapterError::config(format!(
                    "cannot bind webhook on {}:{}: {}",
                    self.host, self.port, e
                ))
            })?;
        let addr = listener.local_addr().map_err(AdapterError::network)?;
        self.local_addr = Some(addr);
        info!(
            "{} webhook listening at http://{}{}",
            self.flavor.platform, addr, self.flavor.path
        );

        let state = WebhookState {
            flavor: self.flavor,
            responder: self.responder.clone(),
            app_secret: self.app_secret.clone(),
            verify_token: self.verify_token.clone(),
            graph: self.graph.clone(),
        };
        let app = Router::new()
            .route(
                self.flavor.path,
                get(verify_subscription).post(receive_events),
            )
            .with_state(state);

        let cancel = CancellationToken::new();
        let shutdown = cancel.clone();
        let platform = self.flavor.platform;
        self.session = Some(SessionTask::spawn(cancel, async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(shutdown.cancelled_owned())
                .await
                .map_err(|e| {
                    error!("{} webhook crashed: {}", platform, e);
                    AdapterError::SessionLost(e.to_string())
                })
        }));
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), AdapterError> {
        if let Some(mut session) = self.session.take() {
            info!("Closing {} webhook listener...", self.flavor.platform);
            session.shutdown().await;
        }
        Ok(())
    }

    async fn wait_closed(&mut self) -> Result<(), AdapterError> {
        match self.session.as_mut() {
            Some(session) => session.join().await,
            None => Ok(()),
        }
    }
}
