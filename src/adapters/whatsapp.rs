use async_trait::async_trait;
use axum::{
    Router,
    extract::{Form, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::post,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::{BotAdapter, Responder, SessionTask, optional_port, optional_str, required_str};
use crate::core::bot::Platform;
use crate::core::error::AdapterError;

const DEFAULT_PORT: u16 = 3002;
const DEFAULT_API_BASE: &str = "https://api.twilio.com";
const WEBHOOK_PATH: &str = "/whatsapp/events";

#[derive(Clone)]
struct WebhookState {
    responder: Arc<Responder>,
    auth_token: String,
    webhook_url: String,
}

/// WhatsApp through the Twilio API: credentials are checked against the
/// REST API, inbound messages arrive on a local webhook and are answered
/// with TwiML.
pub struct WhatsAppAdapter {
    account_sid: String,
    auth_token: String,
    host: String,
    port: u16,
    public_url: Option<String>,
    api_base: String,
    responder: Arc<Responder>,
    started: bool,
    local_addr: Option<SocketAddr>,
    session: Option<SessionTask>,
}

impl WhatsAppAdapter {
    pub fn from_config(config: &serde_json::Value) -> Result<Self, AdapterError> {
        Ok(Self {
            account_sid: required_str(config, "account_sid")?,
            auth_token: required_str(config, "auth_token")?,
            host: optional_str(config, "webhook_host").unwrap_or_else(|| "127.0.0.1".to_string()),
            port: optional_port(config, "webhook_port", DEFAULT_PORT)?,
            public_url: optional_str(config, "public_url"),
            api_base: optional_str(config, "api_base")
                .unwrap_or_else(|| DEFAULT_API_BASE.to_string())
                .trim_end_matches('/')
                .to_string(),
            responder: Arc::new(Responder::from_config(config)?),
            started: false,
            local_addr: None,
            session: None,
        })
    }

    async fn verify_credentials(&self) -> Result<(), AdapterError> {
        let url = format!(
            "{}/2010-04-01/Accounts/{}.json",
            self.api_base, self.account_sid
        );
        let res = reqwest::Client::new()
            .get(&url)
            .basic_auth(&self.account_sid, Some(&self.auth_token))
            .send()
            .await
            .map_err(AdapterError::network)?;

        let status = res.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(AdapterError::AuthenticationFailed(format!(
                "Twilio rejected account {} ({})",
                self.account_sid, status
            )));
        }
        if !status.is_success() {
            return Err(AdapterError::network(format!(
                "Twilio API returned {}",
                status
            )));
        }
        Ok(())
    }
}

fn check_account_sid(sid: &str) -> Result<(), AdapterError> {
    if sid.len() == 34 && sid.starts_with("AC") && sid.chars().all(|c| c.is_ascii_alphanumeric())
    {
        Ok(())
    } else {
        Err(AdapterError::config(
            "account_sid must be a 34 character Twilio SID starting with AC",
        ))
    }
}

fn twiml(message: Option<&str>) -> Response {
    let body = match message {
        Some(text) => format!("<Message>{}</Message>", quick_xml::escape::escape(text)),
        None => String::new(),
    };
    let xml = format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<Response>{}</Response>",
        body
    );
    (
        StatusCode::OK,
        [(axum::http::header::CONTENT_TYPE, "application/xml")],
        xml,
    )
        .into_response()
}

/// Twilio signs the webhook URL followed by every POST parameter, sorted by
/// name, with HMAC-SHA1 under the account auth token.
fn twilio_signature(
    webhook_url: &str,
    params: &[(String, String)],
    auth_token: &str,
) -> Option<Vec<u8>> {
    use hmac::Mac;
    type HmacSha1 = hmac::Hmac<sha1::Sha1>;

    let mut sorted: Vec<&(String, String)> = params.iter().collect();
    sorted.sort_by(|a, b| a.0.cmp(&b.0));

    let mut mac = HmacSha1::new_from_slice(auth_token.as_bytes()).ok()?;
    mac.update(webhook_url.as_bytes());
    for (k, v) in sorted {
        mac.update(k.as_bytes());
        mac.update(v.as_bytes());
    }
    Some(mac.finalize().into_bytes().to_vec())
}

fn verify_twilio_signature(
    headers: &HeaderMap,
    webhook_url: &str,
    params: &[(String, String)],
    auth_token: &str,
) -> bool {
    use base64::Engine;

    let Some(sig) = headers
        .get("x-twilio-signature")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| base64::engine::general_purpose::STANDARD.decode(v).ok())
    else {
        return false;
    };
    let Some(expected) = twilio_signature(webhook_url, params, auth_token) else {
        return false;
    };

    sig.len() == expected.len()
        && sig
            .iter()
            .zip(expected.iter())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
}

async fn whatsapp_webhook(
    State(state): State<WebhookState>,
    headers: HeaderMap,
    Form(params): Form<Vec<(String, String)>>,
) -> Response {
    if !verify_twilio_signature(&headers, &state.webhook_url, &params, &state.auth_token) {
        warn!("WhatsApp webhook signature verification failed");
        return (StatusCode::UNAUTHORIZED, "Invalid signature").into_response();
    }

    let param = |name: &str| {
        params
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
            .unwrap_or("")
    };
    let from = param("From");
    let body = param("Body");
    info!("Received WhatsApp message from {}", from);

    twiml(state.responder.reply_to(body).as_deref())
}

#[async_trait]
impl BotAdapter for WhatsAppAdapter {
    fn platform(&self) -> Platform {
        Platform::WhatsApp
    }

    async fn start(&mut self) -> Result<(), AdapterError> {
        if self.started {
            return Err(AdapterError::config("already started"));
        }
        self.started = true;
        check_account_sid(&self.account_sid)?;

        self.verify_credentials().await?;

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

        let webhook_url = match &self.public_url {
            Some(base) => format!("{}{}", base.trim_end_matches('/'), WEBHOOK_PATH),
            None => format!("http://{}{}", addr, WEBHOOK_PATH),
        };
        info!("WhatsApp (Twilio) webhook listening at {}", webhook_url);

        let state = WebhookState {
            responder: self.responder.clone(),
            auth_token: self.auth_token.clone(),
            webhook_url,
        };
        let app = Router::new()
            .route(WEBHOOK_PATH, post(whatsapp_webhook))
            .with_state(state);

        let cancel = CancellationToken::new();
        let shutdown = cancel.clone();
        self.session = Some(SessionTask::spawn(cancel, async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(shutdown.cancelled_owned())
                .await
                .map_err(|e| {
                    error!("WhatsApp webhook crashed: {}", e);
                    AdapterError::SessionLost(e.to_string())
                })
        }));
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), AdapterError> {
        if let Some(mut session) = self.session.take() {
            info!("Closing WhatsApp webhook listener...");
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
