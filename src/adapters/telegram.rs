use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use teloxide::dispatching::ShutdownToken;
use teloxide::prelude::*;
use teloxide::RequestError;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::{BotAdapter, Responder, SessionTask, optional_str, required_str};
use crate::core::bot::Platform;
use crate::core::error::AdapterError;

const SHUTDOWN_WAIT: Duration = Duration::from_secs(3);

pub struct TelegramAdapter {
    token: String,
    api_url: Option<reqwest::Url>,
    responder: Arc<Responder>,
    started: bool,
    shutdown: Option<ShutdownToken>,
    session: Option<SessionTask>,
}

impl TelegramAdapter {
    pub fn from_config(config: &serde_json::Value) -> Result<Self, AdapterError> {
        let token = required_str(config, "token")?;
        let api_url = optional_str(config, "api_url")
            .map(|raw| {
                reqwest::Url::parse(&raw)
                    .map_err(|e| AdapterError::config(format!("invalid api_url: {}", e)))
            })
            .transpose()?;

        Ok(Self {
            token,
            api_url,
            responder: Arc::new(Responder::from_config(config)?),
            started: false,
            shutdown: None,
            session: None,
        })
    }

    fn client(&self) -> Bot {
        let bot = Bot::new(&self.token);
        match &self.api_url {
            Some(url) => bot.set_api_url(url.clone()),
            None => bot,
        }
    }
}

/// `<numeric bot id>:<secret>` as issued by BotFather.
fn check_token_format(token: &str) -> Result<(), AdapterError> {
    let well_formed = token.split_once(':').is_some_and(|(id, secret)| {
        !id.is_empty()
            && id.chars().all(|c| c.is_ascii_digit())
            && secret.len() >= 30
            && secret
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    });
    if well_formed {
        Ok(())
    } else {
        Err(AdapterError::config("malformed Telegram bot token"))
    }
}

fn classify(err: RequestError) -> AdapterError {
    match err {
        RequestError::Api(api) => AdapterError::AuthenticationFailed(api.to_string()),
        other => AdapterError::network(other),
    }
}

async fn handle_message(bot: Bot, msg: Message, responder: Arc<Responder>) -> ResponseResult<()> {
    let Some(text) = msg.text() else {
        return Ok(());
    };
    if let Some(reply) = responder.reply_to(text)
        && let Err(e) = bot.send_message(msg.chat.id, reply).await
    {
        error!("Failed to send Telegram reply to chat {}: {}", msg.chat.id, e);
    }
    Ok(())
}

#[async_trait]
impl BotAdapter for TelegramAdapter {
    fn platform(&self) -> Platform {
        Platform::Telegram
    }

    async fn start(&mut self) -> Result<(), AdapterError> {
        if self.started {
            return Err(AdapterError::config("already started"));
        }
        self.started = true;
        check_token_format(&self.token)?;

        let bot = self.client();
        let me = bot.get_me().await.map_err(classify)?;
        info!("Telegram bot authenticated as @{}", me.username());

        let responder = self.responder.clone();
        let mut dispatcher = Dispatcher::builder(bot, Update::filter_message().endpoint(handle_message))
            .dependencies(dptree::deps![responder])
            .build();
        self.shutdown = Some(dispatcher.shutdown_token());

        let cancel = CancellationToken::new();
        let cancelled = cancel.clone();
        self.session = Some(SessionTask::spawn(cancel, async move {
            tokio::select! {
                _ = dispatcher.dispatch() => {}
                _ = cancelled.cancelled() => {}
            }
            Ok(())
        }));
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), AdapterError> {
        if let Some(token) = self.shutdown.take() {
            info!("Stopping Telegram long polling...");
            // Err means the dispatcher is not running yet; the session task
            // is cancelled below either way.
            if let Ok(done) = token.shutdown()
                && tokio::time::timeout(SHUTDOWN_WAIT, done).await.is_err()
            {
                warn!("Telegram dispatcher did not stop in time");
            }
        }
        if let Some(mut session) = self.session.take() {
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
