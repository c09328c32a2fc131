use async_trait::async_trait;
use serenity::Client;
use serenity::all::{Context, EventHandler, GatewayIntents, Message, Ready, ShardManager};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::{BotAdapter, Responder, SessionTask, required_str};
use crate::core::bot::Platform;
use crate::core::error::AdapterError;

/// How long the gateway may take to deliver `ready` after login.
const READY_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscordMode {
    Standard,
    /// Deletes messages containing a banned word before replying.
    Moderation,
}

struct Handler {
    mode: DiscordMode,
    responder: Arc<Responder>,
    banned_words: Arc<Vec<String>>,
    ready_tx: Mutex<Option<oneshot::Sender<String>>>,
}

fn contains_banned_word(text: &str, banned_words: &[String]) -> bool {
    let lowered = text.to_lowercase();
    banned_words.iter().any(|word| lowered.contains(word.as_str()))
}

#[async_trait]
impl EventHandler for Handler {
    async fn message(&self, ctx: Context, msg: Message) {
        if msg.author.bot {
            return;
        }

        if self.mode == DiscordMode::Moderation
            && contains_banned_word(&msg.content, &self.banned_words)
        {
            match msg.delete(&ctx).await {
                Ok(()) => info!(
                    "Deleted message from {} in channel {} (banned word)",
                    msg.author.name, msg.channel_id
                ),
                Err(e) => warn!("Failed to delete moderated message: {}", e),
            }
            return;
        }

        if let Some(reply) = self.responder.reply_to(&msg.content)
            && let Err(e) = msg.channel_id.say(&ctx.http, reply).await
        {
            error!("Failed to send Discord reply: {}", e);
        }
    }

    async fn ready(&self, _: Context, ready: Ready) {
        info!("Discord bot connected as {}", ready.user.name);
        if let Some(tx) = self.ready_tx.lock().await.take() {
            let _ = tx.send(ready.user.name.clone());
        }
    }
}

pub struct DiscordAdapter {
    token: String,
    mode: DiscordMode,
    responder: Arc<Responder>,
    banned_words: Arc<Vec<String>>,
    started: bool,
    shard_manager: Option<Arc<ShardManager>>,
    session: Option<SessionTask>,
}

impl DiscordAdapter {
    pub fn from_config(config: &serde_json::Value, mode: DiscordMode) -> Result<Self, AdapterError> {
        let token = required_str(config, "token")?;
        let banned_words: Vec<String> = match config.get("banned_words") {
            None | Some(serde_json::Value::Null) => Vec::new(),
            Some(value) => serde_json::from_value::<Vec<String>>(value.clone())
                .map_err(|e| AdapterError::config(format!("invalid banned_words: {}", e)))?
                .into_iter()
                .map(|w| w.trim().to_lowercase())
                .filter(|w| !w.is_empty())
                .collect(),
        };
        if mode == DiscordMode::Moderation && banned_words.is_empty() {
            warn!("Moderation bot configured without banned_words; nothing will be removed");
        }

        Ok(Self {
            token,
            mode,
            responder: Arc::new(Responder::from_config(config)?),
            banned_words: Arc::new(banned_words),
            started: false,
            shard_manager: None,
            session: None,
        })
    }
}

/// Bot tokens are three non-empty dot-separated segments.
fn check_token_format(token: &str) -> Result<(), AdapterError> {
    let parts: Vec<&str> = token.split('.').collect();
    let well_formed = parts.len() == 3
        && parts.iter().all(|p| {
            !p.is_empty()
                && p.chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        });
    if well_formed {
        Ok(())
    } else {
        Err(AdapterError::config("malformed Discord bot token"))
    }
}

fn classify(err: serenity::Error) -> AdapterError {
    if let serenity::Error::Gateway(serenity::gateway::GatewayError::InvalidAuthentication) = err
    {
        return AdapterError::AuthenticationFailed("Discord rejected the bot token".into());
    }
    let text = err.to_string();
    let lowered = text.to_lowercase();
    if lowered.contains("401") || lowered.contains("unauthorized") {
        AdapterError::AuthenticationFailed(text)
    } else if matches!(err, serenity::Error::Http(_)) {
        AdapterError::NetworkUnavailable(text)
    } else {
        AdapterError::SessionLost(text)
    }
}

#[async_trait]
impl BotAdapter for DiscordAdapter {
    fn platform(&self) -> Platform {
        Platform::Discord
    }

    async fn start(&mut self) -> Result<(), AdapterError> {
        if self.started {
            return Err(AdapterError::config("already started"));
        }
        self.started = true;
        check_token_format(&self.token)?;

        let (ready_tx, ready_rx) = oneshot::channel();
        let handler = Handler {
            mode: self.mode,
            responder: self.responder.clone(),
            banned_words: self.banned_words.clone(),
            ready_tx: Mutex::new(Some(ready_tx)),
        };

        let intents = GatewayIntents::GUILD_MESSAGES
            | GatewayIntents::DIRECT_MESSAGES
            | GatewayIntents::MESSAGE_CONTENT;

        let mut client = Client::builder(&self.token, intents)
            .event_handler(handler)
            .await
            .map_err(classify)?;
        self.shard_manager = Some(client.shard_manager.clone());

        info!("Logging in to the Discord gateway ({:?} mode)...", self.mode);
        let cancel = CancellationToken::new();
        let cancelled = cancel.clone();
        let mut session = SessionTask::spawn(cancel, async move {
            tokio::select! {
                result = client.start() => result.map_err(classify),
                _ = cancelled.cancelled() => Ok(()),
            }
        });

        tokio::select! {
            ready = ready_rx => match ready {
                Ok(_) => {
                    self.session = Some(session);
                    Ok(())
                }
                Err(_) => Err(session.join().await.err().unwrap_or_else(|| {
                    AdapterError::SessionLost("gateway closed before ready".into())
                })),
            },
            ended = session.join() => Err(ended.err().unwrap_or_else(|| {
                AdapterError::SessionLost("gateway closed before ready".into())
            })),
            _ = tokio::time::sleep(READY_TIMEOUT) => {
                if let Some(shard_manager) = self.shard_manager.take() {
                    shard_manager.shutdown_all().await;
                }
                session.shutdown().await;
                Err(AdapterError::network("timed out waiting for the Discord gateway"))
            }
        }
    }

    async fn stop(&mut self) -> Result<(), AdapterError> {
        if let Some(shard_manager) = self.shard_manager.take() {
            info!("Shutting down Discord shards...");
            shard_manager.shutdown_all().await;
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

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn token_format_is_checked_before_connecting() {
        assert!(check_token_format("MTA4.GhIj_k.lmn-OP").is_ok());
        assert!(check_token_format("not-a-token").is_err());
        assert!(check_token_format("a..c").is_err());
        assert!(check_token_format("a.b c.d").is_err());
    }

    #[test]
    fn banned_words_are_normalized() {
        let adapter = DiscordAdapter::from_config(
            &json!({ "token": "a.b.c", "banned_words": [" SPAM ", "", "Scam"] }),
            DiscordMode::Moderation,
        )
        .unwrap();
        assert_eq!(adapter.banned_words.as_slice(), ["spam", "scam"]);
        assert!(contains_banned_word("Buy SPAM now", &adapter.banned_words));
        assert!(!contains_banned_word("hello", &adapter.banned_words));
    }

    #[test]
    fn banned_words_must_be_strings() {
        let err = DiscordAdapter::from_config(
            &json!({ "token": "a.b.c", "banned_words": [1, 2] }),
            DiscordMode::Moderation,
        )
        .err()
        .unwrap();
        assert!(matches!(err, AdapterError::ConfigInvalid(_)));
    }

    #[tokio::test]
    async fn malformed_token_fails_without_network() {
        let mut adapter =
            DiscordAdapter::from_config(&json!({ "token": "garbage" }), DiscordMode::Standard)
                .unwrap();
        let err = adapter.start().await.unwrap_err();
        assert!(matches!(err, AdapterError::ConfigInvalid(_)));
        assert_eq!(err.exit_code(), crate::core::error::EXIT_CONFIG_INVALID);

        // A failed start still counts; no second session is attempted.
        assert_eq!(
            adapter.start().await.unwrap_err(),
            AdapterError::config("already started")
        );
        adapter.stop().await.unwrap();
    }

    #[tokio::test]
    async fn stop_before_start_is_safe() {
        let mut adapter =
            DiscordAdapter::from_config(&json!({ "token": "a.b.c" }), DiscordMode::Standard)
                .unwrap();
        adapter.stop().await.unwrap();
        adapter.wait_closed().await.unwrap();
    }
}
