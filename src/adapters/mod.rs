mod discord;
mod instagram;
mod messenger;
mod meta;
mod responder;
mod telegram;
mod whatsapp;

use async_trait::async_trait;
use std::future::Future;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::core::bot::{BotType, Platform};
use crate::core::error::AdapterError;

use discord::{DiscordAdapter, DiscordMode};
use responder::Responder;
use telegram::TelegramAdapter;
use whatsapp::WhatsAppAdapter;

/// Connection to one messaging platform, run inside a bot process.
#[async_trait]
pub trait BotAdapter: Send {
    fn platform(&self) -> Platform;

    /// Connects and verifies credentials. A second call fails with
    /// `ConfigInvalid` instead of opening another session.
    async fn start(&mut self) -> Result<(), AdapterError>;

    /// Releases the session. Safe before `start` and after a failed one.
    async fn stop(&mut self) -> Result<(), AdapterError>;

    /// Resolves when the session ends on its own.
    async fn wait_closed(&mut self) -> Result<(), AdapterError>;
}

pub fn build_adapter(
    platform: Platform,
    bot_type: BotType,
    config: &serde_json::Value,
) -> Result<Box<dyn BotAdapter>, AdapterError> {
    match (platform, bot_type) {
        (Platform::Discord, BotType::Standard) => Ok(Box::new(DiscordAdapter::from_config(
            config,
            DiscordMode::Standard,
        )?)),
        (Platform::Discord, BotType::Moderation) => Ok(Box::new(DiscordAdapter::from_config(
            config,
            DiscordMode::Moderation,
        )?)),
        (Platform::Telegram, BotType::Standard) => {
            Ok(Box::new(TelegramAdapter::from_config(config)?))
        }
        (Platform::WhatsApp, BotType::Standard) => {
            Ok(Box::new(WhatsAppAdapter::from_config(config)?))
        }
        (Platform::Messenger, BotType::Standard) => Ok(Box::new(messenger::adapter(config)?)),
        (Platform::Instagram, BotType::Standard) => Ok(Box::new(instagram::adapter(config)?)),
        (
            Platform::Telegram | Platform::WhatsApp | Platform::Messenger | Platform::Instagram,
            BotType::Moderation,
        ) => Err(AdapterError::config(format!(
            "{} bots do not support the moderation type",
            platform
        ))),
    }
}

pub(crate) fn required_str(config: &serde_json::Value, key: &str) -> Result<String, AdapterError> {
    match config.get(key).and_then(|v| v.as_str()).map(str::trim) {
        Some(value) if !value.is_empty() => Ok(value.to_string()),
        _ => Err(AdapterError::config(format!("missing '{}'", key))),
    }
}

pub(crate) fn optional_str(config: &serde_json::Value, key: &str) -> Option<String> {
    config
        .get(key)
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

pub(crate) fn optional_port(
    config: &serde_json::Value,
    key: &str,
    default: u16,
) -> Result<u16, AdapterError> {
    match config.get(key) {
        None | Some(serde_json::Value::Null) => Ok(default),
        Some(value) => value
            .as_u64()
            .and_then(|p| u16::try_from(p).ok())
            .ok_or_else(|| AdapterError::config(format!("'{}' must be a port number", key))),
    }
}

/// Background task carrying a live platform session.
pub(crate) struct SessionTask {
    cancel: CancellationToken,
    handle: Option<JoinHandle<Result<(), AdapterError>>>,
}

impl SessionTask {
    pub fn spawn<F>(cancel: CancellationToken, session: F) -> Self
    where
        F: Future<Output = Result<(), AdapterError>> + Send + 'static,
    {
        Self {
            cancel,
            handle: Some(tokio::spawn(session)),
        }
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Waits for the session to end. Cancel safe; a later call after the
    /// session has been joined returns immediately.
    pub async fn join(&mut self) -> Result<(), AdapterError> {
        let Some(handle) = self.handle.as_mut() else {
            return Ok(());
        };
        let joined = handle.await;
        self.handle = None;
        match joined {
            Ok(result) => result,
            Err(e) => Err(AdapterError::SessionLost(format!("session task failed: {}", e))),
        }
    }

    /// Cancels the session and waits for it, logging rather than returning
    /// whatever it ended with.
    pub async fn shutdown(&mut self) {
        self.cancel();
        if let Err(e) = self.join().await {
            debug!("Session ended with {} during shutdown", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn moderation_is_discord_only() {
        for platform in [
            Platform::Telegram,
            Platform::WhatsApp,
            Platform::Messenger,
            Platform::Instagram,
        ] {
            let err = build_adapter(platform, BotType::Moderation, &json!({}))
                .err()
                .unwrap();
            assert!(matches!(err, AdapterError::ConfigInvalid(_)));
        }
    }

    #[test]
    fn factory_builds_each_supported_pair() {
        let cases = [
            (
                Platform::Discord,
                BotType::Standard,
                json!({ "token": "a.b.c" }),
            ),
            (
                Platform::Discord,
                BotType::Moderation,
                json!({ "token": "a.b.c", "banned_words": ["spam"] }),
            ),
            (
                Platform::Telegram,
                BotType::Standard,
                json!({ "token": "123:abc" }),
            ),
            (
                Platform::WhatsApp,
                BotType::Standard,
                json!({ "account_sid": "AC1", "auth_token": "t" }),
            ),
            (
                Platform::Messenger,
                BotType::Standard,
                json!({ "page_access_token": "p", "app_secret": "s", "verify_token": "v" }),
            ),
            (
                Platform::Instagram,
                BotType::Standard,
                json!({ "page_access_token": "p", "app_secret": "s", "verify_token": "v" }),
            ),
        ];
        for (platform, bot_type, config) in cases {
            let adapter = build_adapter(platform, bot_type, &config)
                .unwrap_or_else(|e| panic!("{platform}/{bot_type}: {e}"));
            assert_eq!(adapter.platform(), platform);
        }
    }

    #[test]
    fn missing_credentials_are_config_errors() {
        for platform in Platform::ALL {
            let err = build_adapter(platform, BotType::Standard, &json!({}))
                .err()
                .unwrap();
            assert!(
                matches!(err, AdapterError::ConfigInvalid(_)),
                "{platform}: {err}"
            );
        }
    }

    #[test]
    fn port_values_are_validated() {
        assert_eq!(optional_port(&json!({}), "port", 3002).unwrap(), 3002);
        assert_eq!(
            optional_port(&json!({ "port": 8080 }), "port", 3002).unwrap(),
            8080
        );
        assert!(optional_port(&json!({ "port": 70000 }), "port", 3002).is_err());
        assert!(optional_port(&json!({ "port": "80" }), "port", 3002).is_err());
    }

    #[tokio::test]
    async fn session_join_reports_ended_session_once() {
        let mut session = SessionTask::spawn(CancellationToken::new(), async {
            Err(AdapterError::SessionLost("socket closed".into()))
        });
        assert!(matches!(
            session.join().await,
            Err(AdapterError::SessionLost(_))
        ));
        assert!(session.join().await.is_ok());
    }

    #[tokio::test]
    async fn session_shutdown_cancels_the_task() {
        let cancel = CancellationToken::new();
        let observed = cancel.clone();
        let mut session = SessionTask::spawn(cancel, async move {
            observed.cancelled().await;
            Ok(())
        });
        tokio::time::timeout(std::time::Duration::from_secs(1), session.shutdown())
            .await
            .unwrap();
    }
}
