use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Opaque bot identity. Assigned once at creation and never reused.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BotId(String);

impl BotId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for BotId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for BotId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for BotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    Discord,
    Telegram,
    #[serde(rename = "whatsapp", alias = "whats_app")]
    WhatsApp,
    Messenger,
    Instagram,
}

impl Platform {
    pub const ALL: [Platform; 5] = [
        Platform::Discord,
        Platform::Telegram,
        Platform::WhatsApp,
        Platform::Messenger,
        Platform::Instagram,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Platform::Discord => "discord",
            Platform::Telegram => "telegram",
            Platform::WhatsApp => "whatsapp",
            Platform::Messenger => "messenger",
            Platform::Instagram => "instagram",
        }
    }

    /// Bot types each platform can launch. Kept closed so the adapter
    /// factory can match exhaustively.
    pub fn supported_types(self) -> &'static [BotType] {
        match self {
            Platform::Discord => &[BotType::Standard, BotType::Moderation],
            Platform::Telegram
            | Platform::WhatsApp
            | Platform::Messenger
            | Platform::Instagram => &[BotType::Standard],
        }
    }

    pub fn supports(self, bot_type: BotType) -> bool {
        self.supported_types().contains(&bot_type)
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Platform {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "discord" => Ok(Platform::Discord),
            "telegram" => Ok(Platform::Telegram),
            "whatsapp" | "whats_app" => Ok(Platform::WhatsApp),
            "messenger" => Ok(Platform::Messenger),
            "instagram" => Ok(Platform::Instagram),
            other => Err(format!("unknown platform: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BotType {
    Standard,
    Moderation,
}

impl BotType {
    pub fn as_str(self) -> &'static str {
        match self {
            BotType::Standard => "standard",
            BotType::Moderation => "moderation",
        }
    }
}

impl fmt::Display for BotType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BotType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "standard" => Ok(BotType::Standard),
            "moderation" => Ok(BotType::Moderation),
            other => Err(format!("unknown bot type: {}", other)),
        }
    }
}

/// Status as persisted in the store and shown on the dashboard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BotStatus {
    Offline,
    Online,
    Error,
}

impl BotStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            BotStatus::Offline => "offline",
            BotStatus::Online => "online",
            BotStatus::Error => "error",
        }
    }

    pub fn from_status(value: &str) -> Option<Self> {
        match value {
            "offline" => Some(BotStatus::Offline),
            "online" => Some(BotStatus::Online),
            "error" => Some(BotStatus::Error),
            _ => None,
        }
    }
}

impl fmt::Display for BotStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A configured bot. The sealed platform configuration is deliberately
/// absent; it is only ever read back by the bot runner.
#[derive(Debug, Clone, Serialize)]
pub struct BotRecord {
    pub id: BotId,
    pub name: String,
    pub platform: Platform,
    pub bot_type: BotType,
    pub status: BotStatus,
    pub last_active: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewBot {
    pub name: String,
    pub platform: Platform,
    pub bot_type: BotType,
    #[serde(default)]
    pub config: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn platform_parses_loose_spellings() {
        assert_eq!("WhatsApp".parse::<Platform>().unwrap(), Platform::WhatsApp);
        assert_eq!("whats_app".parse::<Platform>().unwrap(), Platform::WhatsApp);
        assert_eq!(" discord ".parse::<Platform>().unwrap(), Platform::Discord);
        assert!("irc".parse::<Platform>().is_err());
    }

    #[test]
    fn platform_roundtrips_through_as_str() {
        for platform in Platform::ALL {
            assert_eq!(platform.as_str().parse::<Platform>().unwrap(), platform);
        }
    }

    #[test]
    fn only_discord_supports_moderation() {
        assert!(Platform::Discord.supports(BotType::Moderation));
        for platform in [
            Platform::Telegram,
            Platform::WhatsApp,
            Platform::Messenger,
            Platform::Instagram,
        ] {
            assert!(platform.supports(BotType::Standard));
            assert!(!platform.supports(BotType::Moderation));
        }
    }

    #[test]
    fn status_from_unknown_value_is_none() {
        assert_eq!(BotStatus::from_status("online"), Some(BotStatus::Online));
        assert_eq!(BotStatus::from_status("starting"), None);
    }

    #[test]
    fn new_bot_deserializes_snake_case_enums() {
        let bot: NewBot = serde_json::from_value(serde_json::json!({
            "name": "mod-bot",
            "platform": "discord",
            "bot_type": "moderation",
            "config": { "token": "x" }
        }))
        .unwrap();
        assert_eq!(bot.platform, Platform::Discord);
        assert_eq!(bot.bot_type, BotType::Moderation);
        assert!(bot.config.get("token").is_some());
    }

    #[test]
    fn generated_ids_are_unique() {
        assert_ne!(BotId::generate(), BotId::generate());
    }
}
