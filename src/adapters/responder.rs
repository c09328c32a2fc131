use serde::Deserialize;

use crate::core::error::AdapterError;

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct ReplyRule {
    pub keyword: String,
    pub reply: String,
}

/// Keyword auto-replies shared by every platform adapter.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Responder {
    #[serde(default)]
    replies: Vec<ReplyRule>,
    #[serde(default)]
    fallback_reply: Option<String>,
}

impl Responder {
    pub fn new(replies: Vec<ReplyRule>, fallback_reply: Option<String>) -> Self {
        Self {
            replies,
            fallback_reply,
        }
    }

    /// Reads `replies` and `fallback_reply` out of a bot config, ignoring
    /// the platform-specific keys.
    pub fn from_config(config: &serde_json::Value) -> Result<Self, AdapterError> {
        let responder: Responder = serde_json::from_value(config.clone())
            .map_err(|e| AdapterError::config(format!("invalid replies: {}", e)))?;
        if responder
            .replies
            .iter()
            .any(|rule| rule.keyword.trim().is_empty())
        {
            return Err(AdapterError::config("reply keywords must not be empty"));
        }
        Ok(responder)
    }

    /// First rule whose keyword appears in `text`, case-insensitively,
    /// otherwise the fallback.
    pub fn reply_to(&self, text: &str) -> Option<String> {
        let text = text.trim();
        if text.is_empty() {
            return None;
        }
        let lowered = text.to_lowercase();
        self.replies
            .iter()
            .find(|rule| lowered.contains(&rule.keyword.trim().to_lowercase()))
            .map(|rule| rule.reply.clone())
            .or_else(|| self.fallback_reply.clone())
    }
}
