use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::core::bot::{BotId, BotStatus};

/// In-memory lifecycle state of one supervised bot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BotState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Errored,
}

impl BotState {
    pub fn as_str(self) -> &'static str {
        match self {
            BotState::Stopped => "stopped",
            BotState::Starting => "starting",
            BotState::Running => "running",
            BotState::Stopping => "stopping",
            BotState::Errored => "errored",
        }
    }

    /// The status written to the store when this state is entered.
    /// Transitional states leave the previously persisted value in place.
    pub fn persisted(self) -> Option<BotStatus> {
        match self {
            BotState::Stopped => Some(BotStatus::Offline),
            BotState::Running => Some(BotStatus::Online),
            BotState::Errored => Some(BotStatus::Error),
            BotState::Starting | BotState::Stopping => None,
        }
    }

    pub fn is_live(self) -> bool {
        matches!(
            self,
            BotState::Starting | BotState::Running | BotState::Stopping
        )
    }
}

pub fn can_transition(from: BotState, to: BotState) -> bool {
    if from == to {
        return true;
    }
    match from {
        BotState::Stopped | BotState::Errored => matches!(to, BotState::Starting),
        BotState::Starting => matches!(
            to,
            BotState::Running | BotState::Errored | BotState::Stopped | BotState::Stopping
        ),
        BotState::Running => matches!(
            to,
            BotState::Stopping | BotState::Errored | BotState::Stopped
        ),
        BotState::Stopping => matches!(to, BotState::Stopped),
    }
}

/// Audit record emitted for every state change.
#[derive(Debug, Clone, Serialize)]
pub struct TransitionEvent {
    pub bot_id: BotId,
    pub from: BotState,
    pub to: BotState,
    pub at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub stderr_tail: Vec<String>,
}
