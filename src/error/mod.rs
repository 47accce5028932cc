use thiserror::Error;

use crate::events::EventDecodeError;
use crate::tenant::LookupRuleError;
use crate::transport::TransportError;

#[derive(Error, Debug)]
pub enum RealtimeError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Invalid lookup rules: {0}")]
    Rules(#[from] LookupRuleError),

    #[error("Invalid event: {0}")]
    Event(#[from] EventDecodeError),
}

impl RealtimeError {
    /// Stable code for logs and metrics labels
    pub fn code(&self) -> &'static str {
        match self {
            RealtimeError::Config(_) => "CONFIG_ERROR",
            RealtimeError::Transport(_) => "TRANSPORT_ERROR",
            RealtimeError::Rules(_) => "RULES_ERROR",
            RealtimeError::Event(_) => "EVENT_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, RealtimeError>;
