use futures::stream::BoxStream;
use thiserror::Error;

use crate::events::ChangeEvent;
use crate::presence::PresenceSignal;

/// One item on a multiplexed tenant feed.
///
/// Connection-state signals are interleaved with data.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportSignal {
    Connecting,
    Connected,
    Error(String),
    TimedOut,
    Closed,
    Change(ChangeEvent),
    Presence(PresenceSignal),
}

/// Stream returned by [`Transport::open_stream`](super::Transport::open_stream)
pub type SignalStream = BoxStream<'static, TransportSignal>;

/// Transport-level errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Operation timed out after {0} ms")]
    Timeout(u64),

    #[error("Stream closed")]
    Closed,

    #[error("Malformed record: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Transport unavailable: {0}")]
    Unavailable(String),
}
