//! Reconnection backoff for tenant feeds

mod policy;

pub use policy::{BackoffConfig, ReconnectPhase, ReconnectionPolicy, ReconnectionState};
