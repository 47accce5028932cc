// Foundation
pub mod config;
pub mod error;
pub mod metrics;
pub mod telemetry;

// Domain model
pub mod events;
pub mod presence;
pub mod reconnect;
pub mod tenant;

// Backends
pub mod transport;

// Subscription lifecycle
pub mod connection_manager;
pub mod router;

pub use connection_manager::{
    ConnectionManager, ConnectionState, ConnectionStats, Handlers, SubscriptionHandle,
    SubscriptionStats,
};
pub use error::{RealtimeError, Result};
