//! Tenant subscriptions and their lifecycle.
//!
//! - `ConnectionManager`: registry of live subscriptions, one per tenant
//! - `SubscriptionHandle`: caller-side handle used to unsubscribe
//! - `Handlers`: per-entity, presence and connection-state callbacks
//!
//! Each subscription is driven by its own worker task which owns the feed,
//! routing, presence roster and reconnection policy.

mod registry;
mod stats;
mod types;
mod worker;

pub use registry::ConnectionManager;
pub use stats::{ConnectionStats, SubscriptionStats};
pub use types::{ConnectionState, Handlers, SubscriptionHandle};
