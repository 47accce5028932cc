//! Connection statistics structures

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::events::EntityType;

use super::types::ConnectionState;

/// Manager-wide connection statistics.
///
/// `state` and `reconnect_attempts` describe the most recently created live
/// subscription; with none live the state is `Disconnected`.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionStats {
    pub state: ConnectionState,
    pub reconnect_attempts: u32,
    pub active_subscription_count: usize,
    pub subscriptions: Vec<SubscriptionStats>,
}

/// Per-tenant subscription statistics
#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionStats {
    pub subscription_id: Uuid,
    pub tenant_id: String,
    pub state: ConnectionState,
    pub reconnect_attempts: u32,
    pub entity_types: Vec<EntityType>,
    pub created_at: DateTime<Utc>,
}

impl ConnectionStats {
    pub(crate) fn from_subscriptions(mut subscriptions: Vec<SubscriptionStats>) -> Self {
        subscriptions.sort_by(|a, b| a.created_at.cmp(&b.created_at));

        let (state, reconnect_attempts) = subscriptions
            .last()
            .map(|latest| (latest.state, latest.reconnect_attempts))
            .unwrap_or((ConnectionState::Disconnected, 0));

        Self {
            state,
            reconnect_attempts,
            active_subscription_count: subscriptions.len(),
            subscriptions,
        }
    }
}
