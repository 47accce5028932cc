use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::future::join_all;

use crate::config::Settings;
use crate::error::RealtimeError;
use crate::metrics::{ConnectionMetrics, PresenceMetrics};
use crate::presence::{OwnPresence, PresenceRecord, PresenceUpdate};
use crate::reconnect::BackoffConfig;
use crate::tenant::{LookupRules, TenantFilter};
use crate::transport::Transport;

use super::stats::{ConnectionStats, SubscriptionStats};
use super::types::{ConnectionState, Handlers, Registry, SubscriptionHandle, SubscriptionShared};
use super::worker::{SubscriptionWorker, WorkerOptions};

/// Owns every live tenant subscription of the client.
///
/// At most one subscription is live per tenant: subscribing again replaces
/// the previous one, whose worker releases its feed and pending lookups.
pub struct ConnectionManager {
    transport: Arc<dyn Transport>,
    filter: Arc<TenantFilter>,
    own_presence: Arc<OwnPresence>,
    /// tenant_id -> live subscription
    registry: Arc<Registry>,
    options: WorkerOptions,
}

impl ConnectionManager {
    pub fn new(transport: Arc<dyn Transport>, settings: &Settings) -> Self {
        Self::with_rules(transport, settings, LookupRules::default())
    }

    /// Build with the lookup rules configured under `tenant_filter.rules`
    pub fn from_settings(transport: Arc<dyn Transport>, settings: &Settings) -> Result<Self, RealtimeError> {
        let rules = LookupRules::from_config(&settings.tenant_filter)?;
        Ok(Self::with_rules(transport, settings, rules))
    }

    pub fn with_rules(transport: Arc<dyn Transport>, settings: &Settings, rules: LookupRules) -> Self {
        let filter = Arc::new(TenantFilter::new(
            transport.clone(),
            rules,
            &settings.tenant_filter,
        ));
        let own_presence = Arc::new(OwnPresence::new(PresenceRecord::new(
            settings.presence.user_id.clone(),
            settings.presence.display_name.clone(),
        )));

        let options = WorkerOptions {
            backoff: BackoffConfig::from(&settings.reconnect),
            heartbeat_interval: Duration::from_secs(settings.presence.heartbeat_interval_seconds.max(1)),
            stale_after: Duration::from_secs(settings.presence.stale_after_seconds),
        };

        Self {
            transport,
            filter,
            own_presence,
            registry: Arc::new(DashMap::new()),
            options,
        }
    }

    /// Open a subscription for a tenant. Must be called inside a Tokio runtime.
    ///
    /// Only the entity types registered on `handlers` are requested from the
    /// backend. An existing subscription for the same tenant is torn down.
    pub fn subscribe(&self, tenant_id: impl Into<String>, handlers: Handlers) -> SubscriptionHandle {
        let tenant_id = tenant_id.into();
        let shared = Arc::new(SubscriptionShared::new(tenant_id.clone(), handlers));
        ConnectionMetrics::subscription_opened();

        if let Some(previous) = self.registry.insert(tenant_id.clone(), shared.clone()) {
            tracing::info!(
                tenant_id = %tenant_id,
                previous_subscription_id = %previous.id,
                "Replacing existing subscription"
            );
            previous.close();
        }

        tracing::info!(
            subscription_id = %shared.id,
            tenant_id = %tenant_id,
            entities = ?shared.entity_types,
            "Subscription opened"
        );

        let worker = SubscriptionWorker::new(
            shared.clone(),
            self.registry.clone(),
            self.transport.clone(),
            self.filter.clone(),
            self.own_presence.clone(),
            &self.options,
        );
        tokio::spawn(worker.run());

        SubscriptionHandle::new(shared, self.registry.clone())
    }

    /// Tear down the live subscription of a tenant, if any
    pub fn unsubscribe(&self, tenant_id: &str) -> bool {
        match self.registry.remove(tenant_id) {
            Some((_, shared)) => shared.close(),
            None => false,
        }
    }

    /// Handle to the live subscription of a tenant
    pub fn subscription(&self, tenant_id: &str) -> Option<SubscriptionHandle> {
        self.registry
            .get(tenant_id)
            .map(|entry| SubscriptionHandle::new(entry.value().clone(), self.registry.clone()))
    }

    pub fn is_subscribed(&self, tenant_id: &str) -> bool {
        self.registry.contains_key(tenant_id)
    }

    pub fn stats(&self) -> ConnectionStats {
        ConnectionStats::from_subscriptions(
            self.registry
                .iter()
                .map(|entry| entry.value().stats())
                .collect(),
        )
    }

    pub fn tenant_stats(&self, tenant_id: &str) -> Option<SubscriptionStats> {
        self.registry.get(tenant_id).map(|entry| entry.value().stats())
    }

    pub fn own_presence(&self) -> PresenceRecord {
        self.own_presence.current()
    }

    pub fn tenant_filter(&self) -> &Arc<TenantFilter> {
        &self.filter
    }

    /// Merge an update into the local presence and re-track it on every
    /// connected tenant. Returns how many tenants accepted it.
    pub async fn update_own_presence(&self, update: PresenceUpdate) -> usize {
        let record = self.own_presence.merge(update);

        let tenants: Vec<String> = self
            .registry
            .iter()
            .filter(|entry| entry.value().state() == ConnectionState::Connected)
            .map(|entry| entry.key().clone())
            .collect();

        let results = join_all(
            tenants
                .iter()
                .map(|tenant_id| self.transport.track_presence(tenant_id, &record)),
        )
        .await;

        let mut tracked = 0;
        for (tenant_id, result) in tenants.iter().zip(results) {
            match result {
                Ok(()) => tracked += 1,
                Err(e) => {
                    PresenceMetrics::record_track_failure();
                    tracing::warn!(tenant_id = %tenant_id, error = %e, "Failed to update own presence");
                }
            }
        }

        tracing::debug!(tenants = tenants.len(), tracked, "Own presence updated");
        tracked
    }

    /// Close every subscription and wait for the workers to stop
    pub async fn shutdown(&self) {
        let subscriptions: Vec<Arc<SubscriptionShared>> = self
            .registry
            .iter()
            .map(|entry| entry.value().clone())
            .collect();

        tracing::info!(count = subscriptions.len(), "Shutting down subscriptions");

        for shared in &subscriptions {
            let id = shared.id;
            self.registry
                .remove_if(&shared.tenant_id, |_, current| current.id == id);
            shared.close();
        }

        join_all(subscriptions.iter().map(|shared| shared.finished.cancelled())).await;
        tracing::info!("All subscriptions stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{ChangeEvent, EntityType, Operation};
    use crate::tenant::{LookupRuleError, TenantLookupRule};
    use crate::transport::{MemoryTransport, TransportSignal};
    use parking_lot::Mutex;
    use serde_json::json;

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached in time");
    }

    fn fast_settings() -> Settings {
        let mut settings = Settings::default();
        settings.reconnect.base_delay_ms = 10;
        settings.reconnect.max_delay_ms = 50;
        settings.reconnect.max_attempts = 3;
        settings.presence.user_id = "u1".to_string();
        settings.presence.display_name = "Ana".to_string();
        settings
    }

    fn job(tenant: &str) -> TransportSignal {
        TransportSignal::Change(ChangeEvent::new(
            EntityType::Job,
            Operation::Insert,
            None,
            json!({"id": "j1", "tenant_id": tenant}).as_object().cloned(),
        ))
    }

    #[tokio::test]
    async fn test_subscribe_connects_and_tracks_presence() {
        let transport = Arc::new(MemoryTransport::new());
        let manager = ConnectionManager::new(transport.clone(), &fast_settings());

        let handle = manager.subscribe("org-1", Handlers::new().on_entity_change(EntityType::Job, |_, _| {}));
        wait_until(|| handle.state() == ConnectionState::Connected).await;

        assert_eq!(transport.stream_entities("org-1"), Some(vec![EntityType::Job]));
        wait_until(|| !transport.tracked_presence("org-1").is_empty()).await;
        assert_eq!(transport.tracked_presence("org-1")[0].user_id, "u1");

        let stats = manager.stats();
        assert_eq!(stats.state, ConnectionState::Connected);
        assert_eq!(stats.active_subscription_count, 1);
        assert!(manager.tenant_stats("org-1").is_some());

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_resubscribe_replaces_previous_subscription() {
        let transport = Arc::new(MemoryTransport::new());
        let manager = ConnectionManager::new(transport.clone(), &fast_settings());

        let first = manager.subscribe("org-1", Handlers::new().on_entity_change(EntityType::Job, |_, _| {}));
        wait_until(|| first.state() == ConnectionState::Connected).await;

        let second = manager.subscribe("org-1", Handlers::new().on_entity_change(EntityType::Job, |_, _| {}));
        assert!(!first.is_active());
        first.closed().await;
        wait_until(|| second.state() == ConnectionState::Connected).await;

        assert_eq!(transport.active_streams("org-1"), 1);
        assert_eq!(manager.stats().active_subscription_count, 1);
        assert_eq!(manager.tenant_stats("org-1").unwrap().subscription_id, second.id());

        // The stale handle must not remove its replacement
        assert!(!first.unsubscribe());
        assert!(manager.is_subscribed("org-1"));

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_unsubscribe_is_idempotent() {
        let transport = Arc::new(MemoryTransport::new());
        let manager = ConnectionManager::new(transport.clone(), &fast_settings());
        let received = Arc::new(Mutex::new(0usize));
        let counter = received.clone();

        let handle = manager.subscribe(
            "org-1",
            Handlers::new().on_entity_change(EntityType::Job, move |_, _| *counter.lock() += 1),
        );
        wait_until(|| handle.state() == ConnectionState::Connected).await;

        transport.emit("org-1", job("org-1"));
        wait_until(|| *received.lock() == 1).await;

        assert!(handle.unsubscribe());
        assert!(!handle.unsubscribe());
        assert!(!manager.unsubscribe("org-1"));
        handle.closed().await;

        assert_eq!(transport.emit("org-1", job("org-1")), 0);
        assert_eq!(*received.lock(), 1);
        assert_eq!(manager.stats().state, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_update_own_presence_tracks_connected_tenants() {
        let transport = Arc::new(MemoryTransport::new());
        let manager = ConnectionManager::new(transport.clone(), &fast_settings());

        let a = manager.subscribe("org-1", Handlers::new());
        let b = manager.subscribe("org-2", Handlers::new());
        wait_until(|| a.state() == ConnectionState::Connected && b.state() == ConnectionState::Connected).await;
        // Initial tracks run in the background; let them land first
        wait_until(|| {
            !transport.tracked_presence("org-1").is_empty() && !transport.tracked_presence("org-2").is_empty()
        })
        .await;

        let tracked = manager
            .update_own_presence(PresenceUpdate::view("job:42"))
            .await;
        assert_eq!(tracked, 2);

        for tenant in ["org-1", "org-2"] {
            let records = transport.tracked_presence(tenant);
            let last = records.last().unwrap();
            assert_eq!(last.view.as_deref(), Some("job:42"));
            assert_eq!(last.display_name, "Ana");
        }
        assert_eq!(manager.own_presence().view.as_deref(), Some("job:42"));

        manager.shutdown().await;
        assert_eq!(transport.total_active_streams(), 0);
    }

    #[tokio::test]
    async fn test_from_settings_uses_configured_rules() {
        let transport = Arc::new(MemoryTransport::new());
        transport.insert_record(EntityType::Opportunity, "o1", json!({"id": "o1", "tenant_id": "org-1"}));

        let mut settings = fast_settings();
        settings.tenant_filter.rules = vec![TenantLookupRule::new(
            EntityType::Rfp,
            EntityType::Opportunity,
            "opportunity_id",
        )];
        let manager = ConnectionManager::from_settings(transport.clone(), &settings).unwrap();

        let delivered = Arc::new(Mutex::new(Vec::new()));
        let sink = delivered.clone();
        let handle = manager.subscribe(
            "org-1",
            Handlers::new().on_entity_change(EntityType::Rfp, move |_, event| {
                sink.lock().push(event.field("id").unwrap_or_default());
            }),
        );
        wait_until(|| handle.state() == ConnectionState::Connected).await;

        transport.emit(
            "org-1",
            TransportSignal::Change(ChangeEvent::new(
                EntityType::Rfp,
                Operation::Insert,
                None,
                json!({"id": "r1", "opportunity_id": "o1"}).as_object().cloned(),
            )),
        );
        wait_until(|| delivered.lock().len() == 1).await;
        assert_eq!(transport.lookup_count(), 1);

        manager.shutdown().await;
    }

    #[test]
    fn test_from_settings_rejects_invalid_rules() {
        let mut settings = fast_settings();
        settings.tenant_filter.rules = vec![
            TenantLookupRule::new(EntityType::Bid, EntityType::Contract, "contract_id"),
            TenantLookupRule::new(EntityType::Contract, EntityType::Bid, "bid_id"),
        ];

        let result = ConnectionManager::from_settings(Arc::new(MemoryTransport::new()), &settings);
        assert!(matches!(result, Err(RealtimeError::Rules(LookupRuleError::Cycle(_)))));
    }
}
