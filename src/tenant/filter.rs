use std::borrow::Cow;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Semaphore;
use tokio::time::Instant;

use crate::config::TenantFilterConfig;
use crate::events::{record_field, EntityType, Record};
use crate::metrics::LookupMetrics;
use crate::transport::{Transport, TransportError};

use super::rules::LookupRules;

/// Outcome of a tenant resolution
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TenantResolution {
    Tenant(String),
    /// A record in the chain is missing (typically already deleted)
    NotFound,
}

struct CachedTenant {
    tenant_id: String,
    expires_at: Instant,
}

/// Resolves the owning tenant of records by following the lookup chain.
///
/// Resolved tenants are cached per `(entity type, id)` for a short TTL.
/// Backend lookups are bounded by a semaphore shared by every caller.
pub struct TenantFilter {
    transport: Arc<dyn Transport>,
    rules: LookupRules,
    cache: DashMap<(EntityType, String), CachedTenant>,
    permits: Semaphore,
    cache_ttl: Duration,
    max_hops: usize,
    tenant_field: String,
    id_field: String,
}

impl TenantFilter {
    pub fn new(transport: Arc<dyn Transport>, rules: LookupRules, config: &TenantFilterConfig) -> Self {
        Self {
            transport,
            rules,
            cache: DashMap::new(),
            permits: Semaphore::new(config.max_concurrent_lookups.max(1)),
            cache_ttl: Duration::from_secs(config.cache_ttl_seconds),
            max_hops: config.max_hops,
            tenant_field: config.tenant_field.clone(),
            id_field: config.id_field.clone(),
        }
    }

    pub fn rules(&self) -> &LookupRules {
        &self.rules
    }

    pub fn is_direct(&self, entity: EntityType) -> bool {
        self.rules.is_direct(entity)
    }

    /// Tenant id carried directly on a record
    pub fn direct_tenant(&self, record: &Record) -> Option<String> {
        record_field(record, &self.tenant_field)
    }

    /// Primary key of a record
    pub fn record_id(&self, record: &Record) -> Option<String> {
        record_field(record, &self.id_field)
    }

    /// Find the owning tenant of `record`, an instance of `entity`
    #[tracing::instrument(name = "resolve_tenant", skip(self, record))]
    pub async fn resolve_tenant(
        &self,
        entity: EntityType,
        record: &Record,
    ) -> Result<TenantResolution, TransportError> {
        let mut current_entity = entity;
        let mut current: Cow<'_, Record> = Cow::Borrowed(record);
        let mut visited: Vec<(EntityType, String)> = Vec::new();

        loop {
            let Some(rule) = self.rules.rule_for(current_entity) else {
                let resolution = match self.direct_tenant(&current) {
                    Some(tenant_id) => {
                        self.remember(&visited, &tenant_id);
                        TenantResolution::Tenant(tenant_id)
                    }
                    None => {
                        tracing::warn!(
                            entity = %current_entity,
                            field = %self.tenant_field,
                            "Record has no tenant field"
                        );
                        TenantResolution::NotFound
                    }
                };
                return Ok(resolution);
            };

            if visited.len() >= self.max_hops {
                tracing::warn!(max_hops = self.max_hops, "Lookup chain exceeded hop limit");
                return Ok(TenantResolution::NotFound);
            }

            let Some(parent_id) = record_field(&current, &rule.foreign_key) else {
                tracing::warn!(
                    entity = %current_entity,
                    foreign_key = %rule.foreign_key,
                    "Record has no parent reference"
                );
                return Ok(TenantResolution::NotFound);
            };

            let key = (rule.parent, parent_id);
            if let Some(tenant_id) = self.cached(&key) {
                LookupMetrics::record_cache_hit();
                self.remember(&visited, &tenant_id);
                return Ok(TenantResolution::Tenant(tenant_id));
            }
            LookupMetrics::record_cache_miss();

            let parent = self.fetch(key.0, &key.1).await?;
            match parent {
                Some(parent) => {
                    current_entity = key.0;
                    current = Cow::Owned(parent);
                    visited.push(key);
                }
                None => {
                    LookupMetrics::record_not_found();
                    tracing::debug!(parent = %key.0, parent_id = %key.1, "Parent record not found");
                    return Ok(TenantResolution::NotFound);
                }
            }
        }
    }

    async fn fetch(&self, entity: EntityType, id: &str) -> Result<Option<Record>, TransportError> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| TransportError::Unavailable("lookup pool closed".to_string()))?;

        let start = Instant::now();
        let result = self.transport.lookup_parent(entity, id).await;
        LookupMetrics::record_latency_ms(start.elapsed().as_millis() as u64);

        result
    }

    fn cached(&self, key: &(EntityType, String)) -> Option<String> {
        let entry = self.cache.get(key)?;
        if entry.expires_at > Instant::now() {
            return Some(entry.tenant_id.clone());
        }
        drop(entry);
        self.cache.remove(key);
        None
    }

    fn remember(&self, visited: &[(EntityType, String)], tenant_id: &str) {
        if self.cache_ttl.is_zero() {
            return;
        }
        let expires_at = Instant::now() + self.cache_ttl;
        for key in visited {
            self.cache.insert(
                key.clone(),
                CachedTenant {
                    tenant_id: tenant_id.to_string(),
                    expires_at,
                },
            );
        }
    }

    /// Forget a cached record, e.g. after its delete event
    pub fn invalidate(&self, entity: EntityType, id: &str) -> bool {
        self.cache.remove(&(entity, id.to_string())).is_some()
    }

    /// Remove expired cache entries and return how many were dropped
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.cache.len();
        self.cache.retain(|_, entry| entry.expires_at > now);
        before - self.cache.len()
    }

    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tenant::TenantLookupRule;
    use crate::transport::MemoryTransport;
    use serde_json::json;

    fn record(value: serde_json::Value) -> Record {
        value.as_object().cloned().unwrap()
    }

    fn filter_with(transport: Arc<MemoryTransport>, rules: LookupRules) -> TenantFilter {
        TenantFilter::new(transport, rules, &TenantFilterConfig::default())
    }

    #[tokio::test]
    async fn test_direct_entity_needs_no_lookup() {
        let transport = Arc::new(MemoryTransport::new());
        let filter = filter_with(transport.clone(), LookupRules::default());

        let resolution = filter
            .resolve_tenant(EntityType::Job, &record(json!({"id": "j1", "tenant_id": "org-1"})))
            .await
            .unwrap();
        assert_eq!(resolution, TenantResolution::Tenant("org-1".to_string()));
        assert_eq!(transport.lookup_count(), 0);
    }

    #[tokio::test]
    async fn test_single_hop_with_cache() {
        let transport = Arc::new(MemoryTransport::new());
        transport.insert_record(EntityType::Job, "j1", json!({"id": "j1", "tenant_id": "org-1"}));
        let filter = filter_with(transport.clone(), LookupRules::default());

        let assignment = record(json!({"id": "a1", "job_id": "j1"}));
        for _ in 0..3 {
            let resolution = filter.resolve_tenant(EntityType::Assignment, &assignment).await.unwrap();
            assert_eq!(resolution, TenantResolution::Tenant("org-1".to_string()));
        }
        assert_eq!(transport.lookup_count(), 1);
        assert_eq!(filter.cache_len(), 1);

        assert!(filter.invalidate(EntityType::Job, "j1"));
        filter.resolve_tenant(EntityType::Assignment, &assignment).await.unwrap();
        assert_eq!(transport.lookup_count(), 2);
    }

    #[tokio::test]
    async fn test_missing_parent_is_not_found() {
        let transport = Arc::new(MemoryTransport::new());
        let filter = filter_with(transport.clone(), LookupRules::default());

        let orphan = record(json!({"id": "a1", "job_id": "gone"}));
        let resolution = filter.resolve_tenant(EntityType::Assignment, &orphan).await.unwrap();
        assert_eq!(resolution, TenantResolution::NotFound);

        let no_fk = record(json!({"id": "a2"}));
        let resolution = filter.resolve_tenant(EntityType::Assignment, &no_fk).await.unwrap();
        assert_eq!(resolution, TenantResolution::NotFound);

        // NotFound is never cached
        assert_eq!(filter.cache_len(), 0);
    }

    #[tokio::test]
    async fn test_multi_hop_resolution() {
        let transport = Arc::new(MemoryTransport::new());
        transport.insert_record(EntityType::Bid, "b1", json!({"id": "b1", "opportunity_id": "o1"}));
        transport.insert_record(EntityType::Opportunity, "o1", json!({"id": "o1", "tenant_id": "org-7"}));

        let rules = LookupRules::new([
            TenantLookupRule::new(EntityType::ComplianceItem, EntityType::Bid, "bid_id"),
            TenantLookupRule::new(EntityType::Bid, EntityType::Opportunity, "opportunity_id"),
        ])
        .unwrap();
        let filter = filter_with(transport.clone(), rules);

        let item = record(json!({"id": "c1", "bid_id": "b1"}));
        let resolution = filter.resolve_tenant(EntityType::ComplianceItem, &item).await.unwrap();
        assert_eq!(resolution, TenantResolution::Tenant("org-7".to_string()));
        assert_eq!(transport.lookup_count(), 2);
        // Both hops cached
        assert_eq!(filter.cache_len(), 2);

        let sibling = record(json!({"id": "c2", "bid_id": "b1"}));
        filter.resolve_tenant(EntityType::ComplianceItem, &sibling).await.unwrap();
        assert_eq!(transport.lookup_count(), 2);
    }

    #[tokio::test]
    async fn test_hop_limit() {
        let transport = Arc::new(MemoryTransport::new());
        transport.insert_record(EntityType::Bid, "b1", json!({"id": "b1", "opportunity_id": "o1"}));
        transport.insert_record(EntityType::Opportunity, "o1", json!({"id": "o1", "tenant_id": "org-7"}));

        let rules = LookupRules::new([
            TenantLookupRule::new(EntityType::ComplianceItem, EntityType::Bid, "bid_id"),
            TenantLookupRule::new(EntityType::Bid, EntityType::Opportunity, "opportunity_id"),
        ])
        .unwrap();
        let config = TenantFilterConfig {
            max_hops: 1,
            ..TenantFilterConfig::default()
        };
        let filter = TenantFilter::new(transport, rules, &config);

        let item = record(json!({"id": "c1", "bid_id": "b1"}));
        let resolution = filter.resolve_tenant(EntityType::ComplianceItem, &item).await.unwrap();
        assert_eq!(resolution, TenantResolution::NotFound);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cache_expiry() {
        let transport = Arc::new(MemoryTransport::new());
        transport.insert_record(EntityType::Job, "j1", json!({"id": "j1", "tenant_id": "org-1"}));
        let filter = filter_with(transport.clone(), LookupRules::default());

        let assignment = record(json!({"id": "a1", "job_id": "j1"}));
        filter.resolve_tenant(EntityType::Assignment, &assignment).await.unwrap();
        assert_eq!(filter.purge_expired(), 0);

        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(filter.purge_expired(), 1);

        filter.resolve_tenant(EntityType::Assignment, &assignment).await.unwrap();
        assert_eq!(transport.lookup_count(), 2);
    }
}
