//! Demultiplexes a tenant feed into per-entity-type deliveries.
//!
//! Directly scoped entities are checked against the subscribed tenant and
//! delivered immediately. Indirectly scoped entities go through the
//! [`TenantFilter`]; their lookups run concurrently but each entity type keeps
//! a FIFO of pending lookups, so per-type delivery order matches arrival order.

use std::collections::{HashMap, HashSet};
use std::future::poll_fn;
use std::sync::Arc;
use std::task::Poll;

use futures::future::BoxFuture;
use futures::stream::FuturesOrdered;
use futures::StreamExt;

use crate::events::{ChangeEvent, EntityType, Operation};
use crate::metrics::RoutingMetrics;
use crate::tenant::{TenantFilter, TenantResolution};
use crate::transport::TransportError;

/// Why an event was not delivered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// No handler registered for the entity type
    Unregistered,
    /// Resolved tenant differs from the subscribed tenant
    TenantMismatch,
    /// A directly scoped record without a tenant field
    MissingTenant,
    /// A record in the lookup chain no longer exists
    LookupNotFound,
    /// The backend lookup itself failed
    LookupFailed,
}

impl DropReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DropReason::Unregistered => "unregistered",
            DropReason::TenantMismatch => "tenant_mismatch",
            DropReason::MissingTenant => "missing_tenant",
            DropReason::LookupNotFound => "lookup_not_found",
            DropReason::LookupFailed => "lookup_failed",
        }
    }
}

/// Result of routing one event
#[derive(Debug, Clone, PartialEq)]
pub enum RouteOutcome {
    /// Deliver now
    Deliver(ChangeEvent),
    /// Waiting on a tenant lookup; comes back through [`EventRouter::next_resolved`]
    Deferred,
    Dropped(DropReason),
}

type LookupResult = (ChangeEvent, Result<TenantResolution, TransportError>);

/// Per-subscription router
pub struct EventRouter {
    tenant_id: String,
    registered: HashSet<EntityType>,
    filter: Arc<TenantFilter>,
    pending: HashMap<EntityType, FuturesOrdered<BoxFuture<'static, LookupResult>>>,
}

impl EventRouter {
    pub fn new(
        tenant_id: impl Into<String>,
        registered: impl IntoIterator<Item = EntityType>,
        filter: Arc<TenantFilter>,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            registered: registered.into_iter().collect(),
            filter,
            pending: HashMap::new(),
        }
    }

    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    /// Route one change event
    pub fn route(&mut self, event: ChangeEvent) -> RouteOutcome {
        let entity = event.entity();

        if event.operation() == Operation::Delete {
            if let Some(id) = event.before().and_then(|record| self.filter.record_id(record)) {
                self.filter.invalidate(entity, &id);
            }
        }

        if !self.registered.contains(&entity) {
            return self.drop_event(&event, DropReason::Unregistered);
        }

        if self.filter.is_direct(entity) {
            let tenant = event.record().and_then(|record| self.filter.direct_tenant(record));
            return match tenant {
                Some(tenant) if tenant == self.tenant_id => RouteOutcome::Deliver(event),
                Some(_) => self.drop_event(&event, DropReason::TenantMismatch),
                None => self.drop_event(&event, DropReason::MissingTenant),
            };
        }

        let filter = self.filter.clone();
        let lookup: BoxFuture<'static, LookupResult> = Box::pin(async move {
            let result = match event.record() {
                Some(record) => filter.resolve_tenant(entity, record).await,
                None => Ok(TenantResolution::NotFound),
            };
            (event, result)
        });

        self.pending.entry(entity).or_default().push_back(lookup);
        RouteOutcome::Deferred
    }

    /// Next finished lookup, in per-entity-type arrival order.
    ///
    /// Pending forever when nothing is queued, so it can sit in a `select!`.
    pub async fn next_resolved(&mut self) -> RouteOutcome {
        let (event, result) = poll_fn(|cx| {
            for queue in self.pending.values_mut() {
                if let Poll::Ready(Some(item)) = queue.poll_next_unpin(cx) {
                    return Poll::Ready(item);
                }
            }
            Poll::Pending
        })
        .await;

        self.pending.retain(|_, queue| !queue.is_empty());
        self.finish(event, result)
    }

    fn finish(
        &self,
        event: ChangeEvent,
        result: Result<TenantResolution, TransportError>,
    ) -> RouteOutcome {
        match result {
            Ok(TenantResolution::Tenant(tenant)) if tenant == self.tenant_id => {
                RouteOutcome::Deliver(event)
            }
            Ok(TenantResolution::Tenant(_)) => self.drop_event(&event, DropReason::TenantMismatch),
            Ok(TenantResolution::NotFound) => self.drop_event(&event, DropReason::LookupNotFound),
            Err(e) => {
                tracing::warn!(
                    tenant_id = %self.tenant_id,
                    entity = %event.entity(),
                    error = %e,
                    "Tenant lookup failed, dropping event"
                );
                self.drop_event(&event, DropReason::LookupFailed)
            }
        }
    }

    fn drop_event(&self, event: &ChangeEvent, reason: DropReason) -> RouteOutcome {
        RoutingMetrics::record_dropped(reason.as_str());
        match reason {
            DropReason::LookupNotFound | DropReason::MissingTenant => {
                tracing::warn!(
                    tenant_id = %self.tenant_id,
                    entity = %event.entity(),
                    operation = event.operation().as_str(),
                    reason = reason.as_str(),
                    "Dropping change event"
                );
            }
            _ => {
                tracing::debug!(
                    tenant_id = %self.tenant_id,
                    entity = %event.entity(),
                    reason = reason.as_str(),
                    "Dropping change event"
                );
            }
        }
        RouteOutcome::Dropped(reason)
    }

    /// Lookups still in flight
    pub fn pending_lookups(&self) -> usize {
        self.pending.values().map(|queue| queue.len()).sum()
    }

    /// Drop every in-flight lookup without delivering its result
    pub fn cancel_pending(&mut self) -> usize {
        let cancelled = self.pending_lookups();
        self.pending.clear();
        cancelled
    }
}
