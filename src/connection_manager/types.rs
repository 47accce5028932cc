//! Subscription handles, handler sets and connection states

use std::cell::Cell;
use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{ReentrantMutex, RwLock};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::events::{ChangeEvent, EntityType};
use crate::metrics::ConnectionMetrics;
use crate::presence::Roster;

use super::stats::SubscriptionStats;

/// Connection states of a tenant subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum ConnectionState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
    Error = 3,
    TimedOut = 4,
    Reconnecting = 5,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Error => "error",
            ConnectionState::TimedOut => "timed_out",
            ConnectionState::Reconnecting => "reconnecting",
        }
    }
}

impl From<u8> for ConnectionState {
    fn from(value: u8) -> Self {
        match value {
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Connected,
            3 => ConnectionState::Error,
            4 => ConnectionState::TimedOut,
            5 => ConnectionState::Reconnecting,
            _ => ConnectionState::Disconnected,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

type EntityCallback = Arc<dyn Fn(EntityType, &ChangeEvent) + Send + Sync>;
type PresenceCallback = Box<dyn Fn(&Roster) + Send + Sync>;
type StateCallback = Box<dyn Fn(ConnectionState) + Send + Sync>;

/// Callbacks registered for one subscription.
///
/// Only entity types with a registered callback are requested from the
/// transport; the rest never reach the client.
#[derive(Default)]
pub struct Handlers {
    entity: HashMap<EntityType, EntityCallback>,
    presence: Option<PresenceCallback>,
    connection: Option<StateCallback>,
}

impl Handlers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_entity_change<F>(mut self, entity: EntityType, callback: F) -> Self
    where
        F: Fn(EntityType, &ChangeEvent) + Send + Sync + 'static,
    {
        self.entity.insert(entity, Arc::new(callback));
        self
    }

    /// Register one callback for several entity types
    pub fn on_entity_changes<F>(mut self, entities: impl IntoIterator<Item = EntityType>, callback: F) -> Self
    where
        F: Fn(EntityType, &ChangeEvent) + Send + Sync + 'static,
    {
        let callback: EntityCallback = Arc::new(callback);
        for entity in entities {
            self.entity.insert(entity, callback.clone());
        }
        self
    }

    pub fn on_presence_change<F>(mut self, callback: F) -> Self
    where
        F: Fn(&Roster) + Send + Sync + 'static,
    {
        self.presence = Some(Box::new(callback));
        self
    }

    pub fn on_connection_state_change<F>(mut self, callback: F) -> Self
    where
        F: Fn(ConnectionState) + Send + Sync + 'static,
    {
        self.connection = Some(Box::new(callback));
        self
    }

    /// Registered entity types, sorted
    pub fn entity_types(&self) -> Vec<EntityType> {
        let mut entities: Vec<_> = self.entity.keys().copied().collect();
        entities.sort();
        entities
    }

    fn emit_entity(&self, event: &ChangeEvent) -> bool {
        match self.entity.get(&event.entity()) {
            Some(callback) => {
                isolate("entity", || callback(event.entity(), event));
                true
            }
            None => false,
        }
    }

    fn emit_presence(&self, roster: &Roster) {
        if let Some(callback) = &self.presence {
            isolate("presence", || callback(roster));
        }
    }

    fn emit_state(&self, state: ConnectionState) {
        if let Some(callback) = &self.connection {
            isolate("connection_state", || callback(state));
        }
    }
}

/// Run a caller-supplied handler, containing any panic it raises
fn isolate(handler: &'static str, call: impl FnOnce()) {
    if panic::catch_unwind(AssertUnwindSafe(call)).is_err() {
        tracing::error!(handler, "Subscription handler panicked");
    }
}

/// State shared between a subscription's worker, its handle and the registry.
///
/// Every handler call happens under `gate`; closing flips the flag under the
/// same lock, so once [`close`](Self::close) returns no handler runs again.
/// The lock is re-entrant so a handler may close its own subscription.
pub(crate) struct SubscriptionShared {
    pub id: Uuid,
    pub tenant_id: String,
    pub created_at: DateTime<Utc>,
    pub entity_types: Vec<EntityType>,
    pub cancel: CancellationToken,
    /// Cancelled by the worker on exit
    pub finished: CancellationToken,
    state: AtomicU8,
    reconnect_attempts: AtomicU32,
    gate: ReentrantMutex<Cell<bool>>,
    handlers: Handlers,
    roster: RwLock<Roster>,
}

impl SubscriptionShared {
    pub fn new(tenant_id: String, handlers: Handlers) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant_id,
            created_at: Utc::now(),
            entity_types: handlers.entity_types(),
            cancel: CancellationToken::new(),
            finished: CancellationToken::new(),
            state: AtomicU8::new(ConnectionState::Disconnected as u8),
            reconnect_attempts: AtomicU32::new(0),
            gate: ReentrantMutex::new(Cell::new(true)),
            handlers,
            roster: RwLock::new(Roster::new()),
        }
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from(self.state.load(Ordering::Acquire))
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts.load(Ordering::Acquire)
    }

    pub fn set_reconnect_attempts(&self, attempts: u32) {
        self.reconnect_attempts.store(attempts, Ordering::Release);
    }

    pub fn is_open(&self) -> bool {
        self.gate.lock().get()
    }

    pub fn roster(&self) -> Roster {
        self.roster.read().clone()
    }

    /// Move to `state` and notify, unless closed or already there
    pub fn transition(&self, state: ConnectionState) -> bool {
        let gate = self.gate.lock();
        if !gate.get() {
            return false;
        }

        let previous = ConnectionState::from(self.state.swap(state as u8, Ordering::AcqRel));
        if previous == state {
            return false;
        }

        ConnectionMetrics::record_transition(state.as_str());
        tracing::info!(
            subscription_id = %self.id,
            tenant_id = %self.tenant_id,
            from = %previous,
            to = %state,
            "Connection state changed"
        );

        self.handlers.emit_state(state);
        true
    }

    /// Deliver a change event, returning whether a handler ran
    pub fn deliver_change(&self, event: &ChangeEvent) -> bool {
        let gate = self.gate.lock();
        gate.get() && self.handlers.emit_entity(event)
    }

    pub fn deliver_roster(&self, roster: Roster) {
        let gate = self.gate.lock();
        if !gate.get() {
            return;
        }
        self.handlers.emit_presence(&roster);
        *self.roster.write() = roster;
    }

    /// Close the delivery gate and cancel the worker.
    ///
    /// Returns `true` for the call that actually closed it.
    pub fn close(&self) -> bool {
        let was_open = {
            let gate = self.gate.lock();
            let was_open = gate.replace(false);
            if was_open {
                self.state
                    .store(ConnectionState::Disconnected as u8, Ordering::Release);
            }
            was_open
        };

        self.cancel.cancel();

        if was_open {
            ConnectionMetrics::subscription_closed();
            tracing::info!(
                subscription_id = %self.id,
                tenant_id = %self.tenant_id,
                "Subscription closed"
            );
        }
        was_open
    }

    pub fn stats(&self) -> SubscriptionStats {
        SubscriptionStats {
            subscription_id: self.id,
            tenant_id: self.tenant_id.clone(),
            state: self.state(),
            reconnect_attempts: self.reconnect_attempts(),
            entity_types: self.entity_types.clone(),
            created_at: self.created_at,
        }
    }
}

/// tenant_id -> live subscription
pub(crate) type Registry = DashMap<String, Arc<SubscriptionShared>>;

/// Caller-side handle of a live subscription.
///
/// Dropping the handle does not unsubscribe; call [`unsubscribe`](Self::unsubscribe).
#[derive(Clone)]
pub struct SubscriptionHandle {
    shared: Arc<SubscriptionShared>,
    registry: Arc<Registry>,
}

impl SubscriptionHandle {
    pub(crate) fn new(shared: Arc<SubscriptionShared>, registry: Arc<Registry>) -> Self {
        Self { shared, registry }
    }

    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    pub fn tenant_id(&self) -> &str {
        &self.shared.tenant_id
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.shared.reconnect_attempts()
    }

    /// Last roster delivered to this subscription
    pub fn roster(&self) -> Roster {
        self.shared.roster()
    }

    /// Whether handlers can still fire
    pub fn is_active(&self) -> bool {
        self.shared.is_open()
    }

    pub fn stats(&self) -> SubscriptionStats {
        self.shared.stats()
    }

    /// Tear the subscription down.
    ///
    /// Once this returns no handler of this subscription fires again. Safe to
    /// call more than once and from inside a handler; returns `true` the first
    /// time.
    pub fn unsubscribe(&self) -> bool {
        let id = self.shared.id;
        self.registry
            .remove_if(&self.shared.tenant_id, |_, current| current.id == id);
        self.shared.close()
    }

    /// Wait until the worker has released the stream and pending lookups
    pub async fn closed(&self) {
        self.shared.finished.cancelled().await;
    }
}

impl fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("id", &self.shared.id)
            .field("tenant_id", &self.shared.tenant_id)
            .field("state", &self.shared.state())
            .finish()
    }
}
