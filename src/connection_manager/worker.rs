//! Background task driving one tenant subscription.
//!
//! The worker owns the feed, the router with its in-flight lookups, the
//! presence roster and the reconnection policy. Nothing here is shared with
//! other subscriptions, so cancelling the worker releases all of it.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::metrics::{ConnectionMetrics, PresenceMetrics, RoutingMetrics};
use crate::presence::{OwnPresence, PresenceTracker};
use crate::reconnect::{BackoffConfig, ReconnectionPolicy};
use crate::router::{EventRouter, RouteOutcome};
use crate::tenant::TenantFilter;
use crate::transport::{Transport, TransportError, TransportSignal};

use super::types::{ConnectionState, Registry, SubscriptionShared};

/// Tunables handed to every worker of a manager
#[derive(Debug, Clone)]
pub(crate) struct WorkerOptions {
    pub backoff: BackoffConfig,
    pub heartbeat_interval: Duration,
    pub stale_after: Duration,
}

/// Why a feed stopped
enum StreamEnd {
    Cancelled,
    Failed { state: ConnectionState, reason: String },
}

impl StreamEnd {
    fn failed(state: ConnectionState, reason: impl Into<String>) -> Self {
        StreamEnd::Failed {
            state,
            reason: reason.into(),
        }
    }
}

/// Releases a subscription however its worker ends, panics included.
///
/// A worker that stops while the subscription is still open reports
/// `Error` then `Disconnected`, leaves the registry and closes the gate.
struct ExitGuard {
    shared: Arc<SubscriptionShared>,
    registry: Arc<Registry>,
    _finished: DropGuard,
}

impl ExitGuard {
    fn new(shared: Arc<SubscriptionShared>, registry: Arc<Registry>) -> Self {
        let finished = shared.finished.clone().drop_guard();
        Self {
            shared,
            registry,
            _finished: finished,
        }
    }
}

impl Drop for ExitGuard {
    fn drop(&mut self) {
        if self.shared.is_open() {
            tracing::error!(
                subscription_id = %self.shared.id,
                tenant_id = %self.shared.tenant_id,
                "Subscription worker stopped unexpectedly"
            );
            self.shared.transition(ConnectionState::Error);
            self.shared.transition(ConnectionState::Disconnected);
        }

        let id = self.shared.id;
        self.registry
            .remove_if(&self.shared.tenant_id, |_, current| current.id == id);
        self.shared.close();
    }
}

pub(crate) struct SubscriptionWorker {
    shared: Arc<SubscriptionShared>,
    registry: Arc<Registry>,
    transport: Arc<dyn Transport>,
    filter: Arc<TenantFilter>,
    own_presence: Arc<OwnPresence>,
    router: EventRouter,
    presence: PresenceTracker,
    policy: ReconnectionPolicy,
    heartbeat_interval: Duration,
    /// In-flight own presence track, at most one
    track_task: Option<JoinHandle<()>>,
}

impl SubscriptionWorker {
    pub fn new(
        shared: Arc<SubscriptionShared>,
        registry: Arc<Registry>,
        transport: Arc<dyn Transport>,
        filter: Arc<TenantFilter>,
        own_presence: Arc<OwnPresence>,
        options: &WorkerOptions,
    ) -> Self {
        let router = EventRouter::new(
            shared.tenant_id.clone(),
            shared.entity_types.iter().copied(),
            filter.clone(),
        );

        Self {
            shared,
            registry,
            transport,
            filter,
            own_presence,
            router,
            presence: PresenceTracker::new(options.stale_after),
            policy: ReconnectionPolicy::with_config(options.backoff.clone()),
            heartbeat_interval: options.heartbeat_interval,
            track_task: None,
        }
    }

    /// Run until unsubscribed, superseded or out of reconnection attempts
    pub async fn run(mut self) {
        let cancel = self.shared.cancel.clone();
        let _exit = ExitGuard::new(self.shared.clone(), self.registry.clone());

        tracing::info!(
            subscription_id = %self.shared.id,
            tenant_id = %self.shared.tenant_id,
            transport = self.transport.name(),
            "Subscription worker started"
        );

        self.shared.transition(ConnectionState::Connecting);

        loop {
            let (state, reason) = match self.stream_once(&cancel).await {
                StreamEnd::Cancelled => break,
                StreamEnd::Failed { state, reason } => (state, reason),
            };

            let Some(delay) = self.policy.schedule() else {
                self.exhaust(&reason);
                break;
            };

            self.shared.set_reconnect_attempts(self.policy.attempt());
            self.shared.transition(state);
            self.shared.transition(ConnectionState::Reconnecting);

            tracing::warn!(
                tenant_id = %self.shared.tenant_id,
                attempt = self.policy.attempt(),
                delay_ms = delay.as_millis() as u64,
                reason = %reason,
                "Feed lost, scheduling reconnection"
            );

            if !self.wait_backoff(delay, &cancel).await {
                break;
            }

            self.policy.begin_attempt();
            ConnectionMetrics::record_reconnect_attempt();
        }

        let dropped = self.router.cancel_pending();
        tracing::info!(
            subscription_id = %self.shared.id,
            tenant_id = %self.shared.tenant_id,
            dropped_lookups = dropped,
            "Subscription worker stopped"
        );
    }

    /// Open one feed and pump it until it fails or the worker is cancelled
    async fn stream_once(&mut self, cancel: &CancellationToken) -> StreamEnd {
        let opened = tokio::select! {
            _ = cancel.cancelled() => return StreamEnd::Cancelled,
            opened = self.transport.open_stream(&self.shared.tenant_id, &self.shared.entity_types) => opened,
        };

        let mut stream = match opened {
            Ok(stream) => stream,
            Err(TransportError::Timeout(ms)) => {
                return StreamEnd::failed(
                    ConnectionState::TimedOut,
                    format!("open timed out after {}ms", ms),
                );
            }
            Err(e) => return StreamEnd::failed(ConnectionState::Error, e.to_string()),
        };

        let period = self.heartbeat_interval;
        let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if cancel.is_cancelled() {
                return StreamEnd::Cancelled;
            }

            tokio::select! {
                _ = cancel.cancelled() => return StreamEnd::Cancelled,
                signal = stream.next() => {
                    let Some(signal) = signal else {
                        return StreamEnd::failed(ConnectionState::Error, "feed ended");
                    };
                    if let Some(end) = self.handle_signal(signal, cancel) {
                        return end;
                    }
                }
                outcome = self.router.next_resolved() => self.deliver(outcome),
                _ = heartbeat.tick() => self.heartbeat(cancel),
            }
        }
    }

    fn handle_signal(
        &mut self,
        signal: TransportSignal,
        cancel: &CancellationToken,
    ) -> Option<StreamEnd> {
        match signal {
            TransportSignal::Connecting => {
                // A reconnect stays "reconnecting" until it succeeds
                if self.shared.state() != ConnectionState::Reconnecting {
                    self.shared.transition(ConnectionState::Connecting);
                }
            }
            TransportSignal::Connected => {
                self.policy.reset();
                self.shared.set_reconnect_attempts(0);
                self.shared.transition(ConnectionState::Connected);
                self.track_own_presence(cancel);
            }
            TransportSignal::Error(reason) => {
                return Some(StreamEnd::failed(ConnectionState::Error, reason));
            }
            TransportSignal::TimedOut => {
                return Some(StreamEnd::failed(ConnectionState::TimedOut, "feed timed out"));
            }
            TransportSignal::Closed => {
                return Some(StreamEnd::failed(ConnectionState::Error, "feed closed by server"));
            }
            TransportSignal::Change(event) => {
                let outcome = self.router.route(event);
                self.deliver(outcome);
            }
            TransportSignal::Presence(signal) => {
                if self.presence.apply(signal) {
                    self.publish_roster();
                }
            }
        }
        None
    }

    fn deliver(&self, outcome: RouteOutcome) {
        if let RouteOutcome::Deliver(event) = outcome {
            if self.shared.deliver_change(&event) {
                RoutingMetrics::record_delivered(event.entity().as_str());
            }
        }
    }

    fn publish_roster(&self) {
        self.shared.deliver_roster(self.presence.current_roster());
    }

    /// Track own presence without holding up delivery.
    ///
    /// The call is bounded by the heartbeat interval, replaces any track still
    /// in flight and is abandoned when the subscription is cancelled.
    fn track_own_presence(&mut self, cancel: &CancellationToken) {
        if let Some(previous) = self.track_task.take() {
            previous.abort();
        }

        let transport = self.transport.clone();
        let tenant_id = self.shared.tenant_id.clone();
        let record = self.own_presence.current();
        let cancel = cancel.clone();
        let limit = self.heartbeat_interval;

        self.track_task = Some(tokio::spawn(async move {
            let result = tokio::select! {
                _ = cancel.cancelled() => return,
                result = tokio::time::timeout(limit, transport.track_presence(&tenant_id, &record)) => result,
            };

            let error = match result {
                Ok(Ok(())) => return,
                Ok(Err(e)) => e.to_string(),
                Err(_) => format!("no ack within {}ms", limit.as_millis()),
            };

            PresenceMetrics::record_track_failure();
            tracing::warn!(
                tenant_id = %tenant_id,
                user_id = %record.user_id,
                error = %error,
                "Failed to track own presence"
            );
        }));
    }

    fn heartbeat(&mut self, cancel: &CancellationToken) {
        if self.shared.state() == ConnectionState::Connected {
            self.track_own_presence(cancel);
        }

        let expired = self.presence.prune_stale(Utc::now());
        if expired > 0 {
            PresenceMetrics::record_expired(expired as u64);
            self.publish_roster();
        }

        let purged = self.filter.purge_expired();
        if purged > 0 {
            tracing::debug!(purged, "Purged expired tenant cache entries");
        }
    }

    /// Sleep out a backoff delay while still delivering finished lookups.
    ///
    /// Returns `false` if cancelled.
    async fn wait_backoff(&mut self, delay: Duration, cancel: &CancellationToken) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => return false,
                _ = &mut sleep => return true,
                outcome = self.router.next_resolved() => self.deliver(outcome),
            }
        }
    }

    fn exhaust(&mut self, reason: &str) {
        ConnectionMetrics::record_exhausted();
        tracing::error!(
            tenant_id = %self.shared.tenant_id,
            attempts = self.policy.attempt().saturating_sub(1),
            reason = %reason,
            "Reconnection attempts exhausted, giving up"
        );

        self.shared.transition(ConnectionState::Error);
        self.shared.transition(ConnectionState::Disconnected);

        let id = self.shared.id;
        self.registry
            .remove_if(&self.shared.tenant_id, |_, current| current.id == id);
        self.shared.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection_manager::types::Handlers;
    use parking_lot::Mutex;

    fn open_subscription(states: Arc<Mutex<Vec<ConnectionState>>>) -> (Arc<SubscriptionShared>, Arc<Registry>) {
        let shared = Arc::new(SubscriptionShared::new(
            "org-1".to_string(),
            Handlers::new().on_connection_state_change(move |state| states.lock().push(state)),
        ));
        let registry = Arc::new(Registry::new());
        registry.insert("org-1".to_string(), shared.clone());
        (shared, registry)
    }

    #[test]
    fn test_exit_guard_releases_open_subscription() {
        let states = Arc::new(Mutex::new(Vec::new()));
        let (shared, registry) = open_subscription(states.clone());

        drop(ExitGuard::new(shared.clone(), registry.clone()));

        assert!(!shared.is_open());
        assert!(registry.get("org-1").is_none());
        assert!(shared.finished.is_cancelled());
        assert_eq!(
            *states.lock(),
            vec![ConnectionState::Error, ConnectionState::Disconnected]
        );
    }

    #[test]
    fn test_exit_guard_is_quiet_after_close() {
        let states = Arc::new(Mutex::new(Vec::new()));
        let (shared, registry) = open_subscription(states.clone());
        shared.close();

        drop(ExitGuard::new(shared.clone(), registry.clone()));

        assert!(states.lock().is_empty());
        assert!(registry.get("org-1").is_none());
        assert!(shared.finished.is_cancelled());
    }

    #[test]
    fn test_exit_guard_keeps_successor_registered() {
        let (shared, registry) = open_subscription(Arc::new(Mutex::new(Vec::new())));
        let successor = Arc::new(SubscriptionShared::new("org-1".to_string(), Handlers::new()));
        registry.insert("org-1".to_string(), successor.clone());

        drop(ExitGuard::new(shared, registry.clone()));

        let current = registry.get("org-1").map(|entry| entry.id);
        assert_eq!(current, Some(successor.id));
    }

    #[tokio::test]
    async fn test_exit_guard_runs_when_task_panics() {
        let states = Arc::new(Mutex::new(Vec::new()));
        let (shared, registry) = open_subscription(states.clone());

        let task_shared = shared.clone();
        let task_registry = registry.clone();
        let result = tokio::spawn(async move {
            let _exit = ExitGuard::new(task_shared, task_registry);
            tokio::task::yield_now().await;
            panic!("worker failed");
        })
        .await;

        assert!(result.is_err());
        assert!(!shared.is_open());
        assert!(registry.get("org-1").is_none());
        assert!(shared.finished.is_cancelled());
        assert_eq!(
            *states.lock(),
            vec![ConnectionState::Error, ConnectionState::Disconnected]
        );
    }
}
