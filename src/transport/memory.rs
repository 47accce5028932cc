//! In-process transport.
//!
//! Feeds are backed by unbounded channels so tests and embedders can push
//! signals directly; records used for tenant lookups live in a `DashMap`.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::events::{EntityType, Record};
use crate::presence::PresenceRecord;

use super::traits::Transport;
use super::types::{SignalStream, TransportError, TransportSignal};

struct StreamSlot {
    tenant_id: String,
    entities: Vec<EntityType>,
    sender: mpsc::UnboundedSender<TransportSignal>,
}

impl StreamSlot {
    fn accepts(&self, signal: &TransportSignal) -> bool {
        match signal {
            TransportSignal::Change(event) => self.entities.contains(&event.entity()),
            _ => true,
        }
    }
}

/// In-memory transport backend
pub struct MemoryTransport {
    streams: Mutex<Vec<StreamSlot>>,
    records: DashMap<(EntityType, String), Record>,
    tracked: Mutex<Vec<(String, PresenceRecord)>>,
    opened: AtomicUsize,
    failing_opens: AtomicU32,
    lookups: AtomicUsize,
    lookup_delay_ms: AtomicU64,
    track_delay_ms: AtomicU64,
    auto_connect: AtomicBool,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self {
            streams: Mutex::new(Vec::new()),
            records: DashMap::new(),
            tracked: Mutex::new(Vec::new()),
            opened: AtomicUsize::new(0),
            failing_opens: AtomicU32::new(0),
            lookups: AtomicUsize::new(0),
            lookup_delay_ms: AtomicU64::new(0),
            track_delay_ms: AtomicU64::new(0),
            auto_connect: AtomicBool::new(true),
        }
    }

    /// Store a record for lookups. Non-object values are ignored.
    pub fn insert_record(&self, entity: EntityType, id: impl Into<String>, record: Value) {
        if let Value::Object(map) = record {
            self.records.insert((entity, id.into()), map);
        }
    }

    pub fn remove_record(&self, entity: EntityType, id: &str) -> bool {
        self.records.remove(&(entity, id.to_string())).is_some()
    }

    /// Push a signal to every live feed of a tenant, returning how many got it
    pub fn emit(&self, tenant_id: &str, signal: TransportSignal) -> usize {
        let mut streams = self.streams.lock();
        streams.retain(|slot| !slot.sender.is_closed());

        streams
            .iter()
            .filter(|slot| slot.tenant_id == tenant_id && slot.accepts(&signal))
            .filter(|slot| slot.sender.send(signal.clone()).is_ok())
            .count()
    }

    /// Live (not yet dropped) feeds for a tenant
    pub fn active_streams(&self, tenant_id: &str) -> usize {
        self.streams
            .lock()
            .iter()
            .filter(|slot| slot.tenant_id == tenant_id && !slot.sender.is_closed())
            .count()
    }

    pub fn total_active_streams(&self) -> usize {
        self.streams
            .lock()
            .iter()
            .filter(|slot| !slot.sender.is_closed())
            .count()
    }

    /// Entity types requested by the newest live feed of a tenant
    pub fn stream_entities(&self, tenant_id: &str) -> Option<Vec<EntityType>> {
        self.streams
            .lock()
            .iter()
            .rev()
            .find(|slot| slot.tenant_id == tenant_id && !slot.sender.is_closed())
            .map(|slot| slot.entities.clone())
    }

    /// Total feeds ever opened
    pub fn opened_streams(&self) -> usize {
        self.opened.load(Ordering::Relaxed)
    }

    /// Make the next `count` calls to `open_stream` fail
    pub fn fail_next_opens(&self, count: u32) {
        self.failing_opens.store(count, Ordering::Relaxed);
    }

    /// Whether new feeds report `Connected` on their own
    pub fn set_auto_connect(&self, enabled: bool) {
        self.auto_connect.store(enabled, Ordering::Relaxed);
    }

    pub fn set_lookup_delay(&self, delay: Duration) {
        self.lookup_delay_ms
            .store(delay.as_millis() as u64, Ordering::Relaxed);
    }

    /// Hold every presence track for `delay` before acknowledging it
    pub fn set_track_delay(&self, delay: Duration) {
        self.track_delay_ms
            .store(delay.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn lookup_count(&self) -> usize {
        self.lookups.load(Ordering::Relaxed)
    }

    /// Presence records tracked for a tenant, oldest first
    pub fn tracked_presence(&self, tenant_id: &str) -> Vec<PresenceRecord> {
        self.tracked
            .lock()
            .iter()
            .filter(|(tenant, _)| tenant == tenant_id)
            .map(|(_, record)| record.clone())
            .collect()
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn open_stream(
        &self,
        tenant_id: &str,
        entities: &[EntityType],
    ) -> Result<SignalStream, TransportError> {
        let failing = self.failing_opens.load(Ordering::Relaxed);
        if failing > 0 {
            self.failing_opens.store(failing - 1, Ordering::Relaxed);
            return Err(TransportError::Unavailable("injected open failure".to_string()));
        }

        let (sender, receiver) = mpsc::unbounded_channel();
        let _ = sender.send(TransportSignal::Connecting);
        if self.auto_connect.load(Ordering::Relaxed) {
            let _ = sender.send(TransportSignal::Connected);
        }

        self.streams.lock().push(StreamSlot {
            tenant_id: tenant_id.to_string(),
            entities: entities.to_vec(),
            sender,
        });
        self.opened.fetch_add(1, Ordering::Relaxed);

        tracing::debug!(tenant_id = %tenant_id, entities = ?entities, "Memory feed opened");

        Ok(UnboundedReceiverStream::new(receiver).boxed())
    }

    async fn track_presence(
        &self,
        tenant_id: &str,
        presence: &PresenceRecord,
    ) -> Result<(), TransportError> {
        let delay = self.track_delay_ms.load(Ordering::Relaxed);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        self.tracked
            .lock()
            .push((tenant_id.to_string(), presence.clone()));
        Ok(())
    }

    async fn lookup_parent(
        &self,
        entity: EntityType,
        id: &str,
    ) -> Result<Option<Record>, TransportError> {
        let delay = self.lookup_delay_ms.load(Ordering::Relaxed);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        self.lookups.fetch_add(1, Ordering::Relaxed);
        Ok(self
            .records
            .get(&(entity, id.to_string()))
            .map(|record| record.value().clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{ChangeEvent, Operation};
    use serde_json::json;

    fn job_event() -> ChangeEvent {
        let record = json!({"id": "job-1", "tenant_id": "org-1"});
        ChangeEvent::new(EntityType::Job, Operation::Insert, None, record.as_object().cloned())
    }

    #[tokio::test]
    async fn test_open_stream_reports_connected() {
        let transport = MemoryTransport::new();
        let mut stream = transport.open_stream("org-1", &[EntityType::Job]).await.unwrap();

        assert_eq!(stream.next().await, Some(TransportSignal::Connecting));
        assert_eq!(stream.next().await, Some(TransportSignal::Connected));
        assert_eq!(transport.active_streams("org-1"), 1);

        drop(stream);
        assert_eq!(transport.active_streams("org-1"), 0);
    }

    #[tokio::test]
    async fn test_emit_respects_entity_filter() {
        let transport = MemoryTransport::new();
        let _jobs = transport.open_stream("org-1", &[EntityType::Job]).await.unwrap();
        let _bids = transport.open_stream("org-1", &[EntityType::Bid]).await.unwrap();

        assert_eq!(transport.emit("org-1", TransportSignal::Change(job_event())), 1);
        assert_eq!(transport.emit("org-1", TransportSignal::TimedOut), 2);
        assert_eq!(transport.emit("org-2", TransportSignal::TimedOut), 0);
    }

    #[tokio::test]
    async fn test_injected_open_failures() {
        let transport = MemoryTransport::new();
        transport.fail_next_opens(1);

        assert!(transport.open_stream("org-1", &[]).await.is_err());
        assert!(transport.open_stream("org-1", &[]).await.is_ok());
        assert_eq!(transport.opened_streams(), 1);
    }

    #[tokio::test]
    async fn test_lookup_records() {
        let transport = MemoryTransport::new();
        transport.insert_record(EntityType::Job, "job-1", json!({"tenant_id": "org-1"}));

        let found = transport.lookup_parent(EntityType::Job, "job-1").await.unwrap();
        assert_eq!(found.unwrap()["tenant_id"], "org-1");
        assert!(transport.lookup_parent(EntityType::Job, "job-2").await.unwrap().is_none());
        assert_eq!(transport.lookup_count(), 2);
    }
}
