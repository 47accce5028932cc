//! Backend transport trait definition

use async_trait::async_trait;

use crate::events::{EntityType, Record};
use crate::presence::PresenceRecord;

use super::types::{SignalStream, TransportError};

/// Backend collaborator that carries the change feed, presence and lookups
#[async_trait]
pub trait Transport: Send + Sync {
    /// Short name for logs
    fn name(&self) -> &'static str;

    /// Open one multiplexed feed for a tenant.
    ///
    /// Only `entities` are requested; change events for any other entity type
    /// are never attached to the stream.
    async fn open_stream(
        &self,
        tenant_id: &str,
        entities: &[EntityType],
    ) -> Result<SignalStream, TransportError>;

    /// Announce (or refresh) the local user's presence in a tenant workspace
    async fn track_presence(
        &self,
        tenant_id: &str,
        presence: &PresenceRecord,
    ) -> Result<(), TransportError>;

    /// Fetch a record by entity type and id, `None` when it no longer exists
    async fn lookup_parent(
        &self,
        entity: EntityType,
        id: &str,
    ) -> Result<Option<Record>, TransportError>;
}
