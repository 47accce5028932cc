//! Redis transport: Pub/Sub change feed plus key lookups.
//!
//! Key layout (with the configured prefix, default `ara`):
//! - `{prefix}:changes:{tenant}:{entity}` change feed channel, one per entity type
//! - `{prefix}:presence:{tenant}` presence channel
//! - `{prefix}:presence:{tenant}:members` hash of tracked members
//! - `{prefix}:record:{entity}:{id}` JSON record used for tenant lookups

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio::sync::OnceCell;

use crate::config::RedisConfig;
use crate::events::{ChangeEvent, EntityType, Record};
use crate::presence::{PresenceRecord, PresenceSignal};

use super::traits::Transport;
use super::types::{SignalStream, TransportError, TransportSignal};

/// Redis-backed transport
pub struct RedisTransport {
    config: RedisConfig,
    client: redis::Client,
    commands: OnceCell<ConnectionManager>,
}

impl RedisTransport {
    pub fn new(config: RedisConfig) -> Result<Self, TransportError> {
        let client = redis::Client::open(config.url.as_str())?;
        Ok(Self {
            config,
            client,
            commands: OnceCell::new(),
        })
    }

    fn change_channel(&self, tenant_id: &str, entity: EntityType) -> String {
        format!("{}:changes:{}:{}", self.config.key_prefix, tenant_id, entity)
    }

    fn presence_channel(&self, tenant_id: &str) -> String {
        format!("{}:presence:{}", self.config.key_prefix, tenant_id)
    }

    fn members_key(&self, tenant_id: &str) -> String {
        format!("{}:presence:{}:members", self.config.key_prefix, tenant_id)
    }

    fn record_key(&self, entity: EntityType, id: &str) -> String {
        format!("{}:record:{}:{}", self.config.key_prefix, entity, id)
    }

    /// Shared multiplexed connection for commands, created on first use
    async fn connection(&self) -> Result<ConnectionManager, TransportError> {
        let timeout_ms = self.config.connect_timeout_ms;
        let manager = self
            .commands
            .get_or_try_init(|| async {
                match tokio::time::timeout(
                    Duration::from_millis(timeout_ms),
                    self.client.get_connection_manager(),
                )
                .await
                {
                    Ok(result) => result.map_err(TransportError::from),
                    Err(_) => Err(TransportError::Timeout(timeout_ms)),
                }
            })
            .await?;
        Ok(manager.clone())
    }
}

/// Decode one Pub/Sub payload into a feed signal
fn decode_message(presence_channel: &str, channel: &str, payload: &str) -> Option<TransportSignal> {
    if channel == presence_channel {
        return match serde_json::from_str::<PresenceSignal>(payload) {
            Ok(signal) => Some(TransportSignal::Presence(signal)),
            Err(e) => {
                tracing::warn!(error = %e, channel = %channel, "Failed to parse presence message");
                None
            }
        };
    }

    match ChangeEvent::from_json(payload) {
        Ok(event) => Some(TransportSignal::Change(event)),
        Err(e) => {
            tracing::warn!(
                error = %e,
                channel = %channel,
                payload = %payload,
                "Failed to parse change event"
            );
            None
        }
    }
}

#[async_trait]
impl Transport for RedisTransport {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn open_stream(
        &self,
        tenant_id: &str,
        entities: &[EntityType],
    ) -> Result<SignalStream, TransportError> {
        let client = self.client.clone();
        let timeout_ms = self.config.connect_timeout_ms;
        let presence_channel = self.presence_channel(tenant_id);
        let change_channels: Vec<String> = entities
            .iter()
            .map(|entity| self.change_channel(tenant_id, *entity))
            .collect();
        let tenant_id = tenant_id.to_string();

        let stream = async_stream::stream! {
            yield TransportSignal::Connecting;

            let connect = async {
                let mut pubsub = client.get_async_pubsub().await?;
                for channel in &change_channels {
                    pubsub.subscribe(channel).await?;
                }
                pubsub.subscribe(&presence_channel).await?;
                Ok::<_, redis::RedisError>(pubsub)
            };

            let pubsub = match tokio::time::timeout(Duration::from_millis(timeout_ms), connect).await {
                Ok(Ok(pubsub)) => pubsub,
                Ok(Err(e)) => {
                    yield TransportSignal::Error(e.to_string());
                    return;
                }
                Err(_) => {
                    yield TransportSignal::TimedOut;
                    return;
                }
            };

            tracing::info!(
                tenant_id = %tenant_id,
                channels = change_channels.len() + 1,
                "Redis feed established"
            );
            yield TransportSignal::Connected;

            let mut messages = pubsub.into_on_message();
            while let Some(msg) = messages.next().await {
                let channel = msg.get_channel_name().to_string();
                let payload: String = match msg.get_payload() {
                    Ok(p) => p,
                    Err(e) => {
                        tracing::warn!(error = %e, "Failed to get message payload");
                        continue;
                    }
                };

                if let Some(signal) = decode_message(&presence_channel, &channel, &payload) {
                    yield signal;
                }
            }

            tracing::warn!(tenant_id = %tenant_id, "Redis message stream ended");
            yield TransportSignal::Closed;
        };

        Ok(Box::pin(stream))
    }

    async fn track_presence(
        &self,
        tenant_id: &str,
        presence: &PresenceRecord,
    ) -> Result<(), TransportError> {
        let mut conn = self.connection().await?;
        let member_json = serde_json::to_string(presence)?;
        let join_json = serde_json::to_string(&PresenceSignal::Join {
            members: vec![presence.clone()],
        })?;

        let _: () = redis::pipe()
            .cmd("HSET")
            .arg(self.members_key(tenant_id))
            .arg(&presence.user_id)
            .arg(&member_json)
            .ignore()
            .cmd("PUBLISH")
            .arg(self.presence_channel(tenant_id))
            .arg(&join_json)
            .ignore()
            .query_async(&mut conn)
            .await?;

        tracing::debug!(tenant_id = %tenant_id, user_id = %presence.user_id, "Presence tracked");
        Ok(())
    }

    async fn lookup_parent(
        &self,
        entity: EntityType,
        id: &str,
    ) -> Result<Option<Record>, TransportError> {
        let mut conn = self.connection().await?;
        let json: Option<String> = conn.get(self.record_key(entity, id)).await?;

        match json {
            Some(json) => Ok(Some(serde_json::from_str::<Record>(&json)?)),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::Operation;

    fn transport() -> RedisTransport {
        RedisTransport::new(RedisConfig::default()).unwrap()
    }

    #[test]
    fn test_key_layout() {
        let transport = transport();
        assert_eq!(
            transport.change_channel("org-1", EntityType::ComplianceItem),
            "ara:changes:org-1:compliance_item"
        );
        assert_eq!(transport.presence_channel("org-1"), "ara:presence:org-1");
        assert_eq!(transport.members_key("org-1"), "ara:presence:org-1:members");
        assert_eq!(transport.record_key(EntityType::Job, "42"), "ara:record:job:42");
    }

    #[test]
    fn test_decode_change_message() {
        let payload = r#"{"entity":"bid","op":"insert","after":{"id":"b1","opportunity_id":"o1"}}"#;
        match decode_message("ara:presence:org-1", "ara:changes:org-1:bid", payload) {
            Some(TransportSignal::Change(event)) => {
                assert_eq!(event.entity(), EntityType::Bid);
                assert_eq!(event.operation(), Operation::Insert);
            }
            other => panic!("Expected change signal, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_presence_message() {
        let payload = r#"{"type":"leave","user_ids":["u1"]}"#;
        assert!(matches!(
            decode_message("ara:presence:org-1", "ara:presence:org-1", payload),
            Some(TransportSignal::Presence(PresenceSignal::Leave { .. }))
        ));
    }

    #[test]
    fn test_decode_drops_malformed_messages() {
        assert!(decode_message("p", "ara:changes:org-1:job", "{not json").is_none());
        assert!(decode_message("p", "p", r#"{"type":"wave"}"#).is_none());
    }
}
