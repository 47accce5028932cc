use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// A record snapshot as carried on the change feed
pub type Record = serde_json::Map<String, Value>;

/// Record types observed on the change feed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Job,
    Assignment,
    Opportunity,
    Bid,
    Contract,
    #[serde(alias = "compliance-item")]
    ComplianceItem,
    Rfp,
}

impl EntityType {
    pub const ALL: [EntityType; 7] = [
        EntityType::Job,
        EntityType::Assignment,
        EntityType::Opportunity,
        EntityType::Bid,
        EntityType::Contract,
        EntityType::ComplianceItem,
        EntityType::Rfp,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Job => "job",
            EntityType::Assignment => "assignment",
            EntityType::Opportunity => "opportunity",
            EntityType::Bid => "bid",
            EntityType::Contract => "contract",
            EntityType::ComplianceItem => "compliance_item",
            EntityType::Rfp => "rfp",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = EventDecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        EntityType::ALL
            .into_iter()
            .find(|entity| entity.as_str() == normalized)
            .ok_or_else(|| EventDecodeError::UnknownEntity(s.to_string()))
    }
}

/// Mutation kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Insert,
    Update,
    Delete,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Insert => "insert",
            Operation::Update => "update",
            Operation::Delete => "delete",
        }
    }
}

impl FromStr for Operation {
    type Err = EventDecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "insert" => Ok(Operation::Insert),
            "update" => Ok(Operation::Update),
            "delete" => Ok(Operation::Delete),
            _ => Err(EventDecodeError::UnknownOperation(s.to_string())),
        }
    }
}

/// Errors raised while validating a wire payload
#[derive(Debug, Error)]
pub enum EventDecodeError {
    #[error("unknown entity type: {0}")]
    UnknownEntity(String),
    #[error("unknown operation: {0}")]
    UnknownOperation(String),
    #[error("event carries neither a before nor an after snapshot")]
    MissingSnapshot,
    #[error("{0} snapshot is not a JSON object")]
    InvalidSnapshot(&'static str),
    #[error("malformed payload: {0}")]
    Json(#[from] serde_json::Error),
}

/// Change event exactly as it arrives from the backend
#[derive(Debug, Clone, Deserialize)]
pub struct RawChangeEvent {
    #[serde(alias = "table")]
    pub entity: String,
    #[serde(alias = "eventType", alias = "event_type")]
    pub op: String,
    #[serde(default, alias = "old")]
    pub before: Option<Value>,
    #[serde(default, alias = "new")]
    pub after: Option<Value>,
}

/// One observed mutation, validated once at the transport boundary
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    entity: EntityType,
    operation: Operation,
    before: Option<Record>,
    after: Option<Record>,
    received_at: DateTime<Utc>,
}

impl ChangeEvent {
    pub fn new(
        entity: EntityType,
        operation: Operation,
        before: Option<Record>,
        after: Option<Record>,
    ) -> Self {
        Self {
            entity,
            operation,
            before,
            after,
            received_at: Utc::now(),
        }
    }

    /// Parse and validate a JSON wire payload
    pub fn from_json(payload: &str) -> Result<Self, EventDecodeError> {
        let raw: RawChangeEvent = serde_json::from_str(payload)?;
        Self::try_from(raw)
    }

    pub fn entity(&self) -> EntityType {
        self.entity
    }

    pub fn operation(&self) -> Operation {
        self.operation
    }

    pub fn before(&self) -> Option<&Record> {
        self.before.as_ref()
    }

    pub fn after(&self) -> Option<&Record> {
        self.after.as_ref()
    }

    pub fn received_at(&self) -> DateTime<Utc> {
        self.received_at
    }

    /// The snapshot that describes the record: `after` when present, else `before`
    pub fn record(&self) -> Option<&Record> {
        self.after.as_ref().or(self.before.as_ref())
    }

    /// Read a scalar field from the current snapshot as a string key
    pub fn field(&self, name: &str) -> Option<String> {
        self.record().and_then(|record| record_field(record, name))
    }
}

impl TryFrom<RawChangeEvent> for ChangeEvent {
    type Error = EventDecodeError;

    fn try_from(raw: RawChangeEvent) -> Result<Self, Self::Error> {
        let entity = raw.entity.parse::<EntityType>()?;
        let operation = raw.op.parse::<Operation>()?;
        let before = into_record(raw.before, "before")?;
        let after = into_record(raw.after, "after")?;

        if before.is_none() && after.is_none() {
            return Err(EventDecodeError::MissingSnapshot);
        }

        Ok(Self::new(entity, operation, before, after))
    }
}

fn into_record(value: Option<Value>, which: &'static str) -> Result<Option<Record>, EventDecodeError> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Object(map)) if map.is_empty() => Ok(None),
        Some(Value::Object(map)) => Ok(Some(map)),
        Some(_) => Err(EventDecodeError::InvalidSnapshot(which)),
    }
}

/// Read a string or integer field as a lookup key
pub fn record_field(record: &Record, name: &str) -> Option<String> {
    match record.get(name)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_update_event() {
        let payload = r#"{
            "entity": "assignment",
            "op": "UPDATE",
            "before": {"id": "a-1", "job_id": "job-9", "status": "open"},
            "after": {"id": "a-1", "job_id": "job-9", "status": "filled"}
        }"#;

        let event = ChangeEvent::from_json(payload).unwrap();
        assert_eq!(event.entity(), EntityType::Assignment);
        assert_eq!(event.operation(), Operation::Update);
        assert_eq!(event.field("status"), Some("filled".to_string()));
        assert_eq!(event.field("job_id"), Some("job-9".to_string()));
    }

    #[test]
    fn test_delete_uses_before_snapshot() {
        let payload = r#"{"entity":"job","op":"delete","before":{"id":42,"tenant_id":"org-1"},"after":{}}"#;

        let event = ChangeEvent::from_json(payload).unwrap();
        assert!(event.after().is_none());
        assert_eq!(event.field("id"), Some("42".to_string()));
        assert_eq!(event.field("tenant_id"), Some("org-1".to_string()));
    }

    #[test]
    fn test_entity_aliases() {
        assert_eq!("compliance-item".parse::<EntityType>().unwrap(), EntityType::ComplianceItem);
        assert_eq!("compliance_item".parse::<EntityType>().unwrap(), EntityType::ComplianceItem);
        assert_eq!("RFP".parse::<EntityType>().unwrap(), EntityType::Rfp);
        assert!("invoice".parse::<EntityType>().is_err());
    }

    #[test]
    fn test_rejects_invalid_payloads() {
        let unknown_op = RawChangeEvent {
            entity: "job".to_string(),
            op: "truncate".to_string(),
            before: None,
            after: Some(json!({"id": "1"})),
        };
        assert!(matches!(
            ChangeEvent::try_from(unknown_op),
            Err(EventDecodeError::UnknownOperation(_))
        ));

        let no_snapshot = RawChangeEvent {
            entity: "job".to_string(),
            op: "insert".to_string(),
            before: None,
            after: None,
        };
        assert!(matches!(
            ChangeEvent::try_from(no_snapshot),
            Err(EventDecodeError::MissingSnapshot)
        ));

        let scalar_snapshot = RawChangeEvent {
            entity: "bid".to_string(),
            op: "insert".to_string(),
            before: None,
            after: Some(json!("oops")),
        };
        assert!(matches!(
            ChangeEvent::try_from(scalar_snapshot),
            Err(EventDecodeError::InvalidSnapshot("after"))
        ));

        assert!(matches!(
            ChangeEvent::from_json("not json"),
            Err(EventDecodeError::Json(_))
        ));
    }
}
