use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One collaborator's live state in a tenant workspace
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceRecord {
    pub user_id: String,
    #[serde(default)]
    pub display_name: String,
    /// Last heartbeat or track signal seen for this user
    #[serde(default = "Utc::now")]
    pub last_seen: DateTime<Utc>,
    /// What the user is currently looking at (e.g. "job:123")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub view: Option<String>,
}

impl PresenceRecord {
    pub fn new(user_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            display_name: display_name.into(),
            last_seen: Utc::now(),
            view: None,
        }
    }

    pub fn with_view(mut self, view: impl Into<String>) -> Self {
        self.view = Some(view.into());
        self
    }
}

/// Roster of collaborators keyed by user id
pub type Roster = HashMap<String, PresenceRecord>;

/// Presence-protocol signal received on a tenant feed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PresenceSignal {
    /// Full roster snapshot; replaces everything known so far
    Sync { members: Vec<PresenceRecord> },
    Join { members: Vec<PresenceRecord> },
    Leave { user_ids: Vec<String> },
}

/// Partial update of the local user's presence
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct PresenceUpdate {
    pub display_name: Option<String>,
    /// `Some(None)` clears the current view
    pub view: Option<Option<String>>,
}

impl PresenceUpdate {
    pub fn view(view: impl Into<String>) -> Self {
        Self {
            display_name: None,
            view: Some(Some(view.into())),
        }
    }

    pub fn clear_view() -> Self {
        Self {
            display_name: None,
            view: Some(None),
        }
    }

    pub fn display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_presence_signals() {
        let sync = r#"{"type":"sync","members":[{"user_id":"u1","display_name":"Ana"}]}"#;
        match serde_json::from_str::<PresenceSignal>(sync).unwrap() {
            PresenceSignal::Sync { members } => {
                assert_eq!(members.len(), 1);
                assert_eq!(members[0].display_name, "Ana");
                assert!(members[0].view.is_none());
            }
            other => panic!("Expected sync, got {:?}", other),
        }

        let leave = r#"{"type":"leave","user_ids":["u1","u2"]}"#;
        assert_eq!(
            serde_json::from_str::<PresenceSignal>(leave).unwrap(),
            PresenceSignal::Leave {
                user_ids: vec!["u1".to_string(), "u2".to_string()]
            }
        );
    }
}
