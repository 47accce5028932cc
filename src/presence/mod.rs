//! Presence tracking for tenant workspaces
//!
//! - `sync` replaces the roster wholesale
//! - `join`/`leave` add and remove entries incrementally
//! - entries expire when no heartbeat is seen within the staleness window

mod tracker;
mod types;

pub use tracker::{OwnPresence, PresenceTracker};
pub use types::{PresenceRecord, PresenceSignal, PresenceUpdate, Roster};
