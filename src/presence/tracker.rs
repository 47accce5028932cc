use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use super::types::{PresenceRecord, PresenceSignal, PresenceUpdate, Roster};

/// Roster of collaborators for one tenant workspace.
///
/// Owned by a single subscription worker; callers only ever see clones of the
/// roster.
pub struct PresenceTracker {
    roster: Roster,
    stale_after: chrono::Duration,
}

impl PresenceTracker {
    pub fn new(stale_after: Duration) -> Self {
        Self {
            roster: Roster::new(),
            stale_after: chrono::Duration::from_std(stale_after)
                .unwrap_or_else(|_| chrono::Duration::seconds(90)),
        }
    }

    /// Apply one presence signal, returning whether the roster changed
    pub fn apply(&mut self, signal: PresenceSignal) -> bool {
        self.apply_at(signal, Utc::now())
    }

    pub(crate) fn apply_at(&mut self, signal: PresenceSignal, now: DateTime<Utc>) -> bool {
        match signal {
            PresenceSignal::Sync { members } => {
                let next: Roster = members
                    .into_iter()
                    .map(|mut member| {
                        member.last_seen = now;
                        (member.user_id.clone(), member)
                    })
                    .collect();
                let changed = !same_members(&self.roster, &next);
                self.roster = next;
                tracing::debug!(members = self.roster.len(), "Presence roster synced");
                changed
            }
            PresenceSignal::Join { members } => {
                let mut changed = false;
                for mut member in members {
                    member.last_seen = now;
                    let previous = self.roster.insert(member.user_id.clone(), member.clone());
                    changed |= previous.map_or(true, |p| !same_member(&p, &member));
                }
                changed
            }
            PresenceSignal::Leave { user_ids } => {
                let mut changed = false;
                for user_id in user_ids {
                    changed |= self.roster.remove(&user_id).is_some();
                }
                changed
            }
        }
    }

    /// Current roster, excluding entries past the staleness window
    pub fn current_roster(&self) -> Roster {
        let cutoff = Utc::now() - self.stale_after;
        self.roster
            .iter()
            .filter(|(_, record)| record.last_seen >= cutoff)
            .map(|(id, record)| (id.clone(), record.clone()))
            .collect()
    }

    /// Drop entries whose last heartbeat is older than the staleness window
    pub fn prune_stale(&mut self, now: DateTime<Utc>) -> usize {
        let cutoff = now - self.stale_after;
        let before = self.roster.len();
        self.roster.retain(|user_id, record| {
            let keep = record.last_seen >= cutoff;
            if !keep {
                tracing::debug!(user_id = %user_id, "Expiring stale presence entry");
            }
            keep
        });
        before - self.roster.len()
    }

    pub fn len(&self) -> usize {
        self.roster.len()
    }

    pub fn is_empty(&self) -> bool {
        self.roster.is_empty()
    }
}

fn same_member(a: &PresenceRecord, b: &PresenceRecord) -> bool {
    a.display_name == b.display_name && a.view == b.view
}

fn same_members(a: &Roster, b: &Roster) -> bool {
    a.len() == b.len()
        && a.iter()
            .all(|(id, record)| b.get(id).is_some_and(|other| same_member(record, other)))
}

/// The local user's own presence, shared by every subscription of a manager
pub struct OwnPresence {
    record: RwLock<PresenceRecord>,
}

impl OwnPresence {
    pub fn new(record: PresenceRecord) -> Self {
        Self {
            record: RwLock::new(record),
        }
    }

    /// Snapshot with a fresh heartbeat timestamp, ready to be tracked
    pub fn current(&self) -> PresenceRecord {
        let mut record = self.record.write();
        record.last_seen = Utc::now();
        record.clone()
    }

    /// Merge a partial update into the previous fields
    pub fn merge(&self, update: PresenceUpdate) -> PresenceRecord {
        let mut record = self.record.write();
        if let Some(name) = update.display_name {
            record.display_name = name;
        }
        if let Some(view) = update.view {
            record.view = view;
        }
        record.last_seen = Utc::now();
        record.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(id: &str) -> PresenceRecord {
        PresenceRecord::new(id, id.to_uppercase())
    }

    fn tracker() -> PresenceTracker {
        PresenceTracker::new(Duration::from_secs(90))
    }

    #[test]
    fn test_sync_wins_over_incremental_state() {
        let mut tracker = tracker();
        tracker.apply(PresenceSignal::Join { members: vec![member("a")] });
        tracker.apply(PresenceSignal::Join { members: vec![member("b")] });
        tracker.apply(PresenceSignal::Leave { user_ids: vec!["a".to_string()] });
        tracker.apply(PresenceSignal::Sync {
            members: vec![member("b"), member("c")],
        });

        let roster = tracker.current_roster();
        let mut ids: Vec<_> = roster.keys().cloned().collect();
        ids.sort();
        assert_eq!(ids, vec!["b".to_string(), "c".to_string()]);
    }

    #[test]
    fn test_sync_converges_from_any_prior_state() {
        let snapshot = vec![member("x"), member("y")];

        let mut fresh = tracker();
        fresh.apply(PresenceSignal::Sync { members: snapshot.clone() });

        let mut noisy = tracker();
        noisy.apply(PresenceSignal::Join { members: vec![member("z"), member("x")] });
        noisy.apply(PresenceSignal::Leave { user_ids: vec!["y".to_string()] });
        noisy.apply(PresenceSignal::Sync { members: snapshot });

        let mut a: Vec<_> = fresh.current_roster().into_keys().collect();
        let mut b: Vec<_> = noisy.current_roster().into_keys().collect();
        a.sort();
        b.sort();
        assert_eq!(a, b);
    }

    #[test]
    fn test_change_detection() {
        let mut tracker = tracker();
        assert!(tracker.apply(PresenceSignal::Join { members: vec![member("a")] }));
        // Same member again is only a heartbeat
        assert!(!tracker.apply(PresenceSignal::Join { members: vec![member("a")] }));
        assert!(tracker.apply(PresenceSignal::Join {
            members: vec![member("a").with_view("job:1")]
        }));
        assert!(!tracker.apply(PresenceSignal::Leave { user_ids: vec!["ghost".to_string()] }));
        assert!(tracker.apply(PresenceSignal::Leave { user_ids: vec!["a".to_string()] }));
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_prune_stale_entries() {
        let mut tracker = tracker();
        let start = Utc::now();
        tracker.apply_at(PresenceSignal::Join { members: vec![member("old")] }, start);
        tracker.apply_at(
            PresenceSignal::Join { members: vec![member("new")] },
            start + chrono::Duration::seconds(60),
        );

        let removed = tracker.prune_stale(start + chrono::Duration::seconds(120));
        assert_eq!(removed, 1);
        assert_eq!(tracker.len(), 1);
        assert!(tracker.current_roster().contains_key("new"));
    }

    #[test]
    fn test_own_presence_merge_keeps_previous_fields() {
        let own = OwnPresence::new(PresenceRecord::new("u1", "Ana").with_view("job:1"));

        let merged = own.merge(PresenceUpdate::default().display_name("Ana M."));
        assert_eq!(merged.display_name, "Ana M.");
        assert_eq!(merged.view.as_deref(), Some("job:1"));

        let merged = own.merge(PresenceUpdate::view("bid:7"));
        assert_eq!(merged.display_name, "Ana M.");
        assert_eq!(merged.view.as_deref(), Some("bid:7"));

        let merged = own.merge(PresenceUpdate::clear_view());
        assert!(merged.view.is_none());
        assert_eq!(own.current().user_id, "u1");
    }
}
