//! Presence store: last-seen time per remote peer, swept on a fixed cadence.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::identity::PeerId;

/// Default staleness window for presence records.
pub const DEFAULT_PRESENCE_TTL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceRecord {
    pub peer_id: PeerId,
    pub last_seen_at: Instant,
}

/// Locally known live peers. The host supplies `now`; the store never reads the clock.
#[derive(Debug, Default)]
pub struct PresenceStore {
    records: HashMap<PeerId, PresenceRecord>,
}

impl PresenceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create or refresh a record. Returns true on first sighting.
    pub fn upsert(&mut self, peer_id: &PeerId, now: Instant) -> bool {
        match self.records.get_mut(peer_id) {
            Some(record) => {
                if now > record.last_seen_at {
                    record.last_seen_at = now;
                }
                false
            }
            None => {
                self.records.insert(
                    peer_id.clone(),
                    PresenceRecord {
                        peer_id: peer_id.clone(),
                        last_seen_at: now,
                    },
                );
                true
            }
        }
    }

    /// Remove and return every record whose age exceeds `ttl`.
    pub fn sweep_expired(&mut self, now: Instant, ttl: Duration) -> Vec<PresenceRecord> {
        let stale: Vec<PeerId> = self
            .records
            .values()
            .filter(|r| now.saturating_duration_since(r.last_seen_at) > ttl)
            .map(|r| r.peer_id.clone())
            .collect();
        let mut out: Vec<PresenceRecord> = stale
            .iter()
            .filter_map(|id| self.records.remove(id))
            .collect();
        out.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
        out
    }

    /// Explicit departure. Returns the record if it was present.
    pub fn remove(&mut self, peer_id: &PeerId) -> Option<PresenceRecord> {
        self.records.remove(peer_id)
    }

    pub fn is_known(&self, peer_id: &PeerId) -> bool {
        self.records.contains_key(peer_id)
    }

    /// Known peers sorted by identity.
    pub fn peers(&self) -> Vec<PeerId> {
        let mut ids: Vec<PeerId> = self.records.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
