//! Per-room presence tracking with TTL-based eviction.
//!
//! Each room owns one [`PresenceStore`]: a map from client id to the
//! latest presence record, stamped with the server wall clock. The
//! heartbeat tick prunes records whose timestamp has gone stale and
//! broadcasts a `leave` for each evicted client; socket liveness is
//! tracked separately by the connection layer.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::protocol::{ClientId, UserPresence};

/// Current server wall clock in integer milliseconds.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// In-memory presence table for one room.
///
/// Timestamps are monotonically non-decreasing per client because every
/// write path stamps with the room's current clock.
#[derive(Debug, Default)]
pub struct PresenceStore {
    records: HashMap<ClientId, UserPresence>,
}

impl PresenceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the record for `client_id`. A record arriving without a
    /// timestamp is stamped with `now_ms`.
    pub fn upsert(&mut self, client_id: &str, mut presence: UserPresence, now_ms: u64) {
        if presence.timestamp.is_none() {
            presence.timestamp = Some(now_ms);
        }
        self.records.insert(client_id.to_string(), presence);
    }

    /// Idempotent delete.
    pub fn remove(&mut self, client_id: &str) -> Option<UserPresence> {
        self.records.remove(client_id)
    }

    pub fn get(&self, client_id: &str) -> Option<&UserPresence> {
        self.records.get(client_id)
    }

    pub fn contains(&self, client_id: &str) -> bool {
        self.records.contains_key(client_id)
    }

    /// All records; enumeration order is unobservable to clients.
    pub fn entries(&self) -> Vec<(ClientId, UserPresence)> {
        self.records
            .iter()
            .map(|(id, presence)| (id.clone(), presence.clone()))
            .collect()
    }

    /// Refresh only the timestamp of an existing record (the heartbeat
    /// `pong` path — cursor and metadata stay untouched). Returns whether
    /// a record was refreshed.
    pub fn touch(&mut self, client_id: &str, now_ms: u64) -> bool {
        match self.records.get_mut(client_id) {
            Some(record) => {
                record.timestamp = Some(now_ms);
                true
            }
            None => false,
        }
    }

    /// Remove and return every client whose record is older than
    /// `ttl_ms` at `now_ms`.
    pub fn prune_older_than(&mut self, ttl_ms: u64, now_ms: u64) -> Vec<ClientId> {
        let stale: Vec<ClientId> = self
            .records
            .iter()
            .filter(|(_, p)| now_ms.saturating_sub(p.timestamp.unwrap_or(0)) > ttl_ms)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &stale {
            self.records.remove(id);
        }
        stale
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
