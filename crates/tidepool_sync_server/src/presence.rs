//! In-memory presence table of a library.

use std::collections::BTreeMap;
use tidepool_sync_protocol::UserInfo;

/// Presence of connected replicas, keyed by replica id.
#[derive(Debug, Default)]
pub struct PresenceTable {
    entries: BTreeMap<String, UserInfo>,
}

impl PresenceTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records presence for a replica.
    pub fn set(&mut self, info: UserInfo) {
        self.entries.insert(info.replica_id.clone(), info);
    }

    /// Removes a replica. Returns its last presence.
    pub fn remove(&mut self, replica_id: &str) -> Option<UserInfo> {
        self.entries.remove(replica_id)
    }

    /// Returns every entry except `replica_id`'s.
    pub fn peers_of(&self, replica_id: &str) -> BTreeMap<String, UserInfo> {
        self.entries
            .iter()
            .filter(|(id, _)| id.as_str() != replica_id)
            .map(|(id, info)| (id.clone(), info.clone()))
            .collect()
    }

    /// Returns true if nobody is present.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of present replicas.
    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peers_exclude_self() {
        let mut table = PresenceTable::new();
        table.set(UserInfo::new("u1", "r1"));
        table.set(UserInfo::new("u2", "r2"));
        let peers = table.peers_of("r1");
        assert_eq!(peers.len(), 1);
        assert!(peers.contains_key("r2"));

        assert!(table.remove("r1").is_some());
        assert!(table.remove("r1").is_none());
        assert_eq!(table.len(), 1);
        table.remove("r2");
        assert!(table.is_empty());
    }
}
