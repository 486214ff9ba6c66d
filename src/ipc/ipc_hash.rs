//! IPC Hash - (object) -> name reverse lookup within a space
//!
//! Entries holding a send right (without the receive right) are indexed
//! here so a send right arriving in a message combines with the one the
//! space already holds. Receive rights are found through the port's
//! receiver identity instead.

use alloc::collections::BTreeMap;

use super::entry::MachPortName;
use super::port::PortRef;

/// Hash table statistics
#[derive(Debug, Default, Clone)]
pub struct IpcHashStats {
    pub inserts: u64,
    pub deletes: u64,
    pub lookups: u64,
}

/// Per-space reverse index
#[derive(Debug, Default)]
pub struct IpcHash {
    map: BTreeMap<usize, MachPortName>,
    pub stats: IpcHashStats,
}

impl IpcHash {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up the name indexed for `port`
    pub fn lookup(&mut self, port: &PortRef) -> Option<MachPortName> {
        self.stats.lookups += 1;
        self.map.get(&port.key()).copied()
    }

    /// Index `port` under `name`
    pub fn insert(&mut self, port: &PortRef, name: MachPortName) {
        let previous = self.map.insert(port.key(), name);
        assert!(previous.is_none(), "port indexed twice in one space");
        self.stats.inserts += 1;
    }

    /// Drop the index for `port`, which must be under `name`
    pub fn delete(&mut self, port: &PortRef, name: MachPortName) {
        let removed = self.map.remove(&port.key());
        assert_eq!(removed, Some(name), "reverse index out of sync");
        self.stats.deletes += 1;
    }

    /// Check whether `port` is indexed
    pub fn contains(&self, port: &PortRef) -> bool {
        self.map.contains_key(&port.key())
    }

    /// Get entry count
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Remove all entries
    pub fn clear(&mut self) {
        self.map.clear();
    }
}
