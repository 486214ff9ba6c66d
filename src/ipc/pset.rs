//! IPC Port Sets
//!
//! A port set groups receive rights for multiplexed receive. The right
//! layer only needs its identity, the name it lives under, and a way to
//! close it; members are tracked so closing can detach them.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};
use spin::Mutex;

use super::entry::MachPortName;
use super::port::PortRef;

/// Port set identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PortSetId(u64);

impl PortSetId {
    fn generate() -> Self {
        static NEXT_PSET_ID: AtomicU64 = AtomicU64::new(1);
        Self(NEXT_PSET_ID.fetch_add(1, Ordering::SeqCst))
    }
}

/// Port set state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortSetState {
    /// Port set is active
    Active,
    /// Port set has been closed
    Dead,
}

/// A port set
#[derive(Debug)]
pub struct IpcPortSet {
    state: PortSetState,
    /// Name of the entry holding this set
    name: MachPortName,
    /// Member ports
    members: Vec<PortRef>,
    /// Closing events delivered to waiters
    closed_events: u32,
}

impl IpcPortSet {
    fn new(name: MachPortName) -> Self {
        Self {
            state: PortSetState::Active,
            name,
            members: Vec::new(),
            closed_events: 0,
        }
    }
}

/// Counted reference to a port set
#[derive(Debug, Clone)]
pub struct PsetRef {
    id: PortSetId,
    inner: Arc<Mutex<IpcPortSet>>,
}

impl PsetRef {
    /// Create an active, empty port set living under `name`
    pub fn new(name: MachPortName) -> Self {
        Self {
            id: PortSetId::generate(),
            inner: Arc::new(Mutex::new(IpcPortSet::new(name))),
        }
    }

    /// Port set identifier
    pub fn id(&self) -> PortSetId {
        self.id
    }

    /// Check if the set is still open
    pub fn is_active(&self) -> bool {
        self.inner.lock().state == PortSetState::Active
    }

    /// Name of the entry holding this set
    pub fn name(&self) -> MachPortName {
        self.inner.lock().name
    }

    pub(crate) fn set_name(&self, name: MachPortName) {
        self.inner.lock().name = name;
    }

    /// Number of member ports
    pub fn member_count(&self) -> usize {
        self.inner.lock().members.len()
    }

    /// Number of end-of-stream events delivered
    pub fn closed_events(&self) -> u32 {
        self.inner.lock().closed_events
    }

    /// Add a member port; false if already a member or the set is closed
    pub fn add_member(&self, port: PortRef) -> bool {
        let mut pset = self.inner.lock();
        if pset.state != PortSetState::Active || pset.members.iter().any(|p| p.ptr_eq(&port)) {
            return false;
        }
        pset.members.push(port);
        true
    }

    /// Remove a member port
    pub fn remove_member(&self, port: &PortRef) -> bool {
        let mut pset = self.inner.lock();
        let before = pset.members.len();
        pset.members.retain(|p| !p.ptr_eq(port));
        pset.members.len() != before
    }

    /// Wake subscribers with an end-of-stream event, then close the set
    pub fn close(&self) {
        let mut pset = self.inner.lock();
        if pset.state == PortSetState::Dead {
            return;
        }
        pset.closed_events += 1;
        pset.state = PortSetState::Dead;
        pset.members.clear();
        log::debug!("port set {:?}: closed", self.id);
    }
}
