//! IPC Space - Per-task IPC capability namespace
//!
//! Every task has an IPC space containing its port capabilities. The
//! space owns the entry table and the reverse index behind one
//! reader/writer lock.
//!
//! Lock order is space, then port. The only way to lock a port while the
//! space is live is [`SpaceWrite::lock_port`], so a port lock can never be
//! held while a space lock is being acquired.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicU64, Ordering};
use spin::{MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::entry::{EntryRight, IpcEntry, IpcEntryTable, IpcObject, MachPortName};
use super::error::{IpcError, IpcResult};
use super::ipc_hash::IpcHash;
use super::notify::Notifier;
use super::port::{PortRef, PortState};
use super::pset::PsetRef;
use crate::config::IpcConfig;

/// Space ID type - newtype for type safety
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct SpaceId(pub u64);

/// Next space ID counter
static NEXT_SPACE_ID: AtomicU64 = AtomicU64::new(1);

/// Lock-protected space state
#[derive(Debug)]
pub struct SpaceInner {
    active: bool,
    table: IpcEntryTable,
    hash: IpcHash,
}

/// IPC Space - contains all port capabilities for a task
pub struct IpcSpace {
    id: SpaceId,
    dnrequest_slots: usize,
    notifier: Arc<dyn Notifier>,
    inner: RwLock<SpaceInner>,
}

impl IpcSpace {
    /// Create a new IPC space with the default configuration
    pub fn new() -> Arc<Self> {
        Self::with_config(&IpcConfig::default())
    }

    /// Create a new IPC space from `config`
    pub fn with_config(config: &IpcConfig) -> Arc<Self> {
        let id = SpaceId(NEXT_SPACE_ID.fetch_add(1, Ordering::SeqCst));
        Arc::new(Self {
            id,
            dnrequest_slots: config.dnrequest_slots,
            notifier: Arc::clone(&config.notifier),
            inner: RwLock::new(SpaceInner {
                active: true,
                table: IpcEntryTable::new(config.table_size),
                hash: IpcHash::new(),
            }),
        })
    }

    /// Get space ID
    #[inline]
    pub fn id(&self) -> SpaceId {
        self.id
    }

    /// Notification sink for this space
    pub fn notifier(&self) -> &dyn Notifier {
        &*self.notifier
    }

    /// Check if space is active
    pub fn is_active(&self) -> bool {
        self.inner.read().active
    }

    /// Get number of allocated names
    pub fn entry_count(&self) -> u32 {
        self.inner.read().table.active_count()
    }

    // ========================================================================
    // Locking and lookup
    // ========================================================================

    /// Write-lock an active space
    pub fn write_lock(&self) -> IpcResult<SpaceWrite<'_>> {
        let inner = self.inner.write();
        if !inner.active {
            return Err(IpcError::InvalidTask);
        }
        Ok(SpaceWrite { space: self, inner })
    }

    /// Read-lock an active space
    pub fn read_lock(&self) -> IpcResult<SpaceRead<'_>> {
        let inner = self.inner.read();
        if !inner.active {
            return Err(IpcError::InvalidTask);
        }
        Ok(SpaceRead { space: self, inner })
    }

    /// Resolve `name`, returning the space write-locked
    pub fn lookup_write(&self, name: MachPortName) -> IpcResult<SpaceWrite<'_>> {
        let space = self.write_lock()?;
        space.entry(name)?;
        Ok(space)
    }

    /// Resolve `name`, returning the space read-locked
    pub fn lookup_read(&self, name: MachPortName) -> IpcResult<SpaceRead<'_>> {
        let space = self.read_lock()?;
        space.entry(name)?;
        Ok(space)
    }

    // ========================================================================
    // Allocation
    // ========================================================================

    /// Reserve an empty entry
    pub fn entry_alloc(&self) -> IpcResult<MachPortName> {
        self.write_lock()?.entry_alloc()
    }

    /// Reserve an empty entry under a chosen name
    pub fn entry_alloc_name(&self, name: MachPortName) -> IpcResult<()> {
        self.write_lock()?.entry_alloc_name(name)
    }

    /// Release an entry that never received a right
    pub fn entry_dealloc(&self, name: MachPortName) -> IpcResult<()> {
        let mut space = self.lookup_write(name)?;
        if !space.entry(name)?.is_none() {
            return Err(IpcError::InvalidRight);
        }
        space.entry_free(name);
        Ok(())
    }

    /// Create a port and install its receive right
    pub fn port_allocate(&self) -> IpcResult<(MachPortName, PortRef)> {
        let mut space = self.write_lock()?;
        let name = space.entry_alloc()?;
        let port = PortRef::new(self.dnrequest_slots);
        space.lock_port(&port).set_receiver(self.id, name);
        space
            .entry_mut(name)?
            .set(EntryRight::Receive, IpcObject::Port(port.clone()));
        log::trace!("space {:?}: port {:?} allocated as {:#x}", self.id, port.id(), name);
        Ok((name, port))
    }

    /// Create a port and install its receive right under a chosen name
    pub fn port_allocate_name(&self, name: MachPortName) -> IpcResult<PortRef> {
        let mut space = self.write_lock()?;
        space.entry_alloc_name(name)?;
        let port = PortRef::new(self.dnrequest_slots);
        space.lock_port(&port).set_receiver(self.id, name);
        space
            .entry_mut(name)?
            .set(EntryRight::Receive, IpcObject::Port(port.clone()));
        Ok(port)
    }

    /// Create a port set
    pub fn pset_allocate(&self) -> IpcResult<(MachPortName, PsetRef)> {
        let mut space = self.write_lock()?;
        let name = space.entry_alloc()?;
        let pset = PsetRef::new(name);
        space
            .entry_mut(name)?
            .set(EntryRight::PortSet, IpcObject::PortSet(pset.clone()));
        Ok((name, pset))
    }

    // ========================================================================
    // Space Lifecycle
    // ========================================================================

    /// Destroy the space, cleaning every entry
    ///
    /// The space is marked inactive under the write lock; the entries are
    /// then cleaned with no space lock held, since nothing else can reach
    /// them any more.
    pub fn destroy(&self) -> IpcResult<()> {
        let table = {
            let mut inner = self.inner.write();
            if !inner.active {
                return Err(IpcError::InvalidTask);
            }
            inner.active = false;
            inner.hash.clear();
            core::mem::take(&mut inner.table)
        };

        log::debug!("space {:?}: destroying {} entries", self.id, table.active_count());
        for (name, entry) in table.into_entries() {
            super::right::clean(self, name, entry);
        }
        Ok(())
    }
}

impl core::fmt::Debug for IpcSpace {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("IpcSpace").field("id", &self.id).finish_non_exhaustive()
    }
}

// ============================================================================
// Lock guards
// ============================================================================

/// A write-locked, active space
pub struct SpaceWrite<'a> {
    space: &'a IpcSpace,
    inner: RwLockWriteGuard<'a, SpaceInner>,
}

impl<'a> SpaceWrite<'a> {
    /// The locked space
    #[inline]
    pub fn space(&self) -> &'a IpcSpace {
        self.space
    }

    /// Space ID
    #[inline]
    pub fn id(&self) -> SpaceId {
        self.space.id
    }

    /// Release the lock
    pub fn unlock(self) -> &'a IpcSpace {
        self.space
    }

    /// Resolve a name
    pub fn entry(&self, name: MachPortName) -> IpcResult<&IpcEntry> {
        self.inner.table.lookup(name).ok_or(IpcError::InvalidName)
    }

    /// Resolve a name for mutation
    pub fn entry_mut(&mut self, name: MachPortName) -> IpcResult<&mut IpcEntry> {
        self.inner.table.lookup_mut(name).ok_or(IpcError::InvalidName)
    }

    /// The entry table
    pub fn table(&self) -> &IpcEntryTable {
        &self.inner.table
    }

    /// The reverse index
    pub(crate) fn hash(&mut self) -> &mut IpcHash {
        &mut self.inner.hash
    }

    /// Lock a port while holding this space
    ///
    /// The guard borrows only the port, so entries can still be updated
    /// while it is held.
    pub fn lock_port<'p>(&self, port: &'p PortRef) -> MutexGuard<'p, PortState> {
        port.lock()
    }

    /// Reserve an empty entry
    pub fn entry_alloc(&mut self) -> IpcResult<MachPortName> {
        self.inner.table.alloc()
    }

    /// Reserve an empty entry under a chosen name
    pub fn entry_alloc_name(&mut self, name: MachPortName) -> IpcResult<()> {
        self.inner.table.alloc_with_name(name)
    }

    /// Return an emptied entry's name to the allocator
    pub(crate) fn entry_free(&mut self, name: MachPortName) {
        let entry = self
            .inner
            .table
            .free(name)
            .expect("freeing a name that is not allocated");
        assert!(entry.is_none(), "freeing an entry that still holds a right");
    }
}

/// A read-locked, active space
pub struct SpaceRead<'a> {
    space: &'a IpcSpace,
    inner: RwLockReadGuard<'a, SpaceInner>,
}

impl<'a> SpaceRead<'a> {
    /// The locked space
    #[inline]
    pub fn space(&self) -> &'a IpcSpace {
        self.space
    }

    /// Resolve a name
    pub fn entry(&self, name: MachPortName) -> IpcResult<&IpcEntry> {
        self.inner.table.lookup(name).ok_or(IpcError::InvalidName)
    }

    /// The entry table
    pub fn table(&self) -> &IpcEntryTable {
        &self.inner.table
    }
}
