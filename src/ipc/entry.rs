//! IPC Entry - Port name to capability translation
//!
//! Each entry records one capability (port right) in a task's IPC space.
//! Entries are stored in a table indexed by the low bits of the port name;
//! the high 8 bits of a name carry the slot generation so a stale name
//! never resolves to a reused slot.

use alloc::vec::Vec;
use core::fmt;

use super::error::{IpcError, IpcResult};
use super::port::PortRef;
use super::pset::PsetRef;

/// Port name type - the user-visible handle to a port capability
pub type MachPortName = u32;

/// Port index - position in the entry table
pub type MachPortIndex = u32;

/// Index of a dead-name request inside a port's request table
pub type DnRequestIndex = usize;

/// Largest user reference count an entry can carry
pub const MACH_PORT_UREFS_MAX: u16 = 0xFFFF;

/// Mask for generation number (8 bits)
pub const IE_BITS_GEN_MASK: u32 = 0xFF00_0000;

/// One generation increment
pub const IE_BITS_GEN_ONE: u32 = 0x0100_0000;

/// Mask for the table index part of a name
pub const IE_INDEX_MASK: u32 = !IE_BITS_GEN_MASK;

// ============================================================================
// Port Type Bits (as reported by `info`)
// ============================================================================

pub const MACH_PORT_TYPE_NONE: u32 = 0;
pub const MACH_PORT_TYPE_SEND: u32 = 0x0001_0000;
pub const MACH_PORT_TYPE_RECEIVE: u32 = 0x0002_0000;
pub const MACH_PORT_TYPE_SEND_ONCE: u32 = 0x0004_0000;
pub const MACH_PORT_TYPE_PORT_SET: u32 = 0x0008_0000;
pub const MACH_PORT_TYPE_DEAD_NAME: u32 = 0x0010_0000;
pub const MACH_PORT_TYPE_SEND_RECEIVE: u32 = MACH_PORT_TYPE_SEND | MACH_PORT_TYPE_RECEIVE;

/// Dead-name request bit in `info` type bits
pub const MACH_PORT_TYPE_DNREQUEST: u32 = 0x8000_0000;

// ============================================================================
// Entry Right - kind and user references
// ============================================================================

/// The right an entry holds
///
/// Only the kinds that are multiply held carry a user reference count.
/// A send-once right always counts as exactly one reference and a
/// receive right (or the receive half of `SendReceive`) as none.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EntryRight {
    /// Reserved slot without a right
    #[default]
    None,
    /// Send right with `urefs` user references
    Send { urefs: u16 },
    /// Receive right
    Receive,
    /// Receive right plus a send right with `urefs` user references
    SendReceive { urefs: u16 },
    /// Send-once right
    SendOnce,
    /// Tombstone for a dead port, `urefs` > 0
    DeadName { urefs: u16 },
    /// Port set
    PortSet,
}

impl EntryRight {
    /// User references carried by this right
    pub fn urefs(&self) -> u16 {
        match *self {
            EntryRight::Send { urefs }
            | EntryRight::SendReceive { urefs }
            | EntryRight::DeadName { urefs } => urefs,
            EntryRight::SendOnce => 1,
            EntryRight::None | EntryRight::Receive | EntryRight::PortSet => 0,
        }
    }

    /// Check if the right includes a send right
    #[inline]
    pub fn has_send(&self) -> bool {
        matches!(self, EntryRight::Send { .. } | EntryRight::SendReceive { .. })
    }

    /// Check if the right includes the receive right
    #[inline]
    pub fn has_receive(&self) -> bool {
        matches!(self, EntryRight::Receive | EntryRight::SendReceive { .. })
    }

    /// Check if the right is a send-once right
    #[inline]
    pub fn is_send_once(&self) -> bool {
        matches!(self, EntryRight::SendOnce)
    }

    /// Check if the right is a dead name
    #[inline]
    pub fn is_dead_name(&self) -> bool {
        matches!(self, EntryRight::DeadName { .. })
    }

    /// Check if the right denotes a port (live or not yet checked)
    #[inline]
    pub fn is_port_right(&self) -> bool {
        self.has_send() || self.has_receive() || self.is_send_once()
    }

    /// Type bits for this right
    pub fn type_bits(&self) -> u32 {
        match self {
            EntryRight::None => MACH_PORT_TYPE_NONE,
            EntryRight::Send { .. } => MACH_PORT_TYPE_SEND,
            EntryRight::Receive => MACH_PORT_TYPE_RECEIVE,
            EntryRight::SendReceive { .. } => MACH_PORT_TYPE_SEND_RECEIVE,
            EntryRight::SendOnce => MACH_PORT_TYPE_SEND_ONCE,
            EntryRight::DeadName { .. } => MACH_PORT_TYPE_DEAD_NAME,
            EntryRight::PortSet => MACH_PORT_TYPE_PORT_SET,
        }
    }

    /// Get type name for debugging
    pub fn name(&self) -> &'static str {
        match self {
            EntryRight::None => "none",
            EntryRight::Send { .. } => "send",
            EntryRight::Receive => "receive",
            EntryRight::SendReceive { .. } => "send-receive",
            EntryRight::SendOnce => "send-once",
            EntryRight::DeadName { .. } => "dead-name",
            EntryRight::PortSet => "port-set",
        }
    }
}

// ============================================================================
// IPC Object - Generic reference to port or port set
// ============================================================================

/// Reference to an IPC object (port or port set)
///
/// Holding one is holding a reference; dropping it releases it.
#[derive(Clone)]
pub enum IpcObject {
    /// Port reference
    Port(PortRef),
    /// Port set reference
    PortSet(PsetRef),
}

impl IpcObject {
    /// Try to get as a port reference
    pub fn as_port(&self) -> Option<&PortRef> {
        match self {
            IpcObject::Port(p) => Some(p),
            IpcObject::PortSet(_) => None,
        }
    }

    /// Try to get as a port set reference
    pub fn as_pset(&self) -> Option<&PsetRef> {
        match self {
            IpcObject::PortSet(s) => Some(s),
            IpcObject::Port(_) => None,
        }
    }
}

impl fmt::Debug for IpcObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IpcObject::Port(p) => write!(f, "Port({:?})", p.id()),
            IpcObject::PortSet(s) => write!(f, "PortSet({:?})", s.id()),
        }
    }
}

// ============================================================================
// IPC Entry - A single capability record
// ============================================================================

/// IPC Entry - records a single capability in a task's IPC space
///
/// `right == None` iff no object, no request and no references;
/// `right == DeadName` iff no object, no request and references > 0.
#[derive(Debug, Clone, Default)]
pub struct IpcEntry {
    pub(crate) right: EntryRight,
    pub(crate) object: Option<IpcObject>,
    pub(crate) request: Option<DnRequestIndex>,
}

impl IpcEntry {
    /// Create a new empty entry
    pub const fn new() -> Self {
        Self {
            right: EntryRight::None,
            object: None,
            request: None,
        }
    }

    /// The right held
    #[inline]
    pub fn right(&self) -> EntryRight {
        self.right
    }

    /// User reference count
    #[inline]
    pub fn urefs(&self) -> u16 {
        self.right.urefs()
    }

    /// The object this entry denotes
    pub fn object(&self) -> Option<&IpcObject> {
        self.object.as_ref()
    }

    /// The port this entry denotes, if any
    pub fn port(&self) -> Option<&PortRef> {
        self.object.as_ref().and_then(IpcObject::as_port)
    }

    /// Registered dead-name request, if any
    #[inline]
    pub fn request(&self) -> Option<DnRequestIndex> {
        self.request
    }

    /// Check if this entry holds no right
    #[inline]
    pub fn is_none(&self) -> bool {
        self.right == EntryRight::None
    }

    /// Check the kind/object/request invariants
    pub fn is_consistent(&self) -> bool {
        match self.right {
            EntryRight::None => self.object.is_none() && self.request.is_none(),
            EntryRight::DeadName { urefs } => {
                self.object.is_none() && self.request.is_none() && urefs > 0
            }
            EntryRight::Send { urefs } | EntryRight::SendReceive { urefs } => {
                urefs > 0 && self.port().is_some()
            }
            EntryRight::Receive | EntryRight::SendOnce => self.port().is_some(),
            EntryRight::PortSet => {
                self.request.is_none() && self.object.as_ref().and_then(IpcObject::as_pset).is_some()
            }
        }
    }

    /// Set up a right on this entry
    pub(crate) fn set(&mut self, right: EntryRight, object: IpcObject) {
        self.right = right;
        self.object = Some(object);
    }

    /// Turn this entry into a dead name with `urefs` references
    pub(crate) fn make_dead_name(&mut self, urefs: u16) -> Option<IpcObject> {
        debug_assert!(urefs > 0);
        self.right = EntryRight::DeadName { urefs };
        self.request = None;
        self.object.take()
    }

    /// Clear the entry back to `None`, handing back the object reference
    pub(crate) fn clear(&mut self) -> Option<IpcObject> {
        self.right = EntryRight::None;
        self.request = None;
        self.object.take()
    }
}

// ============================================================================
// Entry Table - Dynamic array of entries
// ============================================================================

/// Initial table size (number of entries)
pub const IPC_ENTRY_TABLE_MIN: usize = 16;

/// Maximum table size
pub const IPC_ENTRY_TABLE_MAX: usize = 65536;

#[derive(Debug)]
struct TableSlot {
    /// Generation bits of the name currently (or next) using this slot
    generation: u32,
    /// Next free index while the slot is free
    next_free: u32,
    /// The entry while the name is allocated
    entry: Option<IpcEntry>,
}

impl TableSlot {
    fn free(next_free: u32, generation: u32) -> Self {
        Self {
            generation,
            next_free,
            entry: None,
        }
    }
}

/// Entry table with free list management
///
/// Index 0 is never handed out, so `MACH_PORT_NULL` never resolves.
#[derive(Debug)]
pub struct IpcEntryTable {
    slots: Vec<TableSlot>,
    /// Index of first free entry (0 = list empty)
    free_head: u32,
    /// Number of allocated names
    active_count: u32,
}

impl IpcEntryTable {
    /// Create a new entry table
    pub fn new(initial_size: usize) -> Self {
        let size = initial_size.clamp(IPC_ENTRY_TABLE_MIN, IPC_ENTRY_TABLE_MAX);
        let mut slots = Vec::with_capacity(size);
        for i in 0..size {
            let next = if i + 1 < size { (i + 1) as u32 } else { 0 };
            slots.push(TableSlot::free(next, 0));
        }

        Self {
            slots,
            free_head: 1,
            active_count: 0,
        }
    }

    /// Get table size
    #[inline]
    pub fn size(&self) -> usize {
        self.slots.len()
    }

    /// Get number of allocated names
    #[inline]
    pub fn active_count(&self) -> u32 {
        self.active_count
    }

    fn index_of(&self, name: MachPortName) -> Option<usize> {
        let index = (name & IE_INDEX_MASK) as usize;
        if index == 0 || index >= self.slots.len() {
            return None;
        }
        let slot = &self.slots[index];
        if slot.entry.is_none() || slot.generation != (name & IE_BITS_GEN_MASK) {
            return None;
        }
        Some(index)
    }

    /// Look up an entry by name (index + generation check)
    pub fn lookup(&self, name: MachPortName) -> Option<&IpcEntry> {
        let index = self.index_of(name)?;
        self.slots[index].entry.as_ref()
    }

    /// Look up an entry mutably
    pub fn lookup_mut(&mut self, name: MachPortName) -> Option<&mut IpcEntry> {
        let index = self.index_of(name)?;
        self.slots[index].entry.as_mut()
    }

    /// Allocate a new empty entry, returns its name
    pub fn alloc(&mut self) -> IpcResult<MachPortName> {
        if self.free_head == 0 {
            self.grow()?;
        }

        let index = self.free_head as usize;
        let slot = &mut self.slots[index];
        self.free_head = slot.next_free;
        slot.next_free = 0;
        slot.entry = Some(IpcEntry::new());
        self.active_count += 1;

        Ok(index as u32 | slot.generation)
    }

    /// Allocate an empty entry under a caller-chosen name
    pub fn alloc_with_name(&mut self, name: MachPortName) -> IpcResult<()> {
        let index = (name & IE_INDEX_MASK) as usize;
        if index == 0 || index >= IPC_ENTRY_TABLE_MAX {
            return Err(IpcError::InvalidName);
        }

        while index >= self.slots.len() {
            self.grow()?;
        }

        if self.slots[index].entry.is_some() {
            return Err(IpcError::NoSpace);
        }

        // Unlink from the free list
        if self.free_head as usize == index {
            self.free_head = self.slots[index].next_free;
        } else {
            let mut prev = self.free_head as usize;
            while prev != 0 {
                let next = self.slots[prev].next_free as usize;
                if next == index {
                    self.slots[prev].next_free = self.slots[index].next_free;
                    break;
                }
                prev = next;
            }
        }

        let slot = &mut self.slots[index];
        slot.generation = name & IE_BITS_GEN_MASK;
        slot.next_free = 0;
        slot.entry = Some(IpcEntry::new());
        self.active_count += 1;
        Ok(())
    }

    /// Free a name, returning whatever the entry still held
    pub fn free(&mut self, name: MachPortName) -> Option<IpcEntry> {
        let index = self.index_of(name)?;
        let slot = &mut self.slots[index];
        let entry = slot.entry.take();
        slot.generation = slot.generation.wrapping_add(IE_BITS_GEN_ONE) & IE_BITS_GEN_MASK;
        slot.next_free = self.free_head;
        self.free_head = index as u32;
        self.active_count -= 1;
        entry
    }

    /// Grow the table to accommodate more entries
    pub fn grow(&mut self) -> IpcResult<()> {
        let old_size = self.slots.len();
        let new_size = (old_size * 2).min(IPC_ENTRY_TABLE_MAX);
        if new_size == old_size {
            return Err(IpcError::NoSpace);
        }

        self.slots.reserve(new_size - old_size);
        for i in old_size..new_size {
            let next = if i + 1 < new_size {
                (i + 1) as u32
            } else {
                self.free_head
            };
            self.slots.push(TableSlot::free(next, 0));
        }
        self.free_head = old_size as u32;
        Ok(())
    }

    /// Iterate over all allocated entries
    pub fn iter(&self) -> impl Iterator<Item = (MachPortName, &IpcEntry)> {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.entry
                .as_ref()
                .map(|entry| (index as u32 | slot.generation, entry))
        })
    }

    /// Names of all allocated entries
    pub fn names(&self) -> Vec<MachPortName> {
        self.iter().map(|(name, _)| name).collect()
    }

    /// Consume the table, yielding every allocated entry
    pub fn into_entries(self) -> impl Iterator<Item = (MachPortName, IpcEntry)> {
        self.slots
            .into_iter()
            .enumerate()
            .filter_map(|(index, slot)| {
                let name = index as u32 | slot.generation;
                slot.entry.map(|entry| (name, entry))
            })
    }
}

impl Default for IpcEntryTable {
    fn default() -> Self {
        Self::new(IPC_ENTRY_TABLE_MIN)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_right_urefs() {
        assert_eq!(EntryRight::Send { urefs: 3 }.urefs(), 3);
        assert_eq!(EntryRight::SendOnce.urefs(), 1);
        assert_eq!(EntryRight::Receive.urefs(), 0);
        assert!(EntryRight::SendReceive { urefs: 1 }.has_send());
        assert!(EntryRight::SendReceive { urefs: 1 }.has_receive());
        assert!(!EntryRight::DeadName { urefs: 1 }.is_port_right());
    }

    #[test]
    fn test_empty_entry_consistent() {
        let entry = IpcEntry::new();
        assert!(entry.is_none());
        assert!(entry.is_consistent());

        let mut bad = IpcEntry::new();
        bad.right = EntryRight::DeadName { urefs: 0 };
        assert!(!bad.is_consistent());
    }

    #[test]
    fn test_entry_table_alloc() {
        let mut table = IpcEntryTable::new(4);
        assert_eq!(table.size(), IPC_ENTRY_TABLE_MIN);

        let name = table.alloc().unwrap();
        assert!(table.lookup(name).unwrap().is_none());
        assert_eq!(table.active_count(), 1);

        assert!(table.free(name).is_some());
        assert_eq!(table.active_count(), 0);
        assert!(table.lookup(name).is_none());
    }

    #[test]
    fn test_stale_name_rejected() {
        let mut table = IpcEntryTable::default();
        table.alloc_with_name(5).unwrap();
        table.free(5);

        // Same index comes back with a new generation
        let mut reused = None;
        for _ in 0..IPC_ENTRY_TABLE_MIN {
            let name = table.alloc().unwrap();
            if name & IE_INDEX_MASK == 5 {
                reused = Some(name);
                break;
            }
        }
        let reused = reused.unwrap();
        assert_ne!(reused, 5);
        assert!(table.lookup(5).is_none());
        assert!(table.lookup(reused).is_some());
    }

    #[test]
    fn test_alloc_with_name_grows_and_rejects_duplicates() {
        let mut table = IpcEntryTable::default();
        table.alloc_with_name(100).unwrap();
        assert!(table.size() > 100);
        assert_eq!(table.alloc_with_name(100), Err(IpcError::NoSpace));
        assert_eq!(table.alloc_with_name(0), Err(IpcError::InvalidName));

        // The free list stays intact around the claimed name
        for _ in 0..(table.size() - 2) {
            let name = table.alloc().unwrap();
            assert_ne!(name, 100);
        }
    }
}
