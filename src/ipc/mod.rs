//! Mach-style port rights
//!
//! Spaces map names to entries; entries hold rights to ports and port
//! sets. The right layer (`right`, `transfer`) is the only code that
//! mutates entries and the per-port right counters.

pub mod entry;
pub mod error;
pub mod ipc_hash;
pub mod notify;
pub mod port;
pub mod pset;
pub mod right;
pub mod space;
pub mod transfer;

pub use entry::{EntryRight, IpcEntry, IpcObject, MachPortName};
pub use error::{IpcError, IpcResult};
pub use notify::{Notification, Notifier, RecordingNotifier};
pub use port::{IpcPort, PortRef};
pub use pset::{IpcPortSet, PsetRef};
pub use space::{IpcSpace, SpaceId, SpaceRead, SpaceWrite};
pub use transfer::{CopiedObject, CopyinResult};

/// The null name; never names an entry
pub const MACH_PORT_NULL: MachPortName = 0;

/// Name standing for a dead port in a received message
pub const MACH_PORT_DEAD: MachPortName = !0;

/// Check that a name can denote an entry
#[inline]
pub const fn name_valid(name: MachPortName) -> bool {
    name != MACH_PORT_NULL && name != MACH_PORT_DEAD
}

// ============================================================================
// Right Types
// ============================================================================

/// Port right kinds as named by callers of `delta` and `info`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum PortRight {
    /// Send right
    Send = 0,
    /// Receive right (only one per port)
    Receive = 1,
    /// Send-once right (consumed on use)
    SendOnce = 2,
    /// Port set
    PortSet = 3,
    /// Dead name (port was destroyed)
    DeadName = 4,
}

impl PortRight {
    /// Convert from u32
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(PortRight::Send),
            1 => Some(PortRight::Receive),
            2 => Some(PortRight::SendOnce),
            3 => Some(PortRight::PortSet),
            4 => Some(PortRight::DeadName),
            _ => None,
        }
    }
}

/// Message type names - how a right is transferred in a message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum MsgTypeName {
    /// Move receive right
    MoveReceive = 16,
    /// Move send right
    MoveSend = 17,
    /// Move send-once right
    MoveSendOnce = 18,
    /// Copy send right
    CopySend = 19,
    /// Make send right (from receive)
    MakeSend = 20,
    /// Make send-once right (from receive)
    MakeSendOnce = 21,
}

impl MsgTypeName {
    /// Convert from u32
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            16 => Some(MsgTypeName::MoveReceive),
            17 => Some(MsgTypeName::MoveSend),
            18 => Some(MsgTypeName::MoveSendOnce),
            19 => Some(MsgTypeName::CopySend),
            20 => Some(MsgTypeName::MakeSend),
            21 => Some(MsgTypeName::MakeSendOnce),
            _ => None,
        }
    }

    /// Check if this type name moves the right (vs copies)
    pub fn is_move(&self) -> bool {
        matches!(
            self,
            MsgTypeName::MoveReceive | MsgTypeName::MoveSend | MsgTypeName::MoveSendOnce
        )
    }

    /// Check if this creates a new right from receive
    pub fn is_make(&self) -> bool {
        matches!(self, MsgTypeName::MakeSend | MsgTypeName::MakeSendOnce)
    }

    /// The right a receiver ends up holding after copyout
    pub fn copyout_right(&self) -> PortRight {
        match self {
            MsgTypeName::MoveReceive => PortRight::Receive,
            MsgTypeName::MoveSend | MsgTypeName::CopySend | MsgTypeName::MakeSend => {
                PortRight::Send
            }
            MsgTypeName::MoveSendOnce | MsgTypeName::MakeSendOnce => PortRight::SendOnce,
        }
    }
}
