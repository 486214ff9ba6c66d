//! IPC configuration
//!
//! Tunables shared by every space created from one configuration: the
//! initial slot table size, the initial dead-name request capacity of new
//! ports, and the notification sink.

use alloc::sync::Arc;

use crate::ipc::entry::{IPC_ENTRY_TABLE_MAX, IPC_ENTRY_TABLE_MIN};
use crate::ipc::notify::{LogNotifier, Notifier};

/// Default number of dead-name request slots a new port starts with
pub const DNREQUEST_SLOTS_DEFAULT: usize = 4;

/// Configuration for IPC spaces and the ports they allocate
#[derive(Clone)]
pub struct IpcConfig {
    /// Initial entry table size
    pub table_size: usize,
    /// Initial dead-name request capacity of ports created by `port_allocate`
    pub dnrequest_slots: usize,
    /// Where notifications go once all locks are released
    pub notifier: Arc<dyn Notifier>,
}

impl IpcConfig {
    /// Default configuration (16 slots, 4 request slots, log-only notifier)
    pub fn new() -> Self {
        Self {
            table_size: IPC_ENTRY_TABLE_MIN,
            dnrequest_slots: DNREQUEST_SLOTS_DEFAULT,
            notifier: Arc::new(LogNotifier),
        }
    }

    /// Set the initial entry table size, clamped to the allocator's range
    pub fn with_table_size(mut self, size: usize) -> Self {
        self.table_size = size.clamp(IPC_ENTRY_TABLE_MIN, IPC_ENTRY_TABLE_MAX);
        self
    }

    /// Set the initial dead-name request capacity of new ports
    pub fn with_dnrequest_slots(mut self, slots: usize) -> Self {
        self.dnrequest_slots = slots;
        self
    }

    /// Route notifications to `notifier`
    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }
}

impl Default for IpcConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for IpcConfig {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("IpcConfig")
            .field("table_size", &self.table_size)
            .field("dnrequest_slots", &self.dnrequest_slots)
            .finish_non_exhaustive()
    }
}
