//! Mach_R rights - port right lifecycle for a Mach-style IPC layer
//!
//! This crate manages the capabilities ("rights") a task holds to ports,
//! keyed by an integer name inside the task's IPC space. It covers the
//! whole lifecycle of a right: creation, user reference counting, dead-name
//! degradation when a port dies, transfer during message transmission
//! (copyin/copyout), renaming, and destruction.
//!
//! Lock order is always space before port. A port lock can only be taken
//! through a held space write guard (see [`ipc::space::SpaceWrite`]),
//! except during teardown of a space that is already inactive.

#![cfg_attr(not(any(test, feature = "std")), no_std)]
// Kernel IPC returns simple error enums
#![allow(clippy::result_unit_err)]

// Standard library replacement for no_std
extern crate alloc;

pub mod config;
pub mod ipc;

pub use config::IpcConfig;
pub use ipc::{IpcError, IpcResult, MachPortName, MsgTypeName, PortRight};

/// Crate version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
