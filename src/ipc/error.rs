//! IPC error codes

use thiserror::Error;

/// Kernel return code type
pub type KernReturn = i32;

pub const KERN_SUCCESS: KernReturn = 0;
pub const KERN_NO_SPACE: KernReturn = 3;
pub const KERN_INVALID_ARGUMENT: KernReturn = 4;
pub const KERN_INVALID_NAME: KernReturn = 15;
pub const KERN_INVALID_TASK: KernReturn = 16;
pub const KERN_INVALID_RIGHT: KernReturn = 17;
pub const KERN_INVALID_VALUE: KernReturn = 18;

/// Errors surfaced by right operations
///
/// Every fallible check runs before any mutation, so an error always
/// leaves the space as it was found (apart from a dead-name degrade,
/// which is a legitimate transition and not an error).
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpcError {
    /// The space has been torn down
    #[error("invalid task: space is inactive")]
    InvalidTask,

    /// No entry exists for the name
    #[error("invalid name")]
    InvalidName,

    /// The entry does not hold the right the operation needs
    #[error("invalid right")]
    InvalidRight,

    /// Reference count overflow/underflow or a disallowed delta
    #[error("invalid value")]
    InvalidValue,

    /// Disallowed combination of arguments
    #[error("invalid argument")]
    InvalidArgument,

    /// The entry table cannot grow any further
    #[error("no space left in the entry table")]
    NoSpace,
}

impl IpcError {
    /// Numeric return code for the syscall layer
    pub fn kern_return(self) -> KernReturn {
        match self {
            IpcError::InvalidTask => KERN_INVALID_TASK,
            IpcError::InvalidName => KERN_INVALID_NAME,
            IpcError::InvalidRight => KERN_INVALID_RIGHT,
            IpcError::InvalidValue => KERN_INVALID_VALUE,
            IpcError::InvalidArgument => KERN_INVALID_ARGUMENT,
            IpcError::NoSpace => KERN_NO_SPACE,
        }
    }
}

/// Result type for IPC operations
pub type IpcResult<T> = Result<T, IpcError>;

/// Collapse a result into a return code
pub fn kern_return<T>(result: &IpcResult<T>) -> KernReturn {
    match result {
        Ok(_) => KERN_SUCCESS,
        Err(e) => e.kern_return(),
    }
}
