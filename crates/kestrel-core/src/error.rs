//! Error types of the threading core and the sysmsg client.
//!
//! Raw IPC failures never reach callers as-is: each operation translates
//! them into one of the semantic outcomes below. [`ThreadError::Ipc`] is
//! reserved for terminal IPC failures with no narrower meaning.

use kestrel_ipc::{IpcError, ThreadControlError};
use thiserror::Error;

use crate::status::{
    EBUSY, EDEADLK, EINVAL, EIO, ENOMEM, ENOSYS, EPERM, ESRCH, ETIMEDOUT, THRD_BUSY, THRD_ERROR,
    THRD_NOMEM, THRD_TIMEDOUT,
};

/// Failure of a thread, TSS, mutex or condition-variable operation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ThreadError {
    #[error("resource busy")]
    Busy,
    #[error("timed out")]
    TimedOut,
    #[error("out of memory")]
    NoMemory,
    #[error("no such thread")]
    NotFound,
    #[error("caller does not own the mutex")]
    NotOwner,
    #[error("operation would deadlock")]
    Deadlock,
    #[error("operation not supported")]
    Unsupported,
    #[error("object was destroyed")]
    Destroyed,
    #[error("invalid argument")]
    Invalid,
    #[error("ipc failure: {0}")]
    Ipc(IpcError),
    #[error("operation failed")]
    Failed,
}

impl ThreadError {
    /// C11 `thrd_*` status word for this error.
    #[must_use]
    pub const fn status(&self) -> i32 {
        match self {
            Self::Busy => THRD_BUSY,
            Self::TimedOut => THRD_TIMEDOUT,
            Self::NoMemory => THRD_NOMEM,
            _ => THRD_ERROR,
        }
    }

    /// Closest errno value.
    #[must_use]
    pub const fn errno(&self) -> i32 {
        match self {
            Self::Busy => EBUSY,
            Self::TimedOut => ETIMEDOUT,
            Self::NoMemory => ENOMEM,
            Self::NotFound => ESRCH,
            Self::NotOwner => EPERM,
            Self::Deadlock => EDEADLK,
            Self::Unsupported => ENOSYS,
            Self::Destroyed | Self::Invalid => EINVAL,
            Self::Ipc(_) | Self::Failed => EIO,
        }
    }
}

impl From<ThreadControlError> for ThreadError {
    fn from(err: ThreadControlError) -> Self {
        match err {
            ThreadControlError::SpaceFull(_) => Self::NoMemory,
            ThreadControlError::NoSuchSpace(_) | ThreadControlError::NoSuchThread(_) => {
                Self::NotFound
            }
            ThreadControlError::AlreadyStarted(_) => Self::Invalid,
            ThreadControlError::Spawn(_) => Self::Failed,
        }
    }
}

/// Failure of a sysmsg client operation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SysmsgError {
    #[error("broadcast from inside a sysmsg handler would deadlock")]
    Deadlock,
    #[error("unknown or closed listen handle")]
    BadHandle,
    #[error("broadcast bit {0} out of range")]
    InvalidBit(u32),
    #[error("broadcast body of {0} words does not fit one message")]
    BodyTooLong(usize),
    #[error("broadcaster is not reachable")]
    NoBroadcaster,
    #[error("ipc failure: {0}")]
    Ipc(IpcError),
    #[error(transparent)]
    Thread(#[from] ThreadError),
}

impl SysmsgError {
    /// Negative errno, as returned by the C-style broadcast contract.
    #[must_use]
    pub const fn errno(&self) -> i32 {
        match self {
            Self::Deadlock => -EDEADLK,
            Self::BadHandle | Self::InvalidBit(_) | Self::BodyTooLong(_) => -EINVAL,
            Self::NoBroadcaster => -ESRCH,
            Self::Ipc(_) => -EIO,
            Self::Thread(e) => -e.errno(),
        }
    }
}
