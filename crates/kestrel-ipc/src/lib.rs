//! # kestrel-ipc
//!
//! Hosted microkernel substrate for the kestrel runtime.
//!
//! Provides what a small L4-style kernel would: global and local thread ids,
//! synchronous rendezvous IPC with per-phase timeouts, cancellation of
//! blocked IPC from another thread, thread creation/start/deletion inside
//! address spaces, and a per-thread UTCB carrying one user-defined handle.
//! Every kernel thread is backed by a host thread; host threads that touch
//! the kernel without having been started by it are adopted into
//! [`SpaceId::ROOT`].

#![deny(unsafe_code)]

pub mod config;
pub mod error;
pub mod id;
pub mod kernel;
pub mod message;
pub mod timeout;

pub use config::KernelConfig;
pub use error::{ErrorCode, IpcError, Phase, ThreadControlError};
pub use id::{SpaceId, ThreadId, Word};
pub use kernel::{
    Entry, Kernel, Source, StartRegisters, UserHandle, abort_ipc, call, cancel_ipc, current,
    current_local, current_space, kernel, recv, reply_wait, same_thread, send, set_user_handle,
    try_current, user_handle, yield_now,
};
pub use message::{MSG_WORDS, Message, MsgTag};
pub use timeout::Timeout;
