//! # kestrel-core
//!
//! Userspace threading runtime on top of the `kestrel-ipc` substrate.
//!
//! There is no blocking wait primitive below this layer: every blocking
//! operation here is built from synchronous IPC rendezvous.
//!
//! - [`threads`]: thread creation, exit and join; thread-specific storage;
//!   the hybrid mutex (atomic fast path, lock-serializer thread for
//!   contention); condition variables.
//! - [`once`]: run-once initialisation.
//! - [`rollback`] and [`idl`]: the reply rollback/confirm protocol and the
//!   server dispatch loop that drives it.
//! - [`sysmsg`]: the system broadcast client and broadcaster.
//! - [`config`], [`diag`], [`error`], [`status`]: configuration, structured
//!   diagnostics and counters, error types and C11-style status codes.

#![deny(unsafe_code)]

pub mod config;
pub mod diag;
pub mod error;
pub mod idl;
pub mod once;
pub mod rollback;
pub mod runtime;
pub mod status;
pub mod sysmsg;
pub mod threads;

pub use config::{LogLevel, RuntimeConfig};
pub use diag::{CounterSnapshot, RuntimeCounters};
pub use error::{SysmsgError, ThreadError};
pub use once::{Once, call_once};
pub use runtime::Runtime;
pub use threads::{Condvar, Mutex, MutexGuard, MutexKind, Thread, ThreadBuilder};
