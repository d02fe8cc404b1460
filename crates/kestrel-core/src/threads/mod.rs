//! Thread lifecycle, TSS and the synchronisation primitives built on IPC.

pub mod cond;
pub mod mutex;
pub(crate) mod serializer;
pub mod thread;
pub mod tss;
pub(crate) mod waiter;

pub use cond::Condvar;
pub use mutex::{Mutex, MutexGuard, MutexKind, MutexState};
pub use thread::{Thread, ThreadBuilder, ThreadControl, exit, sleep, spawn, yield_now};
pub use tss::{TSS_KEYS_MAX, TssDestructor, TssKey, TssValue, tss_create, tss_delete, tss_get, tss_get_as, tss_set};
