//! Waiter records for blocked lock and condition-variable calls.
//!
//! A fixed arena of slots addressed by small handles (index + 1, so 0 can
//! mean "none" inside queue links). Each thread leases one slot on its
//! first blocking call and keeps it in TSS; the lease returns the slot when
//! the thread's TSS is torn down. A record sits in at most one mutex queue
//! and at most one condition-variable list at a time, only for the duration
//! of the owning thread's blocking call, so no allocation happens per lock
//! attempt.

use std::num::NonZeroU32;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use kestrel_ipc::ThreadId;
use parking_lot::Mutex;

use crate::error::ThreadError;
use crate::runtime::Runtime;
use crate::threads::mutex::MutexCell;
use crate::threads::tss::{WAITER_KEY, tss_get_as, tss_set};

/// Handle of a waiter slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct WaiterHandle(NonZeroU32);

impl WaiterHandle {
    pub(crate) fn raw(self) -> u32 {
        self.0.get()
    }

    pub(crate) fn from_raw(raw: u32) -> Option<Self> {
        NonZeroU32::new(raw).map(Self)
    }

    fn index(self) -> usize {
        (self.0.get() - 1) as usize
    }
}

pub(crate) struct WaiterSlot {
    claimed: AtomicBool,
    /// Global id of the leasing thread.
    tid: AtomicU64,
    /// Local id of the leasing thread.
    local: AtomicU64,
    /// Next record in a mutex wait queue (0 = end). Serializer only.
    pub(crate) mutex_next: AtomicU32,
    /// Next record in a condition-variable list (0 = end).
    pub(crate) cond_next: AtomicU32,
    /// Mutex the owner is asking the serializer about.
    pub(crate) pending: Mutex<Option<Arc<MutexCell>>>,
}

impl WaiterSlot {
    pub(crate) fn tid(&self) -> ThreadId {
        ThreadId::from_raw(self.tid.load(Ordering::Acquire))
    }

    pub(crate) fn local(&self) -> ThreadId {
        ThreadId::from_raw(self.local.load(Ordering::Acquire))
    }
}

pub(crate) struct WaiterArena {
    slots: Box<[WaiterSlot]>,
}

impl WaiterArena {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        let slots = (0..capacity)
            .map(|_| WaiterSlot {
                claimed: AtomicBool::new(false),
                tid: AtomicU64::new(0),
                local: AtomicU64::new(0),
                mutex_next: AtomicU32::new(0),
                cond_next: AtomicU32::new(0),
                pending: Mutex::new(None),
            })
            .collect();
        Self { slots }
    }

    pub(crate) fn slot(&self, handle: WaiterHandle) -> &WaiterSlot {
        match self.slots.get(handle.index()) {
            Some(slot) => slot,
            None => crate::diag::fatal(
                "waiter_handle_out_of_range",
                serde_json::json!({ "handle": handle.raw(), "capacity": self.slots.len() }),
            ),
        }
    }

    /// Resolves a handle received over IPC.
    pub(crate) fn lookup(&self, raw: u64) -> Option<(WaiterHandle, &WaiterSlot)> {
        let handle = WaiterHandle::from_raw(u32::try_from(raw).ok()?)?;
        let slot = self.slots.get(handle.index())?;
        slot.claimed
            .load(Ordering::Acquire)
            .then_some((handle, slot))
    }

    fn claim(&self, tid: ThreadId, local: ThreadId) -> Option<WaiterHandle> {
        self.slots.iter().enumerate().find_map(|(i, slot)| {
            slot.claimed
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
                .ok()?;
            slot.tid.store(tid.raw(), Ordering::Release);
            slot.local.store(local.raw(), Ordering::Release);
            slot.mutex_next.store(0, Ordering::Relaxed);
            slot.cond_next.store(0, Ordering::Relaxed);
            WaiterHandle::from_raw(i as u32 + 1)
        })
    }

    fn release(&self, handle: WaiterHandle) {
        let slot = self.slot(handle);
        slot.pending.lock().take();
        slot.tid.store(0, Ordering::Relaxed);
        slot.local.store(0, Ordering::Relaxed);
        slot.claimed.store(false, Ordering::Release);
    }

    #[cfg(test)]
    pub(crate) fn claimed(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| s.claimed.load(Ordering::Relaxed))
            .count()
    }
}

/// A thread's lease on its waiter slot, stored in TSS.
struct WaiterLease(WaiterHandle);

impl Drop for WaiterLease {
    fn drop(&mut self) {
        Runtime::get().waiters().release(self.0);
    }
}

/// The calling thread's waiter record, leased on first use.
pub(crate) fn current() -> Result<WaiterHandle, ThreadError> {
    if let Some(lease) = tss_get_as::<WaiterLease>(WAITER_KEY) {
        return Ok(lease.0);
    }
    let handle = Runtime::get()
        .waiters()
        .claim(kestrel_ipc::current(), kestrel_ipc::current_local())
        .ok_or(ThreadError::NoMemory)?;
    tss_set(WAITER_KEY, Some(Arc::new(WaiterLease(handle))))?;
    Ok(handle)
}
