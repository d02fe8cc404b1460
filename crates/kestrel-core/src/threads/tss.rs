//! Thread-specific storage.
//!
//! ## Design
//!
//! - **Key registry**: process-wide, [`TSS_KEYS_MAX`] slots. A slot is claimed
//!   by a compare-and-swap on its state byte; its destructor lives next to
//!   it. Key 0 is never issued. The first few keys are reserved for the
//!   runtime's own per-thread state (waiter lease, rollback context, sysmsg
//!   handler flag).
//! - **Per-thread table**: owned by the thread's control block, grown on
//!   demand and never shrunk.
//! - **Exit protocol**: [`TssTable::run_exit`] clears each populated slot
//!   before calling its destructor and repeats the scan until a pass finds
//!   nothing, so destructors may repopulate slots.

use std::any::Any;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use parking_lot::{Mutex, RwLock};

use crate::error::ThreadError;
use crate::runtime::Runtime;
use crate::threads::thread::ThreadControl;

/// Number of key slots, including the unused key 0.
pub const TSS_KEYS_MAX: usize = 128;

/// A value stored in a TSS slot.
pub type TssValue = Arc<dyn Any + Send + Sync>;

/// Called with the slot's value when a thread exits with the slot set.
pub type TssDestructor = fn(TssValue);

/// Handle to one TSS slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TssKey(u32);

impl TssKey {
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

pub(crate) const WAITER_KEY: TssKey = TssKey(1);
pub(crate) const ROLLBACK_KEY: TssKey = TssKey(2);
pub(crate) const SYSMSG_KEY: TssKey = TssKey(3);
const RESERVED_KEYS: usize = 3;

const SLOT_FREE: u8 = 0;
const SLOT_CLAIMING: u8 = 1;
const SLOT_USED: u8 = 2;

// ---------------------------------------------------------------------------
// Key registry
// ---------------------------------------------------------------------------

struct KeySlot {
    state: AtomicU8,
    destructor: RwLock<Option<TssDestructor>>,
}

pub(crate) struct TssRegistry {
    slots: Box<[KeySlot]>,
}

impl TssRegistry {
    pub(crate) fn new() -> Self {
        let slots = (0..TSS_KEYS_MAX)
            .map(|i| KeySlot {
                state: AtomicU8::new(if (1..=RESERVED_KEYS).contains(&i) {
                    SLOT_USED
                } else {
                    SLOT_FREE
                }),
                destructor: RwLock::new(None),
            })
            .collect();
        Self { slots }
    }

    fn create(&self, destructor: Option<TssDestructor>) -> Result<TssKey, ThreadError> {
        for (i, slot) in self.slots.iter().enumerate().skip(RESERVED_KEYS + 1) {
            if slot
                .state
                .compare_exchange(SLOT_FREE, SLOT_CLAIMING, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                *slot.destructor.write() = destructor;
                slot.state.store(SLOT_USED, Ordering::Release);
                return Ok(TssKey(i as u32));
            }
        }
        Err(ThreadError::NoMemory)
    }

    fn delete(&self, key: TssKey) -> Result<(), ThreadError> {
        if key.index() <= RESERVED_KEYS {
            return Err(ThreadError::Invalid);
        }
        let slot = self.slots.get(key.index()).ok_or(ThreadError::Invalid)?;
        slot.state
            .compare_exchange(SLOT_USED, SLOT_CLAIMING, Ordering::Acquire, Ordering::Relaxed)
            .map_err(|_| ThreadError::Invalid)?;
        *slot.destructor.write() = None;
        slot.state.store(SLOT_FREE, Ordering::Release);
        Ok(())
    }

    fn is_live(&self, key: TssKey) -> bool {
        key.index() != 0
            && self
                .slots
                .get(key.index())
                .is_some_and(|s| s.state.load(Ordering::Acquire) == SLOT_USED)
    }

    fn destructor(&self, index: usize) -> Option<TssDestructor> {
        let slot = self.slots.get(index)?;
        if slot.state.load(Ordering::Acquire) != SLOT_USED {
            return None;
        }
        *slot.destructor.read()
    }
}

// ---------------------------------------------------------------------------
// Per-thread table
// ---------------------------------------------------------------------------

#[derive(Default)]
pub(crate) struct TssTable {
    values: Mutex<Vec<Option<TssValue>>>,
}

impl TssTable {
    pub(crate) fn get(&self, key: TssKey) -> Option<TssValue> {
        self.values.lock().get(key.index()).cloned().flatten()
    }

    /// Stores `value`, returning the previous one.
    pub(crate) fn set(
        &self,
        key: TssKey,
        value: Option<TssValue>,
    ) -> Result<Option<TssValue>, ThreadError> {
        let mut values = self.values.lock();
        let index = key.index();
        if index >= values.len() {
            if value.is_none() {
                return Ok(None);
            }
            let grow = index + 1 - values.len();
            values
                .try_reserve_exact(grow)
                .map_err(|_| ThreadError::NoMemory)?;
            values.resize(index + 1, None);
        }
        Ok(std::mem::replace(&mut values[index], value))
    }

    /// One scan over the table. Returns whether any slot was populated.
    fn exit_pass(&self, registry: &TssRegistry) -> bool {
        let mut found = false;
        let mut index = 1;
        loop {
            let taken = {
                let mut values = self.values.lock();
                if index >= values.len() {
                    break;
                }
                values[index].take()
            };
            if let Some(value) = taken {
                found = true;
                match registry.destructor(index) {
                    Some(destructor) => destructor(value),
                    None => drop(value),
                }
            }
            index += 1;
        }
        found
    }

    /// Runs destructors until no slot is populated.
    pub(crate) fn run_exit(&self, registry: &TssRegistry) {
        while self.exit_pass(registry) {}
    }
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Allocates a new key. Fails with [`ThreadError::NoMemory`] when every
/// slot is taken.
pub fn tss_create(destructor: Option<TssDestructor>) -> Result<TssKey, ThreadError> {
    Runtime::get().tss().create(destructor)
}

/// Releases `key` for reuse. Values still stored under it are not
/// destroyed.
pub fn tss_delete(key: TssKey) -> Result<(), ThreadError> {
    Runtime::get().tss().delete(key)
}

/// The calling thread's value for `key`.
#[must_use]
pub fn tss_get(key: TssKey) -> Option<TssValue> {
    if !Runtime::get().tss().is_live(key) {
        return None;
    }
    ThreadControl::current().tss().get(key)
}

/// [`tss_get`] downcast to a concrete type.
#[must_use]
pub fn tss_get_as<T: Any + Send + Sync>(key: TssKey) -> Option<Arc<T>> {
    tss_get(key)?.downcast::<T>().ok()
}

/// Sets the calling thread's value for `key`.
pub fn tss_set(key: TssKey, value: Option<TssValue>) -> Result<(), ThreadError> {
    if !Runtime::get().tss().is_live(key) {
        return Err(ThreadError::Invalid);
    }
    ThreadControl::current().tss().set(key, value).map(drop)
}
