//! Condition variables.
//!
//! The condition variable is one atomic word holding the head of a
//! lock-free LIFO of waiter records, linked through each record's
//! `cond_next`. The upper half of the word is a stamp bumped by every
//! successful update, so a record that is popped and pushed again between
//! another thread's load and compare-and-swap cannot be mistaken for the
//! old head.
//!
//! Waiters push themselves, release the mutex and block in an open receive
//! for a wake message. Signal pops one record and sends it a wake;
//! broadcast detaches the whole list with a single swap, so threads that
//! start waiting afterwards are not woken by it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use kestrel_ipc::{ErrorCode, Message, Source, Timeout, Word, recv, send};
use serde_json::json;

use crate::diag::{self, RuntimeCounters};
use crate::error::ThreadError;
use crate::runtime::Runtime;
use crate::threads::mutex::{Mutex, MutexGuard};
use crate::threads::waiter::{self, WaiterHandle};

/// Label of the message that releases a waiter.
pub(crate) const LABEL_WAKE: u16 = b'W' as u16;

const DESTROYED: Word = Word::MAX;
const STAMP_SHIFT: u32 = 32;
const HEAD_MASK: Word = (1 << STAMP_SHIFT) - 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CondWord {
    Destroyed,
    List { head: Option<WaiterHandle>, stamp: u32 },
}

impl CondWord {
    fn decode(word: Word) -> Self {
        if word == DESTROYED {
            return Self::Destroyed;
        }
        Self::List {
            head: WaiterHandle::from_raw((word & HEAD_MASK) as u32),
            stamp: (word >> STAMP_SHIFT) as u32,
        }
    }

    /// Encodes a list word with the stamp advanced past `stamp`.
    fn successor(head: Option<WaiterHandle>, stamp: u32) -> Word {
        // Skip the stamp that would collide with DESTROYED.
        let mut next = stamp.wrapping_add(1);
        if next == u32::MAX && head.map_or(0, WaiterHandle::raw) == u32::MAX {
            next = 0;
        }
        Word::from(next) << STAMP_SHIFT | Word::from(head.map_or(0, WaiterHandle::raw))
    }
}

/// Condition variable.
#[derive(Debug, Default)]
pub struct Condvar {
    word: AtomicU64,
}

impl Condvar {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            word: AtomicU64::new(0),
        }
    }

    /// Whether nobody is currently waiting.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        matches!(
            CondWord::decode(self.word.load(Ordering::Acquire)),
            CondWord::List { head: None, .. }
        )
    }

    fn push(&self, handle: WaiterHandle) -> Result<(), ThreadError> {
        let slot = Runtime::get().waiters().slot(handle);
        let mut current = self.word.load(Ordering::Relaxed);
        loop {
            let CondWord::List { head, stamp } = CondWord::decode(current) else {
                return Err(ThreadError::Destroyed);
            };
            slot.cond_next
                .store(head.map_or(0, WaiterHandle::raw), Ordering::Relaxed);
            match self.word.compare_exchange_weak(
                current,
                CondWord::successor(Some(handle), stamp),
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Ok(()),
                Err(actual) => current = actual,
            }
        }
    }

    fn pop(&self) -> Option<WaiterHandle> {
        let waiters = Runtime::get().waiters();
        let mut current = self.word.load(Ordering::Acquire);
        loop {
            let CondWord::List {
                head: Some(head),
                stamp,
            } = CondWord::decode(current)
            else {
                return None;
            };
            let next = WaiterHandle::from_raw(waiters.slot(head).cond_next.load(Ordering::Relaxed));
            match self.word.compare_exchange_weak(
                current,
                CondWord::successor(next, stamp),
                Ordering::Acquire,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(head),
                Err(actual) => current = actual,
            }
        }
    }

    /// Detaches the whole list, returning its head.
    fn take_all(&self) -> Option<WaiterHandle> {
        let mut current = self.word.load(Ordering::Acquire);
        loop {
            let CondWord::List {
                head: Some(head),
                stamp,
            } = CondWord::decode(current)
            else {
                return None;
            };
            match self.word.compare_exchange_weak(
                current,
                CondWord::successor(None, stamp),
                Ordering::Acquire,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(head),
                Err(actual) => current = actual,
            }
        }
    }

    /// Atomically releases `mutex` and blocks until signalled, then
    /// reacquires `mutex`. The caller must hold `mutex`.
    pub fn wait(&self, mutex: &Mutex) -> Result<(), ThreadError> {
        if !mutex.is_held_by_current() {
            return Err(ThreadError::NotOwner);
        }
        let handle = waiter::current()?;
        self.push(handle)?;
        mutex.unlock()?;

        loop {
            match recv(Source::Any, Timeout::Never) {
                Ok((_, msg)) if msg.label() == LABEL_WAKE => break,
                Ok((from, msg)) => diag::debug(
                    "cond_wait_ignored_message",
                    json!({ "from": from.raw(), "label": msg.label() }),
                ),
                Err(e) if e.is_transient() => continue,
                Err(e) => {
                    diag::error("cond_wait_recv_failed", json!({ "error": e.to_string() }));
                    return Err(ThreadError::Ipc(e));
                }
            }
        }
        RuntimeCounters::bump(&Runtime::get().counters().cond_wakeups);
        mutex.lock()
    }

    /// [`Condvar::wait`] on the mutex behind `guard`.
    pub fn wait_guard<'a>(&self, guard: MutexGuard<'a>) -> Result<MutexGuard<'a>, ThreadError> {
        let mutex = guard.mutex();
        match self.wait(mutex) {
            Ok(()) => Ok(guard),
            Err(e) => {
                if !mutex.is_held_by_current() {
                    std::mem::forget(guard);
                }
                Err(e)
            }
        }
    }

    /// `cnd_timedwait` is not provided by this runtime.
    pub fn timed_wait(&self, _mutex: &Mutex, _timeout: Duration) -> Result<(), ThreadError> {
        Err(ThreadError::Unsupported)
    }

    /// Wakes one waiter, if any.
    pub fn signal(&self) -> Result<(), ThreadError> {
        let waiters = Runtime::get().waiters();
        while let Some(handle) = self.pop() {
            match wake(waiters.slot(handle).tid()) {
                Ok(()) => return Ok(()),
                // The waiter is gone; the signal goes to the next one.
                Err(e) if e.code == ErrorCode::NoPartner => continue,
                Err(e) => return Err(ThreadError::Ipc(e)),
            }
        }
        Ok(())
    }

    /// Wakes every thread waiting at the time of the call.
    pub fn broadcast(&self) -> Result<(), ThreadError> {
        let waiters = Runtime::get().waiters();
        let mut failure = None;
        let mut cursor = self.take_all();
        while let Some(handle) = cursor {
            let slot = waiters.slot(handle);
            // A woken waiter may push itself again and rewrite its link.
            cursor = WaiterHandle::from_raw(slot.cond_next.load(Ordering::Relaxed));
            match wake(slot.tid()) {
                Ok(()) => {}
                Err(e) if e.code == ErrorCode::NoPartner => {}
                Err(e) => {
                    diag::warn("cond_broadcast_wake_failed", json!({ "error": e.to_string() }));
                    failure.get_or_insert(ThreadError::Ipc(e));
                }
            }
        }
        failure.map_or(Ok(()), Err)
    }

    /// `cnd_destroy`. Wakes remaining waiters; later waits fail with
    /// [`ThreadError::Destroyed`].
    pub fn destroy(&self) -> Result<(), ThreadError> {
        loop {
            self.broadcast()?;
            let current = self.word.load(Ordering::Acquire);
            match CondWord::decode(current) {
                CondWord::Destroyed => return Ok(()),
                CondWord::List { head: Some(_), .. } => {}
                CondWord::List { head: None, .. } => {
                    if self
                        .word
                        .compare_exchange(current, DESTROYED, Ordering::AcqRel, Ordering::Relaxed)
                        .is_ok()
                    {
                        return Ok(());
                    }
                }
            }
            RuntimeCounters::bump(&Runtime::get().counters().busy_destroys);
            diag::warn("cond_destroy_raced_waiter", json!({}));
        }
    }
}

fn wake(to: kestrel_ipc::ThreadId) -> Result<(), kestrel_ipc::IpcError> {
    loop {
        match send(to, Message::new(LABEL_WAKE), Timeout::Never) {
            Err(e) if e.is_transient() => continue,
            other => return other,
        }
    }
}
