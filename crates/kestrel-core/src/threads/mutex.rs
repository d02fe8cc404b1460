//! Hybrid mutex.
//!
//! The uncontended path is a single compare-and-swap on the mutex word.
//! Contended lock and unlock go to the process's lock-serializer thread
//! (see `serializer.rs`), which owns the per-mutex FIFO wait queue and
//! performs ownership handoff.
//!
//! Word layout, through [`MutexState`] only:
//! - `0`: unlocked.
//! - `owner | LOCKED`: held by the thread whose local id is `owner`.
//! - `owner | LOCKED | CONFLICT`: held, and at least one thread has gone or
//!   is going to the serializer, so unlock must go there too.
//!
//! Local ids only identify a thread within one space, so a mutex belongs to
//! the space that created it; use from any other space is `Invalid`.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use kestrel_ipc::{Message, Source, SpaceId, ThreadId, Timeout, Word, call, recv};
use serde_json::json;

use crate::diag::{self, RuntimeCounters};
use crate::error::ThreadError;
use crate::runtime::Runtime;
use crate::threads::serializer::{LABEL_ACK, LABEL_GRANT, LABEL_LOCK, LABEL_UNLOCK, UNLOCK_NOT_OWNER};
use crate::threads::waiter;

const LOCKED: Word = 0b01;
const CONFLICT: Word = 0b10;
const FLAGS: Word = LOCKED | CONFLICT;

/// Decoded mutex word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutexState {
    Unlocked,
    Locked { owner: ThreadId, conflict: bool },
}

impl MutexState {
    #[must_use]
    pub const fn encode(self) -> Word {
        match self {
            Self::Unlocked => 0,
            Self::Locked { owner, conflict } => {
                owner.raw() | LOCKED | if conflict { CONFLICT } else { 0 }
            }
        }
    }

    #[must_use]
    pub const fn decode(word: Word) -> Self {
        if word & LOCKED == 0 {
            Self::Unlocked
        } else {
            Self::Locked {
                owner: ThreadId::from_raw(word & !FLAGS),
                conflict: word & CONFLICT != 0,
            }
        }
    }

    #[must_use]
    pub const fn held_by(owner: ThreadId) -> Self {
        Self::Locked {
            owner,
            conflict: false,
        }
    }
}

/// C11 mutex type flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MutexKind(u8);

impl MutexKind {
    pub const PLAIN: MutexKind = MutexKind(0);
    pub const RECURSIVE: MutexKind = MutexKind(1);
    pub const TIMED: MutexKind = MutexKind(2);

    #[must_use]
    pub const fn is_plain(self) -> bool {
        self.0 == 0
    }
}

impl std::ops::BitOr for MutexKind {
    type Output = MutexKind;

    fn bitor(self, rhs: Self) -> Self::Output {
        MutexKind(self.0 | rhs.0)
    }
}

/// Shared state of one mutex: the word and the serializer-owned queue.
pub(crate) struct MutexCell {
    pub(crate) word: AtomicU64,
    /// Queue head/tail as waiter handles (0 = empty). Serializer only.
    pub(crate) head: AtomicU32,
    pub(crate) tail: AtomicU32,
    /// Queue length, published for observers.
    pub(crate) queued: AtomicU32,
}

impl MutexCell {
    /// Identity carried in lock/unlock requests.
    pub(crate) fn key(&self) -> Word {
        std::ptr::from_ref(self) as usize as Word
    }

    pub(crate) fn state(&self) -> MutexState {
        MutexState::decode(self.word.load(Ordering::Acquire))
    }
}

/// Mutual-exclusion lock.
pub struct Mutex {
    cell: Arc<MutexCell>,
    space: SpaceId,
}

impl Default for Mutex {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Mutex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mutex").field("state", &self.state()).finish()
    }
}

impl Mutex {
    /// A plain mutex.
    #[must_use]
    pub fn new() -> Self {
        Self {
            cell: Arc::new(MutexCell {
                word: AtomicU64::new(0),
                head: AtomicU32::new(0),
                tail: AtomicU32::new(0),
                queued: AtomicU32::new(0),
            }),
            space: kestrel_ipc::current_space(),
        }
    }

    /// `mtx_init`. Only [`MutexKind::PLAIN`] is supported.
    pub fn with_kind(kind: MutexKind) -> Result<Self, ThreadError> {
        if !kind.is_plain() {
            return Err(ThreadError::Unsupported);
        }
        Ok(Self::new())
    }

    #[must_use]
    pub fn state(&self) -> MutexState {
        self.cell.state()
    }

    /// Space the mutex was created in.
    #[must_use]
    pub fn space(&self) -> SpaceId {
        self.space
    }

    /// Local id of the caller, provided it runs in the mutex's space.
    fn caller(&self) -> Result<ThreadId, ThreadError> {
        let space = kestrel_ipc::current_space();
        if space != self.space {
            diag::warn(
                "mutex_foreign_space",
                json!({ "mutex": self.cell.key(), "owner_space": self.space.0, "caller_space": space.0 }),
            );
            return Err(ThreadError::Invalid);
        }
        Ok(kestrel_ipc::current_local())
    }

    /// Number of threads queued at the serializer for this mutex.
    #[must_use]
    pub fn waiters(&self) -> usize {
        self.cell.queued.load(Ordering::Acquire) as usize
    }

    /// Whether the calling thread holds the lock.
    #[must_use]
    pub fn is_held_by_current(&self) -> bool {
        kestrel_ipc::current_space() == self.space
            && matches!(self.state(), MutexState::Locked { owner, .. } if owner == kestrel_ipc::current_local())
    }

    /// One compare-and-swap; never blocks and never involves the serializer.
    pub fn try_lock(&self) -> Result<(), ThreadError> {
        let me = self.caller()?;
        self.cell
            .word
            .compare_exchange(
                0,
                MutexState::held_by(me).encode(),
                Ordering::Acquire,
                Ordering::Relaxed,
            )
            .map(|_| RuntimeCounters::bump(&Runtime::get().counters().fast_locks))
            .map_err(|_| ThreadError::Busy)
    }

    pub fn lock(&self) -> Result<(), ThreadError> {
        let me = self.caller()?;
        let word = &self.cell.word;
        let mut current = word.load(Ordering::Relaxed);
        loop {
            let (next, contended) = match MutexState::decode(current) {
                MutexState::Unlocked => (MutexState::held_by(me), false),
                MutexState::Locked { owner, .. } if owner == me => {
                    diag::warn("mutex_relock_by_owner", json!({ "mutex": self.cell.key() }));
                    return Err(ThreadError::Deadlock);
                }
                MutexState::Locked {
                    conflict: true, ..
                } => break,
                MutexState::Locked { owner, .. } => (
                    MutexState::Locked {
                        owner,
                        conflict: true,
                    },
                    true,
                ),
            };
            match word.compare_exchange_weak(
                current,
                next.encode(),
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) if contended => break,
                Ok(_) => {
                    RuntimeCounters::bump(&Runtime::get().counters().fast_locks);
                    return Ok(());
                }
                Err(actual) => current = actual,
            }
        }
        self.lock_slow()
    }

    fn lock_slow(&self) -> Result<(), ThreadError> {
        let rt = Runtime::get();
        let serializer = rt.serializer()?;
        let handle = waiter::current()?;
        let slot = rt.waiters().slot(handle);
        *slot.pending.lock() = Some(Arc::clone(&self.cell));
        RuntimeCounters::bump(&rt.counters().slow_locks);

        let request = Message::with_words(LABEL_LOCK, &[self.cell.key(), Word::from(handle.raw())]);
        let mut outcome = call(serializer, request, Timeout::Never, Timeout::Never);
        loop {
            match outcome {
                Ok(reply) if reply.label() == LABEL_GRANT => return Ok(()),
                Ok(_) => outcome = recv_from(serializer),
                // Request is queued; only the wait for the grant was cut short.
                Err(e) if e.is_receive() && e.is_transient() => outcome = recv_from(serializer),
                Err(e) if e.is_transient() => {
                    outcome = call(serializer, request, Timeout::Never, Timeout::Never);
                }
                Err(e) => {
                    slot.pending.lock().take();
                    diag::error("mutex_lock_ipc_failed", json!({ "error": e.to_string() }));
                    return Err(ThreadError::Ipc(e));
                }
            }
        }
    }

    /// `mtx_timedlock` is not provided by this runtime.
    pub fn timed_lock(&self, _timeout: Duration) -> Result<(), ThreadError> {
        Err(ThreadError::Unsupported)
    }

    pub fn unlock(&self) -> Result<(), ThreadError> {
        let me = self.caller()?;
        let word = &self.cell.word;
        let held = MutexState::held_by(me).encode();
        loop {
            match word.compare_exchange(held, 0, Ordering::Release, Ordering::Relaxed) {
                Ok(_) => return Ok(()),
                Err(actual) => match MutexState::decode(actual) {
                    MutexState::Locked {
                        owner,
                        conflict: true,
                    } if owner == me => return self.unlock_slow(),
                    // CONFLICT was cleared under us; retry the fast path.
                    MutexState::Locked { owner, .. } if owner == me => continue,
                    state => {
                        self.report_not_owner(me, state);
                        return Err(ThreadError::NotOwner);
                    }
                },
            }
        }
    }

    fn unlock_slow(&self) -> Result<(), ThreadError> {
        let rt = Runtime::get();
        let serializer = rt.serializer()?;
        let handle = waiter::current()?;
        let slot = rt.waiters().slot(handle);
        *slot.pending.lock() = Some(Arc::clone(&self.cell));

        let request =
            Message::with_words(LABEL_UNLOCK, &[self.cell.key(), Word::from(handle.raw())]);
        let mut outcome = call(serializer, request, Timeout::Never, Timeout::Never);
        loop {
            match outcome {
                Ok(ack) if ack.label() == LABEL_ACK => {
                    return if ack.word(0) == UNLOCK_NOT_OWNER {
                        Err(ThreadError::NotOwner)
                    } else {
                        Ok(())
                    };
                }
                Ok(_) => outcome = recv_from(serializer),
                Err(e) if e.is_receive() && e.is_transient() => outcome = recv_from(serializer),
                Err(e) if e.is_transient() => {
                    outcome = call(serializer, request, Timeout::Never, Timeout::Never);
                }
                Err(e) => {
                    slot.pending.lock().take();
                    diag::error("mutex_unlock_ipc_failed", json!({ "error": e.to_string() }));
                    return Err(ThreadError::Ipc(e));
                }
            }
        }
    }

    fn report_not_owner(&self, me: ThreadId, state: MutexState) {
        RuntimeCounters::bump(&Runtime::get().counters().nonowner_unlocks);
        let owner = match state {
            MutexState::Locked { owner, .. } => Some(owner.raw()),
            MutexState::Unlocked => None,
        };
        diag::warn(
            "mutex_unlock_not_owner",
            json!({ "mutex": self.cell.key(), "caller": me.raw(), "owner": owner }),
        );
    }

    /// Locks and returns a guard that unlocks on drop.
    pub fn lock_guard(&self) -> Result<MutexGuard<'_>, ThreadError> {
        self.lock()?;
        Ok(MutexGuard { mutex: self })
    }

    /// `mtx_destroy`. A held lock or queued waiters are reported, not fatal.
    pub fn destroy(self) {
        let busy = self.cell.word.load(Ordering::Acquire) != 0
            || self.cell.head.load(Ordering::Acquire) != 0;
        if busy {
            RuntimeCounters::bump(&Runtime::get().counters().busy_destroys);
            diag::warn(
                "mutex_destroy_busy",
                json!({ "mutex": self.cell.key(), "state": format!("{:?}", self.state()) }),
            );
        }
    }
}

fn recv_from(serializer: ThreadId) -> Result<Message, kestrel_ipc::IpcError> {
    recv(Source::Thread(serializer), Timeout::Never).map(|(_, msg)| msg)
}

/// Holds a [`Mutex`] until dropped.
pub struct MutexGuard<'a> {
    mutex: &'a Mutex,
}

impl MutexGuard<'_> {
    #[must_use]
    pub fn mutex(&self) -> &Mutex {
        self.mutex
    }
}

impl Drop for MutexGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.mutex.unlock() {
            diag::error("mutex_guard_unlock_failed", json!({ "error": e.to_string() }));
        }
    }
}
