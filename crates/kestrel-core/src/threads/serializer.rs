//! The lock-serializer thread.
//!
//! One per space (process), started by the first contended lock there. It
//! is the only code that touches a mutex's wait queue, so the queue links
//! need no synchronisation beyond the serializer's own program order.
//!
//! Protocol (every request carries `[mutex key, waiter handle]`; the
//! requester's waiter slot holds the mutex cell itself):
//! - `LABEL_LOCK`: grant now if the word is free, otherwise mark the word
//!   contended and append the requester to the queue. The grant
//!   (`LABEL_GRANT`) is sent when ownership reaches the requester.
//! - `LABEL_UNLOCK`: hand the lock to the queue head, or clear the word if
//!   nobody waits, then answer `LABEL_ACK` with `[0]` or
//!   `[UNLOCK_NOT_OWNER]`. The new owner is granted before the unlocker is
//!   acknowledged.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use kestrel_ipc::{ErrorCode, Message, Source, ThreadId, Timeout, Word, recv, same_thread, send};
use serde_json::json;

use crate::diag::{self, RuntimeCounters};
use crate::runtime::Runtime;
use crate::threads::mutex::{MutexCell, MutexState};
use crate::threads::waiter::{WaiterHandle, WaiterSlot};

pub(crate) const LABEL_LOCK: u16 = b'L' as u16;
pub(crate) const LABEL_UNLOCK: u16 = b'U' as u16;
pub(crate) const LABEL_GRANT: u16 = b'G' as u16;
pub(crate) const LABEL_ACK: u16 = b'A' as u16;

pub(crate) const UNLOCK_NOT_OWNER: Word = 1;

/// Serializer thread body. Never returns.
pub(crate) fn run() -> i32 {
    diag::debug("lock_serializer_started", json!({ "tid": kestrel_ipc::current().raw() }));
    loop {
        match recv(Source::Any, Timeout::Never) {
            Ok((from, msg)) => match msg.label() {
                LABEL_LOCK => handle_lock(from, &msg),
                LABEL_UNLOCK => handle_unlock(from, &msg),
                other => diag::warn(
                    "lock_serializer_unknown_request",
                    json!({ "from": from.raw(), "label": other }),
                ),
            },
            Err(e) => diag::debug("lock_serializer_recv_failed", json!({ "error": e.to_string() })),
        }
    }
}

/// Resolves the waiter slot and mutex cell named by a request.
fn request_target(
    from: ThreadId,
    msg: &Message,
) -> Option<(WaiterHandle, &'static WaiterSlot, Arc<MutexCell>)> {
    let (handle, slot) = Runtime::get().waiters().lookup(msg.word(1))?;
    // Owner ids in the word are local to this space.
    if slot.tid().pid() != kestrel_ipc::current_space() || !same_thread(slot.tid(), from) {
        return None;
    }
    let cell = slot.pending.lock().take()?;
    (cell.key() == msg.word(0)).then_some((handle, slot, cell))
}

fn reject(from: ThreadId, msg: &Message) {
    diag::error(
        "lock_serializer_bad_request",
        json!({ "from": from.raw(), "label": msg.label(), "words": msg.words() }),
    );
}

fn handle_lock(from: ThreadId, msg: &Message) {
    let Some((handle, slot, cell)) = request_target(from, msg) else {
        return reject(from, msg);
    };
    let me = slot.local();
    let mut current = cell.word.load(Ordering::Acquire);
    loop {
        let next = match MutexState::decode(current) {
            MutexState::Unlocked => MutexState::held_by(me),
            MutexState::Locked { owner, .. } => MutexState::Locked {
                owner,
                conflict: true,
            },
        };
        match cell.word.compare_exchange(
            current,
            next.encode(),
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => break,
            Err(actual) => current = actual,
        }
    }

    if MutexState::decode(current) == MutexState::Unlocked {
        grant(from);
        return;
    }
    enqueue(&cell, handle, slot);
}

fn enqueue(cell: &MutexCell, handle: WaiterHandle, slot: &WaiterSlot) {
    let waiters = Runtime::get().waiters();
    slot.mutex_next.store(0, Ordering::Relaxed);
    match WaiterHandle::from_raw(cell.tail.load(Ordering::Relaxed)) {
        Some(tail) => waiters
            .slot(tail)
            .mutex_next
            .store(handle.raw(), Ordering::Relaxed),
        None => cell.head.store(handle.raw(), Ordering::Release),
    }
    cell.tail.store(handle.raw(), Ordering::Relaxed);
    cell.queued.fetch_add(1, Ordering::Release);
}

fn dequeue(cell: &MutexCell) -> Option<&'static WaiterSlot> {
    let waiters = Runtime::get().waiters();
    let head = WaiterHandle::from_raw(cell.head.load(Ordering::Relaxed))?;
    let slot = waiters.slot(head);
    let next = slot.mutex_next.swap(0, Ordering::Relaxed);
    cell.head.store(next, Ordering::Release);
    if next == 0 {
        cell.tail.store(0, Ordering::Relaxed);
    }
    cell.queued.fetch_sub(1, Ordering::Release);
    Some(slot)
}

fn handle_unlock(from: ThreadId, msg: &Message) {
    let Some((_, slot, cell)) = request_target(from, msg) else {
        return reject(from, msg);
    };
    let me = slot.local();
    let status = match cell.state() {
        MutexState::Locked { owner, .. } if owner == me => {
            hand_off(&cell);
            0
        }
        state => {
            RuntimeCounters::bump(&Runtime::get().counters().nonowner_unlocks);
            diag::warn(
                "mutex_unlock_not_owner",
                json!({ "mutex": cell.key(), "caller": me.raw(), "state": format!("{state:?}") }),
            );
            UNLOCK_NOT_OWNER
        }
    };
    if let Err(e) = send(from, Message::with_words(LABEL_ACK, &[status]), Timeout::Never) {
        diag::debug("unlock_ack_failed", json!({ "to": from.raw(), "error": e.to_string() }));
    }
}

/// Moves ownership to the next live waiter, or frees the word.
fn hand_off(cell: &MutexCell) {
    let counters = Runtime::get().counters();
    while let Some(next) = dequeue(cell) {
        let remaining = cell.head.load(Ordering::Relaxed) != 0;
        cell.word.store(
            MutexState::Locked {
                owner: next.local(),
                conflict: remaining,
            }
            .encode(),
            Ordering::Release,
        );
        RuntimeCounters::bump(&counters.handoffs);
        match grant_waiter(next.tid()) {
            Ok(()) => return,
            Err(code) => diag::warn(
                "mutex_handoff_skipped_waiter",
                json!({ "mutex": cell.key(), "waiter": next.tid().raw(), "error": format!("{code:?}") }),
            ),
        }
    }
    // Queue is empty: lockers racing in only ever add CONFLICT, and they will
    // find the word free when their request arrives.
    cell.word.store(MutexState::Unlocked.encode(), Ordering::Release);
}

fn grant(to: ThreadId) {
    if let Err(code) = grant_waiter(to) {
        diag::warn("mutex_grant_failed", json!({ "to": to.raw(), "error": format!("{code:?}") }));
    }
}

/// Delivers a grant, retrying interruptions. Fails only if the waiter is
/// gone.
fn grant_waiter(to: ThreadId) -> Result<(), ErrorCode> {
    loop {
        match send(to, Message::new(LABEL_GRANT), Timeout::Never) {
            Ok(()) => return Ok(()),
            Err(e) if e.is_transient() => continue,
            Err(e) => return Err(e.code),
        }
    }
}
