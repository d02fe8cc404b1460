//! Rollback/confirm protocol for IDL request handlers.
//!
//! A handler may mutate server state before its reply is known to have
//! reached the caller. It registers a rollback that undoes the mutation
//! and, optionally, a confirm that commits it. The dispatch loop reports
//! the outcome of the combined reply-and-receive through
//! [`check_rollback`]:
//!
//! | status                          | effect                                   |
//! |---------------------------------|------------------------------------------|
//! | receive-phase IPC failure       | reply was delivered: confirm, drop rollback |
//! | send-phase IPC failure          | fire the rollback if it belongs to the current call |
//! | anything else                   | reply was delivered: drop rollback       |
//!
//! Confirms are lazy. A pending confirm fires on the next [`sync_confirm`],
//! on a receive-phase failure, or when a later call installs its own
//! confirm. The (sender, tag) match is a best-effort filter; callbacks must
//! still check that the state they touch is what they expect.
//!
//! The context lives in TSS, so every server thread has its own.

use std::sync::Arc;

use kestrel_ipc::{IpcError, MsgTag, ThreadId, Word};
use parking_lot::Mutex;
use serde_json::json;

use crate::diag::{self, RuntimeCounters};
use crate::runtime::Runtime;
use crate::threads::tss::{ROLLBACK_KEY, TssValue, tss_get_as, tss_set};

/// Undo or commit action registered by a handler.
pub type Callback = Box<dyn FnOnce() + Send + 'static>;

// ---------------------------------------------------------------------------
// Dispatch status
// ---------------------------------------------------------------------------

const IPC_FLAG: Word = 1 << 63;

/// Outcome of one dispatch step as seen by the rollback protocol.
///
/// Bit 63 marks an IPC failure, in which case the low bits are the IPC
/// status word. Without it the word is the handler's own result code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DispatchStatus(Word);

impl DispatchStatus {
    pub const OK: DispatchStatus = DispatchStatus(0);

    #[must_use]
    pub const fn from_ipc(err: IpcError) -> Self {
        Self(IPC_FLAG | err.to_word())
    }

    /// A handler-level result code (not an IPC failure).
    #[must_use]
    pub const fn handler(code: u32) -> Self {
        Self(code as Word)
    }

    #[must_use]
    pub const fn from_word(word: Word) -> Self {
        Self(word)
    }

    #[must_use]
    pub const fn to_word(self) -> Word {
        self.0
    }

    #[must_use]
    pub const fn ipc_error(self) -> Option<IpcError> {
        if self.0 & IPC_FLAG == 0 {
            return None;
        }
        IpcError::from_word(self.0 & !IPC_FLAG)
    }
}

impl From<Result<(), IpcError>> for DispatchStatus {
    fn from(result: Result<(), IpcError>) -> Self {
        match result {
            Ok(()) => Self::OK,
            Err(e) => Self::from_ipc(e),
        }
    }
}

// ---------------------------------------------------------------------------
// Per-thread context
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CallId {
    sender: ThreadId,
    tag: Word,
}

struct Pending {
    callback: Callback,
    call: Option<CallId>,
}

#[derive(Default)]
struct RollbackContext {
    call: Option<CallId>,
    rollback: Option<Pending>,
    confirm: Option<Pending>,
}

type SharedContext = Arc<Mutex<RollbackContext>>;

fn context() -> SharedContext {
    if let Some(ctx) = tss_get_as::<Mutex<RollbackContext>>(ROLLBACK_KEY) {
        return ctx;
    }
    let ctx: SharedContext = Arc::new(Mutex::new(RollbackContext::default()));
    if let Err(e) = tss_set(ROLLBACK_KEY, Some(Arc::clone(&ctx) as TssValue)) {
        diag::fatal("rollback_context_install_failed", json!({ "error": e.to_string() }));
    }
    ctx
}

/// Marks the start of dispatching the request `tag` from `sender`.
pub fn begin_dispatch(sender: ThreadId, tag: MsgTag) {
    context().lock().call = Some(CallId {
        sender,
        tag: tag.to_word(),
    });
}

/// Marks the end of a dispatch. A pending confirm stays pending.
pub fn end_dispatch() {
    let stale = {
        let ctx = context();
        let mut ctx = ctx.lock();
        ctx.call = None;
        ctx.rollback.take()
    };
    drop(stale);
}

/// Registers `undo` for the call being dispatched, replacing any earlier
/// registration.
pub fn set_rollback(undo: impl FnOnce() + Send + 'static) {
    let previous = {
        let ctx = context();
        let mut ctx = ctx.lock();
        let call = ctx.call;
        ctx.rollback.replace(Pending {
            callback: Box::new(undo),
            call,
        })
    };
    drop(previous);
}

/// Registers `commit` for the call being dispatched. A confirm still
/// pending from an earlier call is committed first.
pub fn set_confirm(commit: impl FnOnce() + Send + 'static) {
    let ctx = context();
    let earlier = {
        let mut guard = ctx.lock();
        let call = guard.call;
        match guard.confirm.take() {
            Some(old) if old.call != call => Some(old),
            // Same call: the new registration supersedes the old one.
            _ => None,
        }
    };
    if let Some(earlier) = earlier {
        fire_confirm(earlier);
    }
    let mut guard = ctx.lock();
    let call = guard.call;
    guard.confirm = Some(Pending {
        callback: Box::new(commit),
        call,
    });
}

/// Runs the pending confirm, if any, exactly once.
pub fn sync_confirm() {
    let pending = context().lock().confirm.take();
    if let Some(pending) = pending {
        fire_confirm(pending);
    }
}

fn fire_confirm(pending: Pending) {
    RuntimeCounters::bump(&Runtime::get().counters().confirms_fired);
    (pending.callback)();
}

/// Settles the pending rollback for the reply whose outcome is `status`.
/// Returns whether a rollback ran.
pub fn check_rollback(status: DispatchStatus) -> bool {
    let ctx = context();
    match status.ipc_error() {
        Some(err) if err.is_receive() => {
            let dropped = ctx.lock().rollback.take();
            drop(dropped);
            sync_confirm();
            false
        }
        Some(err) => {
            let (rollback, confirm, call) = {
                let mut guard = ctx.lock();
                (guard.rollback.take(), guard.confirm.take(), guard.call)
            };
            match confirm {
                // An earlier call's reply went out before this call arrived.
                Some(earlier) if earlier.call != call => fire_confirm(earlier),
                other => drop(other),
            }
            let Some(rollback) = rollback else {
                return false;
            };
            if rollback.call.is_some() && rollback.call == call {
                RuntimeCounters::bump(&Runtime::get().counters().rollbacks_fired);
                diag::debug(
                    "rollback_fired",
                    json!({ "sender": call.map(|c| c.sender.raw()), "error": err.to_string() }),
                );
                (rollback.callback)();
                true
            } else {
                RuntimeCounters::bump(&Runtime::get().counters().stale_rollbacks);
                diag::warn(
                    "stale_rollback_discarded",
                    json!({
                        "registered_for": rollback.call.map(|c| c.sender.raw()),
                        "current": call.map(|c| c.sender.raw()),
                    }),
                );
                false
            }
        }
        None => {
            let dropped = ctx.lock().rollback.take();
            drop(dropped);
            false
        }
    }
}

/// Whether a rollback is registered on this thread.
#[must_use]
pub fn rollback_pending() -> bool {
    context().lock().rollback.is_some()
}

/// Whether a confirm is registered on this thread.
#[must_use]
pub fn confirm_pending() -> bool {
    context().lock().confirm.is_some()
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_ipc::ErrorCode;
    use std::sync::atomic::{AtomicI64, Ordering};

    fn tag(label: u16) -> MsgTag {
        MsgTag { label, len: 1 }
    }

    fn on_fresh_thread(f: impl FnOnce() + Send + 'static) {
        std::thread::spawn(f).join().unwrap();
    }

    #[test]
    fn status_word_distinguishes_ipc_failures() {
        let err = IpcError::receive(ErrorCode::Canceled);
        let status = DispatchStatus::from_ipc(err);
        assert_eq!(status.ipc_error(), Some(err));
        assert_eq!(DispatchStatus::OK.ipc_error(), None);
        assert_eq!(DispatchStatus::handler(5).ipc_error(), None);
        assert_eq!(DispatchStatus::from_word(status.to_word()), status);
        assert_eq!(DispatchStatus::from(Ok(())), DispatchStatus::OK);
    }

    #[test]
    fn receive_failure_confirms_and_keeps_the_mutation() {
        on_fresh_thread(|| {
            let counter = Arc::new(AtomicI64::new(20));
            let confirmed = Arc::new(AtomicI64::new(0));
            begin_dispatch(ThreadId::local(3), tag(1));
            counter.fetch_sub(4, Ordering::SeqCst);
            let c = Arc::clone(&counter);
            set_rollback(move || {
                c.fetch_add(4, Ordering::SeqCst);
            });
            let k = Arc::clone(&confirmed);
            set_confirm(move || {
                k.fetch_add(1, Ordering::SeqCst);
            });

            let fired = check_rollback(DispatchStatus::from_ipc(IpcError::receive(
                ErrorCode::Canceled,
            )));
            assert!(!fired);
            assert_eq!(counter.load(Ordering::SeqCst), 16);
            assert_eq!(confirmed.load(Ordering::SeqCst), 1);
            assert!(!rollback_pending());
            assert!(!confirm_pending());
        });
    }

    #[test]
    fn send_failure_fires_rollback_for_current_call() {
        on_fresh_thread(|| {
            let counter = Arc::new(AtomicI64::new(20));
            begin_dispatch(ThreadId::local(3), tag(2));
            counter.fetch_sub(16, Ordering::SeqCst);
            let c = Arc::clone(&counter);
            set_rollback(move || {
                c.fetch_add(16, Ordering::SeqCst);
            });
            set_confirm(|| panic!("confirm must not run after a failed reply"));

            let fired =
                check_rollback(DispatchStatus::from_ipc(IpcError::send(ErrorCode::Timeout)));
            assert!(fired);
            assert_eq!(counter.load(Ordering::SeqCst), 20);
            assert!(!confirm_pending());
            sync_confirm();
        });
    }

    #[test]
    fn consumed_rollback_does_not_fire_again() {
        on_fresh_thread(|| {
            let hits = Arc::new(AtomicI64::new(0));
            begin_dispatch(ThreadId::local(3), tag(3));
            let h = Arc::clone(&hits);
            set_rollback(move || {
                h.fetch_add(1, Ordering::SeqCst);
            });
            let failure = DispatchStatus::from_ipc(IpcError::send(ErrorCode::Canceled));
            assert!(check_rollback(failure));
            end_dispatch();

            begin_dispatch(ThreadId::local(4), tag(3));
            assert!(!check_rollback(failure));
            assert_eq!(hits.load(Ordering::SeqCst), 1);
        });
    }

    #[test]
    fn rollback_registered_for_another_call_is_stale() {
        on_fresh_thread(|| {
            let hits = Arc::new(AtomicI64::new(0));
            begin_dispatch(ThreadId::local(3), tag(7));
            let h = Arc::clone(&hits);
            set_rollback(move || {
                h.fetch_add(1, Ordering::SeqCst);
            });
            // A new call begins without the old registration being settled.
            begin_dispatch(ThreadId::local(5), tag(8));
            assert!(!check_rollback(DispatchStatus::from_ipc(IpcError::send(
                ErrorCode::Aborted
            ))));
            assert_eq!(hits.load(Ordering::SeqCst), 0);
            assert!(!rollback_pending());
        });
    }

    #[test]
    fn success_drops_rollback_and_leaves_confirm_lazy() {
        on_fresh_thread(|| {
            let confirmed = Arc::new(AtomicI64::new(0));
            begin_dispatch(ThreadId::local(3), tag(1));
            set_rollback(|| panic!("rollback must not run after success"));
            let k = Arc::clone(&confirmed);
            set_confirm(move || {
                k.fetch_add(1, Ordering::SeqCst);
            });
            assert!(!check_rollback(DispatchStatus::OK));
            assert!(!rollback_pending());
            assert_eq!(confirmed.load(Ordering::SeqCst), 0);
            sync_confirm();
            sync_confirm();
            assert_eq!(confirmed.load(Ordering::SeqCst), 1);
        });
    }

    #[test]
    fn new_confirm_commits_the_earlier_calls_confirm() {
        on_fresh_thread(|| {
            let order = Arc::new(Mutex::new(Vec::new()));
            begin_dispatch(ThreadId::local(3), tag(1));
            let o = Arc::clone(&order);
            set_confirm(move || o.lock().push("first"));
            // Same call: superseded, never fires.
            let o = Arc::clone(&order);
            set_confirm(move || o.lock().push("first-replaced"));
            end_dispatch();

            begin_dispatch(ThreadId::local(3), tag(2));
            let o = Arc::clone(&order);
            set_confirm(move || o.lock().push("second"));
            assert_eq!(*order.lock(), vec!["first-replaced"]);
            sync_confirm();
            assert_eq!(*order.lock(), vec!["first-replaced", "second"]);
        });
    }
}
