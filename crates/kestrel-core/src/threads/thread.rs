//! Thread creation, exit and join.
//!
//! ## Architecture
//!
//! Each runtime thread gets:
//! - A stack region reserved at creation and owned by its control block
//!   until the thread is joined.
//! - A [`ThreadControl`] installed as the kernel thread's UTCB user handle,
//!   holding the return value, the `alive` flag, the joiner slot and the
//!   thread's TSS table.
//!
//! The joiner slot is a tri-state word: [`JOINER_NONE`], the global id of
//! the thread waiting in `join`, or [`JOINER_EXITED`]. Exit and the first
//! join both try to move it away from `JOINER_NONE`; whichever wins decides
//! whether the result travels by IPC (joiner won) or is read from the
//! control block later (exit won).
//!
//! Host threads that were not started by the runtime get a control block on
//! first use. They cannot be joined and do not run TSS destructors.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::time::Duration;

use kestrel_ipc::{
    ErrorCode, Message, SpaceId, Source, StartRegisters, ThreadId, Timeout, UserHandle,
    current_space, kernel, recv, same_thread, send,
};
use parking_lot::Mutex;
use serde_json::json;

use crate::config::MIN_STACK_SIZE;
use crate::diag::{self, RuntimeCounters};
use crate::error::ThreadError;
use crate::runtime::Runtime;
use crate::threads::tss::TssTable;

/// Label of the exit message sent to a registered joiner.
pub(crate) const LABEL_EXIT: u16 = 0x4558;

/// Joiner slot: nobody has joined yet and the thread is still running.
pub const JOINER_NONE: u64 = 0;
/// Joiner slot: the thread exited before anyone joined.
pub const JOINER_EXITED: u64 = u64::MAX;

/// Exit code reported for a thread whose entry panicked.
pub const PANIC_EXIT_CODE: i32 = -1;

// ---------------------------------------------------------------------------
// Control block
// ---------------------------------------------------------------------------

/// Per-thread control block.
pub struct ThreadControl {
    tid: ThreadId,
    stack: Mutex<Option<Vec<u8>>>,
    result: AtomicI32,
    alive: AtomicBool,
    joiner: AtomicU64,
    reaped: AtomicBool,
    managed: bool,
    tss: TssTable,
}

impl ThreadControl {
    fn new(tid: ThreadId, stack: Option<Vec<u8>>, managed: bool) -> Self {
        Self {
            tid,
            stack: Mutex::new(stack),
            result: AtomicI32::new(0),
            alive: AtomicBool::new(true),
            joiner: AtomicU64::new(JOINER_NONE),
            reaped: AtomicBool::new(false),
            managed,
            tss: TssTable::default(),
        }
    }

    /// Control block of the calling thread, created on first use for host
    /// threads the runtime did not start.
    pub(crate) fn current() -> Arc<ThreadControl> {
        if let Some(control) = kestrel_ipc::user_handle().and_then(downcast_control) {
            return control;
        }
        let control = Arc::new(ThreadControl::new(kestrel_ipc::current(), None, false));
        kestrel_ipc::set_user_handle(Some(Arc::clone(&control) as UserHandle));
        control
    }

    pub(crate) fn tss(&self) -> &TssTable {
        &self.tss
    }

    #[must_use]
    pub fn id(&self) -> ThreadId {
        self.tid
    }

    /// Whether the thread was started by the runtime (and so can be joined).
    #[must_use]
    pub fn is_managed(&self) -> bool {
        self.managed
    }

    /// Size of the stack region still owned by this control block.
    #[must_use]
    pub fn stack_reserved(&self) -> usize {
        self.stack.lock().as_ref().map_or(0, Vec::capacity)
    }
}

fn downcast_control(handle: UserHandle) -> Option<Arc<ThreadControl>> {
    let any: Arc<dyn Any + Send + Sync> = handle;
    any.downcast::<ThreadControl>().ok()
}

// ---------------------------------------------------------------------------
// Thread handle
// ---------------------------------------------------------------------------

/// Handle to a runtime thread. Equality compares thread identity.
#[derive(Clone)]
pub struct Thread {
    control: Arc<ThreadControl>,
}

impl PartialEq for Thread {
    fn eq(&self, other: &Self) -> bool {
        same_thread(self.control.tid, other.control.tid)
    }
}

impl Eq for Thread {}

impl std::fmt::Debug for Thread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Thread")
            .field("tid", &self.control.tid)
            .field("alive", &self.control.alive.load(Ordering::Relaxed))
            .finish()
    }
}

/// Unwind payload used by [`exit`].
struct ExitRequest(i32);

/// Configures and starts a thread.
#[derive(Debug, Default, Clone)]
pub struct ThreadBuilder {
    stack_size: Option<usize>,
    name: Option<String>,
    space: Option<SpaceId>,
}

impl ThreadBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stack size in bytes. Rounded up to the runtime minimum.
    #[must_use]
    pub fn stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = Some(bytes);
        self
    }

    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Creates the thread in `space` instead of the caller's space.
    #[must_use]
    pub fn space(mut self, space: SpaceId) -> Self {
        self.space = Some(space);
        self
    }

    /// Allocates the stack, creates the kernel thread and starts it at the
    /// runtime trampoline. The value `entry` returns becomes the exit code.
    pub fn spawn<F>(self, entry: F) -> Result<Thread, ThreadError>
    where
        F: FnOnce() -> i32 + Send + 'static,
    {
        let rt = Runtime::get();
        let stack_size = self
            .stack_size
            .unwrap_or(rt.config().stack_size)
            .max(MIN_STACK_SIZE);

        let mut stack = Vec::new();
        stack
            .try_reserve_exact(stack_size)
            .map_err(|_| ThreadError::NoMemory)?;

        let k = kernel();
        let space = self.space.unwrap_or_else(current_space);
        let tid = k.thread_create(space)?;

        let control = Arc::new(ThreadControl::new(tid, Some(stack), true));
        let child = Arc::clone(&control);
        let regs = StartRegisters {
            stack_size,
            user_handle: Some(Arc::clone(&control) as UserHandle),
            entry: Box::new(move || trampoline(&child, entry)),
            name: self.name,
        };
        if let Err(e) = k.thread_start(tid, regs) {
            if let Err(del) = k.thread_delete(tid) {
                diag::debug("thread_delete_failed", json!({ "tid": tid.raw(), "error": del.to_string() }));
            }
            diag::error("thread_start_failed", json!({ "tid": tid.raw(), "error": e.to_string() }));
            return Err(e.into());
        }
        Ok(Thread { control })
    }
}

fn trampoline<F>(control: &ThreadControl, entry: F)
where
    F: FnOnce() -> i32,
{
    let code = match std::panic::catch_unwind(AssertUnwindSafe(entry)) {
        Ok(code) => code,
        Err(payload) => match payload.downcast::<ExitRequest>() {
            Ok(request) => request.0,
            Err(payload) => {
                let message = payload
                    .downcast_ref::<&str>()
                    .map(|s| (*s).to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_default();
                RuntimeCounters::bump(&Runtime::get().counters().thread_panics);
                diag::error(
                    "thread_panicked",
                    json!({ "tid": control.tid.raw(), "message": message }),
                );
                PANIC_EXIT_CODE
            }
        },
    };
    finish(control, code);
}

/// Exit protocol: TSS destructors, publish the result, then settle the
/// joiner slot. Returning lets the kernel halt the thread.
fn finish(control: &ThreadControl, code: i32) {
    let rt = Runtime::get();
    control.tss.run_exit(rt.tss());
    control.result.store(code, Ordering::Release);
    control.alive.store(false, Ordering::Release);

    match control.joiner.compare_exchange(
        JOINER_NONE,
        JOINER_EXITED,
        Ordering::AcqRel,
        Ordering::Acquire,
    ) {
        Ok(_) => {}
        Err(joiner) => {
            let msg = Message::with_words(LABEL_EXIT, &[u64::from(code as u32)]);
            let timeout = Timeout::After(rt.config().exit_notify_timeout());
            if let Err(e) = send(ThreadId::from_raw(joiner), msg, timeout) {
                // The joiner sees NoPartner once this thread halts and falls
                // back to the cached result.
                diag::debug(
                    "exit_notify_failed",
                    json!({ "tid": control.tid.raw(), "joiner": joiner, "error": e.to_string() }),
                );
            }
        }
    }
}

impl Thread {
    /// Handle of the calling thread.
    #[must_use]
    pub fn current() -> Thread {
        Thread {
            control: ThreadControl::current(),
        }
    }

    #[must_use]
    pub fn id(&self) -> ThreadId {
        self.control.tid
    }

    /// Whether the thread has not finished yet.
    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.control.alive.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn control(&self) -> &ThreadControl {
        &self.control
    }

    /// Waits for the thread to exit and returns its exit code.
    ///
    /// Correct whether called before or after the thread exits. If another
    /// thread is already the registered joiner, waits for the thread to be
    /// reaped and returns the cached result. Joining an already reaped
    /// thread reports [`ThreadError::NotFound`].
    pub fn join(&self) -> Result<i32, ThreadError> {
        let control = &self.control;
        if !control.managed {
            return Err(ThreadError::Invalid);
        }
        let me = kestrel_ipc::current();
        if same_thread(me, control.tid) {
            return Err(ThreadError::Deadlock);
        }
        if control.reaped.load(Ordering::Acquire) {
            return Err(ThreadError::NotFound);
        }

        let code = match control.joiner.compare_exchange(
            JOINER_NONE,
            me.raw(),
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => self.wait_exit_message()?,
            Err(JOINER_EXITED) => control.result.load(Ordering::Acquire),
            Err(_) => {
                // Someone else is the joiner: wait for the thread to vanish.
                while kernel().exists(control.tid) {
                    kestrel_ipc::yield_now();
                }
                if control.alive.load(Ordering::Acquire) {
                    return Err(ThreadError::NotFound);
                }
                return Ok(control.result.load(Ordering::Acquire));
            }
        };
        self.reap();
        Ok(code)
    }

    fn wait_exit_message(&self) -> Result<i32, ThreadError> {
        let control = &self.control;
        loop {
            match recv(Source::Thread(control.tid), Timeout::Never) {
                Ok((_, msg)) if msg.label() == LABEL_EXIT => return Ok(msg.word(0) as u32 as i32),
                Ok(_) => continue,
                Err(e) if e.code == ErrorCode::NoPartner => {
                    return if control.alive.load(Ordering::Acquire) {
                        Err(ThreadError::NotFound)
                    } else {
                        Ok(control.result.load(Ordering::Acquire))
                    };
                }
                Err(e) if e.is_transient() => continue,
                Err(e) => return Err(ThreadError::Ipc(e)),
            }
        }
    }

    /// Frees the stack and the kernel thread exactly once.
    fn reap(&self) {
        let control = &self.control;
        if control.reaped.swap(true, Ordering::AcqRel) {
            return;
        }
        drop(control.stack.lock().take());
        if let Err(e) = kernel().thread_delete(control.tid) {
            diag::debug("thread_reap_failed", json!({ "tid": control.tid.raw(), "error": e.to_string() }));
        }
    }

    /// Gives up the right to join. Resources are reclaimed when the process
    /// ends.
    pub fn detach(self) {}
}

/// Starts a thread with default settings.
pub fn spawn<F>(entry: F) -> Result<Thread, ThreadError>
where
    F: FnOnce() -> i32 + Send + 'static,
{
    ThreadBuilder::new().spawn(entry)
}

/// Terminates the calling runtime thread with `code`.
///
/// Unwinds to the thread trampoline, which runs the exit protocol. On a
/// host thread the runtime did not start, the unwind ends that host thread.
pub fn exit(code: i32) -> ! {
    std::panic::resume_unwind(Box::new(ExitRequest(code)))
}

pub fn yield_now() {
    kestrel_ipc::yield_now();
}

/// Timed sleep is not provided by this runtime.
pub fn sleep(_duration: Duration) -> Result<(), ThreadError> {
    Err(ThreadError::Unsupported)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn returned_value_reaches_joiner() {
        let t = spawn(|| 42).unwrap();
        assert_eq!(t.join(), Ok(42));
    }

    #[test]
    fn second_join_is_not_found() {
        let t = spawn(|| 3).unwrap();
        assert_eq!(t.join(), Ok(3));
        assert_eq!(t.join(), Err(ThreadError::NotFound));
    }

    #[test]
    fn exit_from_nested_call_unwinds_to_trampoline() {
        fn deep(n: u32) -> i32 {
            if n == 0 {
                exit(-7);
            }
            deep(n - 1) + 1
        }
        let t = spawn(|| deep(5)).unwrap();
        assert_eq!(t.join(), Ok(-7));
    }

    #[test]
    fn stack_is_released_by_join() {
        let t = ThreadBuilder::new()
            .stack_size(128 * 1024)
            .spawn(|| 0)
            .unwrap();
        assert!(t.control().stack_reserved() >= 128 * 1024);
        t.join().unwrap();
        assert_eq!(t.control().stack_reserved(), 0);
    }

    #[test]
    fn host_threads_are_not_joinable() {
        let me = Thread::current();
        assert!(!me.control().is_managed());
        assert_eq!(me.join(), Err(ThreadError::Invalid));
        assert_eq!(Thread::current(), me);
    }

    #[test]
    fn sleep_is_unsupported() {
        assert_eq!(sleep(Duration::from_millis(1)), Err(ThreadError::Unsupported));
    }
}
