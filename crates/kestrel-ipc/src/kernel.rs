//! Hosted microkernel: synchronous rendezvous IPC and thread control.
//!
//! ## Architecture
//!
//! Every kernel thread is backed by one host thread. All kernel state lives
//! behind a single `parking_lot` mutex; each thread record owns a condition
//! variable that the thread parks on while it is blocked in an IPC phase.
//!
//! A send completes only when the receiver takes the message:
//! - if the destination is already receiving from us, the message is
//!   delivered directly into its record;
//! - otherwise the sender queues itself on the destination (FIFO) and parks
//!   until a receive picks it up, the phase times out, it is interrupted, or
//!   the destination goes away.
//!
//! `call` and `reply_wait` switch the caller into its receive phase while
//! still holding the kernel lock, so a reply can never slip in between the
//! two phases.
//!
//! The per-thread UTCB (ids and the user-defined handle word) is kept in
//! host thread-local storage and read without taking the kernel lock.

use std::any::Any;
use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, OnceLock};
use std::thread::JoinHandle;
use std::time::Instant;

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::config::KernelConfig;
use crate::error::{ErrorCode, IpcError, ThreadControlError};
use crate::id::{self, SpaceId, ThreadId};
use crate::message::Message;
use crate::timeout::Timeout;

/// Host stacks below this size are rounded up.
const MIN_HOST_STACK: usize = 64 * 1024;

/// Opaque per-thread word the runtime layer may install in the UTCB.
pub type UserHandle = Arc<dyn Any + Send + Sync>;

/// Initial instruction pointer of a new thread.
pub type Entry = Box<dyn FnOnce() + Send + 'static>;

/// Register state handed to [`Kernel::thread_start`].
pub struct StartRegisters {
    pub stack_size: usize,
    pub user_handle: Option<UserHandle>,
    pub entry: Entry,
    pub name: Option<String>,
}

/// Which senders a receive phase accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    /// Open receive.
    Any,
    /// Closed receive from one thread (local or global id).
    Thread(ThreadId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Accept {
    Any,
    Thread(ThreadId),
}

impl Accept {
    fn accepts(self, from: ThreadId) -> bool {
        match self {
            Self::Any => true,
            Self::Thread(t) => t == from,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunState {
    Created,
    Running,
    Halted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Wait {
    Idle,
    Sending(ThreadId),
    Receiving(Accept),
}

struct ThreadRecord {
    id: ThreadId,
    run: RunState,
    wait: Wait,
    /// Message offered while `wait == Sending`.
    outgoing: Option<Message>,
    /// Receive phase to enter once a queued send is taken.
    then_receive: Option<Accept>,
    /// Message handed over while `wait == Receiving`.
    delivered: Option<(ThreadId, Message)>,
    send_done: Option<Result<(), ErrorCode>>,
    pending_error: Option<ErrorCode>,
    senders: VecDeque<ThreadId>,
    wake: Arc<Condvar>,
    host: Option<JoinHandle<()>>,
}

impl ThreadRecord {
    fn new(id: ThreadId, run: RunState) -> Self {
        Self {
            id,
            run,
            wait: Wait::Idle,
            outgoing: None,
            then_receive: None,
            delivered: None,
            send_done: None,
            pending_error: None,
            senders: VecDeque::new(),
            wake: Arc::new(Condvar::new()),
            host: None,
        }
    }
}

struct SpaceRecord {
    versions: Vec<u16>,
    used: Vec<bool>,
}

impl SpaceRecord {
    fn new(capacity: usize) -> Self {
        Self {
            versions: vec![0; capacity],
            used: vec![false; capacity],
        }
    }
}

struct KernelState {
    threads: HashMap<u64, ThreadRecord>,
    spaces: HashMap<SpaceId, SpaceRecord>,
    next_space: u32,
}

impl KernelState {
    fn record(&self, id: ThreadId) -> Option<&ThreadRecord> {
        self.threads.get(&id.thread_no()).filter(|r| r.id == id)
    }

    fn record_mut(&mut self, id: ThreadId) -> Option<&mut ThreadRecord> {
        self.threads.get_mut(&id.thread_no()).filter(|r| r.id == id)
    }

    /// Normalises `tid` to a live global id, resolving local ids relative to
    /// `space`.
    fn resolve(&self, space: SpaceId, tid: ThreadId) -> Option<ThreadId> {
        if tid.is_local() {
            let no = id::thread_no(space, tid.index());
            self.threads.get(&no).map(|r| r.id)
        } else if tid.is_global() {
            self.record(tid).map(|r| r.id)
        } else {
            None
        }
    }

    fn alloc_slot(&mut self, space: SpaceId, run: RunState) -> Result<ThreadId, ThreadControlError> {
        let rec = self
            .spaces
            .get_mut(&space)
            .ok_or(ThreadControlError::NoSuchSpace(space))?;
        let index = rec
            .used
            .iter()
            .position(|used| !used)
            .ok_or(ThreadControlError::SpaceFull(space))?;
        rec.used[index] = true;
        let version = id::next_version(rec.versions[index]);
        rec.versions[index] = version;
        let tid = ThreadId::global(id::thread_no(space, index), version);
        self.threads
            .insert(tid.thread_no(), ThreadRecord::new(tid, run));
        Ok(tid)
    }

    fn free_slot(&mut self, tid: ThreadId) {
        if let Some(rec) = self.spaces.get_mut(&tid.pid()) {
            if let Some(used) = rec.used.get_mut(tid.index()) {
                *used = false;
            }
        }
    }

    /// Fails every IPC partner of `gone` with `NoPartner`.
    fn fail_partners(&mut self, gone: ThreadId) {
        for rec in self.threads.values_mut() {
            match rec.wait {
                Wait::Receiving(Accept::Thread(t)) if t == gone => {
                    rec.pending_error = Some(ErrorCode::NoPartner);
                    rec.wake.notify_all();
                }
                Wait::Sending(t) if t == gone => {
                    rec.send_done = Some(Err(ErrorCode::NoPartner));
                    rec.outgoing = None;
                    rec.then_receive = None;
                    rec.wait = Wait::Idle;
                    rec.wake.notify_all();
                }
                _ => {}
            }
        }
        if let Some(rec) = self.record_mut(gone) {
            rec.senders.clear();
        }
    }

    fn withdraw(&mut self, target: ThreadId, sender: ThreadId) {
        if let Some(t) = self.record_mut(target) {
            t.senders.retain(|s| *s != sender);
        }
    }
}

/// Per-thread control block readable without entering the kernel.
struct Utcb {
    global: ThreadId,
    space: SpaceId,
    user_handle: Option<UserHandle>,
    adopted: bool,
}

impl Drop for Utcb {
    fn drop(&mut self) {
        kernel().retire(self.global, self.adopted);
    }
}

thread_local! {
    static UTCB: RefCell<Option<Utcb>> = const { RefCell::new(None) };
}

fn with_utcb<R>(f: impl FnOnce(&mut Utcb) -> R) -> R {
    UTCB.with(|cell| {
        let mut slot = cell.borrow_mut();
        let utcb = slot.get_or_insert_with(|| kernel().adopt_current());
        f(utcb)
    })
}

/// The simulated microkernel.
pub struct Kernel {
    state: Mutex<KernelState>,
    config: KernelConfig,
}

/// The process-wide kernel instance.
pub fn kernel() -> &'static Kernel {
    static KERNEL: OnceLock<Kernel> = OnceLock::new();
    KERNEL.get_or_init(|| Kernel::new(KernelConfig::from_env()))
}

impl Kernel {
    fn new(config: KernelConfig) -> Self {
        let mut spaces = HashMap::new();
        spaces.insert(SpaceId::ROOT, SpaceRecord::new(config.space_threads));
        Self {
            state: Mutex::new(KernelState {
                threads: HashMap::new(),
                spaces,
                next_space: SpaceId::ROOT.0 + 1,
            }),
            config,
        }
    }

    #[must_use]
    pub fn config(&self) -> KernelConfig {
        self.config
    }

    fn lock(&self) -> MutexGuard<'_, KernelState> {
        self.state.lock()
    }

    fn adopt_current(&self) -> Utcb {
        let mut st = self.lock();
        match st.alloc_slot(SpaceId::ROOT, RunState::Running) {
            Ok(global) => Utcb {
                global,
                space: SpaceId::ROOT,
                user_handle: None,
                adopted: true,
            },
            Err(e) => panic!("kestrel-ipc: cannot adopt host thread: {e}"),
        }
    }

    /// Called when a host thread's UTCB goes away. Adopted threads are
    /// removed outright; kernel-started threads are halted and stay until
    /// deleted.
    fn retire(&self, tid: ThreadId, adopted: bool) {
        let mut st = self.lock();
        if adopted {
            if st.record(tid).is_some() {
                st.fail_partners(tid);
                st.threads.remove(&tid.thread_no());
                st.free_slot(tid);
            }
        } else {
            Self::halt_locked(&mut st, tid);
        }
    }

    fn halt_locked(st: &mut KernelState, tid: ThreadId) {
        let Some(rec) = st.record_mut(tid) else {
            return;
        };
        if rec.run == RunState::Halted {
            return;
        }
        rec.run = RunState::Halted;
        st.fail_partners(tid);
    }

    // -----------------------------------------------------------------------
    // Spaces and thread control
    // -----------------------------------------------------------------------

    /// Creates a fresh, empty address space.
    pub fn create_space(&self) -> SpaceId {
        let mut st = self.lock();
        let space = SpaceId(st.next_space);
        st.next_space += 1;
        st.spaces
            .insert(space, SpaceRecord::new(self.config.space_threads));
        space
    }

    /// Allocates a thread in `space` without starting it.
    pub fn thread_create(&self, space: SpaceId) -> Result<ThreadId, ThreadControlError> {
        self.lock().alloc_slot(space, RunState::Created)
    }

    /// Sets the initial register state of `tid` and lets it run.
    pub fn thread_start(
        &self,
        tid: ThreadId,
        regs: StartRegisters,
    ) -> Result<(), ThreadControlError> {
        {
            let mut st = self.lock();
            let rec = st
                .record_mut(tid)
                .ok_or(ThreadControlError::NoSuchThread(tid))?;
            if rec.run != RunState::Created {
                return Err(ThreadControlError::AlreadyStarted(tid));
            }
            rec.run = RunState::Running;
        }

        let StartRegisters {
            stack_size,
            user_handle,
            entry,
            name,
        } = regs;
        let mut builder = std::thread::Builder::new().stack_size(stack_size.max(MIN_HOST_STACK));
        if let Some(name) = name {
            builder = builder.name(name);
        }
        let spawned = builder.spawn(move || {
            UTCB.with(|cell| {
                *cell.borrow_mut() = Some(Utcb {
                    global: tid,
                    space: tid.pid(),
                    user_handle,
                    adopted: false,
                });
            });
            let outcome = std::panic::catch_unwind(AssertUnwindSafe(entry));
            kernel().halt(tid);
            if let Err(payload) = outcome {
                std::panic::resume_unwind(payload);
            }
        });

        match spawned {
            Ok(handle) => {
                if let Some(rec) = self.lock().record_mut(tid) {
                    rec.host = Some(handle);
                }
                Ok(())
            }
            Err(e) => {
                let mut st = self.lock();
                Self::halt_locked(&mut st, tid);
                Err(ThreadControlError::Spawn(e.to_string()))
            }
        }
    }

    /// Marks `tid` halted. Partners blocked on it fail with `NoPartner`.
    pub fn halt(&self, tid: ThreadId) {
        Self::halt_locked(&mut self.lock(), tid);
    }

    /// Removes `tid` from the kernel and reaps its host thread. Its slot
    /// becomes reusable under a new version.
    pub fn thread_delete(&self, tid: ThreadId) -> Result<(), ThreadControlError> {
        let me = current();
        let (host, halted) = {
            let mut st = self.lock();
            let global = st
                .resolve(me.pid(), tid)
                .ok_or(ThreadControlError::NoSuchThread(tid))?;
            st.fail_partners(global);
            let Some(mut rec) = st.threads.remove(&global.thread_no()) else {
                return Err(ThreadControlError::NoSuchThread(tid));
            };
            st.free_slot(global);
            (rec.host.take(), rec.run == RunState::Halted)
        };
        if let Some(host) = host {
            // A running host thread cannot be stopped from here; it is left
            // detached and its later IPC fails with NoPartner.
            if halted && host.thread().id() != std::thread::current().id() {
                let _ = host.join();
            }
        }
        Ok(())
    }

    /// Whether `tid` still names a thread (running or halted, not yet
    /// deleted).
    pub fn exists(&self, tid: ThreadId) -> bool {
        let me = current();
        self.lock().resolve(me.pid(), tid).is_some()
    }

    /// Converts a global id in the caller's space to its local form.
    pub fn local_of(&self, tid: ThreadId) -> Option<ThreadId> {
        let me = current();
        if tid.is_local() {
            return self.global_of(tid).map(|_| tid);
        }
        if tid.pid() != me.pid() {
            return None;
        }
        self.lock()
            .record(tid)
            .map(|r| ThreadId::local(r.id.index()))
    }

    /// Converts a local id of the caller's space to its global form.
    pub fn global_of(&self, tid: ThreadId) -> Option<ThreadId> {
        let me = current();
        self.lock().resolve(me.pid(), tid)
    }

    // -----------------------------------------------------------------------
    // IPC
    // -----------------------------------------------------------------------

    /// Generic IPC: an optional send phase followed by an optional receive
    /// phase. When both are present the receive phase starts atomically
    /// with send completion.
    pub fn ipc(
        &self,
        send: Option<(ThreadId, Message, Timeout)>,
        recv: Option<(Source, Timeout)>,
    ) -> Result<Option<(ThreadId, Message)>, IpcError> {
        let me = current();
        let mut st = self.lock();

        let accept = match recv {
            None => None,
            Some((Source::Any, _)) => Some(Accept::Any),
            Some((Source::Thread(from), _)) => match st.resolve(me.pid(), from) {
                Some(g) => Some(Accept::Thread(g)),
                None if send.is_none() => {
                    return Err(IpcError::receive(ErrorCode::NoPartner));
                }
                // The send phase reports the missing partner.
                None => Some(Accept::Thread(from)),
            },
        };

        if let Some((to, msg, snd_timeout)) = send {
            let target = st
                .resolve(me.pid(), to)
                .ok_or(IpcError::send(ErrorCode::NoPartner))?;
            Self::send_phase(&mut st, me, target, msg, snd_timeout, accept)?;
        }

        match (recv, accept) {
            (Some((_, rcv_timeout)), Some(accept)) => {
                Self::recv_phase(&mut st, me, accept, rcv_timeout).map(Some)
            }
            _ => Ok(None),
        }
    }

    fn send_phase(
        st: &mut MutexGuard<'_, KernelState>,
        me: ThreadId,
        target: ThreadId,
        msg: Message,
        timeout: Timeout,
        then: Option<Accept>,
    ) -> Result<(), IpcError> {
        {
            let Some(t) = st.record_mut(target) else {
                return Err(IpcError::send(ErrorCode::NoPartner));
            };
            if t.run == RunState::Halted {
                return Err(IpcError::send(ErrorCode::NoPartner));
            }
            if let Wait::Receiving(accept) = t.wait {
                if accept.accepts(me) {
                    t.delivered = Some((me, msg));
                    t.wait = Wait::Idle;
                    t.wake.notify_all();
                    if let (Some(accept), Some(m)) = (then, st.record_mut(me)) {
                        m.wait = Wait::Receiving(accept);
                    }
                    return Ok(());
                }
            }
        }

        if timeout.is_zero() {
            return Err(IpcError::send(ErrorCode::Timeout));
        }
        let deadline = timeout.deadline();

        {
            let Some(m) = st.record_mut(me) else {
                return Err(IpcError::send(ErrorCode::NoPartner));
            };
            m.wait = Wait::Sending(target);
            m.outgoing = Some(msg);
            m.then_receive = then;
            m.send_done = None;
            m.pending_error = None;
        }
        if let Some(t) = st.record_mut(target) {
            t.senders.push_back(me);
        }

        loop {
            let cv = match st.record(me) {
                Some(m) => Arc::clone(&m.wake),
                None => return Err(IpcError::send(ErrorCode::NoPartner)),
            };
            match deadline {
                None => cv.wait(st),
                Some(d) => {
                    let _ = cv.wait_until(st, d);
                }
            }

            let Some(m) = st.record_mut(me) else {
                return Err(IpcError::send(ErrorCode::NoPartner));
            };
            if let Some(done) = m.send_done.take() {
                return done.map_err(IpcError::send);
            }
            let failure = if let Some(code) = m.pending_error.take() {
                Some(code)
            } else if deadline.is_some_and(|d| Instant::now() >= d) {
                Some(ErrorCode::Timeout)
            } else {
                None
            };
            if let Some(code) = failure {
                m.wait = Wait::Idle;
                m.outgoing = None;
                m.then_receive = None;
                st.withdraw(target, me);
                return Err(IpcError::send(code));
            }
        }
    }

    fn recv_phase(
        st: &mut MutexGuard<'_, KernelState>,
        me: ThreadId,
        accept: Accept,
        timeout: Timeout,
    ) -> Result<(ThreadId, Message), IpcError> {
        let deadline = timeout.deadline();
        loop {
            let Some(m) = st.record_mut(me) else {
                return Err(IpcError::receive(ErrorCode::NoPartner));
            };
            if let Some(delivery) = m.delivered.take() {
                m.wait = Wait::Idle;
                return Ok(delivery);
            }
            if let Some(code) = m.pending_error.take() {
                m.wait = Wait::Idle;
                return Err(IpcError::receive(code));
            }

            if let Some(pos) = m.senders.iter().position(|s| accept.accepts(*s)) {
                let sender = m.senders.remove(pos).unwrap_or(ThreadId::NIL);
                m.wait = Wait::Idle;
                if let Some(s) = st.record_mut(sender) {
                    if s.wait == Wait::Sending(me) {
                        let msg = s.outgoing.take().unwrap_or(Message::new(0));
                        s.send_done = Some(Ok(()));
                        s.pending_error = None;
                        s.wait = match s.then_receive.take() {
                            Some(next) => Wait::Receiving(next),
                            None => Wait::Idle,
                        };
                        s.wake.notify_all();
                        return Ok((sender, msg));
                    }
                }
                continue;
            }

            if let Accept::Thread(partner) = accept {
                let gone = st
                    .record(partner)
                    .is_none_or(|p| p.run == RunState::Halted);
                if gone {
                    if let Some(m) = st.record_mut(me) {
                        m.wait = Wait::Idle;
                    }
                    return Err(IpcError::receive(ErrorCode::NoPartner));
                }
            }

            if deadline.is_some_and(|d| Instant::now() >= d) {
                if let Some(m) = st.record_mut(me) {
                    m.wait = Wait::Idle;
                }
                return Err(IpcError::receive(ErrorCode::Timeout));
            }

            let cv = match st.record_mut(me) {
                Some(m) => {
                    m.wait = Wait::Receiving(accept);
                    Arc::clone(&m.wake)
                }
                None => return Err(IpcError::receive(ErrorCode::NoPartner)),
            };
            match deadline {
                None => cv.wait(st),
                Some(d) => {
                    let _ = cv.wait_until(st, d);
                }
            }
        }
    }

    /// Interrupts an ongoing IPC of `tid` with `code`. Returns whether the
    /// thread was in an IPC phase.
    fn interrupt(&self, tid: ThreadId, code: ErrorCode) -> bool {
        let me = current();
        let mut st = self.lock();
        let Some(global) = st.resolve(me.pid(), tid) else {
            return false;
        };
        let Some(rec) = st.record_mut(global) else {
            return false;
        };
        if rec.wait == Wait::Idle {
            return false;
        }
        rec.pending_error = Some(code);
        rec.wake.notify_all();
        true
    }
}

// ---------------------------------------------------------------------------
// Calling-thread API
// ---------------------------------------------------------------------------

/// Global id of the calling thread. Host threads are adopted on first use.
pub fn current() -> ThreadId {
    with_utcb(|u| u.global)
}

/// Global id of the calling thread if it already has a UTCB. Never adopts
/// and never touches a UTCB that is being torn down.
pub fn try_current() -> Option<ThreadId> {
    UTCB.try_with(|cell| {
        cell.try_borrow()
            .ok()
            .and_then(|slot| slot.as_ref().map(|u| u.global))
    })
    .ok()
    .flatten()
}

/// Local id of the calling thread.
pub fn current_local() -> ThreadId {
    with_utcb(|u| ThreadId::local(u.global.index()))
}

/// Space of the calling thread.
pub fn current_space() -> SpaceId {
    with_utcb(|u| u.space)
}

/// The user-defined handle stored in the caller's UTCB.
pub fn user_handle() -> Option<UserHandle> {
    with_utcb(|u| u.user_handle.clone())
}

/// Replaces the user-defined handle in the caller's UTCB.
pub fn set_user_handle(handle: Option<UserHandle>) {
    with_utcb(|u| u.user_handle = handle);
}

/// Whether two ids name the same thread, normalising mixed forms first.
pub fn same_thread(a: ThreadId, b: ThreadId) -> bool {
    if a == b {
        return true;
    }
    let k = kernel();
    match (k.global_of(a), k.global_of(b)) {
        (Some(x), Some(y)) => x == y,
        _ => false,
    }
}

/// Offers `msg` to `to`.
pub fn send(to: ThreadId, msg: Message, timeout: Timeout) -> Result<(), IpcError> {
    kernel().ipc(Some((to, msg, timeout)), None).map(|_| ())
}

/// Waits for a message.
pub fn recv(from: Source, timeout: Timeout) -> Result<(ThreadId, Message), IpcError> {
    match kernel().ipc(None, Some((from, timeout)))? {
        Some(delivery) => Ok(delivery),
        None => Err(IpcError::receive(ErrorCode::NoPartner)),
    }
}

/// Sends `msg` to `to` and waits for its reply.
pub fn call(
    to: ThreadId,
    msg: Message,
    snd_timeout: Timeout,
    rcv_timeout: Timeout,
) -> Result<Message, IpcError> {
    match kernel().ipc(
        Some((to, msg, snd_timeout)),
        Some((Source::Thread(to), rcv_timeout)),
    )? {
        Some((_, reply)) => Ok(reply),
        None => Err(IpcError::receive(ErrorCode::NoPartner)),
    }
}

/// Replies to `to` without blocking, then waits for the next message from
/// anyone. The error phase tells which half failed.
pub fn reply_wait(
    to: ThreadId,
    msg: Message,
    rcv_timeout: Timeout,
) -> Result<(ThreadId, Message), IpcError> {
    match kernel().ipc(
        Some((to, msg, Timeout::Zero)),
        Some((Source::Any, rcv_timeout)),
    )? {
        Some(delivery) => Ok(delivery),
        None => Err(IpcError::receive(ErrorCode::NoPartner)),
    }
}

/// Cancels an ongoing IPC of `tid` (`Canceled`).
pub fn cancel_ipc(tid: ThreadId) -> bool {
    kernel().interrupt(tid, ErrorCode::Canceled)
}

/// Aborts an ongoing IPC of `tid` (`Aborted`).
pub fn abort_ipc(tid: ThreadId) -> bool {
    kernel().interrupt(tid, ErrorCode::Aborted)
}

/// Gives up the processor.
pub fn yield_now() {
    std::thread::yield_now();
}
