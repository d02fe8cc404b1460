//! Sysmsg client: per-bit handler lists and the receiver thread.
//!
//! Handlers are kept in 32 buckets, one per broadcast bit. A bucket only
//! grows by appending, and closing a handle empties its slot; empty slots
//! are trimmed from the tail only, so positions of live handles never
//! move. A delivery runs the handlers of each set bit, lowest bit first,
//! in registration order within a bit.
//!
//! The receiver thread starts with the first [`Sysmsg::listen`]. While it
//! runs handlers, a TSS flag is set on it so that a handler calling
//! [`Sysmsg::broadcast`] fails with [`SysmsgError::Deadlock`] instead of
//! waiting for a delivery that is waiting for it. Subscription changes go
//! to the broadcaster's control thread, so handlers may listen, filter and
//! close freely.

use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use kestrel_ipc::{ErrorCode, IpcError, Message, Source, ThreadId, Timeout, Word, call, recv, send};
use parking_lot::Mutex;
use serde_json::json;

use crate::diag;
use crate::error::{SysmsgError, ThreadError};
use crate::idl::{self, Dispatch, Reply, ServeOptions};
use crate::once::Once;
use crate::sysmsg::protocol::{
    BroadcastStatus, FILTER_CHUNK, LABEL_ACK, LABEL_DELIVER, LABEL_FILTER_ADD,
    LABEL_FILTER_COMMIT, LABEL_FILTER_RESET, LABEL_STATUS, LABEL_STOP, LABEL_SUBSCRIBE,
    SYSMSG_BITS, broadcast_request, status_reply,
};
use crate::threads::thread::{Thread, ThreadBuilder};
use crate::threads::tss::{SYSMSG_KEY, TssValue, tss_get, tss_set};

const HANDLE_BIT_SHIFT: u32 = 24;
const HANDLE_POS_MASK: u32 = (1 << HANDLE_BIT_SHIFT) - 1;

/// Registration handle: the bit and the position in that bit's list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenHandle(u32);

impl ListenHandle {
    fn new(bit: u32, position: usize) -> Option<Self> {
        let position = u32::try_from(position).ok().filter(|p| *p <= HANDLE_POS_MASK)?;
        Some(Self(bit << HANDLE_BIT_SHIFT | position))
    }

    #[must_use]
    pub const fn bit(self) -> u32 {
        self.0 >> HANDLE_BIT_SHIFT
    }

    #[must_use]
    pub const fn position(self) -> usize {
        (self.0 & HANDLE_POS_MASK) as usize
    }

    #[must_use]
    pub const fn raw(self) -> u32 {
        self.0
    }
}

/// One broadcast as seen by a handler.
pub struct Delivery<'a> {
    /// The bit this handler was registered on.
    pub bit: u32,
    /// Every bit of this client the broadcast targets.
    pub mask: u32,
    pub body: &'a [Word],
    client: &'a Sysmsg,
}

impl Delivery<'_> {
    /// First body word, the label filters match against.
    #[must_use]
    pub fn label(&self) -> Option<Word> {
        self.body.first().copied()
    }

    /// The client that received the broadcast.
    #[must_use]
    pub fn client(&self) -> &Sysmsg {
        self.client
    }
}

/// A handler returns `true` when it deferred its work.
type Handler = dyn Fn(&Delivery<'_>) -> bool + Send + Sync;

struct Listener {
    handler: Box<Handler>,
    filter: Mutex<Option<HashSet<Word>>>,
}

impl Listener {
    fn accepts(&self, body: &[Word]) -> bool {
        match &*self.filter.lock() {
            None => true,
            Some(labels) => body.first().is_some_and(|label| labels.contains(label)),
        }
    }
}

type Bucket = Mutex<Vec<Option<Arc<Listener>>>>;

struct Inner {
    broadcaster: ThreadId,
    buckets: Vec<Bucket>,
    receiver_once: Once,
    receiver: Mutex<Option<Thread>>,
    receiver_id: AtomicU64,
    /// Serialises pushes of the subscription state.
    sync: Mutex<()>,
}

/// Handle to a sysmsg client. Clones share one receiver thread.
#[derive(Clone)]
pub struct Sysmsg {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Sysmsg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sysmsg")
            .field("broadcaster", &self.inner.broadcaster)
            .field("receiver", &self.receiver_id())
            .finish()
    }
}

/// Marker stored under the sysmsg TSS key while handlers run.
struct InHandler;

struct HandlerFlag;

impl HandlerFlag {
    fn raise() -> Result<Self, ThreadError> {
        tss_set(SYSMSG_KEY, Some(Arc::new(InHandler) as TssValue))?;
        Ok(Self)
    }
}

impl Drop for HandlerFlag {
    fn drop(&mut self) {
        if let Err(e) = tss_set(SYSMSG_KEY, None) {
            diag::debug("sysmsg_handler_flag_clear_failed", json!({ "error": e.to_string() }));
        }
    }
}

fn in_handler() -> bool {
    tss_get(SYSMSG_KEY).is_some()
}

impl Sysmsg {
    /// A client of the broadcaster whose control thread is `broadcaster`.
    /// No thread is started until the first [`Sysmsg::listen`].
    #[must_use]
    pub fn connect(broadcaster: ThreadId) -> Sysmsg {
        Sysmsg {
            inner: Arc::new(Inner {
                broadcaster,
                buckets: (0..SYSMSG_BITS).map(|_| Mutex::new(Vec::new())).collect(),
                receiver_once: Once::new(),
                receiver: Mutex::new(None),
                receiver_id: AtomicU64::new(0),
                sync: Mutex::new(()),
            }),
        }
    }

    /// Id of the receiver thread, once started.
    #[must_use]
    pub fn receiver_id(&self) -> Option<ThreadId> {
        match self.inner.receiver_id.load(Ordering::Acquire) {
            0 => None,
            raw => Some(ThreadId::from_raw(raw)),
        }
    }

    /// Registers `handler` for broadcasts on `bit`.
    pub fn listen<F>(&self, bit: u32, handler: F) -> Result<ListenHandle, SysmsgError>
    where
        F: Fn(&Delivery<'_>) -> bool + Send + Sync + 'static,
    {
        let bucket = self
            .inner
            .buckets
            .get(bit as usize)
            .ok_or(SysmsgError::InvalidBit(bit))?;
        self.ensure_receiver()?;
        let handle = {
            let mut list = bucket.lock();
            let handle = ListenHandle::new(bit, list.len()).ok_or(ThreadError::NoMemory)?;
            list.push(Some(Arc::new(Listener {
                handler: Box::new(handler),
                filter: Mutex::new(None),
            })));
            handle
        };
        self.resubscribe()?;
        Ok(handle)
    }

    /// Adds `labels` to the handle's filter. A handle with a filter only
    /// sees broadcasts whose first body word is one of its labels.
    pub fn add_filter(&self, handle: ListenHandle, labels: &[Word]) -> Result<(), SysmsgError> {
        let listener = self.listener(handle)?;
        listener
            .filter
            .lock()
            .get_or_insert_with(HashSet::new)
            .extend(labels.iter().copied());
        self.resubscribe()
    }

    /// Removes `labels` from the handle's filter. Removing the last label
    /// drops the filter, so the handle sees every broadcast again.
    pub fn rm_filter(&self, handle: ListenHandle, labels: &[Word]) -> Result<(), SysmsgError> {
        let listener = self.listener(handle)?;
        {
            let mut filter = listener.filter.lock();
            if let Some(set) = filter.as_mut() {
                for label in labels {
                    set.remove(label);
                }
                if set.is_empty() {
                    *filter = None;
                }
            }
        }
        self.resubscribe()
    }

    /// Unregisters the handle.
    pub fn close(&self, handle: ListenHandle) -> Result<(), SysmsgError> {
        let bucket = self
            .inner
            .buckets
            .get(handle.bit() as usize)
            .ok_or(SysmsgError::BadHandle)?;
        {
            let mut list = bucket.lock();
            let slot = list
                .get_mut(handle.position())
                .ok_or(SysmsgError::BadHandle)?;
            if slot.take().is_none() {
                return Err(SysmsgError::BadHandle);
            }
            while matches!(list.last(), Some(None)) {
                list.pop();
            }
        }
        self.resubscribe()
    }

    /// Sends a broadcast to every subscriber of a bit in `maskp` that
    /// does not subscribe to any bit in `maskn`, and waits until all of
    /// them have handled it.
    pub fn broadcast(
        &self,
        maskp: u32,
        maskn: u32,
        body: &[Word],
    ) -> Result<BroadcastStatus, SysmsgError> {
        if in_handler() {
            diag::warn("sysmsg_broadcast_from_handler", json!({ "maskp": maskp }));
            return Err(SysmsgError::Deadlock);
        }
        let request = broadcast_request(maskp, maskn, body)?;
        let reply = self.control_call(request)?;
        if reply.label() != LABEL_STATUS {
            return Err(SysmsgError::NoBroadcaster);
        }
        Ok(BroadcastStatus::from_deferred(reply.word(0) != 0))
    }

    fn listener(&self, handle: ListenHandle) -> Result<Arc<Listener>, SysmsgError> {
        self.inner
            .buckets
            .get(handle.bit() as usize)
            .and_then(|bucket| bucket.lock().get(handle.position()).cloned().flatten())
            .ok_or(SysmsgError::BadHandle)
    }

    fn ensure_receiver(&self) -> Result<ThreadId, SysmsgError> {
        let inner = &self.inner;
        inner.receiver_once.call_once(|| {
            let weak = Arc::downgrade(inner);
            match ThreadBuilder::new()
                .name("kestrel-sysmsg-receiver")
                .spawn(move || receive_loop(weak))
            {
                Ok(thread) => {
                    inner.receiver_id.store(thread.id().raw(), Ordering::Release);
                    *inner.receiver.lock() = Some(thread);
                }
                Err(e) => diag::error("sysmsg_receiver_start_failed", json!({ "error": e.to_string() })),
            }
        });
        self.receiver_id()
            .ok_or(SysmsgError::Thread(ThreadError::Failed))
    }

    /// Pushes the current bit mask and coarse filter to the broadcaster.
    /// The filter is staged first; the commit then swaps mask and filter
    /// in together.
    fn resubscribe(&self) -> Result<(), SysmsgError> {
        let Some(receiver) = self.receiver_id() else {
            return Ok(());
        };
        let _sync = self.inner.sync.lock();

        let mut mask = 0u32;
        let mut filtered = true;
        let mut labels: HashSet<Word> = HashSet::new();
        for (bit, bucket) in self.inner.buckets.iter().enumerate() {
            for listener in bucket.lock().iter().flatten() {
                mask |= 1 << bit;
                match &*listener.filter.lock() {
                    Some(set) => labels.extend(set.iter().copied()),
                    None => filtered = false,
                }
            }
        }

        let id = receiver.raw();
        self.control_ack(Message::with_words(LABEL_FILTER_RESET, &[id]))?;
        if filtered {
            let labels: Vec<Word> = labels.into_iter().collect();
            for chunk in labels.chunks(FILTER_CHUNK) {
                let mut msg = Message::with_words(LABEL_FILTER_ADD, &[id]);
                for &label in chunk {
                    msg.push(label);
                }
                self.control_ack(msg)?;
            }
        }
        self.control_ack(Message::with_words(
            LABEL_FILTER_COMMIT,
            &[id, Word::from(filtered && mask != 0), Word::from(mask)],
        ))
    }

    fn control_ack(&self, msg: Message) -> Result<(), SysmsgError> {
        let reply = self.control_call(msg)?;
        if reply.label() == LABEL_ACK {
            Ok(())
        } else {
            Err(SysmsgError::NoBroadcaster)
        }
    }

    /// Calls the broadcaster's control thread, riding out interruptions.
    fn control_call(&self, msg: Message) -> Result<Message, SysmsgError> {
        let to = self.inner.broadcaster;
        let mut outcome = call(to, msg, Timeout::Never, Timeout::Never);
        loop {
            match outcome {
                Ok(reply) => return Ok(reply),
                Err(e) if e.code == ErrorCode::NoPartner => return Err(SysmsgError::NoBroadcaster),
                // The request was taken; only the wait for the reply broke.
                Err(e) if e.is_receive() && e.is_transient() => {
                    outcome = recv(Source::Thread(to), Timeout::Never).map(|(_, m)| m);
                }
                Err(e) if e.is_transient() => {
                    outcome = call(to, msg, Timeout::Never, Timeout::Never);
                }
                Err(e) => return Err(SysmsgError::Ipc(e)),
            }
        }
    }

    /// Runs the handlers targeted by `mask`. Returns whether any deferred.
    fn run_handlers(&self, mask: u32, body: &[Word]) -> bool {
        let _flag = match HandlerFlag::raise() {
            Ok(flag) => flag,
            Err(e) => {
                diag::error("sysmsg_handler_flag_failed", json!({ "error": e.to_string() }));
                return false;
            }
        };
        let mut deferred = false;
        for bit in (0..SYSMSG_BITS).filter(|b| mask & (1 << b) != 0) {
            let listeners: Vec<Arc<Listener>> = match self.inner.buckets.get(bit as usize) {
                Some(bucket) => bucket.lock().iter().flatten().cloned().collect(),
                None => continue,
            };
            for listener in listeners {
                if !listener.accepts(body) {
                    continue;
                }
                let delivery = Delivery {
                    bit,
                    mask,
                    body,
                    client: self,
                };
                match std::panic::catch_unwind(AssertUnwindSafe(|| (listener.handler)(&delivery))) {
                    Ok(d) => deferred |= d,
                    Err(_) => diag::error("sysmsg_handler_panicked", json!({ "bit": bit })),
                }
            }
        }
        deferred
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let raw = self.receiver_id.load(Ordering::Acquire);
        if raw == 0 {
            return;
        }
        let receiver = ThreadId::from_raw(raw);
        let unsubscribe = Message::with_words(LABEL_SUBSCRIBE, &[raw, 0]);
        if let Err(e) = call(self.broadcaster, unsubscribe, Timeout::Never, Timeout::Never) {
            diag::debug("sysmsg_unsubscribe_failed", json!({ "error": e.to_string() }));
        }
        let Some(thread) = self.receiver.lock().take() else {
            return;
        };
        if kestrel_ipc::try_current().is_some_and(|me| me == receiver) {
            // Dropped by one of our own handlers; the receiver notices the
            // client is gone and leaves its loop.
            thread.detach();
            return;
        }
        if let Err(e) = stop_receiver(receiver) {
            diag::debug("sysmsg_stop_receiver_failed", json!({ "error": e.to_string() }));
        }
        if let Err(e) = thread.join() {
            diag::debug("sysmsg_receiver_join_failed", json!({ "error": e.to_string() }));
        }
    }
}

fn stop_receiver(receiver: ThreadId) -> Result<(), IpcError> {
    loop {
        match send(receiver, Message::new(LABEL_STOP), Timeout::Never) {
            Err(e) if e.code == ErrorCode::NoPartner => return Ok(()),
            Err(e) if e.is_transient() => continue,
            other => return other,
        }
    }
}

// ---------------------------------------------------------------------------
// Receiver thread
// ---------------------------------------------------------------------------

struct Receiver {
    client: Weak<Inner>,
}

impl Dispatch for Receiver {
    fn dispatch(&mut self, from: ThreadId, request: &Message) -> Reply {
        match request.label() {
            LABEL_STOP => Reply::Exit,
            LABEL_DELIVER => {
                let Some(inner) = self.client.upgrade() else {
                    if let Err(e) = send(from, status_reply(false), Timeout::Zero) {
                        diag::debug("sysmsg_final_reply_failed", json!({ "to": from.raw(), "error": e.to_string() }));
                    }
                    return Reply::Exit;
                };
                let client = Sysmsg { inner };
                let words = request.words();
                let mask = words.first().copied().unwrap_or(0) as u32;
                let body = words.get(1..).unwrap_or_default();
                let reply = status_reply(client.run_handlers(mask, body));
                drop(client);
                if self.client.strong_count() == 0 {
                    if let Err(e) = send(from, reply, Timeout::Zero) {
                        diag::debug("sysmsg_final_reply_failed", json!({ "to": from.raw(), "error": e.to_string() }));
                    }
                    return Reply::Exit;
                }
                Reply::Send(reply)
            }
            other => {
                diag::warn(
                    "sysmsg_receiver_unknown_message",
                    json!({ "from": from.raw(), "label": other }),
                );
                Reply::NoReply
            }
        }
    }
}

fn receive_loop(client: Weak<Inner>) -> i32 {
    let mut receiver = Receiver { client };
    match idl::serve(&mut receiver, ServeOptions::default(), |_| {}) {
        Ok(()) => 0,
        Err(e) => {
            diag::error("sysmsg_receiver_failed", json!({ "error": e.to_string() }));
            1
        }
    }
}
