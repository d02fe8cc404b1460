//! The system broadcaster.
//!
//! Runs in its own address space with two threads. The control thread
//! answers subscription and filter requests immediately and queues
//! broadcasts. The delivery thread calls every matching receiver in turn,
//! folds their deferred flags together and reports back to the control
//! thread, which replies to the broadcasting caller. Keeping the two apart
//! lets a handler running inside a delivery change its subscriptions
//! without deadlocking against the delivery it is part of.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use kestrel_ipc::{ErrorCode, Message, Source, ThreadId, Timeout, Word, call, kernel, recv, send};
use parking_lot::{Condvar, Mutex};
use serde_json::json;

use crate::diag::{self, RuntimeCounters};
use crate::error::ThreadError;
use crate::runtime::Runtime;
use crate::sysmsg::protocol::{
    LABEL_ACK, LABEL_BROADCAST, LABEL_DONE, LABEL_FILTER_ADD, LABEL_FILTER_COMMIT,
    LABEL_FILTER_RESET, LABEL_SHUTDOWN, LABEL_STATUS, LABEL_SUBSCRIBE, deliver_request, matches,
    status_reply,
};
use crate::threads::thread::{Thread, ThreadBuilder};

#[derive(Debug, Default)]
struct Subscriber {
    mask: u32,
    /// Coarse label filter. `None` passes everything.
    filter: Option<HashSet<Word>>,
    staging: Vec<Word>,
}

impl Subscriber {
    fn accepts(&self, body: &[Word]) -> bool {
        match &self.filter {
            None => true,
            Some(labels) => body.first().is_some_and(|label| labels.contains(label)),
        }
    }
}

struct Job {
    caller: ThreadId,
    maskp: u32,
    maskn: u32,
    body: Vec<Word>,
}

#[derive(Default)]
struct Queue {
    jobs: VecDeque<Job>,
    shutdown: bool,
}

#[derive(Default)]
struct Shared {
    subscribers: Mutex<HashMap<ThreadId, Subscriber>>,
    queue: Mutex<Queue>,
    ready: Condvar,
}

/// Handle to a running broadcaster.
pub struct Broadcaster {
    control: Option<Thread>,
    delivery: Option<Thread>,
    control_id: ThreadId,
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Broadcaster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broadcaster")
            .field("control", &self.control_id)
            .field("running", &self.control.is_some())
            .finish()
    }
}

impl Broadcaster {
    /// Creates a fresh space and starts the broadcaster threads in it.
    pub fn start() -> Result<Broadcaster, ThreadError> {
        let space = kernel().create_space();
        let shared = Arc::new(Shared::default());

        let control_shared = Arc::clone(&shared);
        let control = ThreadBuilder::new()
            .name("kestrel-sysmsg-control")
            .space(space)
            .spawn(move || control_loop(&control_shared))?;
        let control_id = control.id();

        let delivery_shared = Arc::clone(&shared);
        let delivery = match ThreadBuilder::new()
            .name("kestrel-sysmsg-delivery")
            .space(space)
            .spawn(move || delivery_loop(&delivery_shared, control_id))
        {
            Ok(thread) => thread,
            Err(e) => {
                if let Err(stop) = call(control_id, Message::new(LABEL_SHUTDOWN), Timeout::Never, Timeout::Never) {
                    diag::debug("sysmsg_shutdown_call_failed", json!({ "error": stop.to_string() }));
                }
                join_logged(&control, "control");
                return Err(e);
            }
        };

        diag::debug("sysmsg_broadcaster_started", json!({ "control": control_id.raw() }));
        Ok(Broadcaster {
            control: Some(control),
            delivery: Some(delivery),
            control_id,
            shared,
        })
    }

    /// The thread clients talk to.
    #[must_use]
    pub fn control_id(&self) -> ThreadId {
        self.control_id
    }

    /// Number of receivers with a non-empty subscription.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.shared
            .subscribers
            .lock()
            .values()
            .filter(|s| s.mask != 0)
            .count()
    }

    /// Stops both threads. Broadcasts still queued fail with no partner.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        let Some(control) = self.control.take() else {
            return;
        };
        if let Err(e) = call(
            self.control_id,
            Message::new(LABEL_SHUTDOWN),
            Timeout::Never,
            Timeout::Never,
        ) {
            diag::debug("sysmsg_shutdown_call_failed", json!({ "error": e.to_string() }));
            self.shared.queue.lock().shutdown = true;
            self.shared.ready.notify_all();
        }
        join_logged(&control, "control");
        if let Some(delivery) = self.delivery.take() {
            join_logged(&delivery, "delivery");
        }
    }
}

fn join_logged(thread: &Thread, role: &str) {
    if let Err(e) = thread.join() {
        diag::debug("sysmsg_thread_join_failed", json!({ "thread": role, "error": e.to_string() }));
    }
}

impl Drop for Broadcaster {
    fn drop(&mut self) {
        self.stop();
    }
}

fn ack(to: ThreadId) {
    if let Err(e) = send(to, Message::new(LABEL_ACK), Timeout::Zero) {
        diag::debug("sysmsg_ack_failed", json!({ "to": to.raw(), "error": e.to_string() }));
    }
}

/// Installs a receiver's mask and staged filter in one step.
fn commit(subscribers: &mut HashMap<ThreadId, Subscriber>, receiver: ThreadId, mask: u32, filtered: bool) {
    if mask == 0 {
        subscribers.remove(&receiver);
        return;
    }
    let sub = subscribers.entry(receiver).or_default();
    let staged = std::mem::take(&mut sub.staging);
    sub.mask = mask;
    sub.filter = filtered.then(|| staged.into_iter().collect());
}

fn control_loop(shared: &Shared) -> i32 {
    loop {
        let (from, msg) = match recv(Source::Any, Timeout::Never) {
            Ok(request) => request,
            Err(e) => {
                diag::debug("sysmsg_control_recv_failed", json!({ "error": e.to_string() }));
                continue;
            }
        };
        match msg.label() {
            LABEL_SUBSCRIBE => {
                let receiver = ThreadId::from_raw(msg.word(0));
                let mask = msg.word(1) as u32;
                let mut subscribers = shared.subscribers.lock();
                if mask == 0 {
                    subscribers.remove(&receiver);
                } else {
                    subscribers.entry(receiver).or_default().mask = mask;
                }
                drop(subscribers);
                ack(from);
            }
            LABEL_FILTER_RESET => {
                let receiver = ThreadId::from_raw(msg.word(0));
                shared
                    .subscribers
                    .lock()
                    .entry(receiver)
                    .or_default()
                    .staging
                    .clear();
                ack(from);
            }
            LABEL_FILTER_ADD => {
                let receiver = ThreadId::from_raw(msg.word(0));
                shared
                    .subscribers
                    .lock()
                    .entry(receiver)
                    .or_default()
                    .staging
                    .extend_from_slice(msg.words().get(1..).unwrap_or_default());
                ack(from);
            }
            LABEL_FILTER_COMMIT => {
                let receiver = ThreadId::from_raw(msg.word(0));
                let enable = msg.word(1) != 0;
                let mask = msg.word(2) as u32;
                commit(&mut shared.subscribers.lock(), receiver, mask, enable);
                ack(from);
            }
            LABEL_BROADCAST => {
                let words = msg.words();
                let job = Job {
                    caller: from,
                    maskp: msg.word(0) as u32,
                    maskn: msg.word(1) as u32,
                    body: words.get(2..).unwrap_or_default().to_vec(),
                };
                shared.queue.lock().jobs.push_back(job);
                shared.ready.notify_one();
            }
            LABEL_DONE => {
                let caller = ThreadId::from_raw(msg.word(0));
                let deferred = msg.word(1) != 0;
                if let Err(e) = send(caller, status_reply(deferred), Timeout::Zero) {
                    diag::debug(
                        "sysmsg_broadcast_reply_failed",
                        json!({ "to": caller.raw(), "error": e.to_string() }),
                    );
                }
            }
            LABEL_SHUTDOWN => {
                // Callers of queued broadcasts see NoPartner once this
                // thread halts.
                {
                    let mut queue = shared.queue.lock();
                    queue.shutdown = true;
                    queue.jobs.clear();
                }
                shared.ready.notify_all();
                ack(from);
                return 0;
            }
            other => diag::warn(
                "sysmsg_control_unknown_request",
                json!({ "from": from.raw(), "label": other }),
            ),
        }
    }
}

fn delivery_loop(shared: &Shared, control: ThreadId) -> i32 {
    loop {
        let job = {
            let mut queue = shared.queue.lock();
            loop {
                if queue.shutdown {
                    return 0;
                }
                if let Some(job) = queue.jobs.pop_front() {
                    break job;
                }
                shared.ready.wait(&mut queue);
            }
        };

        let deferred = deliver(shared, &job);
        let done = Message::with_words(LABEL_DONE, &[job.caller.raw(), Word::from(deferred)]);
        if let Err(e) = send(control, done, Timeout::Never) {
            diag::debug("sysmsg_done_failed", json!({ "error": e.to_string() }));
        }
    }
}

/// Calls every matching receiver. Returns whether any deferred.
fn deliver(shared: &Shared, job: &Job) -> bool {
    let mut targets: Vec<(ThreadId, u32)> = shared
        .subscribers
        .lock()
        .iter()
        .filter(|(_, sub)| matches(sub.mask, job.maskp, job.maskn) && sub.accepts(&job.body))
        .map(|(receiver, sub)| (*receiver, sub.mask & job.maskp))
        .collect();
    targets.sort_unstable_by_key(|(receiver, _)| *receiver);

    let mut deferred = false;
    for (receiver, mask) in targets {
        match call(receiver, deliver_request(mask, &job.body), Timeout::Never, Timeout::Never) {
            Ok(reply) if reply.label() == LABEL_STATUS => {
                RuntimeCounters::bump(&Runtime::get().counters().sysmsg_deliveries);
                deferred |= reply.word(0) != 0;
            }
            Ok(reply) => diag::warn(
                "sysmsg_unexpected_reply",
                json!({ "receiver": receiver.raw(), "label": reply.label() }),
            ),
            Err(e) if e.code == ErrorCode::NoPartner => {
                shared.subscribers.lock().remove(&receiver);
                diag::debug("sysmsg_receiver_gone", json!({ "receiver": receiver.raw() }));
            }
            Err(e) => diag::warn(
                "sysmsg_delivery_failed",
                json!({ "receiver": receiver.raw(), "error": e.to_string() }),
            ),
        }
    }
    deferred
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coarse_filter_passes_listed_labels_only() {
        let mut sub = Subscriber {
            mask: 1,
            ..Subscriber::default()
        };
        assert!(sub.accepts(&[]));
        sub.filter = Some([5, 6].into_iter().collect());
        assert!(sub.accepts(&[5, 0]));
        assert!(!sub.accepts(&[7]));
        assert!(!sub.accepts(&[]));
    }

    #[test]
    fn commit_swaps_mask_and_filter_together() {
        let receiver = ThreadId::from_raw(0x4000 | 1);
        let mut subscribers = HashMap::new();
        commit(&mut subscribers, receiver, 0b01, false);
        assert!(subscribers[&receiver].accepts(&[9]));

        // Staging a filter leaves the live subscription untouched.
        subscribers.entry(receiver).or_default().staging.push(5);
        assert_eq!(subscribers[&receiver].mask, 0b01);
        assert!(subscribers[&receiver].filter.is_none());

        commit(&mut subscribers, receiver, 0b11, true);
        let sub = &subscribers[&receiver];
        assert_eq!(sub.mask, 0b11);
        assert!(sub.accepts(&[5]));
        assert!(!sub.accepts(&[9]));
        assert!(sub.staging.is_empty());

        commit(&mut subscribers, receiver, 0, false);
        assert!(subscribers.is_empty());
    }

    #[test]
    fn start_and_shutdown() {
        let b = Broadcaster::start().unwrap();
        assert!(kernel().exists(b.control_id()));
        assert_eq!(b.subscriber_count(), 0);
        let id = b.control_id();
        b.shutdown();
        assert!(!kernel().exists(id));
    }
}
