use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use kestrel_core::ThreadError;
use kestrel_core::threads::{self, Condvar, Mutex};

fn wait_until(what: &str, cond: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(1));
    }
}

#[derive(Default)]
struct Shared {
    mutex: Mutex,
    cond: Condvar,
    ready: AtomicBool,
    waiting: AtomicUsize,
    woken: AtomicUsize,
}

fn waiter(shared: Arc<Shared>) -> i32 {
    if shared.mutex.lock().is_err() {
        return 1;
    }
    shared.waiting.fetch_add(1, Ordering::SeqCst);
    while !shared.ready.load(Ordering::SeqCst) {
        if shared.cond.wait(&shared.mutex).is_err() {
            return 2;
        }
    }
    shared.woken.fetch_add(1, Ordering::SeqCst);
    i32::from(shared.mutex.unlock().is_err()) * 3
}

#[test]
fn signal_wakes_a_waiter_that_rechecks_its_predicate() {
    let shared = Arc::new(Shared::default());
    let s = Arc::clone(&shared);
    let t = threads::spawn(move || waiter(s)).unwrap();

    wait_until("waiter to block", || shared.waiting.load(Ordering::SeqCst) == 1);
    shared.mutex.lock().unwrap();
    assert!(!shared.cond.is_idle());
    shared.ready.store(true, Ordering::SeqCst);
    shared.cond.signal().unwrap();
    shared.mutex.unlock().unwrap();

    assert_eq!(t.join(), Ok(0));
    assert_eq!(shared.woken.load(Ordering::SeqCst), 1);
    assert!(shared.cond.is_idle());
}

#[test]
fn broadcast_wakes_every_current_waiter() {
    const WAITERS: usize = 4;
    let shared = Arc::new(Shared::default());
    let handles: Vec<_> = (0..WAITERS)
        .map(|_| {
            let s = Arc::clone(&shared);
            threads::spawn(move || waiter(s)).unwrap()
        })
        .collect();

    wait_until("all waiters to block", || {
        shared.waiting.load(Ordering::SeqCst) == WAITERS
    });
    // Each waiter queued itself before releasing the mutex.
    shared.mutex.lock().unwrap();
    shared.ready.store(true, Ordering::SeqCst);
    shared.cond.broadcast().unwrap();
    shared.mutex.unlock().unwrap();

    for h in handles {
        assert_eq!(h.join(), Ok(0));
    }
    assert_eq!(shared.woken.load(Ordering::SeqCst), WAITERS);
}

#[test]
fn broadcast_does_not_reach_later_waiters() {
    let shared = Arc::new(Shared::default());
    shared.cond.broadcast().unwrap();
    shared.cond.signal().unwrap();

    let s = Arc::clone(&shared);
    let t = threads::spawn(move || waiter(s)).unwrap();
    wait_until("waiter to block", || shared.waiting.load(Ordering::SeqCst) == 1);
    shared.mutex.lock().unwrap();
    shared.mutex.unlock().unwrap();
    std::thread::sleep(Duration::from_millis(20));
    assert_eq!(shared.woken.load(Ordering::SeqCst), 0);

    shared.mutex.lock().unwrap();
    shared.ready.store(true, Ordering::SeqCst);
    shared.cond.signal().unwrap();
    shared.mutex.unlock().unwrap();
    assert_eq!(t.join(), Ok(0));
}

#[test]
fn waiting_without_the_mutex_is_rejected() {
    let shared = Shared::default();
    assert_eq!(shared.cond.wait(&shared.mutex), Err(ThreadError::NotOwner));
}

#[test]
fn guard_based_wait_keeps_the_guard() {
    let shared = Arc::new(Shared::default());
    let s = Arc::clone(&shared);
    let t = threads::spawn(move || {
        let Ok(mut guard) = s.mutex.lock_guard() else {
            return 1;
        };
        s.waiting.fetch_add(1, Ordering::SeqCst);
        while !s.ready.load(Ordering::SeqCst) {
            guard = match s.cond.wait_guard(guard) {
                Ok(g) => g,
                Err(_) => return 2,
            };
        }
        drop(guard);
        0
    })
    .unwrap();

    wait_until("waiter to block", || shared.waiting.load(Ordering::SeqCst) == 1);
    {
        let _held = shared.mutex.lock_guard().unwrap();
        shared.ready.store(true, Ordering::SeqCst);
        shared.cond.signal().unwrap();
    }
    assert_eq!(t.join(), Ok(0));
    assert_eq!(shared.mutex.state(), threads::MutexState::Unlocked);
}

#[test]
fn destroy_wakes_waiters_and_fails_later_waits() {
    const WAITERS: usize = 3;
    let shared = Arc::new(Shared::default());
    let handles: Vec<_> = (0..WAITERS)
        .map(|_| {
            let s = Arc::clone(&shared);
            threads::spawn(move || {
                if s.mutex.lock().is_err() {
                    return 1;
                }
                s.waiting.fetch_add(1, Ordering::SeqCst);
                let outcome = loop {
                    match s.cond.wait(&s.mutex) {
                        Ok(()) => continue,
                        Err(e) => break e,
                    }
                };
                let _ = s.mutex.unlock();
                i32::from(outcome != ThreadError::Destroyed) * 4
            })
            .unwrap()
        })
        .collect();

    wait_until("all waiters to block", || {
        shared.waiting.load(Ordering::SeqCst) == WAITERS
    });
    shared.mutex.lock().unwrap();
    shared.cond.destroy().unwrap();
    shared.mutex.unlock().unwrap();

    for h in handles {
        assert_eq!(h.join(), Ok(0));
    }
    shared.mutex.lock().unwrap();
    assert_eq!(shared.cond.wait(&shared.mutex), Err(ThreadError::Destroyed));
    assert!(shared.mutex.is_held_by_current());
    shared.mutex.unlock().unwrap();
}

#[test]
fn waiter_keeps_waiting_through_canceled_and_aborted_receives() {
    let shared = Arc::new(Shared::default());
    let s = Arc::clone(&shared);
    let t = threads::spawn(move || waiter(s)).unwrap();

    wait_until("waiter to block", || shared.waiting.load(Ordering::SeqCst) == 1);
    let id = t.id();
    wait_until("cancel to land", || kestrel_ipc::cancel_ipc(id));
    wait_until("abort to land", || kestrel_ipc::abort_ipc(id));
    assert_eq!(shared.woken.load(Ordering::SeqCst), 0);
    assert!(!shared.cond.is_idle());

    shared.mutex.lock().unwrap();
    shared.ready.store(true, Ordering::SeqCst);
    shared.cond.signal().unwrap();
    shared.mutex.unlock().unwrap();

    assert_eq!(t.join(), Ok(0));
    assert_eq!(shared.woken.load(Ordering::SeqCst), 1);
}
