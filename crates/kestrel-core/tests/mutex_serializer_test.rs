use std::sync::{Arc, mpsc};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use kestrel_core::threads::{self, Mutex, MutexState, ThreadBuilder};
use kestrel_core::{Runtime, ThreadError};

static TEST_GUARD_HELD: AtomicBool = AtomicBool::new(false);

struct TestGuard;

impl Drop for TestGuard {
    fn drop(&mut self) {
        TEST_GUARD_HELD.store(false, Ordering::Release);
    }
}

fn acquire_test_guard() -> TestGuard {
    loop {
        if TEST_GUARD_HELD
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            return TestGuard;
        }
        std::thread::yield_now();
    }
}

fn wait_until(what: &str, cond: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn contended_increments_are_mutually_exclusive() {
    const THREADS: usize = 6;
    const ROUNDS: usize = 300;

    let mutex = Arc::new(Mutex::new());
    let inside = Arc::new(AtomicBool::new(false));
    let total = Arc::new(AtomicUsize::new(0));

    let workers: Vec<_> = (0..THREADS)
        .map(|_| {
            let mutex = Arc::clone(&mutex);
            let inside = Arc::clone(&inside);
            let total = Arc::clone(&total);
            threads::spawn(move || {
                for _ in 0..ROUNDS {
                    mutex.lock().unwrap();
                    assert!(!inside.swap(true, Ordering::SeqCst), "two owners at once");
                    let seen = total.load(Ordering::Relaxed);
                    std::thread::yield_now();
                    total.store(seen + 1, Ordering::Relaxed);
                    inside.store(false, Ordering::SeqCst);
                    mutex.unlock().unwrap();
                }
                0
            })
            .unwrap()
        })
        .collect();

    for worker in workers {
        assert_eq!(worker.join(), Ok(0));
    }
    assert_eq!(total.load(Ordering::SeqCst), THREADS * ROUNDS);
    assert_eq!(mutex.state(), MutexState::Unlocked);
    assert_eq!(mutex.waiters(), 0);
}

#[test]
fn trylock_from_another_thread_is_busy_while_held() {
    let mutex = Arc::new(Mutex::new());
    mutex.lock().unwrap();

    let m = Arc::clone(&mutex);
    let t = threads::spawn(move || match m.try_lock() {
        Err(ThreadError::Busy) => 0,
        Ok(()) => 1,
        Err(_) => 2,
    })
    .unwrap();
    assert_eq!(t.join(), Ok(0));

    mutex.unlock().unwrap();
    let m = Arc::clone(&mutex);
    let t = threads::spawn(move || {
        if m.try_lock().is_err() {
            return 1;
        }
        i32::from(m.unlock().is_err())
    })
    .unwrap();
    assert_eq!(t.join(), Ok(0));
}

#[test]
fn contended_waiters_are_granted_in_arrival_order() {
    const WAITERS: u32 = 5;

    let mutex = Arc::new(Mutex::new());
    let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
    mutex.lock().unwrap();

    let mut handles = Vec::new();
    for i in 0..WAITERS {
        let m = Arc::clone(&mutex);
        let order = Arc::clone(&order);
        handles.push(
            threads::spawn(move || {
                m.lock().unwrap();
                order.lock().push(i);
                m.unlock().unwrap();
                0
            })
            .unwrap(),
        );
        // Queue position is fixed once the serializer has taken the request.
        wait_until("waiter to queue", || mutex.waiters() == i as usize + 1);
    }

    mutex.unlock().unwrap();
    for h in handles {
        assert_eq!(h.join(), Ok(0));
    }
    assert_eq!(*order.lock(), (0..WAITERS).collect::<Vec<_>>());
    assert_eq!(mutex.state(), MutexState::Unlocked);
}

#[test]
fn unlock_by_non_owner_is_rejected_and_counted() {
    let _guard = acquire_test_guard();
    let before = Runtime::get().snapshot();

    let mutex = Arc::new(Mutex::new());
    mutex.lock().unwrap();
    let m = Arc::clone(&mutex);
    let t = threads::spawn(move || match m.unlock() {
        Err(ThreadError::NotOwner) => 0,
        _ => 1,
    })
    .unwrap();
    assert_eq!(t.join(), Ok(0));
    assert!(mutex.is_held_by_current());
    mutex.unlock().unwrap();

    let delta = Runtime::get().snapshot().since(&before);
    assert!(delta.nonowner_unlocks >= 1);
}

#[test]
fn handoff_goes_through_the_serializer() {
    let _guard = acquire_test_guard();
    let before = Runtime::get().snapshot();

    let mutex = Arc::new(Mutex::new());
    let acquired = Arc::new(AtomicU32::new(0));
    mutex.lock().unwrap();
    let m = Arc::clone(&mutex);
    let a = Arc::clone(&acquired);
    let t = threads::spawn(move || {
        m.lock().unwrap();
        a.store(1, Ordering::SeqCst);
        m.unlock().unwrap();
        0
    })
    .unwrap();
    wait_until("waiter to queue", || mutex.waiters() == 1);
    assert_eq!(acquired.load(Ordering::SeqCst), 0);
    mutex.unlock().unwrap();
    assert_eq!(t.join(), Ok(0));
    assert_eq!(acquired.load(Ordering::SeqCst), 1);

    let delta = Runtime::get().snapshot().since(&before);
    assert!(delta.slow_locks >= 1);
    assert!(delta.handoffs >= 1);
}

#[test]
fn destroying_a_held_mutex_is_reported() {
    let _guard = acquire_test_guard();
    let before = Runtime::get().snapshot();
    let mutex = Mutex::new();
    mutex.lock().unwrap();
    mutex.destroy();
    let delta = Runtime::get().snapshot().since(&before);
    assert!(delta.busy_destroys >= 1);
}

#[test]
fn mutex_refuses_threads_from_another_space() {
    let home = kestrel_ipc::kernel().create_space();
    let away = kestrel_ipc::kernel().create_space();
    let (tx, rx) = mpsc::channel::<Arc<Mutex>>();
    let release = Arc::new(AtomicBool::new(false));

    let r = Arc::clone(&release);
    let owner = ThreadBuilder::new()
        .space(home)
        .spawn(move || {
            let mutex = Arc::new(Mutex::new());
            if mutex.lock().is_err() || tx.send(Arc::clone(&mutex)).is_err() {
                return 2;
            }
            while !r.load(Ordering::Acquire) {
                std::thread::yield_now();
            }
            i32::from(mutex.unlock().is_ok())
        })
        .unwrap();

    let mutex = rx.recv_timeout(Duration::from_secs(10)).unwrap();
    assert_eq!(mutex.space(), home);

    // The first thread of each fresh space has the same local id.
    let m = Arc::clone(&mutex);
    let intruder = ThreadBuilder::new()
        .space(away)
        .spawn(move || {
            let results = [m.try_lock(), m.lock(), m.unlock()];
            i32::from(results.iter().all(|r| *r == Err(ThreadError::Invalid)))
        })
        .unwrap();
    assert_eq!(intruder.join(), Ok(1));
    assert_eq!(mutex.lock(), Err(ThreadError::Invalid));
    assert!(matches!(mutex.state(), MutexState::Locked { .. }));

    release.store(true, Ordering::Release);
    assert_eq!(owner.join(), Ok(1));
    assert_eq!(mutex.state(), MutexState::Unlocked);
}

#[test]
fn queued_locker_survives_canceled_and_aborted_waits() {
    let mutex = Arc::new(Mutex::new());
    mutex.lock().unwrap();

    let m = Arc::clone(&mutex);
    let locker = threads::spawn(move || {
        if m.lock().is_err() {
            return 1;
        }
        if m.unlock().is_err() {
            return 2;
        }
        5
    })
    .unwrap();
    wait_until("locker to queue", || mutex.waiters() == 1);

    let id = locker.id();
    wait_until("cancel to land", || kestrel_ipc::cancel_ipc(id));
    wait_until("abort to land", || kestrel_ipc::abort_ipc(id));
    assert_eq!(mutex.waiters(), 1);
    assert!(mutex.is_held_by_current());

    mutex.unlock().unwrap();
    assert_eq!(locker.join(), Ok(5));
    assert_eq!(mutex.state(), MutexState::Unlocked);
}
