use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use kestrel_core::ThreadError;
use kestrel_core::threads::{self, ThreadBuilder, TssValue, tss_create, tss_delete, tss_get_as, tss_set};

fn wait_until(what: &str, cond: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn join_before_exit_blocks_until_the_code_arrives() {
    let release = Arc::new(AtomicBool::new(false));
    let r = Arc::clone(&release);
    let t = threads::spawn(move || {
        while !r.load(Ordering::Acquire) {
            threads::yield_now();
        }
        17
    })
    .unwrap();

    let setter = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(20));
        release.store(true, Ordering::Release);
    });
    assert_eq!(t.join(), Ok(17));
    setter.join().unwrap();
    assert!(!t.is_alive());
}

#[test]
fn join_after_exit_returns_the_cached_code() {
    let t = threads::spawn(|| 5).unwrap();
    wait_until("thread to finish", || !t.is_alive());
    assert_eq!(t.join(), Ok(5));
}

#[test]
fn second_join_reports_not_found() {
    let t = threads::spawn(|| 3).unwrap();
    assert_eq!(t.join(), Ok(3));
    assert_eq!(t.join(), Err(ThreadError::NotFound));
}

#[test]
fn exit_code_comes_from_explicit_exit() {
    let t = threads::spawn(|| {
        threads::exit(42);
    })
    .unwrap();
    assert_eq!(t.join(), Ok(42));
}

#[test]
fn negative_exit_codes_survive_the_notification() {
    let t = threads::spawn(|| -7).unwrap();
    assert_eq!(t.join(), Ok(-7));
}

#[test]
fn two_joiners_both_see_the_result() {
    let release = Arc::new(AtomicBool::new(false));
    let r = Arc::clone(&release);
    let target = Arc::new(
        threads::spawn(move || {
            while !r.load(Ordering::Acquire) {
                threads::yield_now();
            }
            9
        })
        .unwrap(),
    );

    let joiners: Vec<_> = (0..2)
        .map(|_| {
            let target = Arc::clone(&target);
            threads::spawn(move || match target.join() {
                Ok(code) => code,
                Err(_) => -100,
            })
            .unwrap()
        })
        .collect();

    std::thread::sleep(Duration::from_millis(20));
    release.store(true, Ordering::Release);
    for j in joiners {
        assert_eq!(j.join(), Ok(9));
    }
}

#[test]
fn blocked_join_retries_canceled_and_aborted_receives() {
    let release = Arc::new(AtomicBool::new(false));
    let r = Arc::clone(&release);
    let target = threads::spawn(move || {
        while !r.load(Ordering::Acquire) {
            threads::yield_now();
        }
        23
    })
    .unwrap();
    let joiner = threads::spawn(move || match target.join() {
        Ok(code) => code,
        Err(_) => -100,
    })
    .unwrap();

    // The joiner's only IPC is the wait for the exit message.
    let id = joiner.id();
    wait_until("cancel to land", || kestrel_ipc::cancel_ipc(id));
    wait_until("abort to land", || kestrel_ipc::abort_ipc(id));
    assert!(joiner.is_alive());

    release.store(true, Ordering::Release);
    assert_eq!(joiner.join(), Ok(23));
}

#[test]
fn panicking_entry_exits_with_minus_one() {
    let t = threads::spawn(|| panic!("boom")).unwrap();
    assert_eq!(t.join(), Ok(threads::thread::PANIC_EXIT_CODE));
}

#[test]
fn thread_cannot_join_itself() {
    let t = threads::spawn(|| match threads::Thread::current().join() {
        Err(ThreadError::Deadlock) => 0,
        _ => 1,
    })
    .unwrap();
    assert_eq!(t.join(), Ok(0));
}

#[test]
fn builder_names_and_stack_are_applied() {
    let t = ThreadBuilder::new()
        .name("join-test-worker")
        .stack_size(64 * 1024)
        .spawn(|| i32::from(threads::Thread::current().control().stack_reserved() < 64 * 1024))
        .unwrap();
    assert_eq!(t.join(), Ok(0));
}

static DESTROYED: AtomicUsize = AtomicUsize::new(0);

fn count_destroy(value: TssValue) {
    if value.downcast::<u32>().is_ok() {
        DESTROYED.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn tss_destructor_runs_once_at_thread_exit() {
    let key = tss_create(Some(count_destroy)).unwrap();
    let before = DESTROYED.load(Ordering::SeqCst);

    let t = threads::spawn(move || {
        if tss_set(key, Some(Arc::new(11_u32))).is_err() {
            return 1;
        }
        match tss_get_as::<u32>(key) {
            Some(v) if *v == 11 => 0,
            _ => 2,
        }
    })
    .unwrap();
    assert_eq!(t.join(), Ok(0));
    assert_eq!(DESTROYED.load(Ordering::SeqCst), before + 1);

    // A thread that never set the key contributes nothing.
    let t = threads::spawn(|| 0).unwrap();
    assert_eq!(t.join(), Ok(0));
    assert_eq!(DESTROYED.load(Ordering::SeqCst), before + 1);

    tss_delete(key).unwrap();
}

#[test]
fn tss_values_are_per_thread() {
    let key = tss_create(None).unwrap();
    tss_set(key, Some(Arc::new(1_u32))).unwrap();
    let t = threads::spawn(move || i32::from(tss_get_as::<u32>(key).is_some())).unwrap();
    assert_eq!(t.join(), Ok(0));
    assert_eq!(tss_get_as::<u32>(key).as_deref(), Some(&1));
    tss_set(key, None).unwrap();
    tss_delete(key).unwrap();
}
