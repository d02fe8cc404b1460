//! Scenarios the harness can run against the runtime.
//!
//! Each scenario drives one part of the runtime from several runtime
//! threads, checks the observable outcome and reports the counter deltas
//! it caused.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use kestrel_core::idl::{Reply, ServeEvent, ServeOptions, serve};
use kestrel_core::rollback::{set_confirm, set_rollback};
use kestrel_core::sysmsg::{BroadcastStatus, Broadcaster, Sysmsg};
use kestrel_core::threads::{self, Condvar, Mutex};
use kestrel_core::{CounterSnapshot, Runtime, SysmsgError, ThreadError};
use kestrel_ipc::{IpcError, Message, ThreadId, Timeout, call, send};
use serde::Serialize;
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ScenarioError {
    #[error("thread operation failed: {0}")]
    Thread(#[from] ThreadError),
    #[error("sysmsg operation failed: {0}")]
    Sysmsg(#[from] SysmsgError),
    #[error("ipc failed: {0}")]
    Ipc(#[from] IpcError),
    #[error("check failed: {0}")]
    Check(String),
    #[error("timed out waiting for {0}")]
    Stalled(&'static str),
}

fn check(ok: bool, what: impl FnOnce() -> String) -> Result<(), ScenarioError> {
    if ok { Ok(()) } else { Err(ScenarioError::Check(what())) }
}

fn wait_for(what: &'static str, cond: impl Fn() -> bool) -> Result<(), ScenarioError> {
    let deadline = Instant::now() + Duration::from_secs(30);
    while !cond() {
        if Instant::now() >= deadline {
            return Err(ScenarioError::Stalled(what));
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    Ok(())
}

fn join_ok(thread: &threads::Thread) -> Result<(), ScenarioError> {
    let code = thread.join()?;
    check(code == 0, || format!("thread {} exited with {code}", thread.id()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scenario {
    MutexStress,
    MutexFifo,
    Condvar,
    Join,
    Rollback,
    Sysmsg,
}

impl Scenario {
    pub const ALL: [Scenario; 6] = [
        Self::MutexStress,
        Self::MutexFifo,
        Self::Condvar,
        Self::Join,
        Self::Rollback,
        Self::Sysmsg,
    ];

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::MutexStress => "mutex-stress",
            Self::MutexFifo => "mutex-fifo",
            Self::Condvar => "condvar",
            Self::Join => "join",
            Self::Rollback => "rollback",
            Self::Sysmsg => "sysmsg",
        }
    }
}

/// Knobs shared by the scenarios.
#[derive(Debug, Clone, Copy)]
pub struct ScenarioConfig {
    pub threads: usize,
    pub rounds: usize,
}

impl Default for ScenarioConfig {
    fn default() -> Self {
        Self {
            threads: 4,
            rounds: 200,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ScenarioReport {
    pub scenario: &'static str,
    pub duration_ms: u64,
    pub counters: CounterSnapshot,
    pub details: serde_json::Value,
}

/// Runs `scenario` and measures the counters it moved.
pub fn run(scenario: Scenario, config: ScenarioConfig) -> Result<ScenarioReport, ScenarioError> {
    let before = Runtime::get().snapshot();
    let started = Instant::now();
    let details = match scenario {
        Scenario::MutexStress => mutex_stress(config)?,
        Scenario::MutexFifo => mutex_fifo(config)?,
        Scenario::Condvar => condvar(config)?,
        Scenario::Join => join(config)?,
        Scenario::Rollback => rollback()?,
        Scenario::Sysmsg => sysmsg(config)?,
    };
    Ok(ScenarioReport {
        scenario: scenario.name(),
        duration_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
        counters: Runtime::get().snapshot().since(&before),
        details,
    })
}

// ---------------------------------------------------------------------------
// Mutex
// ---------------------------------------------------------------------------

fn mutex_stress(config: ScenarioConfig) -> Result<serde_json::Value, ScenarioError> {
    let mutex = Arc::new(Mutex::new());
    let inside = Arc::new(AtomicBool::new(false));
    let overlaps = Arc::new(AtomicUsize::new(0));
    let total = Arc::new(AtomicUsize::new(0));

    let workers = (0..config.threads)
        .map(|_| {
            let (mutex, inside, overlaps, total) = (
                Arc::clone(&mutex),
                Arc::clone(&inside),
                Arc::clone(&overlaps),
                Arc::clone(&total),
            );
            let rounds = config.rounds;
            threads::spawn(move || {
                for _ in 0..rounds {
                    if mutex.lock().is_err() {
                        return 1;
                    }
                    if inside.swap(true, Ordering::SeqCst) {
                        overlaps.fetch_add(1, Ordering::SeqCst);
                    }
                    let seen = total.load(Ordering::Relaxed);
                    threads::yield_now();
                    total.store(seen + 1, Ordering::Relaxed);
                    inside.store(false, Ordering::SeqCst);
                    if mutex.unlock().is_err() {
                        return 2;
                    }
                }
                0
            })
        })
        .collect::<Result<Vec<_>, _>>()?;
    for worker in &workers {
        join_ok(worker)?;
    }

    let expected = config.threads * config.rounds;
    let total = total.load(Ordering::SeqCst);
    let overlaps = overlaps.load(Ordering::SeqCst);
    check(overlaps == 0, || format!("{overlaps} overlapping critical sections"))?;
    check(total == expected, || format!("counted {total}, expected {expected}"))?;
    Ok(json!({ "threads": config.threads, "rounds": config.rounds, "total": total }))
}

fn mutex_fifo(config: ScenarioConfig) -> Result<serde_json::Value, ScenarioError> {
    let mutex = Arc::new(Mutex::new());
    let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
    mutex.lock()?;

    let mut waiters = Vec::with_capacity(config.threads);
    for i in 0..config.threads {
        let (m, order) = (Arc::clone(&mutex), Arc::clone(&order));
        waiters.push(threads::spawn(move || {
            if m.lock().is_err() {
                return 1;
            }
            order.lock().push(i);
            i32::from(m.unlock().is_err())
        })?);
        wait_for("waiter to queue", || mutex.waiters() == i + 1)?;
    }
    mutex.unlock()?;
    for waiter in &waiters {
        join_ok(waiter)?;
    }

    let order = order.lock().clone();
    let expected: Vec<usize> = (0..config.threads).collect();
    check(order == expected, || format!("grant order {order:?}"))?;
    Ok(json!({ "order": order }))
}

// ---------------------------------------------------------------------------
// Condition variable
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Gate {
    mutex: Mutex,
    cond: Condvar,
    open: AtomicBool,
    waiting: AtomicUsize,
}

fn condvar(config: ScenarioConfig) -> Result<serde_json::Value, ScenarioError> {
    let gate = Arc::new(Gate::default());
    let waiters = (0..config.threads)
        .map(|_| {
            let gate = Arc::clone(&gate);
            threads::spawn(move || {
                if gate.mutex.lock().is_err() {
                    return 1;
                }
                gate.waiting.fetch_add(1, Ordering::SeqCst);
                while !gate.open.load(Ordering::SeqCst) {
                    if gate.cond.wait(&gate.mutex).is_err() {
                        return 2;
                    }
                }
                i32::from(gate.mutex.unlock().is_err())
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    wait_for("waiters to block", || {
        gate.waiting.load(Ordering::SeqCst) == config.threads
    })?;
    gate.mutex.lock()?;
    gate.open.store(true, Ordering::SeqCst);
    gate.cond.broadcast()?;
    gate.mutex.unlock()?;
    for waiter in &waiters {
        join_ok(waiter)?;
    }
    gate.cond.destroy()?;
    Ok(json!({ "woken": config.threads }))
}

// ---------------------------------------------------------------------------
// Join
// ---------------------------------------------------------------------------

fn join(config: ScenarioConfig) -> Result<serde_json::Value, ScenarioError> {
    // Even threads finish before their join, odd ones after it starts.
    let release = Arc::new(AtomicBool::new(false));
    let children = (0..config.threads)
        .map(|i| {
            let release = Arc::clone(&release);
            let code = i32::try_from(i).unwrap_or(i32::MAX);
            threads::spawn(move || {
                if i % 2 == 1 {
                    while !release.load(Ordering::Acquire) {
                        threads::yield_now();
                    }
                }
                code
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    for child in children.iter().step_by(2) {
        wait_for("child to finish", || !child.is_alive())?;
    }
    let releaser = {
        let release = Arc::clone(&release);
        threads::spawn(move || {
            for _ in 0..100 {
                threads::yield_now();
            }
            release.store(true, Ordering::Release);
            0
        })?
    };

    let mut codes = Vec::with_capacity(children.len());
    for child in &children {
        codes.push(child.join()?);
    }
    join_ok(&releaser)?;
    for (i, code) in codes.iter().enumerate() {
        check(usize::try_from(*code).ok() == Some(i), || {
            format!("child {i} returned {code}")
        })?;
    }
    for child in &children {
        check(child.join() == Err(ThreadError::NotFound), || {
            format!("second join of {} did not fail", child.id())
        })?;
    }
    Ok(json!({ "codes": codes }))
}

// ---------------------------------------------------------------------------
// Rollback
// ---------------------------------------------------------------------------

const LABEL_ADD: u16 = 1;
const LABEL_QUIT: u16 = 2;

fn rollback() -> Result<serde_json::Value, ScenarioError> {
    let value = Arc::new(AtomicI64::new(0));
    let confirmed = Arc::new(AtomicUsize::new(0));
    let rolled_back = Arc::new(AtomicUsize::new(0));

    let server = {
        let (value, confirmed, rolled_back) = (
            Arc::clone(&value),
            Arc::clone(&confirmed),
            Arc::clone(&rolled_back),
        );
        threads::spawn(move || {
            let mut handler = |_: ThreadId, req: &Message| {
                if req.label() != LABEL_ADD {
                    return Reply::Exit;
                }
                let amount = req.word(0) as i64;
                let now = value.fetch_add(amount, Ordering::SeqCst) + amount;
                let undo = Arc::clone(&value);
                set_rollback(move || {
                    undo.fetch_sub(amount, Ordering::SeqCst);
                });
                let confirmed = Arc::clone(&confirmed);
                set_confirm(move || {
                    confirmed.fetch_add(1, Ordering::SeqCst);
                });
                Reply::Send(Message::with_words(LABEL_ADD, &[now as u64]))
            };
            let observe = |event: ServeEvent| {
                if matches!(event, ServeEvent::RolledBack { .. }) {
                    rolled_back.fetch_add(1, Ordering::SeqCst);
                }
            };
            i32::from(serve(&mut handler, ServeOptions::default(), observe).is_err())
        })?
    };
    let target = server.id();

    // Fire and forget: the reply has nowhere to go.
    let lost = threads::spawn(move || {
        i32::from(send(target, Message::with_words(LABEL_ADD, &[5]), Timeout::Never).is_err())
    })?;
    join_ok(&lost)?;

    let reply = call(
        target,
        Message::with_words(LABEL_ADD, &[3]),
        Timeout::Never,
        Timeout::Never,
    )?;
    let seen = reply.word(0);
    send(target, Message::new(LABEL_QUIT), Timeout::Never)?;
    join_ok(&server)?;

    let value = value.load(Ordering::SeqCst);
    let rolled_back = rolled_back.load(Ordering::SeqCst);
    check(seen == 3, || format!("reply carried {seen}"))?;
    check(value == 3, || format!("final value {value}"))?;
    check(rolled_back == 1, || format!("{rolled_back} rollbacks"))?;
    Ok(json!({
        "value": value,
        "rolled_back": rolled_back,
        "confirmed": confirmed.load(Ordering::SeqCst),
    }))
}

// ---------------------------------------------------------------------------
// Sysmsg
// ---------------------------------------------------------------------------

fn sysmsg(config: ScenarioConfig) -> Result<serde_json::Value, ScenarioError> {
    let broadcaster = Broadcaster::start()?;
    let hits = Arc::new(AtomicUsize::new(0));

    let clients: Vec<Sysmsg> = (0..config.threads.max(1))
        .map(|_| Sysmsg::connect(broadcaster.control_id()))
        .collect();
    for (i, client) in clients.iter().enumerate() {
        let hits = Arc::clone(&hits);
        // Odd clients defer.
        let defer = i % 2 == 1;
        client.listen(0, move |_| {
            hits.fetch_add(1, Ordering::SeqCst);
            defer
        })?;
    }

    let sender = Sysmsg::connect(broadcaster.control_id());
    let mut statuses = Vec::with_capacity(config.rounds.min(16));
    for round in 0..config.rounds.min(16) {
        statuses.push(sender.broadcast(1, 0, &[round as u64])?);
    }
    let expected = clients.len() * statuses.len();
    let hits = hits.load(Ordering::SeqCst);
    check(hits == expected, || format!("{hits} deliveries, expected {expected}"))?;
    let deferred = clients.len() > 1;
    check(
        statuses
            .iter()
            .all(|s| (*s == BroadcastStatus::Deferred) == deferred),
        || format!("statuses {statuses:?}"),
    )?;

    drop(clients);
    let remaining = broadcaster.subscriber_count();
    check(remaining == 0, || format!("{remaining} subscribers left"))?;
    broadcaster.shutdown();
    Ok(json!({ "deliveries": hits, "broadcasts": statuses.len() }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scenario_names_are_distinct() {
        let mut names: Vec<_> = Scenario::ALL.iter().map(|s| s.name()).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), Scenario::ALL.len());
    }

    #[test]
    fn failed_checks_carry_their_message() {
        let err = check(false, || "boom".to_string()).unwrap_err();
        assert_eq!(err.to_string(), "check failed: boom");
        assert!(check(true, || unreachable!()).is_ok());
    }
}
