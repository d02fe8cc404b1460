use std::sync::mpsc;
use std::time::Duration;

use kestrel_ipc::{
    ErrorCode, IpcError, Message, Phase, Source, StartRegisters, ThreadId, Timeout, call,
    cancel_ipc, current, current_local, current_space, kernel, recv, reply_wait, same_thread,
    send,
};

fn spawn(entry: impl FnOnce() + Send + 'static) -> ThreadId {
    let k = kernel();
    let tid = k.thread_create(current_space()).unwrap();
    k.thread_start(
        tid,
        StartRegisters {
            stack_size: 64 * 1024,
            user_handle: None,
            entry: Box::new(entry),
            name: Some("ipc-test".to_string()),
        },
    )
    .unwrap();
    tid
}

fn wait_halted_then_delete(tid: ThreadId) {
    // A closed receive from a halted thread fails immediately.
    loop {
        match recv(Source::Thread(tid), Timeout::millis(20)) {
            Err(e) if e.code == ErrorCode::NoPartner => break,
            _ => continue,
        }
    }
    kernel().thread_delete(tid).unwrap();
}

#[test]
fn call_gets_the_reply_to_its_own_request() {
    let server = spawn(|| {
        for _ in 0..3 {
            let (from, msg) = recv(Source::Any, Timeout::Never).unwrap();
            let reply = Message::with_words(msg.label(), &[msg.word(0) + 1]);
            send(from, reply, Timeout::Never).unwrap();
        }
    });

    for n in 0..3u64 {
        let reply = call(
            server,
            Message::with_words(9, &[n]),
            Timeout::Never,
            Timeout::Never,
        )
        .unwrap();
        assert_eq!(reply.label(), 9);
        assert_eq!(reply.word(0), n + 1);
    }
    wait_halted_then_delete(server);
}

#[test]
fn zero_timeout_receive_without_sender_times_out() {
    let err = recv(Source::Any, Timeout::Zero).unwrap_err();
    assert_eq!(err, IpcError::receive(ErrorCode::Timeout));
}

#[test]
fn send_to_deleted_thread_has_no_partner() {
    let t = spawn(|| {});
    wait_halted_then_delete(t);
    assert!(!kernel().exists(t));
    let err = send(t, Message::new(1), Timeout::Never).unwrap_err();
    assert_eq!(err.phase, Phase::Send);
    assert_eq!(err.code, ErrorCode::NoPartner);
}

#[test]
fn deleted_slot_comes_back_with_a_new_version() {
    let k = kernel();
    let space = k.create_space();
    let first = k.thread_create(space).unwrap();
    k.thread_delete(first).unwrap();
    let second = k.thread_create(space).unwrap();
    assert_eq!(first.index(), second.index());
    assert_ne!(first, second);
    assert!(!k.exists(first));
    assert!(k.exists(second));
    k.thread_delete(second).unwrap();
}

#[test]
fn cancel_interrupts_a_blocked_receive() {
    let (tx, rx) = mpsc::channel();
    let t = spawn(move || {
        tx.send(recv(Source::Any, Timeout::Never)).unwrap();
    });
    while !cancel_ipc(t) {
        std::thread::sleep(Duration::from_millis(1));
    }
    let outcome = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(outcome.unwrap_err(), IpcError::receive(ErrorCode::Canceled));
    wait_halted_then_delete(t);
}

#[test]
fn closed_receive_from_exiting_thread_fails() {
    let t = spawn(|| std::thread::sleep(Duration::from_millis(30)));
    let err = recv(Source::Thread(t), Timeout::Never).unwrap_err();
    assert_eq!(err, IpcError::receive(ErrorCode::NoPartner));
    kernel().thread_delete(t).unwrap();
}

#[test]
fn reply_wait_to_idle_partner_fails_in_send_phase() {
    let (tx, rx) = mpsc::channel::<()>();
    let t = spawn(move || {
        let _ = rx.recv_timeout(Duration::from_secs(5));
    });
    let err = reply_wait(t, Message::new(3), Timeout::Zero).unwrap_err();
    assert_eq!(err, IpcError::send(ErrorCode::Timeout));
    tx.send(()).unwrap();
    wait_halted_then_delete(t);
}

#[test]
fn queued_senders_are_taken_in_arrival_order() {
    let (go_tx, go_rx) = mpsc::channel::<()>();
    let (done_tx, done_rx) = mpsc::channel();
    let receiver = spawn(move || {
        go_rx.recv().unwrap();
        let mut seen = Vec::new();
        for _ in 0..2 {
            let (_, msg) = recv(Source::Any, Timeout::Never).unwrap();
            seen.push(msg.word(0));
        }
        done_tx.send(seen).unwrap();
    });

    let first = spawn(move || send(receiver, Message::with_words(1, &[1]), Timeout::Never).unwrap());
    std::thread::sleep(Duration::from_millis(30));
    let second =
        spawn(move || send(receiver, Message::with_words(1, &[2]), Timeout::Never).unwrap());
    std::thread::sleep(Duration::from_millis(30));
    go_tx.send(()).unwrap();

    assert_eq!(done_rx.recv_timeout(Duration::from_secs(5)).unwrap(), vec![1, 2]);
    for t in [receiver, first, second] {
        wait_halted_then_delete(t);
    }
}

#[test]
fn local_and_global_ids_name_the_same_thread() {
    let me = current();
    let local = current_local();
    assert!(local.is_local());
    assert!(same_thread(me, local));
    assert_eq!(kernel().global_of(local), Some(me));
    assert_eq!(kernel().local_of(me), Some(local));
}
