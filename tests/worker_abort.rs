use bytes::Bytes;
use std::{
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use solarlink::{
    command::keys,
    connection::{status, DummyTransport, WorkerConnection},
    target_fn, Command, CommandTarget, Connection, WorkScheduler,
};

fn collector() -> (Arc<dyn CommandTarget>, flume::Receiver<Command>) {
    let (tx, rx) = flume::unbounded();
    let target = target_fn(move |cmd| {
        let _ = tx.send(cmd);
    });
    (target, rx)
}

/// Three queued requests plus the one in flight each get exactly one
/// ECANCELED completion, and nothing queued reaches the transport.
#[test]
fn test_abort_all_cancels_pending_and_in_flight() {
    let scheduler = WorkScheduler::new().expect("scheduler");
    let (transport, handle) = DummyTransport::scripted(Vec::new());
    let conn = WorkerConnection::spawn("dummy", transport, scheduler.clone()).expect("worker");
    let (target, done) = collector();

    conn.connect(Command::new(100, Arc::clone(&target)));
    assert!(scheduler.dispatch_one(true));
    assert!(done.recv().expect("connect").is_ok());

    conn.receive(Command::new(101, Arc::clone(&target)).with(keys::TIMEOUT, Duration::from_secs(30)));
    let start = Instant::now();
    while conn.queued() > 0 {
        assert!(start.elapsed() < Duration::from_secs(2), "worker never picked up the receive");
        thread::sleep(Duration::from_millis(1));
    }
    for op in 102..105 {
        conn.send(Command::new(op, Arc::clone(&target)).with(keys::SEND_DATA, Bytes::from_static(b"x")));
    }
    assert_eq!(conn.queued(), 3);

    conn.abort_all();
    assert_eq!(conn.queued(), 0);

    while scheduler.dispatch_one(false) {}
    let canceled: Vec<Command> = done.try_iter().collect();
    assert_eq!(
        canceled.iter().map(Command::opcode).collect::<Vec<_>>(),
        vec![101, 102, 103, 104]
    );
    assert!(canceled.iter().all(|cmd| cmd.status() == status::ECANCELED));

    // Unblock the worker; its late result must be discarded.
    handle.inject(&b"late"[..]);
    conn.noop(Command::new(105, Arc::clone(&target)));
    assert!(scheduler.dispatch_one(true));
    let next = done.recv().expect("noop");
    assert_eq!(next.opcode(), 105);
    assert!(next.is_ok());
    assert!(handle.sent().is_empty());
    assert!(done.try_recv().is_err());
}
