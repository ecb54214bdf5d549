use anyhow::{anyhow, Result};
use bytes::Bytes;
use parking_lot::{Condvar, Mutex};
use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use super::{status, Connection, TransportError, Verb, DEFAULT_TIMEOUT};
use crate::{
    command::{keys, Command},
    scheduler::WorkScheduler,
};

/// Blocking I/O backend driven by a [`WorkerConnection`] thread.
pub trait Transport: Send + 'static {
    fn connect(&mut self, timeout: Duration) -> Result<(), TransportError>;
    fn disconnect(&mut self) -> Result<(), TransportError>;
    fn send(&mut self, data: &[u8], timeout: Duration) -> Result<(), TransportError>;

    /// Wait up to `timeout` for the first bytes, then collect the rest of
    /// the frame. `interbyte` overrides the transport's own frame gap.
    fn receive(
        &mut self,
        timeout: Duration,
        interbyte: Option<Duration>,
    ) -> Result<Bytes, TransportError>;

    fn accept(&mut self, _timeout: Duration) -> Result<(), TransportError> {
        Err(TransportError::NotPermitted("accept on a client connection"))
    }

    fn is_connected(&self) -> bool;

    fn can_accept(&self) -> bool {
        false
    }

    fn default_timeout(&self) -> Duration {
        DEFAULT_TIMEOUT
    }

    fn describe(&self) -> String;
}

/// Parameters pulled out of the completion command at submit time.
#[derive(Debug)]
struct Params {
    timeout: Duration,
    interbyte: Option<Duration>,
    data: Option<Bytes>,
}

struct Request {
    verb: Verb,
    params: Params,
    command: Command,
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<Request>,
    /// Completion of the request the worker is blocked on.
    in_flight: Option<Command>,
    terminate: bool,
}

struct Shared {
    name: String,
    queue: Mutex<QueueState>,
    ready: Condvar,
    connected: AtomicBool,
    can_accept: bool,
    default_timeout: Duration,
    scheduler: WorkScheduler,
}

/// [`Connection`] on top of a [`Transport`]: one worker thread draining a
/// private request queue.
pub struct WorkerConnection {
    shared: Arc<Shared>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl WorkerConnection {
    pub fn spawn<T: Transport>(
        name: impl Into<String>,
        transport: T,
        scheduler: WorkScheduler,
    ) -> Result<Self> {
        let name = name.into();
        let shared = Arc::new(Shared {
            name: name.clone(),
            queue: Mutex::new(QueueState::default()),
            ready: Condvar::new(),
            connected: AtomicBool::new(transport.is_connected()),
            can_accept: transport.can_accept(),
            default_timeout: transport.default_timeout(),
            scheduler,
        });

        let worker_shared = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name(format!("conn-{name}"))
            .spawn(move || run_worker(worker_shared, transport))
            .map_err(|err| anyhow!("failed to spawn worker for {name}: {err}"))?;

        Ok(Self {
            shared,
            handle: Mutex::new(Some(handle)),
        })
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Requests queued behind the one in flight.
    pub fn queued(&self) -> usize {
        self.shared.queue.lock().pending.len()
    }

    fn enqueue(&self, verb: Verb, command: Command) {
        let params = Params {
            timeout: command
                .optional::<Duration>(keys::TIMEOUT)
                .unwrap_or(self.shared.default_timeout),
            interbyte: command.optional::<Duration>(keys::INTERBYTE_TIMEOUT),
            data: match verb {
                Verb::Send => Some(command.require::<Bytes>(keys::SEND_DATA)),
                _ => None,
            },
        };
        let mut queue = self.shared.queue.lock();
        queue.pending.push_back(Request {
            verb,
            params,
            command,
        });
        self.shared.ready.notify_one();
    }
}

impl Connection for WorkerConnection {
    fn connect(&self, callback: Command) {
        self.enqueue(Verb::Connect, callback);
    }

    fn disconnect(&self, callback: Command) {
        self.enqueue(Verb::Disconnect, callback);
    }

    fn send(&self, callback: Command) {
        self.enqueue(Verb::Send, callback);
    }

    fn receive(&self, callback: Command) {
        self.enqueue(Verb::Receive, callback);
    }

    fn accept(&self, callback: Command) {
        self.enqueue(Verb::Accept, callback);
    }

    fn noop(&self, callback: Command) {
        self.enqueue(Verb::Noop, callback);
    }

    fn abort_all(&self) {
        let canceled: Vec<Command> = {
            let mut queue = self.shared.queue.lock();
            let in_flight = queue.in_flight.take();
            in_flight
                .into_iter()
                .chain(queue.pending.drain(..).map(|request| request.command))
                .collect()
        };
        if !canceled.is_empty() {
            log::info!("{}: aborting {} requests", self.shared.name, canceled.len());
        }
        for mut command in canceled {
            command.set_error(status::ECANCELED, "aborted");
            self.shared.scheduler.schedule_now(command);
        }
    }

    fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
    }

    fn can_accept(&self) -> bool {
        self.shared.can_accept
    }
}

impl Drop for WorkerConnection {
    fn drop(&mut self) {
        self.abort_all();
        {
            let mut queue = self.shared.queue.lock();
            queue.terminate = true;
            self.shared.ready.notify_all();
        }
        if let Some(handle) = self.handle.lock().take() {
            if handle.join().is_err() {
                log::warn!("{}: worker thread panicked", self.shared.name);
            }
        }
    }
}

fn run_worker<T: Transport>(shared: Arc<Shared>, mut transport: T) {
    log::debug!("{}: worker started", shared.name);
    loop {
        let (verb, params) = {
            let mut queue = shared.queue.lock();
            while queue.pending.is_empty() && !queue.terminate {
                shared.ready.wait(&mut queue);
            }
            if queue.terminate {
                break;
            }
            let Some(request) = queue.pending.pop_front() else {
                continue;
            };
            queue.in_flight = Some(request.command);
            (request.verb, request.params)
        };

        let outcome = perform(&mut transport, verb, &params);
        shared
            .connected
            .store(transport.is_connected(), Ordering::Release);

        let Some(mut command) = shared.queue.lock().in_flight.take() else {
            log::debug!("{}: result of aborted {verb} discarded", shared.name);
            continue;
        };
        match outcome {
            Ok(data) => {
                command.set_status(status::OK);
                if let Some(data) = data {
                    command.add(keys::RECEIVE_DATA, data);
                }
            }
            Err(err) => {
                if !matches!(err, TransportError::Timeout) {
                    log::warn!("{}: {verb} failed: {err}", shared.name);
                }
                command.set_error(err.errno(), err.to_string());
            }
        }
        shared.scheduler.schedule_now(command);
    }

    if transport.is_connected() {
        if let Err(err) = transport.disconnect() {
            log::warn!("{}: disconnect on shutdown failed: {err}", shared.name);
        }
    }
    log::debug!("{}: worker stopped", shared.name);
}

fn perform<T: Transport>(
    transport: &mut T,
    verb: Verb,
    params: &Params,
) -> Result<Option<Bytes>, TransportError> {
    let connected = transport.is_connected();
    match verb {
        Verb::Noop => Ok(None),
        Verb::Connect if connected => Ok(None),
        Verb::Connect => {
            transport.connect(params.timeout)?;
            log::info!("connected to {}", transport.describe());
            Ok(None)
        }
        Verb::Disconnect if !connected => Ok(None),
        Verb::Disconnect => {
            transport.disconnect()?;
            log::info!("disconnected from {}", transport.describe());
            Ok(None)
        }
        Verb::Accept if connected => Ok(None),
        Verb::Accept => {
            transport.accept(params.timeout)?;
            log::info!("accepted peer on {}", transport.describe());
            Ok(None)
        }
        Verb::Send | Verb::Receive if !connected => Err(TransportError::NotConnected),
        Verb::Send => {
            let data = params.data.as_deref().unwrap_or_default();
            transport.send(data, params.timeout)?;
            Ok(None)
        }
        Verb::Receive => transport
            .receive(params.timeout, params.interbyte)
            .map(Some),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{command::target_fn, connection::DummyTransport};
    use flume::Receiver;

    fn collector() -> (Arc<dyn crate::command::CommandTarget>, Receiver<Command>) {
        let (tx, rx) = flume::unbounded();
        let target = target_fn(move |cmd| {
            let _ = tx.send(cmd);
        });
        (target, rx)
    }

    fn next(scheduler: &WorkScheduler) {
        // Completions arrive from the worker thread; block until one is queued.
        assert!(scheduler.dispatch_one(true));
    }

    #[test]
    fn test_immediate_results() {
        let scheduler = WorkScheduler::new().unwrap();
        let (transport, _handle) = DummyTransport::echo();
        let conn = WorkerConnection::spawn("dummy", transport, scheduler.clone()).unwrap();
        let (target, done) = collector();

        conn.send(Command::new(100, Arc::clone(&target)).with(keys::SEND_DATA, Bytes::new()));
        next(&scheduler);
        assert_eq!(done.recv().unwrap().status(), status::ENOTCONN);

        conn.disconnect(Command::new(101, Arc::clone(&target)));
        next(&scheduler);
        assert_eq!(done.recv().unwrap().status(), status::OK);

        conn.noop(Command::new(102, Arc::clone(&target)));
        next(&scheduler);
        assert_eq!(done.recv().unwrap().status(), status::OK);
        assert!(!conn.is_connected());
    }

    #[test]
    fn test_echo_round_trip() {
        let scheduler = WorkScheduler::new().unwrap();
        let (transport, handle) = DummyTransport::echo();
        let conn = WorkerConnection::spawn("dummy", transport, scheduler.clone()).unwrap();
        let (target, done) = collector();

        conn.connect(Command::new(100, Arc::clone(&target)));
        conn.send(
            Command::new(101, Arc::clone(&target)).with(keys::SEND_DATA, Bytes::from_static(b"ping")),
        );
        conn.receive(Command::new(102, Arc::clone(&target)));
        for _ in 0..3 {
            next(&scheduler);
        }
        let results: Vec<Command> = done.try_iter().collect();
        assert_eq!(
            results.iter().map(Command::opcode).collect::<Vec<_>>(),
            vec![100, 101, 102]
        );
        assert!(results.iter().all(Command::is_ok));
        assert_eq!(
            results[2].get::<Bytes>(keys::RECEIVE_DATA).unwrap(),
            Bytes::from_static(b"ping")
        );
        assert_eq!(handle.sent(), vec![Bytes::from_static(b"ping")]);
        assert!(conn.is_connected());
    }

    #[test]
    fn test_receive_timeout_reports_etimedout() {
        let scheduler = WorkScheduler::new().unwrap();
        let (transport, _handle) = DummyTransport::scripted(Vec::new());
        let conn = WorkerConnection::spawn("dummy", transport, scheduler.clone()).unwrap();
        let (target, done) = collector();

        conn.connect(Command::new(100, Arc::clone(&target)));
        conn.receive(
            Command::new(101, Arc::clone(&target))
                .with(keys::TIMEOUT, Duration::from_millis(20)),
        );
        next(&scheduler);
        next(&scheduler);
        let results: Vec<Command> = done.try_iter().collect();
        assert_eq!(results[1].status(), status::ETIMEDOUT);
        assert!(results[1].error_message().is_some());
    }

    #[test]
    fn test_drop_cancels_queued_requests() {
        let scheduler = WorkScheduler::new().unwrap();
        let (transport, _handle) = DummyTransport::scripted(Vec::new());
        let conn = WorkerConnection::spawn("dummy", transport, scheduler.clone()).unwrap();
        let (target, done) = collector();

        conn.connect(Command::new(100, Arc::clone(&target)));
        next(&scheduler);
        conn.receive(
            Command::new(101, Arc::clone(&target)).with(keys::TIMEOUT, Duration::from_secs(1)),
        );
        conn.receive(Command::new(102, Arc::clone(&target)));
        drop(conn);

        while scheduler.dispatch_one(false) {}
        let results: Vec<Command> = done.try_iter().collect();
        assert_eq!(results.len(), 3);
        assert!(results[1..]
            .iter()
            .all(|cmd| cmd.status() == status::ECANCELED));
    }
}
