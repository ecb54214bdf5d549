use bytes::Bytes;
use flume::Sender;
use parking_lot::Mutex;
use std::{
    sync::{Arc, Weak},
    time::Duration,
};

use crate::{
    command::{fatal, keys, opcode, Command, CommandTarget},
    connection::{status, Connection},
    scheduler::WorkScheduler,
};

const CMD_POLL: u32 = opcode::TARGETED_MIN;
const CMD_CONNECT_DONE: u32 = opcode::TARGETED_MIN + 1;
const CMD_SEND_DONE: u32 = opcode::TARGETED_MIN + 2;
const CMD_RECEIVE_DONE: u32 = opcode::TARGETED_MIN + 3;
const CMD_DISCONNECT_DONE: u32 = opcode::TARGETED_MIN + 4;

/// One request/reply exchange, or the failure that replaced it.
#[derive(Debug, Clone, PartialEq)]
pub struct PollResult {
    pub poller: String,
    pub status: i32,
    pub data: Option<Bytes>,
}

#[derive(Debug, Clone)]
pub struct PollerSettings {
    pub name: String,
    pub request: Bytes,
    pub interval: Duration,
    /// Reply timeout; the connection default when unset.
    pub timeout: Option<Duration>,
}

#[derive(Default)]
struct PollerState {
    stopped: bool,
    cycles: u64,
}

/// Drives one device: connect, then every interval an atomic
/// `[send request, receive reply]` block.
pub struct Poller {
    settings: PollerSettings,
    connection: Arc<dyn Connection>,
    scheduler: WorkScheduler,
    sink: Sender<PollResult>,
    me: Weak<Poller>,
    state: Mutex<PollerState>,
}

impl Poller {
    pub fn new(
        settings: PollerSettings,
        connection: Arc<dyn Connection>,
        scheduler: WorkScheduler,
        sink: Sender<PollResult>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            settings,
            connection,
            scheduler,
            sink,
            me: me.clone(),
            state: Mutex::new(PollerState::default()),
        })
    }

    pub fn name(&self) -> &str {
        &self.settings.name
    }

    /// Subscribe to broadcasts and queue the first cycle.
    pub fn start(&self) {
        let target = self.as_target();
        self.scheduler.register_broadcasts(&target, true);
        self.scheduler.schedule_now(Command::new(CMD_POLL, target));
        log::info!("{}: polling every {:?}", self.name(), self.settings.interval);
    }

    pub fn is_stopped(&self) -> bool {
        self.state.lock().stopped
    }

    pub fn cycles(&self) -> u64 {
        self.state.lock().cycles
    }

    fn poll(&self) {
        if self.connection.is_connected() {
            self.exchange();
        } else {
            self.connection
                .connect(Command::new(CMD_CONNECT_DONE, self.as_target()));
        }
    }

    fn exchange(&self) {
        self.state.lock().cycles += 1;
        let send = Command::new(CMD_SEND_DONE, self.as_target())
            .with(keys::SEND_DATA, self.settings.request.clone())
            .with(keys::ATOMIC, true);
        let mut receive = Command::new(CMD_RECEIVE_DONE, self.as_target()).with(keys::ATOMIC, false);
        if let Some(timeout) = self.settings.timeout {
            receive.add(keys::TIMEOUT, timeout);
        }
        self.connection.send(send);
        self.connection.receive(receive);
    }

    fn report(&self, code: i32, data: Option<Bytes>) {
        let result = PollResult {
            poller: self.settings.name.clone(),
            status: code,
            data,
        };
        if self.sink.send(result).is_err() {
            log::debug!("{}: result sink closed", self.name());
        }
    }

    fn schedule_next(&self) {
        self.scheduler.schedule_after(
            Command::new(CMD_POLL, self.as_target()),
            self.settings.interval,
        );
    }

    fn stop(&self) {
        self.state.lock().stopped = true;
        self.scheduler.register_broadcasts(&self.as_target(), false);
        log::info!("{}: stopped", self.name());
    }

    fn as_target(&self) -> Arc<dyn CommandTarget> {
        match self.me.upgrade() {
            Some(me) => me as Arc<dyn CommandTarget>,
            None => fatal(format!("poller {} used while being dropped", self.settings.name)),
        }
    }
}

impl CommandTarget for Poller {
    fn execute_command(&self, command: Command) {
        if command.is_broadcast() {
            if command.opcode() == opcode::BRC_SHUTDOWN {
                self.stop();
            }
            return;
        }
        if self.is_stopped() {
            return;
        }

        match command.opcode() {
            CMD_POLL => self.poll(),
            CMD_CONNECT_DONE => {
                if command.is_ok() {
                    self.exchange();
                } else {
                    log::warn!(
                        "{}: connect failed: {}",
                        self.name(),
                        status::describe(command.status())
                    );
                    self.report(command.status(), None);
                    self.schedule_next();
                }
            }
            CMD_SEND_DONE => {
                if !command.is_ok() {
                    log::debug!(
                        "{}: send failed: {}",
                        self.name(),
                        status::describe(command.status())
                    );
                }
            }
            CMD_RECEIVE_DONE => {
                let code = command.status();
                self.report(code, command.optional::<Bytes>(keys::RECEIVE_DATA));
                if code == status::OK {
                    self.schedule_next();
                } else {
                    log::warn!("{}: exchange failed: {}", self.name(), status::describe(code));
                    self.connection
                        .disconnect(Command::new(CMD_DISCONNECT_DONE, self.as_target()));
                }
            }
            CMD_DISCONNECT_DONE => self.schedule_next(),
            other => fatal(format!("{}: unknown opcode {other}", self.name())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{DummyTransport, WorkerConnection};

    #[test]
    fn test_poll_cycle_reports_reply_and_stops_on_shutdown() {
        let scheduler = WorkScheduler::new().unwrap();
        let (transport, handle) = DummyTransport::scripted(vec![Bytes::from_static(b"\x06ok")]);
        let connection: Arc<dyn Connection> =
            Arc::new(WorkerConnection::spawn("inverter", transport, scheduler.clone()).unwrap());
        let (tx, rx) = flume::unbounded();
        let poller = Poller::new(
            PollerSettings {
                name: "inverter".to_string(),
                request: Bytes::from_static(b"\x05status"),
                interval: Duration::from_millis(5),
                timeout: Some(Duration::from_millis(200)),
            },
            connection,
            scheduler.clone(),
            tx,
        );
        poller.start();

        let mut results = Vec::new();
        while results.len() < 2 {
            scheduler.dispatch_one(true);
            results.extend(rx.try_iter());
        }
        assert!(results.iter().all(|r| r.status == status::OK));
        assert_eq!(results[0].data, Some(Bytes::from_static(b"\x06ok")));
        assert!(handle.sent().len() >= 2);

        scheduler.request_shutdown();
        scheduler.run();
        assert!(poller.is_stopped());
    }
}
