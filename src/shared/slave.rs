use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use std::{
    sync::{Arc, Weak},
    time::{Duration, Instant},
};

use super::{master::SharedConnectionMaster, SlaveId, Ticket};
use crate::{
    command::{fatal, keys, opcode::TARGETED_MIN, Command, CommandTarget},
    connection::{status, Connection, Verb, DEFAULT_TIMEOUT},
    scheduler::WorkScheduler,
};

/// Result of the shared listen read, one copy per subscribed slave.
const CMD_HANDLEREAD: u32 = TARGETED_MIN + 10;
/// Expire non-atomic reads whose deadline has passed.
const CMD_HANDLETIMEOUTS: u32 = TARGETED_MIN + 11;

struct PendingRead {
    deadline: Instant,
    callback: Command,
}

#[derive(Default)]
struct SlaveState {
    current_ticket: Ticket,
    pending_reads: Vec<PendingRead>,
    read_buffer: BytesMut,
}

/// Logical client of a shared connection; every call goes through the
/// master.
pub struct SharedConnectionSlave {
    id: SlaveId,
    master: Arc<SharedConnectionMaster>,
    scheduler: WorkScheduler,
    me: Weak<SharedConnectionSlave>,
    state: Mutex<SlaveState>,
}

impl SharedConnectionSlave {
    pub fn new(master: Arc<SharedConnectionMaster>, scheduler: WorkScheduler) -> Arc<Self> {
        let id = master.register_slave();
        Arc::new_cyclic(|me| Self {
            id,
            master,
            scheduler,
            me: me.clone(),
            state: Mutex::new(SlaveState::default()),
        })
    }

    pub fn id(&self) -> SlaveId {
        self.id
    }

    pub fn master(&self) -> &Arc<SharedConnectionMaster> {
        &self.master
    }

    /// Ticket of the block this slave is in the middle of, `0` if none.
    pub fn current_ticket(&self) -> Ticket {
        self.state.lock().current_ticket
    }

    pub fn pending_reads(&self) -> usize {
        self.state.lock().pending_reads.len()
    }

    /// Attach the block ticket. The first call of a block draws a new one,
    /// the closing call (flag false, or absent mid-block) releases it.
    fn handle_tickets(&self, command: &mut Command) -> Ticket {
        let flag = command.optional::<bool>(keys::ATOMIC);
        let mut state = self.state.lock();
        if flag.is_none() && state.current_ticket == 0 {
            return 0;
        }
        if state.current_ticket == 0 {
            state.current_ticket = self.master.get_ticket();
        }
        let ticket = state.current_ticket;
        command.add(keys::TICKET, ticket);
        if !flag.unwrap_or(false) {
            state.current_ticket = 0;
        }
        ticket
    }

    fn submit(&self, verb: Verb, mut command: Command) {
        self.handle_tickets(&mut command);
        self.master.submit(self.id, verb, command);
    }

    fn receive_non_atomic(&self, mut command: Command) {
        let mut state = self.state.lock();
        if !state.read_buffer.is_empty() {
            let data: Bytes = state.read_buffer.split().freeze();
            drop(state);
            command.add(keys::RECEIVE_DATA, data).set_status(status::OK);
            self.scheduler.schedule_now(command);
            return;
        }

        let timeout = command
            .optional::<Duration>(keys::TIMEOUT)
            .unwrap_or(DEFAULT_TIMEOUT);
        let deadline = Instant::now() + timeout;
        state.pending_reads.push(PendingRead {
            deadline,
            callback: command,
        });
        drop(state);

        self.master.listen(self.id, self.me.clone(), deadline);
        self.scheduler
            .schedule_at(Command::new(CMD_HANDLETIMEOUTS, self.as_target()), deadline);
    }

    /// Hand a copy of the listen result to this slave.
    pub(crate) fn deliver_read(&self, result: &Command) {
        let mut copy = Command::new(CMD_HANDLEREAD, self.as_target());
        copy.merge(result);
        self.scheduler.schedule_now(copy);
    }

    fn handle_read(&self, result: Command) {
        let mut state = self.state.lock();
        if state.pending_reads.is_empty() {
            if result.is_ok() {
                if let Some(data) = result.optional::<Bytes>(keys::RECEIVE_DATA) {
                    state.read_buffer.extend_from_slice(&data);
                }
            }
            return;
        }
        let reads = std::mem::take(&mut state.pending_reads);
        drop(state);

        self.master.unlisten(self.id);
        for PendingRead { mut callback, .. } in reads {
            callback.merge(&result);
            self.scheduler.schedule_now(callback);
        }
    }

    fn handle_timeouts(&self) {
        let now = Instant::now();
        let mut state = self.state.lock();
        let (expired, alive): (Vec<PendingRead>, Vec<PendingRead>) =
            std::mem::take(&mut state.pending_reads)
                .into_iter()
                .partition(|read| read.deadline <= now);
        state.pending_reads = alive;
        let idle = state.pending_reads.is_empty();
        drop(state);

        if idle {
            self.master.unlisten(self.id);
        }
        for PendingRead { mut callback, .. } in expired {
            callback.set_error(status::ETIMEDOUT, "timed out");
            self.scheduler.schedule_now(callback);
        }
    }

    fn cancel_reads(&self) {
        let reads = std::mem::take(&mut self.state.lock().pending_reads);
        self.master.unlisten(self.id);
        for PendingRead { mut callback, .. } in reads {
            callback.set_error(status::ECANCELED, "aborted");
            self.scheduler.schedule_now(callback);
        }
    }

    fn as_target(&self) -> Arc<dyn CommandTarget> {
        match self.me.upgrade() {
            Some(me) => me as Arc<dyn CommandTarget>,
            None => fatal(format!("slave {} used while being dropped", self.id)),
        }
    }
}

impl Connection for SharedConnectionSlave {
    fn connect(&self, callback: Command) {
        self.state.lock().read_buffer.clear();
        self.submit(Verb::Connect, callback);
    }

    fn disconnect(&self, callback: Command) {
        self.state.lock().read_buffer.clear();
        self.cancel_reads();
        self.submit(Verb::Disconnect, callback);
    }

    fn send(&self, callback: Command) {
        self.submit(Verb::Send, callback);
    }

    fn receive(&self, mut callback: Command) {
        if self.handle_tickets(&mut callback) == 0 {
            self.receive_non_atomic(callback);
        } else {
            self.master.submit(self.id, Verb::Receive, callback);
        }
    }

    fn accept(&self, callback: Command) {
        self.submit(Verb::Accept, callback);
    }

    fn noop(&self, callback: Command) {
        self.submit(Verb::Noop, callback);
    }

    fn abort_all(&self) {
        self.cancel_reads();
    }

    fn is_connected(&self) -> bool {
        self.master.connection().is_connected()
    }

    fn can_accept(&self) -> bool {
        self.master.connection().can_accept()
    }
}

impl CommandTarget for SharedConnectionSlave {
    fn execute_command(&self, command: Command) {
        match command.opcode() {
            CMD_HANDLEREAD => self.handle_read(command),
            CMD_HANDLETIMEOUTS => self.handle_timeouts(),
            other => fatal(format!("slave {}: unknown opcode {other}", self.id)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        command::target_fn,
        connection::{DummyTransport, WorkerConnection},
    };

    fn slave() -> (WorkScheduler, Arc<SharedConnectionSlave>) {
        let scheduler = WorkScheduler::new().unwrap();
        let (transport, _handle) = DummyTransport::echo();
        let real = WorkerConnection::spawn("real", transport, scheduler.clone()).unwrap();
        let master = SharedConnectionMaster::new("bus", Arc::new(real), scheduler.clone());
        (scheduler.clone(), SharedConnectionSlave::new(master, scheduler))
    }

    fn data(bytes: &'static [u8]) -> Command {
        let mut result = Command::new(TARGETED_MIN + 50, target_fn(|_| {}));
        result
            .add(keys::RECEIVE_DATA, Bytes::from_static(bytes))
            .set_status(status::OK);
        result
    }

    #[test]
    fn test_unrequested_data_is_buffered_for_next_read() {
        let (scheduler, slave) = slave();
        slave.deliver_read(&data(b"abc"));
        slave.deliver_read(&data(b"def"));
        while scheduler.dispatch_one(false) {}

        let (tx, rx) = flume::unbounded();
        slave.receive(Command::new(
            TARGETED_MIN + 51,
            target_fn(move |cmd| {
                let _ = tx.send(cmd);
            }),
        ));
        // Served from the buffer, no listen read needed.
        assert_eq!(slave.master().listener_count(), 0);
        assert_eq!(slave.pending_reads(), 0);
        assert!(scheduler.dispatch_one(false));
        let result = rx.try_recv().unwrap();
        assert_eq!(
            result.get::<Bytes>(keys::RECEIVE_DATA).unwrap(),
            Bytes::from_static(b"abcdef")
        );
    }

    #[test]
    fn test_connect_clears_buffer() {
        let (scheduler, slave) = slave();
        slave.deliver_read(&data(b"stale"));
        while scheduler.dispatch_one(false) {}

        slave.connect(Command::new(TARGETED_MIN + 52, target_fn(|_| {})));
        assert!(slave.state.lock().read_buffer.is_empty());
    }

    #[test]
    fn test_closing_call_releases_ticket() {
        let (_scheduler, slave) = slave();
        let mut first = Command::new(TARGETED_MIN + 53, target_fn(|_| {})).with(keys::ATOMIC, true);
        let ticket = slave.handle_tickets(&mut first);
        assert_ne!(ticket, 0);
        assert_eq!(slave.current_ticket(), ticket);

        // Flag absent mid-block still closes it.
        let mut last = Command::new(TARGETED_MIN + 54, target_fn(|_| {}));
        assert_eq!(slave.handle_tickets(&mut last), ticket);
        assert_eq!(last.get::<Ticket>(keys::TICKET).unwrap(), ticket);
        assert_eq!(slave.current_ticket(), 0);

        let mut plain = Command::new(TARGETED_MIN + 55, target_fn(|_| {}));
        assert_eq!(slave.handle_tickets(&mut plain), 0);
        assert!(!plain.payload().contains(keys::TICKET));
    }

    #[test]
    fn test_abort_cancels_pending_reads() {
        let (scheduler, slave) = slave();
        let (tx, rx) = flume::unbounded();
        slave.receive(
            Command::new(
                TARGETED_MIN + 56,
                target_fn(move |cmd| {
                    let _ = tx.send(cmd);
                }),
            )
            .with(keys::TIMEOUT, Duration::from_secs(30)),
        );
        assert_eq!(slave.pending_reads(), 1);
        assert_eq!(slave.master().listener_count(), 1);

        slave.abort_all();
        assert_eq!(slave.master().listener_count(), 0);
        assert_eq!(slave.master().read_deadline(), None);
        while scheduler.dispatch_one(false) {}
        assert_eq!(rx.try_recv().unwrap().status(), status::ECANCELED);
    }

    #[test]
    fn test_disconnect_ends_reads_and_closes_window() {
        let (scheduler, slave) = slave();
        let (tx, rx) = flume::unbounded();
        slave.receive(
            Command::new(
                TARGETED_MIN + 57,
                target_fn(move |cmd| {
                    let _ = tx.send(cmd);
                }),
            )
            .with(keys::TIMEOUT, Duration::from_secs(30)),
        );
        assert!(slave.master().read_deadline().is_some());

        slave.disconnect(Command::new(TARGETED_MIN + 58, target_fn(|_| {})));
        assert_eq!(slave.pending_reads(), 0);
        assert_eq!(slave.master().listener_count(), 0);
        assert_eq!(slave.master().read_deadline(), None);
        while scheduler.dispatch_one(false) {}
        assert_eq!(rx.try_recv().unwrap().status(), status::ECANCELED);
    }
}
