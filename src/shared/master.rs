use parking_lot::Mutex;
use std::{
    collections::{BTreeMap, VecDeque},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Weak,
    },
    time::Instant,
};

use super::{slave::SharedConnectionSlave, SlaveId, Ticket};
use crate::{
    command::{fatal, keys, opcode::TARGETED_MIN, Command, CommandTarget},
    connection::{status, Connection, Verb},
    scheduler::WorkScheduler,
};

/// Completion of an intercepted closing call.
const CMD_BLOCK_END: u32 = TARGETED_MIN;
/// Completion of the listen read shared by all subscribed slaves.
const CMD_LISTEN_DONE: u32 = TARGETED_MIN + 1;

/// Tags listen reads so completions of an aborted read can be told apart.
const LISTEN_GENERATION: &str = "listen_generation";

struct Pending {
    verb: Verb,
    command: Command,
}

impl Pending {
    fn more_follow(&self) -> bool {
        self.command.optional::<bool>(keys::ATOMIC).unwrap_or(false)
    }
}

#[derive(Default)]
struct MasterState {
    last_ticket: Ticket,
    active_ticket: Ticket,
    atomic_pending: BTreeMap<Ticket, VecDeque<Pending>>,
    non_atomic: VecDeque<Pending>,
    closing_command: Option<Command>,
    read_deadline: Option<Instant>,
    listen_outstanding: bool,
    listen_generation: u64,
    listeners: BTreeMap<SlaveId, Weak<SharedConnectionSlave>>,
    owner: Option<SlaveId>,
}

/// Exclusive owner of the real connection.
///
/// Slaves hand their calls to [`submit`](Self::submit). Calls of one atomic
/// block (same ticket) reach the real connection back to back; everything
/// else waits for the block boundary.
pub struct SharedConnectionMaster {
    name: String,
    connection: Arc<dyn Connection>,
    scheduler: WorkScheduler,
    me: Weak<SharedConnectionMaster>,
    next_slave: AtomicU64,
    state: Mutex<MasterState>,
}

impl SharedConnectionMaster {
    pub fn new(
        name: impl Into<String>,
        connection: Arc<dyn Connection>,
        scheduler: WorkScheduler,
    ) -> Arc<Self> {
        let name = name.into();
        Arc::new_cyclic(|me| Self {
            name,
            connection,
            scheduler,
            me: me.clone(),
            next_slave: AtomicU64::new(1),
            state: Mutex::new(MasterState::default()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn connection(&self) -> &Arc<dyn Connection> {
        &self.connection
    }

    pub(crate) fn register_slave(&self) -> SlaveId {
        self.next_slave.fetch_add(1, Ordering::Relaxed)
    }

    /// Make `slave` the only one allowed to really disconnect.
    pub(crate) fn bind_owner(&self, slave: SlaveId) {
        self.state.lock().owner = Some(slave);
    }

    /// Next ticket. Never returns `0`, wraps around on overflow.
    pub fn get_ticket(&self) -> Ticket {
        let mut state = self.state.lock();
        state.last_ticket = state.last_ticket.wrapping_add(1);
        if state.last_ticket == 0 {
            state.last_ticket = 1;
        }
        log::debug!("{}: issued ticket {}", self.name, state.last_ticket);
        state.last_ticket
    }

    /// Ticket of the block that currently owns the connection, `0` if none.
    pub fn active_ticket(&self) -> Ticket {
        self.state.lock().active_ticket
    }

    pub fn read_deadline(&self) -> Option<Instant> {
        self.state.lock().read_deadline
    }

    pub fn listener_count(&self) -> usize {
        self.state.lock().listeners.len()
    }

    /// Sequence one call of `slave` onto the real connection.
    pub(crate) fn submit(&self, slave: SlaveId, verb: Verb, command: Command) {
        let mut state = self.state.lock();
        let verb = if verb == Verb::Disconnect && state.owner != Some(slave) {
            log::debug!("{}: disconnect from non-owner {slave} downgraded to noop", self.name);
            Verb::Noop
        } else {
            verb
        };
        let ticket = command.optional::<Ticket>(keys::TICKET).unwrap_or(0);
        self.sequence(&mut state, ticket, Pending { verb, command });
    }

    fn sequence(&self, state: &mut MasterState, ticket: Ticket, pending: Pending) {
        if ticket == 0 {
            if state.active_ticket == 0 {
                self.forward(pending);
            } else {
                state.non_atomic.push_back(pending);
            }
            return;
        }

        if state.active_ticket == 0 {
            state.active_ticket = ticket;
            log::debug!("{}: block {ticket} started", self.name);
        }
        if ticket == state.active_ticket {
            self.forward_atomic(state, pending);
        } else {
            state
                .atomic_pending
                .entry(ticket)
                .or_default()
                .push_back(pending);
        }
    }

    /// Forward a call of the active block. The closing call is swapped for
    /// one completing here, so the block end is observed before the caller
    /// gets the result.
    fn forward_atomic(&self, state: &mut MasterState, pending: Pending) {
        if pending.more_follow() {
            self.forward(pending);
            return;
        }
        if state.closing_command.is_some() {
            fatal(format!(
                "{}: block {} closed twice",
                self.name, state.active_ticket
            ));
        }
        let mut substitute = Command::new(CMD_BLOCK_END, self.as_target());
        substitute.payload_mut().merge(pending.command.payload());
        state.closing_command = Some(pending.command);
        self.forward(Pending {
            verb: pending.verb,
            command: substitute,
        });
    }

    fn forward(&self, pending: Pending) {
        self.connection.submit(pending.verb, pending.command);
    }

    fn end_block(&self, result: Command) {
        let mut state = self.state.lock();
        let Some(mut closing) = state.closing_command.take() else {
            fatal(format!("{}: block end without a closing command", self.name));
        };
        closing.merge(&result);
        self.scheduler.schedule_now(closing);

        let ended = std::mem::take(&mut state.active_ticket);
        log::debug!(
            "{}: block {ended} ended, {} non-atomic and {} blocks waiting",
            self.name,
            state.non_atomic.len(),
            state.atomic_pending.len()
        );

        while let Some(pending) = state.non_atomic.pop_front() {
            self.forward(pending);
        }

        let Some((ticket, queue)) = state.atomic_pending.pop_first() else {
            return;
        };
        state.active_ticket = ticket;
        log::debug!("{}: block {ticket} started from backlog", self.name);
        let mut queue = queue.into_iter();
        while let Some(pending) = queue.next() {
            let closes = !pending.more_follow();
            self.forward_atomic(&mut state, pending);
            if closes {
                let rest: VecDeque<Pending> = queue.collect();
                if !rest.is_empty() {
                    state.atomic_pending.insert(ticket, rest);
                }
                break;
            }
        }
    }

    /// Subscribe `slave` to the shared listen read, extending the window to
    /// `deadline` when needed.
    pub(crate) fn listen(
        &self,
        slave: SlaveId,
        handle: Weak<SharedConnectionSlave>,
        deadline: Instant,
    ) {
        let mut state = self.state.lock();
        state.listeners.insert(slave, handle);
        let window = state.read_deadline.map_or(deadline, |current| current.max(deadline));
        state.read_deadline = Some(window);
        if !state.listen_outstanding {
            state.listen_outstanding = true;
            self.issue_listen(&mut state, window);
        }
    }

    /// Drop `slave` from the listener set. The window closes with the last
    /// listener; a read still outstanding completes into an empty set.
    pub(crate) fn unlisten(&self, slave: SlaveId) {
        let mut state = self.state.lock();
        state.listeners.remove(&slave);
        if state.listeners.is_empty() {
            state.read_deadline = None;
        }
    }

    fn issue_listen(&self, state: &mut MasterState, deadline: Instant) {
        let remaining = deadline.saturating_duration_since(Instant::now());
        log::debug!("{}: listening for {remaining:?}", self.name);
        let command = Command::new(CMD_LISTEN_DONE, self.as_target())
            .with(keys::TIMEOUT, remaining)
            .with(LISTEN_GENERATION, state.listen_generation);
        self.sequence(
            state,
            0,
            Pending {
                verb: Verb::Receive,
                command,
            },
        );
    }

    fn listen_done(&self, mut result: Command) {
        let mut state = self.state.lock();
        if result.require::<u64>(LISTEN_GENERATION) != state.listen_generation {
            log::debug!("{}: stale listen result dropped", self.name);
            return;
        }
        state.listen_outstanding = false;
        let code = result.status();
        state.listeners.retain(|_, slave| slave.strong_count() > 0);

        if status::is_timeout_or_cancel(code) {
            let now = Instant::now();
            match state.read_deadline {
                Some(deadline) if deadline > now && !state.listeners.is_empty() => {
                    log::debug!("{}: listen read reissued", self.name);
                    state.listen_outstanding = true;
                    self.issue_listen(&mut state, deadline);
                }
                _ => {
                    log::debug!("{}: listen read stopped", self.name);
                    state.read_deadline = None;
                }
            }
            return;
        }

        state.read_deadline = None;
        let listeners = std::mem::take(&mut state.listeners);
        drop(state);

        result.remove(keys::TIMEOUT);
        result.remove(LISTEN_GENERATION);
        log::debug!("{}: listen result fanned out to {}", self.name, listeners.len());
        for slave in listeners.values().filter_map(Weak::upgrade) {
            slave.deliver_read(&result);
        }
    }

    /// Cancel everything held here or queued on the real connection.
    ///
    /// Subscribed slaves get an `ECANCELED` listen result, so none of them
    /// keeps waiting on a read that is no longer issued.
    pub fn abort_all(&self) {
        let (canceled, listeners) = {
            let mut state = self.state.lock();
            state.read_deadline = None;
            state.listen_outstanding = false;
            state.listen_generation = state.listen_generation.wrapping_add(1);
            let listeners = std::mem::take(&mut state.listeners);
            let atomic = std::mem::take(&mut state.atomic_pending);
            let canceled: Vec<Command> = state
                .non_atomic
                .drain(..)
                .chain(atomic.into_values().flatten())
                .map(|pending| pending.command)
                .collect();
            (canceled, listeners)
        };
        log::info!(
            "{}: aborting {} held commands, {} listeners and the real connection",
            self.name,
            canceled.len(),
            listeners.len()
        );
        for mut command in canceled {
            command.set_error(status::ECANCELED, "aborted");
            self.scheduler.schedule_now(command);
        }
        if !listeners.is_empty() {
            let mut result = Command::new(CMD_LISTEN_DONE, self.as_target());
            result.set_error(status::ECANCELED, "aborted");
            for slave in listeners.values().filter_map(Weak::upgrade) {
                slave.deliver_read(&result);
            }
        }
        self.connection.abort_all();
    }

    fn as_target(&self) -> Arc<dyn CommandTarget> {
        match self.me.upgrade() {
            Some(me) => me as Arc<dyn CommandTarget>,
            None => fatal(format!("{}: master used while being dropped", self.name)),
        }
    }
}

impl CommandTarget for SharedConnectionMaster {
    fn execute_command(&self, command: Command) {
        match command.opcode() {
            CMD_BLOCK_END => self.end_block(command),
            CMD_LISTEN_DONE => self.listen_done(command),
            other => fatal(format!("{}: unknown opcode {other}", self.name)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{DummyTransport, WorkerConnection};

    fn master() -> Arc<SharedConnectionMaster> {
        let scheduler = WorkScheduler::new().unwrap();
        let (transport, _handle) = DummyTransport::echo();
        let real = WorkerConnection::spawn("real", transport, scheduler.clone()).unwrap();
        SharedConnectionMaster::new("bus", Arc::new(real), scheduler)
    }

    #[test]
    fn test_tickets_increase_and_skip_zero() {
        let master = master();
        assert_eq!(master.get_ticket(), 1);
        assert_eq!(master.get_ticket(), 2);

        master.state.lock().last_ticket = Ticket::MAX - 1;
        assert_eq!(master.get_ticket(), Ticket::MAX);
        assert_eq!(master.get_ticket(), 1);
    }

    #[test]
    fn test_idle_master_has_no_block_or_window() {
        let master = master();
        assert_eq!(master.active_ticket(), 0);
        assert_eq!(master.read_deadline(), None);
        assert_eq!(master.listener_count(), 0);
    }
}
