pub mod timed;

pub use timed::TimedWork;

use anyhow::Result;
use flume::{Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use crate::command::{opcode, Command, CommandTarget, Delivery};

struct Inner {
    ready_tx: Sender<Command>,
    ready_rx: Receiver<Command>,
    broadcast_targets: Mutex<Vec<Arc<dyn CommandTarget>>>,
    timed: TimedWork,
    shutdown_seen: AtomicBool,
}

/// Ready queue plus dispatcher.
///
/// Any thread may schedule work. Exactly one thread should dispatch it
/// (`dispatch_one` or `run`), which is what lets targets keep their state
/// free of races between completions.
#[derive(Clone)]
pub struct WorkScheduler {
    inner: Arc<Inner>,
}

impl WorkScheduler {
    pub fn new() -> Result<Self> {
        let (ready_tx, ready_rx) = flume::unbounded();
        Self::with_queue(ready_tx, ready_rx)
    }

    /// Scheduler whose ready queue holds at most `capacity` commands.
    /// [`schedule_now`](Self::schedule_now) then waits for room, while
    /// [`try_schedule_now`](Self::try_schedule_now) fails.
    pub fn with_capacity(capacity: usize) -> Result<Self> {
        let (ready_tx, ready_rx) = flume::bounded(capacity);
        Self::with_queue(ready_tx, ready_rx)
    }

    fn with_queue(ready_tx: Sender<Command>, ready_rx: Receiver<Command>) -> Result<Self> {
        let timed = TimedWork::spawn(ready_tx.clone())?;
        Ok(Self {
            inner: Arc::new(Inner {
                ready_tx,
                ready_rx,
                broadcast_targets: Mutex::new(Vec::new()),
                timed,
                shutdown_seen: AtomicBool::new(false),
            }),
        })
    }

    /// Queue `command` for immediate dispatch.
    ///
    /// Waiter commands skip the queue and release their caller right away.
    pub fn schedule_now(&self, command: Command) {
        let command = match command.into_delivery() {
            Delivery::Waiter(tx, command) => return release(tx, command),
            Delivery::Target(_, command)
            | Delivery::Broadcast(command)
            | Delivery::Released(command) => command,
        };
        if self.inner.ready_tx.send(command).is_err() {
            log::warn!("ready queue closed, dropping command");
        }
    }

    /// Non-blocking variant of [`schedule_now`](Self::schedule_now). The
    /// command is handed back when the queue is full or closed; the caller
    /// retries later.
    ///
    /// The channel's own lock is still taken briefly, so this is not safe
    /// from a real signal handler. `ctrlc` runs its handler on an ordinary
    /// thread, which is where it is used.
    pub fn try_schedule_now(&self, command: Command) -> Result<(), Command> {
        let command = match command.into_delivery() {
            Delivery::Waiter(tx, command) => {
                release(tx, command);
                return Ok(());
            }
            Delivery::Target(_, command)
            | Delivery::Broadcast(command)
            | Delivery::Released(command) => command,
        };
        match self.inner.ready_tx.try_send(command) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(command)) | Err(TrySendError::Disconnected(command)) => {
                Err(command)
            }
        }
    }

    pub fn schedule_after(&self, command: Command, delay: Duration) {
        self.inner.timed.schedule_at(Instant::now() + delay, command);
    }

    pub fn schedule_at(&self, command: Command, deadline: Instant) {
        self.inner.timed.schedule_at(deadline, command);
    }

    /// Add (`subscribe == true`) or remove `target` from the broadcast
    /// fan-out set. Targets are compared by identity.
    pub fn register_broadcasts(&self, target: &Arc<dyn CommandTarget>, subscribe: bool) {
        let mut targets = self.inner.broadcast_targets.lock();
        let position = targets.iter().position(|t| same_target(t, target));
        match (subscribe, position) {
            (true, None) => targets.push(Arc::clone(target)),
            (false, Some(index)) => {
                targets.remove(index);
            }
            _ => {}
        }
    }

    /// Consume and dispatch one ready command.
    ///
    /// With `block` the call waits until a command is available. Returns
    /// `false` when nothing was dispatched.
    pub fn dispatch_one(&self, block: bool) -> bool {
        let command = if block {
            match self.inner.ready_rx.recv() {
                Ok(command) => command,
                Err(_) => return false,
            }
        } else {
            match self.inner.ready_rx.try_recv() {
                Ok(command) => command,
                Err(_) => return false,
            }
        };
        self.dispatch(command);
        true
    }

    /// Dispatch until the shutdown broadcast went out, then drain what is
    /// already queued without waiting and return.
    pub fn run(&self) {
        log::debug!("dispatcher started");
        while !self.is_shutting_down() {
            self.dispatch_one(true);
        }
        let mut drained = 0usize;
        while self.dispatch_one(false) {
            drained += 1;
        }
        log::debug!("dispatcher stopped, drained {drained} commands after shutdown");
    }

    /// Queue the shutdown broadcast.
    pub fn request_shutdown(&self) {
        self.schedule_now(Command::broadcast(opcode::BRC_SHUTDOWN));
    }

    /// `true` once the shutdown broadcast has been dispatched.
    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutdown_seen.load(Ordering::Acquire)
    }

    /// Commands waiting in the ready queue.
    pub fn pending(&self) -> usize {
        self.inner.ready_rx.len()
    }

    /// Commands waiting for their deadline.
    pub fn deferred(&self) -> usize {
        self.inner.timed.pending()
    }

    /// Stop the timer thread. Deferred commands are dropped.
    pub fn stop_timers(&self) {
        self.inner.timed.stop();
    }

    fn dispatch(&self, command: Command) {
        match command.into_delivery() {
            Delivery::Target(target, command) => target.execute_command(command),
            Delivery::Broadcast(command) => self.fan_out(command),
            Delivery::Waiter(tx, command) => release(tx, command),
            Delivery::Released(command) => {
                log::warn!(
                    "dropping already completed command, opcode {}",
                    command.opcode()
                );
            }
        }
    }

    fn fan_out(&self, command: Command) {
        let opcode = command.opcode();
        if opcode == opcode::BRC_SHUTDOWN {
            self.inner.shutdown_seen.store(true, Ordering::Release);
        }
        let targets = self.inner.broadcast_targets.lock().clone();
        log::debug!("broadcast {opcode} to {} targets", targets.len());
        for target in targets {
            target.execute_command(Command::broadcast_copy(opcode, command.payload()));
        }
    }
}

fn same_target(a: &Arc<dyn CommandTarget>, b: &Arc<dyn CommandTarget>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

fn release(tx: oneshot::Sender<Command>, command: Command) {
    let opcode = command.opcode();
    if tx.send(command).is_err() {
        log::debug!("waiter for opcode {opcode} went away before completion");
    }
}
