use anyhow::{anyhow, Result};
use flume::{Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::Instant,
};

use crate::command::Command;

/// Deadline plus insertion sequence, so equal deadlines expire in FIFO order.
type TimedKey = (Instant, u64);

struct TimedState {
    entries: Mutex<BTreeMap<TimedKey, Command>>,
    seq: AtomicU64,
    stop: AtomicBool,
}

/// Deferred commands, released into the ready queue once their deadline
/// has passed.
///
/// A single thread sleeps until the nearest deadline. Inserting an entry
/// that becomes the new nearest deadline wakes it early.
pub struct TimedWork {
    state: Arc<TimedState>,
    wake_tx: Sender<()>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl TimedWork {
    pub fn spawn(sink: Sender<Command>) -> Result<Self> {
        let state = Arc::new(TimedState {
            entries: Mutex::new(BTreeMap::new()),
            seq: AtomicU64::new(0),
            stop: AtomicBool::new(false),
        });
        let (wake_tx, wake_rx) = flume::unbounded();

        let thread_state = Arc::clone(&state);
        let handle = thread::Builder::new()
            .name("timed-work".to_string())
            .spawn(move || run_loop(thread_state, wake_rx, sink))
            .map_err(|err| anyhow!("failed to spawn timed work thread: {err}"))?;

        Ok(Self {
            state,
            wake_tx,
            handle: Mutex::new(Some(handle)),
        })
    }

    pub fn schedule_at(&self, deadline: Instant, command: Command) {
        let seq = self.state.seq.fetch_add(1, Ordering::Relaxed);
        let nearest = {
            let mut entries = self.state.entries.lock();
            let nearest = entries
                .keys()
                .next()
                .map_or(true, |(first, _)| deadline < *first);
            entries.insert((deadline, seq), command);
            nearest
        };
        if nearest {
            let _ = self.wake_tx.send(());
        }
    }

    /// Number of commands still waiting for their deadline.
    pub fn pending(&self) -> usize {
        self.state.entries.lock().len()
    }

    /// Stop the timer thread. Commands still waiting are dropped.
    pub fn stop(&self) {
        self.state.stop.store(true, Ordering::Release);
        let _ = self.wake_tx.send(());

        let Some(handle) = self.handle.lock().take() else {
            return;
        };
        if handle.thread().id() == thread::current().id() {
            return;
        }
        if handle.join().is_err() {
            log::warn!("timed work thread panicked");
        }

        let dropped = {
            let mut entries = self.state.entries.lock();
            let dropped = entries.len();
            entries.clear();
            dropped
        };
        if dropped > 0 {
            log::debug!("timed work stopped with {dropped} deferred commands pending");
        }
    }
}

impl Drop for TimedWork {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_loop(state: Arc<TimedState>, wake_rx: Receiver<()>, sink: Sender<Command>) {
    log::debug!("timed work thread started");
    loop {
        if state.stop.load(Ordering::Acquire) {
            break;
        }

        let now = Instant::now();
        let mut due = Vec::new();
        let next = {
            let mut entries = state.entries.lock();
            while let Some(entry) = entries.first_entry() {
                if entry.key().0 > now {
                    break;
                }
                due.push(entry.remove());
            }
            entries.keys().next().map(|(deadline, _)| *deadline)
        };

        for command in due {
            if sink.send(command).is_err() {
                log::warn!("ready queue closed, dropping expired command");
            }
        }

        let woke = match next {
            Some(deadline) => match wake_rx.recv_deadline(deadline) {
                Ok(()) | Err(RecvTimeoutError::Timeout) => true,
                Err(RecvTimeoutError::Disconnected) => false,
            },
            None => wake_rx.recv().is_ok(),
        };
        if !woke {
            break;
        }
        // Coalesce wake-ups, the state is re-read at the top of the loop.
        while wake_rx.try_recv().is_ok() {}
    }
    log::debug!("timed work thread stopped");
}
