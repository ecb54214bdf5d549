pub mod keys;
pub mod opcode;
pub mod payload;

pub use payload::{Payload, PayloadError, PayloadValue, Value, ValueKind};

use std::{fmt, sync::Arc, time::Duration};

/// Anything that reacts to dispatched work.
///
/// `execute_command` always runs on the dispatcher thread, one command at a
/// time. The command is handed over by value and the target owns it from
/// then on.
pub trait CommandTarget: Send + Sync {
    fn execute_command(&self, command: Command);
}

struct FnTarget<F>(F);

impl<F> CommandTarget for FnTarget<F>
where
    F: Fn(Command) + Send + Sync,
{
    fn execute_command(&self, command: Command) {
        (self.0)(command)
    }
}

/// Wrap a closure as a [`CommandTarget`].
pub fn target_fn<F>(f: F) -> Arc<dyn CommandTarget>
where
    F: Fn(Command) + Send + Sync + 'static,
{
    Arc::new(FnTarget(f))
}

pub(crate) enum Target {
    Broadcast,
    Object(Arc<dyn CommandTarget>),
    Waiter(oneshot::Sender<Command>),
    /// A delivered waiter command.
    Released,
}

/// Unit of asynchronous work: an opcode, a target and a typed payload.
pub struct Command {
    opcode: u32,
    target: Target,
    payload: Payload,
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let target = match &self.target {
            Target::Broadcast => "broadcast",
            Target::Object(_) => "object",
            Target::Waiter(_) => "waiter",
            Target::Released => "released",
        };
        f.debug_struct("Command")
            .field("opcode", &self.opcode)
            .field("target", &target)
            .field("payload", &self.payload)
            .finish()
    }
}

/// Log and abort on a broken internal contract.
#[track_caller]
pub(crate) fn fatal(message: impl fmt::Display) -> ! {
    log::error!("fatal: {message}");
    panic!("{message}");
}

impl Command {
    /// Targeted command. `opcode` must not be in the broadcast range.
    #[track_caller]
    pub fn new(opcode: u32, target: Arc<dyn CommandTarget>) -> Self {
        if opcode::is_broadcast(opcode) {
            fatal(format!("targeted command uses broadcast opcode {opcode}"));
        }
        Self {
            opcode,
            target: Target::Object(target),
            payload: Payload::new(),
        }
    }

    /// Broadcast command. `opcode` must be in the broadcast range.
    #[track_caller]
    pub fn broadcast(opcode: u32) -> Self {
        if !opcode::is_broadcast(opcode) {
            fatal(format!("broadcast command uses targeted opcode {opcode}"));
        }
        Self {
            opcode,
            target: Target::Broadcast,
            payload: Payload::new(),
        }
    }

    /// Command for a synchronous caller: scheduling it releases the returned
    /// [`Completion`] instead of dispatching to a target. `opcode` must be
    /// a targeted one.
    #[track_caller]
    pub fn waiter(opcode: u32) -> (Self, Completion) {
        if opcode::is_broadcast(opcode) {
            fatal(format!("waiter command uses broadcast opcode {opcode}"));
        }
        let (tx, rx) = oneshot::channel();
        let command = Self {
            opcode,
            target: Target::Waiter(tx),
            payload: Payload::new(),
        };
        (command, Completion { rx })
    }

    pub fn opcode(&self) -> u32 {
        self.opcode
    }

    pub fn is_broadcast(&self) -> bool {
        matches!(self.target, Target::Broadcast)
    }

    pub fn target(&self) -> Option<&Arc<dyn CommandTarget>> {
        match &self.target {
            Target::Object(target) => Some(target),
            _ => None,
        }
    }

    /// Split off the target for delivery by the scheduler.
    pub(crate) fn into_delivery(mut self) -> Delivery {
        match std::mem::replace(&mut self.target, Target::Released) {
            Target::Object(target) => {
                self.target = Target::Object(Arc::clone(&target));
                Delivery::Target(target, self)
            }
            Target::Broadcast => {
                self.target = Target::Broadcast;
                Delivery::Broadcast(self)
            }
            Target::Waiter(tx) => Delivery::Waiter(tx, self),
            Target::Released => Delivery::Released(self),
        }
    }

    /// Payload-identical copy of a broadcast command, one per subscriber.
    pub(crate) fn broadcast_copy(opcode: u32, payload: &Payload) -> Self {
        Self {
            opcode,
            target: Target::Broadcast,
            payload: payload.clone(),
        }
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn payload_mut(&mut self) -> &mut Payload {
        &mut self.payload
    }

    pub fn add<T: PayloadValue>(&mut self, key: &str, value: T) -> &mut Self {
        self.payload.insert(key, value);
        self
    }

    pub fn with<T: PayloadValue>(mut self, key: &str, value: T) -> Self {
        self.payload.insert(key, value);
        self
    }

    pub fn get<T: PayloadValue>(&self, key: &str) -> Result<T, PayloadError> {
        self.payload.get(key)
    }

    pub fn find<T: PayloadValue>(&self, key: &str) -> Result<Option<T>, PayloadError> {
        self.payload.find(key)
    }

    /// Lookup of a key the caller relies on; a miss is a programming error.
    #[track_caller]
    pub fn require<T: PayloadValue>(&self, key: &str) -> T {
        match self.payload.get(key) {
            Ok(value) => value,
            Err(err) => fatal(format!("opcode {}: {err}", self.opcode)),
        }
    }

    /// Optional key; present with the wrong type is a programming error.
    #[track_caller]
    pub fn optional<T: PayloadValue>(&self, key: &str) -> Option<T> {
        match self.payload.find(key) {
            Ok(value) => value,
            Err(err) => fatal(format!("opcode {}: {err}", self.opcode)),
        }
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.payload.remove(key)
    }

    /// Copy every payload entry of `other` into this command.
    pub fn merge(&mut self, other: &Command) {
        self.payload.merge(&other.payload);
    }

    /// Status code of a completed command, `0` when none was written.
    #[track_caller]
    pub fn status(&self) -> i32 {
        self.optional::<i32>(keys::ERRNO).unwrap_or(0)
    }

    pub fn is_ok(&self) -> bool {
        self.status() == 0
    }

    pub fn set_status(&mut self, status: i32) -> &mut Self {
        self.payload.insert(keys::ERRNO, status);
        if status == 0 {
            self.payload.remove(keys::ERRNO_MSG);
        }
        self
    }

    pub fn set_error(&mut self, status: i32, message: impl Into<String>) -> &mut Self {
        self.payload.insert(keys::ERRNO, status);
        self.payload.insert(keys::ERRNO_MSG, message.into());
        self
    }

    pub fn error_message(&self) -> Option<String> {
        self.payload.find::<String>(keys::ERRNO_MSG).ok().flatten()
    }
}

/// Failure waiting on a [`Command::waiter`] completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum CompletionError {
    #[error("command was dropped before completion")]
    Dropped,
    #[error("timed out waiting for completion")]
    Timeout,
}

/// Receiving half of a synchronous command.
pub struct Completion {
    rx: oneshot::Receiver<Command>,
}

impl Completion {
    pub fn wait(self) -> Result<Command, CompletionError> {
        self.rx.recv().map_err(|_| CompletionError::Dropped)
    }

    pub fn wait_timeout(&self, timeout: Duration) -> Result<Command, CompletionError> {
        self.rx.recv_timeout(timeout).map_err(|err| match err {
            oneshot::RecvTimeoutError::Timeout => CompletionError::Timeout,
            oneshot::RecvTimeoutError::Disconnected => CompletionError::Dropped,
        })
    }
}

pub(crate) enum Delivery {
    Target(Arc<dyn CommandTarget>, Command),
    Broadcast(Command),
    Waiter(oneshot::Sender<Command>, Command),
    Released(Command),
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn test_targeted_and_broadcast_construction() {
        let target = target_fn(|_| {});
        let cmd = Command::new(opcode::TARGETED_MIN + 1, target);
        assert!(!cmd.is_broadcast());
        assert!(cmd.target().is_some());

        let brc = Command::broadcast(opcode::BRC_SHUTDOWN);
        assert!(brc.is_broadcast());
        assert!(brc.target().is_none());
    }

    #[test]
    #[should_panic]
    fn test_targeted_command_rejects_broadcast_opcode() {
        let _ = Command::new(opcode::BRC_SHUTDOWN, target_fn(|_| {}));
    }

    #[test]
    #[should_panic]
    fn test_broadcast_rejects_targeted_opcode() {
        let _ = Command::broadcast(opcode::BROADCAST_LIMIT);
    }

    #[test]
    #[should_panic]
    fn test_waiter_rejects_broadcast_opcode() {
        let _ = Command::waiter(opcode::BRC_SHUTDOWN);
    }

    #[test]
    fn test_merge_then_read_returns_source_value() {
        let mut a = Command::new(200, target_fn(|_| {}));
        a.add(keys::RECEIVE_DATA, Bytes::from_static(b"\x01\x02"))
            .add(keys::ERRNO, -110i32);
        let mut b = Command::new(201, target_fn(|_| {})).with(keys::ERRNO, 0i32);

        b.merge(&a);
        assert_eq!(
            b.get::<Bytes>(keys::RECEIVE_DATA).unwrap(),
            Bytes::from_static(b"\x01\x02")
        );
        assert_eq!(b.status(), -110);
        assert_eq!(b.opcode(), 201);
    }

    #[test]
    fn test_status_and_error_message() {
        let mut cmd = Command::new(300, target_fn(|_| {}));
        assert_eq!(cmd.status(), 0);
        cmd.set_error(-5, "link down");
        assert_eq!(cmd.status(), -5);
        assert_eq!(cmd.error_message().as_deref(), Some("link down"));
        cmd.set_status(0);
        assert!(cmd.is_ok());
        assert_eq!(cmd.error_message(), None);
    }

    #[test]
    fn test_waiter_times_out_then_drops() {
        let (cmd, completion) = Command::waiter(400);
        assert_eq!(
            completion.wait_timeout(Duration::from_millis(10)).unwrap_err(),
            CompletionError::Timeout
        );
        drop(cmd);
        assert_eq!(completion.wait().unwrap_err(), CompletionError::Dropped);
    }
}
