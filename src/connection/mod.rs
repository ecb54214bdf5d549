pub mod dummy;
pub mod factory;
pub mod serial;
pub mod status;
pub mod tcp;
pub mod worker;

pub use dummy::{DummyHandle, DummyTransport};
pub use factory::ConnectionFactory;
pub use serial::{SerialSettings, SerialTransport};
pub use status::TransportError;
pub use tcp::{TcpMode, TcpTransport};
pub use worker::{Transport, WorkerConnection};

use std::time::Duration;

use crate::command::Command;

/// Receive timeout used when a command does not carry its own.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(3000);

/// One connection verb.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum Verb {
    Connect,
    Disconnect,
    Send,
    Receive,
    Accept,
    Noop,
}

/// Asynchronous transport capability set.
///
/// Every verb takes the completion command, queues the request and returns.
/// The completion is delivered through the scheduler exactly once, never
/// from inside the call, with the status code in `keys::ERRNO`.
pub trait Connection: Send + Sync {
    fn connect(&self, callback: Command);
    fn disconnect(&self, callback: Command);
    fn send(&self, callback: Command);
    fn receive(&self, callback: Command);
    fn accept(&self, callback: Command);
    fn noop(&self, callback: Command);

    /// Complete every queued and in-flight request with `ECANCELED`.
    fn abort_all(&self);

    fn is_connected(&self) -> bool;
    fn can_accept(&self) -> bool;

    fn submit(&self, verb: Verb, callback: Command) {
        match verb {
            Verb::Connect => self.connect(callback),
            Verb::Disconnect => self.disconnect(callback),
            Verb::Send => self.send(callback),
            Verb::Receive => self.receive(callback),
            Verb::Accept => self.accept(callback),
            Verb::Noop => self.noop(callback),
        }
    }
}
