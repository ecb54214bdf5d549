//! In-memory transport for tests and dry runs.
use bytes::Bytes;
use flume::{Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::{collections::VecDeque, sync::Arc, time::Duration};

use super::{Transport, TransportError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReplyMode {
    Echo,
    Scripted,
}

/// Replies to every send with the next scripted response (cycling), or
/// with the sent bytes in echo mode. Extra inbound data can be injected
/// through the [`DummyHandle`].
pub struct DummyTransport {
    mode: ReplyMode,
    script: Vec<Bytes>,
    cursor: usize,
    replies: VecDeque<Bytes>,
    connected: bool,
    can_accept: bool,
    sent: Arc<Mutex<Vec<Bytes>>>,
    inbound_rx: Receiver<Bytes>,
    // Keeps the inbound channel open when every handle is gone.
    _inbound_tx: Sender<Bytes>,
}

/// Test-side view of a [`DummyTransport`].
#[derive(Clone)]
pub struct DummyHandle {
    sent: Arc<Mutex<Vec<Bytes>>>,
    inbound_tx: Sender<Bytes>,
}

impl DummyHandle {
    /// Every frame sent so far, oldest first.
    pub fn sent(&self) -> Vec<Bytes> {
        self.sent.lock().clone()
    }

    /// Deliver `data` to the next receive, or unblock one that is waiting.
    pub fn inject(&self, data: impl Into<Bytes>) {
        let _ = self.inbound_tx.send(data.into());
    }
}

impl DummyTransport {
    pub fn echo() -> (Self, DummyHandle) {
        Self::build(ReplyMode::Echo, Vec::new())
    }

    pub fn scripted(responses: Vec<Bytes>) -> (Self, DummyHandle) {
        Self::build(ReplyMode::Scripted, responses)
    }

    /// Allow `accept` instead of `connect`, like a listening socket.
    pub fn accepting(mut self) -> Self {
        self.can_accept = true;
        self
    }

    fn build(mode: ReplyMode, script: Vec<Bytes>) -> (Self, DummyHandle) {
        let sent = Arc::new(Mutex::new(Vec::new()));
        let (inbound_tx, inbound_rx) = flume::unbounded();
        let handle = DummyHandle {
            sent: Arc::clone(&sent),
            inbound_tx: inbound_tx.clone(),
        };
        let transport = Self {
            mode,
            script,
            cursor: 0,
            replies: VecDeque::new(),
            connected: false,
            can_accept: false,
            sent,
            inbound_rx,
            _inbound_tx: inbound_tx,
        };
        (transport, handle)
    }
}

impl Transport for DummyTransport {
    fn connect(&mut self, _timeout: Duration) -> Result<(), TransportError> {
        if self.can_accept {
            return Err(TransportError::NotPermitted("connect on a listening connection"));
        }
        self.connected = true;
        Ok(())
    }

    fn disconnect(&mut self) -> Result<(), TransportError> {
        self.connected = false;
        self.replies.clear();
        Ok(())
    }

    fn send(&mut self, data: &[u8], _timeout: Duration) -> Result<(), TransportError> {
        let frame = Bytes::copy_from_slice(data);
        self.sent.lock().push(frame.clone());
        match self.mode {
            ReplyMode::Echo => self.replies.push_back(frame),
            ReplyMode::Scripted if !self.script.is_empty() => {
                let reply = self.script[self.cursor % self.script.len()].clone();
                self.cursor += 1;
                self.replies.push_back(reply);
            }
            ReplyMode::Scripted => {}
        }
        Ok(())
    }

    fn receive(
        &mut self,
        timeout: Duration,
        _interbyte: Option<Duration>,
    ) -> Result<Bytes, TransportError> {
        if let Some(reply) = self.replies.pop_front() {
            return Ok(reply);
        }
        match self.inbound_rx.recv_timeout(timeout) {
            Ok(data) => Ok(data),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {
                Err(TransportError::Timeout)
            }
        }
    }

    fn accept(&mut self, _timeout: Duration) -> Result<(), TransportError> {
        if !self.can_accept {
            return Err(TransportError::NotPermitted("accept on a client connection"));
        }
        self.connected = true;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn can_accept(&self) -> bool {
        self.can_accept
    }

    fn describe(&self) -> String {
        match self.mode {
            ReplyMode::Echo => "dummy (echo)".to_string(),
            ReplyMode::Scripted => format!("dummy ({} scripted replies)", self.script.len()),
        }
    }
}
