use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::{
    io::{self, Read, Write},
    net::{Shutdown, TcpListener, TcpStream, ToSocketAddrs},
    thread,
    time::{Duration, Instant},
};

use super::{Transport, TransportError};

const READ_CHUNK: usize = 4096;
const ACCEPT_POLL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TcpMode {
    #[default]
    Client,
    Server,
}

pub struct TcpTransport {
    host: String,
    port: u16,
    mode: TcpMode,
    timeout: Duration,
    stream: Option<TcpStream>,
    listener: Option<TcpListener>,
}

impl TcpTransport {
    pub fn new(host: impl Into<String>, port: u16, mode: TcpMode, timeout: Duration) -> Self {
        Self {
            host: host.into(),
            port,
            mode,
            timeout,
            stream: None,
            listener: None,
        }
    }

    fn stream(&mut self) -> Result<&mut TcpStream, TransportError> {
        self.stream.as_mut().ok_or(TransportError::NotConnected)
    }

    fn listener(&mut self) -> Result<&TcpListener, TransportError> {
        if self.listener.is_none() {
            let listener = TcpListener::bind((self.host.as_str(), self.port))?;
            listener.set_nonblocking(true)?;
            log::info!("listening on {}:{}", self.host, self.port);
            self.listener = Some(listener);
        }
        self.listener
            .as_ref()
            .ok_or(TransportError::NotPermitted("listener unavailable"))
    }

    /// Drop the stream after an error that leaves it unusable.
    fn lose_stream(&mut self, err: io::Error) -> TransportError {
        match err.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => TransportError::Timeout,
            _ => {
                self.stream = None;
                TransportError::Io(err)
            }
        }
    }
}

// Zero would mean "block forever" to the socket API.
fn socket_timeout(timeout: Duration) -> Option<Duration> {
    Some(timeout.max(Duration::from_millis(1)))
}

impl Transport for TcpTransport {
    fn connect(&mut self, timeout: Duration) -> Result<(), TransportError> {
        if self.mode == TcpMode::Server {
            return Err(TransportError::NotPermitted("connect on a server-mode connection"));
        }
        let mut last_err = None;
        for addr in (self.host.as_str(), self.port).to_socket_addrs()? {
            match TcpStream::connect_timeout(&addr, timeout.max(Duration::from_millis(1))) {
                Ok(stream) => {
                    stream.set_nodelay(true)?;
                    self.stream = Some(stream);
                    return Ok(());
                }
                Err(err) => {
                    log::debug!("connect to {addr} failed: {err}");
                    last_err = Some(err);
                }
            }
        }
        Err(match last_err {
            Some(err) => TransportError::Io(err),
            None => TransportError::Io(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{} did not resolve", self.host),
            )),
        })
    }

    fn disconnect(&mut self) -> Result<(), TransportError> {
        if let Some(stream) = self.stream.take() {
            if let Err(err) = stream.shutdown(Shutdown::Both) {
                log::debug!("shutdown of {}:{} failed: {err}", self.host, self.port);
            }
        }
        Ok(())
    }

    fn send(&mut self, data: &[u8], timeout: Duration) -> Result<(), TransportError> {
        let stream = self.stream()?;
        stream.set_write_timeout(socket_timeout(timeout))?;
        let result = stream.write_all(data).and_then(|_| stream.flush());
        result.map_err(|err| self.lose_stream(err))
    }

    fn receive(
        &mut self,
        timeout: Duration,
        interbyte: Option<Duration>,
    ) -> Result<Bytes, TransportError> {
        let stream = self.stream()?;
        let mut buf = BytesMut::new();
        let mut chunk = [0u8; READ_CHUNK];

        stream.set_read_timeout(socket_timeout(timeout))?;
        let first = stream.read(&mut chunk);
        match first {
            Ok(0) => {
                self.stream = None;
                return Err(TransportError::Closed);
            }
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
            Err(err) => return Err(self.lose_stream(err)),
        }

        // Take whatever else belongs to the frame.
        let stream = self.stream()?;
        match interbyte {
            Some(gap) => stream.set_read_timeout(socket_timeout(gap))?,
            None => stream.set_nonblocking(true)?,
        }
        let drained = loop {
            match stream.read(&mut chunk) {
                Ok(0) => break Ok(true),
                Ok(n) => buf.extend_from_slice(&chunk[..n]),
                Err(err)
                    if matches!(
                        err.kind(),
                        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                    ) =>
                {
                    break Ok(false)
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => break Err(err),
            }
        };
        if interbyte.is_none() {
            stream.set_nonblocking(false)?;
        }
        match drained {
            Ok(false) => {}
            // Peer closed after sending; hand out the data, next call fails.
            Ok(true) => self.stream = None,
            Err(err) => {
                log::warn!("read from {}:{} failed mid-frame: {err}", self.host, self.port);
                self.stream = None;
            }
        }
        Ok(buf.freeze())
    }

    fn accept(&mut self, timeout: Duration) -> Result<(), TransportError> {
        if self.mode != TcpMode::Server {
            return Err(TransportError::NotPermitted("accept on a client connection"));
        }
        let deadline = Instant::now() + timeout;
        loop {
            let accepted = self.listener()?.accept();
            match accepted {
                Ok((stream, peer)) => {
                    stream.set_nonblocking(false)?;
                    stream.set_nodelay(true)?;
                    log::info!("accepted {peer} on {}:{}", self.host, self.port);
                    self.stream = Some(stream);
                    return Ok(());
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    if Instant::now() >= deadline {
                        return Err(TransportError::Timeout);
                    }
                    thread::sleep(ACCEPT_POLL);
                }
                Err(err) => return Err(TransportError::Io(err)),
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    fn can_accept(&self) -> bool {
        self.mode == TcpMode::Server
    }

    fn default_timeout(&self) -> Duration {
        self.timeout
    }

    fn describe(&self) -> String {
        format!("tcp {}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_mode_rejects_connect() {
        let mut transport = TcpTransport::new("127.0.0.1", 0, TcpMode::Server, Duration::ZERO);
        assert!(matches!(
            transport.connect(Duration::from_millis(10)),
            Err(TransportError::NotPermitted(_))
        ));
        assert!(transport.can_accept());
    }

    #[test]
    fn test_client_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let peer = thread::spawn(move || {
            let (mut socket, _) = listener.accept().unwrap();
            let mut buf = [0u8; 4];
            socket.read_exact(&mut buf).unwrap();
            socket.write_all(b"pong").unwrap();
            buf
        });

        let timeout = Duration::from_secs(2);
        let mut transport = TcpTransport::new("127.0.0.1", port, TcpMode::Client, timeout);
        transport.connect(timeout).unwrap();
        transport.send(b"ping", timeout).unwrap();
        let reply = transport.receive(timeout, None).unwrap();
        assert_eq!(reply, Bytes::from_static(b"pong"));
        assert_eq!(&peer.join().unwrap(), b"ping");
    }

    #[test]
    fn test_receive_without_stream_is_not_connected() {
        let mut transport = TcpTransport::new("127.0.0.1", 1, TcpMode::Client, Duration::ZERO);
        assert!(matches!(
            transport.receive(Duration::from_millis(1), None),
            Err(TransportError::NotConnected)
        ));
    }
}
