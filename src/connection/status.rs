//! Completion status codes: `0` on success, a negated POSIX errno otherwise.

pub const OK: i32 = 0;
pub const EIO: i32 = -libc::EIO;
pub const ETIMEDOUT: i32 = -libc::ETIMEDOUT;
pub const ENOTCONN: i32 = -libc::ENOTCONN;
pub const ECANCELED: i32 = -libc::ECANCELED;
pub const EPERM: i32 = -libc::EPERM;

pub fn describe(status: i32) -> &'static str {
    match status {
        OK => "success",
        EIO => "i/o error",
        ETIMEDOUT => "timed out",
        ENOTCONN => "not connected",
        ECANCELED => "canceled",
        EPERM => "operation not permitted",
        _ => "unknown error",
    }
}

/// Timeouts and cancellations are expected outcomes of a listen read,
/// anything else ends it.
pub fn is_timeout_or_cancel(status: i32) -> bool {
    status == ETIMEDOUT || status == ECANCELED
}

/// Failure of a blocking transport operation.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("timed out")]
    Timeout,
    #[error("not connected")]
    NotConnected,
    #[error("connection closed by peer")]
    Closed,
    #[error("operation not permitted: {0}")]
    NotPermitted(&'static str),
    #[error("serial port error: {0}")]
    Serial(#[from] serialport::Error),
}

impl TransportError {
    pub fn errno(&self) -> i32 {
        match self {
            TransportError::Io(err) => match err.kind() {
                std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => ETIMEDOUT,
                std::io::ErrorKind::NotConnected => ENOTCONN,
                std::io::ErrorKind::PermissionDenied => EPERM,
                _ => EIO,
            },
            TransportError::Timeout => ETIMEDOUT,
            TransportError::NotConnected | TransportError::Closed => ENOTCONN,
            TransportError::NotPermitted(_) => EPERM,
            TransportError::Serial(_) => EIO,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_errno_mapping() {
        assert_eq!(TransportError::Timeout.errno(), ETIMEDOUT);
        assert_eq!(TransportError::Closed.errno(), ENOTCONN);
        assert_eq!(TransportError::NotPermitted("connect").errno(), EPERM);
        assert_eq!(
            TransportError::from(io::Error::from(io::ErrorKind::WouldBlock)).errno(),
            ETIMEDOUT
        );
        assert_eq!(
            TransportError::from(io::Error::from(io::ErrorKind::BrokenPipe)).errno(),
            EIO
        );
        assert!(EIO < 0 && ECANCELED < 0);
        assert_eq!(describe(ECANCELED), "canceled");
    }
}
