use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use serialport::{DataBits, SerialPort, StopBits};
use std::{
    io::{self, Read, Write},
    time::Duration,
};

use super::{Transport, TransportError};

const READ_CHUNK: usize = 256;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Parity {
    #[default]
    None,
    Odd,
    Even,
}

impl From<Parity> for serialport::Parity {
    fn from(parity: Parity) -> Self {
        match parity {
            Parity::None => serialport::Parity::None,
            Parity::Odd => serialport::Parity::Odd,
            Parity::Even => serialport::Parity::Even,
        }
    }
}

/// Line settings of a serial port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerialSettings {
    #[serde(default = "default_baud")]
    pub baud: u32,
    #[serde(default = "default_data_bits")]
    pub data_bits: u8,
    #[serde(default = "default_stop_bits")]
    pub stop_bits: u8,
    #[serde(default)]
    pub parity: Parity,
}

fn default_baud() -> u32 {
    9600
}

fn default_data_bits() -> u8 {
    8
}

fn default_stop_bits() -> u8 {
    1
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            baud: default_baud(),
            data_bits: default_data_bits(),
            stop_bits: default_stop_bits(),
            parity: Parity::None,
        }
    }
}

impl SerialSettings {
    pub fn apply_builder(&self, b: serialport::SerialPortBuilder) -> serialport::SerialPortBuilder {
        let b = b.data_bits(match self.data_bits {
            5 => DataBits::Five,
            6 => DataBits::Six,
            7 => DataBits::Seven,
            _ => DataBits::Eight,
        });
        let b = b.stop_bits(match self.stop_bits {
            2 => StopBits::Two,
            _ => StopBits::One,
        });
        b.parity(self.parity.into())
    }

    /// Silence that ends a frame: 3.5 character times, at least 1 ms.
    pub fn frame_gap(&self) -> Duration {
        let bits = 1.0
            + self.data_bits as f64
            + if self.parity != Parity::None { 1.0 } else { 0.0 }
            + self.stop_bits as f64;
        let char_secs = bits / self.baud.max(1) as f64;
        Duration::from_secs_f64(char_secs * 3.5).max(Duration::from_millis(1))
    }
}

pub struct SerialTransport {
    port_name: String,
    settings: SerialSettings,
    timeout: Duration,
    interbyte: Duration,
    port: Option<Box<dyn SerialPort>>,
}

impl SerialTransport {
    pub fn new(
        port_name: impl Into<String>,
        settings: SerialSettings,
        timeout: Duration,
        interbyte: Option<Duration>,
    ) -> Self {
        let interbyte = interbyte.unwrap_or_else(|| settings.frame_gap());
        Self {
            port_name: port_name.into(),
            settings,
            timeout,
            interbyte,
            port: None,
        }
    }
}

fn is_timeout(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock
    )
}

impl Transport for SerialTransport {
    fn connect(&mut self, timeout: Duration) -> Result<(), TransportError> {
        let builder = serialport::new(self.port_name.clone(), self.settings.baud).timeout(timeout);
        let builder = self.settings.apply_builder(builder);
        self.port = Some(builder.open()?);
        Ok(())
    }

    fn disconnect(&mut self) -> Result<(), TransportError> {
        self.port = None;
        Ok(())
    }

    fn send(&mut self, data: &[u8], timeout: Duration) -> Result<(), TransportError> {
        let port = self.port.as_mut().ok_or(TransportError::NotConnected)?;
        port.set_timeout(timeout)?;
        port.write_all(data)?;
        port.flush()?;
        Ok(())
    }

    fn receive(
        &mut self,
        timeout: Duration,
        interbyte: Option<Duration>,
    ) -> Result<Bytes, TransportError> {
        let gap = interbyte.unwrap_or(self.interbyte);
        let port = self.port.as_mut().ok_or(TransportError::NotConnected)?;
        let mut buf = BytesMut::new();
        let mut chunk = [0u8; READ_CHUNK];

        port.set_timeout(timeout)?;
        loop {
            match port.read(&mut chunk) {
                Ok(0) => return Err(TransportError::Timeout),
                Ok(n) => {
                    buf.extend_from_slice(&chunk[..n]);
                    break;
                }
                Err(err) if is_timeout(&err) => return Err(TransportError::Timeout),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => return Err(TransportError::Io(err)),
            }
        }

        // The frame ends once the line stays quiet for the gap.
        port.set_timeout(gap)?;
        loop {
            match port.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => buf.extend_from_slice(&chunk[..n]),
                Err(err) if is_timeout(&err) => break,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => {
                    log::warn!("{}: read failed mid-frame: {err}", self.port_name);
                    break;
                }
            }
        }
        Ok(buf.freeze())
    }

    fn is_connected(&self) -> bool {
        self.port.is_some()
    }

    fn default_timeout(&self) -> Duration {
        self.timeout
    }

    fn describe(&self) -> String {
        format!("serial {} @ {}", self.port_name, self.settings.baud)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_gap_follows_line_settings() {
        let slow = SerialSettings::default();
        // 10 bits per char at 9600 baud, 3.5 chars.
        let gap = slow.frame_gap();
        assert!(gap > Duration::from_micros(3600) && gap < Duration::from_micros(3700));

        let fast = SerialSettings {
            baud: 115_200,
            ..SerialSettings::default()
        };
        assert_eq!(fast.frame_gap(), Duration::from_millis(1));

        let with_parity = SerialSettings {
            parity: Parity::Even,
            stop_bits: 2,
            ..SerialSettings::default()
        };
        assert!(with_parity.frame_gap() > gap);
    }

    #[test]
    fn test_explicit_interbyte_wins() {
        let transport = SerialTransport::new(
            "/dev/null-port",
            SerialSettings::default(),
            Duration::from_secs(1),
            Some(Duration::from_millis(40)),
        );
        assert_eq!(transport.interbyte, Duration::from_millis(40));
        assert!(!transport.is_connected());
    }
}
