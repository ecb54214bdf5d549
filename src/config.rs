use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::{collections::HashSet, path::Path, time::Duration};

use crate::connection::{serial::Parity, SerialSettings, TcpMode};

fn default_timeout_ms() -> u64 {
    3000
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

fn default_interval_ms() -> u64 {
    5000
}

/// TCP link
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TcpConfig {
    pub host: String,
    pub port: u16,
    /// Dial out (`client`) or wait for the device to dial in (`server`)
    #[serde(default)]
    pub mode: TcpMode,
    /// Default operation timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

/// Serial link
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerialConfig {
    /// Device path, e.g. `/dev/ttyUSB0`
    pub port: String,
    #[serde(default = "default_baud")]
    pub baud: u32,
    #[serde(default = "default_data_bits")]
    pub data_bits: u8,
    #[serde(default = "default_stop_bits")]
    pub stop_bits: u8,
    #[serde(default)]
    pub parity: Parity,
    /// Default operation timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Silence that ends a frame; derived from the line settings when unset
    #[serde(default)]
    pub interbyte_timeout_ms: Option<u64>,
}

impl SerialConfig {
    pub fn settings(&self) -> SerialSettings {
        SerialSettings {
            baud: self.baud,
            data_bits: self.data_bits,
            stop_bits: self.stop_bits,
            parity: self.parity,
        }
    }
}

/// In-memory link answering from a script
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DummyConfig {
    /// Replies handed out in turn, one per send
    #[serde(default)]
    pub responses: Vec<String>,
    /// Reply with the sent bytes instead
    #[serde(default)]
    pub echo: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SharedRoleKind {
    Master,
    Slave,
}

/// Link shared between several connections
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SharedConfig {
    pub role: SharedRoleKind,
    /// The real link, masters only
    #[serde(default)]
    pub realcomms: Option<Box<CommsConfig>>,
    /// Name of the master to attach to, slaves only
    #[serde(default)]
    pub use_connection: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "comms", rename_all = "snake_case")]
pub enum CommsConfig {
    Tcp(TcpConfig),
    Serial(SerialConfig),
    Dummy(DummyConfig),
    Shared(SharedConfig),
}

impl CommsConfig {
    pub fn kind(&self) -> &'static str {
        match self {
            CommsConfig::Tcp(_) => "tcp",
            CommsConfig::Serial(_) => "serial",
            CommsConfig::Dummy(_) => "dummy",
            CommsConfig::Shared(_) => "shared",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    pub name: String,
    #[serde(flatten)]
    pub comms: CommsConfig,
}

/// Periodic request/reply against one connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollerConfig {
    pub name: String,
    /// Name of the connection to poll through
    pub connection: String,
    /// Request frame, sent verbatim
    pub request: String,
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    /// Reply timeout in milliseconds; the connection default when unset
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl PollerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

/// Root configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LinkConfig {
    #[serde(default, rename = "connection")]
    pub connections: Vec<ConnectionConfig>,
    #[serde(default, rename = "poller")]
    pub pollers: Vec<PollerConfig>,
}

impl LinkConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|err| anyhow!("Failed to read {}: {}", path.display(), err))?;
        Self::parse(&text).map_err(|err| anyhow!("{}: {}", path.display(), err))
    }

    pub fn parse(text: &str) -> Result<Self> {
        let config: LinkConfig =
            toml::from_str(text).map_err(|err| anyhow!("Invalid configuration: {}", err))?;
        config.validate()?;
        Ok(config)
    }

    pub fn connection(&self, name: &str) -> Option<&ConnectionConfig> {
        self.connections.iter().find(|c| c.name == name)
    }

    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for (index, conn) in self.connections.iter().enumerate() {
            if conn.name.is_empty() {
                return Err(anyhow!("Connection #{} has no name", index + 1));
            }
            if !seen.insert(conn.name.as_str()) {
                return Err(anyhow!("Connection name '{}' is used twice", conn.name));
            }
            validate_comms(&conn.name, &conn.comms, &self.connections[..index], true)?;
        }

        let mut seen = HashSet::new();
        for poller in &self.pollers {
            if !seen.insert(poller.name.as_str()) {
                return Err(anyhow!("Poller name '{}' is used twice", poller.name));
            }
            if self.connection(&poller.connection).is_none() {
                return Err(anyhow!(
                    "Poller '{}' uses unknown connection '{}'",
                    poller.name,
                    poller.connection
                ));
            }
            if poller.interval_ms == 0 {
                return Err(anyhow!("Poller '{}' needs a non-zero interval", poller.name));
            }
        }
        Ok(())
    }
}

fn validate_comms(
    name: &str,
    comms: &CommsConfig,
    earlier: &[ConnectionConfig],
    top_level: bool,
) -> Result<()> {
    match comms {
        CommsConfig::Tcp(tcp) => {
            if tcp.host.is_empty() {
                return Err(anyhow!("Connection '{}' needs a host", name));
            }
        }
        CommsConfig::Serial(serial) => {
            if serial.port.is_empty() {
                return Err(anyhow!("Connection '{}' needs a serial port", name));
            }
            if !(5..=8).contains(&serial.data_bits) || !(1..=2).contains(&serial.stop_bits) {
                return Err(anyhow!("Connection '{}' has invalid line settings", name));
            }
        }
        CommsConfig::Dummy(_) => {}
        CommsConfig::Shared(_) if !top_level => {
            return Err(anyhow!(
                "Connection '{}': realcomms must not be shared itself",
                name
            ));
        }
        CommsConfig::Shared(shared) => match shared.role {
            SharedRoleKind::Master => {
                let real = shared
                    .realcomms
                    .as_deref()
                    .ok_or_else(|| anyhow!("Shared master '{}' needs realcomms", name))?;
                validate_comms(name, real, earlier, false)?;
            }
            SharedRoleKind::Slave => {
                let master = shared
                    .use_connection
                    .as_deref()
                    .ok_or_else(|| anyhow!("Shared slave '{}' needs use_connection", name))?;
                let declared = earlier.iter().any(|c| {
                    c.name == master
                        && matches!(
                            &c.comms,
                            CommsConfig::Shared(SharedConfig {
                                role: SharedRoleKind::Master,
                                ..
                            })
                        )
                });
                if !declared {
                    return Err(anyhow!(
                        "Shared slave '{}' must use a shared master declared before it, '{}' is not",
                        name,
                        master
                    ));
                }
            }
        },
    }
    Ok(())
}
