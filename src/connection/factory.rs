use anyhow::{anyhow, Result};
use bytes::Bytes;
use std::{collections::HashMap, sync::Arc, time::Duration};

use super::{
    Connection, DummyHandle, DummyTransport, SerialTransport, TcpTransport, WorkerConnection,
};
use crate::{
    config::{CommsConfig, ConnectionConfig, LinkConfig, SharedRoleKind},
    scheduler::WorkScheduler,
    shared::{SharedConnection, SharedConnectionMaster},
};

/// Builds connections from configuration and remembers shared masters by
/// name, so slaves declared later can attach to them.
pub struct ConnectionFactory {
    scheduler: WorkScheduler,
    masters: HashMap<String, Arc<SharedConnectionMaster>>,
    dummies: HashMap<String, DummyHandle>,
}

impl ConnectionFactory {
    pub fn new(scheduler: WorkScheduler) -> Self {
        Self {
            scheduler,
            masters: HashMap::new(),
            dummies: HashMap::new(),
        }
    }

    /// Build every connection of `config`, in declaration order.
    pub fn build_all(&mut self, config: &LinkConfig) -> Result<HashMap<String, Arc<dyn Connection>>> {
        let mut built = HashMap::new();
        for conn in &config.connections {
            built.insert(conn.name.clone(), self.build(conn)?);
        }
        Ok(built)
    }

    pub fn build(&mut self, config: &ConnectionConfig) -> Result<Arc<dyn Connection>> {
        let CommsConfig::Shared(shared) = &config.comms else {
            return self.build_real(&config.name, &config.comms);
        };
        match shared.role {
            SharedRoleKind::Master => {
                let real = shared
                    .realcomms
                    .as_deref()
                    .ok_or_else(|| anyhow!("Shared master '{}' needs realcomms", config.name))?;
                if matches!(real, CommsConfig::Shared(_)) {
                    return Err(anyhow!(
                        "Shared master '{}': realcomms must not be shared itself",
                        config.name
                    ));
                }
                let real = self.build_real(&config.name, real)?;
                let connection =
                    SharedConnection::master(config.name.clone(), real, self.scheduler.clone());
                self.masters.insert(
                    config.name.clone(),
                    Arc::clone(connection.master_handle()),
                );
                log::debug!("shared master '{}' registered", config.name);
                Ok(Arc::new(connection))
            }
            SharedRoleKind::Slave => {
                let name = shared
                    .use_connection
                    .as_deref()
                    .ok_or_else(|| anyhow!("Shared slave '{}' needs use_connection", config.name))?;
                let master = self.masters.get(name).ok_or_else(|| {
                    anyhow!(
                        "Shared slave '{}': no shared master named '{}' built yet",
                        config.name,
                        name
                    )
                })?;
                Ok(Arc::new(SharedConnection::slave(master, self.scheduler.clone())))
            }
        }
    }

    pub fn master(&self, name: &str) -> Option<&Arc<SharedConnectionMaster>> {
        self.masters.get(name)
    }

    /// Test handle of a dummy link built under `name`.
    pub fn dummy_handle(&self, name: &str) -> Option<&DummyHandle> {
        self.dummies.get(name)
    }

    fn build_real(&mut self, name: &str, comms: &CommsConfig) -> Result<Arc<dyn Connection>> {
        let scheduler = self.scheduler.clone();
        let connection = match comms {
            CommsConfig::Tcp(tcp) => WorkerConnection::spawn(
                name,
                TcpTransport::new(
                    tcp.host.clone(),
                    tcp.port,
                    tcp.mode,
                    Duration::from_millis(tcp.timeout_ms),
                ),
                scheduler,
            )?,
            CommsConfig::Serial(serial) => WorkerConnection::spawn(
                name,
                SerialTransport::new(
                    serial.port.clone(),
                    serial.settings(),
                    Duration::from_millis(serial.timeout_ms),
                    serial.interbyte_timeout_ms.map(Duration::from_millis),
                ),
                scheduler,
            )?,
            CommsConfig::Dummy(dummy) => {
                let (transport, handle) = if dummy.echo {
                    DummyTransport::echo()
                } else {
                    DummyTransport::scripted(
                        dummy
                            .responses
                            .iter()
                            .map(|r| Bytes::from(r.clone().into_bytes()))
                            .collect(),
                    )
                };
                self.dummies.insert(name.to_string(), handle);
                WorkerConnection::spawn(name, transport, scheduler)?
            }
            CommsConfig::Shared(_) => {
                return Err(anyhow!("Connection '{}' is shared, not a real link", name))
            }
        };
        log::debug!("connection '{}' ({}) created", name, comms.kind());
        Ok(Arc::new(connection))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::SharedRole;

    #[test]
    fn test_builds_master_then_slave() {
        let config = LinkConfig::parse(
            r#"
[[connection]]
name = "bus"
comms = "shared"
role = "master"
realcomms = { comms = "dummy", responses = ["ack"] }

[[connection]]
name = "second"
comms = "shared"
role = "slave"
use_connection = "bus"
"#,
        )
        .unwrap();

        let scheduler = WorkScheduler::new().unwrap();
        let mut factory = ConnectionFactory::new(scheduler);
        let built = factory.build_all(&config).unwrap();
        assert_eq!(built.len(), 2);
        assert!(factory.master("bus").is_some());
        assert!(factory.dummy_handle("bus").is_some());
        assert!(!built["second"].is_connected());
    }

    #[test]
    fn test_slave_without_master_fails() {
        let scheduler = WorkScheduler::new().unwrap();
        let mut factory = ConnectionFactory::new(scheduler.clone());
        let orphan = ConnectionConfig {
            name: "orphan".to_string(),
            comms: CommsConfig::Shared(crate::config::SharedConfig {
                role: SharedRoleKind::Slave,
                realcomms: None,
                use_connection: Some("bus".to_string()),
            }),
        };
        assert!(factory.build(&orphan).is_err());

        let real: Arc<dyn Connection> = Arc::new(
            WorkerConnection::spawn("real", DummyTransport::echo().0, scheduler.clone()).unwrap(),
        );
        let shared = SharedConnection::master("bus", real, scheduler);
        assert!(matches!(shared.role(), SharedRole::Master { .. }));
    }
}
