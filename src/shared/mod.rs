//! One physical connection shared by several logical clients.
//!
//! The master owns the real [`Connection`]. Each client talks to a slave,
//! which tags its calls with block tickets and hands them to the master.
//! Calls of one atomic block are never interleaved with other traffic;
//! uncoordinated (non-atomic) reads are served by one shared listen read
//! whose result is copied to every subscribed slave.
pub mod master;
pub mod slave;

pub use master::SharedConnectionMaster;
pub use slave::SharedConnectionSlave;

use std::sync::Arc;

use crate::{command::Command, connection::Connection, scheduler::WorkScheduler};

/// Names one atomic block; `0` means "no block".
pub type Ticket = u32;

pub type SlaveId = u64;

/// Which side of the sharing a [`SharedConnection`] is.
pub enum SharedRole {
    /// Owns the real connection. `front` is the slave serving this object's
    /// own calls and the only one allowed to really disconnect.
    Master {
        master: Arc<SharedConnectionMaster>,
        front: Arc<SharedConnectionSlave>,
    },
    Slave(Arc<SharedConnectionSlave>),
}

pub struct SharedConnection {
    role: SharedRole,
}

impl SharedConnection {
    pub fn master(
        name: impl Into<String>,
        connection: Arc<dyn Connection>,
        scheduler: WorkScheduler,
    ) -> Self {
        let master = SharedConnectionMaster::new(name, connection, scheduler.clone());
        let front = SharedConnectionSlave::new(Arc::clone(&master), scheduler);
        master.bind_owner(front.id());
        Self {
            role: SharedRole::Master { master, front },
        }
    }

    pub fn slave(master: &Arc<SharedConnectionMaster>, scheduler: WorkScheduler) -> Self {
        Self {
            role: SharedRole::Slave(SharedConnectionSlave::new(Arc::clone(master), scheduler)),
        }
    }

    pub fn role(&self) -> &SharedRole {
        &self.role
    }

    pub fn master_handle(&self) -> &Arc<SharedConnectionMaster> {
        match &self.role {
            SharedRole::Master { master, .. } => master,
            SharedRole::Slave(slave) => slave.master(),
        }
    }

    fn front(&self) -> &Arc<SharedConnectionSlave> {
        match &self.role {
            SharedRole::Master { front, .. } => front,
            SharedRole::Slave(slave) => slave,
        }
    }
}

impl Connection for SharedConnection {
    fn connect(&self, callback: Command) {
        self.front().connect(callback);
    }

    fn disconnect(&self, callback: Command) {
        self.front().disconnect(callback);
    }

    fn send(&self, callback: Command) {
        self.front().send(callback);
    }

    fn receive(&self, callback: Command) {
        self.front().receive(callback);
    }

    fn accept(&self, callback: Command) {
        self.front().accept(callback);
    }

    fn noop(&self, callback: Command) {
        self.front().noop(callback);
    }

    fn abort_all(&self) {
        match &self.role {
            SharedRole::Master { master, front } => {
                front.abort_all();
                master.abort_all();
            }
            SharedRole::Slave(slave) => slave.abort_all(),
        }
    }

    fn is_connected(&self) -> bool {
        self.front().is_connected()
    }

    fn can_accept(&self) -> bool {
        self.front().can_accept()
    }
}
