//! Solarlink: polling core for photovoltaic inverters on serial and TCP links.
//!
//! All application logic runs on one dispatcher ([`scheduler::WorkScheduler`])
//! while I/O happens on the worker thread of each [`connection::Connection`].
//! Completions travel back as [`command::Command`] values. The [`shared`]
//! module lets several logical clients take turns on one physical link.

pub mod command;
pub mod config;
pub mod connection;
pub mod poller;
pub mod scheduler;
pub mod shared;

pub use command::{target_fn, Command, CommandTarget, Completion};
pub use connection::Connection;
pub use scheduler::WorkScheduler;
