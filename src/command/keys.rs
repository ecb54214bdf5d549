//! Well-known payload keys used around the connection verbs.

/// Status code, `0` or a negative errno (`i32`).
pub const ERRNO: &str = "errno";
/// Optional human readable message accompanying a non-zero status.
pub const ERRNO_MSG: &str = "errno_msg";
/// Bytes returned by a receive.
pub const RECEIVE_DATA: &str = "receive_data";
/// Bytes to transmit with a send.
pub const SEND_DATA: &str = "send_data";
/// Per-operation timeout override.
pub const TIMEOUT: &str = "timeout";
/// Maximum silence between two bytes of one frame.
pub const INTERBYTE_TIMEOUT: &str = "interbyte_timeout";
/// `true` while more calls of the same atomic block follow.
pub const ATOMIC: &str = "atomic";
/// Ticket a shared-connection slave attached to the call.
pub const TICKET: &str = "ticket";
