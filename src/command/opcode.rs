//! Opcode ranges.
//!
//! Opcodes below [`BROADCAST_LIMIT`] are broadcasts and never carry a
//! target. Everything from [`BROADCAST_LIMIT`] upwards is free for targets
//! to define their own private command numbers.

pub const BROADCAST_LIMIT: u32 = 100;

/// Shut down soon: flush and stop, but still process work that is
/// already due.
pub const BRC_SHUTDOWN: u32 = 0;

/// First opcode available to targeted commands.
pub const TARGETED_MIN: u32 = BROADCAST_LIMIT;

pub fn is_broadcast(opcode: u32) -> bool {
    opcode < BROADCAST_LIMIT
}
