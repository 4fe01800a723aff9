//! Little-endian wire protocol spoken between the bridge and the user-space
//! daemon: request/reply headers, opcodes, and the handful of payloads the
//! dispatch core itself produces or consumes.

pub mod wire;
#[macro_use]
mod macros;
pub mod header;
pub mod opcode;
pub mod ops;

pub use header::{InHeader, OutHeader, IN_HEADER_SIZE, OUT_HEADER_SIZE};
pub use opcode::Opcode;
pub use wire::{WireDecode, WireEncode, WireError};
