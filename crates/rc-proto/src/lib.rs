//! Wire framing and typed message codec for the rotorcraft serial protocol.
//!
//! This crate is purely about bytes: it knows nothing about open file
//! descriptors, device identity, or scheduling. See `rc-link` for that.

pub mod codec;
mod error;
pub mod frame;
mod message;

pub use error::CodecError;
pub use frame::{encode_frame, Framer, END, ESCAPE, ESCAPE_XOR, START};
pub use message::{Inbound, Outbound};

/// Largest rotor id the wire protocol can address.
pub const MAX_ROTORS: usize = 8;
