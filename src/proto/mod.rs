//! Wire format primitives.
//!
//! Every steady-state message starts with a 4-byte header:
//!
//! ```text
//! ┌───────────────────┬───────────────────┬──────────────────┐
//! │ length: u16       │ opcode: u16 LE    │ payload          │
//! │ (platform order)  │                   │ (length-4 bytes) │
//! └───────────────────┴───────────────────┴──────────────────┘
//! ```
//!
//! The length field counts the whole message including the header. Its
//! byte order is the only thing that differs between platforms; the
//! opcode is little-endian everywhere. Inside the proxy all messages are
//! held in canonical form (little-endian length) and only renormalised
//! at the socket boundary.

mod builder;
mod framer;

pub use builder::MessageBuilder;
pub use framer::{Framer, LengthFormat};

/// Size of the message header in bytes
pub const HEADER_SIZE: usize = 4;

/// First handshake datagram, little-endian on the wire
pub const HANDSHAKE_MAGIC: u32 = 0x0000_0001;

/// Largest message representable by the 16-bit length field
pub const MAX_MESSAGE_SIZE: usize = u16::MAX as usize;

/// Read the opcode at offset 2 of a message.
///
/// Returns `None` if the buffer is shorter than the header.
pub fn read_opcode(message: &[u8]) -> Option<u16> {
    if message.len() < HEADER_SIZE {
        return None;
    }
    Some(u16::from_le_bytes([message[2], message[3]]))
}
