//! Message framing from the decrypted byte stream.
//!
//! TCP delivers arbitrary chunks; the framer buffers them and yields
//! whole length-prefixed messages. It is single-producer single-consumer
//! and owned by exactly one connection, so it carries no locking.

use bytes::{Bytes, BytesMut};

use crate::error::{Error, Result};
use crate::proto::HEADER_SIZE;

/// Byte order of the 16-bit length field at offset 0.
///
/// The PC client writes the length little-endian; the console build of
/// the same protocol writes it big-endian. A connection uses exactly one
/// format for its lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LengthFormat {
    /// Little-endian length field (canonical form)
    U16Le,
    /// Big-endian length field (console platform)
    U16Be,
}

impl LengthFormat {
    /// Decode the length field from the first two bytes.
    pub fn read(self, bytes: &[u8]) -> u16 {
        match self {
            LengthFormat::U16Le => u16::from_le_bytes([bytes[0], bytes[1]]),
            LengthFormat::U16Be => u16::from_be_bytes([bytes[0], bytes[1]]),
        }
    }

    /// Encode a length value into the first two bytes.
    pub fn write(self, len: u16, bytes: &mut [u8]) {
        let encoded = match self {
            LengthFormat::U16Le => len.to_le_bytes(),
            LengthFormat::U16Be => len.to_be_bytes(),
        };
        bytes[0] = encoded[0];
        bytes[1] = encoded[1];
    }
}

impl Default for LengthFormat {
    fn default() -> Self {
        LengthFormat::U16Le
    }
}

/// Accumulates decrypted bytes and splits off whole messages.
#[derive(Debug)]
pub struct Framer {
    format: LengthFormat,
    buf: BytesMut,
}

impl Framer {
    /// Create a framer for the given platform length format.
    pub fn new(format: LengthFormat) -> Self {
        Self { format, buf: BytesMut::with_capacity(4096) }
    }

    /// Append bytes in arrival order.
    pub fn write(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Take the next complete message, if one is buffered.
    ///
    /// Returns `Ok(None)` until the full `length` bytes of the pending
    /// message have arrived. Repeated calls drain every buffered
    /// message; partial tails are retained verbatim for the next
    /// `write`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MalformedFrame`] if the length field is below
    /// the 4-byte header. The stream is unrecoverable at that point and
    /// the connection must close.
    pub fn read(&mut self) -> Result<Option<Bytes>> {
        if self.buf.len() < 2 {
            return Ok(None);
        }

        let len = self.format.read(&self.buf[..2]) as usize;
        if len < HEADER_SIZE {
            return Err(Error::MalformedFrame(len));
        }
        if self.buf.len() < len {
            return Ok(None);
        }

        Ok(Some(self.buf.split_to(len).freeze()))
    }

    /// Number of buffered bytes not yet consumed.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Drop all buffered bytes.
    pub fn clear(&mut self) {
        self.buf.clear();
    }
}
