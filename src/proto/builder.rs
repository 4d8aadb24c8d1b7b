//! Message assembly and platform renormalisation.
//!
//! Dispatch works exclusively on canonical messages (little-endian
//! length). The builder converts between the canonical form and the
//! platform form at the socket boundary, and refreshes the length field
//! after hooks may have grown or shrunk a message.

use bytes::BufMut;

use crate::error::{Error, Result};
use crate::proto::{LengthFormat, HEADER_SIZE, MAX_MESSAGE_SIZE};

/// Builds and renormalises message headers for one platform.
#[derive(Debug, Clone, Copy)]
pub struct MessageBuilder {
    format: LengthFormat,
}

impl MessageBuilder {
    /// Create a builder for the given platform length format.
    pub fn new(format: LengthFormat) -> Self {
        Self { format }
    }

    /// Assemble a canonical message from opcode and payload.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MessageTooLarge`] if header plus payload exceeds
    /// the 16-bit length field.
    pub fn assemble(opcode: u16, payload: &[u8]) -> Result<Vec<u8>> {
        let len = HEADER_SIZE + payload.len();
        if len > MAX_MESSAGE_SIZE {
            return Err(Error::MessageTooLarge { size: len, max: MAX_MESSAGE_SIZE });
        }

        let mut out = Vec::with_capacity(len);
        out.put_u16_le(len as u16);
        out.put_u16_le(opcode);
        out.put_slice(payload);
        Ok(out)
    }

    /// Rewrite an inbound platform message into canonical form.
    ///
    /// For the little-endian platform this is a no-op. The opcode is
    /// little-endian on every platform and stays untouched.
    pub fn normalize(&self, message: &mut [u8]) -> Result<()> {
        if message.len() < HEADER_SIZE {
            return Err(Error::MessageTooShort { expected: HEADER_SIZE, actual: message.len() });
        }

        let len = self.format.read(&message[..2]);
        LengthFormat::U16Le.write(len, &mut message[..2]);
        Ok(())
    }

    /// Finalise an outbound canonical message for the platform.
    ///
    /// Recomputes the length field from the actual buffer size (hooks
    /// may have replaced the buffer without touching the header) and
    /// encodes it in the platform byte order.
    pub fn finalize(&self, message: &mut [u8]) -> Result<()> {
        if message.len() < HEADER_SIZE {
            return Err(Error::MessageTooShort { expected: HEADER_SIZE, actual: message.len() });
        }
        if message.len() > MAX_MESSAGE_SIZE {
            return Err(Error::MessageTooLarge { size: message.len(), max: MAX_MESSAGE_SIZE });
        }

        self.format.write(message.len() as u16, &mut message[..2]);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assemble() {
        let msg = MessageBuilder::assemble(0x2001, &[0xaa, 0xbb]).unwrap();
        assert_eq!(msg, vec![0x06, 0x00, 0x01, 0x20, 0xaa, 0xbb]);
    }

    #[test]
    fn test_assemble_rejects_oversize() {
        let payload = vec![0u8; MAX_MESSAGE_SIZE];
        assert!(matches!(
            MessageBuilder::assemble(0x01, &payload),
            Err(Error::MessageTooLarge { .. })
        ));
    }

    #[test]
    fn test_finalize_refreshes_length() {
        let builder = MessageBuilder::new(LengthFormat::U16Le);
        // Stale length field from before a hook grew the payload
        let mut msg = vec![0x04, 0x00, 0x01, 0x20, 0xaa, 0xbb];
        builder.finalize(&mut msg).unwrap();
        assert_eq!(&msg[..2], &[0x06, 0x00]);
    }

    #[test]
    fn test_finalize_console_byte_order() {
        let builder = MessageBuilder::new(LengthFormat::U16Be);
        let mut msg = MessageBuilder::assemble(0x2001, &[0xaa, 0xbb]).unwrap();
        builder.finalize(&mut msg).unwrap();
        assert_eq!(&msg[..2], &[0x00, 0x06]);
        // Opcode untouched
        assert_eq!(&msg[2..4], &[0x01, 0x20]);
    }

    #[test]
    fn test_normalize_round_trip() {
        let builder = MessageBuilder::new(LengthFormat::U16Be);
        let mut msg = vec![0x00, 0x06, 0x01, 0x20, 0xaa, 0xbb];
        builder.normalize(&mut msg).unwrap();
        assert_eq!(msg, vec![0x06, 0x00, 0x01, 0x20, 0xaa, 0xbb]);

        // Canonical platform leaves the message untouched
        let builder = MessageBuilder::new(LengthFormat::U16Le);
        let before = msg.clone();
        builder.normalize(&mut msg).unwrap();
        assert_eq!(msg, before);
    }

    #[test]
    fn test_header_required() {
        let builder = MessageBuilder::new(LengthFormat::U16Le);
        let mut short = vec![0x01, 0x02];
        assert!(matches!(builder.finalize(&mut short), Err(Error::MessageTooShort { .. })));
        assert!(matches!(builder.normalize(&mut short), Err(Error::MessageTooShort { .. })));
    }
}
