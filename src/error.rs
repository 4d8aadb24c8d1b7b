//! Error types for the interpose proxy core.

use thiserror::Error;

/// Result type alias for proxy operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur inside the proxy core.
#[derive(Error, Debug)]
pub enum Error {
    /// Definition version is not a positive integer, `*`, `raw` or `event`
    #[error("invalid definition version: {0}")]
    InvalidVersion(String),

    /// Message name has no opcode mapping in the catalogue
    #[error("message name is not mapped: {0}")]
    UnmappedMessage(String),

    /// Opcode has no name mapping in the catalogue
    #[error("unknown opcode: {0:#06x}")]
    UnknownOpcode(u16),

    /// No definition is registered for the requested name/version
    #[error("no definition for {name} v{version}")]
    MissingDefinition {
        /// Canonical message name
        name: String,
        /// Requested definition version
        version: u16,
    },

    /// Definition exists but cannot be parsed from wire bytes
    #[error("definition {name} v{version} is not readable")]
    UnreadableDefinition {
        /// Canonical message name
        name: String,
        /// Requested definition version
        version: u16,
    },

    /// Definition exists but cannot be serialised to wire bytes
    #[error("definition {name} v{version} is not writeable")]
    UnwriteableDefinition {
        /// Canonical message name
        name: String,
        /// Requested definition version
        version: u16,
    },

    /// Hook callback shape does not match the requested version
    #[error("hook callback mismatch: {0}")]
    HookMismatch(&'static str),

    /// Key half has the wrong length
    #[error("key half must be {expected} bytes, got {actual}")]
    InvalidKeyLength {
        /// Required key half size
        expected: usize,
        /// Size actually supplied
        actual: usize,
    },

    /// Key slot index outside 0..=1
    #[error("key slot index out of range: {0}")]
    InvalidKeySlot(usize),

    /// Key slot already holds a half
    #[error("{side} key slot {half} is already filled")]
    KeySlotOccupied {
        /// Which side the slot belongs to
        side: &'static str,
        /// Slot index
        half: usize,
    },

    /// Cipher transform requested before `init`, or `init` before all
    /// four halves are installed
    #[error("cipher session is not ready")]
    CipherNotReady,

    /// Cipher `init` called a second time
    #[error("cipher session is already initialised")]
    CipherAlreadyInit,

    /// Operation not legal in the current handshake state
    #[error("illegal in handshake state {0}")]
    IllegalState(&'static str),

    /// Length field below the 4-byte message header
    #[error("frame length {0} is below the 4-byte header")]
    MalformedFrame(usize),

    /// Buffer too short for the requested operation
    #[error("message too short: need {expected} bytes, got {actual}")]
    MessageTooShort {
        /// Minimum length required
        expected: usize,
        /// Length actually supplied
        actual: usize,
    },

    /// Message exceeds the 16-bit length field
    #[error("message too large: {size} bytes exceeds {max}")]
    MessageTooLarge {
        /// Size of the offending message
        size: usize,
        /// Largest representable size
        max: usize,
    },

    /// Codec parse or serialise failure
    #[error("codec error: {0}")]
    Codec(String),

    /// Hook callback reported a failure
    #[error("hook error: {0}")]
    Hook(String),

    /// Connection has transitioned to Closed
    #[error("connection is closed")]
    ConnectionClosed,

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Network I/O error
    #[error("network error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a new codec error
    pub fn codec(msg: impl Into<String>) -> Self {
        Error::Codec(msg.into())
    }

    /// Create a new hook error
    pub fn hook(msg: impl Into<String>) -> Self {
        Error::Hook(msg.into())
    }

    /// Create a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// True for errors surfaced synchronously from registration and
    /// injection APIs. These indicate caller misconfiguration and are
    /// detectable at module load time.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            Error::InvalidVersion(_)
                | Error::UnmappedMessage(_)
                | Error::MissingDefinition { .. }
                | Error::UnreadableDefinition { .. }
                | Error::UnwriteableDefinition { .. }
                | Error::HookMismatch(_)
                | Error::InvalidKeyLength { .. }
                | Error::InvalidKeySlot(_)
                | Error::IllegalState(_)
                | Error::Config(_)
        )
    }

    /// True for protocol violations observed on the wire.
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            Error::MalformedFrame(_) | Error::UnknownOpcode(_) | Error::MessageTooShort { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::MalformedFrame(2);
        assert_eq!(err.to_string(), "frame length 2 is below the 4-byte header");

        let err = Error::KeySlotOccupied { side: "server", half: 1 };
        assert_eq!(err.to_string(), "server key slot 1 is already filled");
    }

    #[test]
    fn test_error_classification() {
        assert!(Error::InvalidVersion("0".into()).is_config_error());
        assert!(Error::IllegalState("Established").is_config_error());
        assert!(!Error::MalformedFrame(1).is_config_error());

        assert!(Error::MalformedFrame(1).is_protocol_error());
        assert!(!Error::CipherNotReady.is_protocol_error());
    }
}
