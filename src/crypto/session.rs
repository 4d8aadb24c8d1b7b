//! Cipher session key-slot state machine.
//!
//! A session holds two pairs of 128-byte key halves, one pair per side.
//! Each slot accepts exactly one install; once all four are filled the
//! session can be initialised exactly once, after which the two
//! directional keystreams become usable. The cipher primitive itself
//! lives in [`keystream`](crate::crypto::keystream); this type only
//! sequences it.

use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::crypto::keystream::{DirectionKeystream, FROM_SERVER_INFO, TO_SERVER_INFO};
use crate::crypto::KEY_HALF_SIZE;
use crate::error::{Error, Result};

/// Which peer a key half belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// Key half issued by the game client
    Client,
    /// Key half issued by the game server
    Server,
}

impl Side {
    fn as_str(self) -> &'static str {
        match self {
            Side::Client => "client",
            Side::Server => "server",
        }
    }
}

/// Observable session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherState {
    /// No key halves installed
    Empty,
    /// Some but not all halves installed
    HalfKeyed,
    /// All four halves installed, `init` not yet called
    Full,
    /// Initialised; transforms are legal
    Ready,
}

/// One 128-byte key half, wiped on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
struct KeyHalf([u8; KEY_HALF_SIZE]);

struct Streams {
    to_server: DirectionKeystream,
    from_server: DirectionKeystream,
}

/// Bidirectional keystream state for one connection.
pub struct CipherSession {
    client: [Option<KeyHalf>; 2],
    server: [Option<KeyHalf>; 2],
    streams: Option<Streams>,
}

impl CipherSession {
    /// Create an empty session.
    pub fn new() -> Self {
        Self { client: [None, None], server: [None, None], streams: None }
    }

    /// Observable state of the key slots and keystreams.
    pub fn state(&self) -> CipherState {
        if self.streams.is_some() {
            return CipherState::Ready;
        }
        let filled = self.filled_count();
        match filled {
            0 => CipherState::Empty,
            4 => CipherState::Full,
            _ => CipherState::HalfKeyed,
        }
    }

    /// Install a key half into slot `half` on `side`.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidKeySlot`] for `half > 1`
    /// - [`Error::InvalidKeyLength`] unless `key` is exactly 128 bytes
    /// - [`Error::KeySlotOccupied`] if the slot already holds a half
    /// - [`Error::CipherAlreadyInit`] after `init`
    pub fn install(&mut self, side: Side, half: usize, key: &[u8]) -> Result<()> {
        if self.streams.is_some() {
            return Err(Error::CipherAlreadyInit);
        }
        if half > 1 {
            return Err(Error::InvalidKeySlot(half));
        }
        if key.len() != KEY_HALF_SIZE {
            return Err(Error::InvalidKeyLength { expected: KEY_HALF_SIZE, actual: key.len() });
        }

        let slot = match side {
            Side::Client => &mut self.client[half],
            Side::Server => &mut self.server[half],
        };
        if slot.is_some() {
            return Err(Error::KeySlotOccupied { side: side.as_str(), half });
        }

        let mut bytes = [0u8; KEY_HALF_SIZE];
        bytes.copy_from_slice(key);
        *slot = Some(KeyHalf(bytes));
        Ok(())
    }

    /// True once all four halves are installed.
    pub fn is_full(&self) -> bool {
        self.filled_count() == 4
    }

    /// Derive both directional keystreams.
    ///
    /// Legal exactly once, and only with all four halves installed.
    ///
    /// # Errors
    ///
    /// [`Error::CipherNotReady`] before all slots are filled,
    /// [`Error::CipherAlreadyInit`] on a second call.
    pub fn init(&mut self) -> Result<()> {
        if self.streams.is_some() {
            return Err(Error::CipherAlreadyInit);
        }
        if !self.is_full() {
            return Err(Error::CipherNotReady);
        }

        // Derivation order is part of the wire contract: client halves
        // first, then server halves.
        let mut ikm = [0u8; KEY_HALF_SIZE * 4];
        for (i, half) in self
            .client
            .iter()
            .chain(self.server.iter())
            .flatten()
            .enumerate()
        {
            ikm[i * KEY_HALF_SIZE..(i + 1) * KEY_HALF_SIZE].copy_from_slice(&half.0);
        }

        self.streams = Some(Streams {
            to_server: DirectionKeystream::derive(&ikm, TO_SERVER_INFO),
            from_server: DirectionKeystream::derive(&ikm, FROM_SERVER_INFO),
        });
        ikm.zeroize();
        Ok(())
    }

    /// Transform an outbound (to-server) buffer in place.
    ///
    /// # Errors
    ///
    /// [`Error::CipherNotReady`] before `init`.
    pub fn apply_to_server(&mut self, buf: &mut [u8]) -> Result<()> {
        let streams = self.streams.as_mut().ok_or(Error::CipherNotReady)?;
        streams.to_server.apply(buf);
        Ok(())
    }

    /// Transform an inbound (from-server) buffer in place.
    ///
    /// # Errors
    ///
    /// [`Error::CipherNotReady`] before `init`.
    pub fn apply_from_server(&mut self, buf: &mut [u8]) -> Result<()> {
        let streams = self.streams.as_mut().ok_or(Error::CipherNotReady)?;
        streams.from_server.apply(buf);
        Ok(())
    }

    fn filled_count(&self) -> usize {
        self.client.iter().chain(self.server.iter()).flatten().count()
    }
}

impl Default for CipherSession {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CipherSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CipherSession").field("state", &self.state()).finish()
    }
}
