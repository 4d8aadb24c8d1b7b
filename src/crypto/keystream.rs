//! Per-direction stream keystream.
//!
//! Both traffic directions are encrypted by XOR against an independent
//! keystream. The stream key and IV are expanded with HKDF-SHA256 from
//! the concatenated key halves, one expansion label per direction, and
//! the stream itself is ChaCha20. The transform is length-preserving
//! and symmetric: applying it twice at the same position restores the
//! input.

use chacha20::cipher::{KeyIvInit, StreamCipher};
use chacha20::ChaCha20;
use hkdf::Hkdf;
use sha2::Sha256;
use zeroize::Zeroize;

use crate::crypto::{STREAM_IV_SIZE, STREAM_KEY_SIZE};

/// HKDF salt shared by both directions
const KEYSTREAM_SALT: &[u8] = b"interpose/keystream/v1";

/// Expansion label for the client-to-server direction
pub const TO_SERVER_INFO: &[u8] = b"to-server";

/// Expansion label for the server-to-client direction
pub const FROM_SERVER_INFO: &[u8] = b"from-server";

/// One direction of the session keystream.
///
/// Stateful: every `apply` advances the stream position by the buffer
/// length, so both peers must transform the same byte sequence in the
/// same order.
pub struct DirectionKeystream {
    cipher: ChaCha20,
    position: u64,
}

impl DirectionKeystream {
    /// Derive a direction keystream from input key material.
    ///
    /// `ikm` is the concatenation of the four session key halves;
    /// `info` selects the direction ([`TO_SERVER_INFO`] or
    /// [`FROM_SERVER_INFO`]).
    pub fn derive(ikm: &[u8], info: &[u8]) -> Self {
        let hk = Hkdf::<Sha256>::new(Some(KEYSTREAM_SALT), ikm);

        let mut okm = [0u8; STREAM_KEY_SIZE + STREAM_IV_SIZE];
        // Expansion cannot fail for a 44-byte output
        hk.expand(info, &mut okm).unwrap();

        let cipher = ChaCha20::new(
            chacha20::Key::from_slice(&okm[..STREAM_KEY_SIZE]),
            chacha20::Nonce::from_slice(&okm[STREAM_KEY_SIZE..]),
        );
        okm.zeroize();

        Self { cipher, position: 0 }
    }

    /// XOR the keystream into `buf` in place and advance the position.
    pub fn apply(&mut self, buf: &mut [u8]) {
        self.cipher.apply_keystream(buf);
        self.position = self.position.wrapping_add(buf.len() as u64);
    }

    /// Total bytes transformed so far.
    pub fn position(&self) -> u64 {
        self.position
    }
}

impl std::fmt::Debug for DirectionKeystream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectionKeystream").field("position", &self.position).finish()
    }
}
