//! Outbound message integrity tagger.
//!
//! Certain opcodes reserve their trailing bytes for a tag that the
//! server verifies. The tag is a truncated HMAC-SHA256 over a rolling
//! counter, the opcode, and the message body, keyed by a per-connection
//! seed. Older protocol generations ship the seed in configuration;
//! newer ones derive it from the first inbound login message, so the
//! tagger may not exist until mid-session. Tags are always written
//! before encryption.

use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::crypto::TAG_SIZE;
use crate::error::{Error, Result};
use crate::proto::HEADER_SIZE;

type HmacSha256 = Hmac<Sha256>;

/// HMAC key used to stretch a login payload into a tag seed
const LOGIN_SEED_KEY: &[u8] = b"interpose/login-seed/v1";

/// Writes integrity tags into designated outbound messages.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct IntegrityTagger {
    seed: [u8; 32],
    #[zeroize(skip)]
    counter: u64,
}

impl IntegrityTagger {
    /// Construct from a configuration-supplied seed of any length.
    pub fn new(seed: &[u8]) -> Self {
        let digest = Sha256::digest(seed);
        let mut key = [0u8; 32];
        key.copy_from_slice(&digest);
        Self { seed: key, counter: 0 }
    }

    /// Construct from the payload of the inbound login message.
    pub fn from_login(payload: &[u8]) -> Self {
        let mut mac = HmacSha256::new_from_slice(LOGIN_SEED_KEY)
            .expect("HMAC can take key of any size");
        mac.update(payload);
        let out = mac.finalize().into_bytes();

        let mut key = [0u8; 32];
        key.copy_from_slice(&out);
        Self { seed: key, counter: 0 }
    }

    /// Write the tag into the trailing bytes of `buf` and advance the
    /// counter.
    ///
    /// # Errors
    ///
    /// [`Error::MessageTooShort`] if the message cannot hold a header
    /// plus tag region.
    pub fn apply(&mut self, buf: &mut [u8], opcode: u16) -> Result<()> {
        let min = HEADER_SIZE + TAG_SIZE;
        if buf.len() < min {
            return Err(Error::MessageTooShort { expected: min, actual: buf.len() });
        }

        let body_end = buf.len() - TAG_SIZE;

        let mut mac =
            HmacSha256::new_from_slice(&self.seed).expect("HMAC can take key of any size");
        mac.update(&self.counter.to_le_bytes());
        mac.update(&opcode.to_le_bytes());
        mac.update(&buf[..body_end]);
        let tag = mac.finalize().into_bytes();

        buf[body_end..].copy_from_slice(&tag[..TAG_SIZE]);
        self.counter = self.counter.wrapping_add(1);
        Ok(())
    }

    /// Number of messages tagged so far.
    pub fn count(&self) -> u64 {
        self.counter
    }
}

impl std::fmt::Debug for IntegrityTagger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IntegrityTagger").field("counter", &self.counter).finish()
    }
}
