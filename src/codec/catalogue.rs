//! Protocol catalogue.
//!
//! Read-mostly mapping between message names, opcodes, padding flags
//! and latest definition versions. One catalogue is shared by every
//! connection; mutation happens at load time and is guarded by a
//! `parking_lot` lock like the other shared registries.

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::codec::Codec;
use crate::error::{Error, Result};

/// Number of possible opcodes
const OPCODE_SPACE: usize = 1 << 16;

struct Inner {
    by_name: HashMap<String, u16>,
    by_opcode: HashMap<u16, String>,
    padding: Vec<bool>,
    latest: HashMap<String, u16>,
}

/// Bidirectional name ⇄ opcode map with padding flags.
pub struct Catalogue {
    inner: RwLock<Inner>,
}

impl Catalogue {
    /// Create an empty catalogue.
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                by_name: HashMap::new(),
                by_opcode: HashMap::new(),
                padding: vec![false; OPCODE_SPACE],
                latest: HashMap::new(),
            }),
        }
    }

    /// Normalise a message name to its canonical UPPER_SNAKE form.
    ///
    /// Accepts either the canonical form (`S_LOGIN_ARBITER`) or
    /// lowerCamel (`sLoginArbiter`); both address the same opcode.
    pub fn canonical(name: &str) -> String {
        if !name.chars().any(|c| c.is_ascii_lowercase()) {
            return name.to_string();
        }

        let mut out = String::with_capacity(name.len() + 4);
        let mut prev_lower = false;
        for c in name.chars() {
            if c.is_ascii_uppercase() && prev_lower {
                out.push('_');
            }
            prev_lower = c.is_ascii_lowercase() || c.is_ascii_digit();
            out.push(c.to_ascii_uppercase());
        }
        out
    }

    /// Register one name/opcode pair. Load-time only.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if either the name or the opcode
    /// is already mapped to something else.
    pub fn add_opcode(&self, name: &str, opcode: u16, padded: bool) -> Result<()> {
        let canonical = Self::canonical(name);
        let mut inner = self.inner.write();

        if let Some(&existing) = inner.by_name.get(&canonical) {
            if existing != opcode {
                return Err(Error::config(format!(
                    "{} is already mapped to {:#06x}",
                    canonical, existing
                )));
            }
        }
        if let Some(existing) = inner.by_opcode.get(&opcode) {
            if existing != &canonical {
                return Err(Error::config(format!(
                    "opcode {:#06x} is already mapped to {}",
                    opcode, existing
                )));
            }
        }

        inner.by_name.insert(canonical.clone(), opcode);
        inner.by_opcode.insert(opcode, canonical);
        inner.padding[opcode as usize] = padded;
        Ok(())
    }

    /// Parse a line-oriented opcode map: `NAME <opcode> [padded]`.
    ///
    /// Opcodes are decimal or `0x`-prefixed hex; `#` starts a comment.
    /// Returns the number of entries added.
    pub fn parse_map(&self, text: &str) -> Result<usize> {
        let mut added = 0;
        for (lineno, raw) in text.lines().enumerate() {
            let line = raw.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }

            let mut parts = line.split_whitespace();
            let (Some(name), Some(code)) = (parts.next(), parts.next()) else {
                return Err(Error::config(format!("opcode map line {}: expected NAME OPCODE", lineno + 1)));
            };

            let opcode = if let Some(hex) = code.strip_prefix("0x") {
                u16::from_str_radix(hex, 16)
            } else {
                code.parse()
            }
            .map_err(|_| Error::config(format!("opcode map line {}: bad opcode {}", lineno + 1, code)))?;

            let padded = match parts.next() {
                None => false,
                Some("padded") => true,
                Some(other) => {
                    return Err(Error::config(format!("opcode map line {}: unknown flag {}", lineno + 1, other)));
                }
            };

            self.add_opcode(name, opcode, padded)?;
            added += 1;
        }
        Ok(added)
    }

    /// Look up the opcode for a name in either spelling.
    pub fn opcode(&self, name: &str) -> Option<u16> {
        self.inner.read().by_name.get(&Self::canonical(name)).copied()
    }

    /// Look up the canonical name for an opcode.
    pub fn name(&self, opcode: u16) -> Option<String> {
        self.inner.read().by_opcode.get(&opcode).cloned()
    }

    /// Whether outbound messages of this opcode carry an integrity tag.
    pub fn has_padding(&self, opcode: u16) -> bool {
        self.inner.read().padding[opcode as usize]
    }

    /// Latest known definition version for a name.
    pub fn latest(&self, name: &str) -> Option<u16> {
        self.inner.read().latest.get(&Self::canonical(name)).copied()
    }

    /// Rebuild the latest-version table from the codec registry.
    pub fn refresh_latest(&self, codec: &Codec) {
        let mut latest: HashMap<String, u16> = HashMap::new();
        for (name, version) in codec.messages() {
            let entry = latest.entry(name).or_insert(version);
            if version > *entry {
                *entry = version;
            }
        }
        self.inner.write().latest = latest;
    }

    /// Number of mapped names.
    pub fn len(&self) -> usize {
        self.inner.read().by_name.len()
    }

    /// True if no names are mapped.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for Catalogue {
    fn default() -> Self {
        Self::new()
    }
}
