//! Message codec.
//!
//! Maps between wire payloads and structured events for a given
//! `(name, version)` pair. Definitions are ordered field lists loaded
//! from a line-oriented text form; multiple versions of one message
//! coexist and the newest is the distinguished "latest". The registry
//! is shared across connections and, like the catalogue, only mutated
//! at load time.

mod catalogue;

pub use catalogue::Catalogue;

use std::collections::BTreeMap;

use bytes::{Buf, BufMut};
use parking_lot::RwLock;

use crate::error::{Error, Result};

/// Wire type of one definition field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    /// Unsigned 8-bit integer
    Byte,
    /// Unsigned 16-bit integer, little-endian
    U16,
    /// Unsigned 32-bit integer, little-endian
    U32,
    /// Unsigned 64-bit integer, little-endian
    U64,
    /// Signed 32-bit integer, little-endian
    I32,
    /// IEEE-754 single, little-endian
    F32,
    /// Single byte, zero is false
    Bool,
    /// UTF-8 string with a u16 little-endian byte-length prefix
    Str,
    /// Raw bytes with a u16 little-endian length prefix
    Bytes,
}

impl FieldType {
    fn parse(token: &str) -> Result<Self> {
        Ok(match token {
            "byte" => FieldType::Byte,
            "u16" => FieldType::U16,
            "u32" => FieldType::U32,
            "u64" => FieldType::U64,
            "i32" => FieldType::I32,
            "f32" => FieldType::F32,
            "bool" => FieldType::Bool,
            "string" => FieldType::Str,
            "bytes" => FieldType::Bytes,
            other => return Err(Error::codec(format!("unknown field type: {}", other))),
        })
    }
}

/// One field of a definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    /// Field name as it appears in events
    pub name: String,
    /// Wire type
    pub ty: FieldType,
}

/// Ordered field list describing one wire layout of a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Definition {
    /// Fields in wire order
    pub fields: Vec<Field>,
}

impl Definition {
    /// Parse the line-oriented definition text form.
    ///
    /// One `name type` pair per line; `#` starts a comment; blank lines
    /// are skipped.
    ///
    /// # Errors
    ///
    /// Rejects unknown types, malformed lines and duplicate field
    /// names.
    pub fn parse(text: &str) -> Result<Self> {
        let mut fields: Vec<Field> = Vec::new();
        for (lineno, raw) in text.lines().enumerate() {
            let line = raw.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }

            let mut parts = line.split_whitespace();
            let (Some(name), Some(ty)) = (parts.next(), parts.next()) else {
                return Err(Error::codec(format!("definition line {}: expected NAME TYPE", lineno + 1)));
            };
            if parts.next().is_some() {
                return Err(Error::codec(format!("definition line {}: trailing tokens", lineno + 1)));
            }
            if fields.iter().any(|f| f.name == name) {
                return Err(Error::codec(format!("definition line {}: duplicate field {}", lineno + 1, name)));
            }

            fields.push(Field { name: name.to_string(), ty: FieldType::parse(ty)? });
        }
        Ok(Self { fields })
    }
}

/// A decoded field value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Unsigned 8-bit integer
    Byte(u8),
    /// Unsigned 16-bit integer
    U16(u16),
    /// Unsigned 32-bit integer
    U32(u32),
    /// Unsigned 64-bit integer
    U64(u64),
    /// Signed 32-bit integer
    I32(i32),
    /// IEEE-754 single
    F32(f32),
    /// Boolean
    Bool(bool),
    /// UTF-8 string
    Str(String),
    /// Raw bytes
    Bytes(Vec<u8>),
}

impl Value {
    /// Widen any unsigned integer variant to u64.
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::Byte(v) => Some(u64::from(*v)),
            Value::U16(v) => Some(u64::from(*v)),
            Value::U32(v) => Some(u64::from(*v)),
            Value::U64(v) => Some(*v),
            _ => None,
        }
    }

    /// String contents, if this is a string value.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Byte contents, if this is a bytes value.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Boolean contents, if this is a bool value.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

/// A parsed message: ordered field/value pairs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Event {
    fields: Vec<(String, Value)>,
}

impl Event {
    /// Create an empty event.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a field, replacing an existing value of the same name.
    pub fn set(&mut self, name: impl Into<String>, value: Value) {
        let name = name.into();
        if let Some(slot) = self.fields.iter_mut().find(|(n, _)| *n == name) {
            slot.1 = value;
        } else {
            self.fields.push((name, value));
        }
    }

    /// Get a field value by name.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    /// Get a mutable field value by name.
    pub fn get_mut(&mut self, name: &str) -> Option<&mut Value> {
        self.fields.iter_mut().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    /// Iterate fields in order.
    pub fn fields(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.fields.iter().map(|(n, v)| (n.as_str(), v))
    }

    /// Number of fields.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// True if the event has no fields.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// Resolved definition identifier handed to parse/write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DefId {
    /// Canonical message name
    pub name: String,
    /// Definition version
    pub version: u16,
    /// Whether parse is legal
    pub readable: bool,
    /// Whether write is legal
    pub writeable: bool,
}

struct Entry {
    def: Definition,
    readable: bool,
    writeable: bool,
}

/// Definition registry keyed by `(name, version)`.
pub struct Codec {
    defs: RwLock<BTreeMap<(String, u16), Entry>>,
}

impl Codec {
    /// Create an empty codec.
    pub fn new() -> Self {
        Self { defs: RwLock::new(BTreeMap::new()) }
    }

    /// Register a definition. Load-time only.
    ///
    /// # Errors
    ///
    /// Rejects version 0 and, unless `overwrite` is set, duplicate
    /// `(name, version)` pairs.
    pub fn add_definition(
        &self,
        name: &str,
        version: u16,
        def: Definition,
        overwrite: bool,
    ) -> Result<()> {
        if version == 0 {
            return Err(Error::InvalidVersion("0".to_string()));
        }

        let key = (Catalogue::canonical(name), version);
        let mut defs = self.defs.write();
        if defs.contains_key(&key) && !overwrite {
            return Err(Error::config(format!("definition {} v{} already exists", key.0, version)));
        }

        defs.insert(key, Entry { def, readable: true, writeable: true });
        Ok(())
    }

    /// Mark a definition deprecated: still writeable for injection, no
    /// longer readable for hooks.
    ///
    /// # Errors
    ///
    /// [`Error::MissingDefinition`] if the pair is unknown.
    pub fn deprecate(&self, name: &str, version: u16) -> Result<()> {
        let key = (Catalogue::canonical(name), version);
        let mut defs = self.defs.write();
        let entry = defs.get_mut(&key).ok_or(Error::MissingDefinition { name: key.0.clone(), version })?;
        entry.readable = false;
        Ok(())
    }

    /// Resolve a `(name, version)` pair to an identifier.
    ///
    /// # Errors
    ///
    /// [`Error::MissingDefinition`] if the pair is unknown.
    pub fn resolve(&self, name: &str, version: u16) -> Result<DefId> {
        let canonical = Catalogue::canonical(name);
        let defs = self.defs.read();
        let entry = defs
            .get(&(canonical.clone(), version))
            .ok_or(Error::MissingDefinition { name: canonical.clone(), version })?;

        Ok(DefId { name: canonical, version, readable: entry.readable, writeable: entry.writeable })
    }

    /// Resolve the latest version registered for a name.
    ///
    /// # Errors
    ///
    /// [`Error::MissingDefinition`] if no version exists at all.
    pub fn resolve_latest(&self, name: &str) -> Result<DefId> {
        let version = self
            .latest(name)
            .ok_or_else(|| Error::MissingDefinition { name: Catalogue::canonical(name), version: 0 })?;
        self.resolve(name, version)
    }

    /// Latest version registered for a name.
    pub fn latest(&self, name: &str) -> Option<u16> {
        let canonical = Catalogue::canonical(name);
        self.defs
            .read()
            .range((canonical.clone(), u16::MIN)..=(canonical, u16::MAX))
            .map(|((_, v), _)| *v)
            .max()
    }

    /// Enumerate every registered `(name, version)` pair.
    pub fn messages(&self) -> Vec<(String, u16)> {
        self.defs.read().keys().cloned().collect()
    }

    /// Decode a payload (message bytes after the 4-byte header).
    ///
    /// Trailing bytes beyond the definition (e.g. an integrity tag
    /// region) are ignored.
    ///
    /// # Errors
    ///
    /// [`Error::UnreadableDefinition`] for deprecated definitions,
    /// [`Error::Codec`] on truncated or malformed payloads.
    pub fn parse(&self, id: &DefId, payload: &[u8]) -> Result<Event> {
        let defs = self.defs.read();
        let entry = defs
            .get(&(id.name.clone(), id.version))
            .ok_or(Error::MissingDefinition { name: id.name.clone(), version: id.version })?;
        if !entry.readable {
            return Err(Error::UnreadableDefinition { name: id.name.clone(), version: id.version });
        }

        let mut buf = payload;
        let mut event = Event::new();
        for field in &entry.def.fields {
            let value = decode_field(&mut buf, field, id)?;
            event.set(field.name.clone(), value);
        }
        Ok(event)
    }

    /// Encode an event back into payload bytes.
    ///
    /// # Errors
    ///
    /// [`Error::UnwriteableDefinition`] if the definition cannot be
    /// written, [`Error::Codec`] on missing fields or type mismatches.
    pub fn write(&self, id: &DefId, event: &Event) -> Result<Vec<u8>> {
        let defs = self.defs.read();
        let entry = defs
            .get(&(id.name.clone(), id.version))
            .ok_or(Error::MissingDefinition { name: id.name.clone(), version: id.version })?;
        if !entry.writeable {
            return Err(Error::UnwriteableDefinition { name: id.name.clone(), version: id.version });
        }

        let mut out = Vec::new();
        for field in &entry.def.fields {
            let value = event.get(&field.name).ok_or_else(|| {
                Error::codec(format!("{} v{}: missing field {}", id.name, id.version, field.name))
            })?;
            encode_field(&mut out, field, value, id)?;
        }
        Ok(out)
    }

    /// Deep-copy an event.
    pub fn clone_event(&self, event: &Event) -> Event {
        event.clone()
    }
}

impl Default for Codec {
    fn default() -> Self {
        Self::new()
    }
}

fn decode_field(buf: &mut &[u8], field: &Field, id: &DefId) -> Result<Value> {
    let short = |need: usize, have: usize| {
        Error::codec(format!(
            "{} v{}: field {} needs {} bytes, {} remain",
            id.name, id.version, field.name, need, have
        ))
    };

    let need = match field.ty {
        FieldType::Byte | FieldType::Bool => 1,
        FieldType::U16 | FieldType::Str | FieldType::Bytes => 2,
        FieldType::U32 | FieldType::I32 | FieldType::F32 => 4,
        FieldType::U64 => 8,
    };
    if buf.remaining() < need {
        return Err(short(need, buf.remaining()));
    }

    Ok(match field.ty {
        FieldType::Byte => Value::Byte(buf.get_u8()),
        FieldType::U16 => Value::U16(buf.get_u16_le()),
        FieldType::U32 => Value::U32(buf.get_u32_le()),
        FieldType::U64 => Value::U64(buf.get_u64_le()),
        FieldType::I32 => Value::I32(buf.get_i32_le()),
        FieldType::F32 => Value::F32(buf.get_f32_le()),
        FieldType::Bool => Value::Bool(buf.get_u8() != 0),
        FieldType::Str => {
            let len = buf.get_u16_le() as usize;
            if buf.remaining() < len {
                return Err(short(len, buf.remaining()));
            }
            let raw = buf[..len].to_vec();
            buf.advance(len);
            let s = String::from_utf8(raw).map_err(|_| {
                Error::codec(format!("{} v{}: field {} is not UTF-8", id.name, id.version, field.name))
            })?;
            Value::Str(s)
        }
        FieldType::Bytes => {
            let len = buf.get_u16_le() as usize;
            if buf.remaining() < len {
                return Err(short(len, buf.remaining()));
            }
            let raw = buf[..len].to_vec();
            buf.advance(len);
            Value::Bytes(raw)
        }
    })
}

fn encode_field(out: &mut Vec<u8>, field: &Field, value: &Value, id: &DefId) -> Result<()> {
    let mismatch = || {
        Error::codec(format!(
            "{} v{}: field {} has type {:?}, got {:?}",
            id.name, id.version, field.name, field.ty, value
        ))
    };

    match (field.ty, value) {
        (FieldType::Byte, Value::Byte(v)) => out.put_u8(*v),
        (FieldType::U16, Value::U16(v)) => out.put_u16_le(*v),
        (FieldType::U32, Value::U32(v)) => out.put_u32_le(*v),
        (FieldType::U64, Value::U64(v)) => out.put_u64_le(*v),
        (FieldType::I32, Value::I32(v)) => out.put_i32_le(*v),
        (FieldType::F32, Value::F32(v)) => out.put_f32_le(*v),
        (FieldType::Bool, Value::Bool(v)) => out.put_u8(u8::from(*v)),
        (FieldType::Str, Value::Str(s)) => {
            if s.len() > u16::MAX as usize {
                return Err(Error::codec(format!("{}: string field {} too long", id.name, field.name)));
            }
            out.put_u16_le(s.len() as u16);
            out.put_slice(s.as_bytes());
        }
        (FieldType::Bytes, Value::Bytes(b)) => {
            if b.len() > u16::MAX as usize {
                return Err(Error::codec(format!("{}: bytes field {} too long", id.name, field.name)));
            }
            out.put_u16_le(b.len() as u16);
            out.put_slice(b);
        }
        _ => return Err(mismatch()),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const CHAT_DEF: &str = "\
        channel u32\n\
        authorName string\n\
        message string\n";

    fn codec_with_chat() -> Codec {
        let codec = Codec::new();
        codec.add_definition("S_CHAT", 1, Definition::parse(CHAT_DEF).unwrap(), false).unwrap();
        codec
    }

    fn chat_event(msg: &str) -> Event {
        let mut ev = Event::new();
        ev.set("channel", Value::U32(3));
        ev.set("authorName", Value::Str("tester".into()));
        ev.set("message", Value::Str(msg.into()));
        ev
    }

    #[test]
    fn test_definition_parse() {
        let def = Definition::parse("# chat\nchannel u32\n\nmessage string\n").unwrap();
        assert_eq!(def.fields.len(), 2);
        assert_eq!(def.fields[0].ty, FieldType::U32);
        assert_eq!(def.fields[1].name, "message");
    }

    #[test]
    fn test_definition_parse_errors() {
        assert!(Definition::parse("channel").is_err());
        assert!(Definition::parse("channel u33").is_err());
        assert!(Definition::parse("a u32 extra").is_err());
        assert!(Definition::parse("a u32\na u16").is_err());
    }

    #[test]
    fn test_round_trip() {
        let codec = codec_with_chat();
        let id = codec.resolve("S_CHAT", 1).unwrap();

        let payload = codec.write(&id, &chat_event("hello")).unwrap();
        let parsed = codec.parse(&id, &payload).unwrap();

        assert_eq!(parsed.get("channel").unwrap().as_u64(), Some(3));
        assert_eq!(parsed.get("message").unwrap().as_str(), Some("hello"));
        assert_eq!(codec.write(&id, &parsed).unwrap(), payload);
    }

    #[test]
    fn test_parse_ignores_trailing_bytes() {
        let codec = codec_with_chat();
        let id = codec.resolve("S_CHAT", 1).unwrap();

        let mut payload = codec.write(&id, &chat_event("hi")).unwrap();
        payload.extend_from_slice(&[0u8; 8]);

        let parsed = codec.parse(&id, &payload).unwrap();
        assert_eq!(parsed.get("message").unwrap().as_str(), Some("hi"));
    }

    #[test]
    fn test_parse_truncated() {
        let codec = codec_with_chat();
        let id = codec.resolve("S_CHAT", 1).unwrap();
        assert!(matches!(codec.parse(&id, &[0x01, 0x00]), Err(Error::Codec(_))));
    }

    #[test]
    fn test_write_missing_field() {
        let codec = codec_with_chat();
        let id = codec.resolve("S_CHAT", 1).unwrap();

        let mut ev = Event::new();
        ev.set("channel", Value::U32(1));
        assert!(matches!(codec.write(&id, &ev), Err(Error::Codec(_))));
    }

    #[test]
    fn test_write_type_mismatch() {
        let codec = codec_with_chat();
        let id = codec.resolve("S_CHAT", 1).unwrap();

        let mut ev = chat_event("x");
        ev.set("channel", Value::Str("three".into()));
        assert!(matches!(codec.write(&id, &ev), Err(Error::Codec(_))));
    }

    #[test]
    fn test_versions_and_latest() {
        let codec = codec_with_chat();
        codec
            .add_definition("S_CHAT", 2, Definition::parse("channel u32\nmessage string").unwrap(), false)
            .unwrap();

        assert_eq!(codec.latest("S_CHAT"), Some(2));
        assert_eq!(codec.latest("sChat"), Some(2));
        assert_eq!(codec.resolve_latest("S_CHAT").unwrap().version, 2);
        assert_eq!(codec.messages().len(), 2);
    }

    #[test]
    fn test_duplicate_rejected_unless_overwrite() {
        let codec = codec_with_chat();
        let def = Definition::parse("x byte").unwrap();

        assert!(codec.add_definition("S_CHAT", 1, def.clone(), false).is_err());
        codec.add_definition("S_CHAT", 1, def, true).unwrap();
        assert_eq!(codec.resolve("S_CHAT", 1).unwrap().version, 1);
    }

    #[test]
    fn test_version_zero_rejected() {
        let codec = Codec::new();
        let def = Definition::parse("x byte").unwrap();
        assert!(matches!(codec.add_definition("S_CHAT", 0, def, false), Err(Error::InvalidVersion(_))));
    }

    #[test]
    fn test_deprecated_is_write_only() {
        let codec = codec_with_chat();
        codec.deprecate("S_CHAT", 1).unwrap();

        let id = codec.resolve("S_CHAT", 1).unwrap();
        assert!(!id.readable);
        assert!(id.writeable);

        assert!(matches!(codec.parse(&id, &[]), Err(Error::UnreadableDefinition { .. })));
        assert!(codec.write(&id, &chat_event("ok")).is_ok());
    }

    #[test]
    fn test_all_field_types_round_trip() {
        let codec = Codec::new();
        let def = Definition::parse(
            "a byte\nb u16\nc u32\nd u64\ne i32\nf f32\ng bool\nh string\ni bytes",
        )
        .unwrap();
        codec.add_definition("S_EVERYTHING", 1, def, false).unwrap();
        let id = codec.resolve("S_EVERYTHING", 1).unwrap();

        let mut ev = Event::new();
        ev.set("a", Value::Byte(7));
        ev.set("b", Value::U16(0xbeef));
        ev.set("c", Value::U32(0xdead_beef));
        ev.set("d", Value::U64(u64::MAX));
        ev.set("e", Value::I32(-5));
        ev.set("f", Value::F32(1.5));
        ev.set("g", Value::Bool(true));
        ev.set("h", Value::Str("héllo".into()));
        ev.set("i", Value::Bytes(vec![1, 2, 3]));

        let payload = codec.write(&id, &ev).unwrap();
        let parsed = codec.parse(&id, &payload).unwrap();
        assert_eq!(parsed, ev);
    }
}
