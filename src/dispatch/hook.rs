//! Hook records, filters and callback shapes.
//!
//! A hook observes or transforms messages of one opcode (or all
//! opcodes) at a signed priority order. The callback shape depends on
//! the requested definition version:
//!
//! - `raw` hooks see the message bytes and may replace them
//! - `event` hooks see nothing and may only silence
//! - versioned hooks see a parsed event clone and may mutate it
//!
//! Callbacks receive a [`HookContext`] through which they queue
//! injections and unhooks; both are applied by the engine, never
//! re-entrantly.

use std::collections::HashSet;

use crate::codec::{DefId, Event};
use crate::error::Result;

/// Engine-assigned hook identifier.
pub type HookId = u64;

/// Which messages a hook binds to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookCode {
    /// One specific opcode
    Opcode(u16),
    /// The wildcard bucket: every opcode
    Any,
}

/// Requested definition version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookVersion {
    /// A specific definition version (positive)
    Number(u16),
    /// Latest known definition version, resolved per message
    Any,
    /// Raw bytes, no parsing
    Raw,
    /// Notification only, no data
    Event,
}

/// Flags accompanying a message through the pipeline.
///
/// Observable by callbacks but never part of the wire format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MessageFlags {
    /// Originated by the injection API rather than a socket
    pub fake: bool,
    /// Travelling server-to-client
    pub incoming: bool,
    /// Some earlier hook replaced the buffer
    pub modified: bool,
    /// Some earlier hook marked the message for suppression
    pub silenced: bool,
}

/// Ternary filter over the message flags.
///
/// `None` accepts either value. The defaults reject fake and silenced
/// messages, so hooks that want those must opt in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HookFilter {
    /// Match against [`MessageFlags::fake`]
    pub fake: Option<bool>,
    /// Match against [`MessageFlags::incoming`]
    pub incoming: Option<bool>,
    /// Match against [`MessageFlags::modified`]
    pub modified: Option<bool>,
    /// Match against [`MessageFlags::silenced`]
    pub silenced: Option<bool>,
}

impl Default for HookFilter {
    fn default() -> Self {
        Self { fake: Some(false), incoming: None, modified: None, silenced: Some(false) }
    }
}

impl HookFilter {
    /// A filter that accepts every message.
    pub fn any() -> Self {
        Self { fake: None, incoming: None, modified: None, silenced: None }
    }

    /// Whether a message with these flags passes the filter.
    pub fn accepts(&self, flags: MessageFlags) -> bool {
        fn matches(want: Option<bool>, have: bool) -> bool {
            want.map_or(true, |w| w == have)
        }

        matches(self.fake, flags.fake)
            && matches(self.incoming, flags.incoming)
            && matches(self.modified, flags.modified)
            && matches(self.silenced, flags.silenced)
    }
}

/// Registration options.
#[derive(Debug, Clone, Copy, Default)]
pub struct HookOpts {
    /// Message filter
    pub filter: HookFilter,
    /// Priority; lower runs first, default 0
    pub order: i32,
}

impl HookOpts {
    /// Options with a non-default order.
    pub fn order(order: i32) -> Self {
        Self { order, ..Self::default() }
    }

    /// Options with a non-default filter.
    pub fn filter(filter: HookFilter) -> Self {
        Self { filter, ..Self::default() }
    }
}

/// View of the current message handed to raw hooks.
#[derive(Debug)]
pub struct RawPacket<'a> {
    /// Opcode at offset 2
    pub opcode: u16,
    /// Whole message including header
    pub data: &'a [u8],
    /// Pipeline flags at the moment of the call
    pub flags: MessageFlags,
}

/// What a raw hook did with the message.
#[derive(Debug)]
pub enum RawOutcome {
    /// No change
    Pass,
    /// Replace the message buffer; equal content counts as no change
    Replace(Vec<u8>),
    /// Mark the message silenced
    Silence,
    /// Clear a silence set by an earlier hook
    Unsilence,
}

/// What an event hook did with the message.
#[derive(Debug)]
pub enum EventOutcome {
    /// No change
    Pass,
    /// Mark the message silenced
    Silence,
}

/// What a versioned hook did with its event clone.
#[derive(Debug)]
pub enum ParsedOutcome {
    /// Discard the clone, keep the current buffer
    Pass,
    /// Reserialise the (mutated) clone as the new buffer
    Mutated,
    /// Mark the message silenced
    Silence,
}

/// Callback for `raw` hooks.
pub type RawFn = Box<dyn FnMut(&mut HookContext<'_>, &RawPacket<'_>) -> Result<RawOutcome> + Send>;

/// Callback for `event` hooks.
pub type EventFn = Box<dyn FnMut(&mut HookContext<'_>) -> Result<EventOutcome> + Send>;

/// Callback for versioned hooks.
pub type ParsedFn =
    Box<dyn FnMut(&mut HookContext<'_>, &mut Event, MessageFlags) -> Result<ParsedOutcome> + Send>;

/// Tagged callback variant; must match the hook version.
pub enum HookKind {
    /// Byte-level callback
    Raw(RawFn),
    /// Notification callback
    Event(EventFn),
    /// Parsed-event callback
    Parsed(ParsedFn),
}

impl std::fmt::Debug for HookKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tag = match self {
            HookKind::Raw(_) => "Raw",
            HookKind::Event(_) => "Event",
            HookKind::Parsed(_) => "Parsed",
        };
        f.write_str(tag)
    }
}

/// Opaque handle returned by registration; feed back to `unhook`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HookHandle {
    pub(crate) id: HookId,
    pub(crate) code: HookCode,
    pub(crate) order: i32,
}

impl HookHandle {
    /// Engine-assigned identifier, mostly useful for logs.
    pub fn id(&self) -> HookId {
        self.id
    }
}

pub(crate) struct HookEntry {
    pub id: HookId,
    pub module: String,
    pub code: HookCode,
    pub version: HookVersion,
    pub filter: HookFilter,
    pub order: i32,
    pub once: bool,
    pub resolved: Option<DefId>,
    pub kind: HookKind,
}

impl HookEntry {
    pub fn handle(&self) -> HookHandle {
        HookHandle { id: self.id, code: self.code, order: self.order }
    }
}

/// Injection payload queued by a callback.
#[derive(Debug)]
pub(crate) enum PendingPayload {
    Raw(Vec<u8>),
    Message { name: String, version: Option<u16>, event: Event },
}

/// One queued injection.
#[derive(Debug)]
pub(crate) struct PendingSend {
    pub to_server: bool,
    pub payload: PendingPayload,
}

/// Handed to every callback; queues work for after the current pass.
///
/// Injections run as fresh pipeline passes with `fake = true` once the
/// current pass returns. Unhooks are revoked immediately for the rest
/// of the pass and removed from the table when it ends.
pub struct HookContext<'a> {
    pub(crate) sends: &'a mut Vec<PendingSend>,
    pub(crate) unhooks: &'a mut Vec<HookHandle>,
    pub(crate) revoked: &'a mut HashSet<HookId>,
}

impl HookContext<'_> {
    /// Queue raw bytes for the server. The buffer is copied.
    pub fn send_to_server(&mut self, message: &[u8]) {
        self.sends.push(PendingSend { to_server: true, payload: PendingPayload::Raw(message.to_vec()) });
    }

    /// Queue raw bytes for the client. The buffer is copied.
    pub fn send_to_client(&mut self, message: &[u8]) {
        self.sends.push(PendingSend { to_server: false, payload: PendingPayload::Raw(message.to_vec()) });
    }

    /// Queue a structured message for the server.
    ///
    /// `version` of `None` serialises with the latest definition.
    pub fn send_message_to_server(&mut self, name: &str, version: Option<u16>, event: Event) {
        self.sends.push(PendingSend {
            to_server: true,
            payload: PendingPayload::Message { name: name.to_string(), version, event },
        });
    }

    /// Queue a structured message for the client.
    pub fn send_message_to_client(&mut self, name: &str, version: Option<u16>, event: Event) {
        self.sends.push(PendingSend {
            to_server: false,
            payload: PendingPayload::Message { name: name.to_string(), version, event },
        });
    }

    /// Revoke a hook for the rest of this pass and remove it afterwards.
    pub fn unhook(&mut self, handle: HookHandle) {
        self.revoked.insert(handle.id);
        self.unhooks.push(handle);
    }
}
