//! Hook dispatch engine.
//!
//! Routes every framed message through the registered hooks in merged
//! priority order, tracking the `modified`/`silenced` flags and the
//! parsed-event cache for one pipeline pass. Anomalies observed while a
//! message is in flight are logged and swallowed so the proxy stays
//! transparent; registration and injection surface failures to the
//! caller synchronously.

mod hook;
mod table;

pub use hook::{
    EventFn, EventOutcome, HookCode, HookContext, HookFilter, HookHandle, HookId, HookKind,
    HookOpts, HookVersion, MessageFlags, ParsedFn, ParsedOutcome, RawFn, RawOutcome, RawPacket,
};

pub(crate) use hook::{PendingPayload, PendingSend};

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::codec::{Catalogue, Codec, DefId, Event};
use crate::dispatch::hook::HookEntry;
use crate::dispatch::table::HookTable;
use crate::error::{Error, Result};
use crate::proto::{read_opcode, MessageBuilder, HEADER_SIZE};

/// Priority-ordered hook pipeline for one connection.
pub struct Dispatch {
    catalogue: Arc<Catalogue>,
    codec: Arc<Codec>,
    table: HookTable,
    next_id: HookId,
    sends: Vec<PendingSend>,
    unhooks: Vec<HookHandle>,
    revoked: HashSet<HookId>,
}

impl Dispatch {
    /// Create an engine over the shared catalogue and codec.
    pub fn new(catalogue: Arc<Catalogue>, codec: Arc<Codec>) -> Self {
        Self {
            catalogue,
            codec,
            table: HookTable::new(),
            next_id: 1,
            sends: Vec::new(),
            unhooks: Vec::new(),
            revoked: HashSet::new(),
        }
    }

    /// Register a hook.
    ///
    /// `name` is a catalogue name in either spelling, or `"*"` for the
    /// wildcard bucket (which requires a non-numeric version). The
    /// callback shape must match the version: `raw` takes a
    /// [`RawFn`], `event` an [`EventFn`], numeric and `"*"` versions a
    /// [`ParsedFn`].
    ///
    /// # Errors
    ///
    /// Fails synchronously on version/shape mismatches, unmapped names
    /// and unreadable definitions. Hooking a writeable-but-deprecated
    /// definition is accepted with a warning.
    pub fn hook(
        &mut self,
        module: &str,
        name: &str,
        version: HookVersion,
        opts: HookOpts,
        kind: HookKind,
    ) -> Result<HookHandle> {
        self.register(module, name, version, opts, kind, false)
    }

    /// Like [`hook`](Self::hook), but the hook removes itself after its
    /// first invocation.
    pub fn hook_once(
        &mut self,
        module: &str,
        name: &str,
        version: HookVersion,
        opts: HookOpts,
        kind: HookKind,
    ) -> Result<HookHandle> {
        self.register(module, name, version, opts, kind, true)
    }

    fn register(
        &mut self,
        module: &str,
        name: &str,
        version: HookVersion,
        opts: HookOpts,
        kind: HookKind,
        once: bool,
    ) -> Result<HookHandle> {
        match (version, &kind) {
            (HookVersion::Raw, HookKind::Raw(_)) => {}
            (HookVersion::Event, HookKind::Event(_)) => {}
            (HookVersion::Number(_) | HookVersion::Any, HookKind::Parsed(_)) => {}
            _ => return Err(Error::HookMismatch("callback shape does not match version")),
        }
        if version == HookVersion::Number(0) {
            return Err(Error::InvalidVersion("0".to_string()));
        }

        let code = if name == "*" {
            if matches!(version, HookVersion::Number(_)) {
                return Err(Error::InvalidVersion(
                    "wildcard name requires *, raw or event".to_string(),
                ));
            }
            HookCode::Any
        } else {
            let opcode = self
                .catalogue
                .opcode(name)
                .ok_or_else(|| Error::UnmappedMessage(name.to_string()))?;
            HookCode::Opcode(opcode)
        };

        let resolved = match (code, version) {
            (HookCode::Opcode(_), HookVersion::Number(n)) => {
                Some(self.check_readable(self.codec.resolve(name, n)?)?)
            }
            (HookCode::Opcode(_), HookVersion::Any) => {
                // Validated now, resolved against the latest version per
                // message so later definition loads are picked up.
                self.check_readable(self.codec.resolve_latest(name)?)?;
                None
            }
            _ => None,
        };

        let id = self.next_id;
        self.next_id += 1;

        let entry = HookEntry {
            id,
            module: module.to_string(),
            code,
            version,
            filter: opts.filter,
            order: opts.order,
            once,
            resolved,
            kind,
        };
        let handle = entry.handle();
        self.table.insert(entry);

        debug!(module, name, order = opts.order, id, "hook registered");
        Ok(handle)
    }

    fn check_readable(&self, id: DefId) -> Result<DefId> {
        if !id.readable {
            if id.writeable {
                warn!(name = %id.name, version = id.version, "hooking deprecated definition");
            } else {
                return Err(Error::UnreadableDefinition { name: id.name, version: id.version });
            }
        }
        Ok(id)
    }

    /// Remove a hook. Idempotent.
    pub fn unhook(&mut self, handle: HookHandle) {
        if self.table.remove(&handle) {
            debug!(id = handle.id, "hook removed");
        }
    }

    /// Remove every hook owned by `module`. Returns how many went.
    pub fn unhook_module(&mut self, module: &str) -> usize {
        let removed = self.table.remove_module(module);
        if removed > 0 {
            debug!(module, removed, "module hooks removed");
        }
        removed
    }

    /// Number of registered hooks.
    pub fn hook_count(&self) -> usize {
        self.table.len()
    }

    /// Drop every hook, e.g. on connection teardown.
    pub fn clear_hooks(&mut self) {
        self.table.clear();
    }

    /// Run one message through the pipeline.
    ///
    /// Returns the (possibly replaced) buffer, or `None` when some hook
    /// silenced the message. Callbacks may queue injections; the owner
    /// must drain [`take_sends`](Self::take_sends) after every pass.
    pub fn run(&mut self, buffer: Vec<u8>, incoming: bool, fake: bool) -> Option<Vec<u8>> {
        let mut buffer = buffer;
        let Some(opcode) = read_opcode(&buffer) else {
            warn!(len = buffer.len(), "dropping message shorter than its header");
            return None;
        };

        let mut modified = false;
        let mut silenced = false;
        let mut cache: HashMap<u16, Event> = HashMap::new();

        let plan = self.table.plan(opcode);
        for item in plan {
            if self.revoked.contains(&item.id) {
                continue;
            }

            let Self { table, codec, catalogue, sends, unhooks, revoked, .. } = self;
            let Some(entry) = table.find_mut(item.code, item.order, item.id) else {
                continue;
            };

            let flags = MessageFlags { fake, incoming, modified, silenced };
            if !entry.filter.accepts(flags) {
                continue;
            }

            let mut ctx =
                HookContext { sends: &mut *sends, unhooks: &mut *unhooks, revoked: &mut *revoked };
            match &mut entry.kind {
                HookKind::Raw(cb) => {
                    let packet = RawPacket { opcode, data: &buffer, flags };
                    match cb(&mut ctx, &packet) {
                        Ok(RawOutcome::Replace(next)) => {
                            if next != buffer {
                                buffer = next;
                                modified = true;
                                cache.clear();
                            }
                        }
                        Ok(RawOutcome::Silence) => silenced = true,
                        Ok(RawOutcome::Unsilence) => silenced = false,
                        Ok(RawOutcome::Pass) => {}
                        Err(e) => {
                            warn!(module = %entry.module, opcode, error = %e, "raw hook failed");
                        }
                    }
                }
                HookKind::Event(cb) => match cb(&mut ctx) {
                    Ok(EventOutcome::Silence) => silenced = true,
                    Ok(EventOutcome::Pass) => {}
                    Err(e) => {
                        warn!(module = %entry.module, opcode, error = %e, "event hook failed");
                    }
                },
                HookKind::Parsed(cb) => {
                    let id = match &entry.resolved {
                        Some(id) => id.clone(),
                        None => match resolve_latest_for(codec, catalogue, opcode) {
                            Ok(id) => id,
                            Err(e) => {
                                debug!(module = %entry.module, opcode, error = %e, "no definition for message");
                                continue;
                            }
                        },
                    };

                    if !cache.contains_key(&id.version) {
                        match codec.parse(&id, &buffer[HEADER_SIZE..]) {
                            Ok(event) => {
                                cache.insert(id.version, event);
                            }
                            Err(e) => {
                                warn!(
                                    module = %entry.module,
                                    opcode,
                                    version = id.version,
                                    data = %hex::encode(&buffer),
                                    error = %e,
                                    "message parse failed"
                                );
                                continue;
                            }
                        }
                    }
                    let Some(cached) = cache.get(&id.version) else { continue };
                    // Per-hook clone so silent mutations never leak to
                    // the next hook
                    let mut event = cached.clone();

                    match cb(&mut ctx, &mut event, flags) {
                        Ok(ParsedOutcome::Mutated) => {
                            let rebuilt = codec
                                .write(&id, &event)
                                .and_then(|payload| MessageBuilder::assemble(opcode, &payload));
                            match rebuilt {
                                Ok(next) => {
                                    buffer = next;
                                    modified = true;
                                    silenced = false;
                                    cache.clear();
                                }
                                Err(e) => {
                                    warn!(
                                        module = %entry.module,
                                        opcode,
                                        version = id.version,
                                        error = %e,
                                        "event reserialise failed"
                                    );
                                }
                            }
                        }
                        Ok(ParsedOutcome::Silence) => silenced = true,
                        Ok(ParsedOutcome::Pass) => {}
                        Err(e) => {
                            warn!(module = %entry.module, opcode, error = %e, "parsed hook failed");
                        }
                    }
                }
            }

            if entry.once {
                let handle = entry.handle();
                revoked.insert(handle.id);
                unhooks.push(handle);
            }
        }

        let unhooks: Vec<HookHandle> = self.unhooks.drain(..).collect();
        for handle in unhooks {
            self.table.remove(&handle);
        }
        self.revoked.clear();

        if silenced {
            None
        } else {
            Some(buffer)
        }
    }

    /// Inject a pre-built message.
    ///
    /// The buffer is copied at this boundary: encryption happens in
    /// place downstream and must never touch a caller-owned buffer. The
    /// copy runs the pipeline with `fake = true` and
    /// `incoming = !outgoing`.
    ///
    /// # Errors
    ///
    /// [`Error::MessageTooShort`] if the buffer cannot hold a header.
    pub fn inject_raw(&mut self, outgoing: bool, message: &[u8]) -> Result<Option<Vec<u8>>> {
        if message.len() < HEADER_SIZE {
            return Err(Error::MessageTooShort { expected: HEADER_SIZE, actual: message.len() });
        }
        Ok(self.run(message.to_vec(), !outgoing, true))
    }

    /// Serialise `(name, version, event)` and inject the result.
    ///
    /// `version` of `None` uses the latest definition.
    ///
    /// # Errors
    ///
    /// Fails on unmapped names, missing or unwriteable definitions and
    /// serialise errors.
    pub fn inject_message(
        &mut self,
        outgoing: bool,
        name: &str,
        version: Option<u16>,
        event: &Event,
    ) -> Result<Option<Vec<u8>>> {
        let opcode = self
            .catalogue
            .opcode(name)
            .ok_or_else(|| Error::UnmappedMessage(name.to_string()))?;
        let id = match version {
            Some(v) => self.codec.resolve(name, v)?,
            None => self.codec.resolve_latest(name)?,
        };

        let payload = self.codec.write(&id, event)?;
        let buffer = MessageBuilder::assemble(opcode, &payload)?;
        Ok(self.run(buffer, !outgoing, true))
    }

    /// Take the injections queued by callbacks during recent passes.
    ///
    /// The owner must drain this after every pass and feed each entry
    /// back through [`inject_raw`](Self::inject_raw) or
    /// [`inject_message`](Self::inject_message), repeating until empty.
    pub(crate) fn take_sends(&mut self) -> Vec<PendingSend> {
        std::mem::take(&mut self.sends)
    }
}

fn resolve_latest_for(codec: &Codec, catalogue: &Catalogue, opcode: u16) -> Result<DefId> {
    let name = catalogue.name(opcode).ok_or(Error::UnknownOpcode(opcode))?;
    codec.resolve_latest(&name)
}
