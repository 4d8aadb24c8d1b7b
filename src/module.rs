//! Per-module façade over one connection.
//!
//! Modules never touch the dispatch engine directly; they borrow a
//! [`ModuleApi`] which stamps their name onto every registration so
//! [`Connection::drop_module`] can sweep a module's hooks in one call.

use crate::codec::Event;
use crate::connection::Connection;
use crate::dispatch::{HookHandle, HookKind, HookOpts, HookVersion};
use crate::error::Result;

/// Registration and injection surface handed to one module.
pub struct ModuleApi<'a> {
    conn: &'a mut Connection,
    module: String,
}

impl<'a> ModuleApi<'a> {
    pub(crate) fn new(conn: &'a mut Connection, module: &str) -> Self {
        Self { conn, module: module.to_string() }
    }

    /// Owning module name.
    pub fn name(&self) -> &str {
        &self.module
    }

    /// Register a hook owned by this module.
    ///
    /// # Errors
    ///
    /// Same validation as [`Dispatch::hook`](crate::dispatch::Dispatch::hook).
    pub fn hook(
        &mut self,
        name: &str,
        version: HookVersion,
        opts: HookOpts,
        kind: HookKind,
    ) -> Result<HookHandle> {
        self.conn.dispatch_mut().hook(&self.module, name, version, opts, kind)
    }

    /// Register a hook that removes itself after its first invocation.
    ///
    /// # Errors
    ///
    /// Same validation as [`hook`](Self::hook).
    pub fn hook_once(
        &mut self,
        name: &str,
        version: HookVersion,
        opts: HookOpts,
        kind: HookKind,
    ) -> Result<HookHandle> {
        self.conn.dispatch_mut().hook_once(&self.module, name, version, opts, kind)
    }

    /// Remove a hook. Idempotent.
    pub fn unhook(&mut self, handle: HookHandle) {
        self.conn.dispatch_mut().unhook(handle);
    }

    /// Inject a pre-built message towards the server.
    ///
    /// # Errors
    ///
    /// Propagates injection validation failures.
    pub fn to_server(&mut self, message: &[u8]) -> Result<()> {
        self.conn.send_to_server(message)
    }

    /// Serialise and inject a structured message towards the server.
    ///
    /// `version` of `None` uses the latest definition.
    ///
    /// # Errors
    ///
    /// Fails on unmapped names and codec errors.
    pub fn to_server_message(&mut self, name: &str, version: Option<u16>, event: &Event) -> Result<()> {
        self.conn.send_message_to_server(name, version, event)
    }

    /// Inject a pre-built message towards the client.
    ///
    /// # Errors
    ///
    /// Propagates injection validation failures.
    pub fn to_client(&mut self, message: &[u8]) -> Result<()> {
        self.conn.send_to_client(message)
    }

    /// Serialise and inject a structured message towards the client.
    ///
    /// # Errors
    ///
    /// Fails on unmapped names and codec errors.
    pub fn to_client_message(&mut self, name: &str, version: Option<u16>, event: &Event) -> Result<()> {
        self.conn.send_message_to_client(name, version, event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{Catalogue, Codec, Definition};
    use crate::connection::{ClientHandle, ConnectionConfig, UpstreamSink};
    use crate::dispatch::RawOutcome;
    use std::sync::Arc;

    struct NullClient;
    impl ClientHandle for NullClient {
        fn on_connect(&mut self) {}
        fn on_data(&mut self, _: &[u8]) {}
        fn close(&mut self) {}
    }

    struct NullSink;
    impl UpstreamSink for NullSink {
        fn send(&mut self, _: Vec<u8>) -> Result<()> {
            Ok(())
        }
        fn shutdown(&mut self) {}
    }

    fn connection() -> Connection {
        let catalogue = Arc::new(Catalogue::new());
        catalogue.add_opcode("S_CHAT", 0x2001, false).unwrap();
        let codec = Arc::new(Codec::new());
        codec
            .add_definition("S_CHAT", 1, Definition::parse("message string").unwrap(), false)
            .unwrap();
        catalogue.refresh_latest(&codec);
        Connection::new(
            ConnectionConfig::default(),
            catalogue,
            codec,
            Box::new(NullClient),
            Box::new(NullSink),
        )
    }

    fn raw_pass() -> HookKind {
        HookKind::Raw(Box::new(|_, _| Ok(RawOutcome::Pass)))
    }

    #[test]
    fn test_drop_module_sweeps_only_its_hooks() {
        let mut conn = connection();

        conn.module("alpha").hook("S_CHAT", HookVersion::Raw, HookOpts::default(), raw_pass()).unwrap();
        conn.module("alpha").hook("*", HookVersion::Raw, HookOpts::default(), raw_pass()).unwrap();
        conn.module("beta").hook("S_CHAT", HookVersion::Raw, HookOpts::default(), raw_pass()).unwrap();

        assert_eq!(conn.drop_module("alpha"), 2);
        assert_eq!(conn.drop_module("alpha"), 0);
        assert_eq!(conn.drop_module("beta"), 1);
    }

    #[test]
    fn test_unhook_via_module() {
        let mut conn = connection();
        let mut api = conn.module("alpha");
        let handle = api.hook("S_CHAT", HookVersion::Raw, HookOpts::default(), raw_pass()).unwrap();
        api.unhook(handle);
        api.unhook(handle);
        assert_eq!(conn.drop_module("alpha"), 0);
    }
}
