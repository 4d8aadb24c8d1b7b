//! # Interpose
//!
//! An intercepting TCP proxy core for a stream-ciphered game protocol.
//! The proxy sits transparently between a game client and its server:
//! it replays the proprietary handshake on both legs, keeps the pair of
//! keystreams that encrypt each direction, reassembles length-prefixed
//! messages, and runs every message through a priority-ordered pipeline
//! of user hooks that may inspect, modify, silence or inject traffic.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │  Modules (hooks, injection via the per-module façade)   │
//! ├─────────────────────────────────────────────────────────┤
//! │  Dispatch (ordered hook pipeline, event cache, flags)   │
//! ├─────────────────────────────────────────────────────────┤
//! │  Connection (handshake state machine, send paths)       │
//! ├─────────────────────────────────────────────────────────┤
//! │  Proto (framing, platform builder) · Codec (catalogue,  │
//! │  definitions) · Crypto (keystreams, integrity tags)     │
//! ├─────────────────────────────────────────────────────────┤
//! │  Proxy (tokio accept loop, socket pumps)                │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Design Goals
//!
//! 1. **Transparency**: with no hooks registered, traffic round-trips
//!    bit-identically after the handshake
//! 2. **Determinism**: hooks run in ascending order, ties preserve
//!    registration order, wildcard hooks win ties
//! 3. **Containment**: a misbehaving hook is logged and skipped, never
//!    fatal to the session

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod codec;
pub mod config;
pub mod connection;
pub mod crypto;
pub mod dispatch;
pub mod error;
pub mod module;
pub mod proto;
pub mod proxy;

pub use config::{ProxyConfig, ProxyConfigFile};
pub use connection::{
    ClientHandle, Connection, ConnectionConfig, HandshakeState, Platform, SessionInfo,
    UpstreamSink,
};
pub use error::{Error, Result};
pub use module::ModuleApi;
