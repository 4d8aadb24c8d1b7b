//! TCP acceptance and socket pumps.
//!
//! Client side: a listener that accepts game clients and bridges each
//! one to the upstream server through a [`Connection`](crate::connection::Connection).
//! The pumps translate between raw socket reads and the synchronous
//! core: handshake datagrams are reassembled to their exact sizes,
//! steady-state bytes flow through per-leg framers.

mod client;
mod server;

pub use client::{BridgeClient, SyntheticClient, SyntheticKeys};
pub use server::ProxyServer;
