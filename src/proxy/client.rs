//! Client handle realisations.
//!
//! [`BridgeClient`] forwards to a real downstream socket through a
//! writer channel. [`SyntheticClient`] stands in for a client that does
//! not exist: its key halves are random and its connect signal fires
//! once the handshake completes, which is all a headless module session
//! needs.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::debug;

use crate::connection::ClientHandle;
use crate::crypto::{SecureRandom, KEY_HALF_SIZE};

/// Bridges the client side of a connection to a downstream TCP socket.
///
/// Writes go through an unbounded channel drained by the socket writer
/// task; a failed send means the downstream socket is gone and the
/// handle goes dead.
pub struct BridgeClient {
    tx: Option<mpsc::UnboundedSender<Vec<u8>>>,
}

impl BridgeClient {
    /// Wrap the writer channel of a downstream socket.
    pub fn new(tx: mpsc::UnboundedSender<Vec<u8>>) -> Self {
        Self { tx: Some(tx) }
    }
}

impl ClientHandle for BridgeClient {
    fn on_connect(&mut self) {
        debug!("downstream client session established");
    }

    fn on_data(&mut self, data: &[u8]) {
        if let Some(tx) = &self.tx {
            if tx.send(data.to_vec()).is_err() {
                self.tx = None;
            }
        }
    }

    fn close(&mut self) {
        // Dropping the sender ends the writer task
        self.tx = None;
    }
}

/// Key halves generated for a synthetic client.
pub struct SyntheticKeys {
    /// The two 128-byte halves, in install order
    pub halves: [[u8; KEY_HALF_SIZE]; 2],
}

/// A client that exists only inside the proxy.
///
/// The driver feeds [`SyntheticKeys`] through
/// [`Connection::set_client_key`](crate::connection::Connection::set_client_key)
/// once the magic datagram arrives; the connected flag flips when both
/// sides have exchanged keys. Server data delivered to the handle is
/// discarded (hooks are the consumer in a headless session).
pub struct SyntheticClient {
    connected: Arc<AtomicBool>,
}

impl SyntheticClient {
    /// Create a synthetic client and its random key halves.
    pub fn new() -> (Self, SyntheticKeys) {
        let keys = SyntheticKeys { halves: [SecureRandom::key_half(), SecureRandom::key_half()] };
        (Self { connected: Arc::new(AtomicBool::new(false)) }, keys)
    }

    /// Shared flag that flips on connect and clears on close.
    pub fn connected_flag(&self) -> Arc<AtomicBool> {
        self.connected.clone()
    }
}

impl ClientHandle for SyntheticClient {
    fn on_connect(&mut self) {
        self.connected.store(true, Ordering::SeqCst);
        debug!("synthetic client session established");
    }

    fn on_data(&mut self, _data: &[u8]) {}

    fn close(&mut self) {
        self.connected.store(false, Ordering::SeqCst);
    }
}
