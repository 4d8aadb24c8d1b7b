//! Proxy accept loop and per-session socket pumps.
//!
//! One task pair per session: the upstream pump reassembles handshake
//! datagrams and feeds decryptable byte runs into the connection, the
//! downstream pump intercepts the client's key halves and frames its
//! steady-state messages. The connection itself is synchronous behind a
//! mutex; the lock is never held across an await.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::AsyncReadExt;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::codec::{Catalogue, Codec};
use crate::config::ProxyConfig;
use crate::connection::{Connection, ConnectionConfig, HandshakeState, UpstreamSink};
use crate::crypto::KEY_HALF_SIZE;
use crate::error::{Error, Result};
use crate::proto::{Framer, LengthFormat, MessageBuilder};
use crate::proxy::BridgeClient;

const READ_CHUNK: usize = 16 * 1024;

/// Upstream sink backed by the socket writer channel.
struct ChannelSink {
    tx: Option<mpsc::UnboundedSender<Vec<u8>>>,
}

impl UpstreamSink for ChannelSink {
    fn send(&mut self, frame: Vec<u8>) -> Result<()> {
        match &self.tx {
            Some(tx) => tx.send(frame).map_err(|_| Error::ConnectionClosed),
            None => Err(Error::ConnectionClosed),
        }
    }

    fn shutdown(&mut self) {
        // Dropping the sender ends the writer task, which half-closes
        // the socket
        self.tx = None;
    }
}

/// Accepts game clients and proxies each to the upstream server.
pub struct ProxyServer {
    config: ProxyConfig,
    catalogue: Arc<Catalogue>,
    codec: Arc<Codec>,
}

impl ProxyServer {
    /// Create a server over the shared catalogue and codec.
    pub fn new(config: ProxyConfig, catalogue: Arc<Catalogue>, codec: Arc<Codec>) -> Self {
        Self { config, catalogue, codec }
    }

    /// Run the accept loop forever.
    ///
    /// # Errors
    ///
    /// Returns the bind or accept error that stopped the loop.
    pub async fn run(&self) -> Result<()> {
        let listener =
            TcpListener::bind((self.config.listen_addr.as_str(), self.config.listen_port)).await?;
        info!(
            "proxy listening on {}:{}, upstream {}:{}",
            self.config.listen_addr,
            self.config.listen_port,
            self.config.upstream_addr,
            self.config.upstream_port
        );

        loop {
            let (downstream, peer) = listener.accept().await?;
            info!(%peer, "client accepted");

            let config = self.config.clone();
            let catalogue = self.catalogue.clone();
            let codec = self.codec.clone();
            tokio::spawn(async move {
                if let Err(e) = run_session(config, catalogue, codec, downstream).await {
                    warn!(%peer, error = %e, "session ended with error");
                } else {
                    debug!(%peer, "session ended");
                }
            });
        }
    }
}

async fn run_session(
    config: ProxyConfig,
    catalogue: Arc<Catalogue>,
    codec: Arc<Codec>,
    downstream: TcpStream,
) -> Result<()> {
    let upstream =
        TcpStream::connect((config.upstream_addr.as_str(), config.upstream_port)).await?;

    let (up_read, mut up_write) = upstream.into_split();
    let (down_read, mut down_write) = downstream.into_split();

    let (up_tx, mut up_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let (down_tx, mut down_rx) = mpsc::unbounded_channel::<Vec<u8>>();

    // Writer tasks: drain the frame channels onto the sockets
    tokio::spawn(async move {
        use tokio::io::AsyncWriteExt;
        while let Some(frame) = up_rx.recv().await {
            if up_write.write_all(&frame).await.is_err() {
                break;
            }
        }
    });
    tokio::spawn(async move {
        use tokio::io::AsyncWriteExt;
        while let Some(frame) = down_rx.recv().await {
            if down_write.write_all(&frame).await.is_err() {
                break;
            }
        }
    });

    let format = config.session_info().platform.length_format();
    let conn = Connection::new(
        ConnectionConfig {
            info: config.session_info(),
            close_on_bad_handshake: config.close_on_bad_handshake,
            integrity_seed: config.integrity_seed.clone(),
        },
        catalogue,
        codec,
        Box::new(BridgeClient::new(down_tx)),
        Box::new(ChannelSink { tx: Some(up_tx) }),
    );
    let conn = Arc::new(Mutex::new(conn));

    let result = tokio::select! {
        r = pump_upstream(up_read, conn.clone()) => r,
        r = pump_downstream(down_read, conn.clone(), format) => r,
    };

    conn.lock().close();
    result
}

/// Feed upstream socket bytes into the connection.
///
/// Handshake datagrams have fixed sizes and TCP may merge or split
/// them, so they are reassembled here; once established the connection
/// owns framing and any byte run will do.
async fn pump_upstream(mut read: OwnedReadHalf, conn: Arc<Mutex<Connection>>) -> Result<()> {
    let mut stash: Vec<u8> = Vec::new();
    let mut buf = vec![0u8; READ_CHUNK];

    loop {
        let n = read.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        stash.extend_from_slice(&buf[..n]);

        loop {
            // Lock is taken per datagram, never across an await
            let state = conn.lock().state();
            let need = match state {
                HandshakeState::Closed => return Ok(()),
                HandshakeState::AwaitMagic => 4,
                HandshakeState::AwaitServerKey0 | HandshakeState::AwaitServerKey1 => KEY_HALF_SIZE,
                HandshakeState::Established => {
                    let chunk = std::mem::take(&mut stash);
                    conn.lock().recv_upstream(&chunk)?;
                    break;
                }
            };

            if stash.len() < need {
                break;
            }
            let datagram: Vec<u8> = stash.drain(..need).collect();
            conn.lock().recv_upstream(&datagram)?;
        }
    }
}

/// Feed downstream socket bytes into the connection.
///
/// During the handshake the client sends its two key halves; afterwards
/// its messages are framed, renormalised to canonical form and run
/// through the outbound pipeline.
async fn pump_downstream(
    mut read: OwnedReadHalf,
    conn: Arc<Mutex<Connection>>,
    format: LengthFormat,
) -> Result<()> {
    let mut framer = Framer::new(format);
    let builder = MessageBuilder::new(format);
    let mut stash: Vec<u8> = Vec::new();
    let mut buf = vec![0u8; READ_CHUNK];

    loop {
        let n = read.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        stash.extend_from_slice(&buf[..n]);

        loop {
            let state = conn.lock().state();
            match state {
                HandshakeState::Closed => return Ok(()),
                HandshakeState::AwaitMagic => {
                    // Nothing legal to consume before the server magic
                    break;
                }
                HandshakeState::AwaitServerKey0 | HandshakeState::AwaitServerKey1 => {
                    if stash.len() < KEY_HALF_SIZE {
                        break;
                    }
                    let key: Vec<u8> = stash.drain(..KEY_HALF_SIZE).collect();
                    if let Err(e) = conn.lock().set_client_key(&key) {
                        warn!(error = %e, "client key half rejected");
                    }
                }
                HandshakeState::Established => {
                    if !stash.is_empty() {
                        framer.write(&stash);
                        stash.clear();
                    }
                    while let Some(frame) = framer.read()? {
                        let mut message = frame.to_vec();
                        builder.normalize(&mut message)?;
                        conn.lock().recv_client(&message)?;
                    }
                    break;
                }
            }
        }
    }
}
