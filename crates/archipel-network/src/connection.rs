//! Connection lifecycle management
//!
//! Owns every live TCP session, keyed by peer id. Each session runs the
//! key exchange first, then a read loop that decrypts frames and publishes
//! them as [`ConnectionEvent::Message`]. At most one session exists per
//! peer id; registering a new one closes the old one.
//!
//! Per peer id the state moves `Disconnected -> Connecting -> Connected ->
//! (Disconnected | Failed)`.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use archipel_core::{decrypt, encrypt, SessionKey};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex, Notify, RwLock};

use crate::config::NodeConfig;
use crate::error::{Error, Result};
use crate::framing::{read_frame, write_frame};
use crate::handshake::perform_handshake;
use crate::shutdown::Shutdown;

/// Identifier a connection is registered under.
///
/// Outbound connections use the caller's id (normally the peer table key);
/// inbound ones use the remote socket address.
pub type PeerId = String;

/// Connection state of a peer id
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Failed,
}

/// Events emitted to the application layer
#[derive(Clone, Debug)]
pub enum ConnectionEvent {
    /// A session completed its handshake
    Connected {
        peer_id: PeerId,
        addr: SocketAddr,
        inbound: bool,
    },
    /// A decrypted application message
    Message { peer_id: PeerId, payload: Vec<u8> },
    /// A session ended
    Disconnected { peer_id: PeerId },
}

/// Timeouts and limits for sessions
#[derive(Clone, Debug)]
pub struct ConnectionSettings {
    pub connect_timeout: Duration,
    pub handshake_timeout: Duration,
    /// Consecutive authentication failures before the session is dropped
    pub max_auth_failures: u32,
    /// Bound on a blocking accept; also bounds shutdown latency
    pub accept_poll: Duration,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self::from(&NodeConfig::default())
    }
}

impl From<&NodeConfig> for ConnectionSettings {
    fn from(config: &NodeConfig) -> Self {
        Self {
            connect_timeout: config.connect_timeout,
            handshake_timeout: config.handshake_timeout,
            max_auth_failures: config.max_auth_failures,
            accept_poll: config.discovery.recv_timeout,
        }
    }
}

struct Connection {
    /// Distinguishes a session from a later one under the same peer id
    id: u64,
    addr: SocketAddr,
    writer: Arc<Mutex<OwnedWriteHalf>>,
    key: SessionKey,
    close: Arc<Notify>,
}

impl Connection {
    async fn close(self) {
        self.close.notify_one();
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
    }
}

struct Inner {
    settings: ConnectionSettings,
    connections: RwLock<HashMap<PeerId, Connection>>,
    /// States of peer ids without a live connection
    states: RwLock<HashMap<PeerId, ConnectionState>>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    next_id: AtomicU64,
    shutdown: Shutdown,
}

/// Manages peer sessions and their lifecycle
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    pub fn new(
        settings: ConnectionSettings,
        events: mpsc::UnboundedSender<ConnectionEvent>,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                settings,
                connections: RwLock::new(HashMap::new()),
                states: RwLock::new(HashMap::new()),
                events,
                next_id: AtomicU64::new(1),
                shutdown,
            }),
        }
    }

    /// Bind the listening socket and spawn the accept loop.
    ///
    /// Returns the bound address (useful when binding port 0).
    pub async fn listen(&self, bind_addr: SocketAddr) -> Result<SocketAddr> {
        let listener = TcpListener::bind(bind_addr)
            .await
            .map_err(|e| Error::Network(format!("Failed to bind {}: {}", bind_addr, e)))?;
        let local_addr = listener.local_addr()?;

        tokio::spawn(accept_loop(self.clone(), listener));
        tracing::info!("Listening for peers on {}", local_addr);
        Ok(local_addr)
    }

    /// Open a session to `addr` and register it under `peer_id`.
    ///
    /// Any existing session for `peer_id` is closed once the new one is
    /// established. On failure nothing is registered and an existing
    /// session is left alone.
    pub async fn connect(&self, peer_id: &str, addr: SocketAddr) -> Result<()> {
        if self.inner.shutdown.is_triggered() {
            return Err(Error::Connection(format!(
                "Not connecting to {}: manager is shut down",
                peer_id
            )));
        }
        if !self.is_connected(peer_id).await {
            self.set_state(peer_id, ConnectionState::Connecting).await;
        }

        match self.open(addr).await {
            Ok((stream, key)) => {
                self.register(peer_id.to_string(), stream, key, false)
                    .await?;
                Ok(())
            }
            Err(e) => {
                tracing::warn!("Connection to {} ({}) failed: {}", peer_id, addr, e);
                if !self.is_connected(peer_id).await {
                    self.set_state(peer_id, ConnectionState::Failed).await;
                }
                Err(e)
            }
        }
    }

    async fn open(&self, addr: SocketAddr) -> Result<(TcpStream, SessionKey)> {
        let settings = &self.inner.settings;
        let mut stream = tokio::time::timeout(settings.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| Error::Connection(format!("Timed out connecting to {}", addr)))?
            .map_err(|e| Error::Connection(format!("Failed to connect to {}: {}", addr, e)))?;
        stream.set_nodelay(true)?;

        let key = perform_handshake(&mut stream, settings.handshake_timeout).await?;
        Ok((stream, key))
    }

    /// Encrypt `payload` and send it to `peer_id`.
    ///
    /// Writes to one session are serialized; frames never interleave.
    pub async fn send(&self, peer_id: &str, payload: &[u8]) -> Result<()> {
        let (writer, key) = {
            let connections = self.inner.connections.read().await;
            let conn = connections
                .get(peer_id)
                .ok_or_else(|| Error::NotConnected(peer_id.to_string()))?;
            (Arc::clone(&conn.writer), conn.key.clone())
        };

        let message = encrypt(key.as_bytes(), payload, None)?;
        let mut writer = writer.lock().await;
        write_frame(&mut *writer, &message).await
    }

    /// Close the session for `peer_id`. Returns `false` if there was none.
    pub async fn disconnect(&self, peer_id: &str) -> bool {
        let removed = self.inner.connections.write().await.remove(peer_id);
        match removed {
            Some(conn) => {
                conn.close().await;
                self.set_state(peer_id, ConnectionState::Disconnected).await;
                self.emit(ConnectionEvent::Disconnected {
                    peer_id: peer_id.to_string(),
                });
                tracing::info!("Disconnected from {}", peer_id);
                true
            }
            None => false,
        }
    }

    /// Stop accepting and close every session
    pub async fn shutdown(&self) {
        self.inner.shutdown.trigger();
        let drained: Vec<(PeerId, Connection)> =
            self.inner.connections.write().await.drain().collect();
        for (peer_id, conn) in drained {
            conn.close().await;
            self.set_state(&peer_id, ConnectionState::Disconnected).await;
            self.emit(ConnectionEvent::Disconnected { peer_id });
        }
    }

    pub async fn state(&self, peer_id: &str) -> ConnectionState {
        if self.is_connected(peer_id).await {
            return ConnectionState::Connected;
        }
        self.inner
            .states
            .read()
            .await
            .get(peer_id)
            .copied()
            .unwrap_or(ConnectionState::Disconnected)
    }

    pub async fn is_connected(&self, peer_id: &str) -> bool {
        self.inner.connections.read().await.contains_key(peer_id)
    }

    /// Peer ids with a live session, and their remote addresses
    pub async fn connected_peers(&self) -> Vec<(PeerId, SocketAddr)> {
        self.inner
            .connections
            .read()
            .await
            .iter()
            .map(|(peer_id, conn)| (peer_id.clone(), conn.addr))
            .collect()
    }

    pub async fn connection_count(&self) -> usize {
        self.inner.connections.read().await.len()
    }

    async fn set_state(&self, peer_id: &str, state: ConnectionState) {
        self.inner
            .states
            .write()
            .await
            .insert(peer_id.to_string(), state);
    }

    fn emit(&self, event: ConnectionEvent) {
        let _ = self.inner.events.send(event);
    }

    /// Install an established session and start its read loop
    async fn register(
        &self,
        peer_id: PeerId,
        stream: TcpStream,
        key: SessionKey,
        inbound: bool,
    ) -> Result<()> {
        let addr = stream.peer_addr()?;
        let (reader, writer) = stream.into_split();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let close = Arc::new(Notify::new());

        let conn = Connection {
            id,
            addr,
            writer: Arc::new(Mutex::new(writer)),
            key: key.clone(),
            close: Arc::clone(&close),
        };

        let previous = {
            let mut connections = self.inner.connections.write().await;
            // Checked under the lock so `shutdown` either drains this session
            // or we see the flag here.
            if self.inner.shutdown.is_triggered() {
                // Both stream halves drop here, closing the socket.
                return Err(Error::Connection(format!(
                    "Dropping session with {}: manager is shut down",
                    peer_id
                )));
            }
            connections.insert(peer_id.clone(), conn)
        };
        self.inner.states.write().await.remove(&peer_id);

        if let Some(previous) = previous {
            tracing::info!(
                "Superseding connection to {} ({} -> {})",
                peer_id,
                previous.addr,
                addr
            );
            previous.close().await;
        }

        tracing::info!(
            "Session established with {} at {} ({})",
            peer_id,
            addr,
            if inbound { "inbound" } else { "outbound" }
        );
        self.emit(ConnectionEvent::Connected {
            peer_id: peer_id.clone(),
            addr,
            inbound,
        });

        tokio::spawn(read_loop(self.clone(), peer_id, id, reader, key, close));
        Ok(())
    }

    /// Called by a read loop on exit. No-op if the session was already
    /// removed or superseded.
    async fn finish(&self, peer_id: &str, id: u64, outcome: ConnectionState) {
        let removed = {
            let mut connections = self.inner.connections.write().await;
            match connections.get(peer_id) {
                Some(conn) if conn.id == id => connections.remove(peer_id),
                _ => None,
            }
        };

        if let Some(conn) = removed {
            conn.close().await;
            self.set_state(peer_id, outcome).await;
            self.emit(ConnectionEvent::Disconnected {
                peer_id: peer_id.to_string(),
            });
            tracing::info!("Connection to {} closed ({:?})", peer_id, outcome);
        }
    }
}

async fn accept_loop(manager: ConnectionManager, listener: TcpListener) {
    let shutdown = manager.inner.shutdown.clone();
    let poll = manager.inner.settings.accept_poll;

    while !shutdown.is_triggered() {
        match tokio::time::timeout(poll, listener.accept()).await {
            Ok(Ok((stream, remote_addr))) => {
                tokio::spawn(handle_inbound(manager.clone(), stream, remote_addr));
            }
            Ok(Err(e)) => {
                tracing::warn!("Accept failed: {}", e);
                shutdown.sleep(Duration::from_millis(100)).await;
            }
            Err(_) => {
                // Timeout; re-check the stop flag.
            }
        }
    }
    tracing::debug!("Accept loop exiting");
}

async fn handle_inbound(manager: ConnectionManager, mut stream: TcpStream, remote_addr: SocketAddr) {
    tracing::debug!("Incoming connection from {}", remote_addr);
    let _ = stream.set_nodelay(true);

    let key = match perform_handshake(&mut stream, manager.inner.settings.handshake_timeout).await
    {
        Ok(key) => key,
        Err(e) => {
            tracing::warn!("Handshake with {} failed: {}", remote_addr, e);
            return;
        }
    };

    if let Err(e) = manager
        .register(remote_addr.to_string(), stream, key, true)
        .await
    {
        tracing::warn!("Failed to register {}: {}", remote_addr, e);
    }
}

async fn read_loop(
    manager: ConnectionManager,
    peer_id: PeerId,
    id: u64,
    mut reader: OwnedReadHalf,
    key: SessionKey,
    close: Arc<Notify>,
) {
    let max_failures = manager.inner.settings.max_auth_failures;
    let mut failures = 0u32;

    let outcome = loop {
        let frame = tokio::select! {
            _ = close.notified() => break ConnectionState::Disconnected,
            frame = read_frame(&mut reader) => frame,
        };

        match frame {
            Ok(Some(message)) => match decrypt(key.as_bytes(), &message, None) {
                Ok(payload) => {
                    failures = 0;
                    manager.emit(ConnectionEvent::Message {
                        peer_id: peer_id.clone(),
                        payload,
                    });
                }
                Err(e) => {
                    failures += 1;
                    tracing::warn!(
                        "Rejected message from {} ({}/{}): {}",
                        peer_id,
                        failures,
                        max_failures,
                        e
                    );
                    if failures >= max_failures {
                        break ConnectionState::Failed;
                    }
                }
            },
            Ok(None) => break ConnectionState::Disconnected,
            Err(e) => {
                tracing::debug!("Read from {} failed: {}", peer_id, e);
                break ConnectionState::Failed;
            }
        }
    };

    drop(reader);
    manager.finish(&peer_id, id, outcome).await;
}
