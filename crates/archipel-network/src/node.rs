//! Node: wires discovery, the peer table and sessions together

use std::net::SocketAddr;

use archipel_core::NodeIdentity;
use tokio::sync::mpsc;

use crate::config::NodeConfig;
use crate::connection::{
    ConnectionEvent, ConnectionManager, ConnectionSettings, ConnectionState, PeerId,
};
use crate::discovery::{Announcement, BeaconProfile, BeaconTasks, DiscoveryBeacon};
use crate::error::{Error, Result};
use crate::peer_table::{PeerRecord, PeerTable};
use crate::shutdown::Shutdown;

/// A running archipel node.
///
/// Owns one [`PeerTable`], one [`DiscoveryBeacon`] and one
/// [`ConnectionManager`]. Every session is keyed and encrypted by the
/// connection manager before application data flows.
pub struct Node {
    config: NodeConfig,
    identity: NodeIdentity,
    peers: PeerTable,
    connections: ConnectionManager,
    shutdown: Shutdown,
    event_rx: Option<mpsc::UnboundedReceiver<ConnectionEvent>>,
    beacon: Option<BeaconTasks>,
    local_addr: Option<SocketAddr>,
}

impl Node {
    /// Build a node. The configuration is validated here, before any
    /// socket is opened.
    pub fn new(config: NodeConfig, identity: NodeIdentity) -> Result<Self> {
        config.validate()?;

        let shutdown = Shutdown::new();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let connections =
            ConnectionManager::new(ConnectionSettings::from(&config), event_tx, shutdown.clone());

        Ok(Self {
            config,
            identity,
            peers: PeerTable::new(),
            connections,
            shutdown,
            event_rx: Some(event_rx),
            beacon: None,
            local_addr: None,
        })
    }

    /// Start listening for sessions and announcing ourselves.
    ///
    /// The announced TCP port is the one actually bound.
    pub async fn start(&mut self) -> Result<SocketAddr> {
        if self.local_addr.is_some() {
            return Err(Error::Config("node already started".to_string()));
        }

        let local_addr = self.connections.listen(self.config.listen_addr).await?;

        let beacon = DiscoveryBeacon::new(
            self.config.discovery.clone(),
            self.announcement(local_addr.port()),
            self.peers.clone(),
            self.shutdown.clone(),
        );
        self.beacon = Some(beacon.start());
        self.local_addr = Some(local_addr);

        tracing::info!(
            "Node {} ({}) started on {}",
            self.config.name,
            self.identity,
            local_addr
        );
        Ok(local_addr)
    }

    /// What this node announces on the beacon
    fn announcement(&self, tcp_port: u16) -> Announcement {
        match self.config.discovery.profile {
            BeaconProfile::Json => Announcement::new(self.config.name.clone(), tcp_port),
            BeaconProfile::Hello => Announcement::new(self.identity.to_hex(), tcp_port),
        }
    }

    /// Dial a discovered peer, registering the session under its table key
    pub async fn connect_to_peer(&self, key: &str) -> Result<()> {
        let record = self
            .peers
            .get(key)
            .await
            .ok_or_else(|| Error::Connection(format!("Unknown peer: {}", key)))?;
        let addr = SocketAddr::new(record.ip, record.tcp_port);
        self.connections.connect(&record.key, addr).await
    }

    pub async fn send(&self, peer_id: &str, payload: &[u8]) -> Result<()> {
        self.connections.send(peer_id, payload).await
    }

    pub async fn disconnect(&self, peer_id: &str) -> bool {
        self.connections.disconnect(peer_id).await
    }

    /// Copy of the current peer table
    pub async fn peers(&self) -> Vec<PeerRecord> {
        self.peers.snapshot().await
    }

    pub async fn connected_peers(&self) -> Vec<(PeerId, SocketAddr)> {
        self.connections.connected_peers().await
    }

    pub async fn connection_state(&self, peer_id: &str) -> ConnectionState {
        self.connections.state(peer_id).await
    }

    /// Take the session event receiver. Only the first call returns it.
    pub fn take_event_receiver(&mut self) -> Option<mpsc::UnboundedReceiver<ConnectionEvent>> {
        self.event_rx.take()
    }

    pub fn peer_table(&self) -> &PeerTable {
        &self.peers
    }

    pub fn identity(&self) -> &NodeIdentity {
        &self.identity
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Stop every loop and close every session, then wait for the beacon
    /// tasks to exit.
    pub async fn stop(&mut self) {
        self.connections.shutdown().await;
        if let Some(beacon) = self.beacon.take() {
            beacon.join().await;
        }
        tracing::info!("Node {} stopped", self.config.name);
    }
}
