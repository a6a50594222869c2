//! LAN discovery beacon
//!
//! Announces this node over UDP multicast and feeds announcements from
//! other nodes into the [`PeerTable`]. Datagrams are unreliable and
//! unordered, so correctness never depends on any single one arriving.
//!
//! Three background tasks are spawned by [`DiscoveryBeacon::start`]:
//!
//! - **Sender**: sends an [`Announcement`] every `interval`.
//! - **Listener**: joins the group and upserts every valid announcement.
//! - **Sweeper**: evicts peers older than `peer_ttl` at its own cadence.
//!
//! All three observe the shared [`Shutdown`] flag within one receive
//! timeout or sleep tick.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;

use crate::config::DiscoveryConfig;
use crate::error::{Error, Result};
use crate::peer_table::PeerTable;
use crate::shutdown::Shutdown;

/// Maximum size of a single UDP announcement datagram.
const MAX_DATAGRAM_SIZE: usize = 4096;

/// Prefix of the text announcement profile.
const HELLO_PREFIX: &str = "HELLO";

/// How long a bounded `once` run keeps listening after starting.
const ONCE_LISTEN_WINDOW: Duration = Duration::from_secs(1);

/// Announcement wire format. The two profiles do not interoperate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BeaconProfile {
    /// `{"name": "...", "tcp_port": 6000}`
    Json,
    /// `HELLO:<nodeId>:<tcpPort>`
    Hello,
}

impl fmt::Display for BeaconProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Json => write!(f, "json"),
            Self::Hello => write!(f, "hello"),
        }
    }
}

impl FromStr for BeaconProfile {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "hello" => Ok(Self::Hello),
            other => Err(Error::Config(format!("unknown beacon profile: {}", other))),
        }
    }
}

/// Presence announcement carried by one datagram
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Announcement {
    /// Display name (JSON profile) or hex node id (Hello profile)
    pub name: String,
    /// TCP port the announcing node accepts connections on
    #[serde(alias = "tcpPort")]
    pub tcp_port: u16,
}

impl Announcement {
    pub fn new(name: impl Into<String>, tcp_port: u16) -> Self {
        Self {
            name: name.into(),
            tcp_port,
        }
    }

    /// Encode for the wire
    pub fn encode(&self, profile: BeaconProfile) -> Result<Vec<u8>> {
        match profile {
            BeaconProfile::Json => serde_json::to_vec(self)
                .map_err(|e| Error::Protocol(format!("Failed to encode announcement: {}", e))),
            BeaconProfile::Hello => {
                Ok(format!("{}:{}:{}", HELLO_PREFIX, self.name, self.tcp_port).into_bytes())
            }
        }
    }

    /// Decode an untrusted datagram.
    ///
    /// Anything that is not a well-formed announcement with a port in
    /// 1..=65535 is `MalformedInput`.
    pub fn decode(profile: BeaconProfile, data: &[u8]) -> Result<Self> {
        let announcement = match profile {
            BeaconProfile::Json => serde_json::from_slice::<Announcement>(data)
                .map_err(|e| Error::MalformedInput(e.to_string()))?,
            BeaconProfile::Hello => decode_hello(data)?,
        };

        if announcement.tcp_port == 0 {
            return Err(Error::MalformedInput("tcp port must be non-zero".to_string()));
        }
        Ok(announcement)
    }
}

fn decode_hello(data: &[u8]) -> Result<Announcement> {
    let text = std::str::from_utf8(data)
        .map_err(|_| Error::MalformedInput("announcement is not UTF-8".to_string()))?;

    let mut parts = text.trim_end().split(':');
    match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(HELLO_PREFIX), Some(node_id), Some(port), None) if !node_id.is_empty() => {
            let tcp_port = port
                .parse::<u16>()
                .map_err(|_| Error::MalformedInput(format!("invalid tcp port: {:?}", port)))?;
            Ok(Announcement::new(node_id, tcp_port))
        }
        _ => Err(Error::MalformedInput(
            "expected HELLO:<nodeId>:<tcpPort>".to_string(),
        )),
    }
}

/// Handles of the three beacon tasks
pub struct BeaconTasks {
    sender: JoinHandle<()>,
    listener: JoinHandle<()>,
    sweeper: JoinHandle<()>,
}

impl BeaconTasks {
    /// Wait for every loop to reach its exit point
    pub async fn join(self) {
        for (name, handle) in [
            ("sender", self.sender),
            ("listener", self.listener),
            ("sweeper", self.sweeper),
        ] {
            if let Err(e) = handle.await {
                tracing::warn!("Beacon {} task ended abnormally: {}", name, e);
            }
        }
    }
}

/// Multicast discovery service
pub struct DiscoveryBeacon {
    config: DiscoveryConfig,
    announcement: Announcement,
    peers: PeerTable,
    shutdown: Shutdown,
}

impl DiscoveryBeacon {
    /// Create a beacon announcing `announcement` and feeding `peers`.
    ///
    /// Nothing is bound until [`start`](DiscoveryBeacon::start) is called.
    pub fn new(
        config: DiscoveryConfig,
        announcement: Announcement,
        peers: PeerTable,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            config,
            announcement,
            peers,
            shutdown,
        }
    }

    pub fn peers(&self) -> &PeerTable {
        &self.peers
    }

    pub fn config(&self) -> &DiscoveryConfig {
        &self.config
    }

    /// Spawn the sender, listener and sweeper tasks.
    ///
    /// Socket failures are reported by the loop that hits them; the other
    /// loops keep running.
    pub fn start(&self) -> BeaconTasks {
        let sender = tokio::spawn(send_loop(
            self.config.clone(),
            self.announcement.clone(),
            self.shutdown.clone(),
        ));

        // In the Hello profile the name is our node id, which is unique.
        let own_id = match self.config.profile {
            BeaconProfile::Hello => Some(self.announcement.name.clone()),
            BeaconProfile::Json => None,
        };
        let listener = tokio::spawn(listen_loop(
            self.config.clone(),
            self.peers.clone(),
            own_id,
            self.shutdown.clone(),
        ));

        let sweeper = tokio::spawn(sweep_loop(
            self.peers.clone(),
            self.config.peer_ttl,
            self.config.sweep_interval,
            self.shutdown.clone(),
        ));

        tracing::info!(
            "Discovery started (multicast {}:{}, profile {})",
            self.config.group,
            self.config.port,
            self.config.profile
        );

        BeaconTasks {
            sender,
            listener,
            sweeper,
        }
    }

    /// Signal every loop to stop
    pub fn stop(&self) {
        self.shutdown.trigger();
    }

    /// Run for a bounded time, then stop and drain.
    ///
    /// `once` sends a single round and listens briefly; otherwise `duration`
    /// bounds the run, and with neither the beacon runs until stopped
    /// elsewhere.
    pub async fn run_for(&self, once: bool, duration: Option<Duration>) {
        let tasks = self.start();

        let window = if once {
            Some(ONCE_LISTEN_WINDOW)
        } else {
            duration
        };
        match window {
            Some(window) => {
                self.shutdown.sleep(window).await;
            }
            None => {
                while self.shutdown.sleep(Duration::from_secs(3600)).await {}
            }
        }

        self.stop();
        tasks.join().await;
        tracing::info!("Discovery stopped");
    }
}

fn sender_socket(config: &DiscoveryConfig) -> std::io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_multicast_ttl_v4(1)?;
    socket.set_multicast_loop_v4(true)?;
    if !config.iface.is_unspecified() {
        socket.set_multicast_if_v4(&config.iface)?;
    }
    socket.bind(&SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)).into())?;
    socket.set_nonblocking(true)?;
    UdpSocket::from_std(socket.into())
}

fn listener_socket(config: &DiscoveryConfig) -> std::io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    // Several nodes on one host share the multicast port.
    socket.set_reuse_address(true)?;
    #[cfg(all(unix, not(any(target_os = "solaris", target_os = "illumos"))))]
    socket.set_reuse_port(true)?;
    socket.bind(&SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.port)).into())?;
    socket.join_multicast_v4(&config.group, &config.iface)?;
    socket.set_nonblocking(true)?;
    UdpSocket::from_std(socket.into())
}

/// Background loop that sends announcements at a fixed interval.
async fn send_loop(config: DiscoveryConfig, announcement: Announcement, shutdown: Shutdown) {
    let socket = match sender_socket(&config) {
        Ok(socket) => socket,
        Err(e) => {
            tracing::error!("Beacon sender: failed to set up socket: {}", e);
            return;
        }
    };

    let payload = match announcement.encode(config.profile) {
        Ok(payload) if payload.len() <= MAX_DATAGRAM_SIZE => payload,
        Ok(payload) => {
            tracing::error!(
                "Beacon sender: announcement exceeds max datagram size ({} > {})",
                payload.len(),
                MAX_DATAGRAM_SIZE
            );
            return;
        }
        Err(e) => {
            tracing::error!("Beacon sender: {}", e);
            return;
        }
    };

    let destination = SocketAddr::V4(SocketAddrV4::new(config.group, config.port));
    tracing::debug!("Beacon sender started, payload {} bytes", payload.len());

    announce(&socket, destination, &payload, config.interval, &shutdown).await;
    tracing::debug!("Beacon sender exiting");
}

/// Send `payload` to `destination` every `interval` until stopped.
async fn announce(
    socket: &UdpSocket,
    destination: SocketAddr,
    payload: &[u8],
    interval: Duration,
    shutdown: &Shutdown,
) {
    while !shutdown.is_triggered() {
        match socket.send_to(payload, destination).await {
            Ok(_) => tracing::trace!("Beacon: sent announcement to {}", destination),
            // Transient; retried on the next tick.
            Err(e) => tracing::warn!("Beacon: failed to send announcement: {}", e),
        }

        if !shutdown.sleep(interval).await {
            break;
        }
    }
}

/// Background loop that receives announcements and updates the table.
async fn listen_loop(
    config: DiscoveryConfig,
    peers: PeerTable,
    own_id: Option<String>,
    shutdown: Shutdown,
) {
    let socket = match listener_socket(&config) {
        Ok(socket) => socket,
        Err(e) => {
            tracing::error!(
                "Beacon listener: failed to bind/join {}:{}: {}",
                config.group,
                config.port,
                e
            );
            return;
        }
    };

    tracing::debug!(
        "Beacon listener started on {}:{}",
        config.group,
        config.port
    );

    receive_announcements(
        &socket,
        &peers,
        config.profile,
        own_id.as_deref(),
        config.recv_timeout,
        &shutdown,
    )
    .await;

    let _ = socket.leave_multicast_v4(config.group, config.iface);
    tracing::debug!("Beacon listener exiting");
}

/// Feed every datagram received on `socket` into the table until stopped.
///
/// Each receive is bounded by `recv_timeout`, so a stop is observed within
/// one timeout. Bad datagrams are dropped here and never propagate.
async fn receive_announcements(
    socket: &UdpSocket,
    peers: &PeerTable,
    profile: BeaconProfile,
    own_id: Option<&str>,
    recv_timeout: Duration,
    shutdown: &Shutdown,
) {
    let mut buf = [0u8; MAX_DATAGRAM_SIZE];

    while !shutdown.is_triggered() {
        let received = tokio::time::timeout(recv_timeout, socket.recv_from(&mut buf)).await;

        match received {
            Ok(Ok((len, src_addr))) => {
                if let Err(e) =
                    handle_datagram(peers, profile, own_id, &buf[..len], src_addr).await
                {
                    tracing::debug!("Beacon: dropped datagram from {}: {}", src_addr, e);
                }
            }
            Ok(Err(e)) => {
                tracing::warn!("Beacon: recv error: {}", e);
            }
            Err(_) => {
                // Timeout; re-check the stop flag.
            }
        }
    }
}

/// Validate one datagram and record the sender.
///
/// Returns `Ok(true)` for a newly discovered peer, `Ok(false)` for a
/// refresh or an ignored self-announcement, and `MalformedInput` when the
/// datagram is not an announcement. The table is untouched on error.
pub(crate) async fn handle_datagram(
    peers: &PeerTable,
    profile: BeaconProfile,
    own_id: Option<&str>,
    data: &[u8],
    src_addr: SocketAddr,
) -> Result<bool> {
    let announcement = Announcement::decode(profile, data)?;

    if own_id == Some(announcement.name.as_str()) {
        return Ok(false);
    }

    let ip: IpAddr = src_addr.ip();
    let is_new = peers
        .add_or_update(ip, &announcement.name, announcement.tcp_port)
        .await;

    if is_new {
        tracing::info!(
            "Beacon: discovered {} at {}:{}",
            announcement.name,
            ip,
            announcement.tcp_port
        );
    } else {
        tracing::trace!(
            "Beacon: refreshed {} at {}:{}",
            announcement.name,
            ip,
            announcement.tcp_port
        );
    }
    Ok(is_new)
}

/// Background loop evicting stale peers at a fixed cadence.
async fn sweep_loop(peers: PeerTable, ttl: Duration, every: Duration, shutdown: Shutdown) {
    while shutdown.sleep(every).await {
        for peer in peers.remove_stale(ttl).await {
            tracing::info!(
                "Beacon: peer {} ({}) expired (no announcement for {:?})",
                peer.key,
                peer.display_name,
                ttl
            );
        }
    }
    tracing::debug!("Beacon sweeper exiting");
}
