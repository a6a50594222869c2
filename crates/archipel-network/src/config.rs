//! Node and discovery configuration
//!
//! Both structs carry defaults matching the stock deployment and are
//! validated once, before any network activity starts.

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use crate::discovery::BeaconProfile;
use crate::error::{Error, Result};

/// Default multicast group for the JSON beacon profile
pub const DEFAULT_GROUP: Ipv4Addr = Ipv4Addr::new(239, 1, 1, 1);
/// Default multicast port for the JSON beacon profile
pub const DEFAULT_MULTICAST_PORT: u16 = 5000;
/// Multicast group for the `HELLO:` text profile
pub const HELLO_GROUP: Ipv4Addr = Ipv4Addr::new(239, 255, 42, 99);
/// Multicast port for the `HELLO:` text profile
pub const HELLO_MULTICAST_PORT: u16 = 6000;
/// Default TCP port a node listens on
pub const DEFAULT_TCP_PORT: u16 = 6000;

/// Multicast discovery settings
#[derive(Clone, Debug)]
pub struct DiscoveryConfig {
    /// Multicast group announcements are sent to
    pub group: Ipv4Addr,
    /// UDP port of the multicast group
    pub port: u16,
    /// Local interface used to join the group and send (0.0.0.0 = default)
    pub iface: Ipv4Addr,
    /// Delay between two announcements
    pub interval: Duration,
    /// Peers not heard from within this window are evicted
    pub peer_ttl: Duration,
    /// Cadence of the eviction sweep
    pub sweep_interval: Duration,
    /// Upper bound on a blocking receive; also bounds shutdown latency
    pub recv_timeout: Duration,
    /// Announcement wire format
    pub profile: BeaconProfile,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            group: DEFAULT_GROUP,
            port: DEFAULT_MULTICAST_PORT,
            iface: Ipv4Addr::UNSPECIFIED,
            interval: Duration::from_secs(2),
            peer_ttl: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(1),
            recv_timeout: Duration::from_secs(1),
            profile: BeaconProfile::Json,
        }
    }
}

impl DiscoveryConfig {
    /// Settings for the `HELLO:<nodeId>:<tcpPort>` deployment
    pub fn hello_profile() -> Self {
        Self {
            group: HELLO_GROUP,
            port: HELLO_MULTICAST_PORT,
            profile: BeaconProfile::Hello,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !self.group.is_multicast() {
            return Err(Error::Config(format!(
                "{} is not a multicast group address",
                self.group
            )));
        }
        if self.port == 0 {
            return Err(Error::Config("multicast port must be non-zero".to_string()));
        }
        non_zero("beacon interval", self.interval)?;
        non_zero("peer TTL", self.peer_ttl)?;
        non_zero("sweep interval", self.sweep_interval)?;
        non_zero("receive timeout", self.recv_timeout)?;
        Ok(())
    }
}

/// Full node settings
#[derive(Clone, Debug)]
pub struct NodeConfig {
    /// Display name announced to peers (JSON profile only)
    pub name: String,
    /// TCP listen address; port 0 picks an ephemeral port
    pub listen_addr: SocketAddr,
    pub discovery: DiscoveryConfig,
    /// Limit on establishing an outbound TCP connection
    pub connect_timeout: Duration,
    /// Limit on the key exchange once a stream is open
    pub handshake_timeout: Duration,
    /// Consecutive authentication failures tolerated before a connection is dropped
    pub max_auth_failures: u32,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: "archipel-node".to_string(),
            listen_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_TCP_PORT)),
            discovery: DiscoveryConfig::default(),
            connect_timeout: Duration::from_secs(5),
            handshake_timeout: Duration::from_secs(5),
            max_auth_failures: 3,
        }
    }
}

impl NodeConfig {
    pub fn validate(&self) -> Result<()> {
        self.discovery.validate()?;
        non_zero("connect timeout", self.connect_timeout)?;
        non_zero("handshake timeout", self.handshake_timeout)?;
        if self.max_auth_failures == 0 {
            return Err(Error::Config(
                "max_auth_failures must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn non_zero(what: &str, value: Duration) -> Result<()> {
    if value.is_zero() {
        return Err(Error::Config(format!("{} must be greater than zero", what)));
    }
    Ok(())
}
