//! Archipel Network - LAN discovery and encrypted peer sessions
//!
//! This crate provides:
//! - UDP multicast discovery beacon with two wire profiles
//! - TTL-based peer table fed by the beacon
//! - TCP session management with an ephemeral key exchange per connection
//! - Length-delimited encrypted framing
//! - The node composition root tying these together

pub mod config;
pub mod connection;
pub mod discovery;
pub mod error;
pub mod framing;
pub mod handshake;
pub mod node;
pub mod peer_table;
pub mod shutdown;

pub use config::{DiscoveryConfig, NodeConfig};
pub use connection::{
    ConnectionEvent, ConnectionManager, ConnectionSettings, ConnectionState, PeerId,
};
pub use discovery::{Announcement, BeaconProfile, DiscoveryBeacon};
pub use error::{Error, Result};
pub use node::Node;
pub use peer_table::{PeerRecord, PeerTable};
pub use shutdown::Shutdown;
