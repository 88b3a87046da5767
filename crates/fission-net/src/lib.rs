//! Peer-to-peer UDP transport with multicast discovery.
//!
//! Peers find each other by periodically announcing themselves to a
//! multicast group, and exchange typed payloads over unicast with
//! MTU-aware fragmentation and optional selective-acknowledgement
//! reliability.
//!
//! [`Transport`] is the protocol state machine; [`Driver`] runs one on
//! a background thread, polling both sockets and driving the announce
//! tick.

pub mod driver;
pub mod iface;
pub mod peer;
pub mod transport;
pub mod wire;

pub use driver::{Controller, Driver};
pub use peer::Peer;
pub use transport::{Config, Handler, Transport};

use std::time::Duration;

/// A peer which hasn't sent us any packet for this long is presumed gone.
pub const PEER_TIMEOUT: Duration = Duration::from_secs(2);

/// Incomplete reassembly buffers older than this are discarded.
pub const ASSEMBLER_TIMEOUT: Duration = Duration::from_secs(10);

/// Default multicast group for peer discovery.
pub const DEFAULT_GROUP: &str = "239.226.152.162";

/// Default discovery port.
pub const DEFAULT_PORT: u16 = 7447;

/// Default network MTU used to size fragments.
pub const DEFAULT_MTU: u16 = 1500;

/// Default announce cadence.
pub const DEFAULT_ANNOUNCE_INTERVAL: Duration = Duration::from_millis(300);
