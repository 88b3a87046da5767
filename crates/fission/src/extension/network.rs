//! Bridges the mesh transport to the event bus.
//!
//! Outbound: NETWORK-scope emissions reach the transport through the
//! driver controller installed on the bus. Inbound: transport events
//! surface as [`PeerJoined`]/[`PeerLeft`] emissions, and payloads are
//! decoded and re-emitted as [`FromNetwork`](crate::bus::FromNetwork)
//! events keyed by their wire hash.

use std::sync::Arc;

use fission_net::peer::Peer;
use fission_net::transport::Handler;
use fission_net::Driver;

use crate::bus::{Bus, PeerInfo, PeerJoined, PeerLeft};
use crate::plant;

/// The transport's window into the bus. Runs on the driver thread.
struct BusHandler {
    bus: Bus,
}

impl Handler for BusHandler {
    fn joined(&mut self, peer: &Arc<Peer>) {
        log::info!(target: "net", "Peer {}@{} joined the mesh", peer.name, peer.addr);
        self.bus.emit(PeerJoined {
            name: peer.name.clone(),
            addr: peer.addr,
        });
    }

    fn left(&mut self, peer: &Arc<Peer>) {
        log::info!(target: "net", "Peer {}@{} left the mesh", peer.name, peer.addr);
        self.bus.emit(PeerLeft {
            name: peer.name.clone(),
            addr: peer.addr,
        });
    }

    fn received(&mut self, peer: &Arc<Peer>, hash: u128, payload: Vec<u8>) {
        let info = PeerInfo {
            name: peer.name.clone(),
            addr: peer.addr,
        };
        self.bus.deliver(info, hash, &payload);
    }
}

/// The network extension: owns the transport driver.
pub(crate) struct NetworkBridge {
    driver: Driver,
}

impl NetworkBridge {
    pub(crate) fn start(
        config: &fission_net::Config,
        bus: &Bus,
    ) -> Result<Self, plant::Error> {
        let driver = Driver::spawn(config, BusHandler { bus: bus.clone() })?;
        bus.set_network(driver.controller());

        log::info!(
            target: "net",
            "Mesh transport up on {} (group {}:{})",
            driver.local_addr(),
            config.group,
            config.port
        );
        Ok(Self { driver })
    }

    pub(crate) fn stop(self) {
        self.driver.controller().shutdown().ok();
        self.driver.join().ok();
    }
}
