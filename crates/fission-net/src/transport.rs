//! The mesh protocol state machine.
//!
//! A [`Transport`] owns two sockets: a unicast socket bound to an
//! ephemeral port, which all traffic is sent from, and a multicast
//! socket joined to the discovery group on every multicast-capable
//! interface. It is driven from outside by [`Transport::process`]
//! (whenever a socket is readable) and [`Transport::announce`] (on the
//! announce tick, which also drives liveness and retransmission).

use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use mio::net::UdpSocket;
use serde::{Deserialize, Serialize};
use socket2::{Domain, Protocol, Socket, Type};
use thiserror::Error;

use crate::iface;
use crate::peer::{AssemblerVerdict, Peer, PeerTable};
use crate::wire::{AckBits, AckHeader, DataHeader, Decode, Encode, Packet};
use crate::{
    ASSEMBLER_TIMEOUT, DEFAULT_ANNOUNCE_INTERVAL, DEFAULT_GROUP, DEFAULT_MTU, DEFAULT_PORT,
    PEER_TIMEOUT,
};

/// Size of an IPv6 header; IPv4 headers are 20-60 bytes, so assuming
/// 40 in all cases is safe enough.
const IP_HEADER: usize = 40;
/// Size of a UDP header.
const UDP_HEADER: usize = 8;

/// Transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Name this peer announces itself under. Names need not be unique.
    pub name: String,
    /// Multicast group address used for discovery.
    pub group: String,
    /// Discovery port.
    pub port: u16,
    /// Network MTU used to size payload fragments.
    pub mtu: u16,
    /// Cadence of the announce tick.
    pub announce_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            name: String::new(),
            group: DEFAULT_GROUP.to_owned(),
            port: DEFAULT_PORT,
            mtu: DEFAULT_MTU,
            announce_interval: DEFAULT_ANNOUNCE_INTERVAL,
        }
    }
}

/// A transport error.
#[derive(Error, Debug)]
pub enum Error {
    /// The configured group didn't parse or isn't a multicast address.
    #[error("invalid multicast group address '{0}'")]
    InvalidGroup(String),
    /// The configured MTU can't fit a data header.
    #[error("network mtu {0} is too small to carry any payload")]
    MtuTooSmall(u16),
    /// The payload needs more fragments than a `u16` can number.
    #[error("payload of {0} bytes exceeds the maximum transmission size")]
    PayloadTooLarge(usize),
    /// An I/O error.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

/// Receives transport events. Callbacks run on the thread driving the
/// transport.
pub trait Handler: Send {
    /// A new peer was registered, via its ANNOUNCE or an explicit connect.
    fn joined(&mut self, peer: &Arc<Peer>);
    /// A peer left or timed out.
    fn left(&mut self, peer: &Arc<Peer>);
    /// A complete payload arrived from a peer.
    fn received(&mut self, peer: &Arc<Peer>, hash: u128, payload: Vec<u8>);
}

/// Outbound DATA drop hook, for exercising the reliability layer under
/// packet loss. Returns `true` to drop the fragment.
pub type DropOutbound = Box<dyn FnMut(&DataHeader) -> bool + Send>;

/// State shared under the peer-index lock.
///
/// The send queue lives under the same lock as the peer indices: every
/// path that touches it (send, retransmission, ACK, NACK) holds the
/// lock.
#[derive(Default)]
struct State {
    peers: PeerTable,
    send_queue: HashMap<u32, SendQueueEntry>,
    next_packet_id: u32,
}

/// A reliable transmission awaiting acknowledgement.
struct SendQueueEntry {
    header: DataHeader,
    payload: Vec<u8>,
    targets: Vec<SendTarget>,
}

/// Per-peer progress of a reliable transmission.
struct SendTarget {
    peer: Weak<Peer>,
    last_send: Instant,
    acked: AckBits,
}

pub struct Transport {
    unicast: UdpSocket,
    multicast: UdpSocket,
    multicast_target: SocketAddr,
    local_addr: SocketAddr,
    local_ips: Vec<IpAddr>,
    announce_packet: Vec<u8>,
    packet_data_mtu: usize,
    state: Mutex<State>,
    drop_outbound: Mutex<Option<DropOutbound>>,
}

impl Transport {
    /// Open and bind both sockets and join the discovery group.
    pub fn bind(config: &Config) -> Result<Self, Error> {
        let group: IpAddr = config
            .group
            .parse()
            .map_err(|_| Error::InvalidGroup(config.group.clone()))?;
        if !group.is_multicast() {
            return Err(Error::InvalidGroup(config.group.clone()));
        }
        let packet_data_mtu = (config.mtu as usize)
            .checked_sub(DataHeader::SIZE + IP_HEADER + UDP_HEADER)
            .filter(|mtu| *mtu > 0)
            .ok_or(Error::MtuTooSmall(config.mtu))?;

        let multicast_target = SocketAddr::new(group, config.port);
        let unicast = Self::open_unicast(&multicast_target)?;
        let multicast = Self::open_multicast(&multicast_target)?;
        let local_addr = unicast.local_addr()?;

        let mut local_ips = vec![
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            IpAddr::V6(Ipv6Addr::LOCALHOST),
        ];
        for ifa in get_if_addrs::get_if_addrs().unwrap_or_default() {
            local_ips.push(ifa.ip());
        }

        Ok(Self {
            unicast,
            multicast,
            multicast_target,
            local_addr,
            local_ips,
            announce_packet: Packet::Announce {
                name: config.name.clone(),
            }
            .encode_to_vec(),
            packet_data_mtu,
            state: Mutex::new(State::default()),
            drop_outbound: Mutex::new(None),
        })
    }

    /// The unicast socket bound to an ephemeral port on ANY. All
    /// outbound traffic originates here, so peers learn this address.
    fn open_unicast(multicast_target: &SocketAddr) -> Result<UdpSocket, Error> {
        let any: SocketAddr = match multicast_target {
            SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
            SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
        };
        let socket = Socket::new(Domain::for_address(any), Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_nonblocking(true)?;
        socket.bind(&any.into())?;

        Ok(UdpSocket::from_std(socket.into()))
    }

    /// The multicast socket. Rather than binding the group address
    /// directly we bind ANY on the discovery port, so traffic isn't
    /// filtered when multiple groups share the port.
    fn open_multicast(multicast_target: &SocketAddr) -> Result<UdpSocket, Error> {
        let any: SocketAddr = match multicast_target {
            SocketAddr::V4(v4) => (Ipv4Addr::UNSPECIFIED, v4.port()).into(),
            SocketAddr::V6(v6) => (Ipv6Addr::UNSPECIFIED, v6.port()).into(),
        };
        let socket = Socket::new(Domain::for_address(any), Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_nonblocking(true)?;
        // More than one process may bind the discovery port.
        socket.set_reuse_address(true)?;
        #[cfg(unix)]
        socket.set_reuse_port(true)?;
        socket.bind(&any.into())?;

        match multicast_target.ip() {
            IpAddr::V4(group) => iface::join_multicast_v4(&socket, &group)?,
            IpAddr::V6(group) => iface::join_multicast_v6(&socket, &group)?,
        }

        Ok(UdpSocket::from_std(socket.into()))
    }

    /// The local unicast address. The IP is unspecified since we bind ANY;
    /// the port identifies this transport on the local network.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Number of currently known peers.
    pub fn peer_count(&self) -> usize {
        self.state.lock().unwrap().peers.len()
    }

    /// Number of reliable transmissions still awaiting acknowledgement.
    pub fn pending_sends(&self) -> usize {
        self.state.lock().unwrap().send_queue.len()
    }

    /// Install an outbound DATA drop hook. Test instrumentation.
    pub fn set_drop_outbound(&self, f: Option<DropOutbound>) {
        *self.drop_outbound.lock().unwrap() = f;
    }

    pub(crate) fn sockets_mut(&mut self) -> (&mut UdpSocket, &mut UdpSocket) {
        (&mut self.unicast, &mut self.multicast)
    }

    /// Register a peer without waiting for its multicast ANNOUNCE, and
    /// send it a directed ANNOUNCE so it registers us in turn.
    pub fn connect(&self, name: &str, addr: SocketAddr, handler: &mut dyn Handler) {
        let peer = {
            let mut state = self.state.lock().unwrap();
            if state.peers.get(&addr).is_some() {
                return;
            }
            let peer = Arc::new(Peer::new(name.to_owned(), addr));
            state.peers.insert(peer.clone());
            peer
        };
        log::debug!(target: "net", "Connecting to {name}@{addr}");

        self.send_datagram(&self.announce_packet, addr, None);
        handler.joined(&peer);
    }

    /// Drain all readable datagrams from both sockets.
    pub fn process(&self, handler: &mut dyn Handler) {
        for socket in [&self.multicast, &self.unicast] {
            let mut buf = [0u8; 65536];
            loop {
                match socket.recv_from(&mut buf) {
                    Ok((len, from)) => self.process_datagram(from, &buf[..len], handler),
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) => {
                        log::warn!(target: "net", "Error reading socket: {e}");
                        break;
                    }
                }
            }
        }
    }

    fn process_datagram(&self, from: SocketAddr, datagram: &[u8], handler: &mut dyn Handler) {
        let packet = match Packet::decode_datagram(datagram) {
            Ok(packet) => packet,
            Err(e) => {
                // Not ours, or truncated. The reliability layer recovers
                // anything important.
                log::trace!(target: "net", "Dropping datagram from {from}: {e}");
                return;
            }
        };

        match packet {
            Packet::Announce { name } => self.peer_announced(from, name, handler),
            Packet::Leave => {
                let peer = {
                    let mut state = self.state.lock().unwrap();
                    let Some(peer) = state.peers.get(&from).cloned() else {
                        return;
                    };
                    state.peers.remove(&peer);
                    peer
                };
                log::debug!(target: "net", "Peer {}@{from} left", peer.name);
                handler.left(&peer);
            }
            Packet::Data { header, payload } => self.data_received(from, header, payload, handler),
            Packet::Ack(ack) => self.ack_received(from, ack),
            Packet::Nack(nack) => self.nack_received(from, nack),
        }
    }

    fn peer_announced(&self, from: SocketAddr, name: String, handler: &mut dyn Handler) {
        // Our own multicast announcements loop back to us.
        if self.is_self(&from) {
            return;
        }
        let peer = {
            let mut state = self.state.lock().unwrap();
            if let Some(peer) = state.peers.get(&from) {
                peer.refresh();
                return;
            }
            let peer = Arc::new(Peer::new(name, from));
            state.peers.insert(peer.clone());
            peer
        };
        log::debug!(target: "net", "Peer {}@{from} announced itself", peer.name);

        // Say hi back, directed, so they learn us without waiting for
        // our next multicast announce.
        self.send_datagram(&self.announce_packet, from, None);
        handler.joined(&peer);
    }

    fn is_self(&self, addr: &SocketAddr) -> bool {
        addr.port() == self.local_addr.port()
            && (addr.ip().is_unspecified() || self.local_ips.contains(&addr.ip()))
    }

    fn data_received(
        &self,
        from: SocketAddr,
        header: DataHeader,
        payload: Vec<u8>,
        handler: &mut dyn Handler,
    ) {
        if header.packet_no >= header.packet_count {
            return;
        }
        // Data from someone we haven't met is ignored.
        let Some(peer) = self.state.lock().unwrap().peers.get(&from).cloned() else {
            return;
        };
        peer.refresh();

        if header.packet_count == 1 {
            if header.reliable {
                let mut bits = AckBits::empty(1);
                bits.set(0);
                self.send_ack(false, &header, bits, peer.addr);
            }
            handler.received(&peer, header.hash, payload);
            return;
        }

        let assembled = peer.with_assembler(header.packet_id, |assembler| {
            // A held fragment index at or past this transmission's count
            // means the buffer holds remnants of a dead transmission.
            // NACK what we thought we had and start over.
            if assembler.highest().is_some_and(|hi| hi >= header.packet_count) {
                if header.reliable {
                    let mut bits = AckBits::empty(header.packet_count);
                    for no in assembler.fragments.keys() {
                        if *no < header.packet_count {
                            bits.set(*no);
                        }
                    }
                    bits.unset(header.packet_no);
                    self.send_ack(true, &header, bits, peer.addr);
                }
                assembler.fragments.clear();
                assembler.started = Instant::now();
            }

            assembler.fragments.insert(header.packet_no, payload);

            if header.reliable {
                let mut bits = AckBits::empty(header.packet_count);
                for no in assembler.fragments.keys() {
                    bits.set(*no);
                }
                self.send_ack(false, &header, bits, peer.addr);
            }

            // All indices are distinct and below the count, so a full
            // buffer is necessarily contiguous.
            if assembler.fragments.len() == header.packet_count as usize {
                let mut out = Vec::new();
                for fragment in assembler.fragments.values() {
                    out.extend_from_slice(fragment);
                }
                AssemblerVerdict::Done(Some(out))
            } else {
                AssemblerVerdict::Keep(None)
            }
        });

        if let Some(payload) = assembled {
            handler.received(&peer, header.hash, payload);
        }
    }

    fn ack_received(&self, from: SocketAddr, ack: AckHeader) {
        let now = Instant::now();
        let mut state = self.state.lock().unwrap();

        let Some(peer) = state.peers.get(&from).cloned() else {
            return;
        };
        peer.refresh();

        let Some(entry) = state.send_queue.get_mut(&ack.packet_id) else {
            return;
        };
        if ack.packet_count != entry.header.packet_count {
            log::trace!(
                target: "net",
                "Ignoring ack for packet {} with mismatched count {}",
                ack.packet_id, ack.packet_count
            );
            return;
        }
        let Some(pos) = entry.position(&peer) else {
            return;
        };
        let target = &mut entry.targets[pos];

        peer.measure_round_trip(now.duration_since(target.last_send));
        target.acked.union(&ack.bits);

        if target.acked.complete(entry.header.packet_count) {
            entry.targets.remove(pos);
            if entry.targets.is_empty() {
                log::trace!(target: "net", "Packet {} fully acknowledged", ack.packet_id);
                state.send_queue.remove(&ack.packet_id);
            }
        }
    }

    fn nack_received(&self, from: SocketAddr, nack: AckHeader) {
        let now = Instant::now();
        let mut state = self.state.lock().unwrap();

        let Some(peer) = state.peers.get(&from).cloned() else {
            return;
        };
        peer.refresh();

        let Some(entry) = state.send_queue.get_mut(&nack.packet_id) else {
            return;
        };
        if nack.packet_count != entry.header.packet_count {
            return;
        }
        let Some(pos) = entry.position(&peer) else {
            return;
        };
        let target = &mut entry.targets[pos];

        target.last_send = now;
        target.acked.difference(&nack.bits);

        log::trace!(
            target: "net",
            "Peer {} nacked {} fragments of packet {}",
            peer.name,
            nack.bits.ones(nack.packet_count).count(),
            nack.packet_id
        );
        for no in nack.bits.ones(nack.packet_count) {
            let frame = fragment(&entry.header, &entry.payload, no, self.packet_data_mtu);
            self.send_datagram(&frame, peer.addr, Some(&entry.header));
        }
    }

    /// The announce tick: sweep dead peers and stale assemblers, drive
    /// retransmission of unacknowledged fragments, and announce
    /// ourselves to the multicast group.
    pub fn announce(&self, handler: &mut dyn Handler) {
        let now = Instant::now();

        let expired: Vec<Arc<Peer>> = {
            let mut state = self.state.lock().unwrap();
            let expired: Vec<Arc<Peer>> = state
                .peers
                .iter()
                .filter(|p| now.duration_since(p.last_update()) > PEER_TIMEOUT)
                .cloned()
                .collect();
            for peer in &expired {
                state.peers.remove(peer);
            }
            for peer in state.peers.iter() {
                peer.expire_assemblers(now, ASSEMBLER_TIMEOUT);
            }
            state.send_queue.retain(|_, entry| {
                let SendQueueEntry {
                    header,
                    payload,
                    targets,
                } = entry;
                targets.retain_mut(|target| {
                    let Some(peer) = target.peer.upgrade() else {
                        return false;
                    };
                    // An ack should have arrived by now; resend whatever
                    // the peer hasn't confirmed.
                    if now.duration_since(target.last_send) > 2 * peer.rtt() {
                        for no in target.acked.zeroes(header.packet_count) {
                            let frame = fragment(header, payload, no, self.packet_data_mtu);
                            self.send_datagram(&frame, peer.addr, Some(header));
                        }
                        target.last_send = now;
                    }
                    true
                });
                !targets.is_empty()
            });
            expired
        };

        for peer in &expired {
            log::debug!(target: "net", "Peer {}@{} timed out", peer.name, peer.addr);
            handler.left(peer);
        }

        self.send_datagram(&self.announce_packet, self.multicast_target, None);
    }

    /// Send a payload to `target` (every peer announced under that name),
    /// or to the whole group when `target` is `None`.
    pub fn send(
        &self,
        hash: u128,
        payload: &[u8],
        target: Option<&str>,
        reliable: bool,
    ) -> Result<(), Error> {
        let fragments = payload.len() / self.packet_data_mtu + 1;
        let packet_count =
            u16::try_from(fragments).map_err(|_| Error::PayloadTooLarge(payload.len()))?;

        let (header, dests) = {
            let mut state = self.state.lock().unwrap();

            // Find a packet id not currently in use for retransmission.
            let mut packet_id = state.next_packet_id.wrapping_add(1);
            while state.send_queue.contains_key(&packet_id) {
                packet_id = packet_id.wrapping_add(1);
            }
            state.next_packet_id = packet_id;

            let header = DataHeader {
                packet_id,
                packet_no: 0,
                packet_count,
                reliable,
                hash,
            };
            let peers: Vec<Arc<Peer>> = match target {
                Some(name) => state.peers.named(name).to_vec(),
                None => state.peers.iter().cloned().collect(),
            };

            if reliable {
                let now = Instant::now();
                let targets = peers
                    .iter()
                    .map(|peer| SendTarget {
                        peer: Arc::downgrade(peer),
                        last_send: now,
                        acked: AckBits::empty(packet_count),
                    })
                    .collect();
                state.send_queue.insert(
                    packet_id,
                    SendQueueEntry {
                        header,
                        payload: payload.to_vec(),
                        targets,
                    },
                );
            }

            let dests: Vec<SocketAddr> = match target {
                Some(_) => peers.iter().map(|peer| peer.addr).collect(),
                None => vec![self.multicast_target],
            };
            (header, dests)
        };

        log::trace!(
            target: "net",
            "Sending packet {} ({} bytes, {} fragments, reliable={reliable})",
            header.packet_id, payload.len(), packet_count
        );
        for no in 0..packet_count {
            let frame = fragment(&header, payload, no, self.packet_data_mtu);
            for dest in &dests {
                self.send_datagram(&frame, *dest, Some(&header));
            }
        }
        Ok(())
    }

    /// Announce our departure to the group.
    pub fn leave(&self) {
        self.send_datagram(
            &Packet::Leave.encode_to_vec(),
            self.multicast_target,
            None,
        );
    }

    fn send_ack(&self, nack: bool, header: &DataHeader, bits: AckBits, to: SocketAddr) {
        let ack = AckHeader {
            packet_id: header.packet_id,
            packet_no: header.packet_no,
            packet_count: header.packet_count,
            bits,
        };
        let packet = if nack {
            Packet::Nack(ack)
        } else {
            Packet::Ack(ack)
        };
        self.send_datagram(&packet.encode_to_vec(), to, None);
    }

    fn send_datagram(&self, frame: &[u8], to: SocketAddr, data: Option<&DataHeader>) {
        if let Some(header) = data {
            let mut hook = self.drop_outbound.lock().unwrap();
            if let Some(drop) = hook.as_mut() {
                if drop(header) {
                    log::trace!(target: "net", "Dropping outbound fragment {}/{} of packet {}",
                        header.packet_no, header.packet_count, header.packet_id);
                    return;
                }
            }
        }
        match self.unicast.send_to(frame, to) {
            Ok(_) => {}
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::Interrupted =>
            {
                // Absorbed; retransmission recovers reliable traffic.
                log::trace!(target: "net", "Socket busy sending to {to}");
            }
            Err(e) => {
                log::warn!(target: "net", "Error sending {} bytes to {to}: {e}", frame.len());
            }
        }
    }
}

impl SendQueueEntry {
    fn position(&self, peer: &Arc<Peer>) -> Option<usize> {
        self.targets.iter().position(|target| {
            target
                .peer
                .upgrade()
                .is_some_and(|p| Arc::ptr_eq(&p, peer))
        })
    }
}

/// Build the datagram for fragment `no` of `payload`.
fn fragment(header: &DataHeader, payload: &[u8], no: u16, mtu: usize) -> Vec<u8> {
    let start = no as usize * mtu;
    let end = (start + mtu).min(payload.len());
    let header = DataHeader {
        packet_no: no,
        ..*header
    };
    header.frame(&payload[start..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fragment_bounds() {
        let header = DataHeader {
            packet_id: 1,
            packet_no: 0,
            packet_count: 3,
            reliable: false,
            hash: 0,
        };
        let payload: Vec<u8> = (0u8..10).collect();

        // 4-byte fragments: [0..4), [4..8), [8..10).
        let frames: Vec<Vec<u8>> = (0..3).map(|no| fragment(&header, &payload, no, 4)).collect();
        assert_eq!(frames[0].len(), DataHeader::SIZE + 4);
        assert_eq!(frames[1].len(), DataHeader::SIZE + 4);
        assert_eq!(frames[2].len(), DataHeader::SIZE + 2);

        // A payload that is an exact multiple of the fragment size gets a
        // trailing empty fragment, mirroring the count formula.
        let header = DataHeader {
            packet_count: 2,
            ..header
        };
        let payload = vec![0u8; 4];
        assert_eq!(fragment(&header, &payload, 1, 4).len(), DataHeader::SIZE);
    }

    #[test]
    fn test_bind_rejects_bad_config() {
        let config = Config {
            group: "192.168.1.1".to_owned(),
            ..Config::default()
        };
        assert!(matches!(
            Transport::bind(&config),
            Err(Error::InvalidGroup(_))
        ));

        let config = Config {
            group: "not an address".to_owned(),
            ..Config::default()
        };
        assert!(matches!(
            Transport::bind(&config),
            Err(Error::InvalidGroup(_))
        ));

        let config = Config {
            mtu: 40,
            ..Config::default()
        };
        assert!(matches!(Transport::bind(&config), Err(Error::MtuTooSmall(40))));
    }
}
