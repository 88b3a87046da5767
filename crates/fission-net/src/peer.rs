//! Peer state and indices.

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Initial round-trip estimate for a peer we haven't measured yet.
pub const INITIAL_RTT: Duration = Duration::from_millis(100);

/// Smoothing factor of the round-trip estimator, `1/8`.
const RTT_ALPHA: f64 = 0.125;

/// A remote peer on the mesh.
///
/// Created on the first ANNOUNCE from an unknown address or on explicit
/// connect; removed on LEAVE, on liveness timeout, or at transport
/// shutdown.
#[derive(Debug)]
pub struct Peer {
    /// Peer name, as announced. Names are not unique.
    pub name: String,
    /// The peer's unicast address.
    pub addr: SocketAddr,
    /// Mutable per-peer state, behind its own lock.
    state: Mutex<PeerState>,
}

#[derive(Debug)]
struct PeerState {
    /// When we last heard from this peer.
    last_update: Instant,
    /// Smoothed round-trip estimate.
    rtt: Duration,
    /// In-flight reassembly buffers, keyed by packet id.
    assemblers: HashMap<u32, Assembler>,
}

/// Reassembly buffer for one fragmented transmission.
#[derive(Debug)]
pub struct Assembler {
    /// When the first fragment arrived.
    pub started: Instant,
    /// Received fragments by fragment index.
    pub fragments: BTreeMap<u16, Vec<u8>>,
}

impl Assembler {
    fn new() -> Self {
        Self {
            started: Instant::now(),
            fragments: BTreeMap::new(),
        }
    }

    /// Highest fragment index held, if any.
    pub fn highest(&self) -> Option<u16> {
        self.fragments.last_key_value().map(|(no, _)| *no)
    }
}

impl Peer {
    pub fn new(name: String, addr: SocketAddr) -> Self {
        Self {
            name,
            addr,
            state: Mutex::new(PeerState {
                last_update: Instant::now(),
                rtt: INITIAL_RTT,
                assemblers: HashMap::new(),
            }),
        }
    }

    /// Note that we heard from this peer.
    pub fn refresh(&self) {
        self.state.lock().unwrap().last_update = Instant::now();
    }

    pub fn last_update(&self) -> Instant {
        self.state.lock().unwrap().last_update
    }

    /// Current round-trip estimate.
    pub fn rtt(&self) -> Duration {
        self.state.lock().unwrap().rtt
    }

    /// Fold a new round-trip sample into the estimate using an
    /// exponentially-smoothed filter.
    pub fn measure_round_trip(&self, sample: Duration) {
        let mut state = self.state.lock().unwrap();
        state.rtt = state.rtt.mul_f64(1.0 - RTT_ALPHA) + sample.mul_f64(RTT_ALPHA);
    }

    /// Run `f` against the assembler for `packet_id`, creating it if needed.
    pub(crate) fn with_assembler<R>(
        &self,
        packet_id: u32,
        f: impl FnOnce(&mut Assembler) -> AssemblerVerdict<R>,
    ) -> Option<R> {
        let mut state = self.state.lock().unwrap();
        let assembler = state
            .assemblers
            .entry(packet_id)
            .or_insert_with(Assembler::new);

        match f(assembler) {
            AssemblerVerdict::Keep(r) => r,
            AssemblerVerdict::Done(r) => {
                state.assemblers.remove(&packet_id);
                r
            }
        }
    }

    /// Drop assemblers that have not completed within `timeout`.
    pub(crate) fn expire_assemblers(&self, now: Instant, timeout: Duration) {
        let mut state = self.state.lock().unwrap();
        state
            .assemblers
            .retain(|_, assembler| now.duration_since(assembler.started) < timeout);
    }
}

/// Whether an assembler survives the access.
pub(crate) enum AssemblerVerdict<R> {
    Keep(Option<R>),
    Done(Option<R>),
}

/// The transport's view of all known peers.
///
/// A peer has exactly one entry in each index: the list, the address
/// map, and the name multimap.
#[derive(Debug, Default)]
pub(crate) struct PeerTable {
    list: Vec<Arc<Peer>>,
    by_addr: HashMap<SocketAddr, Arc<Peer>>,
    by_name: BTreeMap<String, Vec<Arc<Peer>>>,
}

impl PeerTable {
    pub fn insert(&mut self, peer: Arc<Peer>) {
        debug_assert!(!self.by_addr.contains_key(&peer.addr));

        self.by_addr.insert(peer.addr, peer.clone());
        self.by_name
            .entry(peer.name.clone())
            .or_default()
            .push(peer.clone());
        self.list.push(peer);
    }

    /// Remove a peer from all indices.
    pub fn remove(&mut self, peer: &Arc<Peer>) {
        self.by_addr.remove(&peer.addr);

        if let Some(peers) = self.by_name.get_mut(&peer.name) {
            peers.retain(|p| !Arc::ptr_eq(p, peer));
            if peers.is_empty() {
                self.by_name.remove(&peer.name);
            }
        }
        self.list.retain(|p| !Arc::ptr_eq(p, peer));
    }

    pub fn get(&self, addr: &SocketAddr) -> Option<&Arc<Peer>> {
        self.by_addr.get(addr)
    }

    /// All peers announced under `name`.
    pub fn named(&self, name: &str) -> &[Arc<Peer>] {
        self.by_name.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Peer>> {
        self.list.iter()
    }

    pub fn len(&self) -> usize {
        self.list.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        ([127, 0, 0, 1], port).into()
    }

    #[test]
    fn test_rtt_estimator() {
        let peer = Peer::new("eel".to_owned(), addr(1234));
        assert_eq!(peer.rtt(), INITIAL_RTT);

        // A 100ms sample leaves the estimate unchanged.
        peer.measure_round_trip(Duration::from_millis(100));
        assert_eq!(peer.rtt(), INITIAL_RTT);

        // Converge towards a faster link; every sample moves the estimate
        // by 1/8th of the difference.
        peer.measure_round_trip(Duration::from_millis(20));
        assert_eq!(peer.rtt(), Duration::from_millis(90));

        for _ in 0..64 {
            peer.measure_round_trip(Duration::from_millis(20));
        }
        assert!(peer.rtt() < Duration::from_millis(21));
        assert!(peer.rtt() >= Duration::from_millis(20));
    }

    #[test]
    fn test_indices() {
        let mut table = PeerTable::default();
        let a1 = Arc::new(Peer::new("a".to_owned(), addr(1)));
        let a2 = Arc::new(Peer::new("a".to_owned(), addr(2)));
        let b = Arc::new(Peer::new("b".to_owned(), addr(3)));

        table.insert(a1.clone());
        table.insert(a2.clone());
        table.insert(b.clone());

        assert_eq!(table.len(), 3);
        assert_eq!(table.named("a").len(), 2);
        assert!(Arc::ptr_eq(table.get(&addr(3)).unwrap(), &b));

        table.remove(&a1);
        assert_eq!(table.len(), 2);
        assert_eq!(table.named("a").len(), 1);
        assert!(table.get(&addr(1)).is_none());
        assert!(Arc::ptr_eq(&table.named("a")[0], &a2));

        table.remove(&a2);
        assert!(table.named("a").is_empty());
    }
}
