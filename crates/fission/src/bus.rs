//! The event bus.
//!
//! An emission resolves the set of reactions bound to the value's type,
//! constructs one task per eligible reaction and hands the tasks to the
//! scheduler. Event types are identified by a stable 128-bit hash of
//! their fully-qualified name, which doubles as the wire identifier for
//! NETWORK-scope emissions.

use std::any::type_name;
use std::collections::HashMap;
use std::mem;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, OnceLock, RwLock};

use fission_net::driver::{Command, Controller};
use fission_net::wire::{Decode, Encode};

use crate::ids::ReactionId;
use crate::registry::{Reaction, Registry};
use crate::scheduler::TaskScheduler;
use crate::task::{Payload, ReactionTask};

/// Identity of an event type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventId(pub u128);

impl EventId {
    pub fn of<T: 'static>() -> Self {
        Self(type_hash::<T>())
    }

    /// An identity private to one binding. Used by extensions whose
    /// reactions are dispatched directly instead of by type lookup, so
    /// broadcast emissions never reach them.
    pub(crate) fn synthetic(reaction: ReactionId) -> Self {
        Self(1 << 127 | u128::from(reaction.0))
    }
}

/// FNV-1a over the fully-qualified type name. Stable across processes
/// built from the same source, which is the compatibility envelope of
/// the wire format.
pub(crate) fn type_hash<T: 'static>() -> u128 {
    const OFFSET: u128 = 0x6c62272e07bb014262b821756295c58d;
    const PRIME: u128 = 0x0000000001000000000000000000013b;

    type_name::<T>()
        .bytes()
        .fold(OFFSET, |hash, byte| (hash ^ u128::from(byte)).wrapping_mul(PRIME))
}

/// Emitted as DIRECT when the plant starts, before any queued task runs.
#[derive(Debug, Clone, Copy)]
pub struct Initialize;

/// Emitted as DIRECT once the plant has shut down.
#[derive(Debug, Clone, Copy)]
pub struct Shutdown;

/// A peer appeared on the mesh.
#[derive(Debug, Clone)]
pub struct PeerJoined {
    pub name: String,
    pub addr: SocketAddr,
}

/// A peer left the mesh or timed out.
#[derive(Debug, Clone)]
pub struct PeerLeft {
    pub name: String,
    pub addr: SocketAddr,
}

/// The remote a network payload came from.
#[derive(Debug, Clone)]
pub struct PeerInfo {
    pub name: String,
    pub addr: SocketAddr,
}

/// A payload received from the mesh, re-emitted locally.
#[derive(Debug, Clone)]
pub struct FromNetwork<T> {
    pub peer: PeerInfo,
    pub value: T,
}

type Decoder = Box<dyn Fn(&Bus, PeerInfo, &[u8]) + Send + Sync>;
type Deferred = Box<dyn FnOnce(&Bus) + Send>;

#[derive(Clone)]
pub struct Bus {
    inner: Arc<Inner>,
}

struct Inner {
    registry: Registry,
    scheduler: Arc<TaskScheduler>,
    /// INITIALIZE-scope emissions buffered until the scheduler starts.
    init_queue: Mutex<Vec<Deferred>>,
    /// The network transport's command channel, once installed.
    network: OnceLock<Controller>,
    /// Payload decoders by wire hash.
    decoders: RwLock<HashMap<u128, Decoder>>,
}

impl Bus {
    pub(crate) fn new(registry: Registry, scheduler: Arc<TaskScheduler>) -> Self {
        Self {
            inner: Arc::new(Inner {
                registry,
                scheduler,
                init_queue: Mutex::new(Vec::new()),
                network: OnceLock::new(),
                decoders: RwLock::new(HashMap::new()),
            }),
        }
    }

    pub(crate) fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    pub(crate) fn scheduler(&self) -> &Arc<TaskScheduler> {
        &self.inner.scheduler
    }

    /// LOCAL scope: dispatch to every reaction bound to `T`.
    pub fn emit<T: Send + Sync + 'static>(&self, value: T) {
        self.dispatch(EventId::of::<T>(), Arc::new(value), false);
    }

    /// DIRECT scope: like [`Bus::emit`], but tasks may run inline on
    /// the calling thread.
    pub fn emit_direct<T: Send + Sync + 'static>(&self, value: T) {
        self.dispatch(EventId::of::<T>(), Arc::new(value), true);
    }

    /// INITIALIZE scope: buffered until the scheduler enters the
    /// started state, then emitted as DIRECT.
    pub fn emit_init<T: Send + Sync + 'static>(&self, value: T) {
        if self.inner.scheduler.is_started() {
            self.emit_direct(value);
            return;
        }
        self.inner
            .init_queue
            .lock()
            .unwrap()
            .push(Box::new(move |bus| bus.emit_direct(value)));
    }

    /// NETWORK scope: encode the value and hand it to the transport.
    /// `target` selects peers by announced name; `None` reaches the
    /// whole group.
    pub fn emit_network<T>(&self, value: &T, target: Option<&str>, reliable: bool)
    where
        T: Encode + 'static,
    {
        let Some(network) = self.inner.network.get() else {
            log::warn!(target: "bus", "No network transport installed; dropping emission");
            return;
        };
        let command = Command::Send {
            hash: type_hash::<T>(),
            payload: value.encode_to_vec(),
            target: target.map(str::to_owned),
            reliable,
        };
        if network.command(command).is_err() {
            log::error!(target: "bus", "Network transport is gone; dropping emission");
        }
    }

    fn dispatch(&self, event: EventId, payload: Payload, immediate: bool) {
        for reaction in self.inner.registry.lookup(event) {
            self.dispatch_to(&reaction, payload.clone(), immediate);
        }
    }

    /// Construct and submit one task for `reaction`. Returns whether a
    /// task was produced.
    pub(crate) fn dispatch_to(
        &self,
        reaction: &Arc<Reaction>,
        payload: Payload,
        immediate: bool,
    ) -> bool {
        if !reaction.activate() {
            return false;
        }
        let task = ReactionTask::new(reaction, payload, immediate);
        if let Err(task) = self.inner.scheduler.submit(task) {
            if immediate {
                // The scheduler no longer accepts work; lifecycle
                // emissions still run inline on the emitting thread.
                task.run();
            } else {
                log::trace!(
                    target: "bus",
                    "Dropping task for reaction {} after shutdown", reaction.id
                );
            }
        }
        true
    }

    /// Flush INITIALIZE-buffered emissions, in order, as DIRECT.
    pub(crate) fn flush_init(&self) {
        let deferred = mem::take(&mut *self.inner.init_queue.lock().unwrap());
        for emit in deferred {
            emit(self);
        }
    }

    pub(crate) fn set_network(&self, controller: Controller) {
        self.inner.network.set(controller).ok();
    }

    /// Register the decoder mapping `T`'s wire hash back to a local
    /// [`FromNetwork`] emission.
    pub(crate) fn register_decoder<T>(&self)
    where
        T: Decode + Send + Sync + 'static,
    {
        self.inner.decoders.write().unwrap().insert(
            type_hash::<T>(),
            Box::new(|bus, peer, mut bytes| match T::decode(&mut bytes) {
                Ok(value) => bus.emit(FromNetwork { peer, value }),
                Err(e) => {
                    log::debug!(target: "bus", "Dropping undecodable network payload: {e}");
                }
            }),
        );
    }

    /// Deliver a payload received from the mesh. Payloads with no
    /// registered decoder are dropped.
    pub(crate) fn deliver(&self, peer: PeerInfo, hash: u128, payload: &[u8]) {
        let decoders = self.inner.decoders.read().unwrap();
        match decoders.get(&hash) {
            Some(decoder) => decoder(self, peer, payload),
            None => {
                log::debug!(target: "bus", "No local binding for network payload {hash:032x}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_hash_is_stable() {
        struct Ping;

        let a = type_hash::<Ping>();
        let b = type_hash::<Ping>();
        assert_eq!(a, b);
        assert_ne!(a, type_hash::<String>());
        assert_ne!(a, 0);
    }

    #[test]
    fn test_synthetic_ids_do_not_collide_with_counters() {
        let a = EventId::synthetic(ReactionId(7));
        let b = EventId::synthetic(ReactionId(8));
        assert_ne!(a, b);
        assert!(a.0 > u128::MAX / 2);
    }
}
