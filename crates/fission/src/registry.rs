//! The reaction registry.
//!
//! The registry exclusively owns reactions. Consumers hold
//! [`ReactionHandle`]s, which reference their reaction weakly and can
//! disable or unbind it; tasks reference reactions by id.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use crate::bus::EventId;
use crate::descriptor::{Group, Pool, Priority};
use crate::ids::ReactionId;
use crate::task::Callback;

/// Scheduling options applied to a reaction at bind time.
///
/// This is the explicit form of the binding surface: a bind call
/// synthesizes one [`Reaction`] from the options in a fixed order
/// (dispatch precondition, pool, group, priority, postcondition).
#[derive(Debug, Default, Clone, Copy)]
pub struct BindOptions {
    pub pool: Pool,
    pub group: Group,
    pub priority: Priority,
    /// Drop new tasks while one is already queued or running.
    pub single: bool,
    /// Dispatch even when the payload is not of the bound type; the
    /// callback observes `None`.
    pub optional: bool,
}

impl BindOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn pool(mut self, pool: Pool) -> Self {
        self.pool = pool;
        self
    }

    /// Run on the main-thread pool.
    pub fn main_thread(mut self) -> Self {
        self.pool = Pool::MAIN;
        self
    }

    pub fn group(mut self, group: Group) -> Self {
        self.group = group;
        self
    }

    /// Synchronize with every other binding synchronized on `T`.
    pub fn sync<T: 'static>(mut self) -> Self {
        self.group = Group::sync::<T>();
        self
    }

    pub fn single(mut self) -> Self {
        self.single = true;
        self
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }
}

/// A callback bound to an event type, with scheduling metadata.
pub struct Reaction {
    pub id: ReactionId,
    pub event: EventId,
    pub options: BindOptions,
    pub(crate) callback: Callback,
    enabled: AtomicBool,
    /// Tasks currently queued or running.
    active: AtomicUsize,
    /// Invoked after each task run; installed by extensions that need
    /// to re-arm a resource once the reaction is done with it.
    post: Mutex<Option<Arc<dyn Fn() + Send + Sync>>>,
}

impl Reaction {
    pub fn enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    /// The dispatch precondition: claims an activation slot, or refuses
    /// because the reaction is disabled or `single` and already active.
    pub(crate) fn activate(&self) -> bool {
        if !self.enabled() {
            return false;
        }
        if self.options.single {
            self.active
                .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        } else {
            self.active.fetch_add(1, Ordering::AcqRel);
            true
        }
    }

    pub(crate) fn task_done(&self) {
        self.active.fetch_sub(1, Ordering::AcqRel);
    }

    pub(crate) fn run_postcondition(&self) {
        let post = self.post.lock().unwrap().clone();
        if let Some(post) = post {
            post();
        }
    }

    pub(crate) fn set_postcondition(&self, post: Arc<dyn Fn() + Send + Sync>) {
        *self.post.lock().unwrap() = Some(post);
    }
}

#[derive(Default)]
pub(crate) struct Bindings {
    events: HashMap<EventId, Vec<Arc<Reaction>>>,
}

/// The catalog of bound reactions, keyed by event.
#[derive(Clone, Default)]
pub struct Registry {
    bindings: Arc<RwLock<Bindings>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a callback to an event. Multiple bindings for the same
    /// event are dispatched in registration order.
    pub(crate) fn bind(
        &self,
        event: EventId,
        callback: Callback,
        options: BindOptions,
    ) -> (Arc<Reaction>, ReactionHandle) {
        self.bind_with(ReactionId::next(), event, callback, options)
    }

    /// Bind a callback under a synthetic, per-binding event identity.
    /// Used by extensions that dispatch their reactions directly.
    pub(crate) fn bind_detached(
        &self,
        callback: Callback,
        options: BindOptions,
    ) -> (Arc<Reaction>, ReactionHandle) {
        let id = ReactionId::next();
        self.bind_with(id, EventId::synthetic(id), callback, options)
    }

    fn bind_with(
        &self,
        id: ReactionId,
        event: EventId,
        callback: Callback,
        options: BindOptions,
    ) -> (Arc<Reaction>, ReactionHandle) {
        let reaction = Arc::new(Reaction {
            id,
            event,
            options,
            callback,
            enabled: AtomicBool::new(true),
            active: AtomicUsize::new(0),
            post: Mutex::new(None),
        });
        let mut bindings = self.bindings.write().unwrap();
        bindings
            .events
            .entry(event)
            .or_default()
            .push(reaction.clone());

        log::trace!(target: "bus", "Bound reaction {} to event {:032x}", reaction.id, event.0);

        let handle = ReactionHandle {
            reaction: Arc::downgrade(&reaction),
            bindings: Arc::downgrade(&self.bindings),
        };
        (reaction, handle)
    }

    /// Reactions bound to `event`, in registration order. Copies under
    /// the read lock, so emit never races bind or unbind.
    pub(crate) fn lookup(&self, event: EventId) -> Vec<Arc<Reaction>> {
        self.bindings
            .read()
            .unwrap()
            .events
            .get(&event)
            .cloned()
            .unwrap_or_default()
    }
}

/// A weak grant on a bound reaction.
pub struct ReactionHandle {
    reaction: Weak<Reaction>,
    bindings: Weak<RwLock<Bindings>>,
}

impl ReactionHandle {
    /// Remove the reaction from the registry. Idempotent: unbinding an
    /// already-unbound reaction does nothing. Tasks already queued or
    /// running are not affected.
    pub fn unbind(&self) {
        let Some(reaction) = self.reaction.upgrade() else {
            return;
        };
        let Some(bindings) = self.bindings.upgrade() else {
            return;
        };
        let mut bindings = bindings.write().unwrap();
        if let Some(reactions) = bindings.events.get_mut(&reaction.event) {
            reactions.retain(|r| r.id != reaction.id);
            if reactions.is_empty() {
                bindings.events.remove(&reaction.event);
            }
        }
        log::trace!(target: "bus", "Unbound reaction {}", reaction.id);
    }

    /// Enable or disable dispatch. Disabled reactions are skipped at
    /// emit time but stay bound.
    pub fn enable(&self, enabled: bool) {
        if let Some(reaction) = self.reaction.upgrade() {
            reaction.set_enabled(enabled);
        }
    }

    /// Whether the reaction is still bound.
    pub fn is_bound(&self) -> bool {
        self.reaction.strong_count() > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn noop() -> Callback {
        Arc::new(|_| {})
    }

    #[test]
    fn test_bind_order_preserved() {
        let registry = Registry::new();
        let event = EventId(42);

        let (a, _ha) = registry.bind(event, noop(), BindOptions::new());
        let (b, _hb) = registry.bind(event, noop(), BindOptions::new());
        let (c, _hc) = registry.bind(event, noop(), BindOptions::new());

        let found: Vec<ReactionId> = registry.lookup(event).iter().map(|r| r.id).collect();
        assert_eq!(found, vec![a.id, b.id, c.id]);
    }

    #[test]
    fn test_unbind_is_idempotent() {
        let registry = Registry::new();
        let event = EventId(42);

        // Nb. don't hold on to the returned `Arc`: `is_bound` reflects
        // registry ownership.
        let (_, ha) = registry.bind(event, noop(), BindOptions::new());
        let (b, _hb) = registry.bind(event, noop(), BindOptions::new());

        assert!(ha.is_bound());
        ha.unbind();
        ha.unbind();
        assert!(!ha.is_bound());

        let found: Vec<ReactionId> = registry.lookup(event).iter().map(|r| r.id).collect();
        assert_eq!(found, vec![b.id]);
    }

    #[test]
    fn test_disabled_reactions_refuse_activation() {
        let registry = Registry::new();
        let (reaction, handle) = registry.bind(EventId(1), noop(), BindOptions::new());

        assert!(reaction.activate());
        handle.enable(false);
        assert!(!reaction.activate());
        handle.enable(true);
        assert!(reaction.activate());
    }

    #[test]
    fn test_single_admits_one_task() {
        let registry = Registry::new();
        let (reaction, _handle) =
            registry.bind(EventId(1), noop(), BindOptions::new().single());

        assert!(reaction.activate());
        assert!(!reaction.activate(), "a task is already active");

        reaction.task_done();
        assert!(reaction.activate());
    }
}
