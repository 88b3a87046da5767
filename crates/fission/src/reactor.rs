//! The surface reactors bind and emit through.

use std::marker::PhantomData;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::time::Duration;

use fission_net::wire::{Decode, Encode};

use crate::bus::{Bus, EventId, FromNetwork};
use crate::descriptor::{Group, Pool, Priority};
use crate::extension::io::{IoEvent, IoInterest};
use crate::extension::timer::Tick;
use crate::extension::{io, timer};
use crate::plant::Handle;
use crate::registry::{BindOptions, ReactionHandle};
use crate::task::{Callback, Payload};

/// A user-defined component that binds its reactions when installed.
pub trait Reactor: Send {
    fn init(&mut self, ctx: &Context);
}

/// The capability object handed to reactors: binding, emitting, and
/// lifecycle control. Cloneable so callbacks can capture their own
/// emitting surface.
#[derive(Clone)]
pub struct Context {
    pub(crate) bus: Bus,
    pub(crate) handle: Handle,
    pub(crate) io: io::Registrar,
    pub(crate) timer: timer::Registrar,
}

impl Context {
    /// Begin binding a reaction to event type `T`.
    pub fn on<T: Send + Sync + 'static>(&self) -> Binder<'_, T> {
        Binder {
            ctx: self,
            options: BindOptions::new(),
            _event: PhantomData,
        }
    }

    /// Begin binding a reaction to payloads of `T` arriving from the
    /// mesh. Registers the wire decoder for `T` as a side effect.
    pub fn on_network<T>(&self) -> Binder<'_, FromNetwork<T>>
    where
        T: Decode + Send + Sync + 'static,
    {
        self.bus.register_decoder::<T>();
        self.on::<FromNetwork<T>>()
    }

    /// Begin binding a reaction to readiness of a file descriptor. The
    /// caller keeps ownership of the descriptor and must out-live the
    /// binding.
    pub fn on_io(&self, fd: RawFd, interest: IoInterest) -> IoBinder<'_> {
        IoBinder {
            ctx: self,
            fd,
            interest,
            options: BindOptions::new(),
        }
    }

    /// Begin binding a reaction dispatched every `period`.
    pub fn every(&self, period: Duration) -> EveryBinder<'_> {
        EveryBinder {
            ctx: self,
            period,
            options: BindOptions::new(),
        }
    }

    /// Emit with LOCAL scope.
    pub fn emit<T: Send + Sync + 'static>(&self, value: T) {
        self.bus.emit(value);
    }

    /// Emit with DIRECT scope: eligible tasks run inline on this thread.
    pub fn emit_direct<T: Send + Sync + 'static>(&self, value: T) {
        self.bus.emit_direct(value);
    }

    /// Emit with INITIALIZE scope: buffered until the plant starts.
    pub fn emit_init<T: Send + Sync + 'static>(&self, value: T) {
        self.bus.emit_init(value);
    }

    /// Emit with NETWORK scope: deliver to mesh peers.
    pub fn emit_network<T: Encode + 'static>(&self, value: &T, target: Option<&str>, reliable: bool) {
        self.bus.emit_network(value, target, reliable);
    }

    /// Request plant shutdown.
    pub fn shutdown(&self) {
        self.handle.shutdown();
    }

    /// A cloneable lifecycle handle, usable from reaction callbacks.
    pub fn handle(&self) -> Handle {
        self.handle.clone()
    }
}

macro_rules! binder_options {
    () => {
        /// Dispatch priority of the binding's tasks.
        pub fn priority(mut self, priority: Priority) -> Self {
            self.options = self.options.priority(priority);
            self
        }

        /// Pool the binding's tasks execute on.
        pub fn pool(mut self, pool: Pool) -> Self {
            self.options = self.options.pool(pool);
            self
        }

        /// Execute on the main-thread pool.
        pub fn main_thread(mut self) -> Self {
            self.options = self.options.main_thread();
            self
        }

        /// Concurrency group of the binding's tasks.
        pub fn group(mut self, group: Group) -> Self {
            self.options = self.options.group(group);
            self
        }

        /// Synchronize with every binding synchronized on `S`.
        pub fn sync<S: 'static>(mut self) -> Self {
            self.options = self.options.sync::<S>();
            self
        }

        /// Drop emissions while a task of this binding is queued or
        /// running.
        pub fn single(mut self) -> Self {
            self.options = self.options.single();
            self
        }
    };
}

/// Options accumulator for a typed event binding.
pub struct Binder<'a, T> {
    ctx: &'a Context,
    options: BindOptions,
    _event: PhantomData<fn(&T)>,
}

impl<T: Send + Sync + 'static> Binder<'_, T> {
    binder_options!();

    /// Finish the binding with a callback taking the payload.
    pub fn then(self, f: impl Fn(&T) + Send + Sync + 'static) -> ReactionHandle {
        let callback: Callback = Arc::new(move |payload: &Payload| {
            if let Some(value) = payload.downcast_ref::<T>() {
                f(value);
            }
        });
        let (_, handle) = self
            .ctx
            .bus
            .registry()
            .bind(EventId::of::<T>(), callback, self.options);
        handle
    }

    /// Finish the binding with a callback tolerating an absent payload:
    /// the task is dispatched even when the payload is not a `T`.
    pub fn then_optional(mut self, f: impl Fn(Option<&T>) + Send + Sync + 'static) -> ReactionHandle {
        self.options = self.options.optional();
        let callback: Callback =
            Arc::new(move |payload: &Payload| f(payload.downcast_ref::<T>()));
        let (_, handle) = self
            .ctx
            .bus
            .registry()
            .bind(EventId::of::<T>(), callback, self.options);
        handle
    }
}

/// Options accumulator for a file-descriptor binding.
pub struct IoBinder<'a> {
    ctx: &'a Context,
    fd: RawFd,
    interest: IoInterest,
    options: BindOptions,
}

impl IoBinder<'_> {
    binder_options!();

    /// Finish the binding. The callback observes the ready descriptor;
    /// the descriptor is re-armed after each task.
    pub fn then(self, f: impl Fn(&IoEvent) + Send + Sync + 'static) -> ReactionHandle {
        let callback: Callback = Arc::new(move |payload: &Payload| {
            if let Some(event) = payload.downcast_ref::<IoEvent>() {
                f(event);
            }
        });
        let (reaction, handle) = self
            .ctx
            .bus
            .registry()
            .bind_detached(callback, self.options);
        self.ctx.io.register(self.fd, self.interest, &reaction);
        handle
    }
}

/// Options accumulator for an interval binding.
pub struct EveryBinder<'a> {
    ctx: &'a Context,
    period: Duration,
    options: BindOptions,
}

impl EveryBinder<'_> {
    binder_options!();

    pub fn then(self, f: impl Fn(&Tick) + Send + Sync + 'static) -> ReactionHandle {
        let callback: Callback = Arc::new(move |payload: &Payload| {
            if let Some(tick) = payload.downcast_ref::<Tick>() {
                f(tick);
            }
        });
        let (reaction, handle) = self
            .ctx
            .bus
            .registry()
            .bind_detached(callback, self.options);
        self.ctx.timer.register(self.period, &reaction);
        handle
    }
}
