//! A reactor-style in-process message bus and task scheduler with a
//! peer-to-peer UDP transport for cross-process messaging.
//!
//! Applications register [`Reactor`]s that bind callbacks to typed
//! events. Emitting a value constructs one task per eligible reaction
//! and dispatches it on a thread pool under priority, group-concurrency
//! and pool-placement constraints. The [`PowerPlant`] owns the
//! scheduler, the registry and the built-in extensions (interval timer,
//! file-descriptor readiness, mesh transport) and drives the process
//! lifecycle.
//!
//! ```no_run
//! use fission::{Config, Context, PowerPlant, Reactor};
//!
//! struct Greeter;
//!
//! struct Greeting(String);
//!
//! impl Reactor for Greeter {
//!     fn init(&mut self, ctx: &Context) {
//!         let handle = ctx.handle();
//!         ctx.on::<Greeting>().then(move |greeting| {
//!             println!("{}", greeting.0);
//!             handle.shutdown();
//!         });
//!         ctx.emit_init(Greeting("hello".to_owned()));
//!     }
//! }
//!
//! let mut plant = PowerPlant::new(Config::default()).unwrap();
//! plant.install(Greeter);
//! plant.start().unwrap();
//! ```

pub mod bus;
pub mod descriptor;
pub mod extension;
pub mod ids;
pub mod logger;
pub mod plant;
pub mod reactor;
pub mod registry;
pub mod scheduler;
pub mod task;

pub use bus::{Bus, EventId, FromNetwork, Initialize, PeerInfo, PeerJoined, PeerLeft, Shutdown};
pub use descriptor::{Group, Pool, Priority};
pub use extension::{IoEvent, IoInterest, Tick};
pub use plant::{Config, Error, Handle, PowerPlant};
pub use reactor::{Context, Reactor};
pub use registry::{BindOptions, ReactionHandle};
pub use scheduler::TaskScheduler;

pub use fission_net as net;
