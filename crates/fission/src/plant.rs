//! The power plant: process-wide coordinator owning the scheduler,
//! registry and extensions.

use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::bus::{Bus, Initialize, Shutdown};
use crate::extension::io::IoDriver;
use crate::extension::network::NetworkBridge;
use crate::extension::timer::TimerDriver;
use crate::reactor::{Context, Reactor};
use crate::registry::Registry;
use crate::scheduler::TaskScheduler;

/// Plant configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Worker threads of the default pool.
    pub threads: usize,
    /// Whether `Realtime` tasks may run in a saturated group. Off by
    /// default: group concurrency bounds then hold for every task.
    pub realtime_bypasses_groups: bool,
    /// Mesh transport configuration; `None` disables networking.
    pub network: Option<fission_net::Config>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            threads: 4,
            realtime_bypasses_groups: false,
            network: None,
        }
    }
}

impl Config {
    /// Load a configuration from a JSON file.
    pub fn load(path: &Path) -> Result<Self, Error> {
        let file = std::fs::File::open(path)?;
        Ok(serde_json::from_reader(file)?)
    }
}

/// A plant error. Construction and startup failures surface here;
/// runtime scheduler and protocol failures are absorbed and logged.
#[derive(Error, Debug)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("network transport error: {0}")]
    Network(#[from] fission_net::transport::Error),
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("configuration file error: {0}")]
    ConfigFile(#[from] serde_json::Error),
}

/// Owns the runtime. Construct it, install reactors, then [`start`]
/// on the thread that should become the main-thread pool's worker.
///
/// [`start`]: PowerPlant::start
pub struct PowerPlant {
    config: Config,
    bus: Bus,
    handle: Handle,
    reactors: Vec<Box<dyn Reactor>>,
    io: IoDriver,
    timer: TimerDriver,
}

impl PowerPlant {
    pub fn new(config: Config) -> Result<Self, Error> {
        if config.threads == 0 {
            return Err(Error::Config("thread count must be positive".to_owned()));
        }
        if let Some(network) = &config.network {
            let group: std::net::IpAddr = network
                .group
                .parse()
                .map_err(|_| Error::Config(format!("invalid multicast group '{}'", network.group)))?;
            if !group.is_multicast() {
                return Err(Error::Config(format!(
                    "'{}' is not a multicast address",
                    network.group
                )));
            }
        }

        let scheduler = TaskScheduler::new(config.realtime_bypasses_groups);
        let bus = Bus::new(Registry::new(), scheduler);
        let handle = Handle {
            bus: bus.clone(),
            down: Arc::new(AtomicBool::new(false)),
        };

        Ok(Self {
            config,
            handle,
            reactors: Vec::new(),
            io: IoDriver::new()?,
            timer: TimerDriver::new(),
            bus,
        })
    }

    /// Install a reactor: its `init` runs immediately against the
    /// binding surface, and the reactor lives as long as the plant.
    pub fn install<R: Reactor + 'static>(&mut self, mut reactor: R) {
        let ctx = self.context();
        reactor.init(&ctx);
        self.reactors.push(Box::new(reactor));
    }

    /// The binding surface, also usable outside [`PowerPlant::install`].
    pub fn context(&self) -> Context {
        Context {
            bus: self.bus.clone(),
            handle: self.handle.clone(),
            io: self.io.registrar(),
            timer: self.timer.registrar(),
        }
    }

    /// A cloneable lifecycle handle.
    pub fn handle(&self) -> Handle {
        self.handle.clone()
    }

    /// Run the plant on the calling thread.
    ///
    /// Builds the default pool, brings up the built-in extensions,
    /// emits [`Initialize`] as DIRECT, then services the main-thread
    /// pool until shutdown completes.
    pub fn start(&mut self) -> Result<(), Error> {
        log::info!(
            target: "plant",
            "Starting power plant with {} worker threads and {} reactors",
            self.config.threads,
            self.reactors.len()
        );

        let network = match &self.config.network {
            Some(config) => Some(NetworkBridge::start(config, &self.bus)?),
            None => None,
        };
        self.io.start(self.bus.clone())?;
        self.timer.start(self.bus.clone());

        let scheduler = self.bus.scheduler().clone();
        scheduler.prepare(self.config.threads);

        // INITIALIZE-scoped consumers observe their emissions, then
        // Initialize itself, synchronously and before any worker runs.
        self.bus.flush_init();
        self.bus.emit_direct(Initialize);

        scheduler.launch();
        scheduler.run_main();
        scheduler.join();

        self.timer.stop();
        self.io.stop();
        if let Some(network) = network {
            network.stop();
        }
        log::info!(target: "plant", "Power plant wound down");
        Ok(())
    }

    /// Request shutdown. Equivalent to [`Handle::shutdown`].
    pub fn shutdown(&self) {
        self.handle.shutdown();
    }
}

/// Cloneable lifecycle handle, usable from any thread.
#[derive(Clone)]
pub struct Handle {
    pub(crate) bus: Bus,
    down: Arc<AtomicBool>,
}

impl Handle {
    /// Shut the scheduler down, then emit [`Shutdown`] as DIRECT so its
    /// observers run inline. Repeated calls have the same observable
    /// effect as one.
    pub fn shutdown(&self) {
        if self.down.swap(true, Ordering::AcqRel) {
            return;
        }
        log::info!(target: "plant", "Shutdown requested");
        self.bus.scheduler().shutdown();
        self.bus.emit_direct(Shutdown);
    }
}
