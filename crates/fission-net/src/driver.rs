//! Background thread driving a [`Transport`].
//!
//! The driver polls both transport sockets, paces the announce tick,
//! and executes commands sent from other threads through the
//! [`Controller`].

use std::io;
use std::net::SocketAddr;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use std::{fmt, thread};

use crossbeam_channel::{unbounded, Receiver, Sender, TryRecvError};
use mio::{Events, Interest, Poll, Token, Waker};

use crate::transport::{self, Config, Handler, Transport};

const UNICAST: Token = Token(0);
const MULTICAST: Token = Token(1);
const WAKER: Token = Token(2);

/// Commands accepted by the driver thread.
pub enum Command {
    /// Transmit a payload; see [`Transport::send`].
    Send {
        hash: u128,
        payload: Vec<u8>,
        target: Option<String>,
        reliable: bool,
    },
    /// Register a peer by address without waiting for discovery.
    Connect { name: String, addr: SocketAddr },
    /// Announce departure and stop the driver thread.
    Shutdown,
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Send {
                hash,
                payload,
                target,
                reliable,
            } => f
                .debug_struct("Send")
                .field("hash", &format_args!("{hash:032x}"))
                .field("len", &payload.len())
                .field("target", target)
                .field("reliable", reliable)
                .finish(),
            Command::Connect { name, addr } => f
                .debug_struct("Connect")
                .field("name", name)
                .field("addr", addr)
                .finish(),
            Command::Shutdown => f.write_str("Shutdown"),
        }
    }
}

/// Cloneable handle used to command the driver from other threads.
#[derive(Clone)]
pub struct Controller {
    sender: Sender<Command>,
    waker: std::sync::Arc<Waker>,
}

impl Controller {
    /// Send a command to the driver, waking it up.
    pub fn command(&self, cmd: Command) -> io::Result<()> {
        self.sender
            .send(cmd)
            .map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe))?;
        self.waker.wake()
    }

    pub fn shutdown(&self) -> io::Result<()> {
        self.command(Command::Shutdown)
    }
}

/// A [`Transport`] running on its own thread.
pub struct Driver {
    thread: JoinHandle<()>,
    controller: Controller,
    local_addr: SocketAddr,
}

impl Driver {
    /// Bind a transport and spawn the thread driving it.
    pub fn spawn<H>(config: &Config, handler: H) -> Result<Self, transport::Error>
    where
        H: Handler + 'static,
    {
        let mut transport = Transport::bind(config)?;
        let local_addr = transport.local_addr();

        let poll = Poll::new()?;
        let waker = std::sync::Arc::new(Waker::new(poll.registry(), WAKER)?);
        let (unicast, multicast) = transport.sockets_mut();
        poll.registry()
            .register(unicast, UNICAST, Interest::READABLE)?;
        poll.registry()
            .register(multicast, MULTICAST, Interest::READABLE)?;

        let (sender, receiver) = unbounded();
        let controller = Controller { sender, waker };
        let interval = config.announce_interval;

        let thread = thread::Builder::new()
            .name(format!("net/{}", config.name))
            .spawn(move || {
                Runtime {
                    transport,
                    handler: Box::new(handler),
                    poll,
                    receiver,
                    interval,
                }
                .run();
            })?;

        Ok(Self {
            thread,
            controller,
            local_addr,
        })
    }

    /// The transport's unicast address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn controller(&self) -> Controller {
        self.controller.clone()
    }

    /// Join the driver thread. Call [`Controller::shutdown`] first.
    pub fn join(self) -> thread::Result<()> {
        self.thread.join()
    }
}

/// The driver event loop. Runs on the driver thread and is blocking.
struct Runtime {
    transport: Transport,
    handler: Box<dyn Handler>,
    poll: Poll,
    receiver: Receiver<Command>,
    interval: Duration,
}

impl Runtime {
    fn run(mut self) {
        let mut events = Events::with_capacity(64);
        let mut next_announce = Instant::now();

        log::debug!(target: "net", "Entering transport event loop");
        loop {
            let now = Instant::now();
            if now >= next_announce {
                self.transport.announce(self.handler.as_mut());
                next_announce = now + self.interval;
            }

            if let Err(e) = self
                .poll
                .poll(&mut events, Some(next_announce.saturating_duration_since(now)))
            {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                log::error!(target: "net", "Error during polling: {e}");
                return;
            }

            let mut awoken = false;
            for event in events.iter() {
                match event.token() {
                    WAKER => awoken = true,
                    UNICAST | MULTICAST => {}
                    token => {
                        log::warn!(target: "net", "Event for unknown token {}", token.0);
                    }
                }
            }
            // Both sockets are drained regardless of which one woke us.
            self.transport.process(self.handler.as_mut());

            if awoken {
                loop {
                    match self.receiver.try_recv() {
                        Err(TryRecvError::Empty) => break,
                        Err(TryRecvError::Disconnected) => {
                            log::debug!(target: "net", "Controller disconnected; shutting down");
                            self.transport.leave();
                            return;
                        }
                        Ok(cmd) => {
                            log::trace!(target: "net", "Handling command {cmd:?}");
                            if !self.handle_command(cmd) {
                                return;
                            }
                        }
                    }
                }
            }
        }
    }

    /// Returns `false` when the driver should stop.
    fn handle_command(&mut self, cmd: Command) -> bool {
        match cmd {
            Command::Send {
                hash,
                payload,
                target,
                reliable,
            } => {
                if let Err(e) =
                    self.transport
                        .send(hash, &payload, target.as_deref(), reliable)
                {
                    log::error!(target: "net", "Error sending payload: {e}");
                }
            }
            Command::Connect { name, addr } => {
                self.transport.connect(&name, addr, self.handler.as_mut());
            }
            Command::Shutdown => {
                log::debug!(target: "net", "Shutdown");
                self.transport.leave();
                return false;
            }
        }
        true
    }
}
