//! File-descriptor readiness reactions.
//!
//! A dedicated thread polls registered descriptors. Readiness
//! dispatches one task for the bound reaction and disarms the
//! descriptor; the reaction's postcondition re-arms it once the task
//! has run, so a descriptor is never dispatched concurrently with
//! itself.

use std::collections::HashMap;
use std::io;
use std::os::fd::RawFd;
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{unbounded, Receiver, Sender, TryRecvError};
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token, Waker};

use crate::bus::Bus;
use crate::registry::Reaction;

const WAKER: Token = Token(0);

/// Readiness operation a binding waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoInterest {
    Read,
    Write,
}

impl From<IoInterest> for Interest {
    fn from(interest: IoInterest) -> Self {
        match interest {
            IoInterest::Read => Interest::READABLE,
            IoInterest::Write => Interest::WRITABLE,
        }
    }
}

/// Payload delivered to an IO reaction.
#[derive(Debug, Clone)]
pub struct IoEvent {
    pub fd: RawFd,
    pub interest: IoInterest,
}

pub(crate) enum IoCommand {
    Register {
        fd: RawFd,
        interest: IoInterest,
        reaction: Weak<Reaction>,
    },
    Rearm(Token),
    Shutdown,
}

/// Registration surface handed to binders and postconditions.
#[derive(Clone)]
pub(crate) struct Registrar {
    sender: Sender<IoCommand>,
    waker: Arc<Waker>,
}

impl Registrar {
    pub(crate) fn command(&self, cmd: IoCommand) {
        self.sender.send(cmd).ok();
        self.waker.wake().ok();
    }

    /// Register a descriptor and install the re-arm postcondition on
    /// its reaction.
    pub(crate) fn register(&self, fd: RawFd, interest: IoInterest, reaction: &Arc<Reaction>) {
        self.command(IoCommand::Register {
            fd,
            interest,
            reaction: Arc::downgrade(reaction),
        });
    }
}

/// The IO extension: owns the poll thread.
pub(crate) struct IoDriver {
    registrar: Registrar,
    poll: Option<(Poll, Receiver<IoCommand>)>,
    thread: Option<JoinHandle<()>>,
}

impl IoDriver {
    /// Set up the poll and command channel. Registrations are accepted
    /// from this point; the thread drains them once started.
    pub(crate) fn new() -> io::Result<Self> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER)?);
        let (sender, receiver) = unbounded();

        Ok(Self {
            registrar: Registrar { sender, waker },
            poll: Some((poll, receiver)),
            thread: None,
        })
    }

    pub(crate) fn registrar(&self) -> Registrar {
        self.registrar.clone()
    }

    pub(crate) fn start(&mut self, bus: Bus) -> io::Result<()> {
        let Some((poll, receiver)) = self.poll.take() else {
            return Ok(());
        };
        let registrar = self.registrar.clone();
        let thread = thread::Builder::new().name("io".to_owned()).spawn(move || {
            Runtime {
                poll,
                receiver,
                bus,
                registrar,
                bindings: HashMap::new(),
                next_token: 1,
            }
            .run();
        })?;
        self.thread = Some(thread);
        Ok(())
    }

    pub(crate) fn stop(&mut self) {
        if let Some(thread) = self.thread.take() {
            self.registrar.command(IoCommand::Shutdown);
            thread.join().ok();
        }
    }
}

/// One registered descriptor. Disarmed (deregistered from the poll)
/// while its reaction's task is in flight.
struct IoBinding {
    fd: RawFd,
    interest: IoInterest,
    reaction: Weak<Reaction>,
}

struct Runtime {
    poll: Poll,
    receiver: Receiver<IoCommand>,
    bus: Bus,
    registrar: Registrar,
    bindings: HashMap<Token, IoBinding>,
    next_token: usize,
}

impl Runtime {
    fn run(mut self) {
        let mut events = Events::with_capacity(64);

        log::debug!(target: "io", "Entering IO event loop");
        loop {
            if let Err(e) = self.poll.poll(&mut events, None) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                log::error!(target: "io", "Error during polling: {e}");
                return;
            }

            // Descriptor events are dispatched before commands: a
            // freshly re-armed descriptor can only fire on the next
            // poll, which keeps dispatch in readiness order.
            let mut awoken = false;
            for event in events.iter() {
                match event.token() {
                    WAKER => awoken = true,
                    token => self.dispatch(token),
                }
            }

            if awoken {
                loop {
                    match self.receiver.try_recv() {
                        Err(TryRecvError::Empty) => break,
                        Err(TryRecvError::Disconnected) => return,
                        Ok(IoCommand::Shutdown) => {
                            log::debug!(target: "io", "Shutdown");
                            return;
                        }
                        Ok(cmd) => self.handle_command(cmd),
                    }
                }
            }
        }
    }

    fn handle_command(&mut self, cmd: IoCommand) {
        match cmd {
            IoCommand::Register {
                fd,
                interest,
                reaction,
            } => {
                let token = Token(self.next_token);
                self.next_token += 1;

                if let Some(strong) = reaction.upgrade() {
                    // Re-arm once the task has run.
                    let registrar = self.registrar.clone();
                    strong.set_postcondition(Arc::new(move || {
                        registrar.command(IoCommand::Rearm(token));
                    }));
                }
                if let Err(e) =
                    self.poll
                        .registry()
                        .register(&mut SourceFd(&fd), token, interest.into())
                {
                    log::error!(target: "io", "Failed to register fd {fd}: {e}");
                    return;
                }
                log::trace!(target: "io", "Watching fd {fd} with token {}", token.0);
                self.bindings.insert(
                    token,
                    IoBinding {
                        fd,
                        interest,
                        reaction,
                    },
                );
            }
            IoCommand::Rearm(token) => {
                let Some((fd, interest, alive)) = self
                    .bindings
                    .get(&token)
                    .map(|b| (b.fd, b.interest, b.reaction.strong_count() > 0))
                else {
                    return;
                };
                if !alive {
                    // Unbound while the task ran.
                    self.remove(token);
                    return;
                }
                if let Err(e) =
                    self.poll
                        .registry()
                        .register(&mut SourceFd(&fd), token, interest.into())
                {
                    log::warn!(target: "io", "Failed to re-arm fd {fd}: {e}");
                    self.bindings.remove(&token);
                }
            }
            IoCommand::Shutdown => {}
        }
    }

    /// A registered descriptor became ready: disarm it and dispatch a
    /// task for its reaction.
    fn dispatch(&mut self, token: Token) {
        let Some((fd, interest, reaction)) = self
            .bindings
            .get(&token)
            .map(|b| (b.fd, b.interest, b.reaction.clone()))
        else {
            log::warn!(target: "io", "Event for unknown token {}", token.0);
            return;
        };
        let Some(reaction) = reaction.upgrade() else {
            self.remove(token);
            return;
        };
        self.poll.registry().deregister(&mut SourceFd(&fd)).ok();
        if !self
            .bus
            .dispatch_to(&reaction, Arc::new(IoEvent { fd, interest }), false)
        {
            // Dispatch refused, so no postcondition will re-arm the
            // descriptor. A disabled binding stays disarmed.
            log::debug!(target: "io", "Dispatch refused for fd {fd}; leaving it disarmed");
        }
    }

    fn remove(&mut self, token: Token) {
        if let Some(binding) = self.bindings.remove(&token) {
            log::trace!(target: "io", "Dropping watch on fd {}", binding.fd);
            self.poll
                .registry()
                .deregister(&mut SourceFd(&binding.fd))
                .ok();
        }
    }
}
