//! Interval reactions.
//!
//! A timer thread keeps deadlines in a sorted map and dispatches a
//! task for each elapsed binding, rescheduling it one period later.

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};

use crate::bus::Bus;
use crate::registry::Reaction;

/// Payload delivered to interval reactions.
#[derive(Debug, Clone, Copy)]
pub struct Tick {
    /// The deadline this tick was scheduled for. Dispatch latency can
    /// make it earlier than the callback's own clock reading.
    pub scheduled: Instant,
}

pub(crate) enum TimerCommand {
    Register {
        period: Duration,
        reaction: Weak<Reaction>,
    },
    Shutdown,
}

#[derive(Clone)]
pub(crate) struct Registrar {
    sender: Sender<TimerCommand>,
}

impl Registrar {
    pub(crate) fn register(&self, period: Duration, reaction: &Arc<Reaction>) {
        self.sender
            .send(TimerCommand::Register {
                period,
                reaction: Arc::downgrade(reaction),
            })
            .ok();
    }
}

/// The timer extension: owns the timer thread.
pub(crate) struct TimerDriver {
    registrar: Registrar,
    receiver: Option<Receiver<TimerCommand>>,
    thread: Option<JoinHandle<()>>,
}

impl TimerDriver {
    pub(crate) fn new() -> Self {
        let (sender, receiver) = unbounded();
        Self {
            registrar: Registrar { sender },
            receiver: Some(receiver),
            thread: None,
        }
    }

    pub(crate) fn registrar(&self) -> Registrar {
        self.registrar.clone()
    }

    pub(crate) fn start(&mut self, bus: Bus) {
        let Some(receiver) = self.receiver.take() else {
            return;
        };
        let thread = thread::Builder::new()
            .name("timer".to_owned())
            .spawn(move || run(receiver, bus))
            .expect("failed to spawn timer thread");
        self.thread = Some(thread);
    }

    pub(crate) fn stop(&mut self) {
        if let Some(thread) = self.thread.take() {
            self.registrar.sender.send(TimerCommand::Shutdown).ok();
            thread.join().ok();
        }
    }
}

struct Entry {
    period: Duration,
    reaction: Weak<Reaction>,
}

fn run(receiver: Receiver<TimerCommand>, bus: Bus) {
    let mut schedule: BTreeMap<Instant, Vec<Entry>> = BTreeMap::new();

    log::debug!(target: "timer", "Timer thread started");
    loop {
        let now = Instant::now();
        let command = match schedule.keys().next().copied() {
            Some(deadline) => receiver.recv_timeout(deadline.saturating_duration_since(now)),
            None => receiver.recv().map_err(|_| RecvTimeoutError::Disconnected),
        };

        match command {
            Ok(TimerCommand::Register { period, reaction }) => {
                schedule
                    .entry(Instant::now() + period)
                    .or_default()
                    .push(Entry { period, reaction });
            }
            Ok(TimerCommand::Shutdown) | Err(RecvTimeoutError::Disconnected) => {
                log::debug!(target: "timer", "Timer thread stopping");
                return;
            }
            Err(RecvTimeoutError::Timeout) => {}
        }

        // Dispatch everything that has come due, rescheduling live
        // bindings one period past their deadline.
        let now = Instant::now();
        let pending = schedule.split_off(&now);
        let due = std::mem::replace(&mut schedule, pending);

        for (deadline, entries) in due {
            for entry in entries {
                let Some(reaction) = entry.reaction.upgrade() else {
                    continue;
                };
                bus.dispatch_to(&reaction, Arc::new(Tick { scheduled: deadline }), false);
                schedule
                    .entry(deadline + entry.period)
                    .or_default()
                    .push(entry);
            }
        }
    }
}
