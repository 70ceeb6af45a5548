//! Bidirectional reactor/worker queue
//!
//! Commands flow on a tokio unbounded channel so the worker can await them
//! next to its timers. Events flow on a crossbeam channel so the dispatch
//! thread can `select!` over them together with readiness notifications.
//! Both directions enqueue without blocking and report a closed peer.

use crate::traits::error::{ReactorError, Result};
use crate::worker::event::{WorkerCommand, WorkerEvent};
use crossbeam_channel::{Receiver, Sender};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

/// Reactor side of the queue
pub struct ReactorEnd {
    commands: UnboundedSender<WorkerCommand>,
    events: Receiver<WorkerEvent>,
}

/// Worker side of the queue
pub struct WorkerEnd {
    pub(crate) commands: UnboundedReceiver<WorkerCommand>,
    events: Sender<WorkerEvent>,
}

pub fn bidirectional() -> (ReactorEnd, WorkerEnd) {
    let (command_tx, command_rx) = unbounded_channel();
    let (event_tx, event_rx) = crossbeam_channel::unbounded();
    (
        ReactorEnd {
            commands: command_tx,
            events: event_rx,
        },
        WorkerEnd {
            commands: command_rx,
            events: event_tx,
        },
    )
}

impl ReactorEnd {
    /// Enqueue a command; fails once the worker has stopped
    pub fn send(&self, command: WorkerCommand) -> Result<()> {
        let name = command.name();
        self.commands
            .send(command)
            .map_err(|_| ReactorError::WorkerQueue(format!("worker is gone, {} dropped", name)))
    }

    pub fn events(&self) -> &Receiver<WorkerEvent> {
        &self.events
    }

    pub fn try_recv(&self) -> Option<WorkerEvent> {
        self.events.try_recv().ok()
    }
}

impl WorkerEnd {
    /// Post an event; returns false once the reactor side is gone
    pub fn post(&self, event: WorkerEvent) -> bool {
        self.events.send(event).is_ok()
    }
}
