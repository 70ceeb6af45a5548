//! Readiness registry
//!
//! Stands in for an OS selector. Transports signal through a
//! [`ReadinessNotifier`]; the registry maps live handles to channels and
//! drops notifications for handles whose registration was cancelled.

use crate::core::channel::ChannelId;
use crate::traits::transport::{ReadinessHandle, ReadinessNotifier};
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use std::collections::HashMap;
use tracing::debug;

pub struct ReadinessRegistry {
    tx: Sender<ReadinessHandle>,
    rx: Receiver<ReadinessHandle>,
    registrations: Mutex<HashMap<ReadinessHandle, ChannelId>>,
}

impl ReadinessRegistry {
    pub fn new() -> Self {
        let (tx, rx) = unbounded();
        Self {
            tx,
            rx,
            registrations: Mutex::new(HashMap::new()),
        }
    }

    /// Register interest in `handle` on behalf of `channel`
    pub fn register(&self, handle: ReadinessHandle, channel: ChannelId) -> ReadinessNotifier {
        self.registrations.lock().insert(handle, channel);
        debug!("Registered {} for channel {}", handle, channel);
        ReadinessNotifier::new(handle, self.tx.clone())
    }

    /// Cancel a registration; returns false if it was not registered
    pub fn cancel(&self, handle: ReadinessHandle) -> bool {
        let removed = self.registrations.lock().remove(&handle).is_some();
        if removed {
            debug!("Cancelled registration of {}", handle);
        }
        removed
    }

    pub fn is_registered(&self, handle: ReadinessHandle) -> bool {
        self.registrations.lock().contains_key(&handle)
    }

    pub fn channel_for(&self, handle: ReadinessHandle) -> Option<ChannelId> {
        self.registrations.lock().get(&handle).copied()
    }

    pub fn registered_handles(&self) -> Vec<ReadinessHandle> {
        let mut handles: Vec<_> = self.registrations.lock().keys().copied().collect();
        handles.sort();
        handles
    }

    /// Notification stream, used by the dispatch wait
    pub fn receiver(&self) -> &Receiver<ReadinessHandle> {
        &self.rx
    }

    /// Resolve a received notification, ignoring cancelled handles
    pub fn resolve(&self, handle: ReadinessHandle) -> Option<ChannelId> {
        self.channel_for(handle)
    }

    /// Drain pending notifications into the channels they belong to
    pub fn drain_ready(&self) -> Vec<ChannelId> {
        let mut ready = Vec::new();
        while let Ok(handle) = self.rx.try_recv() {
            if let Some(channel) = self.resolve(handle) {
                if !ready.contains(&channel) {
                    ready.push(channel);
                }
            }
        }
        ready
    }
}

impl Default for ReadinessRegistry {
    fn default() -> Self {
        Self::new()
    }
}
