//! Messages crossing the reactor/worker queue
//!
//! Every message names a channel and the connection epoch it refers to.
//! The reactor bumps the epoch on every connection attempt and discards
//! worker events from older epochs.

use crate::core::channel::ChannelId;
use crate::core::ping::PingTracker;
use crate::traits::error::ErrorInfo;
use crate::traits::transport::{ReadinessHandle, Transport};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Reactor to worker
pub enum WorkerCommand {
    /// Start the handshake of a fresh connection
    NewChannel {
        channel: ChannelId,
        epoch: u64,
        transport: Arc<dyn Transport>,
        init_timeout: Duration,
        ping: Arc<PingTracker>,
    },
    /// Bytes are pending on the transport
    FlushRequest { channel: ChannelId, epoch: u64 },
    /// The readiness handle of a connection was replaced
    FdChange {
        channel: ChannelId,
        epoch: u64,
        new_handle: ReadinessHandle,
    },
    /// Stop servicing the connection of a failed channel
    ChannelDown { channel: ChannelId },
    /// The application closed the channel; drop it and its timers
    ChannelClose { channel: ChannelId },
    /// Post `ReconnectTimerExpired` after `delay`
    ArmReconnect {
        channel: ChannelId,
        epoch: u64,
        delay: Duration,
    },
    /// Post `FallbackTimerExpired` after `delay`
    ArmFallback {
        channel: ChannelId,
        epoch: u64,
        delay: Duration,
    },
    Shutdown,
}

impl WorkerCommand {
    pub fn name(&self) -> &'static str {
        match self {
            WorkerCommand::NewChannel { .. } => "NewChannel",
            WorkerCommand::FlushRequest { .. } => "FlushRequest",
            WorkerCommand::FdChange { .. } => "FdChange",
            WorkerCommand::ChannelDown { .. } => "ChannelDown",
            WorkerCommand::ChannelClose { .. } => "ChannelClose",
            WorkerCommand::ArmReconnect { .. } => "ArmReconnect",
            WorkerCommand::ArmFallback { .. } => "ArmFallback",
            WorkerCommand::Shutdown => "Shutdown",
        }
    }
}

impl fmt::Debug for WorkerCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerCommand::NewChannel {
                channel,
                epoch,
                init_timeout,
                ..
            } => f
                .debug_struct("NewChannel")
                .field("channel", channel)
                .field("epoch", epoch)
                .field("init_timeout", init_timeout)
                .finish(),
            WorkerCommand::FlushRequest { channel, epoch } => f
                .debug_struct("FlushRequest")
                .field("channel", channel)
                .field("epoch", epoch)
                .finish(),
            WorkerCommand::FdChange {
                channel,
                epoch,
                new_handle,
            } => f
                .debug_struct("FdChange")
                .field("channel", channel)
                .field("epoch", epoch)
                .field("new_handle", new_handle)
                .finish(),
            WorkerCommand::ChannelDown { channel } => {
                f.debug_struct("ChannelDown").field("channel", channel).finish()
            }
            WorkerCommand::ChannelClose { channel } => {
                f.debug_struct("ChannelClose").field("channel", channel).finish()
            }
            WorkerCommand::ArmReconnect {
                channel,
                epoch,
                delay,
            } => f
                .debug_struct("ArmReconnect")
                .field("channel", channel)
                .field("epoch", epoch)
                .field("delay", delay)
                .finish(),
            WorkerCommand::ArmFallback {
                channel,
                epoch,
                delay,
            } => f
                .debug_struct("ArmFallback")
                .field("channel", channel)
                .field("epoch", epoch)
                .field("delay", delay)
                .finish(),
            WorkerCommand::Shutdown => f.write_str("Shutdown"),
        }
    }
}

/// Worker to reactor
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerEvent {
    /// Handshake finished
    ChannelUp {
        channel: ChannelId,
        epoch: u64,
        ping_timeout: Duration,
    },
    /// All pending bytes reached the wire
    FlushDone { channel: ChannelId, epoch: u64 },
    /// Nothing received within the ping timeout
    PingTimerExpired {
        channel: ChannelId,
        epoch: u64,
        timeout: Duration,
    },
    /// Handshake did not finish in time
    InitTimeout {
        channel: ChannelId,
        epoch: u64,
        timeout: Duration,
    },
    ReconnectTimerExpired { channel: ChannelId, epoch: u64 },
    FallbackTimerExpired { channel: ChannelId, epoch: u64 },
    /// Transport failure while handshaking, flushing or pinging
    ChannelDown {
        channel: ChannelId,
        epoch: u64,
        error: ErrorInfo,
    },
}

impl WorkerEvent {
    pub fn channel(&self) -> ChannelId {
        match self {
            WorkerEvent::ChannelUp { channel, .. }
            | WorkerEvent::FlushDone { channel, .. }
            | WorkerEvent::PingTimerExpired { channel, .. }
            | WorkerEvent::InitTimeout { channel, .. }
            | WorkerEvent::ReconnectTimerExpired { channel, .. }
            | WorkerEvent::FallbackTimerExpired { channel, .. }
            | WorkerEvent::ChannelDown { channel, .. } => *channel,
        }
    }

    pub fn epoch(&self) -> u64 {
        match self {
            WorkerEvent::ChannelUp { epoch, .. }
            | WorkerEvent::FlushDone { epoch, .. }
            | WorkerEvent::PingTimerExpired { epoch, .. }
            | WorkerEvent::InitTimeout { epoch, .. }
            | WorkerEvent::ReconnectTimerExpired { epoch, .. }
            | WorkerEvent::FallbackTimerExpired { epoch, .. }
            | WorkerEvent::ChannelDown { epoch, .. } => *epoch,
        }
    }
}
