//! Channel lifecycle states

use std::fmt;

/// Lifecycle of a reactor channel
///
/// ```text
/// Opened -> Initializing -> Up -> Ready
///              ^             |      |
///              |             v      v
///              +--- DownReconnecting / Down -> Closed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelState {
    /// Target resolved and transport created, handshake not started
    Opened,
    /// Handshake delegated to the worker
    Initializing,
    /// Handshake done, session setup in progress
    Up,
    /// Session established; application traffic flows
    Ready,
    /// Failed; a reconnection attempt is scheduled
    DownReconnecting,
    /// Failed for good
    Down,
    /// Closed by the application or by shutdown
    Closed,
}

impl ChannelState {
    /// States in which the transport is usable for reads and writes
    pub fn is_active(self) -> bool {
        matches!(self, ChannelState::Up | ChannelState::Ready)
    }

    /// No further events will be produced
    pub fn is_terminal(self) -> bool {
        matches!(self, ChannelState::Down | ChannelState::Closed)
    }

    /// Whether a failure in this state still needs down processing
    pub fn can_go_down(self) -> bool {
        matches!(
            self,
            ChannelState::Opened
                | ChannelState::Initializing
                | ChannelState::Up
                | ChannelState::Ready
        )
    }

    /// Valid lifecycle transitions
    pub fn can_transition_to(self, next: ChannelState) -> bool {
        use ChannelState::*;
        match (self, next) {
            (_, Closed) => self != Closed,
            (Opened, Initializing) => true,
            (Initializing, Up) => true,
            (Up, Ready) => true,
            (DownReconnecting, Initializing) => true,
            // Preferred host fallback drops the live connection quietly
            (Up, Initializing) | (Ready, Initializing) => true,
            // Scheduling the next attempt failed
            (DownReconnecting, Down) => true,
            (from, DownReconnecting) | (from, Down) => from.can_go_down(),
            _ => false,
        }
    }
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChannelState::Opened => "OPENED",
            ChannelState::Initializing => "INITIALIZING",
            ChannelState::Up => "UP",
            ChannelState::Ready => "READY",
            ChannelState::DownReconnecting => "DOWN_RECONNECTING",
            ChannelState::Down => "DOWN",
            ChannelState::Closed => "CLOSED",
        };
        f.write_str(name)
    }
}
