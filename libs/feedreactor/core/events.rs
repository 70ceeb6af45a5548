//! Events delivered to application callbacks

use crate::core::channel::ChannelId;
use crate::rdm::{DictionaryMsg, DirectoryMsg, LoginMsg};
use crate::traits::codec::Msg;
use crate::traits::error::ErrorInfo;
use crate::traits::transport::ReadinessHandle;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelEventType {
    ChannelOpened,
    ChannelUp,
    ChannelReady,
    ChannelDown,
    ChannelDownReconnecting,
    FdChange,
    Warning,
    PreferredHostStartingFallback,
    PreferredHostComplete,
}

impl fmt::Display for ChannelEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChannelEventType::ChannelOpened => "CHANNEL_OPENED",
            ChannelEventType::ChannelUp => "CHANNEL_UP",
            ChannelEventType::ChannelReady => "CHANNEL_READY",
            ChannelEventType::ChannelDown => "CHANNEL_DOWN",
            ChannelEventType::ChannelDownReconnecting => "CHANNEL_DOWN_RECONNECTING",
            ChannelEventType::FdChange => "FD_CHANGE",
            ChannelEventType::Warning => "WARNING",
            ChannelEventType::PreferredHostStartingFallback => "PREFERRED_HOST_STARTING_FALLBACK",
            ChannelEventType::PreferredHostComplete => "PREFERRED_HOST_COMPLETE",
        };
        f.write_str(name)
    }
}

/// Lifecycle notification for one channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelEvent {
    pub event_type: ChannelEventType,
    pub channel: ChannelId,
    pub error: Option<ErrorInfo>,
    /// Set on FD_CHANGE: the handle that was replaced
    pub old_handle: Option<ReadinessHandle>,
    /// Set on FD_CHANGE: the handle now in use
    pub new_handle: Option<ReadinessHandle>,
}

impl ChannelEvent {
    pub fn new(event_type: ChannelEventType, channel: ChannelId) -> Self {
        Self {
            event_type,
            channel,
            error: None,
            old_handle: None,
            new_handle: None,
        }
    }

    pub fn with_error(mut self, error: ErrorInfo) -> Self {
        self.error = Some(error);
        self
    }

    pub fn fd_change(channel: ChannelId, old: ReadinessHandle, new: ReadinessHandle) -> Self {
        Self {
            old_handle: Some(old),
            new_handle: Some(new),
            ..Self::new(ChannelEventType::FdChange, channel)
        }
    }
}

/// An inbound message
#[derive(Debug, Clone, PartialEq)]
pub struct MsgEvent {
    pub channel: ChannelId,
    pub msg: Msg,
    /// Encoded bytes as read from the transport
    pub raw: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LoginMsgEvent {
    pub base: MsgEvent,
    pub login: LoginMsg,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DirectoryMsgEvent {
    pub base: MsgEvent,
    pub directory: DirectoryMsg,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DictionaryMsgEvent {
    pub base: MsgEvent,
    pub dictionary: DictionaryMsg,
}
