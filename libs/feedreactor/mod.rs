//! # FeedReactor
//!
//! A connection reactor for binary market data sessions.
//!
//! ## Features
//!
//! - **Single dispatch thread**: every application callback runs on the thread
//!   that calls `dispatch`, one at a time
//! - **Background worker**: handshakes, flushes, pings and timers run off the
//!   dispatch thread and report back through a queue
//! - **Session setup**: login, directory and dictionary exchanges drive each
//!   channel from UP to READY
//! - **Failover**: backoff reconnection, connection lists, warm standby groups,
//!   preferred host fallback and replay of open requests
//! - **Pluggable transports and codecs**: anything implementing `Transport`
//!   and `WireCodec` can be driven

pub mod codec;
pub mod core;
pub mod failover;
pub mod rdm;
pub mod session;
pub mod traits;
pub mod transport;
pub mod worker;

// Re-export all traits
pub use traits::*;

pub use crate::core::{
    AcceptOptions, CallbackContext, ChannelEvent, ChannelEventType, ChannelId, ChannelInfo,
    ChannelState, ChannelStats, ConfigError, ConnectOptions, ConnectionTarget,
    DictionaryMsgEvent, DirectoryMsgEvent, DispatchOptions, LoginMsgEvent, MsgEvent, Payload,
    PreferredHostOptions, Reactor, ReactorConfig, ReactorOptions, SubmitOptions, SubmitStatus,
    WarmStandbyGroup,
};
pub use codec::JsonFrameCodec;
pub use failover::TargetOrigin;
pub use session::{DictionaryDownloadMode, Role, RoleKind};
pub use transport::{Congestion, LoopbackConfig, LoopbackListener, LoopbackNetwork, LoopbackTransport};
