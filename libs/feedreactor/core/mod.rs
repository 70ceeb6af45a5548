//! # Reactor Core
//!
//! The reactor, its channels and the dispatch/submit paths.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                 Reactor (application thread)              │
//! │   connect/accept ─ dispatch ─ submit ─ close ─ shutdown   │
//! │        │               ▲          │                       │
//! │        │               │ events   │ flush requests        │
//! │        ▼               │          ▼                       │
//! │  ┌────────────────────────────────────────────────────┐   │
//! │  │            Worker (background thread)              │   │
//! │  │   handshakes ─ flushes ─ pings ─ timers            │   │
//! │  └────────────────────────────────────────────────────┘   │
//! └──────────────────────────────────────────────────────────┘
//! ```

pub mod channel;
pub mod config;
mod dispatch;
pub mod events;
pub mod ping;
pub mod reactor;
pub mod readiness;
pub mod state;
pub mod submit;

pub use channel::{ChannelId, ChannelInfo, ChannelStats};
pub use config::{
    AcceptOptions, ConfigError, ConnectOptions, ConnectionTarget, DispatchOptions,
    PreferredHostOptions, ReactorConfig, ReactorOptions, SubmitOptions, WarmStandbyGroup,
};
pub use events::{
    ChannelEvent, ChannelEventType, DictionaryMsgEvent, DirectoryMsgEvent, LoginMsgEvent, MsgEvent,
};
pub use ping::PingTracker;
pub use reactor::{CallbackContext, Reactor};
pub use readiness::ReadinessRegistry;
pub use state::ChannelState;
pub use submit::{Payload, SubmitStatus};
