//! # Reactor Traits
//!
//! Narrow interfaces and shared vocabulary used across the reactor:
//!
//! - **Transport**: connect/accept/read/write/flush primitives and readiness
//! - **WireCodec**: message encode/decode
//! - **ReconnectionStrategy**: backoff between recovery attempts
//! - **CallbackReturn**: what application callbacks report back

pub mod callback;
pub mod codec;
pub mod error;
pub mod reconnect;
pub mod transport;

pub use callback::CallbackReturn;
pub use codec::{CodecError, ContainerType, DomainType, Msg, MsgClass, WireCodec};
pub use error::{ErrorCode, ErrorInfo, ReactorError, Result};
pub use reconnect::{ExponentialBackoff, NeverReconnect, ReconnectionStrategy};
pub use transport::{
    unpack_segments, Connector, FlushOutcome, InitProgress, Listener, ReadOutcome,
    ReadinessHandle, ReadinessNotifier, Transport, TransportBuffer, TransportError,
    WriteOutcome, PACKED_HEADER_LEN,
};
