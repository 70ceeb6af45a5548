//! Wire codec interface
//!
//! The reactor only needs a message's class, domain, stream id and a few
//! header flags to orchestrate session setup. Bodies stay opaque JSON values
//! that the `rdm` module interprets for the control domains.

use crate::traits::error::ReactorError;
use crate::traits::transport::{TransportBuffer, TransportError};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while encoding or decoding messages
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("Message truncated: {len} bytes, header needs {needed}")]
    Truncated { len: usize, needed: usize },

    #[error("Invalid header field {field}: {value}")]
    InvalidHeader { field: &'static str, value: u8 },

    #[error("Body error: {0}")]
    Body(String),

    #[error("Encoded message needs {needed} bytes, buffer holds {capacity}")]
    BufferTooSmall { needed: usize, capacity: usize },

    #[error("Unexpected message: {0}")]
    Unexpected(String),
}

impl From<CodecError> for ReactorError {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::BufferTooSmall { needed, .. } => ReactorError::BufferTooSmall(needed),
            other => ReactorError::Codec(other.to_string()),
        }
    }
}

impl From<TransportError> for CodecError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::BufferTooSmall { needed, capacity } => {
                CodecError::BufferTooSmall { needed, capacity }
            }
            other => CodecError::Body(other.to_string()),
        }
    }
}

/// Message class carried in every header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum MsgClass {
    Request = 1,
    Refresh = 2,
    Status = 3,
    Update = 4,
    Close = 5,
    Ack = 6,
    Generic = 7,
    Post = 8,
}

impl MsgClass {
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            1 => MsgClass::Request,
            2 => MsgClass::Refresh,
            3 => MsgClass::Status,
            4 => MsgClass::Update,
            5 => MsgClass::Close,
            6 => MsgClass::Ack,
            7 => MsgClass::Generic,
            8 => MsgClass::Post,
            _ => return None,
        })
    }
}

/// Domain of a message; the first three are handled by the reactor itself
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DomainType {
    Login,
    Source,
    Dictionary,
    MarketPrice,
    MarketByOrder,
    MarketByPrice,
    SymbolList,
    Other(u8),
}

impl DomainType {
    pub fn to_u8(self) -> u8 {
        match self {
            DomainType::Login => 1,
            DomainType::Source => 4,
            DomainType::Dictionary => 5,
            DomainType::MarketPrice => 6,
            DomainType::MarketByOrder => 7,
            DomainType::MarketByPrice => 8,
            DomainType::SymbolList => 10,
            DomainType::Other(value) => value,
        }
    }

    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => DomainType::Login,
            4 => DomainType::Source,
            5 => DomainType::Dictionary,
            6 => DomainType::MarketPrice,
            7 => DomainType::MarketByOrder,
            8 => DomainType::MarketByPrice,
            10 => DomainType::SymbolList,
            other => DomainType::Other(other),
        }
    }

    /// Login, directory and dictionary traffic
    pub fn is_session_domain(self) -> bool {
        matches!(
            self,
            DomainType::Login | DomainType::Source | DomainType::Dictionary
        )
    }
}

/// Shape of the message body
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ContainerType {
    NoData = 0,
    ElementList = 1,
    FieldList = 2,
    Map = 3,
    Opaque = 4,
}

impl ContainerType {
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0 => ContainerType::NoData,
            1 => ContainerType::ElementList,
            2 => ContainerType::FieldList,
            3 => ContainerType::Map,
            4 => ContainerType::Opaque,
            _ => return None,
        })
    }
}

/// A decoded message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Msg {
    pub msg_class: MsgClass,
    pub domain: DomainType,
    pub stream_id: i32,
    pub container: ContainerType,
    /// Service the message addresses, when set
    pub service_id: Option<u16>,
    /// Final part of a (possibly multi-part) refresh
    pub complete: bool,
    pub body: serde_json::Value,
}

impl Msg {
    pub fn new(msg_class: MsgClass, domain: DomainType, stream_id: i32) -> Self {
        Self {
            msg_class,
            domain,
            stream_id,
            container: ContainerType::NoData,
            service_id: None,
            complete: true,
            body: serde_json::Value::Null,
        }
    }

    pub fn with_body(mut self, container: ContainerType, body: serde_json::Value) -> Self {
        self.container = container;
        self.body = body;
        self
    }

    pub fn with_service(mut self, service_id: u16) -> Self {
        self.service_id = Some(service_id);
        self
    }

    pub fn with_complete(mut self, complete: bool) -> Self {
        self.complete = complete;
        self
    }
}

/// Message encoder/decoder consumed by the reactor
pub trait WireCodec: Send + Sync {
    fn decode(&self, bytes: &[u8]) -> Result<Msg, CodecError>;

    /// Encode into `buffer`; fails with [`CodecError::BufferTooSmall`] when
    /// the message does not fit
    fn encode(&self, msg: &Msg, buffer: &mut TransportBuffer) -> Result<(), CodecError>;

    /// Initial buffer size to request for `msg`
    fn encoded_size_hint(&self, msg: &Msg) -> usize;
}
