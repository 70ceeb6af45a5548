//! Session control records
//!
//! The minimal login, directory and dictionary shapes the reactor needs to
//! drive session setup. Bodies travel as JSON values inside [`Msg`]; the
//! stream id, service id and refresh-complete flag come from the header.

use crate::traits::codec::{CodecError, ContainerType, DomainType, Msg, MsgClass};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

pub const LOGIN_STREAM_ID: i32 = 1;
pub const DIRECTORY_STREAM_ID: i32 = 2;
pub const FIELD_DICTIONARY_STREAM_ID: i32 = 3;
pub const ENUM_DICTIONARY_STREAM_ID: i32 = 4;

pub const DEFAULT_FIELD_DICTIONARY_NAME: &str = "RWFFld";
pub const DEFAULT_ENUM_DICTIONARY_NAME: &str = "RWFEnum";

/// Directory filter requesting info, state and group data
pub const DEFAULT_DIRECTORY_FILTER: u32 = 0x07;

/// Dictionary verbosity used for automatic downloads
pub const DICTIONARY_VERBOSITY_NORMAL: u32 = 0x07;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamStateCode {
    Open,
    NonStreaming,
    ClosedRecover,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataStateCode {
    Ok,
    Suspect,
}

/// Stream and data state of a refresh or status
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct State {
    pub stream: StreamStateCode,
    pub data: DataStateCode,
    #[serde(default)]
    pub text: String,
}

impl State {
    pub fn open_ok() -> Self {
        Self {
            stream: StreamStateCode::Open,
            data: DataStateCode::Ok,
            text: String::new(),
        }
    }

    pub fn closed(text: impl Into<String>) -> Self {
        Self {
            stream: StreamStateCode::Closed,
            data: DataStateCode::Suspect,
            text: text.into(),
        }
    }

    pub fn is_open_ok(&self) -> bool {
        self.stream == StreamStateCode::Open && self.data == DataStateCode::Ok
    }

    pub fn is_closed(&self) -> bool {
        matches!(
            self.stream,
            StreamStateCode::Closed | StreamStateCode::ClosedRecover
        )
    }
}

/// True when an inbound message ends its stream: a close, or a refresh or
/// status whose `state` is closed
pub fn ends_stream(msg: &Msg) -> bool {
    match msg.msg_class {
        MsgClass::Close => true,
        MsgClass::Refresh | MsgClass::Status => msg
            .body
            .get("state")
            .and_then(|state| State::deserialize(state).ok())
            .map_or(false, |state| state.is_closed()),
        _ => false,
    }
}

fn body_of<T: Serialize>(value: &T) -> Result<serde_json::Value, CodecError> {
    serde_json::to_value(value).map_err(|e| CodecError::Body(e.to_string()))
}

fn parse_body<T: DeserializeOwned>(msg: &Msg) -> Result<T, CodecError> {
    serde_json::from_value(msg.body.clone()).map_err(|e| CodecError::Body(e.to_string()))
}

// ---------------------------------------------------------------------------
// Login
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginRequest {
    #[serde(skip, default)]
    pub stream_id: i32,
    pub user_name: String,
    #[serde(default)]
    pub application_name: String,
    #[serde(default)]
    pub position: String,
    /// Ask the provider to send round trip latency messages
    #[serde(default)]
    pub supports_rtt: bool,
}

impl LoginRequest {
    pub fn new(user_name: impl Into<String>) -> Self {
        Self {
            stream_id: LOGIN_STREAM_ID,
            user_name: user_name.into(),
            application_name: String::new(),
            position: String::new(),
            supports_rtt: false,
        }
    }

    pub fn with_rtt(mut self) -> Self {
        self.supports_rtt = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginRefresh {
    #[serde(skip, default)]
    pub stream_id: i32,
    pub user_name: String,
    pub state: State,
    #[serde(default = "default_true")]
    pub solicited: bool,
    #[serde(default)]
    pub supports_rtt: bool,
}

fn default_true() -> bool {
    true
}

impl LoginRefresh {
    pub fn accepted(user_name: impl Into<String>) -> Self {
        Self {
            stream_id: LOGIN_STREAM_ID,
            user_name: user_name.into(),
            state: State::open_ok(),
            solicited: true,
            supports_rtt: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginStatus {
    #[serde(skip, default)]
    pub stream_id: i32,
    pub state: State,
}

/// Round trip latency message carried as a generic message on the login stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginRtt {
    #[serde(skip, default)]
    pub stream_id: i32,
    pub ticks: u64,
    #[serde(default)]
    pub last_latency_micros: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginMsg {
    Request(LoginRequest),
    Refresh(LoginRefresh),
    Status(LoginStatus),
    Rtt(LoginRtt),
    Close { stream_id: i32 },
}

impl LoginMsg {
    pub fn stream_id(&self) -> i32 {
        match self {
            LoginMsg::Request(m) => m.stream_id,
            LoginMsg::Refresh(m) => m.stream_id,
            LoginMsg::Status(m) => m.stream_id,
            LoginMsg::Rtt(m) => m.stream_id,
            LoginMsg::Close { stream_id } => *stream_id,
        }
    }

    /// Generic element-list message on the login domain
    pub fn is_rtt(msg: &Msg) -> bool {
        msg.domain == DomainType::Login
            && msg.msg_class == MsgClass::Generic
            && msg.container == ContainerType::ElementList
    }

    pub fn from_msg(msg: &Msg) -> Result<Self, CodecError> {
        let stream_id = msg.stream_id;
        Ok(match msg.msg_class {
            MsgClass::Request => LoginMsg::Request(LoginRequest {
                stream_id,
                ..parse_body(msg)?
            }),
            MsgClass::Refresh => LoginMsg::Refresh(LoginRefresh {
                stream_id,
                ..parse_body(msg)?
            }),
            MsgClass::Status => LoginMsg::Status(LoginStatus {
                stream_id,
                ..parse_body(msg)?
            }),
            MsgClass::Close => LoginMsg::Close { stream_id },
            MsgClass::Generic if Self::is_rtt(msg) => LoginMsg::Rtt(LoginRtt {
                stream_id,
                ..parse_body(msg)?
            }),
            other => {
                return Err(CodecError::Unexpected(format!(
                    "{:?} message on login domain",
                    other
                )))
            }
        })
    }

    pub fn to_msg(&self) -> Result<Msg, CodecError> {
        let stream_id = self.stream_id();
        let msg = match self {
            LoginMsg::Request(m) => Msg::new(MsgClass::Request, DomainType::Login, stream_id)
                .with_body(ContainerType::ElementList, body_of(m)?),
            LoginMsg::Refresh(m) => Msg::new(MsgClass::Refresh, DomainType::Login, stream_id)
                .with_body(ContainerType::ElementList, body_of(m)?),
            LoginMsg::Status(m) => Msg::new(MsgClass::Status, DomainType::Login, stream_id)
                .with_body(ContainerType::ElementList, body_of(m)?),
            LoginMsg::Rtt(m) => Msg::new(MsgClass::Generic, DomainType::Login, stream_id)
                .with_body(ContainerType::ElementList, body_of(m)?),
            LoginMsg::Close { .. } => Msg::new(MsgClass::Close, DomainType::Login, stream_id),
        };
        Ok(msg)
    }
}

// ---------------------------------------------------------------------------
// Directory
// ---------------------------------------------------------------------------

/// One service as advertised in the source directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceInfo {
    pub service_id: u16,
    pub name: String,
    #[serde(default)]
    pub dictionaries_provided: Vec<String>,
    #[serde(default = "default_true")]
    pub accepting_requests: bool,
}

impl ServiceInfo {
    pub fn new(service_id: u16, name: impl Into<String>) -> Self {
        Self {
            service_id,
            name: name.into(),
            dictionaries_provided: Vec::new(),
            accepting_requests: true,
        }
    }

    pub fn with_dictionaries(mut self, names: &[&str]) -> Self {
        self.dictionaries_provided = names.iter().map(|n| n.to_string()).collect();
        self
    }

    pub fn provides(&self, dictionary_name: &str) -> bool {
        self.dictionaries_provided.iter().any(|d| d == dictionary_name)
    }
}

/// First service that provides both dictionaries
pub fn find_dictionary_service(
    services: &[ServiceInfo],
    field_dictionary_name: &str,
    enum_dictionary_name: &str,
) -> Option<u16> {
    services
        .iter()
        .find(|s| s.provides(field_dictionary_name) && s.provides(enum_dictionary_name))
        .map(|s| s.service_id)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryRequest {
    #[serde(skip, default)]
    pub stream_id: i32,
    #[serde(default)]
    pub service_id: Option<u16>,
    pub filter: u32,
}

impl Default for DirectoryRequest {
    fn default() -> Self {
        Self {
            stream_id: DIRECTORY_STREAM_ID,
            service_id: None,
            filter: DEFAULT_DIRECTORY_FILTER,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryRefresh {
    #[serde(skip, default)]
    pub stream_id: i32,
    pub state: State,
    #[serde(default)]
    pub services: Vec<ServiceInfo>,
    #[serde(default = "default_true")]
    pub solicited: bool,
}

impl DirectoryRefresh {
    pub fn new(services: Vec<ServiceInfo>) -> Self {
        Self {
            stream_id: DIRECTORY_STREAM_ID,
            state: State::open_ok(),
            services,
            solicited: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryUpdate {
    #[serde(skip, default)]
    pub stream_id: i32,
    #[serde(default)]
    pub services: Vec<ServiceInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryStatus {
    #[serde(skip, default)]
    pub stream_id: i32,
    pub state: State,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirectoryMsg {
    Request(DirectoryRequest),
    Refresh(DirectoryRefresh),
    Update(DirectoryUpdate),
    Status(DirectoryStatus),
    Close { stream_id: i32 },
}

impl DirectoryMsg {
    pub fn stream_id(&self) -> i32 {
        match self {
            DirectoryMsg::Request(m) => m.stream_id,
            DirectoryMsg::Refresh(m) => m.stream_id,
            DirectoryMsg::Update(m) => m.stream_id,
            DirectoryMsg::Status(m) => m.stream_id,
            DirectoryMsg::Close { stream_id } => *stream_id,
        }
    }

    pub fn from_msg(msg: &Msg) -> Result<Self, CodecError> {
        let stream_id = msg.stream_id;
        Ok(match msg.msg_class {
            MsgClass::Request => DirectoryMsg::Request(DirectoryRequest {
                stream_id,
                ..parse_body(msg)?
            }),
            MsgClass::Refresh => DirectoryMsg::Refresh(DirectoryRefresh {
                stream_id,
                ..parse_body(msg)?
            }),
            MsgClass::Update => DirectoryMsg::Update(DirectoryUpdate {
                stream_id,
                ..parse_body(msg)?
            }),
            MsgClass::Status => DirectoryMsg::Status(DirectoryStatus {
                stream_id,
                ..parse_body(msg)?
            }),
            MsgClass::Close => DirectoryMsg::Close { stream_id },
            other => {
                return Err(CodecError::Unexpected(format!(
                    "{:?} message on directory domain",
                    other
                )))
            }
        })
    }

    pub fn to_msg(&self) -> Result<Msg, CodecError> {
        let stream_id = self.stream_id();
        let msg = match self {
            DirectoryMsg::Request(m) => {
                let msg = Msg::new(MsgClass::Request, DomainType::Source, stream_id)
                    .with_body(ContainerType::ElementList, body_of(m)?);
                match m.service_id {
                    Some(id) => msg.with_service(id),
                    None => msg,
                }
            }
            DirectoryMsg::Refresh(m) => Msg::new(MsgClass::Refresh, DomainType::Source, stream_id)
                .with_body(ContainerType::Map, body_of(m)?),
            DirectoryMsg::Update(m) => Msg::new(MsgClass::Update, DomainType::Source, stream_id)
                .with_body(ContainerType::Map, body_of(m)?),
            DirectoryMsg::Status(m) => Msg::new(MsgClass::Status, DomainType::Source, stream_id)
                .with_body(ContainerType::ElementList, body_of(m)?),
            DirectoryMsg::Close { .. } => Msg::new(MsgClass::Close, DomainType::Source, stream_id),
        };
        Ok(msg)
    }
}

// ---------------------------------------------------------------------------
// Dictionary
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DictionaryType {
    FieldDefinitions,
    EnumTables,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DictionaryRequest {
    #[serde(skip, default)]
    pub stream_id: i32,
    #[serde(skip, default)]
    pub service_id: u16,
    pub name: String,
    pub verbosity: u32,
}

impl DictionaryRequest {
    pub fn new(stream_id: i32, service_id: u16, name: impl Into<String>) -> Self {
        Self {
            stream_id,
            service_id,
            name: name.into(),
            verbosity: DICTIONARY_VERBOSITY_NORMAL,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DictionaryRefresh {
    #[serde(skip, default)]
    pub stream_id: i32,
    #[serde(skip, default)]
    pub service_id: u16,
    /// Last part of a multi-part refresh
    #[serde(skip, default)]
    pub complete: bool,
    pub name: String,
    pub dictionary_type: DictionaryType,
    pub state: State,
    #[serde(default)]
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DictionaryStatus {
    #[serde(skip, default)]
    pub stream_id: i32,
    pub state: State,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DictionaryMsg {
    Request(DictionaryRequest),
    Refresh(DictionaryRefresh),
    Status(DictionaryStatus),
    Close { stream_id: i32 },
}

impl DictionaryMsg {
    pub fn stream_id(&self) -> i32 {
        match self {
            DictionaryMsg::Request(m) => m.stream_id,
            DictionaryMsg::Refresh(m) => m.stream_id,
            DictionaryMsg::Status(m) => m.stream_id,
            DictionaryMsg::Close { stream_id } => *stream_id,
        }
    }

    pub fn from_msg(msg: &Msg) -> Result<Self, CodecError> {
        let stream_id = msg.stream_id;
        let service_id = msg.service_id.unwrap_or_default();
        Ok(match msg.msg_class {
            MsgClass::Request => DictionaryMsg::Request(DictionaryRequest {
                stream_id,
                service_id,
                ..parse_body(msg)?
            }),
            MsgClass::Refresh => DictionaryMsg::Refresh(DictionaryRefresh {
                stream_id,
                service_id,
                complete: msg.complete,
                ..parse_body(msg)?
            }),
            MsgClass::Status => DictionaryMsg::Status(DictionaryStatus {
                stream_id,
                ..parse_body(msg)?
            }),
            MsgClass::Close => DictionaryMsg::Close { stream_id },
            other => {
                return Err(CodecError::Unexpected(format!(
                    "{:?} message on dictionary domain",
                    other
                )))
            }
        })
    }

    pub fn to_msg(&self) -> Result<Msg, CodecError> {
        let stream_id = self.stream_id();
        let msg = match self {
            DictionaryMsg::Request(m) => {
                Msg::new(MsgClass::Request, DomainType::Dictionary, stream_id)
                    .with_body(ContainerType::ElementList, body_of(m)?)
                    .with_service(m.service_id)
            }
            DictionaryMsg::Refresh(m) => {
                Msg::new(MsgClass::Refresh, DomainType::Dictionary, stream_id)
                    .with_body(ContainerType::Opaque, body_of(m)?)
                    .with_service(m.service_id)
                    .with_complete(m.complete)
            }
            DictionaryMsg::Status(m) => Msg::new(MsgClass::Status, DomainType::Dictionary, stream_id)
                .with_body(ContainerType::ElementList, body_of(m)?),
            DictionaryMsg::Close { .. } => {
                Msg::new(MsgClass::Close, DomainType::Dictionary, stream_id)
            }
        };
        Ok(msg)
    }
}

/// Any session control record
#[derive(Debug, Clone, PartialEq)]
pub enum RdmMsg {
    Login(LoginMsg),
    Directory(DirectoryMsg),
    Dictionary(DictionaryMsg),
}

impl RdmMsg {
    pub fn to_msg(&self) -> Result<Msg, CodecError> {
        match self {
            RdmMsg::Login(m) => m.to_msg(),
            RdmMsg::Directory(m) => m.to_msg(),
            RdmMsg::Dictionary(m) => m.to_msg(),
        }
    }

    /// Interpret a decoded message of a session domain
    pub fn from_msg(msg: &Msg) -> Option<Result<Self, CodecError>> {
        match msg.domain {
            DomainType::Login => Some(LoginMsg::from_msg(msg).map(RdmMsg::Login)),
            DomainType::Source => Some(DirectoryMsg::from_msg(msg).map(RdmMsg::Directory)),
            DomainType::Dictionary => Some(DictionaryMsg::from_msg(msg).map(RdmMsg::Dictionary)),
            _ => None,
        }
    }
}
