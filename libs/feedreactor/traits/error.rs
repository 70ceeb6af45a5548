use std::fmt;
use thiserror::Error;

/// Main error type for feedreactor
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReactorError {
    /// A parameter was rejected before any state changed
    #[error("Invalid parameter: {0}")]
    ParameterInvalid(String),

    /// A numeric parameter was outside its permitted range
    #[error("Parameter out of range: {0}")]
    ParameterOutOfRange(String),

    /// The transport has no free output buffers; retry later
    #[error("No buffers available: {0}")]
    NoBuffers(String),

    /// The encoded message does not fit the supplied buffer
    #[error("Buffer too small: need more than {0} bytes")]
    BufferTooSmall(usize),

    /// Transport failure (reclassified as channel down)
    #[error("Transport error: {0}")]
    Transport(String),

    /// Handshake did not complete before the deadline
    #[error("Initialization timeout after {0} ms")]
    InitializationTimeout(u64),

    /// No inbound traffic within the ping timeout
    #[error("Ping timeout after {0} ms")]
    PingTimeout(u64),

    /// The worker queue rejected an event
    #[error("Worker queue failure: {0}")]
    WorkerQueue(String),

    /// The channel is down or closed and accepts no further work
    #[error("Channel is not active: {0}")]
    ChannelInert(String),

    /// No channel with this id belongs to the reactor
    #[error("Unknown channel: {0}")]
    UnknownChannel(u64),

    /// The reactor has been shut down
    #[error("Reactor is shut down")]
    Shutdown,

    /// Encoding or decoding failed
    #[error("Codec error: {0}")]
    Codec(String),

    /// An application callback returned FAILURE or an invalid code
    #[error("Callback failure at {location}: {reason}")]
    CallbackFailure { location: String, reason: String },
}

impl ReactorError {
    /// Short stable code for the error category
    pub fn code(&self) -> ErrorCode {
        match self {
            ReactorError::ParameterInvalid(_) => ErrorCode::ParameterInvalid,
            ReactorError::ParameterOutOfRange(_) => ErrorCode::ParameterOutOfRange,
            ReactorError::NoBuffers(_) => ErrorCode::NoBuffers,
            ReactorError::BufferTooSmall(_) => ErrorCode::BufferTooSmall,
            ReactorError::Transport(_) => ErrorCode::Failure,
            ReactorError::InitializationTimeout(_) => ErrorCode::Failure,
            ReactorError::PingTimeout(_) => ErrorCode::Failure,
            ReactorError::WorkerQueue(_) => ErrorCode::Failure,
            ReactorError::ChannelInert(_) => ErrorCode::Failure,
            ReactorError::UnknownChannel(_) => ErrorCode::ParameterInvalid,
            ReactorError::Shutdown => ErrorCode::Shutdown,
            ReactorError::Codec(_) => ErrorCode::Failure,
            ReactorError::CallbackFailure { .. } => ErrorCode::Failure,
        }
    }
}

/// Result type for feedreactor operations
pub type Result<T> = std::result::Result<T, ReactorError>;

/// Coarse status code carried by [`ErrorInfo`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Success,
    Failure,
    ParameterInvalid,
    ParameterOutOfRange,
    NoBuffers,
    BufferTooSmall,
    Shutdown,
}

/// Error details attached to asynchronous channel events
///
/// `location` names the reactor step that produced the condition, `text`
/// is the human readable cause.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorInfo {
    pub code: ErrorCode,
    pub location: String,
    pub text: String,
}

impl ErrorInfo {
    pub fn new(code: ErrorCode, location: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            code,
            location: location.into(),
            text: text.into(),
        }
    }

    pub fn failure(location: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(ErrorCode::Failure, location, text)
    }

    pub fn from_error(location: impl Into<String>, error: &ReactorError) -> Self {
        Self::new(error.code(), location, error.to_string())
    }
}

impl fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} at {}: {}", self.code, self.location, self.text)
    }
}
