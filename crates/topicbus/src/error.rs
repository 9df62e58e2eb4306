use thiserror::Error;

/// Errors returned by publishers, subscribers and the codec.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid channel name '{name}': {reason}")]
    InvalidChannelName { name: String, reason: String },

    #[error("address already in use: {0}")]
    AddressInUse(String),

    #[error("no reachable publisher at {0}")]
    ConnectionUnavailable(String),

    #[error("send failed: {0}")]
    SendFailed(String),

    #[error("malformed frame: {0}")]
    MalformedFrame(&'static str),

    #[error("topic is {len} bytes, limit is {max}")]
    TopicTooLong { len: usize, max: usize },

    #[error("frame is {len} bytes, limit is {max}")]
    FrameTooLarge { len: usize, max: usize },

    #[error("dispatch loop already running")]
    LoopAlreadyRunning,

    /// `receive` was called while a dispatch loop owns the inbox.
    #[error("dispatch loop is active on this subscriber")]
    LoopActive,

    #[error("endpoint is closed")]
    Closed,

    #[error("failed to start I/O runtime: {0}")]
    Runtime(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn invalid_channel(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidChannelName {
            name: name.into(),
            reason: reason.into(),
        }
    }

    pub fn send_failed(message: impl Into<String>) -> Self {
        Self::SendFailed(message.into())
    }

    /// Construction-time errors are fatal to the instance that raised them.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::InvalidChannelName { .. }
                | Self::AddressInUse(_)
                | Self::ConnectionUnavailable(_)
                | Self::Runtime(_)
        )
    }
}

/// Error type returned by message handlers. Reported, never propagated.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

pub type Result<T> = std::result::Result<T, Error>;
