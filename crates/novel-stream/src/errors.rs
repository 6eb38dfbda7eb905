use crate::model::AgentRole;

/// Errors raised while opening or reading one streaming exchange.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExchangeError {
    /// Connection failure, read failure, or an unexpected close mid-frame.
    #[error("transport error: {message}")]
    Transport { message: String },
    /// Backend refused to open the exchange.
    #[error("backend error (status {status}): {message}")]
    Backend { status: u16, message: String },
    /// Internal sequencing problem (for example the exchange task vanished).
    #[error("protocol error: {message}")]
    Protocol { message: String },
}

impl ExchangeError {
    /// Creates a transport-level error.
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    /// Creates a protocol-level error.
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Returns the human-readable message for this error.
    pub fn message(&self) -> &str {
        match self {
            Self::Transport { message }
            | Self::Backend { message, .. }
            | Self::Protocol { message } => message,
        }
    }
}

/// A payload that could not be classified. Always recovered by skipping the
/// frame.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("malformed frame: {reason}")]
pub struct MalformedFrame {
    pub reason: String,
}

impl MalformedFrame {
    pub(crate) fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Synchronous rejection of `GenerationController::start`.
///
/// Nothing is sent to the backend when one of these is returned.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StartError {
    /// The role's slot is already generating.
    #[error("{role} is already running")]
    AlreadyRunning { role: AgentRole },
    /// The prerequisite role has no finalized artifact yet.
    #[error("{role} requires a {requires} artifact first")]
    MissingPrerequisite { role: AgentRole, requires: AgentRole },
}

/// Errors returned by the project store collaborator.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// Request could not be sent or the body could not be read.
    #[error("store transport error: {0}")]
    Transport(String),
    /// Store answered with a non-success status.
    #[error("store request failed with status {status}: {body}")]
    Status { status: u16, body: String },
    /// Response body did not match the expected shape.
    #[error("store decode error: {0}")]
    Decode(String),
    /// Requested record does not exist.
    #[error("not found: {0}")]
    NotFound(String),
}

/// Top-level error type for the public client API.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClientError {
    /// Invalid client configuration.
    #[error("config error: {0}")]
    Config(String),
    /// Generation was rejected before any network activity.
    #[error(transparent)]
    Start(#[from] StartError),
    /// A streaming exchange failed outside the ledger (open or task loss).
    #[error(transparent)]
    Exchange(#[from] ExchangeError),
    /// A store call failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}
