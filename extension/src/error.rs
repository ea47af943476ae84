// Error taxonomy for the background session
//
// Boundary handlers convert everything into a ProviderError envelope or a log line.
// Nothing here is allowed to escape to the host dispatcher.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::host::PortId;

/// EIP-1193 provider error codes used on the dApp-facing channels
pub mod codes {
    pub const USER_REJECTED: i64 = 4001;
    pub const UNSUPPORTED_METHOD: i64 = 4200;
    pub const INTERNAL: i64 = -1;
}

/// Structured error carried in a RESPONSE envelope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderError {
    pub code: i64,
    pub message: String,
}

impl ProviderError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn unsupported(method: &str) -> Self {
        Self::new(
            codes::UNSUPPORTED_METHOD,
            format!("The requested method {method} is not supported by this Ethereum provider."),
        )
    }

    pub fn user_rejected() -> Self {
        Self::new(codes::USER_REJECTED, "User rejected the request.")
    }

    /// Internal failure; the message carries the originating error text
    pub fn internal(err: impl std::fmt::Display) -> Self {
        Self::new(codes::INTERNAL, err.to_string())
    }
}

impl std::fmt::Display for ProviderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "provider error {}: {}", self.code, self.message)
    }
}

/// The target port disappeared before a response could be delivered
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("port {port} is no longer connected")]
pub struct ChannelError {
    pub port: PortId,
}

/// Connect event carried a channel name we do not serve
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown channel name: {0:?}")]
pub struct ClassificationError(pub String);

/// Failure raised by the host platform (storage, windows, alarms...)
#[derive(Debug, Clone, Error)]
#[error("host call {call} failed: {message}")]
pub struct HostError {
    pub call: &'static str,
    pub message: String,
}

impl HostError {
    pub fn new(call: &'static str, message: impl Into<String>) -> Self {
        Self {
            call,
            message: message.into(),
        }
    }
}

/// Failure inside an idle/lock transition handler
#[derive(Debug, Error)]
pub enum TransitionError {
    #[error("lock alarm scheduling failed: {0}")]
    Alarm(#[source] HostError),
    #[error("lockdown failed: {0}")]
    Lockdown(#[source] HostError),
    #[error("transition side effect failed: {0}")]
    SideEffect(#[from] HostError),
}

/// Errors surfaced by session handlers before they reach the run loop
#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error(transparent)]
    Classification(#[from] ClassificationError),
    #[error(transparent)]
    Host(#[from] HostError),
    #[error("malformed message on {channel} channel: {source}")]
    Malformed {
        channel: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("message from unregistered port {0}")]
    UnknownPort(PortId),
}

pub type Result<T, E = SessionError> = std::result::Result<T, E>;
