//! Error taxonomy for the NIP-46 client core

use thiserror::Error;

/// Why a `bunker://` connection string was rejected
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("connection string is {len} bytes, longer than the {max} byte limit")]
    TooLong { len: usize, max: usize },
    #[error("connection string must start with bunker://")]
    InvalidScheme,
    #[error("connection string has nothing after bunker://")]
    Empty,
    #[error("remote signer identity must be 64 hex characters")]
    InvalidIdentity,
    #[error("invalid relay URL: {0}")]
    InvalidRelay(String),
    #[error("connection string must include at least one relay")]
    NoRelays,
    #[error("secret parameter is present but empty")]
    EmptySecret,
}

/// Errors surfaced by the session engine and the signer facade
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error("failed to decrypt envelope: {0}")]
    Decrypt(String),

    #[error("request `{method}` timed out")]
    Timeout { method: String },

    #[error("remote signer returned an error: {message}")]
    Remote { message: String },

    #[error("not connected to a remote signer")]
    NotConnected,

    #[error("session disconnected")]
    Disconnected,

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("relay transport error: {0}")]
    Transport(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("no stored session to restore")]
    NothingToRestore,
}

impl Error {
    pub(crate) fn timeout(method: &str) -> Self {
        Error::Timeout {
            method: method.to_string(),
        }
    }

    pub(crate) fn remote(message: impl Into<String>) -> Self {
        Error::Remote {
            message: message.into(),
        }
    }

    /// True for decrypt failures, the only error that moves cipher negotiation on
    pub fn is_decrypt(&self) -> bool {
        matches!(self, Error::Decrypt(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Protocol(e.to_string())
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
