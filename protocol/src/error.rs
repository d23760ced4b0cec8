//! # Relay Error Taxonomy
//!
//! Domain errors that cross the wire. Every variant maps to a stable numeric
//! code which the server puts into [`RelayResponse::error_code`] so a remote
//! caller can branch on it without parsing messages.
//!
//! | Code  | Variant                 | Meaning                                   |
//! |-------|-------------------------|-------------------------------------------|
//! | 10001 | `Unknown`               | Unclassified fallback                     |
//! | 10002 | `MailboxWrite`          | The mailbox store rejected a write        |
//! | 20001 | `ClientInternal`        | Local client-side fault                   |
//! | 30001 | `ServerInternal`        | Unclassified server-side fault            |
//! | 30002 | `DataNotReady`          | Reserved, never returned by recv          |
//! | 30003 | `NoAvailableConnection` | No trusted endpoint for the receiver      |
//!
//! [`RelayResponse::error_code`]: crate::rpc::RelayResponse::error_code

use std::fmt;

use serde::{Deserialize, Serialize};

/// Numeric error codes carried in error-shaped responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u32", try_from = "u32")]
pub enum ErrorCode {
    Unknown,
    MailboxWrite,
    ClientInternal,
    ServerInternal,
    DataNotReady,
    NoAvailableConnection,
}

impl ErrorCode {
    /// The wire value of this code.
    pub const fn as_u32(self) -> u32 {
        match self {
            Self::Unknown => 10001,
            Self::MailboxWrite => 10002,
            Self::ClientInternal => 20001,
            Self::ServerInternal => 30001,
            Self::DataNotReady => 30002,
            Self::NoAvailableConnection => 30003,
        }
    }

    /// Short label used in logs and metrics.
    pub const fn label(self) -> &'static str {
        match self {
            Self::Unknown => "unknown error",
            Self::MailboxWrite => "mailbox error",
            Self::ClientInternal => "client internal error",
            Self::ServerInternal => "server internal error",
            Self::DataNotReady => "server data not ready",
            Self::NoAvailableConnection => "server has no available connection",
        }
    }
}

impl From<ErrorCode> for u32 {
    fn from(code: ErrorCode) -> Self {
        code.as_u32()
    }
}

impl TryFrom<u32> for ErrorCode {
    type Error = String;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            10001 => Ok(Self::Unknown),
            10002 => Ok(Self::MailboxWrite),
            20001 => Ok(Self::ClientInternal),
            30001 => Ok(Self::ServerInternal),
            30002 => Ok(Self::DataNotReady),
            30003 => Ok(Self::NoAvailableConnection),
            other => Err(format!("unknown error code: {}", other)),
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_u32())
    }
}

// ---------------------------------------------------------------------------
// RelayError
// ---------------------------------------------------------------------------

/// A domain error raised inside the relay.
///
/// The payload string is the detail (message id, receiver id, underlying
/// cause); `Display` prefixes it with the code's label.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RelayError {
    #[error("unknown error: {0}")]
    Unknown(String),

    #[error("mailbox error: {0}")]
    MailboxWrite(String),

    #[error("client internal error: {0}")]
    ClientInternal(String),

    #[error("server internal error: {0}")]
    ServerInternal(String),

    #[error("server data not ready: {0}")]
    DataNotReady(String),

    #[error("server has no available connection: {0}")]
    NoAvailableConnection(String),
}

impl RelayError {
    /// The wire code for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Unknown(_) => ErrorCode::Unknown,
            Self::MailboxWrite(_) => ErrorCode::MailboxWrite,
            Self::ClientInternal(_) => ErrorCode::ClientInternal,
            Self::ServerInternal(_) => ErrorCode::ServerInternal,
            Self::DataNotReady(_) => ErrorCode::DataNotReady,
            Self::NoAvailableConnection(_) => ErrorCode::NoAvailableConnection,
        }
    }

    /// Rebuilds an error from a code/message pair received over the wire.
    ///
    /// Senders put the full `Display` form on the wire, so a leading
    /// `"<label>: "` is stripped to keep `Display` from repeating it.
    pub fn from_wire(code: u32, message: impl Into<String>) -> Self {
        let message = message.into();
        let code = ErrorCode::try_from(code).unwrap_or(ErrorCode::Unknown);
        let stripped = message
            .strip_prefix(code.label())
            .and_then(|rest| rest.strip_prefix(": "))
            .map(str::to_owned);
        let detail = stripped.unwrap_or(message);

        match code {
            ErrorCode::Unknown => Self::Unknown(detail),
            ErrorCode::MailboxWrite => Self::MailboxWrite(detail),
            ErrorCode::ClientInternal => Self::ClientInternal(detail),
            ErrorCode::ServerInternal => Self::ServerInternal(detail),
            ErrorCode::DataNotReady => Self::DataNotReady(detail),
            ErrorCode::NoAvailableConnection => Self::NoAvailableConnection(detail),
        }
    }
}

pub type RelayResult<T> = Result<T, RelayError>;
