//! Error taxonomy for both sides of the channel.

use std::fmt;
use std::io;

use serde::{Deserialize, Serialize};

use crate::bridge::protocol::SlotId;
use crate::descriptor::MemberKind;

/// Fixed table of error kinds that can cross the boundary.
///
/// The worker marshals an error as its kind identifier; the host maps that
/// identifier back through this enum. Unknown identifiers become [`ErrorKind::Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    TypeError,
    RangeError,
    ReferenceError,
    SyntaxError,
    EvalError,
    #[serde(rename = "URIError")]
    UriError,
    AggregateError,
    StaleReferenceError,
    ProtocolError,
    #[serde(other)]
    Error,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TypeError => "TypeError",
            Self::RangeError => "RangeError",
            Self::ReferenceError => "ReferenceError",
            Self::SyntaxError => "SyntaxError",
            Self::EvalError => "EvalError",
            Self::UriError => "URIError",
            Self::AggregateError => "AggregateError",
            Self::StaleReferenceError => "StaleReferenceError",
            Self::ProtocolError => "ProtocolError",
            Self::Error => "Error",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An error raised on the worker, in the shape it travels over the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct RemoteError {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

impl RemoteError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            stack: None,
        }
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Error, message)
    }

    pub fn type_error(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::TypeError, message)
    }

    pub fn range_error(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::RangeError, message)
    }

    pub fn stale_reference(slot: SlotId) -> Self {
        Self::new(
            ErrorKind::StaleReferenceError,
            format!("slot {slot} has been destroyed"),
        )
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ProtocolError, message)
    }
}

/// Host-side failure of a remote operation.
#[derive(Debug, Clone, thiserror::Error)]
pub enum HostError {
    /// The remote call or construction raised an error.
    #[error("remote execution failed: {0}")]
    Remote(RemoteError),

    /// The slot was destroyed before this operation reached it.
    #[error("stale reference: {message}")]
    StaleReference { message: String },

    /// Teardown deadline elapsed while the request was still in flight.
    #[error("request still in flight when the teardown deadline elapsed")]
    Timeout,

    #[error("protocol error: {0}")]
    Protocol(String),

    /// The channel closed or was torn down before a response arrived.
    #[error("channel disconnected")]
    Disconnected,

    #[error("worker did not announce its roots within {0:?}")]
    ConnectTimeout(std::time::Duration),

    /// The reply did not have the shape the caller asked for.
    #[error("unexpected reply: expected {expected}")]
    UnexpectedReply { expected: &'static str },
}

impl HostError {
    /// Reconstruct a local error from its marshaled form.
    pub fn from_remote(error: RemoteError) -> Self {
        match error.kind {
            ErrorKind::StaleReferenceError => Self::StaleReference {
                message: error.message,
            },
            ErrorKind::ProtocolError => Self::Protocol(error.message),
            _ => Self::Remote(error),
        }
    }

    /// The marshaled error, when this failure came from remote execution.
    pub fn remote(&self) -> Option<&RemoteError> {
        match self {
            Self::Remote(error) => Some(error),
            _ => None,
        }
    }

    pub fn is_stale_reference(&self) -> bool {
        matches!(self, Self::StaleReference { .. })
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout)
    }
}

/// Worker-side failure that stops exposure or the serve loop.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    /// A value offered for exposure is plain data, not a function, class or object.
    #[error("cannot expose a {kind} value: only functions, classes and objects can be exposed")]
    Validation { kind: MemberKind },

    #[error("channel error: {0}")]
    Io(#[from] io::Error),
}
