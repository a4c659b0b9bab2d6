//! # Error Definitions
//!
//! Failures of the protocol layer itself: values that cannot cross the
//! boundary, and messages that reference state the receiver does not have.

use crate::fault::RemoteError;
use crate::ids::ChannelId;

/// Operational failures within the wire protocol.
#[derive(Debug, Clone, PartialEq)]
pub enum Error {
    /// A value has no wire representation in this position (e.g. a channel
    /// inside a return value).
    NotCloneable(String),
    /// The nested depth of the value exceeded the safety limit.
    RecursionLimitExceeded,
    /// A channel message named a channel id with no installed relay.
    UnknownChannel(ChannelId),
    /// The message was well-formed but not valid in this direction or state.
    ProtocolViolation(String),
}

impl Error {
    /// Converts this error into the shape that travels inside an `error` response.
    pub fn to_remote(&self) -> RemoteError {
        match self {
            Self::NotCloneable(what) => {
                RemoteError::data_clone(format!("{} could not be cloned", what))
            }
            Self::RecursionLimitExceeded => {
                RemoteError::new("value nesting exceeds the recursion limit")
                    .with_name("RangeError")
            }
            other => RemoteError::new(other.to_string()),
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotCloneable(what) => write!(f, "{} could not be cloned", what),
            Self::RecursionLimitExceeded => write!(f, "Recursion limit exceeded"),
            Self::UnknownChannel(id) => write!(f, "Unknown channel: {}", id),
            Self::ProtocolViolation(msg) => write!(f, "Protocol violation: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

/// A specialized Result type for protocol operations.
pub type Result<T> = std::result::Result<T, Error>;
