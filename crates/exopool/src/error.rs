//! # Call Errors
//!
//! Everything a caller can observe failing on a remote call. The type is
//! `Clone` because one unit failure fans out to every task it was holding.

use exowire::RemoteError;

use crate::unit;
use crate::unit::UnitId;

#[derive(Debug, Clone, PartialEq)]
pub enum CallError {
    /// The call never reached a unit. The task was not registered.
    Dispatch(unit::Error),
    /// A value could not be encoded or decoded.
    Protocol(exowire::Error),
    /// The callable threw or rejected.
    Remote(RemoteError),
    /// The unit running the call crashed or exited.
    UnitFailed { unit: UnitId, error: RemoteError },
    /// A bound module has no function of that name.
    UnknownFunction { module: String, function: String },
    /// The call was abandoned before it produced an outcome.
    Cancelled,
}

impl CallError {
    /// The remote error carried by this failure, if there is one.
    pub fn remote(&self) -> Option<&RemoteError> {
        match self {
            Self::Remote(error) | Self::UnitFailed { error, .. } => Some(error),
            _ => None,
        }
    }

    /// Converts this failure into an error that can close a channel.
    pub fn to_remote(&self) -> RemoteError {
        match self {
            Self::Remote(error) | Self::UnitFailed { error, .. } => error.clone(),
            Self::Protocol(error) => error.to_remote(),
            Self::Cancelled => RemoteError::abort(self.to_string()),
            other => RemoteError::new(other.to_string()),
        }
    }
}

impl std::fmt::Display for CallError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Dispatch(e) => write!(f, "Dispatch error: {}", e),
            Self::Protocol(e) => write!(f, "Protocol error: {}", e),
            Self::Remote(e) => write!(f, "Remote error: {}", e),
            Self::UnitFailed { unit, error } => write!(f, "{} failed: {}", unit, error),
            Self::UnknownFunction { module, function } => {
                write!(f, "Unknown function: {}.{}", module, function)
            }
            Self::Cancelled => write!(f, "Call cancelled"),
        }
    }
}

impl std::error::Error for CallError {}

impl From<unit::Error> for CallError {
    fn from(e: unit::Error) -> Self {
        Self::Dispatch(e)
    }
}

impl From<exowire::Error> for CallError {
    fn from(e: exowire::Error) -> Self {
        Self::Protocol(e)
    }
}

impl From<RemoteError> for CallError {
    fn from(e: RemoteError) -> Self {
        Self::Remote(e)
    }
}

pub type Result<T> = std::result::Result<T, CallError>;
