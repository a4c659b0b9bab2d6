//! # Values
//!
//! Two parallel value trees:
//!
//! - [`Value`] is what callers and callables work with. It can hold live
//!   channels and errors.
//! - [`WireValue`] is what crosses the pipe. Errors have been boxed into
//!   envelopes and channels replaced by [`ChannelRef`]s.
//!
//! The codec converts between the two.

use std::collections::BTreeMap;

use bytes::Bytes;

use crate::channel::Channel;
use crate::fault::RemoteError;
use crate::ids::ChannelId;

/// Which side of a call writes to a channel argument. Fixed for the lifetime
/// of the call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// The caller writes, the remote callable reads.
    Input,
    /// The remote callable writes, the caller reads.
    Output,
}

/// A channel passed as a call argument.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelArg {
    pub channel: Channel<Value>,
    pub direction: Direction,
}

/// A dynamically typed value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    /// A byte buffer. Moved rather than copied when it crosses a boundary.
    Buffer(Bytes),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
    Error(RemoteError),
    Channel(ChannelArg),
}

impl Value {
    /// Wraps `channel` as an argument the caller writes to.
    pub fn input(channel: Channel<Value>) -> Self {
        Self::Channel(ChannelArg { channel, direction: Direction::Input })
    }

    /// Wraps `channel` as an argument the callable writes to.
    pub fn output(channel: Channel<Value>) -> Self {
        Self::Channel(ChannelArg { channel, direction: Direction::Output })
    }

    pub fn map<K: Into<String>>(entries: impl IntoIterator<Item = (K, Value)>) -> Self {
        Self::Map(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float(v) => Some(*v),
            Self::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Self::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_channel(&self) -> Option<&ChannelArg> {
        match self {
            Self::Channel(arg) => Some(arg),
            _ => None,
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        match self {
            Self::Map(map) => map.get(key),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self { Self::Bool(v) }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self { Self::Int(v) }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self { Self::Int(v.into()) }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self { Self::Float(v) }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self { Self::Str(v.into()) }
}

impl From<String> for Value {
    fn from(v: String) -> Self { Self::Str(v) }
}

impl From<Bytes> for Value {
    fn from(v: Bytes) -> Self { Self::Buffer(v) }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self { Self::List(v) }
}

impl From<RemoteError> for Value {
    fn from(v: RemoteError) -> Self { Self::Error(v) }
}

/// A stand-in for a channel argument on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelRef {
    pub id: ChannelId,
    pub direction: Direction,
}

/// A value as it travels over the pipe.
#[derive(Debug, Clone, PartialEq)]
pub enum WireValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Buffer(Bytes),
    List(Vec<WireValue>),
    Map(BTreeMap<String, WireValue>),
    Channel(ChannelRef),
}
