//! # Codec
//!
//! The translation layer between [`Value`] and [`WireValue`].
//!
//! Outgoing, it boxes errors into envelopes, swaps channel arguments for
//! [`ChannelRef`]s and collects the transfer list. Incoming, it unboxes
//! envelopes and asks a [`ChannelBinder`] to materialise channel refs.
//!
//! ## Invariants
//! - **Recursion Safety**: All recursive operations are bounded by `MAX_RECURSION_DEPTH`.
//! - **Channels only as arguments**: `encode_value` refuses live channels; only
//!   `encode_args` may proxy them, since only a call can install a relay.

use bytes::Bytes;

use crate::channel::Channel;
use crate::error::Error;
use crate::error::Result;
use crate::fault::RemoteError;
use crate::ids::ChannelIds;
use crate::value::ChannelArg;
use crate::value::ChannelRef;
use crate::value::Value;
use crate::value::WireValue;

/// The maximum nesting depth for values before refusing to encode.
pub const MAX_RECURSION_DEPTH: usize = 64;

/// The encoded arguments of a call.
#[derive(Debug)]
pub struct Encoded {
    pub values: Vec<WireValue>,
    /// Buffers the transport may move instead of copy.
    pub transfer: Vec<Bytes>,
    /// Channel arguments, in argument order, paired with the ref that replaced them.
    pub channels: Vec<(ChannelRef, Channel<Value>)>,
}

/// Encodes call arguments, proxying any channels found among them.
pub fn encode_args(args: Vec<Value>, ids: &ChannelIds) -> Result<Encoded> {
    let mut channels = Vec::new();
    let values = {
        let mut proxy = Some((ids, &mut channels));
        args.into_iter()
            .map(|arg| encode_impl(arg, &mut proxy, 0))
            .collect::<Result<Vec<_>>>()?
    };
    let transfer = collect_transfers(&values);
    Ok(Encoded { values, transfer, channels })
}

/// Encodes a value that is not a call argument.
///
/// # Errors
/// Returns `Error::NotCloneable` if the value contains a channel.
pub fn encode_value(value: Value) -> Result<WireValue> {
    encode_impl(value, &mut None, 0)
}

type ChannelProxy<'a> = Option<(&'a ChannelIds, &'a mut Vec<(ChannelRef, Channel<Value>)>)>;

fn encode_impl(value: Value, proxy: &mut ChannelProxy<'_>, depth: usize) -> Result<WireValue> {
    if depth > MAX_RECURSION_DEPTH {
        return Err(Error::RecursionLimitExceeded);
    }

    Ok(match value {
        Value::Null => WireValue::Null,
        Value::Bool(b) => WireValue::Bool(b),
        Value::Int(v) => WireValue::Int(v),
        Value::Float(v) => WireValue::Float(v),
        Value::Str(s) => WireValue::Str(s),
        Value::Buffer(b) => WireValue::Buffer(b),
        Value::List(items) => WireValue::List(
            items
                .into_iter()
                .map(|item| encode_impl(item, proxy, depth + 1))
                .collect::<Result<_>>()?,
        ),
        Value::Map(map) => WireValue::Map(
            map.into_iter()
                .map(|(k, v)| Ok((k, encode_impl(v, proxy, depth + 1)?)))
                .collect::<Result<_>>()?,
        ),
        Value::Error(error) => error.to_envelope(),
        Value::Channel(ChannelArg { channel, direction }) => {
            let Some((ids, channels)) = proxy else {
                return Err(Error::NotCloneable("channel".into()));
            };
            let reference = ChannelRef { id: ids.allocate(), direction };
            channels.push((reference, channel));
            WireValue::Channel(reference)
        }
    })
}

/// Collects the buffers that may be moved rather than copied.
///
/// A buffer qualifies when it is a top-level value, a direct entry of a map
/// value, or a direct element of a list value. Deeper buffers are copied.
pub fn collect_transfers(values: &[WireValue]) -> Vec<Bytes> {
    let mut transfer = Vec::new();
    for value in values {
        match value {
            WireValue::Buffer(b) => transfer.push(b.clone()),
            WireValue::Map(map) => transfer.extend(map.values().filter_map(as_buffer)),
            WireValue::List(items) => transfer.extend(items.iter().filter_map(as_buffer)),
            _ => {}
        }
    }
    transfer
}

fn as_buffer(value: &WireValue) -> Option<Bytes> {
    match value {
        WireValue::Buffer(b) => Some(b.clone()),
        _ => None,
    }
}

/// Materialises channel refs found while decoding.
pub trait ChannelBinder {
    /// Returns the local channel that stands in for `reference`, installing
    /// whatever relay keeps it connected to the far side.
    fn bind(&mut self, reference: ChannelRef) -> Result<Channel<Value>>;
}

/// A binder for positions where channels are not allowed.
pub struct NoChannels;

impl ChannelBinder for NoChannels {
    fn bind(&mut self, reference: ChannelRef) -> Result<Channel<Value>> {
        Err(Error::NotCloneable(format!("channel {}", reference.id)))
    }
}

/// Decodes a wire value, binding any channel refs through `binder`.
pub fn decode_value(wire: WireValue, binder: &mut dyn ChannelBinder) -> Result<Value> {
    decode_impl(wire, binder, 0)
}

/// Decodes a wire value that must not contain channel refs.
pub fn decode_plain(wire: WireValue) -> Result<Value> {
    decode_impl(wire, &mut NoChannels, 0)
}

fn decode_impl(wire: WireValue, binder: &mut dyn ChannelBinder, depth: usize) -> Result<Value> {
    if depth > MAX_RECURSION_DEPTH {
        return Err(Error::RecursionLimitExceeded);
    }

    Ok(match wire {
        WireValue::Null => Value::Null,
        WireValue::Bool(b) => Value::Bool(b),
        WireValue::Int(v) => Value::Int(v),
        WireValue::Float(v) => Value::Float(v),
        WireValue::Str(s) => Value::Str(s),
        WireValue::Buffer(b) => Value::Buffer(b),
        WireValue::List(items) => Value::List(
            items
                .into_iter()
                .map(|item| decode_impl(item, binder, depth + 1))
                .collect::<Result<_>>()?,
        ),
        WireValue::Map(entries) => {
            if let Some(error) = RemoteError::from_map(&entries) {
                return Ok(Value::Error(error));
            }
            Value::Map(
                entries
                    .into_iter()
                    .map(|(k, v)| Ok((k, decode_impl(v, binder, depth + 1)?)))
                    .collect::<Result<_>>()?,
            )
        }
        WireValue::Channel(reference) => Value::Channel(ChannelArg {
            channel: binder.bind(reference)?,
            direction: reference.direction,
        }),
    })
}

/// Builds the error a failed call reports to its caller.
///
/// Envelopes are unboxed to their original category; any other payload
/// becomes a generic exception. When the error complains about a value that
/// could not be cloned and `origin` names the call as `(module, function)`,
/// a frame naming the callable is appended to the stack.
pub fn error_from_wire(wire: &WireValue, origin: Option<(&str, &str)>) -> RemoteError {
    let mut error = RemoteError::from_payload(wire);
    if let Some((module, function)) = origin {
        if error.is_not_cloneable() {
            error.push_frame(function, module);
        }
    }
    error
}
