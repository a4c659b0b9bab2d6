//! # ExoWire
//!
//! The message protocol spoken between an orchestrator and its execution units.
//!
//! ## Architecture
//!
//! Callers and callables work with [`Value`]s, which may hold live channels and
//! errors. Everything that crosses the pipe is a [`Message`] built from
//! [`WireValue`]s: errors travel as tagged envelopes, channels as [`ChannelRef`]s
//! kept alive by a relay on each side. This crate owns the shapes and the
//! translation; it never spawns units or tracks tasks.

pub mod channel;
pub mod codec;
pub mod error;
pub mod fault;
pub mod ids;
pub mod message;
pub mod relay;
pub mod value;

pub use channel::Channel;
pub use channel::SendError;
pub use channel::TrySendError;
pub use codec::ChannelBinder;
pub use codec::Encoded;
pub use error::Error;
pub use error::Result;
pub use fault::ErrorKind;
pub use fault::RemoteError;
pub use ids::ChannelId;
pub use ids::ChannelIds;
pub use ids::TaskId;
pub use ids::TaskIds;
pub use message::CallRequest;
pub use message::CallResponse;
pub use message::ChannelMessage;
pub use message::ControlKind;
pub use message::GeneratorControl;
pub use message::Message;
pub use message::ResponseBody;
pub use relay::InboundRelays;
pub use value::ChannelArg;
pub use value::ChannelRef;
pub use value::Direction;
pub use value::Value;
pub use value::WireValue;

#[cfg(test)]
mod tests;
