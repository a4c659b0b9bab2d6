//! # Channel Relays
//!
//! Keeps a channel argument connected across the boundary.
//!
//! The writing side runs [`forward`], which drains the local channel into
//! `send`/`close` messages. The reading side keeps an [`InboundRelays`] table
//! that routes those messages, by channel id, into its own local channel.
//!
//! ## Invariants
//! - **Order**: values reach the reading side in the order they were sent.
//! - **Non-blocking delivery**: `deliver` never waits, even when the local
//!   channel is bounded and full; a per-channel feeder task absorbs the wait.

use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::trace;

use crate::channel::Channel;
use crate::codec;
use crate::error::Error;
use crate::error::Result;
use crate::fault::RemoteError;
use crate::ids::ChannelId;
use crate::message::ChannelMessage;
use crate::message::Message;
use crate::value::Value;

/// Drains `channel` into relay messages until it closes or `post` reports
/// that the pipe is gone.
///
/// `post` returns `false` once messages can no longer be delivered.
pub async fn forward<F>(id: ChannelId, channel: Channel<Value>, mut post: F)
where
    F: FnMut(Message, Vec<Bytes>) -> bool,
{
    loop {
        let close = match channel.recv().await {
            Ok(Some(value)) => match codec::encode_value(value) {
                Ok(wire) => {
                    let transfer = codec::collect_transfers(std::slice::from_ref(&wire));
                    let message = Message::Channel(ChannelMessage::Send {
                        channel_id: id,
                        value: wire,
                    });
                    if !post(message, transfer) {
                        trace!(channel = %id, "relay target gone");
                        return;
                    }
                    continue;
                }
                Err(e) => {
                    let error = e.to_remote();
                    channel.close(Some(error.clone()));
                    Some(error)
                }
            },
            Ok(None) => None,
            Err(error) => Some(error),
        };

        let message = Message::Channel(ChannelMessage::Close {
            channel_id: id,
            error: close.as_ref().map(RemoteError::to_envelope),
        });
        post(message, Vec::new());
        return;
    }
}

enum RelayOp {
    Send(Value),
    Close(Option<RemoteError>),
}

/// Routes incoming channel messages into local channels.
#[derive(Default)]
pub struct InboundRelays {
    routes: DashMap<ChannelId, mpsc::UnboundedSender<RelayOp>>,
}

impl InboundRelays {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connects `id` to `channel`. Must be called from within a tokio runtime.
    pub fn install(&self, id: ChannelId, channel: Channel<Value>) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.routes.insert(id, tx);
        tokio::spawn(feed(id, channel, rx));
    }

    /// Delivers one relayed operation.
    ///
    /// # Errors
    /// Returns `Error::UnknownChannel` if no relay is installed for the id,
    /// or a decoding error if the relayed value is malformed.
    pub fn deliver(&self, message: ChannelMessage) -> Result<()> {
        let id = message.channel_id();
        let op = match message {
            ChannelMessage::Send { value, .. } => RelayOp::Send(codec::decode_plain(value)?),
            ChannelMessage::Close { error, .. } => {
                let error = error.as_ref().map(RemoteError::from_payload);
                // Closing is terminal, so the route goes with it.
                let (_, tx) = self.routes.remove(&id).ok_or(Error::UnknownChannel(id))?;
                let _ = tx.send(RelayOp::Close(error));
                return Ok(());
            }
        };

        let tx = self.routes.get(&id).ok_or(Error::UnknownChannel(id))?;
        if tx.send(op).is_err() {
            drop(tx);
            self.routes.remove(&id);
        }
        Ok(())
    }

    /// Number of channels with an installed relay.
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

async fn feed(id: ChannelId, channel: Channel<Value>, mut rx: mpsc::UnboundedReceiver<RelayOp>) {
    while let Some(op) = rx.recv().await {
        match op {
            RelayOp::Send(value) => {
                if channel.send(value).await.is_err() {
                    trace!(channel = %id, "local channel closed, dropping relayed values");
                    return;
                }
            }
            RelayOp::Close(error) => {
                channel.close(error);
                return;
            }
        }
    }
}
