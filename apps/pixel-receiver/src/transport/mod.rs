use async_trait::async_trait;
use signaling_proto::{self as protocol, SignalingMessage};
use thiserror::Error;

use crate::session::dispatch::Dispatcher;

pub mod mock;
pub mod webrtc;
pub mod websocket;

#[derive(Debug, Clone)]
pub enum ChannelEvent {
    Open,
    Message(SignalingMessage),
    Close { code: u16, reason: String },
    Error(ChannelError),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChannelError {
    #[error("signaling channel is not connected")]
    NotConnected,
    #[error("signaling channel already connected")]
    AlreadyConnected,
    #[error("signaling channel closed")]
    Closed,
    #[error("invalid signaling url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("signaling connect failed: {0}")]
    Connect(String),
    #[error("signaling transport error: {0}")]
    Transport(String),
    #[error("{0}")]
    Encode(String),
}

/// Duplex signaling transport. Implementations are built around an injected
/// [`Dispatcher`] and deliver every event (open, message, close, error)
/// through it, whatever threads they use internally.
#[async_trait]
pub trait SignalingChannel: Send + Sync {
    async fn connect(&self, url: &str) -> Result<(), ChannelError>;

    /// Fails fast with [`ChannelError::Closed`] once `close` has been called.
    fn send(&self, message: &SignalingMessage) -> Result<(), ChannelError>;

    /// Idempotent; closing a closed or never-opened channel is a no-op.
    fn close(&self);
}

/// Decodes one inbound text frame and posts it. Malformed payloads are
/// logged and dropped; the channel keeps running.
pub(crate) fn dispatch_text(dispatcher: &Dispatcher, text: &str) {
    tracing::debug!(target = "signaling", payload = %text, "receive <==");
    match protocol::decode(text) {
        Ok(SignalingMessage::Unknown) => {
            tracing::debug!(target = "signaling", "ignoring unrecognized signaling message");
        }
        Ok(message) => {
            dispatcher.channel_event(ChannelEvent::Message(message));
        }
        Err(err) => {
            tracing::warn!(
                target = "signaling",
                error = %err,
                len = text.len(),
                "dropping malformed signaling message"
            );
        }
    }
}

pub(crate) fn encode_outbound(message: &SignalingMessage) -> Result<String, ChannelError> {
    let text = protocol::encode(message).map_err(|err| ChannelError::Encode(err.to_string()))?;
    tracing::debug!(target = "signaling", payload = %text, "send ==>");
    Ok(text)
}
