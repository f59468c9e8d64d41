//! Wire protocol spoken with the pixel streaming signaling server.
//! One JSON object per text frame, discriminated by its `type` field.
//! Kept in a dedicated crate so other clients can reuse the message
//! definitions without the WebRTC runtime.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SignalingMessage {
    Config {
        #[serde(rename = "peerConnectionOptions")]
        peer_connection_options: PeerConnectionOptions,
    },
    PlayerCount {
        count: u32,
    },
    Offer {
        sdp: String,
    },
    Answer {
        sdp: String,
    },
    IceCandidate {
        candidate: IceCandidateDescriptor,
    },
    /// Any `type` this client does not understand. Decoding never fails on
    /// an unrecognized discriminant.
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerConnectionOptions {
    #[serde(
        rename = "iceServers",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub ice_servers: Option<Vec<IceServer>>,
}

impl PeerConnectionOptions {
    pub fn new(ice_servers: Vec<IceServer>) -> Self {
        Self {
            ice_servers: Some(ice_servers),
        }
    }

    pub fn ice_servers(&self) -> &[IceServer] {
        self.ice_servers.as_deref().unwrap_or_default()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    #[serde(default)]
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    pub fn with_urls<I, S>(urls: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            urls: urls.into_iter().map(Into::into).collect(),
            username: None,
            credential: None,
        }
    }
}

/// Candidate shape shared by inbound and outbound `iceCandidate` messages.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidateDescriptor {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_m_line_index: Option<u16>,
}

impl SignalingMessage {
    pub fn answer(sdp: impl Into<String>) -> Self {
        SignalingMessage::Answer { sdp: sdp.into() }
    }

    pub fn offer(sdp: impl Into<String>) -> Self {
        SignalingMessage::Offer { sdp: sdp.into() }
    }

    pub fn ice_candidate(candidate: IceCandidateDescriptor) -> Self {
        SignalingMessage::IceCandidate { candidate }
    }

    /// Wire discriminant, used for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            SignalingMessage::Config { .. } => "config",
            SignalingMessage::PlayerCount { .. } => "playerCount",
            SignalingMessage::Offer { .. } => "offer",
            SignalingMessage::Answer { .. } => "answer",
            SignalingMessage::IceCandidate { .. } => "iceCandidate",
            SignalingMessage::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("signaling payload is not valid json: {0}")]
    Json(#[source] serde_json::Error),
    #[error("signaling payload has no string `type` field")]
    MissingType,
    #[error("malformed {kind} message: {source}")]
    Malformed {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Error)]
#[error("failed to encode {kind} message: {source}")]
pub struct EncodeError {
    pub kind: &'static str,
    #[source]
    pub source: serde_json::Error,
}

pub fn decode(raw: &str) -> Result<SignalingMessage, DecodeError> {
    let value: Value = serde_json::from_str(raw).map_err(DecodeError::Json)?;
    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or(DecodeError::MissingType)?
        .to_string();
    serde_json::from_value(value).map_err(|source| DecodeError::Malformed { kind, source })
}

pub fn encode(message: &SignalingMessage) -> Result<String, EncodeError> {
    serde_json::to_string(message).map_err(|source| EncodeError {
        kind: message.kind(),
        source,
    })
}
