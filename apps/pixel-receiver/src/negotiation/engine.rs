//! Contract between the negotiator and the media/ICE engine that owns the
//! actual peer connection. The negotiator only issues calls and reacts to
//! the events the engine posts back through its [`EngineSink`].

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use signaling_proto::{IceCandidateDescriptor, IceServer};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::session::dispatch::{Dispatcher, Input};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpKind {
    Offer,
    Answer,
}

impl fmt::Display for SdpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SdpKind::Offer => f.write_str("offer"),
            SdpKind::Answer => f.write_str("answer"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    kind: SdpKind,
    sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }

    pub fn kind(&self) -> SdpKind {
        self.kind
    }

    pub fn sdp(&self) -> &str {
        &self.sdp
    }
}

/// ICE server list handed to the engine when a peer connection is created.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerConnectionConfig {
    pub ice_servers: Vec<IceServer>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatheringState {
    New,
    Gathering,
    Complete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Audio,
    Video,
    Other,
}

/// One RTP packet of a remote track, copied out of the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaPacket {
    pub payload_type: u8,
    pub sequence_number: u16,
    pub timestamp: u32,
    pub marker: bool,
    pub payload: Vec<u8>,
}

/// Remote track announced by the engine. The engine stays the only reader
/// of the underlying track and forwards its packets into a bounded channel;
/// whoever calls [`TrackHandle::take_packets`] first owns that stream.
#[derive(Clone)]
pub struct TrackHandle {
    pub id: String,
    pub stream_id: String,
    pub kind: MediaKind,
    packets: Arc<Mutex<Option<mpsc::Receiver<MediaPacket>>>>,
}

impl TrackHandle {
    pub fn new(
        id: impl Into<String>,
        stream_id: impl Into<String>,
        kind: MediaKind,
        packets: mpsc::Receiver<MediaPacket>,
    ) -> Self {
        Self {
            id: id.into(),
            stream_id: stream_id.into(),
            kind,
            packets: Arc::new(Mutex::new(Some(packets))),
        }
    }

    /// Hands out the packet stream once; later calls, from any clone, get
    /// `None`. The stream ends when the remote track does.
    pub fn take_packets(&self) -> Option<mpsc::Receiver<MediaPacket>> {
        self.packets.lock().take()
    }
}

impl fmt::Debug for TrackHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrackHandle")
            .field("id", &self.id)
            .field("stream_id", &self.stream_id)
            .field("kind", &self.kind)
            .field("packets_taken", &self.packets.lock().is_none())
            .finish()
    }
}

/// Engine-specific data channel passed through to the consumer untouched.
#[derive(Clone)]
pub struct DataChannelHandle {
    pub label: String,
    inner: Arc<dyn Any + Send + Sync>,
}

impl DataChannelHandle {
    pub fn new<T: Any + Send + Sync>(label: impl Into<String>, inner: Arc<T>) -> Self {
        Self {
            label: label.into(),
            inner,
        }
    }

    pub fn downcast<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.inner.clone().downcast::<T>().ok()
    }
}

impl fmt::Debug for DataChannelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataChannelHandle")
            .field("label", &self.label)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
pub enum EngineEvent {
    LocalIceCandidate(IceCandidateDescriptor),
    ConnectionStateChanged(PeerConnectionState),
    GatheringStateChanged(GatheringState),
    TrackReceived(TrackHandle),
    TrackRemoved { track_id: String },
    DataChannelReceived(DataChannelHandle),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EngineError {
    #[error("engine error: {0}")]
    Engine(String),
    #[error("invalid session description: {0}")]
    InvalidDescription(String),
    #[error("peer connection closed")]
    Closed,
}

/// Posts engine callbacks onto the session's dispatch queue, stamped with the
/// generation of the peer connection that produced them.
#[derive(Clone, Debug)]
pub struct EngineSink {
    dispatcher: Dispatcher,
    generation: u64,
}

impl EngineSink {
    pub(crate) fn new(dispatcher: Dispatcher, generation: u64) -> Self {
        Self {
            dispatcher,
            generation,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Returns false once the session queue is gone.
    pub fn emit(&self, event: EngineEvent) -> bool {
        self.dispatcher.post(Input::Engine {
            generation: self.generation,
            event,
        })
    }
}

#[async_trait]
pub trait TransportEngine: Send + Sync {
    async fn create_peer_connection(
        &self,
        config: &PeerConnectionConfig,
        sink: EngineSink,
    ) -> Result<Arc<dyn PeerConnection>, EngineError>;
}

#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn set_remote_description(&self, description: SessionDescription)
    -> Result<(), EngineError>;

    async fn set_local_description(&self, description: SessionDescription)
    -> Result<(), EngineError>;

    async fn create_answer(&self) -> Result<SessionDescription, EngineError>;

    async fn create_offer(&self) -> Result<SessionDescription, EngineError>;

    async fn add_ice_candidate(&self, candidate: IceCandidateDescriptor)
    -> Result<(), EngineError>;

    async fn close(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packet(sequence_number: u16) -> MediaPacket {
        MediaPacket {
            payload_type: 96,
            sequence_number,
            timestamp: u32::from(sequence_number) * 3_000,
            marker: false,
            payload: vec![0xAB; 4],
        }
    }

    #[test_timeout::tokio_timeout_test(5)]
    async fn packet_stream_goes_to_the_first_taker() {
        let (tx, rx) = mpsc::channel(4);
        let track = TrackHandle::new("video0", "stream0", MediaKind::Video, rx);
        let observer_copy = track.clone();

        let mut packets = observer_copy.take_packets().expect("first take");
        assert!(track.take_packets().is_none());
        assert!(format!("{track:?}").contains("packets_taken: true"));

        tx.send(packet(1)).await.expect("send");
        tx.send(packet(2)).await.expect("send");
        drop(tx);
        assert_eq!(packets.recv().await, Some(packet(1)));
        assert_eq!(packets.recv().await, Some(packet(2)));
        assert_eq!(packets.recv().await, None);
    }

    #[test]
    fn data_channel_handle_downcasts_to_its_engine_type() {
        let handle = DataChannelHandle::new("input", Arc::new(7u32));
        assert_eq!(handle.downcast::<u32>().as_deref(), Some(&7));
        assert!(handle.downcast::<String>().is_none());
    }
}
