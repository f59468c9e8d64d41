use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use signaling_proto::IceCandidateDescriptor;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{API, APIBuilder};
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_gatherer_state::RTCIceGathererState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp::packet::Packet;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::{RTCRtpTransceiver, RTCRtpTransceiverInit};
use webrtc::track::track_remote::TrackRemote;

use crate::negotiation::engine::{
    DataChannelHandle, EngineError, EngineEvent, EngineSink, GatheringState, MediaKind,
    MediaPacket, PeerConnection, PeerConnectionConfig, PeerConnectionState, SdpKind,
    SessionDescription, TrackHandle, TransportEngine,
};

/// Packets buffered per track before the forwarder starts dropping them.
pub const TRACK_PACKET_BUFFER: usize = 256;

impl From<webrtc::Error> for EngineError {
    fn from(err: webrtc::Error) -> Self {
        match err {
            webrtc::Error::ErrConnectionClosed => EngineError::Closed,
            other => EngineError::Engine(other.to_string()),
        }
    }
}

/// Transport engine backed by the `webrtc` crate with its default codecs and
/// interceptors.
pub struct WebRtcEngine {
    api: API,
}

impl WebRtcEngine {
    pub fn new() -> Result<Self, EngineError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();
        Ok(Self { api })
    }
}

#[async_trait]
impl TransportEngine for WebRtcEngine {
    async fn create_peer_connection(
        &self,
        config: &PeerConnectionConfig,
        sink: EngineSink,
    ) -> Result<Arc<dyn PeerConnection>, EngineError> {
        let rtc_config = RTCConfiguration {
            ice_servers: config
                .ice_servers
                .iter()
                .map(|server| RTCIceServer {
                    urls: server.urls.clone(),
                    username: server.username.clone().unwrap_or_default(),
                    credential: server.credential.clone().unwrap_or_default(),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        };
        let peer_connection = Arc::new(self.api.new_peer_connection(rtc_config).await?);
        install_callbacks(&peer_connection, sink);
        Ok(Arc::new(WebRtcPeer {
            inner: peer_connection,
            receivers_added: AtomicBool::new(false),
        }))
    }
}

fn install_callbacks(peer_connection: &RTCPeerConnection, sink: EngineSink) {
    let ice_sink = sink.clone();
    peer_connection.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let sink = ice_sink.clone();
        Box::pin(async move {
            // None marks the end of gathering; the gathering state callback covers it.
            let Some(candidate) = candidate else {
                return;
            };
            match candidate.to_json() {
                Ok(init) => {
                    tracing::trace!(
                        target = "webrtc",
                        candidate = %init.candidate,
                        "local ice candidate"
                    );
                    sink.emit(EngineEvent::LocalIceCandidate(IceCandidateDescriptor {
                        candidate: init.candidate,
                        sdp_mid: init.sdp_mid,
                        sdp_m_line_index: init.sdp_mline_index,
                    }));
                }
                Err(err) => {
                    tracing::warn!(
                        target = "webrtc",
                        error = %err,
                        "failed to serialize local ice candidate"
                    );
                }
            }
        })
    }));

    let state_sink = sink.clone();
    peer_connection.on_peer_connection_state_change(Box::new(
        move |state: RTCPeerConnectionState| {
            let sink = state_sink.clone();
            Box::pin(async move {
                if let Some(state) = map_connection_state(state) {
                    sink.emit(EngineEvent::ConnectionStateChanged(state));
                }
            })
        },
    ));

    let gathering_sink = sink.clone();
    peer_connection.on_ice_gathering_state_change(Box::new(move |state: RTCIceGathererState| {
        let sink = gathering_sink.clone();
        Box::pin(async move {
            let state = match state {
                RTCIceGathererState::Gathering => GatheringState::Gathering,
                RTCIceGathererState::Complete => GatheringState::Complete,
                _ => GatheringState::New,
            };
            sink.emit(EngineEvent::GatheringStateChanged(state));
        })
    }));

    let track_sink = sink.clone();
    peer_connection.on_track(Box::new(
        move |track: Arc<TrackRemote>,
              _receiver: Arc<RTCRtpReceiver>,
              _transceiver: Arc<RTCRtpTransceiver>| {
            let sink = track_sink.clone();
            Box::pin(async move {
                let kind = match track.kind() {
                    RTPCodecType::Audio => MediaKind::Audio,
                    RTPCodecType::Video => MediaKind::Video,
                    _ => MediaKind::Other,
                };
                let track_id = track.id();
                let (packets, stream) = mpsc::channel(TRACK_PACKET_BUFFER);
                let handle = TrackHandle::new(track_id.clone(), track.stream_id(), kind, stream);
                if !sink.emit(EngineEvent::TrackReceived(handle)) {
                    return;
                }
                tokio::spawn(forward_track(track, track_id, packets, sink));
            })
        },
    ));

    peer_connection.on_data_channel(Box::new(move |channel: Arc<RTCDataChannel>| {
        let sink = sink.clone();
        Box::pin(async move {
            let label = channel.label().to_string();
            sink.emit(EngineEvent::DataChannelReceived(DataChannelHandle::new(
                label, channel,
            )));
        })
    }));
}

/// Sole reader of a remote track. Packets go to whoever took the track's
/// stream; while nobody drains it they are dropped rather than stalling the
/// read loop, which has to keep running to notice the end of the track.
async fn forward_track(
    track: Arc<TrackRemote>,
    track_id: String,
    packets: mpsc::Sender<MediaPacket>,
    sink: EngineSink,
) {
    let mut forwarded: u64 = 0;
    let mut dropped: u64 = 0;
    while let Ok((packet, _)) = track.read_rtp().await {
        match packets.try_send(media_packet(&packet)) {
            Ok(()) => forwarded += 1,
            Err(TrySendError::Full(_)) | Err(TrySendError::Closed(_)) => {
                dropped += 1;
                if dropped % 1_000 == 1 {
                    tracing::trace!(
                        target = "webrtc",
                        track_id = %track_id,
                        dropped,
                        "track consumer not keeping up"
                    );
                }
            }
        }
    }
    tracing::debug!(
        target = "webrtc",
        track_id = %track_id,
        forwarded,
        dropped,
        "remote track ended"
    );
    drop(packets);
    sink.emit(EngineEvent::TrackRemoved { track_id });
}

fn media_packet(packet: &Packet) -> MediaPacket {
    MediaPacket {
        payload_type: packet.header.payload_type,
        sequence_number: packet.header.sequence_number,
        timestamp: packet.header.timestamp,
        marker: packet.header.marker,
        payload: packet.payload.to_vec(),
    }
}

fn map_connection_state(state: RTCPeerConnectionState) -> Option<PeerConnectionState> {
    Some(match state {
        RTCPeerConnectionState::New => PeerConnectionState::New,
        RTCPeerConnectionState::Connecting => PeerConnectionState::Connecting,
        RTCPeerConnectionState::Connected => PeerConnectionState::Connected,
        RTCPeerConnectionState::Disconnected => PeerConnectionState::Disconnected,
        RTCPeerConnectionState::Failed => PeerConnectionState::Failed,
        RTCPeerConnectionState::Closed => PeerConnectionState::Closed,
        _ => return None,
    })
}

fn to_rtc(description: SessionDescription) -> Result<RTCSessionDescription, EngineError> {
    let sdp = description.sdp().to_string();
    let parsed = match description.kind() {
        SdpKind::Offer => RTCSessionDescription::offer(sdp),
        SdpKind::Answer => RTCSessionDescription::answer(sdp),
    };
    parsed.map_err(|err| EngineError::InvalidDescription(err.to_string()))
}

fn from_rtc(description: RTCSessionDescription) -> Result<SessionDescription, EngineError> {
    match description.sdp_type {
        RTCSdpType::Offer => Ok(SessionDescription::offer(description.sdp)),
        RTCSdpType::Answer => Ok(SessionDescription::answer(description.sdp)),
        other => Err(EngineError::InvalidDescription(format!(
            "unexpected description type {other}"
        ))),
    }
}

struct WebRtcPeer {
    inner: Arc<RTCPeerConnection>,
    receivers_added: AtomicBool,
}

#[async_trait]
impl PeerConnection for WebRtcPeer {
    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), EngineError> {
        let description = to_rtc(description)?;
        self.inner.set_remote_description(description).await?;
        Ok(())
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), EngineError> {
        let description = to_rtc(description)?;
        self.inner.set_local_description(description).await?;
        Ok(())
    }

    async fn create_answer(&self) -> Result<SessionDescription, EngineError> {
        from_rtc(self.inner.create_answer(None).await?)
    }

    async fn create_offer(&self) -> Result<SessionDescription, EngineError> {
        // A receive-only client has nothing to offer unless it asks for media.
        if !self.receivers_added.swap(true, Ordering::SeqCst) {
            for kind in [RTPCodecType::Video, RTPCodecType::Audio] {
                self.inner
                    .add_transceiver_from_kind(
                        kind,
                        Some(RTCRtpTransceiverInit {
                            direction: RTCRtpTransceiverDirection::Recvonly,
                            send_encodings: vec![],
                        }),
                    )
                    .await?;
            }
        }
        from_rtc(self.inner.create_offer(None).await?)
    }

    async fn add_ice_candidate(
        &self,
        candidate: IceCandidateDescriptor,
    ) -> Result<(), EngineError> {
        self.inner
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_m_line_index,
                username_fragment: None,
            })
            .await?;
        Ok(())
    }

    async fn close(&self) {
        if let Err(err) = self.inner.close().await {
            tracing::debug!(
                target = "webrtc",
                error = %err,
                "peer connection close reported an error"
            );
        }
    }
}
