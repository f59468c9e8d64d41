//! Offer/answer state machine for one signaling session.
//!
//! The negotiator is driven from a single dispatch queue and holds no locks.
//! Engine operations that may suspend (`set_*_description`, `create_*`) are
//! spawned and report back as [`Completion`]s on the same queue, so unrelated
//! signaling traffic can interleave while they run. Each peer connection gets
//! a fresh generation and each offer/answer exchange a fresh round; anything
//! stamped with an older generation or round is discarded.

use std::future::Future;
use std::mem;
use std::sync::Arc;

use signaling_proto::{IceCandidateDescriptor, PeerConnectionOptions, SignalingMessage};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::session::dispatch::{Dispatcher, Input};
use crate::session::observer::{EventHub, SessionEvent};
use crate::transport::{ChannelError, ChannelEvent, SignalingChannel};

pub mod engine;

use engine::{
    EngineError, EngineEvent, EngineSink, PeerConnection, PeerConnectionConfig, SdpKind,
    SessionDescription, TransportEngine,
};

/// Remote candidates held while no peer connection exists yet.
pub const MAX_EARLY_CANDIDATES: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationRole {
    Offerer,
    Answerer,
}

/// Where an in-flight round currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    CreatingOffer,
    CreatingAnswer,
    SettingLocal,
    SettingRemote,
    AwaitingAnswer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Uninitialized,
    AwaitingConfig,
    Configured,
    Negotiating { role: NegotiationRole, step: Step },
    Stable,
}

impl Phase {
    fn accepts_new_round(self) -> bool {
        matches!(self, Phase::Configured | Phase::Stable)
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum NegotiationError {
    #[error("failed to create peer connection: {0}")]
    CreatePeerConnection(EngineError),
    #[error("failed to set remote {kind}: {source}")]
    SetRemoteDescription { kind: SdpKind, source: EngineError },
    #[error("failed to set local {kind}: {source}")]
    SetLocalDescription { kind: SdpKind, source: EngineError },
    #[error("failed to create {kind}: {source}")]
    CreateDescription { kind: SdpKind, source: EngineError },
    #[error("failed to signal local {kind}: {source}")]
    Signaling { kind: SdpKind, source: ChannelError },
}

/// Inputs that cannot be applied in the current state. Dropped with a log.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolViolation {
    #[error("{message} received before config")]
    BeforeConfig { message: &'static str },
    #[error("{message} received while {phase:?}")]
    UnexpectedMessage { message: &'static str, phase: Phase },
    #[error("ice candidate has neither sdpMid nor sdpMLineIndex")]
    UnroutableCandidate,
    #[error("session already failed; {message} ignored")]
    SessionFailed { message: &'static str },
}

/// Outcome of a spawned engine operation.
#[derive(Debug)]
pub enum Completion {
    OfferCreated {
        round: u64,
        result: Result<SessionDescription, EngineError>,
    },
    AnswerCreated {
        round: u64,
        result: Result<SessionDescription, EngineError>,
    },
    LocalDescriptionSet {
        round: u64,
        description: SessionDescription,
        result: Result<(), EngineError>,
    },
    RemoteDescriptionSet {
        round: u64,
        description: SessionDescription,
        result: Result<(), EngineError>,
    },
}

impl Completion {
    fn round(&self) -> u64 {
        match self {
            Completion::OfferCreated { round, .. }
            | Completion::AnswerCreated { round, .. }
            | Completion::LocalDescriptionSet { round, .. }
            | Completion::RemoteDescriptionSet { round, .. } => *round,
        }
    }
}

/// Per-peer-connection state, owned exclusively by the [`Negotiator`].
pub struct NegotiationSession {
    generation: u64,
    config: PeerConnectionConfig,
    peer: Arc<dyn PeerConnection>,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    remote_in_flight: bool,
    round: u64,
    buffered: Vec<IceCandidateDescriptor>,
    failure: Option<NegotiationError>,
    tasks: Vec<JoinHandle<()>>,
}

impl NegotiationSession {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn config(&self) -> &PeerConnectionConfig {
        &self.config
    }

    pub fn local_description(&self) -> Option<&SessionDescription> {
        self.local.as_ref()
    }

    pub fn remote_description(&self) -> Option<&SessionDescription> {
        self.remote.as_ref()
    }

    pub fn buffered_candidates(&self) -> &[IceCandidateDescriptor] {
        &self.buffered
    }

    pub fn round(&self) -> u64 {
        self.round
    }

    pub fn failure(&self) -> Option<&NegotiationError> {
        self.failure.as_ref()
    }

    pub fn is_failed(&self) -> bool {
        self.failure.is_some()
    }

    /// Candidates go straight to the engine only once a remote description
    /// has been applied and no replacement is in flight.
    fn accepts_candidates(&self) -> bool {
        self.remote.is_some() && !self.remote_in_flight
    }

    fn abort_tasks(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

pub struct Negotiator {
    engine: Arc<dyn TransportEngine>,
    signaling: Arc<dyn SignalingChannel>,
    dispatcher: Dispatcher,
    events: EventHub,
    phase: Phase,
    session: Option<NegotiationSession>,
    early_candidates: Vec<IceCandidateDescriptor>,
    generation: u64,
}

impl Negotiator {
    pub fn new(
        engine: Arc<dyn TransportEngine>,
        signaling: Arc<dyn SignalingChannel>,
        dispatcher: Dispatcher,
        events: EventHub,
    ) -> Self {
        Self {
            engine,
            signaling,
            dispatcher,
            events,
            phase: Phase::Uninitialized,
            session: None,
            early_candidates: Vec::new(),
            generation: 0,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn session(&self) -> Option<&NegotiationSession> {
        self.session.as_ref()
    }

    pub fn events(&self) -> &EventHub {
        &self.events
    }

    pub async fn handle(&mut self, input: Input) {
        match input {
            Input::Channel(event) => self.on_channel_event(event).await,
            Input::Engine { generation, event } => self.on_engine_event(generation, event).await,
            Input::Completed {
                generation,
                completion,
            } => self.on_completion(generation, completion).await,
            Input::Shutdown => self.teardown().await,
        }
    }

    async fn on_channel_event(&mut self, event: ChannelEvent) {
        match event {
            ChannelEvent::Open => {
                info!(target = "negotiation", "signaling channel open; awaiting config");
                self.events.emit(&SessionEvent::ChannelOpened);
                if self.phase == Phase::Uninitialized {
                    self.set_phase(Phase::AwaitingConfig);
                }
            }
            ChannelEvent::Message(message) => self.on_signal(message).await,
            ChannelEvent::Close { code, reason } => {
                info!(target = "negotiation", code, reason = %reason, "signaling channel closed");
                self.teardown().await;
                self.early_candidates.clear();
                self.set_phase(Phase::Uninitialized);
                self.events.emit(&SessionEvent::ChannelClosed { code, reason });
            }
            ChannelEvent::Error(err) => {
                warn!(target = "negotiation", error = %err, "signaling channel error");
                self.events.emit(&SessionEvent::ChannelError(err));
            }
        }
    }

    pub async fn on_signal(&mut self, message: SignalingMessage) {
        match message {
            SignalingMessage::Config {
                peer_connection_options,
            } => self.configure(peer_connection_options).await,
            SignalingMessage::PlayerCount { count } => {
                info!(target = "negotiation", count, "player count");
                self.events.emit(&SessionEvent::PlayerCount(count));
            }
            SignalingMessage::Offer { sdp } => self.on_remote_offer(sdp),
            SignalingMessage::Answer { sdp } => self.on_remote_answer(sdp),
            SignalingMessage::IceCandidate { candidate } => {
                self.on_remote_candidate(candidate).await
            }
            SignalingMessage::Unknown => {
                debug!(target = "negotiation", "unknown signaling message ignored");
            }
        }
    }

    async fn configure(&mut self, options: PeerConnectionOptions) {
        if self.session.is_some() {
            info!(target = "negotiation", "config received again; replacing peer connection");
            self.teardown().await;
        }

        let config = PeerConnectionConfig {
            ice_servers: options.ice_servers().to_vec(),
        };
        self.generation += 1;
        let generation = self.generation;
        let sink = EngineSink::new(self.dispatcher.clone(), generation);

        match self.engine.create_peer_connection(&config, sink).await {
            Ok(peer) => {
                let ice_servers = config.ice_servers.len();
                info!(target = "negotiation", generation, ice_servers, "peer connection created");
                self.session = Some(NegotiationSession {
                    generation,
                    config,
                    peer,
                    local: None,
                    remote: None,
                    remote_in_flight: false,
                    round: 0,
                    buffered: mem::take(&mut self.early_candidates),
                    failure: None,
                    tasks: Vec::new(),
                });
                self.set_phase(Phase::Configured);
                self.events.emit(&SessionEvent::Configured { ice_servers });
            }
            Err(err) => {
                let err = NegotiationError::CreatePeerConnection(err);
                error!(target = "negotiation", error = %err, "config could not be applied");
                self.set_phase(Phase::AwaitingConfig);
                self.events.emit(&SessionEvent::NegotiationFailed(err));
            }
        }
    }

    fn on_remote_offer(&mut self, sdp: String) {
        let Some(round) = self.begin_round("offer") else {
            return;
        };
        info!(target = "negotiation", round, "remote offer received");
        let description = SessionDescription::offer(sdp);
        self.set_phase(Phase::Negotiating {
            role: NegotiationRole::Answerer,
            step: Step::SettingRemote,
        });
        self.apply_remote(round, description);
    }

    fn on_remote_answer(&mut self, sdp: String) {
        let expected = Phase::Negotiating {
            role: NegotiationRole::Offerer,
            step: Step::AwaitingAnswer,
        };
        if let Err(violation) = self.check_session("answer") {
            warn!(target = "negotiation", %violation, "dropping answer");
            return;
        }
        if self.phase != expected {
            let violation = ProtocolViolation::UnexpectedMessage {
                message: "answer",
                phase: self.phase,
            };
            warn!(target = "negotiation", %violation, "dropping answer");
            return;
        }
        let Some(round) = self.session.as_ref().map(NegotiationSession::round) else {
            return;
        };
        info!(target = "negotiation", round, "remote answer received");
        self.set_phase(Phase::Negotiating {
            role: NegotiationRole::Offerer,
            step: Step::SettingRemote,
        });
        self.apply_remote(round, SessionDescription::answer(sdp));
    }

    /// Starts a client-initiated round: create offer, set it locally, send it,
    /// then wait for the far end's answer.
    pub fn start_offer(&mut self) -> bool {
        let Some(round) = self.begin_round("local offer") else {
            return false;
        };
        info!(target = "negotiation", round, "creating local offer");
        self.set_phase(Phase::Negotiating {
            role: NegotiationRole::Offerer,
            step: Step::CreatingOffer,
        });
        if let Some(peer) = self.peer() {
            self.spawn_op(async move {
                Completion::OfferCreated {
                    round,
                    result: peer.create_offer().await,
                }
            });
        }
        true
    }

    async fn on_remote_candidate(&mut self, candidate: IceCandidateDescriptor) {
        if candidate.sdp_mid.is_none() && candidate.sdp_m_line_index.is_none() {
            let violation = ProtocolViolation::UnroutableCandidate;
            warn!(target = "negotiation", %violation, "dropping remote ice candidate");
            return;
        }

        let Some(session) = self.session.as_mut() else {
            let violation = ProtocolViolation::BeforeConfig {
                message: "ice candidate",
            };
            debug!(
                target = "negotiation",
                %violation,
                "holding remote ice candidate until a peer connection exists"
            );
            if self.early_candidates.len() >= MAX_EARLY_CANDIDATES {
                let dropped = self.early_candidates.remove(0);
                warn!(
                    target = "negotiation",
                    limit = MAX_EARLY_CANDIDATES,
                    candidate = %dropped.candidate,
                    "too many ice candidates before config; dropping the oldest"
                );
            }
            self.early_candidates.push(candidate);
            return;
        };
        if session.is_failed() {
            let violation = ProtocolViolation::SessionFailed {
                message: "ice candidate",
            };
            debug!(target = "negotiation", %violation, "dropping remote ice candidate");
            return;
        }
        if !session.accepts_candidates() {
            session.buffered.push(candidate);
            debug!(
                target = "negotiation",
                buffered = session.buffered.len(),
                "buffered remote ice candidate until remote description is set"
            );
            return;
        }

        let peer = session.peer.clone();
        forward_candidate(peer.as_ref(), candidate).await;
    }

    async fn on_engine_event(&mut self, generation: u64, event: EngineEvent) {
        if !self.is_current(generation) {
            debug!(target = "negotiation", generation, ?event, "discarding stale engine event");
            return;
        }
        match event {
            EngineEvent::LocalIceCandidate(candidate) => {
                let message = SignalingMessage::ice_candidate(candidate);
                if let Err(err) = self.signaling.send(&message) {
                    warn!(
                        target = "negotiation",
                        error = %err,
                        "failed to send local ice candidate"
                    );
                    self.events.emit(&SessionEvent::ChannelError(err));
                }
            }
            EngineEvent::ConnectionStateChanged(state) => {
                info!(target = "negotiation", ?state, "peer connection state changed");
                self.events.emit(&SessionEvent::ConnectionStateChanged(state));
            }
            EngineEvent::GatheringStateChanged(state) => {
                debug!(target = "negotiation", ?state, "ice gathering state changed");
                self.events.emit(&SessionEvent::GatheringStateChanged(state));
            }
            EngineEvent::TrackReceived(track) => {
                info!(
                    target = "negotiation",
                    track_id = %track.id,
                    kind = ?track.kind,
                    "remote track received"
                );
                self.events.emit(&SessionEvent::TrackReceived(track));
            }
            EngineEvent::TrackRemoved { track_id } => {
                info!(target = "negotiation", track_id = %track_id, "remote track removed");
                self.events.emit(&SessionEvent::TrackCleared { track_id });
            }
            EngineEvent::DataChannelReceived(channel) => {
                info!(target = "negotiation", label = %channel.label, "data channel received");
                self.events.emit(&SessionEvent::DataChannelReceived(channel));
            }
        }
    }

    async fn on_completion(&mut self, generation: u64, completion: Completion) {
        let current_round = match self.session.as_ref() {
            Some(session) if session.generation == generation => session.round,
            _ => {
                debug!(
                    target = "negotiation",
                    generation,
                    "discarding completion from torn down session"
                );
                return;
            }
        };
        if completion.round() != current_round {
            debug!(
                target = "negotiation",
                round = completion.round(),
                current_round,
                "discarding completion from an abandoned round"
            );
            return;
        }
        let Phase::Negotiating { role, step } = self.phase else {
            debug!(target = "negotiation", phase = ?self.phase, "completion outside negotiation");
            return;
        };

        match completion {
            Completion::OfferCreated { round, result } => {
                if step != Step::CreatingOffer {
                    return;
                }
                match result {
                    Ok(offer) => self.apply_local(role, round, offer),
                    Err(source) => self.fail(NegotiationError::CreateDescription {
                        kind: SdpKind::Offer,
                        source,
                    }),
                }
            }
            Completion::AnswerCreated { round, result } => {
                if step != Step::CreatingAnswer {
                    return;
                }
                match result {
                    Ok(answer) => self.apply_local(role, round, answer),
                    Err(source) => self.fail(NegotiationError::CreateDescription {
                        kind: SdpKind::Answer,
                        source,
                    }),
                }
            }
            Completion::LocalDescriptionSet {
                description,
                result,
                ..
            } => {
                if step != Step::SettingLocal {
                    return;
                }
                match result {
                    Ok(()) => self.on_local_applied(role, description),
                    Err(source) => self.fail(NegotiationError::SetLocalDescription {
                        kind: description.kind(),
                        source,
                    }),
                }
            }
            Completion::RemoteDescriptionSet {
                round,
                description,
                result,
            } => {
                if step != Step::SettingRemote {
                    return;
                }
                match result {
                    Ok(()) => self.on_remote_applied(role, round, description).await,
                    Err(source) => self.fail(NegotiationError::SetRemoteDescription {
                        kind: description.kind(),
                        source,
                    }),
                }
            }
        }
    }

    async fn on_remote_applied(
        &mut self,
        role: NegotiationRole,
        round: u64,
        description: SessionDescription,
    ) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        debug!(target = "negotiation", kind = %description.kind(), "remote description set");
        session.remote = Some(description);
        session.remote_in_flight = false;
        let buffered = mem::take(&mut session.buffered);
        let peer = session.peer.clone();

        if !buffered.is_empty() {
            debug!(
                target = "negotiation",
                count = buffered.len(),
                "flushing buffered ice candidates"
            );
        }
        for candidate in buffered {
            forward_candidate(peer.as_ref(), candidate).await;
        }

        match role {
            NegotiationRole::Answerer => {
                self.set_phase(Phase::Negotiating {
                    role,
                    step: Step::CreatingAnswer,
                });
                self.spawn_op(async move {
                    Completion::AnswerCreated {
                        round,
                        result: peer.create_answer().await,
                    }
                });
            }
            NegotiationRole::Offerer => {
                info!(target = "negotiation", round, "negotiation stable");
                self.set_phase(Phase::Stable);
            }
        }
    }

    fn apply_local(&mut self, role: NegotiationRole, round: u64, description: SessionDescription) {
        let Some(peer) = self.peer() else {
            return;
        };
        self.set_phase(Phase::Negotiating {
            role,
            step: Step::SettingLocal,
        });
        self.spawn_op(async move {
            let result = peer.set_local_description(description.clone()).await;
            Completion::LocalDescriptionSet {
                round,
                description,
                result,
            }
        });
    }

    fn on_local_applied(&mut self, role: NegotiationRole, description: SessionDescription) {
        let kind = description.kind();
        let message = match kind {
            SdpKind::Offer => SignalingMessage::offer(description.sdp()),
            SdpKind::Answer => SignalingMessage::answer(description.sdp()),
        };
        if let Some(session) = self.session.as_mut() {
            session.local = Some(description);
        }
        if let Err(source) = self.signaling.send(&message) {
            self.fail(NegotiationError::Signaling { kind, source });
            return;
        }
        self.events.emit(&SessionEvent::DescriptionSent(kind));

        match role {
            NegotiationRole::Answerer => {
                info!(target = "negotiation", "answer sent; negotiation stable");
                self.set_phase(Phase::Stable);
            }
            NegotiationRole::Offerer => {
                info!(target = "negotiation", "offer sent; awaiting answer");
                self.set_phase(Phase::Negotiating {
                    role,
                    step: Step::AwaitingAnswer,
                });
            }
        }
    }

    fn apply_remote(&mut self, round: u64, description: SessionDescription) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        session.remote_in_flight = true;
        let peer = session.peer.clone();
        self.spawn_op(async move {
            let result = peer.set_remote_description(description.clone()).await;
            Completion::RemoteDescriptionSet {
                round,
                description,
                result,
            }
        });
    }

    /// Validates that a new round may start and returns its number.
    fn begin_round(&mut self, message: &'static str) -> Option<u64> {
        if let Err(violation) = self.check_session(message) {
            warn!(target = "negotiation", %violation, "cannot start negotiation round");
            return None;
        }
        if !self.phase.accepts_new_round() {
            let violation = ProtocolViolation::UnexpectedMessage {
                message,
                phase: self.phase,
            };
            warn!(target = "negotiation", %violation, "cannot start negotiation round");
            return None;
        }
        let session = self.session.as_mut()?;
        session.round += 1;
        Some(session.round)
    }

    fn check_session(&self, message: &'static str) -> Result<(), ProtocolViolation> {
        match self.session.as_ref() {
            None => Err(ProtocolViolation::BeforeConfig { message }),
            Some(session) if session.is_failed() => {
                Err(ProtocolViolation::SessionFailed { message })
            }
            Some(_) => Ok(()),
        }
    }

    /// Abandons the current round. The session stays failed until a new
    /// config replaces the peer connection.
    fn fail(&mut self, err: NegotiationError) {
        error!(target = "negotiation", error = %err, "negotiation round failed");
        if let Some(session) = self.session.as_mut() {
            if !session.buffered.is_empty() {
                debug!(
                    target = "negotiation",
                    count = session.buffered.len(),
                    "discarding buffered ice candidates"
                );
            }
            session.buffered.clear();
            session.remote_in_flight = false;
            session.failure = Some(err.clone());
        }
        self.events.emit(&SessionEvent::NegotiationFailed(err));
    }

    /// Releases the peer connection. Callbacks and completions from it are
    /// ignored from here on.
    pub async fn teardown(&mut self) {
        let Some(mut session) = self.session.take() else {
            return;
        };
        self.generation += 1;
        session.abort_tasks();
        session.peer.close().await;
        info!(target = "negotiation", generation = session.generation, "peer connection torn down");
        if self.phase != Phase::Uninitialized {
            self.set_phase(Phase::AwaitingConfig);
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        self.session
            .as_ref()
            .is_some_and(|session| session.generation == generation)
    }

    fn peer(&self) -> Option<Arc<dyn PeerConnection>> {
        self.session.as_ref().map(|session| session.peer.clone())
    }

    fn spawn_op<F>(&mut self, op: F)
    where
        F: Future<Output = Completion> + Send + 'static,
    {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let generation = session.generation;
        let dispatcher = self.dispatcher.clone();
        session.tasks.retain(|task| !task.is_finished());
        session.tasks.push(tokio::spawn(async move {
            let completion = op.await;
            dispatcher.post(Input::Completed {
                generation,
                completion,
            });
        }));
    }

    fn set_phase(&mut self, next: Phase) {
        if self.phase == next {
            return;
        }
        debug!(target = "negotiation", from = ?self.phase, to = ?next, "phase transition");
        self.phase = next;
        self.events.emit(&SessionEvent::PhaseChanged(next));
    }
}

async fn forward_candidate(peer: &dyn PeerConnection, candidate: IceCandidateDescriptor) {
    if let Err(err) = peer.add_ice_candidate(candidate).await {
        warn!(target = "negotiation", error = %err, "engine rejected remote ice candidate");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::negotiation::engine::{
        DataChannelHandle, GatheringState, MediaKind, MediaPacket, PeerConnectionState,
        TrackHandle,
    };
    use crate::session::dispatch::{DispatchQueue, dispatch_queue};
    use crate::transport::mock::{EngineCall, MockChannel, MockEngine};
    use parking_lot::Mutex;
    use signaling_proto::IceServer;
    use tokio::sync::mpsc;

    struct Harness {
        negotiator: Negotiator,
        queue: DispatchQueue,
        channel: Arc<MockChannel>,
        engine: Arc<MockEngine>,
    }

    impl Harness {
        fn new(engine: MockEngine) -> Self {
            let (dispatcher, queue) = dispatch_queue();
            let channel = Arc::new(MockChannel::new(dispatcher.clone()));
            let engine = Arc::new(engine);
            let negotiator = Negotiator::new(
                engine.clone(),
                channel.clone(),
                dispatcher,
                EventHub::new(),
            );
            Self {
                negotiator,
                queue,
                channel,
                engine,
            }
        }

        async fn signal(&mut self, message: SignalingMessage) {
            self.negotiator.on_signal(message).await;
        }

        async fn open(&mut self) {
            self.channel.connect("ws://signaling.test").await.expect("connect");
            assert_eq!(
                self.channel.connected_url().as_deref(),
                Some("ws://signaling.test")
            );
            let open = self.queue.next().await.expect("open event");
            self.negotiator.handle(open).await;
        }

        async fn configured(engine: MockEngine) -> Self {
            let mut harness = Self::new(engine);
            harness.open().await;
            harness.signal(config_message()).await;
            harness
        }

        /// Processes queued completions until the queue is idle.
        async fn settle(&mut self) {
            while let Ok(Some(input)) =
                tokio::time::timeout(std::time::Duration::from_millis(200), self.queue.next())
                    .await
            {
                self.negotiator.handle(input).await;
            }
        }
    }

    fn config_message() -> SignalingMessage {
        SignalingMessage::Config {
            peer_connection_options: PeerConnectionOptions::new(vec![IceServer::with_urls([
                "stun:stun.example.org:19302",
            ])]),
        }
    }

    fn candidate(n: u16) -> IceCandidateDescriptor {
        IceCandidateDescriptor {
            candidate: format!("candidate:{n} 1 udp 2122260223 10.0.0.{n} 5000 typ host"),
            sdp_mid: Some("0".into()),
            sdp_m_line_index: Some(0),
        }
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn open_then_config_reaches_configured() {
        let harness = Harness::configured(MockEngine::new()).await;
        assert_eq!(harness.negotiator.phase(), Phase::Configured);
        let session = harness.negotiator.session().expect("session");
        assert_eq!(
            session.config().ice_servers[0].urls,
            vec!["stun:stun.example.org:19302"]
        );
        assert_eq!(harness.engine.created_configs().len(), 1);
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn offer_before_config_is_dropped() {
        let mut harness = Harness::new(MockEngine::new());
        harness.open().await;
        harness.signal(SignalingMessage::offer("v=0")).await;
        harness.settle().await;
        assert_eq!(harness.negotiator.phase(), Phase::AwaitingConfig);
        assert!(harness.engine.calls().is_empty());
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn player_count_and_unknown_leave_state_alone() {
        let mut harness = Harness::configured(MockEngine::new()).await;
        harness.signal(SignalingMessage::PlayerCount { count: 2 }).await;
        harness.signal(SignalingMessage::Unknown).await;
        assert_eq!(harness.negotiator.phase(), Phase::Configured);
        let session = harness.negotiator.session().expect("session");
        assert!(session.remote_description().is_none());
        assert!(session.buffered_candidates().is_empty());
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn candidates_during_in_flight_offer_are_buffered() {
        let engine = MockEngine::new();
        let gate = engine.hold_remote_description();
        let mut harness = Harness::configured(engine).await;

        harness.signal(SignalingMessage::offer("v=0 offer")).await;
        harness
            .signal(SignalingMessage::ice_candidate(candidate(1)))
            .await;
        assert_eq!(
            harness
                .negotiator
                .session()
                .expect("session")
                .buffered_candidates()
                .len(),
            1
        );

        gate.notify_one();
        harness.settle().await;

        let calls = harness.engine.calls();
        let remote_at = calls
            .iter()
            .position(|call| matches!(call, EngineCall::SetRemote(_)))
            .expect("remote set");
        let candidate_at = calls
            .iter()
            .position(|call| matches!(call, EngineCall::AddIceCandidate(_)))
            .expect("candidate forwarded");
        assert!(candidate_at > remote_at);
        assert_eq!(harness.negotiator.phase(), Phase::Stable);
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn unroutable_candidate_is_dropped() {
        let mut harness = Harness::configured(MockEngine::new()).await;
        harness
            .signal(SignalingMessage::ice_candidate(IceCandidateDescriptor {
                candidate: "candidate:9".into(),
                sdp_mid: None,
                sdp_m_line_index: None,
            }))
            .await;
        assert!(
            harness
                .negotiator
                .session()
                .expect("session")
                .buffered_candidates()
                .is_empty()
        );
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn candidates_before_config_carry_into_session() {
        let mut harness = Harness::new(MockEngine::new());
        harness.open().await;
        harness
            .signal(SignalingMessage::ice_candidate(candidate(7)))
            .await;
        harness.signal(config_message()).await;
        assert_eq!(
            harness
                .negotiator
                .session()
                .expect("session")
                .buffered_candidates(),
            &[candidate(7)]
        );
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn create_answer_failure_marks_session_failed() {
        let engine = MockEngine::new();
        engine.fail_create_answer("no codecs in common");
        let mut harness = Harness::configured(engine).await;

        harness.signal(SignalingMessage::offer("v=0")).await;
        harness.settle().await;

        let session = harness.negotiator.session().expect("session");
        assert!(matches!(
            session.failure(),
            Some(NegotiationError::CreateDescription {
                kind: SdpKind::Answer,
                ..
            })
        ));
        assert!(harness.channel.sent().is_empty());

        // Abandoned: a further offer does not restart negotiation.
        harness.signal(SignalingMessage::offer("v=0 again")).await;
        harness.settle().await;
        assert_eq!(
            harness
                .engine
                .calls()
                .iter()
                .filter(|call| matches!(call, EngineCall::SetRemote(_)))
                .count(),
            1
        );
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn new_config_replaces_failed_session() {
        let engine = MockEngine::new();
        engine.fail_set_remote("bad sdp");
        let mut harness = Harness::configured(engine).await;
        harness.signal(SignalingMessage::offer("garbage")).await;
        harness.settle().await;
        assert!(harness.negotiator.session().expect("session").is_failed());
        let first_generation = harness.negotiator.session().expect("session").generation();

        harness.signal(config_message()).await;
        let session = harness.negotiator.session().expect("replacement");
        assert!(!session.is_failed());
        assert!(session.generation() > first_generation);
        assert_eq!(harness.negotiator.phase(), Phase::Configured);
        assert!(harness.engine.calls().contains(&EngineCall::Close));
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn stale_engine_events_are_discarded() {
        let mut harness = Harness::configured(MockEngine::new()).await;
        let old_sink = harness.engine.last_sink().expect("sink");
        harness.signal(config_message()).await;

        old_sink.emit(EngineEvent::LocalIceCandidate(candidate(3)));
        harness.settle().await;
        assert!(harness.channel.sent().is_empty());

        let sink = harness.engine.last_sink().expect("sink");
        sink.emit(EngineEvent::LocalIceCandidate(candidate(4)));
        harness.settle().await;
        assert_eq!(
            harness.channel.sent(),
            vec![SignalingMessage::ice_candidate(candidate(4))]
        );
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn offerer_round_completes_on_answer() {
        let mut harness = Harness::configured(MockEngine::new()).await;
        assert!(harness.negotiator.start_offer());
        harness.settle().await;

        assert_eq!(
            harness.negotiator.phase(),
            Phase::Negotiating {
                role: NegotiationRole::Offerer,
                step: Step::AwaitingAnswer,
            }
        );
        let sent = harness.channel.sent();
        assert!(matches!(sent.as_slice(), [SignalingMessage::Offer { .. }]));

        harness
            .signal(SignalingMessage::ice_candidate(candidate(2)))
            .await;
        harness.signal(SignalingMessage::answer("v=0 answer")).await;
        harness.settle().await;

        assert_eq!(harness.negotiator.phase(), Phase::Stable);
        let session = harness.negotiator.session().expect("session");
        assert_eq!(
            session.remote_description(),
            Some(&SessionDescription::answer("v=0 answer"))
        );
        assert_eq!(
            harness.engine.calls().last(),
            Some(&EngineCall::AddIceCandidate(candidate(2)))
        );
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn answer_without_local_offer_is_ignored() {
        let mut harness = Harness::configured(MockEngine::new()).await;
        harness.signal(SignalingMessage::answer("v=0")).await;
        harness.settle().await;
        assert_eq!(harness.negotiator.phase(), Phase::Configured);
        assert!(harness.engine.calls().is_empty());
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn channel_close_tears_down_session() {
        let mut harness = Harness::configured(MockEngine::new()).await;
        let sink = harness.engine.last_sink().expect("sink");
        harness
            .negotiator
            .handle(Input::Channel(ChannelEvent::Close {
                code: 1000,
                reason: "bye".into(),
            }))
            .await;
        assert!(harness.negotiator.session().is_none());
        assert_eq!(harness.negotiator.phase(), Phase::Uninitialized);

        sink.emit(EngineEvent::LocalIceCandidate(candidate(5)));
        harness.settle().await;
        assert!(harness.channel.sent().is_empty());
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn set_local_failure_leaves_answer_unsent() {
        let engine = MockEngine::new();
        engine.fail_set_local("dtls fingerprint rejected");
        let mut harness = Harness::configured(engine).await;

        harness.signal(SignalingMessage::offer("v=0")).await;
        harness.settle().await;

        let session = harness.negotiator.session().expect("session");
        assert!(matches!(
            session.failure(),
            Some(NegotiationError::SetLocalDescription {
                kind: SdpKind::Answer,
                ..
            })
        ));
        assert!(session.local_description().is_none());
        assert!(harness.channel.sent().is_empty());
        assert_eq!(
            harness.negotiator.phase(),
            Phase::Negotiating {
                role: NegotiationRole::Answerer,
                step: Step::SettingLocal,
            }
        );
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn config_failure_keeps_waiting_with_early_candidates() {
        let engine = MockEngine::new();
        engine.fail_create_peer_connection("no network interfaces");
        let mut harness = Harness::new(engine);
        let failures = Arc::new(Mutex::new(Vec::new()));
        let seen = failures.clone();
        harness.negotiator.events().subscribe_all(move |event| {
            if let SessionEvent::NegotiationFailed(err) = event {
                seen.lock().push(err.clone());
            }
        });
        harness.open().await;
        harness
            .signal(SignalingMessage::ice_candidate(candidate(7)))
            .await;
        harness.signal(config_message()).await;

        assert_eq!(harness.negotiator.phase(), Phase::AwaitingConfig);
        assert!(harness.negotiator.session().is_none());
        assert!(matches!(
            failures.lock().as_slice(),
            [NegotiationError::CreatePeerConnection(EngineError::Engine(_))]
        ));

        harness.engine.clear_failures();
        harness.signal(config_message()).await;
        assert_eq!(harness.negotiator.phase(), Phase::Configured);
        assert_eq!(
            harness
                .negotiator
                .session()
                .expect("session")
                .buffered_candidates(),
            &[candidate(7)]
        );
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn early_candidates_keep_only_the_newest() {
        let mut harness = Harness::new(MockEngine::new());
        harness.open().await;
        let total = MAX_EARLY_CANDIDATES as u16 + 2;
        for n in 1..=total {
            harness
                .signal(SignalingMessage::ice_candidate(candidate(n)))
                .await;
        }
        harness.signal(config_message()).await;

        let buffered = harness
            .negotiator
            .session()
            .expect("session")
            .buffered_candidates()
            .to_vec();
        assert_eq!(buffered.len(), MAX_EARLY_CANDIDATES);
        assert_eq!(buffered.first(), Some(&candidate(3)));
        assert_eq!(buffered.last(), Some(&candidate(total)));
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn engine_events_reach_subscribers() {
        let mut harness = Harness::configured(MockEngine::new()).await;
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink_events = seen.clone();
        let (packets_tx, mut packets_rx) = mpsc::unbounded_channel();
        harness.negotiator.events().subscribe_all(move |event| {
            if let SessionEvent::TrackReceived(track) = event {
                if let Some(packets) = track.take_packets() {
                    let _ = packets_tx.send(packets);
                }
            }
            sink_events.lock().push(event.clone());
        });

        let (media_tx, media_rx) = mpsc::channel(4);
        let sink = harness.engine.last_sink().expect("sink");
        for event in [
            EngineEvent::ConnectionStateChanged(PeerConnectionState::Connected),
            EngineEvent::GatheringStateChanged(GatheringState::Complete),
            EngineEvent::TrackReceived(TrackHandle::new(
                "video0",
                "stream0",
                MediaKind::Video,
                media_rx,
            )),
            EngineEvent::DataChannelReceived(DataChannelHandle::new("input", Arc::new(()))),
            EngineEvent::TrackRemoved {
                track_id: "video0".into(),
            },
        ] {
            assert!(sink.emit(event));
        }
        harness.settle().await;

        let seen = seen.lock().clone();
        assert_eq!(seen.len(), 5, "{seen:?}");
        assert!(matches!(
            seen[0],
            SessionEvent::ConnectionStateChanged(PeerConnectionState::Connected)
        ));
        assert!(matches!(
            seen[1],
            SessionEvent::GatheringStateChanged(GatheringState::Complete)
        ));
        assert!(matches!(
            &seen[2],
            SessionEvent::TrackReceived(track)
                if track.id == "video0" && track.kind == MediaKind::Video
        ));
        assert!(matches!(
            &seen[3],
            SessionEvent::DataChannelReceived(channel) if channel.label == "input"
        ));
        assert!(matches!(
            &seen[4],
            SessionEvent::TrackCleared { track_id } if track_id == "video0"
        ));

        let mut packets = packets_rx.try_recv().expect("subscriber took the packet stream");
        let packet = MediaPacket {
            payload_type: 96,
            sequence_number: 1,
            timestamp: 0,
            marker: true,
            payload: vec![0x90],
        };
        media_tx.send(packet.clone()).await.expect("send");
        assert_eq!(packets.recv().await, Some(packet));
    }
}
