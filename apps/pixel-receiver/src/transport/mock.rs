//! In-memory signaling channel and scripted engine for driving the
//! negotiator without a network or a media stack.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use signaling_proto::{self as protocol, IceCandidateDescriptor, SignalingMessage};
use tokio::sync::{Notify, mpsc};

use super::{ChannelError, ChannelEvent, SignalingChannel, dispatch_text};
use crate::negotiation::engine::{
    EngineError, EngineSink, PeerConnection, PeerConnectionConfig, SessionDescription,
    TransportEngine,
};
use crate::session::dispatch::Dispatcher;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MockState {
    Idle,
    Open,
    Closed,
}

pub struct MockChannel {
    dispatcher: Dispatcher,
    state: Mutex<MockState>,
    url: Mutex<Option<String>>,
    sent: Mutex<Vec<SignalingMessage>>,
    outbound_tx: mpsc::UnboundedSender<SignalingMessage>,
    outbound_rx: Mutex<Option<mpsc::UnboundedReceiver<SignalingMessage>>>,
    close_events: Mutex<u32>,
}

impl MockChannel {
    pub fn new(dispatcher: Dispatcher) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        Self {
            dispatcher,
            state: Mutex::new(MockState::Idle),
            url: Mutex::new(None),
            sent: Mutex::new(Vec::new()),
            outbound_tx,
            outbound_rx: Mutex::new(Some(outbound_rx)),
            close_events: Mutex::new(0),
        }
    }

    /// Simulates the server pushing a message.
    pub fn deliver(&self, message: SignalingMessage) {
        self.dispatcher.channel_event(ChannelEvent::Message(message));
    }

    /// Simulates the server pushing a raw text frame.
    pub fn deliver_raw(&self, text: &str) {
        dispatch_text(&self.dispatcher, text);
    }

    /// Simulates the server closing the connection.
    pub fn remote_close(&self, code: u16, reason: &str) {
        if self.transition_to_closed() {
            self.dispatcher.channel_event(ChannelEvent::Close {
                code,
                reason: reason.to_string(),
            });
        }
    }

    pub fn connected_url(&self) -> Option<String> {
        self.url.lock().clone()
    }

    pub fn sent(&self) -> Vec<SignalingMessage> {
        self.sent.lock().clone()
    }

    /// Stream of messages as they are sent. Can be taken once.
    pub fn take_outbound(&self) -> Option<mpsc::UnboundedReceiver<SignalingMessage>> {
        self.outbound_rx.lock().take()
    }

    pub fn close_events(&self) -> u32 {
        *self.close_events.lock()
    }

    pub fn is_closed(&self) -> bool {
        *self.state.lock() == MockState::Closed
    }

    fn transition_to_closed(&self) -> bool {
        let mut state = self.state.lock();
        if *state != MockState::Open {
            *state = MockState::Closed;
            return false;
        }
        *state = MockState::Closed;
        *self.close_events.lock() += 1;
        true
    }
}

#[async_trait]
impl SignalingChannel for MockChannel {
    async fn connect(&self, url: &str) -> Result<(), ChannelError> {
        {
            let mut state = self.state.lock();
            match *state {
                MockState::Idle => *state = MockState::Open,
                MockState::Open => return Err(ChannelError::AlreadyConnected),
                MockState::Closed => return Err(ChannelError::Closed),
            }
        }
        *self.url.lock() = Some(url.to_string());
        self.dispatcher.channel_event(ChannelEvent::Open);
        Ok(())
    }

    fn send(&self, message: &SignalingMessage) -> Result<(), ChannelError> {
        match *self.state.lock() {
            MockState::Idle => return Err(ChannelError::NotConnected),
            MockState::Closed => return Err(ChannelError::Closed),
            MockState::Open => {}
        }
        // Round-trip through the codec so tests see exactly what the wire would carry.
        let text = super::encode_outbound(message)?;
        let decoded =
            protocol::decode(&text).map_err(|err| ChannelError::Encode(err.to_string()))?;
        self.sent.lock().push(decoded.clone());
        let _ = self.outbound_tx.send(decoded);
        Ok(())
    }

    fn close(&self) {
        if self.transition_to_closed() {
            self.dispatcher.channel_event(ChannelEvent::Close {
                code: 1000,
                reason: "closed by client".into(),
            });
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineCall {
    SetRemote(SessionDescription),
    SetLocal(SessionDescription),
    CreateAnswer,
    CreateOffer,
    AddIceCandidate(IceCandidateDescriptor),
    Close,
}

#[derive(Default)]
struct Script {
    fail_create: Option<String>,
    fail_set_remote: Option<String>,
    fail_set_local: Option<String>,
    fail_create_answer: Option<String>,
    remote_gate: Option<Arc<Notify>>,
}

struct MockShared {
    script: Mutex<Script>,
    calls: Mutex<Vec<EngineCall>>,
    configs: Mutex<Vec<PeerConnectionConfig>>,
    sinks: Mutex<Vec<EngineSink>>,
}

/// Records every call in order. Operations succeed unless told otherwise.
pub struct MockEngine {
    shared: Arc<MockShared>,
}

impl Default for MockEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl MockEngine {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(MockShared {
                script: Mutex::new(Script::default()),
                calls: Mutex::new(Vec::new()),
                configs: Mutex::new(Vec::new()),
                sinks: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn fail_create_peer_connection(&self, reason: &str) {
        self.shared.script.lock().fail_create = Some(reason.to_string());
    }

    pub fn fail_set_remote(&self, reason: &str) {
        self.shared.script.lock().fail_set_remote = Some(reason.to_string());
    }

    pub fn fail_set_local(&self, reason: &str) {
        self.shared.script.lock().fail_set_local = Some(reason.to_string());
    }

    pub fn fail_create_answer(&self, reason: &str) {
        self.shared.script.lock().fail_create_answer = Some(reason.to_string());
    }

    /// Lets every scripted failure succeed from now on.
    pub fn clear_failures(&self) {
        let mut script = self.shared.script.lock();
        script.fail_create = None;
        script.fail_set_remote = None;
        script.fail_set_local = None;
        script.fail_create_answer = None;
    }

    /// `set_remote_description` waits for one `notify_one` per call.
    pub fn hold_remote_description(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.shared.script.lock().remote_gate = Some(gate.clone());
        gate
    }

    pub fn calls(&self) -> Vec<EngineCall> {
        self.shared.calls.lock().clone()
    }

    pub fn created_configs(&self) -> Vec<PeerConnectionConfig> {
        self.shared.configs.lock().clone()
    }

    /// Sink of the most recently created peer connection, for injecting
    /// engine callbacks.
    pub fn last_sink(&self) -> Option<EngineSink> {
        self.shared.sinks.lock().last().cloned()
    }
}

#[async_trait]
impl TransportEngine for MockEngine {
    async fn create_peer_connection(
        &self,
        config: &PeerConnectionConfig,
        sink: EngineSink,
    ) -> Result<Arc<dyn PeerConnection>, EngineError> {
        if let Some(reason) = self.shared.script.lock().fail_create.clone() {
            return Err(EngineError::Engine(reason));
        }
        self.shared.configs.lock().push(config.clone());
        self.shared.sinks.lock().push(sink);
        Ok(Arc::new(MockPeer {
            shared: self.shared.clone(),
        }))
    }
}

struct MockPeer {
    shared: Arc<MockShared>,
}

impl MockPeer {
    fn record(&self, call: EngineCall) {
        self.shared.calls.lock().push(call);
    }

    fn scripted_failure(
        &self,
        pick: impl FnOnce(&Script) -> Option<String>,
    ) -> Option<EngineError> {
        pick(&self.shared.script.lock()).map(EngineError::Engine)
    }
}

#[async_trait]
impl PeerConnection for MockPeer {
    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), EngineError> {
        let gate = self.shared.script.lock().remote_gate.clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        self.record(EngineCall::SetRemote(description));
        match self.scripted_failure(|script| script.fail_set_remote.clone()) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), EngineError> {
        self.record(EngineCall::SetLocal(description));
        match self.scripted_failure(|script| script.fail_set_local.clone()) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn create_answer(&self) -> Result<SessionDescription, EngineError> {
        self.record(EngineCall::CreateAnswer);
        match self.scripted_failure(|script| script.fail_create_answer.clone()) {
            Some(err) => Err(err),
            None => Ok(SessionDescription::answer("v=0\r\ns=mock-answer\r\n")),
        }
    }

    async fn create_offer(&self) -> Result<SessionDescription, EngineError> {
        self.record(EngineCall::CreateOffer);
        Ok(SessionDescription::offer("v=0\r\ns=mock-offer\r\n"))
    }

    async fn add_ice_candidate(
        &self,
        candidate: IceCandidateDescriptor,
    ) -> Result<(), EngineError> {
        self.record(EngineCall::AddIceCandidate(candidate));
        Ok(())
    }

    async fn close(&self) {
        self.record(EngineCall::Close);
    }
}
