pub mod dispatch;
pub mod observer;

use std::sync::Arc;

use tracing::{debug, info};

use crate::negotiation::engine::TransportEngine;
use crate::negotiation::{NegotiationRole, Negotiator, Phase};
use crate::transport::{ChannelError, ChannelEvent, SignalingChannel};
use dispatch::{DispatchQueue, Dispatcher, Input};
use observer::EventHub;

/// Owns one signaling session end to end: connects the channel, then feeds
/// every queued input to the negotiator until the channel closes or a
/// shutdown is posted.
pub struct NegotiationDriver {
    channel: Arc<dyn SignalingChannel>,
    negotiator: Negotiator,
    dispatcher: Dispatcher,
    queue: DispatchQueue,
    role: NegotiationRole,
}

impl NegotiationDriver {
    /// `dispatcher` must be the one `channel` posts its events to.
    pub fn new(
        channel: Arc<dyn SignalingChannel>,
        engine: Arc<dyn TransportEngine>,
        dispatcher: Dispatcher,
        queue: DispatchQueue,
    ) -> Self {
        let negotiator = Negotiator::new(
            engine,
            channel.clone(),
            dispatcher.clone(),
            EventHub::new(),
        );
        Self {
            channel,
            negotiator,
            dispatcher,
            queue,
            role: NegotiationRole::Answerer,
        }
    }

    pub fn with_role(mut self, role: NegotiationRole) -> Self {
        self.role = role;
        self
    }

    pub fn role(&self) -> NegotiationRole {
        self.role
    }

    /// Shared with the negotiator; subscribe before calling [`run`](Self::run).
    pub fn events(&self) -> EventHub {
        self.negotiator.events().clone()
    }

    /// Posting [`Input::Shutdown`] through this stops [`run`](Self::run).
    pub fn dispatcher(&self) -> Dispatcher {
        self.dispatcher.clone()
    }

    pub fn negotiator(&self) -> &Negotiator {
        &self.negotiator
    }

    pub async fn run(&mut self, url: &str) -> Result<(), ChannelError> {
        info!(target = "session", url, role = ?self.role, "connecting to signaling server");
        self.channel.connect(url).await?;
        while let Some(input) = self.queue.next().await {
            if !self.process(input).await {
                break;
            }
        }
        debug!(target = "session", phase = ?self.negotiator.phase(), "negotiation driver stopped");
        Ok(())
    }

    /// Handles one input. Returns false once the session is over.
    pub async fn process(&mut self, input: Input) -> bool {
        match input {
            Input::Shutdown => {
                info!(target = "session", "shutdown requested");
                self.negotiator.handle(Input::Shutdown).await;
                self.channel.close();
                // close() posts its Close synchronously; deliver it so observers see it.
                while let Some(input) = self.queue.try_next() {
                    if matches!(input, Input::Channel(ChannelEvent::Close { .. })) {
                        self.negotiator.handle(input).await;
                        break;
                    }
                }
                false
            }
            Input::Channel(ChannelEvent::Close { .. }) => {
                self.negotiator.handle(input).await;
                false
            }
            input => {
                let before = self.negotiator.phase();
                self.negotiator.handle(input).await;
                let after = self.negotiator.phase();
                if self.role == NegotiationRole::Offerer
                    && after == Phase::Configured
                    && before != after
                {
                    self.negotiator.start_offer();
                }
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::dispatch::dispatch_queue;
    use crate::session::observer::{EventKind, SessionEvent};
    use crate::transport::mock::{EngineCall, MockChannel, MockEngine};
    use parking_lot::Mutex;
    use signaling_proto::{PeerConnectionOptions, SignalingMessage};

    fn driver() -> (NegotiationDriver, Arc<MockChannel>, Arc<MockEngine>) {
        let (dispatcher, queue) = dispatch_queue();
        let channel = Arc::new(MockChannel::new(dispatcher.clone()));
        let engine = Arc::new(MockEngine::new());
        let driver = NegotiationDriver::new(channel.clone(), engine.clone(), dispatcher, queue);
        (driver, channel, engine)
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn shutdown_closes_channel_and_stops() {
        let (mut driver, channel, engine) = driver();
        let closed = Arc::new(Mutex::new(Vec::new()));
        let seen = closed.clone();
        driver.events().subscribe(EventKind::ChannelClosed, move |event| {
            if let SessionEvent::ChannelClosed { code, .. } = event {
                seen.lock().push(*code);
            }
        });
        let (configured_tx, mut configured_rx) = tokio::sync::mpsc::unbounded_channel();
        driver.events().subscribe(EventKind::Configured, move |_| {
            let _ = configured_tx.send(());
        });
        let shutdown = driver.dispatcher();

        let task = tokio::spawn(async move {
            driver.run("ws://signaling.test").await.expect("run");
            driver
        });
        channel.deliver(SignalingMessage::Config {
            peer_connection_options: PeerConnectionOptions::default(),
        });
        configured_rx.recv().await.expect("configured");
        shutdown.shutdown();
        let driver = task.await.expect("driver task");

        assert!(channel.is_closed());
        assert_eq!(channel.connected_url().as_deref(), Some("ws://signaling.test"));
        assert_eq!(*closed.lock(), vec![1000]);
        assert!(driver.negotiator().session().is_none());
        assert!(engine.calls().contains(&EngineCall::Close));
        assert_eq!(driver.negotiator().phase(), Phase::Uninitialized);
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn offerer_role_offers_once_configured() {
        let (driver, channel, _engine) = driver();
        assert_eq!(driver.role(), NegotiationRole::Answerer);
        let mut driver = driver.with_role(NegotiationRole::Offerer);
        assert_eq!(driver.role(), NegotiationRole::Offerer);
        let mut outbound = channel.take_outbound().expect("outbound");

        let task = tokio::spawn(async move {
            driver.run("ws://signaling.test").await.expect("run");
            driver
        });
        channel.deliver(SignalingMessage::Config {
            peer_connection_options: PeerConnectionOptions::default(),
        });
        let sent = outbound.recv().await.expect("offer sent");
        assert!(matches!(sent, SignalingMessage::Offer { .. }));

        channel.remote_close(1001, "going away");
        let driver = task.await.expect("driver task");
        assert_eq!(driver.negotiator().phase(), Phase::Uninitialized);
    }

    #[test_timeout::tokio_timeout_test(5)]
    async fn connect_failure_is_returned() {
        let (mut driver, channel, _engine) = driver();
        channel.close();
        assert_eq!(
            driver.run("ws://signaling.test").await,
            Err(ChannelError::Closed)
        );
        assert!(channel.connected_url().is_none());
    }
}
