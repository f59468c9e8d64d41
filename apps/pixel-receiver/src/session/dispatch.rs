//! The single serialization point for everything the negotiator reacts to.
//! Signaling events, engine callbacks and completions of in-flight engine
//! operations all arrive here, so the negotiator never runs concurrently
//! with itself.

use tokio::sync::mpsc;

use crate::negotiation::Completion;
use crate::negotiation::engine::EngineEvent;
use crate::transport::ChannelEvent;

#[derive(Debug)]
pub enum Input {
    Channel(ChannelEvent),
    Engine { generation: u64, event: EngineEvent },
    Completed { generation: u64, completion: Completion },
    Shutdown,
}

#[derive(Clone, Debug)]
pub struct Dispatcher {
    tx: mpsc::UnboundedSender<Input>,
}

impl Dispatcher {
    /// Returns false when the queue's consumer has gone away.
    pub fn post(&self, input: Input) -> bool {
        if self.tx.send(input).is_err() {
            tracing::trace!(target = "negotiation", "dispatch queue closed; input dropped");
            return false;
        }
        true
    }

    pub fn channel_event(&self, event: ChannelEvent) -> bool {
        self.post(Input::Channel(event))
    }

    pub fn shutdown(&self) -> bool {
        self.post(Input::Shutdown)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

#[derive(Debug)]
pub struct DispatchQueue {
    rx: mpsc::UnboundedReceiver<Input>,
}

impl DispatchQueue {
    pub async fn next(&mut self) -> Option<Input> {
        self.rx.recv().await
    }

    pub fn try_next(&mut self) -> Option<Input> {
        self.rx.try_recv().ok()
    }
}

pub fn dispatch_queue() -> (Dispatcher, DispatchQueue) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Dispatcher { tx }, DispatchQueue { rx })
}
