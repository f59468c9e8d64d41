use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;

use crate::negotiation::engine::{
    DataChannelHandle, GatheringState, PeerConnectionState, SdpKind, TrackHandle,
};
use crate::negotiation::{NegotiationError, Phase};
use crate::transport::ChannelError;

/// Everything the negotiator reports to the outside world: UI, media
/// consumers, supervisors.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    ChannelOpened,
    Configured { ice_servers: usize },
    PhaseChanged(Phase),
    PlayerCount(u32),
    DescriptionSent(SdpKind),
    ConnectionStateChanged(PeerConnectionState),
    GatheringStateChanged(GatheringState),
    TrackReceived(TrackHandle),
    /// The track is gone; consumers should drop whatever they render from it.
    TrackCleared { track_id: String },
    DataChannelReceived(DataChannelHandle),
    NegotiationFailed(NegotiationError),
    ChannelClosed { code: u16, reason: String },
    ChannelError(ChannelError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    ChannelOpened,
    Configured,
    PhaseChanged,
    PlayerCount,
    DescriptionSent,
    ConnectionStateChanged,
    GatheringStateChanged,
    TrackReceived,
    TrackCleared,
    DataChannelReceived,
    NegotiationFailed,
    ChannelClosed,
    ChannelError,
}

impl SessionEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            SessionEvent::ChannelOpened => EventKind::ChannelOpened,
            SessionEvent::Configured { .. } => EventKind::Configured,
            SessionEvent::PhaseChanged(_) => EventKind::PhaseChanged,
            SessionEvent::PlayerCount(_) => EventKind::PlayerCount,
            SessionEvent::DescriptionSent(_) => EventKind::DescriptionSent,
            SessionEvent::ConnectionStateChanged(_) => EventKind::ConnectionStateChanged,
            SessionEvent::GatheringStateChanged(_) => EventKind::GatheringStateChanged,
            SessionEvent::TrackReceived(_) => EventKind::TrackReceived,
            SessionEvent::TrackCleared { .. } => EventKind::TrackCleared,
            SessionEvent::DataChannelReceived(_) => EventKind::DataChannelReceived,
            SessionEvent::NegotiationFailed(_) => EventKind::NegotiationFailed,
            SessionEvent::ChannelClosed { .. } => EventKind::ChannelClosed,
            SessionEvent::ChannelError(_) => EventKind::ChannelError,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Listener = Arc<dyn Fn(&SessionEvent) + Send + Sync>;

struct Subscription {
    id: SubscriptionId,
    kind: Option<EventKind>,
    listener: Listener,
}

#[derive(Default)]
struct HubInner {
    next_id: AtomicU64,
    subscriptions: RwLock<Vec<Subscription>>,
}

/// Listener registry. Cloning yields another handle to the same registry.
#[derive(Clone, Default)]
pub struct EventHub {
    inner: Arc<HubInner>,
}

impl EventHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, kind: EventKind, listener: F) -> SubscriptionId
    where
        F: Fn(&SessionEvent) + Send + Sync + 'static,
    {
        self.register(Some(kind), Arc::new(listener))
    }

    /// Receives every event regardless of kind.
    pub fn subscribe_all<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&SessionEvent) + Send + Sync + 'static,
    {
        self.register(None, Arc::new(listener))
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscriptions = self.inner.subscriptions.write();
        let before = subscriptions.len();
        subscriptions.retain(|subscription| subscription.id != id);
        subscriptions.len() != before
    }

    pub fn listener_count(&self) -> usize {
        self.inner.subscriptions.read().len()
    }

    /// Delivers in registration order. The registry lock is released before
    /// listeners run.
    pub fn emit(&self, event: &SessionEvent) {
        let kind = event.kind();
        let listeners: Vec<Listener> = self
            .inner
            .subscriptions
            .read()
            .iter()
            .filter(|subscription| subscription.kind.is_none_or(|wanted| wanted == kind))
            .map(|subscription| subscription.listener.clone())
            .collect();
        for listener in listeners {
            listener(event);
        }
    }

    fn register(&self, kind: Option<EventKind>, listener: Listener) -> SubscriptionId {
        let id = SubscriptionId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        self.inner.subscriptions.write().push(Subscription {
            id,
            kind,
            listener,
        });
        id
    }
}
