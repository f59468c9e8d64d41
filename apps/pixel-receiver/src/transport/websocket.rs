use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use futures_util::stream::SplitStream;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use signaling_proto::SignalingMessage;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_tungstenite::tungstenite::error::ProtocolError;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};

use super::{ChannelError, ChannelEvent, SignalingChannel, dispatch_text, encode_outbound};
use crate::config::websocket_url;
use crate::session::dispatch::Dispatcher;

const CLOSE_NORMAL: u16 = 1000;
const CLOSE_ABNORMAL: u16 = 1006;

type WsReader = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

enum State {
    Idle,
    Connecting,
    Open {
        send_tx: mpsc::UnboundedSender<Message>,
        tasks: Vec<JoinHandle<()>>,
    },
    Closed,
}

/// Signaling channel over a single WebSocket connection. Every event is
/// posted to the dispatcher handed in at construction.
pub struct WebSocketChannel {
    dispatcher: Dispatcher,
    state: Mutex<State>,
    // Guards the single close event; set by whichever side closes first.
    closed: Arc<AtomicBool>,
}

impl WebSocketChannel {
    pub fn new(dispatcher: Dispatcher) -> Self {
        Self {
            dispatcher,
            state: Mutex::new(State::Idle),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(*self.state.lock(), State::Open { .. })
    }
}

#[async_trait]
impl SignalingChannel for WebSocketChannel {
    async fn connect(&self, url: &str) -> Result<(), ChannelError> {
        {
            let mut state = self.state.lock();
            match *state {
                State::Idle => *state = State::Connecting,
                State::Closed => return Err(ChannelError::Closed),
                State::Connecting | State::Open { .. } => {
                    return Err(ChannelError::AlreadyConnected);
                }
            }
        }

        let target = match websocket_url(url) {
            Ok(target) => target,
            Err(err) => {
                *self.state.lock() = State::Idle;
                return Err(ChannelError::InvalidUrl {
                    url: url.to_string(),
                    reason: err.to_string(),
                });
            }
        };
        let ws_stream = match connect_async(target.as_str()).await {
            Ok((stream, _)) => stream,
            Err(err) => {
                *self.state.lock() = State::Idle;
                let err = ChannelError::Connect(err.to_string());
                self.dispatcher.channel_event(ChannelEvent::Error(err.clone()));
                return Err(err);
            }
        };
        tracing::debug!(target = "signaling", url = %target, "signaling websocket connected");

        let (mut ws_write, ws_read) = ws_stream.split();
        let (send_tx, mut send_rx) = mpsc::unbounded_channel::<Message>();

        let writer = tokio::spawn(async move {
            while let Some(message) = send_rx.recv().await {
                let closing = matches!(message, Message::Close(_));
                if ws_write.send(message).await.is_err() || closing {
                    break;
                }
            }
        });

        let mut state = self.state.lock();
        if !matches!(*state, State::Connecting) {
            // close() raced the handshake.
            writer.abort();
            return Err(ChannelError::Closed);
        }
        // Open goes out before the reader can post any message.
        self.dispatcher.channel_event(ChannelEvent::Open);
        let reader = tokio::spawn(read_frames(
            ws_read,
            self.dispatcher.clone(),
            self.closed.clone(),
        ));
        *state = State::Open {
            send_tx,
            tasks: vec![writer, reader],
        };
        Ok(())
    }

    fn send(&self, message: &SignalingMessage) -> Result<(), ChannelError> {
        let state = self.state.lock();
        let State::Open { send_tx, .. } = &*state else {
            return Err(match *state {
                State::Closed => ChannelError::Closed,
                _ => ChannelError::NotConnected,
            });
        };
        let text = encode_outbound(message)?;
        send_tx
            .send(Message::Text(text))
            .map_err(|_| ChannelError::Closed)
    }

    fn close(&self) {
        let previous = std::mem::replace(&mut *self.state.lock(), State::Closed);
        let State::Open { send_tx, tasks } = previous else {
            return;
        };
        let _ = send_tx.send(Message::Close(Some(CloseFrame {
            code: CloseCode::Normal,
            reason: "closed by client".into(),
        })));
        // Writer drains the close frame and exits on its own.
        for task in tasks.into_iter().skip(1) {
            task.abort();
        }
        if !self.closed.swap(true, Ordering::SeqCst) {
            tracing::debug!(target = "signaling", "signaling websocket closed by client");
            self.dispatcher.channel_event(ChannelEvent::Close {
                code: CLOSE_NORMAL,
                reason: "closed by client".into(),
            });
        }
    }
}

impl Drop for WebSocketChannel {
    fn drop(&mut self) {
        if let State::Open { tasks, .. } = &mut *self.state.lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
    }
}

async fn read_frames(mut ws_read: WsReader, dispatcher: Dispatcher, closed: Arc<AtomicBool>) {
    let mut close = (CLOSE_ABNORMAL, String::from("connection lost"));
    while let Some(frame) = ws_read.next().await {
        match frame {
            Ok(Message::Text(text)) => dispatch_text(&dispatcher, &text),
            Ok(Message::Binary(data)) => match String::from_utf8(data) {
                Ok(text) => dispatch_text(&dispatcher, &text),
                Err(_) => tracing::warn!(
                    target = "signaling",
                    "dropping non-utf8 binary signaling frame"
                ),
            },
            Ok(Message::Close(frame)) => {
                close = match frame {
                    Some(frame) => (u16::from(frame.code), frame.reason.into_owned()),
                    None => (CLOSE_NORMAL, String::new()),
                };
                break;
            }
            Ok(_) => {}
            Err(err) => {
                match &err {
                    WsError::ConnectionClosed
                    | WsError::AlreadyClosed
                    | WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake) => {
                        tracing::debug!(target = "signaling", "signaling websocket closed: {err}");
                    }
                    _ => {
                        tracing::warn!(target = "signaling", "signaling websocket error: {err}");
                        dispatcher.channel_event(ChannelEvent::Error(ChannelError::Transport(
                            err.to_string(),
                        )));
                    }
                }
                break;
            }
        }
    }
    if !closed.swap(true, Ordering::SeqCst) {
        let (code, reason) = close;
        tracing::debug!(
            target = "signaling",
            code,
            reason = %reason,
            "signaling websocket closed by peer"
        );
        dispatcher.channel_event(ChannelEvent::Close { code, reason });
    }
}
