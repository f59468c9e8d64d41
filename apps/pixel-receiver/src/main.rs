use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Args, Parser, builder::BoolishValueParser};
use pixel_receiver_core::config::{
    DEFAULT_SIGNALING_URL, INITIATE_OFFER_ENV, ReceiverConfig, SIGNALING_URL_ENV,
};
use pixel_receiver_core::negotiation::NegotiationRole;
use pixel_receiver_core::negotiation::engine::MediaPacket;
use pixel_receiver_core::session::NegotiationDriver;
use pixel_receiver_core::session::dispatch::dispatch_queue;
use pixel_receiver_core::session::observer::{EventHub, SessionEvent};
use pixel_receiver_core::telemetry::logging::{self, LogConfig, LogLevel};
use pixel_receiver_core::transport::webrtc::WebRtcEngine;
use pixel_receiver_core::transport::websocket::WebSocketChannel;
use tokio::sync::mpsc;

#[derive(Parser, Debug)]
#[command(
    name = "pixel-receiver",
    about = "Receive a Pixel Streaming session over WebRTC",
    version
)]
struct Cli {
    #[arg(
        long,
        env = SIGNALING_URL_ENV,
        default_value = DEFAULT_SIGNALING_URL,
        help = "Signaling server endpoint (ws, wss, http or https)"
    )]
    url: String,

    #[arg(
        long,
        env = INITIATE_OFFER_ENV,
        num_args = 0..=1,
        default_value = "false",
        default_missing_value = "true",
        value_parser = BoolishValueParser::new(),
        value_name = "BOOL",
        help = "Send our own offer once configured instead of waiting for the streamer's"
    )]
    offer: bool,

    #[command(flatten)]
    logging: LoggingArgs,
}

#[derive(Args, Debug, Clone)]
struct LoggingArgs {
    #[arg(
        long = "log-level",
        value_enum,
        env = "PIXEL_LOG_LEVEL",
        default_value_t = LogLevel::Warn,
        help = "Minimum log level (error, warn, info, debug, trace)"
    )]
    level: LogLevel,

    #[arg(
        long = "log-file",
        value_name = "PATH",
        env = "PIXEL_LOG_FILE",
        help = "Write logs to the specified file instead of stderr"
    )]
    file: Option<PathBuf>,
}

impl LoggingArgs {
    fn to_config(&self) -> LogConfig {
        LogConfig {
            level: self.level,
            file: self.file.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let _log_guard = logging::init(&cli.logging.to_config())?;

    let role = if cli.offer {
        NegotiationRole::Offerer
    } else {
        NegotiationRole::Answerer
    };
    let config = ReceiverConfig::new(&cli.url)?.with_role(role);

    let (dispatcher, queue) = dispatch_queue();
    let channel = Arc::new(WebSocketChannel::new(dispatcher.clone()));
    let engine = Arc::new(WebRtcEngine::new().context("failed to initialize webrtc engine")?);
    let mut driver =
        NegotiationDriver::new(channel, engine, dispatcher, queue).with_role(config.role);
    report_session_events(&driver.events());

    let shutdown = driver.dispatcher();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            shutdown.shutdown();
        }
    });

    driver
        .run(config.signaling_url.as_str())
        .await
        .with_context(|| format!("failed to connect to {}", config.signaling_url))?;
    Ok(())
}

/// Stands in for a decoder: consumes the track and reports what arrived.
async fn count_packets(track_id: String, mut packets: mpsc::Receiver<MediaPacket>) {
    let mut count: u64 = 0;
    let mut bytes: u64 = 0;
    while let Some(packet) = packets.recv().await {
        count += 1;
        bytes += packet.payload.len() as u64;
        if count % 1_000 == 0 {
            tracing::debug!(
                target = "pixel_receiver",
                track_id = %track_id,
                count,
                bytes,
                "media flowing"
            );
        }
    }
    tracing::info!(target = "pixel_receiver", track_id = %track_id, count, bytes, "track finished");
}

fn report_session_events(events: &EventHub) {
    events.subscribe_all(|event| match event {
        SessionEvent::PlayerCount(count) => {
            tracing::info!(target = "pixel_receiver", count, "players connected");
        }
        SessionEvent::ConnectionStateChanged(state) => {
            tracing::info!(target = "pixel_receiver", ?state, "peer connection");
        }
        SessionEvent::TrackReceived(track) => {
            tracing::info!(
                target = "pixel_receiver",
                track_id = %track.id,
                stream_id = %track.stream_id,
                kind = ?track.kind,
                "receiving track"
            );
            if let Some(packets) = track.take_packets() {
                tokio::spawn(count_packets(track.id.clone(), packets));
            }
        }
        SessionEvent::TrackCleared { track_id } => {
            tracing::info!(target = "pixel_receiver", track_id = %track_id, "track cleared");
        }
        SessionEvent::NegotiationFailed(err) => {
            tracing::error!(target = "pixel_receiver", error = %err, "negotiation failed");
        }
        SessionEvent::ChannelClosed { code, reason } => {
            tracing::info!(target = "pixel_receiver", code, reason = %reason, "signaling closed");
        }
        _ => {}
    });
}
