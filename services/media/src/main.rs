//! Media Bridge control plane (spec §4.B): exposes the channel lifecycle
//! `engine::bridge::HttpBridgeAdapter` drives, while the actual RTP relay
//! loop — one UDP socket per call, bridging the PSTN leg and the AI audio
//! leg — runs in this process, adapted from the teacher's WebRTC `Relay`.

use axum::extract::Path;
use axum::http::StatusCode;
use axum::{
    extract::State,
    routing::{get, post},
    Json, Router,
};
use engine::bridge::{FrameDropCounters, FRAME_DURATION_MS, SAMPLE_RATE_HZ};
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    net::{Ipv4Addr, SocketAddr},
    sync::Arc,
};
use tokio::{net::UdpSocket, sync::RwLock};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

/// One bridged call: a UDP socket relaying 20 ms µ-law/A-law frames between
/// the telephony leg ("side A") and the AI realtime session's audio leg
/// ("side B"), negotiated via a `HELLO <side>` handshake on first contact.
struct Channel {
    id: Uuid,
    call_sid: String,
    socket: Arc<UdpSocket>,
    side_a: Arc<RwLock<Option<SocketAddr>>>,
    side_b: Arc<RwLock<Option<SocketAddr>>>,
    drops: Arc<FrameDropCounters>,
}

/// Largest µ-law/A-law frame at 8 kHz for a 20 ms window, plus handshake slack.
const MAX_FRAME_BYTES: usize = (SAMPLE_RATE_HZ as usize / 1_000 * FRAME_DURATION_MS as usize) + 64;

impl Channel {
    async fn open(call_sid: String) -> anyhow::Result<(Arc<Channel>, u16)> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
        let local_port = socket.local_addr()?.port();
        let socket = Arc::new(socket);
        let channel = Arc::new(Channel {
            id: Uuid::new_v4(),
            call_sid,
            socket: socket.clone(),
            side_a: Arc::new(RwLock::new(None)),
            side_b: Arc::new(RwLock::new(None)),
            drops: Arc::new(FrameDropCounters::new()),
        });

        let relay = channel.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_FRAME_BYTES];
            loop {
                match relay.socket.recv_from(&mut buf).await {
                    Ok((n, from)) => relay.route_frame(&buf[..n], from).await,
                    Err(err) => {
                        tracing::warn!(error = %err, channel_id = %relay.id, "udp recv failed, relay loop exiting");
                        break;
                    }
                }
            }
        });

        Ok((channel, local_port))
    }

    async fn route_frame(&self, frame: &[u8], from: SocketAddr) {
        if frame.starts_with(b"HELLO ") {
            match &frame[6..] {
                b"a" => {
                    *self.side_a.write().await = Some(from);
                    tracing::info!(%from, channel_id = %self.id, "telephony leg bound");
                }
                b"b" => {
                    *self.side_b.write().await = Some(from);
                    tracing::info!(%from, channel_id = %self.id, "ai audio leg bound");
                }
                _ => {}
            }
            return;
        }

        let is_a = self.side_a.read().await.map(|addr| addr == from).unwrap_or(false);
        let is_b = self.side_b.read().await.map(|addr| addr == from).unwrap_or(false);

        if is_a {
            if let Some(to) = *self.side_b.read().await {
                if self.socket.send_to(frame, to).await.is_err() {
                    self.drops.record_outbound_drop();
                }
            } else {
                self.drops.record_outbound_drop();
            }
        } else if is_b {
            if let Some(to) = *self.side_a.read().await {
                if self.socket.send_to(frame, to).await.is_err() {
                    self.drops.record_inbound_drop();
                }
            } else {
                self.drops.record_inbound_drop();
            }
        }
    }
}

#[derive(Clone)]
struct AppState {
    channels: Arc<RwLock<HashMap<Uuid, Arc<Channel>>>>,
}

#[derive(Deserialize)]
struct OpenChannelRequest {
    call_sid: String,
}

#[derive(Serialize)]
struct OpenChannelResponse {
    channel_id: Uuid,
    relay_port: u16,
}

async fn open_channel(
    State(state): State<AppState>,
    Json(request): Json<OpenChannelRequest>,
) -> Result<Json<OpenChannelResponse>, StatusCode> {
    let (channel, port) = Channel::open(request.call_sid)
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    let id = channel.id;
    state.channels.write().await.insert(id, channel);
    Ok(Json(OpenChannelResponse { channel_id: id, relay_port: port }))
}

#[derive(Deserialize)]
struct CloseChannelRequest {
    #[allow(dead_code)]
    reason: String,
}

/// Idempotent: closing an already-closed (or unknown) channel still reports
/// success, matching `BridgeAdapter::close_channel`'s contract.
async fn close_channel(
    State(state): State<AppState>,
    Path(channel_id): Path<Uuid>,
    Json(request): Json<CloseChannelRequest>,
) -> StatusCode {
    if let Some(channel) = state.channels.write().await.remove(&channel_id) {
        tracing::info!(
            channel_id = %channel_id,
            call_sid = %channel.call_sid,
            reason = %request.reason,
            inbound_dropped = channel.drops.inbound_dropped(),
            outbound_dropped = channel.drops.outbound_dropped(),
            "channel closed"
        );
    }
    StatusCode::NO_CONTENT
}

async fn health() -> &'static str {
    "ok"
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let state = AppState {
        channels: Arc::new(RwLock::new(HashMap::new())),
    };

    let app = Router::new()
        .route("/health", get(health))
        .route("/channels", post(open_channel))
        .route("/channels/{channel_id}/close", post(close_channel))
        .with_state(state);

    let port: u16 = std::env::var("MEDIA_PORT").ok().and_then(|v| v.parse().ok()).unwrap_or(8082);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!(%addr, "media bridge service starting");

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(error) => {
            tracing::error!(%error, %addr, "failed to bind media listener");
            return;
        }
    };

    if let Err(error) = axum::serve(listener, app).await {
        tracing::error!(%error, "media server exited with error");
    }
}
