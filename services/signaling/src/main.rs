//! Component C — Realtime AI Session gateway (spec §4.C). Bridges a
//! call-correlated WebSocket from the media bridge to the realtime AI
//! provider's own duplex, applies the barge-in policy, tracks presence in
//! Redis, and forwards completed user transcripts to the emergency detector.
//! Adapted from the teacher's JWT-gated `/ws` endpoint, generalized from
//! tenant/user presence to call-session presence.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::{
    extract::{Query, State},
    http::HeaderMap,
    response::IntoResponse,
    routing::get,
    Router,
};
use base64::Engine as _;
use dto::CallCorrelationClaims;
use engine::ai_session::BargeInGuard;
use engine::realtime_session_label;
use futures::{SinkExt, StreamExt};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_tungstenite::tungstenite::Message as UpstreamMessage;

#[derive(Clone)]
struct AppState {
    decoding_key: Arc<DecodingKey>,
    validation: Validation,
    redis: Option<redis::aio::ConnectionManager>,
    ai_endpoint: String,
    ai_api_key: String,
    api_base_url: String,
    http: reqwest::Client,
}

#[derive(Deserialize)]
struct WsParams {
    token: Option<String>,
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|s| s.to_string())
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    Query(params): Query<WsParams>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let token = bearer_token(&headers).or(params.token);
    let Some(token) = token else {
        return axum::http::StatusCode::UNAUTHORIZED.into_response();
    };

    let claims = match decode::<CallCorrelationClaims>(&token, &state.decoding_key, &state.validation) {
        Ok(d) => d.claims,
        Err(err) => {
            tracing::warn!(error = %err, "call correlation token decode failed");
            return axum::http::StatusCode::UNAUTHORIZED.into_response();
        }
    };

    ws.on_upgrade(move |socket| handle_socket(socket, state, claims)).into_response()
}

/// Forwards a completed user transcript to `services/api` for emergency
/// phrase detection (spec §4.E). Best-effort: a delivery failure here must
/// never interrupt the call.
async fn report_transcript(state: &AppState, claims: &CallCorrelationClaims, transcript: &str) {
    let body = serde_json::json!({
        "patient_id": claims.patient_id,
        "conversation_id": null,
        "utterance": transcript,
        "language": "en",
    });
    if let Err(err) = state
        .http
        .post(format!("{}/internal/transcripts", state.api_base_url))
        .json(&body)
        .send()
        .await
    {
        tracing::warn!(?err, call_sid = %claims.call_sid, "failed to forward transcript for detection");
    }
}

async fn handle_socket(socket: WebSocket, state: AppState, claims: CallCorrelationClaims) {
    let presence_key = realtime_session_label(&claims.call_sid);

    if let Some(mut conn) = state.redis.clone() {
        let _ = redis::cmd("SET")
            .arg(&presence_key)
            .arg(claims.patient_id.to_string())
            .arg("EX")
            .arg(60)
            .query_async::<_, ()>(&mut conn)
            .await;
    }

    let upstream = match tokio_tungstenite::connect_async(
        http::Request::builder()
            .uri(state.ai_endpoint.as_str())
            .header("Authorization", format!("Bearer {}", state.ai_api_key))
            .header("Sec-WebSocket-Key", tokio_tungstenite::tungstenite::handshake::client::generate_key())
            .header("Sec-WebSocket-Version", "13")
            .header("Connection", "Upgrade")
            .header("Upgrade", "websocket")
            .header("Host", "realtime.invalid")
            .body(())
            .expect("static realtime connect request is well-formed"),
    )
    .await
    {
        Ok((stream, _response)) => stream,
        Err(err) => {
            tracing::error!(?err, call_sid = %claims.call_sid, "failed to connect to realtime ai provider");
            return;
        }
    };

    let (mut upstream_tx, mut upstream_rx) = upstream.split();
    let (mut downstream_tx, mut downstream_rx) = socket.split();

    let barge_in = Arc::new(BargeInGuard::new());
    let mut refresh_interval = tokio::time::interval(std::time::Duration::from_secs(30));
    let refresh_redis = state.redis.clone();
    let refresh_key = presence_key.clone();
    let refresh_handle = tokio::spawn(async move {
        loop {
            refresh_interval.tick().await;
            if let Some(mut conn) = refresh_redis.clone() {
                let _ = redis::cmd("EXPIRE").arg(&refresh_key).arg(60).query_async::<_, ()>(&mut conn).await;
            }
        }
    });

    // Both legs that want to speak upstream (forwarded audio, barge-in
    // cancellation) funnel through one channel so only one task owns the
    // upstream sink.
    let (control_tx, mut control_rx) = tokio::sync::mpsc::unbounded_channel::<UpstreamMessage>();

    let upstream_writer = async move {
        while let Some(msg) = control_rx.recv().await {
            if upstream_tx.send(msg).await.is_err() {
                break;
            }
        }
    };

    let downstream_control_tx = control_tx.clone();
    let downstream_to_upstream = async move {
        while let Some(Ok(msg)) = downstream_rx.next().await {
            match msg {
                Message::Binary(pcm_frame) => {
                    let audio = base64::engine::general_purpose::STANDARD.encode(&pcm_frame);
                    let append = serde_json::json!({"type": "input_audio_buffer.append", "audio": audio});
                    if downstream_control_tx.send(UpstreamMessage::Text(append.to_string().into())).is_err() {
                        break;
                    }
                }
                Message::Close(_) => {
                    let cancel = serde_json::json!({"type": "response.cancel"});
                    let _ = downstream_control_tx.send(UpstreamMessage::Text(cancel.to_string().into()));
                    break;
                }
                _ => {}
            }
        }
    };

    let downstream_barge_in = barge_in.clone();
    let upstream_state = state.clone();
    let upstream_to_downstream = async move {
        while let Some(Ok(frame)) = upstream_rx.next().await {
            let UpstreamMessage::Text(text) = frame else { continue };
            let Ok(event) = serde_json::from_str::<serde_json::Value>(&text) else { continue };
            let event_type = event.get("type").and_then(|v| v.as_str()).unwrap_or_default();

            match event_type {
                "response.created" => downstream_barge_in.on_assistant_audio_started(),
                "response.done" | "response.audio.done" => downstream_barge_in.on_assistant_turn_completed(),
                "input_audio_buffer.speech_started" => {
                    if downstream_barge_in.on_user_speech_started() {
                        let cancel = serde_json::json!({"type": "response.cancel"});
                        let _ = control_tx.send(UpstreamMessage::Text(cancel.to_string().into()));
                    }
                }
                "response.audio.delta" => {
                    if downstream_barge_in.should_discard_delta() {
                        continue;
                    }
                    if let Some(delta) = event.get("delta").and_then(|v| v.as_str()) {
                        if let Ok(pcm) = base64::engine::general_purpose::STANDARD.decode(delta) {
                            if downstream_tx.send(Message::Binary(pcm)).await.is_err() {
                                break;
                            }
                        }
                    }
                }
                "conversation.item.input_audio_transcription.completed" => {
                    if let Some(transcript) = event.get("transcript").and_then(|v| v.as_str()) {
                        report_transcript(&upstream_state, &claims, transcript).await;
                    }
                }
                "error" => {
                    tracing::warn!(?event, call_sid = %claims.call_sid, "realtime ai provider reported an error");
                }
                _ => {}
            }
        }
    };

    tokio::join!(upstream_writer, downstream_to_upstream, upstream_to_downstream);

    refresh_handle.abort();
    if let Some(mut conn) = state.redis.clone() {
        let _ = redis::cmd("DEL").arg(&presence_key).query_async::<_, ()>(&mut conn).await;
    }
}

async fn health() -> &'static str {
    "ok"
}

#[tokio::main]
async fn main() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let jwt_secret = std::env::var("CALL_CORRELATION_SECRET").unwrap_or_else(|_| "dev_secret_change_me".to_string());
    let decoding_key = Arc::new(DecodingKey::from_secret(jwt_secret.as_bytes()));
    let mut validation = Validation::new(Algorithm::HS256);
    validation.validate_exp = true;

    let redis_url = std::env::var("REDIS_URL").ok();
    let redis_manager = if let Some(url) = redis_url {
        match redis::Client::open(url) {
            Ok(client) => match client.get_tokio_connection_manager().await {
                Ok(mgr) => Some(mgr),
                Err(err) => {
                    tracing::warn!(error = %err, "failed to connect to redis");
                    None
                }
            },
            Err(err) => {
                tracing::warn!(error = %err, "invalid redis url");
                None
            }
        }
    } else {
        None
    };

    let state = AppState {
        decoding_key,
        validation,
        redis: redis_manager,
        ai_endpoint: std::env::var("AI_ENDPOINT").unwrap_or_else(|_| "wss://realtime.invalid/v1/sessions".into()),
        ai_api_key: std::env::var("AI_API_KEY").unwrap_or_default(),
        api_base_url: std::env::var("API_BASE_URL").unwrap_or_else(|_| "http://127.0.0.1:8081".into()),
        http: reqwest::Client::new(),
    };

    let app = Router::new()
        .route("/health", get(health))
        .route("/ws", get(ws_handler))
        .with_state(state);

    let port: u16 = std::env::var("SIGNALING_PORT").ok().and_then(|v| v.parse().ok()).unwrap_or(8080);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!(%addr, "signaling service starting");

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(error) => {
            tracing::error!(%error, %addr, "failed to bind signaling listener");
            return;
        }
    };

    if let Err(error) = axum::serve(listener, app).await {
        tracing::error!(%error, "signaling server exited with error");
    }
}
