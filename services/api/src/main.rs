//! HTTP facade: telephony webhook ingestion, the voice-answer document the
//! telephony provider fetches when a call connects, and an admin endpoint to
//! reload the emergency-phrase vocabulary without restarting the process.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use dto::{TelephonyWebhookPayload, VoiceAnswerParams};
use engine::detector::DetectionRequest;
use engine::orchestrator::CallOrchestrator;
use engine::store_pg::PgStore;
use engine::telephony::{verify_webhook_signature, CallProgressEvent, HttpTelephonyGateway};
use engine::bridge::HttpBridgeAdapter;
use engine::{Engine, EngineConfig, EngineError, Stores};
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Clone)]
struct AppState {
    engine: Arc<Engine>,
    orchestrator: Arc<CallOrchestrator>,
    store: Arc<PgStore>,
    webhook_secret: String,
}

#[derive(Debug, thiserror::Error)]
enum ApiError {
    #[error("invalid webhook signature")]
    BadSignature,
    #[error(transparent)]
    Engine(#[from] EngineError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::BadSignature => (StatusCode::UNAUTHORIZED, "invalid signature").into_response(),
            ApiError::Engine(EngineError::ConversationNotFound(_)) | ApiError::Engine(EngineError::NoLiveOrchestrator(_)) => {
                StatusCode::NOT_FOUND.into_response()
            }
            ApiError::Engine(EngineError::Validation { detail }) => (StatusCode::BAD_REQUEST, detail).into_response(),
            ApiError::Engine(err) => {
                tracing::error!(?err, "unexpected engine error");
                StatusCode::INTERNAL_SERVER_ERROR.into_response()
            }
        }
    }
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({"status": "ok"}))
}

/// Telephony provider webhook: signature-checked, idempotent against replays
/// and out-of-order delivery (spec §4.A).
async fn telephony_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    let signature = headers
        .get("x-telephony-signature")
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    if !verify_webhook_signature(&state.webhook_secret, &body, signature) {
        return Err(ApiError::BadSignature);
    }

    let payload: TelephonyWebhookPayload = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(err) => {
            tracing::warn!(?err, "malformed telephony webhook body");
            return Ok(StatusCode::BAD_REQUEST);
        }
    };

    state
        .orchestrator
        .handle_telephony_event(CallProgressEvent {
            call_sid: payload.call_sid,
            status: payload.call_status,
            timestamp: payload.timestamp,
        })
        .await?;

    Ok(StatusCode::NO_CONTENT)
}

/// Returned to the telephony provider when a call connects; in production
/// this would be a TwiML-equivalent document pointing the provider at the
/// media bridge's SIP endpoint for this call.
async fn voice_answer(Query(params): Query<VoiceAnswerParams>) -> Json<serde_json::Value> {
    Json(json!({
        "callSid": params.call_sid,
        "action": "bridge",
        "target": format!("sip:{}@media.internal", params.patient_id),
    }))
}

/// Hot-reloads the emergency phrase vocabulary from the database (spec §4.E,
/// admin reload via copy-on-write swap — no restart required).
async fn reload_phrases(State(state): State<AppState>) -> Result<StatusCode, ApiError> {
    state.engine.reload_phrases(state.store.clone()).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
struct TranscriptIngest {
    patient_id: uuid::Uuid,
    conversation_id: Option<uuid::Uuid>,
    utterance: String,
    language: String,
}

/// `services/signaling` posts completed user transcripts here as they arrive
/// over the realtime AI duplex; enqueueing is fire-and-forget from the
/// detector's point of view (spec §4.E).
async fn ingest_transcript(State(state): State<AppState>, Json(body): Json<TranscriptIngest>) -> StatusCode {
    state.engine.detector.enqueue(DetectionRequest {
        patient_id: body.patient_id,
        conversation_id: body.conversation_id,
        utterance: body.utterance,
        language: body.language,
    });
    StatusCode::ACCEPTED
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = EngineConfig::from_env().expect("invalid engine configuration");

    let store = PgStore::connect(&config.database_url, config.rate_per_minute_cents, config.minimum_billable_seconds)
        .await
        .expect("failed to connect to postgres");

    let telephony = Arc::new(HttpTelephonyGateway::new(
        config.telephony_base_url.clone(),
        config.telephony_from_number.clone(),
        config.telephony_account_sid.clone(),
        config.telephony_auth_token.clone(),
    ));
    let bridge = Arc::new(HttpBridgeAdapter::new(config.media_base_url.clone()));

    let stores = Stores {
        conversations: store.clone(),
        alerts: store.clone(),
        phrases: store.clone(),
        schedules: store.clone(),
        invoices: store.clone(),
        orgs: store.clone(),
        patients: store.clone(),
        caregivers: store.clone(),
    };

    let callback_url = std::env::var("VOICE_ANSWER_CALLBACK_URL").unwrap_or_else(|_| "http://127.0.0.1:8081/voice/answer".into());
    let engine = Arc::new(
        Engine::wire(config.clone(), stores, telephony, bridge, callback_url)
            .await
            .expect("failed to wire engine"),
    );
    let _janitor = engine.spawn_janitor(std::time::Duration::from_secs(60));

    let state = AppState {
        orchestrator: engine.orchestrator.clone(),
        engine,
        store,
        webhook_secret: config.telephony_shared_secret.clone(),
    };

    let port: u16 = std::env::var("API_PORT").ok().and_then(|v| v.parse().ok()).unwrap_or(8081);

    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);

    let app = Router::new()
        .route("/health", get(health))
        .route("/webhooks/telephony", post(telephony_webhook))
        .route("/voice/answer", get(voice_answer))
        .route("/admin/phrases/reload", post(reload_phrases))
        .route("/internal/transcripts", post(ingest_transcript))
        .layer(cors)
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!(%addr, "api service starting");

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(error) => {
            tracing::error!(%error, %addr, "failed to bind api listener");
            return;
        }
    };

    if let Err(error) = axum::serve(listener, app).await {
        tracing::error!(%error, "api server exited with error");
    }
}
