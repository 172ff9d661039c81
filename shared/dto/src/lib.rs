//! Wire types that cross a process boundary: telephony webhook payloads, the
//! call-correlation JWT used between `services/api` and `services/signaling`,
//! and the job payloads the scheduler enqueues for the worker to pick up.
//! Domain entities live in `models`; this crate only holds what gets
//! serialized onto the wire.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Progress status values a telephony provider reports, per spec §6.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TelephonyCallStatus {
    Queued,
    Ringing,
    InProgress,
    Completed,
    Busy,
    NoAnswer,
    Failed,
    Canceled,
}

/// Inbound telephony webhook body (spec §6). Accepted as either URL-form or
/// JSON; axum's `Form`/`Json` extractors both deserialize into this type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelephonyWebhookPayload {
    pub call_sid: String,
    pub call_status: TelephonyCallStatus,
    pub timestamp: DateTime<Utc>,
}

/// Claims embedded in the SIP URI correlation parameters and echoed back by
/// the Bridge Adapter / signaling gateway to identify which orchestrator a
/// given SIP INVITE or AI session belongs to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallCorrelationClaims {
    pub call_sid: String,
    pub patient_id: Uuid,
    pub exp: usize,
    pub iat: usize,
}

/// Query parameters accepted by `services/api`'s voice-response endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct VoiceAnswerParams {
    pub call_sid: String,
    pub patient_id: Uuid,
}

/// Payload enqueued onto the scheduler job store for a schedule firing
/// (spec §6, "Scheduler job store").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleFireJob {
    pub schedule_id: Uuid,
    pub patient_id: Uuid,
    pub org_id: Uuid,
}

/// Payload enqueued for a retry attempt in a retry chain (spec §4.F).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryCallJob {
    pub previous_conversation_id: Uuid,
    pub patient_id: Uuid,
    pub org_id: Uuid,
    pub retry_attempt: u32,
    pub original_call_id: Uuid,
}

/// Payload enqueued for the daily billing rollup (spec §4.G).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BillingRollupJob {
    pub org_id: Uuid,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
}
