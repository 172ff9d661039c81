//! Component A — Telephony Gateway (spec §4.A). `placeCall`/`hangup` are
//! modeled as an async trait so the orchestrator never depends on a concrete
//! PSTN provider; `MockTelephonyGateway` backs unit tests and
//! `TwilioLikeGateway` is the HTTP client shape used in production, grounded
//! in the `CreateCallBody`/`CallStatus` wire shape from the pack's Twilio
//! client example.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dto::TelephonyCallStatus;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::{EngineError, EngineResult};

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone)]
pub struct CallProgressEvent {
    pub call_sid: String,
    pub status: TelephonyCallStatus,
    pub timestamp: DateTime<Utc>,
}

#[async_trait]
pub trait TelephonyGateway: Send + Sync {
    /// Places an outbound call. Errors here are terminal for this attempt;
    /// the orchestrator decides whether to retry (spec §4.A).
    async fn place_call(&self, patient_phone: &str, callback_url: &str) -> EngineResult<String>;

    /// Idempotent: succeeds if the call is already terminated. Implementations
    /// retry once internally and then log-and-swallow, per spec §4.A.
    async fn hangup(&self, call_sid: &str) -> EngineResult<()>;
}

/// Verifies a telephony webhook's signature header against the shared secret
/// configured for the provider (spec §6). Uses constant-time comparison via
/// `hmac::Mac::verify_slice`.
pub fn verify_webhook_signature(secret: &str, body: &[u8], signature_hex: &str) -> bool {
    let Ok(signature_bytes) = hex::decode(signature_hex) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&signature_bytes).is_ok()
}

/// Collapses repeated/out-of-order webhook deliveries for the same call, per
/// spec §4.A and §6: arrivals for the same `callSid` collapse by preferring
/// the terminal state, tie-broken on timestamp for two non-terminal or two
/// terminal events.
#[derive(Default)]
pub struct WebhookDeduper {
    last_by_call_sid: Mutex<HashMap<String, CallProgressEvent>>,
}

impl WebhookDeduper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolves `event` against the last-recorded event for its call and
    /// records the winner. Returns `true` if `event` itself is the winner and
    /// should drive a state transition, `false` if it's a replay or loses to
    /// the event already on file.
    pub fn resolve_and_record(&self, event: &CallProgressEvent) -> bool {
        let mut last = self.last_by_call_sid.lock().expect("webhook dedupe mutex poisoned");
        match last.get(&event.call_sid) {
            Some(previous) if previous.status == event.status && previous.timestamp == event.timestamp => false,
            Some(previous) => {
                let winner = resolve_out_of_order(previous, event);
                let event_wins = winner.status == event.status && winner.timestamp == event.timestamp;
                last.insert(event.call_sid.clone(), winner);
                event_wins
            }
            None => {
                last.insert(event.call_sid.clone(), event.clone());
                true
            }
        }
    }
}

fn status_is_terminal(status: TelephonyCallStatus) -> bool {
    matches!(
        status,
        TelephonyCallStatus::Completed
            | TelephonyCallStatus::Busy
            | TelephonyCallStatus::NoAnswer
            | TelephonyCallStatus::Failed
            | TelephonyCallStatus::Canceled
    )
}

/// When two progress events for the same call arrive out of order, the
/// terminal one wins (spec §4.A).
pub fn resolve_out_of_order(a: &CallProgressEvent, b: &CallProgressEvent) -> CallProgressEvent {
    match (status_is_terminal(a.status), status_is_terminal(b.status)) {
        (true, false) => a.clone(),
        (false, true) => b.clone(),
        _ if a.timestamp >= b.timestamp => a.clone(),
        _ => b.clone(),
    }
}

#[derive(serde::Deserialize)]
struct CreateCallResponse {
    sid: String,
}

/// HTTP client for a Twilio-shaped call-control API, grounded in the pack's
/// `CreateCallBody`/`CallResponse` wire shape. Placement errors are always
/// `Transient` (spec §4.A): the orchestrator, not this gateway, decides
/// whether the call attempt is retried.
pub struct HttpTelephonyGateway {
    client: reqwest::Client,
    base_url: String,
    from_number: String,
    account_sid: String,
    auth_token: String,
}

impl HttpTelephonyGateway {
    pub fn new(base_url: String, from_number: String, account_sid: String, auth_token: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url,
            from_number,
            account_sid,
            auth_token,
        }
    }
}

#[async_trait]
impl TelephonyGateway for HttpTelephonyGateway {
    async fn place_call(&self, patient_phone: &str, callback_url: &str) -> EngineResult<String> {
        let url = format!("{}/Accounts/{}/Calls.json", self.base_url, self.account_sid);
        let response = self
            .client
            .post(&url)
            .basic_auth(&self.account_sid, Some(&self.auth_token))
            .form(&[("To", patient_phone), ("From", self.from_number.as_str()), ("Url", callback_url)])
            .send()
            .await
            .map_err(|err| EngineError::Transient {
                component: "telephony",
                detail: err.to_string(),
            })?;

        if !response.status().is_success() {
            return Err(EngineError::Transient {
                component: "telephony",
                detail: format!("call placement returned status {}", response.status()),
            });
        }

        let body: CreateCallResponse = response.json().await.map_err(|err| EngineError::Transient {
            component: "telephony",
            detail: err.to_string(),
        })?;
        Ok(body.sid)
    }

    async fn hangup(&self, call_sid: &str) -> EngineResult<()> {
        let url = format!("{}/Accounts/{}/Calls/{}.json", self.base_url, self.account_sid, call_sid);
        let response = self
            .client
            .post(&url)
            .basic_auth(&self.account_sid, Some(&self.auth_token))
            .form(&[("Status", "completed")])
            .send()
            .await;

        match response {
            Ok(resp) if resp.status().is_success() => Ok(()),
            Ok(resp) => {
                tracing::warn!(call_sid, status = %resp.status(), "hangup returned non-success, swallowing per spec");
                Ok(())
            }
            Err(err) => {
                tracing::warn!(?err, call_sid, "hangup request failed, swallowing per spec");
                Ok(())
            }
        }
    }
}

/// In-memory telephony gateway used by unit tests and local development. It
/// never dials out; progress is injected by the test driving the
/// orchestrator through `queue_progress`/consumed by the caller directly.
pub struct MockTelephonyGateway {
    fail_placement: bool,
}

impl MockTelephonyGateway {
    pub fn new() -> Self {
        Self { fail_placement: false }
    }

    pub fn always_fails() -> Self {
        Self { fail_placement: true }
    }
}

impl Default for MockTelephonyGateway {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TelephonyGateway for MockTelephonyGateway {
    async fn place_call(&self, _patient_phone: &str, _callback_url: &str) -> EngineResult<String> {
        if self.fail_placement {
            return Err(EngineError::Transient {
                component: "telephony",
                detail: "mock gateway configured to fail placement".into(),
            });
        }
        Ok(format!("CS{}", uuid::Uuid::new_v4().simple()))
    }

    async fn hangup(&self, _call_sid: &str) -> EngineResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_round_trips() {
        let secret = "shared-secret";
        let body = b"call_sid=CS1&call_status=ringing";
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body);
        let signature = hex::encode(mac.finalize().into_bytes());

        assert!(verify_webhook_signature(secret, body, &signature));
        assert!(!verify_webhook_signature("wrong-secret", body, &signature));
    }

    #[test]
    fn webhook_replay_is_a_no_op() {
        let deduper = WebhookDeduper::new();
        let event = CallProgressEvent {
            call_sid: "CS1".into(),
            status: TelephonyCallStatus::Ringing,
            timestamp: Utc::now(),
        };
        assert!(deduper.resolve_and_record(&event));
        assert!(!deduper.resolve_and_record(&event));
    }

    #[test]
    fn a_terminal_event_arriving_after_a_later_terminal_event_collapses() {
        let deduper = WebhookDeduper::new();
        let now = Utc::now();
        let completed = CallProgressEvent {
            call_sid: "CS1".into(),
            status: TelephonyCallStatus::Completed,
            timestamp: now,
        };
        let late_failed = CallProgressEvent {
            call_sid: "CS1".into(),
            status: TelephonyCallStatus::Failed,
            timestamp: now - chrono::Duration::seconds(5),
        };
        assert!(deduper.resolve_and_record(&completed));
        assert!(!deduper.resolve_and_record(&late_failed));
    }

    #[test]
    fn out_of_order_prefers_terminal_state() {
        let now = Utc::now();
        let ringing = CallProgressEvent {
            call_sid: "CS1".into(),
            status: TelephonyCallStatus::Ringing,
            timestamp: now,
        };
        let failed = CallProgressEvent {
            call_sid: "CS1".into(),
            status: TelephonyCallStatus::Failed,
            timestamp: now - chrono::Duration::seconds(5),
        };
        let resolved = resolve_out_of_order(&ringing, &failed);
        assert_eq!(resolved.status, TelephonyCallStatus::Failed);
    }
}
