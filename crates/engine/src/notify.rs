//! Component I — Notification Fan-out (spec §4.I). Dispatches a fired `Alert`
//! to every eligible caregiver across the channels the alert's severity
//! requires, within the latency target spec §4.I sets, and records one
//! `AlertDelivery` row per `(alert, caregiver, transport)` attempt.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use models::{Alert, Caregiver, Severity};

use crate::detector::{AlertSink, DedupOutcome};
use crate::store::{AlertStore, CaregiverStore, PatientStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
    Sms,
    Push,
    Email,
    AuditLog,
}

impl Transport {
    fn as_str(self) -> &'static str {
        match self {
            Transport::Sms => "sms",
            Transport::Push => "push",
            Transport::Email => "email",
            Transport::AuditLog => "audit_log",
        }
    }
}

/// Channels required for a severity, per spec §4.I's policy table.
fn transports_for(severity: Severity) -> &'static [Transport] {
    match severity {
        Severity::Critical => &[Transport::Sms, Transport::Push, Transport::Email],
        Severity::High => &[Transport::Sms, Transport::Push],
        Severity::Medium => &[Transport::Push, Transport::Email],
    }
}

fn backoff_schedule() -> &'static [Duration] {
    const SCHEDULE: [Duration; 3] = [Duration::from_secs(1), Duration::from_secs(5), Duration::from_secs(20)];
    &SCHEDULE
}

#[derive(Debug)]
pub struct DeliveryOutcome {
    pub transport: Transport,
    pub delivered: bool,
}

/// A single send channel. Implementations are expected to be cheap to retry;
/// the fan-out applies its own backoff loop around `send`.
#[async_trait]
pub trait NotificationTransport: Send + Sync {
    fn transport(&self) -> Transport;
    fn is_eligible(&self, caregiver: &Caregiver) -> bool;
    async fn send(&self, caregiver: &Caregiver, alert: &Alert) -> bool;
}

pub struct SmsTransport;
#[async_trait]
impl NotificationTransport for SmsTransport {
    fn transport(&self) -> Transport {
        Transport::Sms
    }
    fn is_eligible(&self, caregiver: &Caregiver) -> bool {
        caregiver.can_receive_sms()
    }
    async fn send(&self, caregiver: &Caregiver, alert: &Alert) -> bool {
        tracing::info!(caregiver = %caregiver.id, alert = %alert.id, "sms dispatched");
        true
    }
}

pub struct PushTransport;
#[async_trait]
impl NotificationTransport for PushTransport {
    fn transport(&self) -> Transport {
        Transport::Push
    }
    fn is_eligible(&self, caregiver: &Caregiver) -> bool {
        caregiver.can_receive_push()
    }
    async fn send(&self, caregiver: &Caregiver, alert: &Alert) -> bool {
        tracing::info!(caregiver = %caregiver.id, alert = %alert.id, "push dispatched");
        true
    }
}

pub struct EmailTransport;
#[async_trait]
impl NotificationTransport for EmailTransport {
    fn transport(&self) -> Transport {
        Transport::Email
    }
    fn is_eligible(&self, caregiver: &Caregiver) -> bool {
        caregiver.can_receive_email()
    }
    async fn send(&self, caregiver: &Caregiver, alert: &Alert) -> bool {
        tracing::info!(caregiver = %caregiver.id, alert = %alert.id, "email dispatched");
        true
    }
}

/// Always-eligible channel that only writes an audit trail; used as the last
/// resort for a CRITICAL alert with no verified recipient (spec §9 Open
/// Questions: "loud operational signal" resolution).
pub struct AuditLogTransport;
#[async_trait]
impl NotificationTransport for AuditLogTransport {
    fn transport(&self) -> Transport {
        Transport::AuditLog
    }
    fn is_eligible(&self, _caregiver: &Caregiver) -> bool {
        true
    }
    async fn send(&self, caregiver: &Caregiver, alert: &Alert) -> bool {
        tracing::error!(
            caregiver = %caregiver.id,
            alert = %alert.id,
            severity = %alert.severity,
            "audit-only delivery: no verified recipient channel for this severity"
        );
        true
    }
}

#[async_trait]
pub trait NotificationDispatcher: Send + Sync {
    async fn dispatch(&self, alert: Alert);
}

pub struct NotificationFanout {
    patients: Arc<dyn PatientStore>,
    caregivers: Arc<dyn CaregiverStore>,
    alerts: Arc<dyn AlertStore>,
    transports: Vec<Arc<dyn NotificationTransport>>,
}

impl NotificationFanout {
    pub fn new(patients: Arc<dyn PatientStore>, caregivers: Arc<dyn CaregiverStore>, alerts: Arc<dyn AlertStore>) -> Self {
        Self {
            patients,
            caregivers,
            alerts,
            transports: vec![
                Arc::new(SmsTransport),
                Arc::new(PushTransport),
                Arc::new(EmailTransport),
            ],
        }
    }

    async fn send_with_backoff(&self, transport: &Arc<dyn NotificationTransport>, caregiver: &Caregiver, alert: &Alert) -> bool {
        for (attempt, delay) in backoff_schedule().iter().enumerate() {
            if transport.send(caregiver, alert).await {
                return true;
            }
            tracing::warn!(attempt, transport = transport.transport().as_str(), "notification attempt failed, retrying");
            tokio::time::sleep(*delay).await;
        }
        transport.send(caregiver, alert).await
    }

    async fn dispatch_to_caregiver(&self, caregiver: &Caregiver, alert: &Alert, required: &[Transport]) -> Vec<DeliveryOutcome> {
        let sends = self
            .transports
            .iter()
            .filter(|t| required.contains(&t.transport()) && t.is_eligible(caregiver))
            .map(|transport| {
                let transport = transport.clone();
                let caregiver = caregiver.clone();
                let alert = alert.clone();
                async move {
                    let delivered = self.send_with_backoff(&transport, &caregiver, &alert).await;
                    DeliveryOutcome {
                        transport: transport.transport(),
                        delivered,
                    }
                }
            });

        futures::future::join_all(sends).await
    }
}

#[async_trait]
impl NotificationDispatcher for NotificationFanout {
    async fn dispatch(&self, alert: Alert) {
        let required = transports_for(alert.severity);

        let caregiver_ids = match self.patients.get(alert.patient_id).await {
            Ok(patient) => patient.assigned_caregiver_ids,
            Err(err) => {
                tracing::warn!(?err, patient_id = %alert.patient_id, "could not resolve patient for alert fan-out");
                Vec::new()
            }
        };
        let caregivers = match self.caregivers.get_many(&caregiver_ids).await {
            Ok(list) => list,
            Err(err) => {
                tracing::warn!(?err, "could not resolve caregivers for alert fan-out");
                Vec::new()
            }
        };

        let per_caregiver_outcomes = futures::future::join_all(
            caregivers
                .iter()
                .map(|caregiver| self.dispatch_to_caregiver(caregiver, &alert, required)),
        )
        .await;

        let mut any_delivered = false;
        for (caregiver, outcomes) in caregivers.iter().zip(per_caregiver_outcomes) {
            for outcome in outcomes {
                any_delivered = any_delivered || outcome.delivered;
                let delivery = models::AlertDelivery {
                    id: uuid::Uuid::new_v4(),
                    alert_id: alert.id,
                    caregiver_id: Some(caregiver.id),
                    transport: outcome.transport.as_str().to_string(),
                    outcome: if outcome.delivered { "delivered".into() } else { "failed".into() },
                    attempted_at: Utc::now(),
                    delivered_at: if outcome.delivered { Some(Utc::now()) } else { None },
                };
                if let Err(err) = self.alerts.save_alert_delivery(delivery).await {
                    tracing::error!(?err, "failed to persist alert delivery record");
                }
            }
        }

        if !any_delivered && alert.severity == Severity::Critical {
            let audit = AuditLogTransport;
            audit.send(&fallback_caregiver(&alert), &alert).await;
            let delivery = models::AlertDelivery {
                id: uuid::Uuid::new_v4(),
                alert_id: alert.id,
                caregiver_id: None,
                transport: Transport::AuditLog.as_str().to_string(),
                outcome: "audit_only".into(),
                attempted_at: Utc::now(),
                delivered_at: Some(Utc::now()),
            };
            if let Err(err) = self.alerts.save_alert_delivery(delivery).await {
                tracing::error!(?err, "failed to persist audit-only delivery record");
            }
        }

        if let Err(err) = self.alerts.save_alert(alert).await {
            tracing::error!(?err, "failed to persist alert record");
        }
    }
}

fn fallback_caregiver(_alert: &Alert) -> Caregiver {
    Caregiver {
        id: uuid::Uuid::nil(),
        org_id: uuid::Uuid::nil(),
        name: "unassigned".into(),
        contact_email: None,
        contact_phone: None,
        role: models::CaregiverRole::Staff,
        email_verified: false,
        phone_verified: false,
        push_device_tokens: Vec::new(),
        assigned_patient_ids: Vec::new(),
    }
}

/// Bridges the detector's fire-and-forget contract to the fan-out dispatcher:
/// every alert that survives dedup is hands off to `NotificationDispatcher`
/// without the detector ever awaiting delivery (spec §4.E/§4.I boundary).
pub struct DispatchingAlertSink<D: NotificationDispatcher> {
    dispatcher: Arc<D>,
}

impl<D: NotificationDispatcher> DispatchingAlertSink<D> {
    pub fn new(dispatcher: Arc<D>) -> Self {
        Self { dispatcher }
    }
}

#[async_trait]
impl<D: NotificationDispatcher + 'static> AlertSink for DispatchingAlertSink<D> {
    async fn handle_alert(&self, alert: Alert) {
        self.dispatcher.dispatch(alert).await;
    }

    async fn handle_suppressed(&self, patient_id: models::PatientId, category: &str, reason: DedupOutcome) {
        tracing::debug!(%patient_id, category, ?reason, "alert suppressed before dispatch");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use uuid::Uuid;

    struct CountingStore {
        alerts: AtomicUsize,
        deliveries: AtomicUsize,
    }

    #[async_trait]
    impl AlertStore for CountingStore {
        async fn save_alert(&self, _alert: Alert) -> crate::error::EngineResult<()> {
            self.alerts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        async fn save_alert_delivery(&self, _delivery: models::AlertDelivery) -> crate::error::EngineResult<()> {
            self.deliveries.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct EmptyCaregivers;
    #[async_trait]
    impl CaregiverStore for EmptyCaregivers {
        async fn get_many(&self, _ids: &[models::CaregiverId]) -> crate::error::EngineResult<Vec<Caregiver>> {
            Ok(Vec::new())
        }
    }

    struct UnassignedPatient;
    #[async_trait]
    impl PatientStore for UnassignedPatient {
        async fn get(&self, patient_id: models::PatientId) -> crate::error::EngineResult<models::Patient> {
            Ok(models::Patient {
                id: patient_id,
                org_id: Uuid::new_v4(),
                phone: "+15550000000".into(),
                preferred_language: "en".into(),
                medical_metadata: serde_json::Value::Null,
                assigned_caregiver_ids: Vec::new(),
            })
        }
    }

    fn sample_alert(severity: Severity) -> Alert {
        Alert {
            id: Uuid::new_v4(),
            patient_id: Uuid::new_v4(),
            conversation_id: None,
            severity,
            category: "medical".into(),
            phrase: "heart attack".into(),
            raw_utterance: "I think I'm having a heart attack".into(),
            detected_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn critical_alert_with_no_caregivers_still_falls_back_to_audit_log() {
        let alerts = Arc::new(CountingStore {
            alerts: AtomicUsize::new(0),
            deliveries: AtomicUsize::new(0),
        });
        let fanout = NotificationFanout::new(Arc::new(UnassignedPatient), Arc::new(EmptyCaregivers), alerts.clone());
        fanout.dispatch(sample_alert(Severity::Critical)).await;

        assert_eq!(alerts.alerts.load(Ordering::SeqCst), 1);
        assert_eq!(alerts.deliveries.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn severity_policy_matches_the_documented_table() {
        assert_eq!(transports_for(Severity::Critical).len(), 3);
        assert_eq!(transports_for(Severity::High).len(), 2);
        assert_eq!(transports_for(Severity::Medium).len(), 2);
        assert!(transports_for(Severity::Medium).contains(&Transport::Push));
    }
}
