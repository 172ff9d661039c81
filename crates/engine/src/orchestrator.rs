//! Component F — Call Orchestrator (spec §4.F). Drives the per-call state
//! machine, owns the live-call registry the janitor sweep consults, and
//! coordinates cleanup across the Telephony Gateway and Bridge Adapter.
//! Grounded in the pack's Matrixon `CallManager` (`CallEvent` enum,
//! `Arc<RwLock<HashMap>>` registry, one `transition` match) generalized from a
//! Matrix call session to a wellness-call conversation.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::RwLock;

use chrono::Utc;
use dto::TelephonyCallStatus;
use models::{CallStatus, CaregiverId, Conversation, ConversationId, OrgId, PatientId, Severity};

use crate::ai_session::BargeInGuard;
use crate::bridge::BridgeAdapter;
use crate::error::{EngineError, EngineResult};
use crate::notify::NotificationDispatcher;
use crate::store::{AlertStore, CallStatusUpdate, ConversationStore, OrgStore, RetryChain};
use crate::telephony::{CallProgressEvent, TelephonyGateway, WebhookDeduper};

/// Inputs that drive a transition, independent of their wire representation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallEvent {
    Ringing,
    Answered,
    Completed,
    NoAnswer,
    Busy,
    Failed,
    Cancelled,
}

impl CallEvent {
    pub fn from_telephony_status(status: TelephonyCallStatus) -> Self {
        match status {
            TelephonyCallStatus::Queued | TelephonyCallStatus::Ringing => CallEvent::Ringing,
            TelephonyCallStatus::InProgress => CallEvent::Answered,
            TelephonyCallStatus::Completed => CallEvent::Completed,
            TelephonyCallStatus::NoAnswer => CallEvent::NoAnswer,
            TelephonyCallStatus::Busy => CallEvent::Busy,
            TelephonyCallStatus::Failed => CallEvent::Failed,
            TelephonyCallStatus::Canceled => CallEvent::Cancelled,
        }
    }
}

/// One state-machine step, independent of any store or I/O (spec §4.F).
/// Absorbing terminal states never transition further; `Cancelled` is
/// reachable from any non-terminal state. A webhook delivered after the
/// conversation already reached a terminal state is a late/out-of-order
/// arrival, not an error — callers should collapse it rather than propagate
/// `Terminal` as a failure (spec §4.A).
pub fn transition(current: CallStatus, event: CallEvent) -> EngineResult<CallStatus> {
    use CallStatus::*;

    if current.is_terminal() {
        return Err(EngineError::Terminal {
            detail: format!("conversation already in terminal state {current:?}"),
        });
    }

    if event == CallEvent::Cancelled {
        return Ok(Cancelled);
    }

    let next = match (current, event) {
        (Initiated, CallEvent::Ringing) => Ringing,
        (Initiated, CallEvent::Answered) => InProgress,
        (Ringing, CallEvent::Answered) => InProgress,
        (Initiated | Ringing, CallEvent::NoAnswer) => Missed,
        (Initiated | Ringing, CallEvent::Busy) => Missed,
        (Initiated | Ringing | InProgress, CallEvent::Failed) => Failed,
        (InProgress, CallEvent::Completed) => Completed,
        (current, event) => {
            return Err(EngineError::Conflict {
                detail: format!("illegal transition {current:?} -> {event:?}"),
            })
        }
    };
    Ok(next)
}

struct LiveCall {
    conversation_id: ConversationId,
    org_id: OrgId,
    patient_id: PatientId,
    channel_id: Option<String>,
    barge_in: Arc<BargeInGuard>,
}

/// Coordinates one call's lifecycle from placement through cleanup. Cloned
/// cheaply (every field is an `Arc`) so each placed call can hand a handle to
/// its own driving task.
#[derive(Clone)]
pub struct CallOrchestrator {
    store: Arc<dyn ConversationStore>,
    orgs: Arc<dyn OrgStore>,
    alerts: Arc<dyn AlertStore>,
    telephony: Arc<dyn TelephonyGateway>,
    bridge: Arc<dyn BridgeAdapter>,
    notifier: Arc<dyn NotificationDispatcher>,
    dedup: Arc<WebhookDeduper>,
    live_by_call_sid: Arc<RwLock<HashMap<String, LiveCall>>>,
}

impl CallOrchestrator {
    pub fn new(
        store: Arc<dyn ConversationStore>,
        orgs: Arc<dyn OrgStore>,
        alerts: Arc<dyn AlertStore>,
        telephony: Arc<dyn TelephonyGateway>,
        bridge: Arc<dyn BridgeAdapter>,
        notifier: Arc<dyn NotificationDispatcher>,
    ) -> Self {
        Self {
            store,
            orgs,
            alerts,
            telephony,
            bridge,
            notifier,
            dedup: Arc::new(WebhookDeduper::new()),
            live_by_call_sid: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Places a new root-attempt call and registers it as live.
    pub async fn start_call(
        &self,
        org_id: OrgId,
        patient_id: PatientId,
        patient_phone: &str,
        callback_url: &str,
        agent_id: Option<CaregiverId>,
        max_retries: u32,
    ) -> EngineResult<Conversation> {
        self.place(org_id, patient_id, patient_phone, callback_url, agent_id, RetryChain::root(max_retries))
            .await
    }

    async fn place(
        &self,
        org_id: OrgId,
        patient_id: PatientId,
        patient_phone: &str,
        callback_url: &str,
        agent_id: Option<CaregiverId>,
        retry_chain: RetryChain,
    ) -> EngineResult<Conversation> {
        let conversation = self
            .store
            .open_conversation(org_id, patient_id, agent_id, CallStatus::Initiated, retry_chain)
            .await?;
        self.dial(conversation, patient_phone, callback_url).await
    }

    /// Fires a retry conversation previously opened by `schedule_retry` once
    /// the Scheduler observes its `retry_scheduled_at` has passed (spec §4.F,
    /// scenario S5). The conversation already exists, so this only performs
    /// the telephony placement and live-registry bookkeeping.
    pub async fn fire_due_retry(&self, conversation_id: ConversationId, patient_phone: &str, callback_url: &str) -> EngineResult<Conversation> {
        let conversation = self.store.get(conversation_id).await?;
        self.dial(conversation, patient_phone, callback_url).await
    }

    async fn dial(&self, conversation: Conversation, patient_phone: &str, callback_url: &str) -> EngineResult<Conversation> {
        let call_sid = match self.telephony.place_call(patient_phone, callback_url).await {
            Ok(sid) => sid,
            Err(err) => {
                self.store
                    .update_call_status(
                        conversation.id,
                        CallStatus::Failed,
                        CallStatusUpdate {
                            outcome: Some("placement_failed".into()),
                            ..Default::default()
                        },
                    )
                    .await?;
                return Err(err);
            }
        };

        self.store.set_call_sid(conversation.id, call_sid.clone()).await?;
        self.live_by_call_sid.write().expect("live call registry poisoned").insert(
            call_sid,
            LiveCall {
                conversation_id: conversation.id,
                org_id: conversation.org_id,
                patient_id: conversation.patient_id,
                channel_id: None,
                barge_in: Arc::new(BargeInGuard::new()),
            },
        );

        self.store.get(conversation.id).await
    }

    /// Entry point for telephony webhook delivery (spec §4.A/§4.F). Replays
    /// are no-ops; everything else drives exactly one state transition.
    pub async fn handle_telephony_event(&self, event: CallProgressEvent) -> EngineResult<()> {
        if !self.dedup.resolve_and_record(&event) {
            return Ok(());
        }

        let conversation_id = {
            let registry = self.live_by_call_sid.read().expect("live call registry poisoned");
            registry
                .get(&event.call_sid)
                .map(|live| live.conversation_id)
                .ok_or_else(|| EngineError::NoLiveOrchestrator(event.call_sid.clone()))?
        };

        let conversation = self.store.get(conversation_id).await?;
        let call_event = CallEvent::from_telephony_status(event.status);
        let next = match transition(conversation.call_status, call_event) {
            Ok(next) => next,
            Err(EngineError::Terminal { .. }) => return Ok(()),
            Err(err) => return Err(err),
        };

        match next {
            CallStatus::InProgress => self.on_answered(&event.call_sid, conversation_id).await,
            status if status.is_terminal() => self.on_terminal(&event.call_sid, conversation_id, status).await,
            CallStatus::Ringing => {
                self.store
                    .update_call_status(conversation_id, CallStatus::Ringing, CallStatusUpdate::default())
                    .await?;
                Ok(())
            }
            _ => Ok(()),
        }
    }

    async fn on_answered(&self, call_sid: &str, conversation_id: ConversationId) -> EngineResult<()> {
        let channel_id = self.bridge.open_channel(call_sid).await?;
        self.store.set_channel_id(conversation_id, channel_id.clone()).await?;

        {
            let mut registry = self.live_by_call_sid.write().expect("live call registry poisoned");
            if let Some(live) = registry.get_mut(call_sid) {
                live.channel_id = Some(channel_id);
            }
        }

        self.store
            .update_call_status(
                conversation_id,
                CallStatus::InProgress,
                CallStatusUpdate {
                    start_time: Some(Utc::now()),
                    ..Default::default()
                },
            )
            .await?;
        Ok(())
    }

    /// Cleanup ordering per spec §4.F: hangup, then close the bridge channel,
    /// then persist terminal fields. Each step is idempotent so a retried
    /// cleanup after a partial failure is safe. The realtime AI session lives
    /// in `services/signaling`'s process, not here, and closes on its own
    /// when the telephony hangup tears down the WebSocket duplex.
    async fn on_terminal(&self, call_sid: &str, conversation_id: ConversationId, status: CallStatus) -> EngineResult<()> {
        let live = self.live_by_call_sid.write().expect("live call registry poisoned").remove(call_sid);

        if let Err(err) = self.telephony.hangup(call_sid).await {
            tracing::warn!(?err, call_sid, "hangup failed during terminal cleanup, continuing");
        }

        if let Some(live) = &live {
            if let Some(channel_id) = &live.channel_id {
                if let Err(err) = self.bridge.close_channel(channel_id, "call ended").await {
                    tracing::warn!(?err, channel_id, "bridge channel close failed during cleanup");
                }
            }
        }

        let conversation = self
            .store
            .update_call_status(
                conversation_id,
                status,
                CallStatusUpdate {
                    end_time: Some(Utc::now()),
                    ..Default::default()
                },
            )
            .await?;

        if matches!(status, CallStatus::Failed | CallStatus::Missed) {
            self.maybe_retry_or_alert(&conversation).await?;
        }

        Ok(())
    }

    /// Opens a new pending Conversation for the next retry attempt, sharing
    /// `original_call_id` with the root call and carrying `retry_scheduled_at`
    /// set `retryIntervalMinutes` out (spec §4.F). Dialing is deferred to the
    /// Scheduler, which polls `find_due_retries` and calls `fire_due_retry`
    /// once that time has passed.
    async fn schedule_retry(&self, conversation: &Conversation) -> EngineResult<()> {
        let org = self.orgs.get(conversation.org_id).await?;
        let interval = chrono::Duration::minutes(org.call_retry_settings.retry_interval_minutes as i64);
        self.store
            .open_conversation(
                conversation.org_id,
                conversation.patient_id,
                conversation.agent_id,
                CallStatus::Initiated,
                RetryChain {
                    retry_attempt: conversation.retry_attempt + 1,
                    max_retries: conversation.max_retries,
                    original_call_id: Some(conversation.original_call_id.unwrap_or(conversation.id)),
                    retry_scheduled_at: Some(Utc::now() + interval),
                },
            )
            .await?;
        Ok(())
    }

    /// On a missed/failed terminal transition, either schedules the next
    /// retry attempt or, once retries are exhausted, raises a MEDIUM alert if
    /// the org's `alertOnAllMissedCalls` policy requires it (spec §4.F).
    async fn maybe_retry_or_alert(&self, conversation: &Conversation) -> EngineResult<()> {
        if conversation.retry_attempt < conversation.max_retries {
            self.schedule_retry(conversation).await?;
            return Ok(());
        }

        let org = self.orgs.get(conversation.org_id).await?;
        if org.call_retry_settings.alert_on_all_missed_calls {
            let alert = models::Alert {
                id: uuid::Uuid::new_v4(),
                patient_id: conversation.patient_id,
                conversation_id: Some(conversation.id),
                severity: Severity::Medium,
                category: "missed_call_chain".into(),
                phrase: String::new(),
                raw_utterance: format!(
                    "call to patient exhausted {} retries without connecting",
                    conversation.max_retries
                ),
                detected_at: Utc::now(),
            };
            self.notifier.dispatch(alert).await;
        }
        Ok(())
    }

    /// Cancels a live call from any non-terminal state (spec §4.F).
    pub async fn cancel(&self, call_sid: &str) -> EngineResult<()> {
        let conversation_id = {
            let registry = self.live_by_call_sid.read().expect("live call registry poisoned");
            registry
                .get(call_sid)
                .map(|live| live.conversation_id)
                .ok_or_else(|| EngineError::NoLiveOrchestrator(call_sid.to_string()))?
        };
        self.on_terminal(call_sid, conversation_id, CallStatus::Cancelled).await
    }

    /// Janitor sweep (spec §4.F): forcibly fails any `InProgress` conversation
    /// whose live orchestrator entry no longer exists after `older_than`.
    pub async fn sweep_orphans(&self, older_than: chrono::DateTime<Utc>) -> EngineResult<usize> {
        let orphans = self.store.find_orphaned_in_progress(older_than).await?;
        let mut swept = 0;
        for conversation in orphans {
            let is_live = {
                let registry = self.live_by_call_sid.read().expect("live call registry poisoned");
                registry.values().any(|live| live.conversation_id == conversation.id)
            };
            if is_live {
                continue;
            }
            self.store
                .update_call_status(
                    conversation.id,
                    CallStatus::Failed,
                    CallStatusUpdate {
                        end_time: Some(Utc::now()),
                        outcome: Some("orphaned_sweep".into()),
                        ..Default::default()
                    },
                )
                .await?;
            swept += 1;
        }
        Ok(swept)
    }

    pub fn live_call_count(&self) -> usize {
        self.live_by_call_sid.read().expect("live call registry poisoned").len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::MockBridgeAdapter;
    use crate::store::InMemoryStore;
    use crate::telephony::MockTelephonyGateway;
    use models::{CallRetrySettings, Organization};

    struct NoopNotifier;
    #[async_trait::async_trait]
    impl NotificationDispatcher for NoopNotifier {
        async fn dispatch(&self, _alert: models::Alert) {}
    }

    fn orchestrator(store: Arc<InMemoryStore>) -> CallOrchestrator {
        CallOrchestrator::new(
            store.clone(),
            store.clone(),
            store,
            Arc::new(MockTelephonyGateway::new()),
            Arc::new(MockBridgeAdapter),
            Arc::new(NoopNotifier),
        )
    }

    #[test]
    fn cancelled_is_reachable_from_every_non_terminal_state() {
        for state in [CallStatus::Initiated, CallStatus::Ringing, CallStatus::InProgress] {
            assert_eq!(transition(state, CallEvent::Cancelled).unwrap(), CallStatus::Cancelled);
        }
    }

    #[test]
    fn terminal_states_reject_further_transitions() {
        assert!(transition(CallStatus::Completed, CallEvent::Ringing).is_err());
        assert!(transition(CallStatus::Cancelled, CallEvent::Answered).is_err());
    }

    #[tokio::test]
    async fn happy_path_places_answers_and_completes() {
        let store = Arc::new(InMemoryStore::new(100, 30));
        store.seed_org(Organization {
            id: uuid::Uuid::nil(),
            name: "Org".into(),
            contact_email: "org@example.com".into(),
            call_retry_settings: CallRetrySettings::default(),
        });
        let org_id = uuid::Uuid::nil();
        let patient_id = uuid::Uuid::new_v4();
        let engine = orchestrator(store.clone());

        let conversation = engine
            .start_call(org_id, patient_id, "+15550001111", "https://cb.example/voice", None, 2)
            .await
            .unwrap();
        assert_eq!(engine.live_call_count(), 1);

        let call_sid = ConversationStore::get(&*store, conversation.id).await.unwrap().call_sid.unwrap();
        engine
            .handle_telephony_event(CallProgressEvent {
                call_sid: call_sid.clone(),
                status: TelephonyCallStatus::InProgress,
                timestamp: Utc::now(),
            })
            .await
            .unwrap();
        let in_progress = ConversationStore::get(&*store, conversation.id).await.unwrap();
        assert_eq!(in_progress.call_status, CallStatus::InProgress);
        assert!(in_progress.start_time.is_some());

        engine
            .handle_telephony_event(CallProgressEvent {
                call_sid: call_sid.clone(),
                status: TelephonyCallStatus::Completed,
                timestamp: Utc::now(),
            })
            .await
            .unwrap();
        let completed = ConversationStore::get(&*store, conversation.id).await.unwrap();
        assert_eq!(completed.call_status, CallStatus::Completed);
        assert_eq!(engine.live_call_count(), 0);
    }

    #[tokio::test]
    async fn a_missed_call_under_the_retry_cap_schedules_a_pending_retry_conversation() {
        let store = Arc::new(InMemoryStore::new(100, 30));
        store.seed_org(Organization {
            id: uuid::Uuid::nil(),
            name: "Org".into(),
            contact_email: "org@example.com".into(),
            call_retry_settings: CallRetrySettings {
                alert_on_all_missed_calls: true,
                ..CallRetrySettings::default()
            },
        });
        let engine = orchestrator(store.clone());
        let conversation = engine
            .start_call(uuid::Uuid::nil(), uuid::Uuid::new_v4(), "+15550001111", "https://cb.example/voice", None, 1)
            .await
            .unwrap();
        let call_sid = ConversationStore::get(&*store, conversation.id).await.unwrap().call_sid.unwrap();

        engine
            .handle_telephony_event(CallProgressEvent {
                call_sid,
                status: TelephonyCallStatus::NoAnswer,
                timestamp: Utc::now(),
            })
            .await
            .unwrap();

        let missed = ConversationStore::get(&*store, conversation.id).await.unwrap();
        assert_eq!(missed.call_status, CallStatus::Missed);

        let due = store.find_due_retries(Utc::now() + chrono::Duration::hours(1)).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].retry_attempt, 1);
        assert_eq!(due[0].max_retries, 1);
        assert_eq!(due[0].original_call_id, Some(conversation.id));
        assert!(due[0].call_sid.is_none());
    }

    #[tokio::test]
    async fn a_missed_call_at_the_retry_cap_schedules_no_further_retry() {
        let store = Arc::new(InMemoryStore::new(100, 30));
        store.seed_org(Organization {
            id: uuid::Uuid::nil(),
            name: "Org".into(),
            contact_email: "org@example.com".into(),
            call_retry_settings: CallRetrySettings {
                alert_on_all_missed_calls: true,
                ..CallRetrySettings::default()
            },
        });
        let engine = orchestrator(store.clone());
        let conversation = engine
            .start_call(uuid::Uuid::nil(), uuid::Uuid::new_v4(), "+15550001111", "https://cb.example/voice", None, 0)
            .await
            .unwrap();
        let call_sid = ConversationStore::get(&*store, conversation.id).await.unwrap().call_sid.unwrap();

        engine
            .handle_telephony_event(CallProgressEvent {
                call_sid,
                status: TelephonyCallStatus::NoAnswer,
                timestamp: Utc::now(),
            })
            .await
            .unwrap();

        let due = store.find_due_retries(Utc::now() + chrono::Duration::hours(1)).await.unwrap();
        assert!(due.is_empty());
    }
}
