//! Component D — Conversation Store (spec §4.D) plus the sibling persistence
//! contracts for alerts, schedules, invoices, and the phrase vocabulary that
//! spec §6's "Persisted state" section enumerates. Split into small traits
//! along the same boundaries the spec draws, backed by one in-memory
//! implementation (used by every unit test in this workspace) and one
//! Postgres implementation that follows the teacher's `sqlx::PgPoolOptions` +
//! hand-mapped `row.try_get` style.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use models::*;
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};

#[derive(Debug, Clone)]
pub struct CallStatusUpdate {
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration_seconds: Option<i64>,
    pub cost_cents: Option<Cents>,
    pub outcome: Option<String>,
    pub notes: Option<String>,
}

impl Default for CallStatusUpdate {
    fn default() -> Self {
        Self {
            start_time: None,
            end_time: None,
            duration_seconds: None,
            cost_cents: None,
            outcome: None,
            notes: None,
        }
    }
}

/// Retry-chain metadata a new conversation is opened with; root attempts use
/// `RetryChain::root()` (spec §4.F).
#[derive(Debug, Clone, Copy)]
pub struct RetryChain {
    pub retry_attempt: u32,
    pub max_retries: u32,
    pub original_call_id: Option<ConversationId>,
    /// When set, the conversation is a pending retry not yet placed with the
    /// telephony gateway; the Scheduler fires it once this time has passed
    /// (spec §4.F).
    pub retry_scheduled_at: Option<DateTime<Utc>>,
}

impl RetryChain {
    pub fn root(max_retries: u32) -> Self {
        Self {
            retry_attempt: 0,
            max_retries,
            original_call_id: None,
            retry_scheduled_at: None,
        }
    }
}

#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn open_conversation(
        &self,
        org_id: OrgId,
        patient_id: PatientId,
        agent_id: Option<CaregiverId>,
        initial_status: CallStatus,
        retry_chain: RetryChain,
    ) -> EngineResult<Conversation>;

    async fn set_call_sid(&self, conversation_id: ConversationId, call_sid: String) -> EngineResult<()>;

    async fn set_channel_id(
        &self,
        conversation_id: ConversationId,
        channel_id: String,
    ) -> EngineResult<()>;

    /// Append-only; returns the message's conversation-local position.
    async fn append_message(
        &self,
        conversation_id: ConversationId,
        role: MessageRole,
        content: String,
    ) -> EngineResult<i32>;

    /// Monotonic in status per spec §4.6/§4.F. Computes cost per spec §4.D's
    /// cost rule when `new_status` is terminal.
    async fn update_call_status(
        &self,
        conversation_id: ConversationId,
        new_status: CallStatus,
        update: CallStatusUpdate,
    ) -> EngineResult<Conversation>;

    async fn get(&self, conversation_id: ConversationId) -> EngineResult<Conversation>;

    async fn get_messages(&self, conversation_id: ConversationId) -> EngineResult<Vec<Message>>;

    async fn find_unbilled(
        &self,
        org_id: OrgId,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
    ) -> EngineResult<Vec<Conversation>>;

    /// Atomic for the whole set: if any member already has a non-null
    /// `line_item_id`, the whole operation fails with `AlreadyBilled` and no
    /// member is modified (spec §4.D).
    async fn mark_billed(
        &self,
        conversation_ids: &[ConversationId],
        line_item_id: LineItemId,
    ) -> EngineResult<()>;

    /// Finds InProgress conversations with no live orchestrator, older than
    /// `older_than`, for the janitor sweep (spec §4.F).
    async fn find_orphaned_in_progress(
        &self,
        older_than: DateTime<Utc>,
    ) -> EngineResult<Vec<Conversation>>;

    /// Finds pending retry conversations (opened but never dialed) whose
    /// `retry_scheduled_at` has passed, for the Scheduler to fire (spec §4.F).
    async fn find_due_retries(&self, now: DateTime<Utc>) -> EngineResult<Vec<Conversation>>;
}

#[async_trait]
pub trait AlertStore: Send + Sync {
    async fn save_alert(&self, alert: Alert) -> EngineResult<()>;
    async fn save_alert_delivery(&self, delivery: AlertDelivery) -> EngineResult<()>;
}

#[async_trait]
pub trait PhraseStore: Send + Sync {
    async fn load_all(&self) -> EngineResult<Vec<EmergencyPhrase>>;
}

#[async_trait]
pub trait ScheduleStore: Send + Sync {
    async fn list_active(&self) -> EngineResult<Vec<Schedule>>;
    async fn advance_next_call_date(
        &self,
        schedule_id: ScheduleId,
        next_call_date: DateTime<Utc>,
    ) -> EngineResult<()>;
    /// Per-schedule fire lock, preventing duplicate fires inside a grace
    /// window even with multiple scheduler workers (spec §4.G).
    async fn try_acquire_fire_lock(
        &self,
        schedule_id: ScheduleId,
        grace: chrono::Duration,
    ) -> EngineResult<bool>;
}

#[async_trait]
pub trait InvoiceStore: Send + Sync {
    /// Find-and-increment in one atomic step (spec §5).
    async fn next_invoice_number(&self, org_id: OrgId) -> EngineResult<i64>;
    async fn create_invoice(&self, invoice: Invoice, line_items: Vec<LineItem>) -> EngineResult<()>;
    async fn delete_invoice(&self, invoice_id: InvoiceId) -> EngineResult<()>;
}

#[async_trait]
pub trait OrgStore: Send + Sync {
    async fn get(&self, org_id: OrgId) -> EngineResult<Organization>;
    /// Used by the billing rollup loop to sweep every org on its schedule.
    async fn list_all(&self) -> EngineResult<Vec<Organization>>;
}

#[async_trait]
pub trait PatientStore: Send + Sync {
    async fn get(&self, patient_id: PatientId) -> EngineResult<Patient>;
}

#[async_trait]
pub trait CaregiverStore: Send + Sync {
    async fn get_many(&self, caregiver_ids: &[CaregiverId]) -> EngineResult<Vec<Caregiver>>;
}

fn round_half_up_cents(effective_seconds: i64, rate_per_minute_cents: i64) -> Cents {
    let numerator = effective_seconds * rate_per_minute_cents;
    // numerator / 60 rounded half-up: add 30 (half of 60) before integer division.
    (numerator + 30) / 60
}

/// Cost computation per spec §4.D. `alert_on_all_missed_calls` gates whether a
/// never-connected failed call is billed at the minimum or billed at zero.
pub fn compute_cost_cents(
    duration_seconds: i64,
    connected: bool,
    alert_on_all_missed_calls: bool,
    minimum_billable_seconds: i64,
    rate_per_minute_cents: i64,
) -> (i64, Cents) {
    if !connected && alert_on_all_missed_calls {
        return (duration_seconds.max(0), 0);
    }
    let effective = duration_seconds.max(minimum_billable_seconds).max(0);
    (effective, round_half_up_cents(effective, rate_per_minute_cents))
}

struct InMemoryInner {
    conversations: HashMap<ConversationId, Conversation>,
    messages: HashMap<ConversationId, Vec<Message>>,
    alerts: Vec<Alert>,
    alert_deliveries: Vec<AlertDelivery>,
    phrases: Vec<EmergencyPhrase>,
    schedules: HashMap<ScheduleId, Schedule>,
    fire_locks: HashMap<ScheduleId, DateTime<Utc>>,
    invoice_counters: HashMap<OrgId, i64>,
    invoices: HashMap<InvoiceId, Invoice>,
    line_items: HashMap<LineItemId, LineItem>,
    orgs: HashMap<OrgId, Organization>,
    patients: HashMap<PatientId, Patient>,
    caregivers: HashMap<CaregiverId, Caregiver>,
}

/// Single in-memory backing store for every persistence trait. Used by unit
/// tests across `detector`, `orchestrator`, `scheduler`, and `billing`.
pub struct InMemoryStore {
    inner: Mutex<InMemoryInner>,
    rate_per_minute_cents: i64,
    minimum_billable_seconds: i64,
}

impl InMemoryStore {
    pub fn new(rate_per_minute_cents: i64, minimum_billable_seconds: i64) -> Self {
        Self {
            inner: Mutex::new(InMemoryInner {
                conversations: HashMap::new(),
                messages: HashMap::new(),
                alerts: Vec::new(),
                alert_deliveries: Vec::new(),
                phrases: Vec::new(),
                schedules: HashMap::new(),
                fire_locks: HashMap::new(),
                invoice_counters: HashMap::new(),
                invoices: HashMap::new(),
                line_items: HashMap::new(),
                orgs: HashMap::new(),
                patients: HashMap::new(),
                caregivers: HashMap::new(),
            }),
            rate_per_minute_cents,
            minimum_billable_seconds,
        }
    }

    pub fn seed_org(&self, org: Organization) {
        self.inner.lock().unwrap().orgs.insert(org.id, org);
    }

    pub fn seed_patient(&self, patient: Patient) {
        self.inner.lock().unwrap().patients.insert(patient.id, patient);
    }

    pub fn seed_caregiver(&self, caregiver: Caregiver) {
        self.inner.lock().unwrap().caregivers.insert(caregiver.id, caregiver);
    }

    pub fn seed_phrases(&self, phrases: Vec<EmergencyPhrase>) {
        self.inner.lock().unwrap().phrases = phrases;
    }

    pub fn seed_schedule(&self, schedule: Schedule) {
        self.inner.lock().unwrap().schedules.insert(schedule.id, schedule);
    }

    pub fn alerts_snapshot(&self) -> Vec<Alert> {
        self.inner.lock().unwrap().alerts.clone()
    }

    pub fn invoices_snapshot(&self) -> Vec<Invoice> {
        self.inner.lock().unwrap().invoices.values().cloned().collect()
    }

    pub fn line_items_snapshot(&self) -> Vec<LineItem> {
        self.inner.lock().unwrap().line_items.values().cloned().collect()
    }
}

#[async_trait]
impl ConversationStore for InMemoryStore {
    async fn open_conversation(
        &self,
        org_id: OrgId,
        patient_id: PatientId,
        agent_id: Option<CaregiverId>,
        initial_status: CallStatus,
        retry_chain: RetryChain,
    ) -> EngineResult<Conversation> {
        let conversation = Conversation {
            id: Uuid::new_v4(),
            org_id,
            patient_id,
            agent_id,
            call_sid: None,
            asterisk_channel_id: None,
            call_status: initial_status,
            start_time: None,
            end_time: None,
            duration_seconds: 0,
            cost_cents: 0,
            line_item_id: None,
            retry_attempt: retry_chain.retry_attempt,
            max_retries: retry_chain.max_retries,
            original_call_id: retry_chain.original_call_id,
            retry_scheduled_at: retry_chain.retry_scheduled_at,
            call_notes: None,
            outcome: None,
        };
        let mut inner = self.inner.lock().unwrap();
        inner.conversations.insert(conversation.id, conversation.clone());
        inner.messages.insert(conversation.id, Vec::new());
        Ok(conversation)
    }

    async fn set_call_sid(&self, conversation_id: ConversationId, call_sid: String) -> EngineResult<()> {
        let mut inner = self.inner.lock().unwrap();
        let conversation = inner
            .conversations
            .get_mut(&conversation_id)
            .ok_or(EngineError::ConversationNotFound(conversation_id))?;
        conversation.call_sid = Some(call_sid);
        Ok(())
    }

    async fn set_channel_id(
        &self,
        conversation_id: ConversationId,
        channel_id: String,
    ) -> EngineResult<()> {
        let mut inner = self.inner.lock().unwrap();
        let conversation = inner
            .conversations
            .get_mut(&conversation_id)
            .ok_or(EngineError::ConversationNotFound(conversation_id))?;
        conversation.asterisk_channel_id = Some(channel_id);
        Ok(())
    }

    async fn append_message(
        &self,
        conversation_id: ConversationId,
        role: MessageRole,
        content: String,
    ) -> EngineResult<i32> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.conversations.contains_key(&conversation_id) {
            return Err(EngineError::ConversationNotFound(conversation_id));
        }
        let messages = inner.messages.entry(conversation_id).or_default();
        let position = messages.len() as i32;
        messages.push(Message {
            id: Uuid::new_v4(),
            conversation_id,
            role,
            content,
            position,
            created_at: Utc::now(),
        });
        Ok(position)
    }

    async fn update_call_status(
        &self,
        conversation_id: ConversationId,
        new_status: CallStatus,
        update: CallStatusUpdate,
    ) -> EngineResult<Conversation> {
        let mut inner = self.inner.lock().unwrap();
        let alert_on_all_missed_calls = {
            let conversation = inner
                .conversations
                .get(&conversation_id)
                .ok_or(EngineError::ConversationNotFound(conversation_id))?;
            inner
                .orgs
                .get(&conversation.org_id)
                .map(|org| org.call_retry_settings.alert_on_all_missed_calls)
                .unwrap_or(false)
        };

        let conversation = inner
            .conversations
            .get_mut(&conversation_id)
            .ok_or(EngineError::ConversationNotFound(conversation_id))?;

        conversation.call_status = new_status;
        if let Some(start_time) = update.start_time {
            conversation.start_time = Some(start_time);
        }
        if let Some(end_time) = update.end_time {
            conversation.end_time = Some(end_time);
        }
        if let Some(duration) = update.duration_seconds {
            conversation.duration_seconds = duration.max(0);
        } else if let (Some(start), Some(end)) = (conversation.start_time, conversation.end_time) {
            conversation.duration_seconds = (end - start).num_seconds().max(0);
        }
        if let Some(notes) = update.notes {
            conversation.call_notes = Some(notes);
        }
        if let Some(outcome) = update.outcome {
            conversation.outcome = Some(outcome);
        }

        if new_status.is_terminal() {
            let connected = conversation.start_time.is_some();
            let cost = if let Some(cost_override) = update.cost_cents {
                cost_override
            } else {
                compute_cost_cents(
                    conversation.duration_seconds,
                    connected,
                    alert_on_all_missed_calls,
                    self.minimum_billable_seconds,
                    self.rate_per_minute_cents,
                )
                .1
            };
            conversation.cost_cents = cost;
        }

        Ok(conversation.clone())
    }

    async fn get(&self, conversation_id: ConversationId) -> EngineResult<Conversation> {
        self.inner
            .lock()
            .unwrap()
            .conversations
            .get(&conversation_id)
            .cloned()
            .ok_or(EngineError::ConversationNotFound(conversation_id))
    }

    async fn get_messages(&self, conversation_id: ConversationId) -> EngineResult<Vec<Message>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .messages
            .get(&conversation_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn find_unbilled(
        &self,
        org_id: OrgId,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
    ) -> EngineResult<Vec<Conversation>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .conversations
            .values()
            .filter(|c| c.org_id == org_id && c.line_item_id.is_none())
            .filter(|c| match c.end_time {
                Some(end) => end >= window_start && end < window_end,
                None => false,
            })
            .cloned()
            .collect())
    }

    async fn mark_billed(
        &self,
        conversation_ids: &[ConversationId],
        line_item_id: LineItemId,
    ) -> EngineResult<()> {
        let mut inner = self.inner.lock().unwrap();
        for id in conversation_ids {
            let conversation = inner
                .conversations
                .get(id)
                .ok_or(EngineError::ConversationNotFound(*id))?;
            if conversation.line_item_id.is_some() {
                return Err(EngineError::AlreadyBilled(*id));
            }
        }
        for id in conversation_ids {
            inner.conversations.get_mut(id).unwrap().line_item_id = Some(line_item_id);
        }
        Ok(())
    }

    async fn find_orphaned_in_progress(
        &self,
        older_than: DateTime<Utc>,
    ) -> EngineResult<Vec<Conversation>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .conversations
            .values()
            .filter(|c| c.call_status == CallStatus::InProgress)
            .filter(|c| c.start_time.map(|s| s < older_than).unwrap_or(false))
            .cloned()
            .collect())
    }

    async fn find_due_retries(&self, now: DateTime<Utc>) -> EngineResult<Vec<Conversation>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .conversations
            .values()
            .filter(|c| c.call_sid.is_none())
            .filter(|c| c.retry_scheduled_at.map(|at| at <= now).unwrap_or(false))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl AlertStore for InMemoryStore {
    async fn save_alert(&self, alert: Alert) -> EngineResult<()> {
        self.inner.lock().unwrap().alerts.push(alert);
        Ok(())
    }

    async fn save_alert_delivery(&self, delivery: AlertDelivery) -> EngineResult<()> {
        self.inner.lock().unwrap().alert_deliveries.push(delivery);
        Ok(())
    }
}

#[async_trait]
impl PhraseStore for InMemoryStore {
    async fn load_all(&self) -> EngineResult<Vec<EmergencyPhrase>> {
        Ok(self.inner.lock().unwrap().phrases.clone())
    }
}

#[async_trait]
impl ScheduleStore for InMemoryStore {
    async fn list_active(&self) -> EngineResult<Vec<Schedule>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .schedules
            .values()
            .filter(|s| s.is_active)
            .cloned()
            .collect())
    }

    async fn advance_next_call_date(
        &self,
        schedule_id: ScheduleId,
        next_call_date: DateTime<Utc>,
    ) -> EngineResult<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(schedule) = inner.schedules.get_mut(&schedule_id) {
            schedule.next_call_date = next_call_date;
        }
        Ok(())
    }

    async fn try_acquire_fire_lock(
        &self,
        schedule_id: ScheduleId,
        grace: chrono::Duration,
    ) -> EngineResult<bool> {
        let mut inner = self.inner.lock().unwrap();
        let now = Utc::now();
        if let Some(locked_until) = inner.fire_locks.get(&schedule_id) {
            if *locked_until > now {
                return Ok(false);
            }
        }
        inner.fire_locks.insert(schedule_id, now + grace);
        Ok(true)
    }
}

#[async_trait]
impl InvoiceStore for InMemoryStore {
    async fn next_invoice_number(&self, org_id: OrgId) -> EngineResult<i64> {
        let mut inner = self.inner.lock().unwrap();
        let counter = inner.invoice_counters.entry(org_id).or_insert(0);
        *counter += 1;
        Ok(*counter)
    }

    async fn create_invoice(&self, invoice: Invoice, line_items: Vec<LineItem>) -> EngineResult<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.invoices.insert(invoice.id, invoice);
        for item in line_items {
            inner.line_items.insert(item.id, item);
        }
        Ok(())
    }

    async fn delete_invoice(&self, invoice_id: InvoiceId) -> EngineResult<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.invoices.remove(&invoice_id);
        inner.line_items.retain(|_, item| item.invoice_id != invoice_id);
        Ok(())
    }
}

#[async_trait]
impl OrgStore for InMemoryStore {
    async fn get(&self, org_id: OrgId) -> EngineResult<Organization> {
        self.inner
            .lock()
            .unwrap()
            .orgs
            .get(&org_id)
            .cloned()
            .ok_or_else(|| EngineError::Validation {
                detail: format!("unknown org {org_id}"),
            })
    }

    async fn list_all(&self) -> EngineResult<Vec<Organization>> {
        Ok(self.inner.lock().unwrap().orgs.values().cloned().collect())
    }
}

#[async_trait]
impl PatientStore for InMemoryStore {
    async fn get(&self, patient_id: PatientId) -> EngineResult<Patient> {
        self.inner
            .lock()
            .unwrap()
            .patients
            .get(&patient_id)
            .cloned()
            .ok_or_else(|| EngineError::Validation {
                detail: format!("unknown patient {patient_id}"),
            })
    }
}

#[async_trait]
impl CaregiverStore for InMemoryStore {
    async fn get_many(&self, caregiver_ids: &[CaregiverId]) -> EngineResult<Vec<Caregiver>> {
        let inner = self.inner.lock().unwrap();
        Ok(caregiver_ids
            .iter()
            .filter_map(|id| inner.caregivers.get(id).cloned())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn compute_cost_cents_is_never_negative_and_scales_with_duration(
            duration in 0i64..36_000,
            rate in 1i64..10_000,
            minimum in 0i64..600,
        ) {
            let (effective, cost) = compute_cost_cents(duration, true, false, minimum, rate);
            prop_assert!(cost >= 0);
            prop_assert!(effective >= minimum);
            let (_, doubled_rate_cost) = compute_cost_cents(duration, true, false, minimum, rate * 2);
            prop_assert!(doubled_rate_cost >= cost);
        }
    }

    #[test]
    fn cost_uses_minimum_billable_seconds_when_duration_is_zero() {
        let (effective, cost) = compute_cost_cents(0, true, false, 30, 100);
        assert_eq!(effective, 30);
        assert_eq!(cost, 50); // 30s at 100 cents/min = 50 cents
    }

    #[test]
    fn missed_call_with_no_alert_policy_bills_minimum() {
        let (_, cost) = compute_cost_cents(0, false, false, 30, 100);
        assert_eq!(cost, 50);
    }

    #[test]
    fn missed_call_with_alert_policy_is_free() {
        let (_, cost) = compute_cost_cents(0, false, true, 30, 100);
        assert_eq!(cost, 0);
    }

    #[tokio::test]
    async fn mark_billed_is_atomic_across_the_set() {
        let store = InMemoryStore::new(100, 30);
        let org = Uuid::new_v4();
        let patient = Uuid::new_v4();
        let a = store
            .open_conversation(org, patient, None, CallStatus::Completed, RetryChain::root(0))
            .await
            .unwrap();
        let b = store
            .open_conversation(org, patient, None, CallStatus::Completed, RetryChain::root(0))
            .await
            .unwrap();

        store.mark_billed(&[a.id, b.id], Uuid::new_v4()).await.unwrap();

        // Second attempt with a different line item must fail and change nothing.
        let result = store.mark_billed(&[a.id, b.id], Uuid::new_v4()).await;
        assert!(matches!(result, Err(EngineError::AlreadyBilled(_))));

        let refreshed_a = ConversationStore::get(&store, a.id).await.unwrap();
        assert!(refreshed_a.line_item_id.is_some());
    }
}
