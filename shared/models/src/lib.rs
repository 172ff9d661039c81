//! Domain entities shared by every service: organizations, caregivers, patients,
//! schedules, conversations, messages, alerts, the emergency phrase vocabulary,
//! and billing records. These are plain data types; behavior lives in `engine`.

use chrono::{DateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type OrgId = Uuid;
pub type CaregiverId = Uuid;
pub type PatientId = Uuid;
pub type ScheduleId = Uuid;
pub type ConversationId = Uuid;
pub type MessageId = Uuid;
pub type AlertId = Uuid;
pub type AlertDeliveryId = Uuid;
pub type PhraseId = Uuid;
pub type InvoiceId = Uuid;
pub type LineItemId = Uuid;

/// Monetary amount in integer cents. All billing math is done in cents to
/// avoid floating point rounding drift; conversion to a rate-per-minute is the
/// only place that divides, and it always rounds half-up before storing.
pub type Cents = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaregiverRole {
    Staff,
    OrgAdmin,
    SuperAdmin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Critical,
    High,
    Medium,
}

impl Severity {
    /// Total ordering used when multiple candidates survive detection and the
    /// alert must take the maximum severity (spec §4.E, stage 2).
    pub fn rank(self) -> u8 {
        match self {
            Severity::Medium => 0,
            Severity::High => 1,
            Severity::Critical => 2,
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Critical => write!(f, "CRITICAL"),
            Severity::High => write!(f, "HIGH"),
            Severity::Medium => write!(f, "MEDIUM"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    Patient,
    Assistant,
    System,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleFrequency {
    Daily,
    Weekly,
    Monthly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvoiceStatus {
    Draft,
    Pending,
    Paid,
    Void,
    Overdue,
}

/// Call-lifecycle state, per spec §4.F. Terminal states are `Completed`,
/// `Failed`, `Missed`, and `Cancelled`. Transitions are enforced by
/// `engine::orchestrator`, not by this type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    Initiated,
    Ringing,
    InProgress,
    Completed,
    Failed,
    Missed,
    Cancelled,
}

impl CallStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            CallStatus::Completed | CallStatus::Failed | CallStatus::Missed | CallStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallRetrySettings {
    /// Clamped to [0, 10] at the validation boundary.
    pub retry_count: u8,
    /// Clamped to [1, 1440] at the validation boundary.
    pub retry_interval_minutes: u32,
    pub alert_on_all_missed_calls: bool,
}

impl Default for CallRetrySettings {
    fn default() -> Self {
        Self {
            retry_count: 2,
            retry_interval_minutes: 15,
            alert_on_all_missed_calls: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Organization {
    pub id: OrgId,
    pub name: String,
    pub contact_email: String,
    pub call_retry_settings: CallRetrySettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Caregiver {
    pub id: CaregiverId,
    pub org_id: OrgId,
    pub name: String,
    pub contact_email: Option<String>,
    pub contact_phone: Option<String>,
    pub role: CaregiverRole,
    pub email_verified: bool,
    pub phone_verified: bool,
    pub push_device_tokens: Vec<String>,
    pub assigned_patient_ids: Vec<PatientId>,
}

impl Caregiver {
    pub fn can_receive_sms(&self) -> bool {
        self.phone_verified && self.contact_phone.is_some()
    }

    pub fn can_receive_email(&self) -> bool {
        self.email_verified && self.contact_email.is_some()
    }

    pub fn can_receive_push(&self) -> bool {
        !self.push_device_tokens.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Patient {
    pub id: PatientId,
    pub org_id: OrgId,
    /// E.164, validated at the boundary (spec §7, Validation class).
    pub phone: String,
    pub preferred_language: String,
    pub medical_metadata: serde_json::Value,
    pub assigned_caregiver_ids: Vec<CaregiverId>,
}

impl Patient {
    /// A patient is call-eligible only when at least one caregiver is assigned
    /// (spec §3, Patient invariant).
    pub fn is_call_eligible(&self) -> bool {
        !self.assigned_caregiver_ids.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schedule {
    pub id: ScheduleId,
    pub patient_id: PatientId,
    pub frequency: ScheduleFrequency,
    pub time_of_day: NaiveTime,
    /// Weekly only: 0=Sunday .. 6=Saturday.
    pub day_of_week: Option<u8>,
    /// Weekly only: fire every N weeks.
    pub week_interval: Option<u32>,
    /// Monthly only: clamps to the last day of a shorter month.
    pub day_of_month: Option<u8>,
    pub is_active: bool,
    pub next_call_date: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: ConversationId,
    pub org_id: OrgId,
    pub patient_id: PatientId,
    pub agent_id: Option<CaregiverId>,
    pub call_sid: Option<String>,
    pub asterisk_channel_id: Option<String>,
    pub call_status: CallStatus,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    /// Seconds; never negative.
    pub duration_seconds: i64,
    pub cost_cents: Cents,
    pub line_item_id: Option<LineItemId>,
    pub retry_attempt: u32,
    pub max_retries: u32,
    pub original_call_id: Option<ConversationId>,
    pub retry_scheduled_at: Option<DateTime<Utc>>,
    pub call_notes: Option<String>,
    pub outcome: Option<String>,
}

impl Conversation {
    pub fn is_unbilled(&self) -> bool {
        self.line_item_id.is_none()
    }

    pub fn is_root_attempt(&self) -> bool {
        self.retry_attempt == 0 && self.original_call_id.is_none()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub role: MessageRole,
    pub content: String,
    /// Conversation-local, 0-based insertion order.
    pub position: i32,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub id: AlertId,
    pub patient_id: PatientId,
    pub conversation_id: Option<ConversationId>,
    pub severity: Severity,
    pub category: String,
    pub phrase: String,
    pub raw_utterance: String,
    pub detected_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertDelivery {
    pub id: AlertDeliveryId,
    pub alert_id: AlertId,
    pub caregiver_id: Option<CaregiverId>,
    pub transport: String,
    pub outcome: String,
    pub attempted_at: DateTime<Utc>,
    pub delivered_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmergencyPhrase {
    pub id: PhraseId,
    pub language: String,
    pub severity: Severity,
    pub category: String,
    pub phrase: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Invoice {
    pub id: InvoiceId,
    pub org_id: OrgId,
    pub invoice_number: i64,
    pub issue_date: DateTime<Utc>,
    pub due_date: DateTime<Utc>,
    pub status: InvoiceStatus,
    pub total_amount_cents: Cents,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LineItem {
    pub id: LineItemId,
    pub invoice_id: InvoiceId,
    pub patient_id: PatientId,
    pub amount_cents: Cents,
    pub quantity: i32,
    pub unit_price_cents: Cents,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub description: String,
}
