//! Postgres-backed persistence, following the teacher's
//! `sqlx::PgPoolOptions` + hand-mapped `row.try_get(...)` idiom rather than
//! `FromRow` derives on the shared domain types.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveTime, Utc};
use models::*;
use sqlx::{postgres::PgPoolOptions, Pool, Postgres, Row};
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};
use crate::store::{
    compute_cost_cents, AlertStore, CallStatusUpdate, CaregiverStore, ConversationStore, InvoiceStore, OrgStore,
    PatientStore, PhraseStore, RetryChain, ScheduleStore,
};

fn map_sqlx(err: sqlx::Error) -> EngineError {
    EngineError::Transient {
        component: "postgres",
        detail: err.to_string(),
    }
}

fn call_status_to_str(status: CallStatus) -> &'static str {
    match status {
        CallStatus::Initiated => "initiated",
        CallStatus::Ringing => "ringing",
        CallStatus::InProgress => "in_progress",
        CallStatus::Completed => "completed",
        CallStatus::Failed => "failed",
        CallStatus::Missed => "missed",
        CallStatus::Cancelled => "cancelled",
    }
}

fn call_status_from_str(value: &str) -> CallStatus {
    match value {
        "ringing" => CallStatus::Ringing,
        "in_progress" => CallStatus::InProgress,
        "completed" => CallStatus::Completed,
        "failed" => CallStatus::Failed,
        "missed" => CallStatus::Missed,
        "cancelled" => CallStatus::Cancelled,
        _ => CallStatus::Initiated,
    }
}

fn severity_to_str(severity: Severity) -> &'static str {
    match severity {
        Severity::Critical => "CRITICAL",
        Severity::High => "HIGH",
        Severity::Medium => "MEDIUM",
    }
}

fn severity_from_str(value: &str) -> Severity {
    match value {
        "CRITICAL" => Severity::Critical,
        "HIGH" => Severity::High,
        _ => Severity::Medium,
    }
}

pub struct PgStore {
    pool: Pool<Postgres>,
    rate_per_minute_cents: i64,
    minimum_billable_seconds: i64,
}

impl PgStore {
    pub async fn connect(database_url: &str, rate_per_minute_cents: i64, minimum_billable_seconds: i64) -> EngineResult<Arc<Self>> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .map_err(map_sqlx)?;
        sqlx::migrate!("./migrations").run(&pool).await.map_err(|err| EngineError::ConfigInvariant {
            detail: format!("migration failed: {err}"),
        })?;
        Ok(Arc::new(Self {
            pool,
            rate_per_minute_cents,
            minimum_billable_seconds,
        }))
    }

    fn row_to_conversation(row: &sqlx::postgres::PgRow) -> EngineResult<Conversation> {
        Ok(Conversation {
            id: row.try_get("id").map_err(map_sqlx)?,
            org_id: row.try_get("org_id").map_err(map_sqlx)?,
            patient_id: row.try_get("patient_id").map_err(map_sqlx)?,
            agent_id: row.try_get("agent_id").map_err(map_sqlx)?,
            call_sid: row.try_get("call_sid").map_err(map_sqlx)?,
            asterisk_channel_id: row.try_get("asterisk_channel_id").map_err(map_sqlx)?,
            call_status: call_status_from_str(row.try_get::<String, _>("call_status").map_err(map_sqlx)?.as_str()),
            start_time: row.try_get("start_time").map_err(map_sqlx)?,
            end_time: row.try_get("end_time").map_err(map_sqlx)?,
            duration_seconds: row.try_get("duration_seconds").map_err(map_sqlx)?,
            cost_cents: row.try_get("cost_cents").map_err(map_sqlx)?,
            line_item_id: row.try_get("line_item_id").map_err(map_sqlx)?,
            retry_attempt: row.try_get::<i32, _>("retry_attempt").map_err(map_sqlx)? as u32,
            max_retries: row.try_get::<i32, _>("max_retries").map_err(map_sqlx)? as u32,
            original_call_id: row.try_get("original_call_id").map_err(map_sqlx)?,
            retry_scheduled_at: row.try_get("retry_scheduled_at").map_err(map_sqlx)?,
            call_notes: row.try_get("call_notes").map_err(map_sqlx)?,
            outcome: row.try_get("outcome").map_err(map_sqlx)?,
        })
    }
}

#[async_trait]
impl ConversationStore for PgStore {
    async fn open_conversation(
        &self,
        org_id: OrgId,
        patient_id: PatientId,
        agent_id: Option<CaregiverId>,
        initial_status: CallStatus,
        retry_chain: RetryChain,
    ) -> EngineResult<Conversation> {
        let id = Uuid::new_v4();
        sqlx::query(
            r#"INSERT INTO conversations
                (id, org_id, patient_id, agent_id, call_status, duration_seconds, cost_cents,
                 retry_attempt, max_retries, original_call_id, retry_scheduled_at)
               VALUES ($1, $2, $3, $4, $5, 0, 0, $6, $7, $8, $9)"#,
        )
        .bind(id)
        .bind(org_id)
        .bind(patient_id)
        .bind(agent_id)
        .bind(call_status_to_str(initial_status))
        .bind(retry_chain.retry_attempt as i32)
        .bind(retry_chain.max_retries as i32)
        .bind(retry_chain.original_call_id)
        .bind(retry_chain.retry_scheduled_at)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;

        ConversationStore::get(self, id).await
    }

    async fn set_call_sid(&self, conversation_id: ConversationId, call_sid: String) -> EngineResult<()> {
        sqlx::query("UPDATE conversations SET call_sid = $1 WHERE id = $2")
            .bind(call_sid)
            .bind(conversation_id)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx)?;
        Ok(())
    }

    async fn set_channel_id(&self, conversation_id: ConversationId, channel_id: String) -> EngineResult<()> {
        sqlx::query("UPDATE conversations SET asterisk_channel_id = $1 WHERE id = $2")
            .bind(channel_id)
            .bind(conversation_id)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx)?;
        Ok(())
    }

    async fn append_message(&self, conversation_id: ConversationId, role: MessageRole, content: String) -> EngineResult<i32> {
        let position: i64 = sqlx::query_scalar("SELECT COALESCE(MAX(position), -1) + 1 FROM messages WHERE conversation_id = $1")
            .bind(conversation_id)
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx)?;

        let role_str = match role {
            MessageRole::Patient => "patient",
            MessageRole::Assistant => "assistant",
            MessageRole::System => "system",
        };
        sqlx::query("INSERT INTO messages (id, conversation_id, role, content, position) VALUES ($1, $2, $3, $4, $5)")
            .bind(Uuid::new_v4())
            .bind(conversation_id)
            .bind(role_str)
            .bind(content)
            .bind(position as i32)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx)?;
        Ok(position as i32)
    }

    async fn update_call_status(
        &self,
        conversation_id: ConversationId,
        new_status: CallStatus,
        update: CallStatusUpdate,
    ) -> EngineResult<Conversation> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx)?;

        let alert_on_all_missed_calls: bool = sqlx::query_scalar(
            r#"SELECT o.alert_on_all_missed_calls FROM organizations o
               JOIN conversations c ON c.org_id = o.id WHERE c.id = $1"#,
        )
        .bind(conversation_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(map_sqlx)?
        .unwrap_or(false);

        if let Some(start_time) = update.start_time {
            sqlx::query("UPDATE conversations SET start_time = $1 WHERE id = $2")
                .bind(start_time)
                .bind(conversation_id)
                .execute(&mut *tx)
                .await
                .map_err(map_sqlx)?;
        }
        if let Some(end_time) = update.end_time {
            sqlx::query("UPDATE conversations SET end_time = $1 WHERE id = $2")
                .bind(end_time)
                .bind(conversation_id)
                .execute(&mut *tx)
                .await
                .map_err(map_sqlx)?;
        }
        if let Some(notes) = &update.notes {
            sqlx::query("UPDATE conversations SET call_notes = $1 WHERE id = $2")
                .bind(notes)
                .bind(conversation_id)
                .execute(&mut *tx)
                .await
                .map_err(map_sqlx)?;
        }
        if let Some(outcome) = &update.outcome {
            sqlx::query("UPDATE conversations SET outcome = $1 WHERE id = $2")
                .bind(outcome)
                .bind(conversation_id)
                .execute(&mut *tx)
                .await
                .map_err(map_sqlx)?;
        }

        let row = sqlx::query("SELECT start_time, end_time, duration_seconds FROM conversations WHERE id = $1")
            .bind(conversation_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(map_sqlx)?
            .ok_or(EngineError::ConversationNotFound(conversation_id))?;
        let start_time: Option<DateTime<Utc>> = row.try_get("start_time").map_err(map_sqlx)?;
        let end_time: Option<DateTime<Utc>> = row.try_get("end_time").map_err(map_sqlx)?;
        let stored_duration: i64 = row.try_get("duration_seconds").map_err(map_sqlx)?;

        let duration_seconds = match update.duration_seconds {
            Some(duration) => duration.max(0),
            None => match (start_time, end_time) {
                (Some(start), Some(end)) => (end - start).num_seconds().max(0),
                _ => stored_duration,
            },
        };

        let connected = start_time.is_some();
        let cost_cents = if new_status.is_terminal() {
            match update.cost_cents {
                Some(cost) => cost,
                None => {
                    compute_cost_cents(duration_seconds, connected, alert_on_all_missed_calls, self.minimum_billable_seconds, self.rate_per_minute_cents).1
                }
            }
        } else {
            0
        };

        if new_status.is_terminal() {
            sqlx::query("UPDATE conversations SET call_status = $1, duration_seconds = $2, cost_cents = $3 WHERE id = $4")
                .bind(call_status_to_str(new_status))
                .bind(duration_seconds)
                .bind(cost_cents)
                .bind(conversation_id)
                .execute(&mut *tx)
                .await
                .map_err(map_sqlx)?;
        } else {
            sqlx::query("UPDATE conversations SET call_status = $1, duration_seconds = $2 WHERE id = $3")
                .bind(call_status_to_str(new_status))
                .bind(duration_seconds)
                .bind(conversation_id)
                .execute(&mut *tx)
                .await
                .map_err(map_sqlx)?;
        }

        tx.commit().await.map_err(map_sqlx)?;
        ConversationStore::get(self, conversation_id).await
    }

    async fn get(&self, conversation_id: ConversationId) -> EngineResult<Conversation> {
        let row = sqlx::query("SELECT * FROM conversations WHERE id = $1")
            .bind(conversation_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx)?
            .ok_or(EngineError::ConversationNotFound(conversation_id))?;
        Self::row_to_conversation(&row)
    }

    async fn get_messages(&self, conversation_id: ConversationId) -> EngineResult<Vec<Message>> {
        let rows = sqlx::query("SELECT * FROM messages WHERE conversation_id = $1 ORDER BY position")
            .bind(conversation_id)
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx)?;
        rows.into_iter()
            .map(|row| {
                let role_str: String = row.try_get("role").map_err(map_sqlx)?;
                Ok(Message {
                    id: row.try_get("id").map_err(map_sqlx)?,
                    conversation_id: row.try_get("conversation_id").map_err(map_sqlx)?,
                    role: match role_str.as_str() {
                        "assistant" => MessageRole::Assistant,
                        "system" => MessageRole::System,
                        _ => MessageRole::Patient,
                    },
                    content: row.try_get("content").map_err(map_sqlx)?,
                    position: row.try_get("position").map_err(map_sqlx)?,
                    created_at: row.try_get("created_at").map_err(map_sqlx)?,
                })
            })
            .collect()
    }

    async fn find_unbilled(&self, org_id: OrgId, window_start: DateTime<Utc>, window_end: DateTime<Utc>) -> EngineResult<Vec<Conversation>> {
        let rows = sqlx::query(
            r#"SELECT * FROM conversations
               WHERE org_id = $1 AND line_item_id IS NULL
               AND end_time >= $2 AND end_time < $3"#,
        )
        .bind(org_id)
        .bind(window_start)
        .bind(window_end)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?;
        rows.iter().map(Self::row_to_conversation).collect()
    }

    async fn mark_billed(&self, conversation_ids: &[ConversationId], line_item_id: LineItemId) -> EngineResult<()> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx)?;
        let already_billed: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM conversations WHERE id = ANY($1) AND line_item_id IS NOT NULL",
        )
        .bind(conversation_ids)
        .fetch_one(&mut *tx)
        .await
        .map_err(map_sqlx)?;
        if already_billed > 0 {
            return Err(EngineError::AlreadyBilled(conversation_ids[0]));
        }
        sqlx::query("UPDATE conversations SET line_item_id = $1 WHERE id = ANY($2)")
            .bind(line_item_id)
            .bind(conversation_ids)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx)?;
        tx.commit().await.map_err(map_sqlx)?;
        Ok(())
    }

    async fn find_orphaned_in_progress(&self, older_than: DateTime<Utc>) -> EngineResult<Vec<Conversation>> {
        let rows = sqlx::query("SELECT * FROM conversations WHERE call_status = 'in_progress' AND start_time < $1")
            .bind(older_than)
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx)?;
        rows.iter().map(Self::row_to_conversation).collect()
    }

    async fn find_due_retries(&self, now: DateTime<Utc>) -> EngineResult<Vec<Conversation>> {
        let rows = sqlx::query(
            "SELECT * FROM conversations WHERE call_sid IS NULL AND retry_scheduled_at IS NOT NULL AND retry_scheduled_at <= $1",
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?;
        rows.iter().map(Self::row_to_conversation).collect()
    }
}

#[async_trait]
impl AlertStore for PgStore {
    async fn save_alert(&self, alert: Alert) -> EngineResult<()> {
        sqlx::query(
            r#"INSERT INTO alerts (id, patient_id, conversation_id, severity, category, phrase, raw_utterance, detected_at)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8)"#,
        )
        .bind(alert.id)
        .bind(alert.patient_id)
        .bind(alert.conversation_id)
        .bind(severity_to_str(alert.severity))
        .bind(alert.category)
        .bind(alert.phrase)
        .bind(alert.raw_utterance)
        .bind(alert.detected_at)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(())
    }

    async fn save_alert_delivery(&self, delivery: AlertDelivery) -> EngineResult<()> {
        sqlx::query(
            r#"INSERT INTO alert_deliveries (id, alert_id, caregiver_id, transport, outcome, attempted_at, delivered_at)
               VALUES ($1, $2, $3, $4, $5, $6, $7)"#,
        )
        .bind(delivery.id)
        .bind(delivery.alert_id)
        .bind(delivery.caregiver_id)
        .bind(delivery.transport)
        .bind(delivery.outcome)
        .bind(delivery.attempted_at)
        .bind(delivery.delivered_at)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(())
    }
}

#[async_trait]
impl PhraseStore for PgStore {
    async fn load_all(&self) -> EngineResult<Vec<EmergencyPhrase>> {
        let rows = sqlx::query("SELECT * FROM emergency_phrases").fetch_all(&self.pool).await.map_err(map_sqlx)?;
        rows.into_iter()
            .map(|row| {
                Ok(EmergencyPhrase {
                    id: row.try_get("id").map_err(map_sqlx)?,
                    language: row.try_get("language").map_err(map_sqlx)?,
                    severity: severity_from_str(row.try_get::<String, _>("severity").map_err(map_sqlx)?.as_str()),
                    category: row.try_get("category").map_err(map_sqlx)?,
                    phrase: row.try_get("phrase").map_err(map_sqlx)?,
                })
            })
            .collect()
    }
}

#[async_trait]
impl ScheduleStore for PgStore {
    async fn list_active(&self) -> EngineResult<Vec<Schedule>> {
        let rows = sqlx::query("SELECT * FROM schedules WHERE is_active").fetch_all(&self.pool).await.map_err(map_sqlx)?;
        rows.into_iter()
            .map(|row| {
                Ok(Schedule {
                    id: row.try_get("id").map_err(map_sqlx)?,
                    patient_id: row.try_get("patient_id").map_err(map_sqlx)?,
                    frequency: match row.try_get::<String, _>("frequency").map_err(map_sqlx)?.as_str() {
                        "weekly" => ScheduleFrequency::Weekly,
                        "monthly" => ScheduleFrequency::Monthly,
                        _ => ScheduleFrequency::Daily,
                    },
                    time_of_day: row.try_get::<NaiveTime, _>("time_of_day").map_err(map_sqlx)?,
                    day_of_week: row.try_get::<Option<i16>, _>("day_of_week").map_err(map_sqlx)?.map(|v| v as u8),
                    week_interval: row.try_get::<Option<i32>, _>("week_interval").map_err(map_sqlx)?.map(|v| v as u32),
                    day_of_month: row.try_get::<Option<i16>, _>("day_of_month").map_err(map_sqlx)?.map(|v| v as u8),
                    is_active: row.try_get("is_active").map_err(map_sqlx)?,
                    next_call_date: row.try_get("next_call_date").map_err(map_sqlx)?,
                })
            })
            .collect()
    }

    async fn advance_next_call_date(&self, schedule_id: ScheduleId, next_call_date: DateTime<Utc>) -> EngineResult<()> {
        sqlx::query("UPDATE schedules SET next_call_date = $1 WHERE id = $2")
            .bind(next_call_date)
            .bind(schedule_id)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx)?;
        Ok(())
    }

    async fn try_acquire_fire_lock(&self, schedule_id: ScheduleId, grace: chrono::Duration) -> EngineResult<bool> {
        let now = Utc::now();
        let result = sqlx::query(
            r#"UPDATE schedules SET fire_locked_until = $1
               WHERE id = $2 AND (fire_locked_until IS NULL OR fire_locked_until <= $3)"#,
        )
        .bind(now + grace)
        .bind(schedule_id)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl InvoiceStore for PgStore {
    async fn next_invoice_number(&self, org_id: OrgId) -> EngineResult<i64> {
        let next: i64 = sqlx::query_scalar(
            "UPDATE organizations SET invoice_counter = invoice_counter + 1 WHERE id = $1 RETURNING invoice_counter",
        )
        .bind(org_id)
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(next)
    }

    async fn create_invoice(&self, invoice: Invoice, line_items: Vec<LineItem>) -> EngineResult<()> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx)?;
        let status = match invoice.status {
            InvoiceStatus::Draft => "draft",
            InvoiceStatus::Pending => "pending",
            InvoiceStatus::Paid => "paid",
            InvoiceStatus::Void => "void",
            InvoiceStatus::Overdue => "overdue",
        };
        sqlx::query(
            r#"INSERT INTO invoices (id, org_id, invoice_number, issue_date, due_date, status, total_amount_cents)
               VALUES ($1, $2, $3, $4, $5, $6, $7)"#,
        )
        .bind(invoice.id)
        .bind(invoice.org_id)
        .bind(invoice.invoice_number)
        .bind(invoice.issue_date)
        .bind(invoice.due_date)
        .bind(status)
        .bind(invoice.total_amount_cents)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx)?;

        for item in line_items {
            sqlx::query(
                r#"INSERT INTO line_items
                    (id, invoice_id, patient_id, amount_cents, quantity, unit_price_cents, period_start, period_end, description)
                   VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)"#,
            )
            .bind(item.id)
            .bind(item.invoice_id)
            .bind(item.patient_id)
            .bind(item.amount_cents)
            .bind(item.quantity)
            .bind(item.unit_price_cents)
            .bind(item.period_start)
            .bind(item.period_end)
            .bind(item.description)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx)?;
        }
        tx.commit().await.map_err(map_sqlx)?;
        Ok(())
    }

    async fn delete_invoice(&self, invoice_id: InvoiceId) -> EngineResult<()> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx)?;
        sqlx::query("DELETE FROM line_items WHERE invoice_id = $1").bind(invoice_id).execute(&mut *tx).await.map_err(map_sqlx)?;
        sqlx::query("DELETE FROM invoices WHERE id = $1").bind(invoice_id).execute(&mut *tx).await.map_err(map_sqlx)?;
        tx.commit().await.map_err(map_sqlx)?;
        Ok(())
    }
}

fn row_to_org(row: &sqlx::postgres::PgRow) -> EngineResult<Organization> {
    Ok(Organization {
        id: row.try_get("id").map_err(map_sqlx)?,
        name: row.try_get("name").map_err(map_sqlx)?,
        contact_email: row.try_get("contact_email").map_err(map_sqlx)?,
        call_retry_settings: CallRetrySettings {
            retry_count: row.try_get::<i16, _>("retry_count").map_err(map_sqlx)? as u8,
            retry_interval_minutes: row.try_get::<i32, _>("retry_interval_minutes").map_err(map_sqlx)? as u32,
            alert_on_all_missed_calls: row.try_get("alert_on_all_missed_calls").map_err(map_sqlx)?,
        },
    })
}

#[async_trait]
impl OrgStore for PgStore {
    async fn get(&self, org_id: OrgId) -> EngineResult<Organization> {
        let row = sqlx::query("SELECT * FROM organizations WHERE id = $1")
            .bind(org_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx)?
            .ok_or_else(|| EngineError::Validation {
                detail: format!("unknown org {org_id}"),
            })?;
        row_to_org(&row)
    }

    async fn list_all(&self) -> EngineResult<Vec<Organization>> {
        let rows = sqlx::query("SELECT * FROM organizations").fetch_all(&self.pool).await.map_err(map_sqlx)?;
        rows.iter().map(row_to_org).collect()
    }
}

#[async_trait]
impl PatientStore for PgStore {
    async fn get(&self, patient_id: PatientId) -> EngineResult<Patient> {
        let row = sqlx::query("SELECT * FROM patients WHERE id = $1")
            .bind(patient_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx)?
            .ok_or_else(|| EngineError::Validation {
                detail: format!("unknown patient {patient_id}"),
            })?;
        Ok(Patient {
            id: row.try_get("id").map_err(map_sqlx)?,
            org_id: row.try_get("org_id").map_err(map_sqlx)?,
            phone: row.try_get("phone").map_err(map_sqlx)?,
            preferred_language: row.try_get("preferred_language").map_err(map_sqlx)?,
            medical_metadata: row.try_get("medical_metadata").map_err(map_sqlx)?,
            assigned_caregiver_ids: row.try_get("assigned_caregiver_ids").map_err(map_sqlx)?,
        })
    }
}

#[async_trait]
impl CaregiverStore for PgStore {
    async fn get_many(&self, caregiver_ids: &[CaregiverId]) -> EngineResult<Vec<Caregiver>> {
        let rows = sqlx::query("SELECT * FROM caregivers WHERE id = ANY($1)")
            .bind(caregiver_ids)
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx)?;
        rows.into_iter()
            .map(|row| {
                Ok(Caregiver {
                    id: row.try_get("id").map_err(map_sqlx)?,
                    org_id: row.try_get("org_id").map_err(map_sqlx)?,
                    name: row.try_get("name").map_err(map_sqlx)?,
                    contact_email: row.try_get("contact_email").map_err(map_sqlx)?,
                    contact_phone: row.try_get("contact_phone").map_err(map_sqlx)?,
                    role: match row.try_get::<String, _>("role").map_err(map_sqlx)?.as_str() {
                        "org_admin" => CaregiverRole::OrgAdmin,
                        "super_admin" => CaregiverRole::SuperAdmin,
                        _ => CaregiverRole::Staff,
                    },
                    email_verified: row.try_get("email_verified").map_err(map_sqlx)?,
                    phone_verified: row.try_get("phone_verified").map_err(map_sqlx)?,
                    push_device_tokens: row.try_get("push_device_tokens").map_err(map_sqlx)?,
                    assigned_patient_ids: row.try_get("assigned_patient_ids").map_err(map_sqlx)?,
                })
            })
            .collect()
    }
}
