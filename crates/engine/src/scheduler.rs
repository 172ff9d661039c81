//! Component G — Scheduler (spec §4.G). Computes each active schedule's next
//! fire time for daily/weekly/monthly frequencies and fires calls through the
//! `CallOrchestrator`, serialized per schedule by `ScheduleStore`'s fire lock
//! so two scheduler workers never double-dial the same patient.

use std::sync::Arc;

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, Utc};
use models::{Schedule, ScheduleFrequency};

use crate::error::EngineResult;
use crate::orchestrator::CallOrchestrator;
use crate::store::{ConversationStore, PatientStore, ScheduleStore};

/// Grace window inside which a second fire of the same schedule is treated as
/// a duplicate rather than a new occurrence (spec §4.G).
const FIRE_LOCK_GRACE: Duration = Duration::minutes(5);

fn last_day_of_month(year: i32, month: u32) -> u32 {
    let (next_year, next_month) = if month == 12 { (year + 1, 1) } else { (year, month + 1) };
    NaiveDate::from_ymd_opt(next_year, next_month, 1)
        .unwrap()
        .pred_opt()
        .unwrap()
        .day()
}

/// Computes the next fire time strictly after `after`, per spec §4.G:
/// - daily: same time of day, next calendar day.
/// - weekly: the configured day-of-week, every `week_interval` weeks.
/// - monthly: the configured day-of-month, clamped to the last day of a
///   shorter month (e.g. day 31 in April becomes April 30).
pub fn compute_next_call_date(schedule: &Schedule, after: DateTime<Utc>) -> DateTime<Utc> {
    match schedule.frequency {
        ScheduleFrequency::Daily => combine_next_day(after, schedule.time_of_day, 1),
        ScheduleFrequency::Weekly => {
            let target_dow = schedule.day_of_week.unwrap_or(after.weekday().num_days_from_sunday() as u8) as i64;
            let interval_weeks = schedule.week_interval.unwrap_or(1).max(1) as i64;
            let mut candidate = combine_same_day(after, schedule.time_of_day);
            if candidate <= after {
                candidate += Duration::days(1);
            }
            loop {
                let dow = candidate.weekday().num_days_from_sunday() as i64;
                if dow == target_dow && weeks_since_epoch(candidate) % interval_weeks == 0 {
                    return candidate;
                }
                candidate += Duration::days(1);
            }
        }
        ScheduleFrequency::Monthly => {
            let target_day = schedule.day_of_month.unwrap_or(1).max(1);
            let mut year = after.year();
            let mut month = after.month();
            loop {
                let (ny, nm) = if month == 12 { (year + 1, 1) } else { (year, month + 1) };
                year = ny;
                month = nm;
                let day = target_day.min(last_day_of_month(year, month) as u8);
                let candidate = NaiveDate::from_ymd_opt(year, month, day as u32)
                    .unwrap()
                    .and_time(schedule.time_of_day)
                    .and_utc();
                if candidate > after {
                    return candidate;
                }
            }
        }
    }
}

fn combine_same_day(after: DateTime<Utc>, time_of_day: NaiveTime) -> DateTime<Utc> {
    after.date_naive().and_time(time_of_day).and_utc()
}

fn combine_next_day(after: DateTime<Utc>, time_of_day: NaiveTime, min_days_ahead: i64) -> DateTime<Utc> {
    let mut candidate = combine_same_day(after, time_of_day);
    if candidate <= after {
        candidate += Duration::days(1);
    }
    if min_days_ahead > 1 {
        candidate += Duration::days(min_days_ahead - 1);
    }
    candidate
}

fn weeks_since_epoch(date: DateTime<Utc>) -> i64 {
    date.date_naive().num_days_from_ce() as i64 / 7
}

/// Drives the fire step for one tick: finds active schedules due to fire,
/// acquires each one's fire lock, and places a call through the orchestrator.
pub struct Scheduler {
    schedules: Arc<dyn ScheduleStore>,
    patients: Arc<dyn PatientStore>,
    conversations: Arc<dyn ConversationStore>,
    orchestrator: Arc<CallOrchestrator>,
    callback_url: String,
}

impl Scheduler {
    pub fn new(
        schedules: Arc<dyn ScheduleStore>,
        patients: Arc<dyn PatientStore>,
        conversations: Arc<dyn ConversationStore>,
        orchestrator: Arc<CallOrchestrator>,
        callback_url: String,
    ) -> Self {
        Self {
            schedules,
            patients,
            conversations,
            orchestrator,
            callback_url,
        }
    }

    /// Runs one scheduler tick: fires every active schedule whose
    /// `next_call_date` has passed, then advances it, and dials every pending
    /// retry conversation whose `retry_scheduled_at` has passed (spec §4.F).
    /// Returns the number of calls placed.
    pub async fn run_tick(&self, now: DateTime<Utc>) -> EngineResult<usize> {
        let mut fired = self.fire_due_schedules(now).await?;
        fired += self.fire_due_retries(now).await?;
        Ok(fired)
    }

    async fn fire_due_retries(&self, now: DateTime<Utc>) -> EngineResult<usize> {
        let due = self.conversations.find_due_retries(now).await?;
        let mut fired = 0;
        for conversation in due {
            let patient = self.patients.get(conversation.patient_id).await?;
            if !patient.is_call_eligible() {
                tracing::warn!(conversation_id = %conversation.id, patient_id = %patient.id, "retry fired for an ineligible patient");
                continue;
            }
            if let Err(err) = self
                .orchestrator
                .fire_due_retry(conversation.id, &patient.phone, &self.callback_url)
                .await
            {
                tracing::error!(?err, conversation_id = %conversation.id, "retry call placement failed");
            } else {
                fired += 1;
            }
        }
        Ok(fired)
    }

    async fn fire_due_schedules(&self, now: DateTime<Utc>) -> EngineResult<usize> {
        let due: Vec<Schedule> = self
            .schedules
            .list_active()
            .await?
            .into_iter()
            .filter(|s| s.next_call_date <= now)
            .collect();

        let mut fired = 0;
        for schedule in due {
            if !self.schedules.try_acquire_fire_lock(schedule.id, FIRE_LOCK_GRACE).await? {
                continue;
            }

            let patient = self.patients.get(schedule.patient_id).await?;
            if patient.is_call_eligible() {
                let max_retries = 2;
                if let Err(err) = self
                    .orchestrator
                    .start_call(
                        patient.org_id,
                        patient.id,
                        &patient.phone,
                        &self.callback_url,
                        None,
                        max_retries,
                    )
                    .await
                {
                    tracing::error!(?err, schedule_id = %schedule.id, "scheduled call placement failed");
                } else {
                    fired += 1;
                }
            } else {
                tracing::warn!(schedule_id = %schedule.id, patient_id = %patient.id, "schedule fired for an ineligible patient");
            }

            let next = compute_next_call_date(&schedule, now);
            self.schedules.advance_next_call_date(schedule.id, next).await?;
        }

        Ok(fired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use uuid::Uuid;

    fn schedule(frequency: ScheduleFrequency) -> Schedule {
        Schedule {
            id: Uuid::new_v4(),
            patient_id: Uuid::new_v4(),
            frequency,
            time_of_day: NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
            day_of_week: None,
            week_interval: None,
            day_of_month: None,
            is_active: true,
            next_call_date: Utc::now(),
        }
    }

    #[test]
    fn daily_advances_exactly_one_day() {
        let s = schedule(ScheduleFrequency::Daily);
        let after = Utc.with_ymd_and_hms(2026, 3, 1, 10, 0, 0).unwrap();
        let next = compute_next_call_date(&s, after);
        assert_eq!(next.date_naive(), NaiveDate::from_ymd_opt(2026, 3, 2).unwrap());
        assert_eq!(next.time(), s.time_of_day);
    }

    #[test]
    fn weekly_lands_on_the_configured_day_of_week() {
        let mut s = schedule(ScheduleFrequency::Weekly);
        s.day_of_week = Some(3); // Wednesday
        s.week_interval = Some(1);
        let after = Utc.with_ymd_and_hms(2026, 3, 1, 10, 0, 0).unwrap(); // a Sunday
        let next = compute_next_call_date(&s, after);
        assert_eq!(next.weekday().num_days_from_sunday(), 3);
        assert!(next > after);
    }

    #[test]
    fn monthly_clamps_to_the_last_day_of_a_shorter_month() {
        let mut s = schedule(ScheduleFrequency::Monthly);
        s.day_of_month = Some(31);
        let after = Utc.with_ymd_and_hms(2026, 3, 31, 10, 0, 0).unwrap();
        let next = compute_next_call_date(&s, after);
        assert_eq!(next.month(), 4);
        assert_eq!(next.day(), 30);
    }
}
