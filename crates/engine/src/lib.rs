//! Wellness call engine: the nine components of spec §2 as one library crate,
//! shared by every service binary. Each component is a module exposing a
//! small async-trait boundary so the HTTP/WebSocket/worker services can wire
//! production adapters while tests wire the in-memory ones from `store`.

pub mod ai_session;
pub mod billing;
pub mod bridge;
pub mod config;
pub mod detector;
pub mod error;
pub mod notify;
pub mod orchestrator;
pub mod scheduler;
pub mod store;
pub mod store_pg;
pub mod telephony;

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

pub use config::EngineConfig;
pub use error::{EngineError, EngineResult};

use bridge::BridgeAdapter;
use detector::{EmergencyDetector, PhraseTable};
use notify::{DispatchingAlertSink, NotificationDispatcher, NotificationFanout};
use orchestrator::CallOrchestrator;
use scheduler::Scheduler;
use store::{AlertStore, CaregiverStore, ConversationStore, OrgStore, PatientStore, PhraseStore, ScheduleStore};
use telephony::TelephonyGateway;
use billing::BillingRollup;

/// Bag of store trait objects a production deployment wires once against its
/// Postgres pool; tests wire the same bag against one shared `InMemoryStore`.
pub struct Stores {
    pub conversations: Arc<dyn ConversationStore>,
    pub alerts: Arc<dyn AlertStore>,
    pub phrases: Arc<dyn PhraseStore>,
    pub schedules: Arc<dyn ScheduleStore>,
    pub invoices: Arc<dyn store::InvoiceStore>,
    pub orgs: Arc<dyn OrgStore>,
    pub patients: Arc<dyn PatientStore>,
    pub caregivers: Arc<dyn CaregiverStore>,
}

/// The fully wired engine: every component constructed once per process and
/// shared by the HTTP/WebSocket handlers and background loops.
pub struct Engine {
    pub config: EngineConfig,
    pub orchestrator: Arc<CallOrchestrator>,
    pub scheduler: Arc<Scheduler>,
    pub billing: Arc<BillingRollup>,
    pub detector: Arc<EmergencyDetector>,
    pub notifier: Arc<NotificationFanout>,
}

impl Engine {
    pub async fn wire(
        config: EngineConfig,
        stores: Stores,
        telephony: Arc<dyn TelephonyGateway>,
        bridge: Arc<dyn BridgeAdapter>,
        callback_url: String,
    ) -> EngineResult<Self> {
        let notifier = Arc::new(NotificationFanout::new(
            stores.patients.clone(),
            stores.caregivers.clone(),
            stores.alerts.clone(),
        ));

        let orchestrator = Arc::new(CallOrchestrator::new(
            stores.conversations.clone(),
            stores.orgs.clone(),
            stores.alerts.clone(),
            telephony,
            bridge,
            notifier.clone() as Arc<dyn NotificationDispatcher>,
        ));

        let scheduler = Arc::new(Scheduler::new(
            stores.schedules.clone(),
            stores.patients.clone(),
            stores.conversations.clone(),
            orchestrator.clone(),
            callback_url,
        ));

        let billing = Arc::new(BillingRollup::new(
            stores.conversations.clone(),
            stores.invoices.clone(),
            config.billing_max_retries,
        ));

        let phrases = stores.phrases.load_all().await?;
        let table = PhraseTable::build(phrases, std::collections::HashMap::new());
        let sink = Arc::new(DispatchingAlertSink::new(notifier.clone()));
        let detector = EmergencyDetector::spawn(
            table,
            config.debounce_minutes,
            config.max_alerts_per_hour,
            config.suppress_hypothetical_for_critical,
            sink,
        );

        Ok(Self {
            config,
            orchestrator,
            scheduler,
            billing,
            detector,
            notifier,
        })
    }

    /// Reloads the phrase vocabulary from `PhraseStore` without restarting the
    /// detector (spec §4.E, admin reload via copy-on-write swap).
    pub async fn reload_phrases(&self, phrases: Arc<dyn PhraseStore>) -> EngineResult<()> {
        let loaded = phrases.load_all().await?;
        self.detector.reload_phrases(PhraseTable::build(loaded, std::collections::HashMap::new()));
        Ok(())
    }

    /// Spawns the janitor sweep loop for orphaned `InProgress` conversations
    /// (spec §4.F). Returns the task handle so the caller can abort it on
    /// shutdown.
    pub fn spawn_janitor(&self, interval: Duration) -> JoinHandle<()> {
        let orchestrator = self.orchestrator.clone();
        let orphan_timeout = self.config.orphan_timeout;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let cutoff = chrono::Utc::now() - chrono::Duration::from_std(orphan_timeout).unwrap_or_default();
                match orchestrator.sweep_orphans(cutoff).await {
                    Ok(swept) if swept > 0 => tracing::info!(swept, "janitor swept orphaned conversations"),
                    Ok(_) => {}
                    Err(err) => tracing::error!(?err, "janitor sweep failed"),
                }
            }
        })
    }

    /// Spawns the scheduler tick loop (spec §4.G).
    pub fn spawn_scheduler(&self, interval: Duration) -> JoinHandle<()> {
        let scheduler = self.scheduler.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                match scheduler.run_tick(chrono::Utc::now()).await {
                    Ok(fired) if fired > 0 => tracing::info!(fired, "scheduler tick placed calls"),
                    Ok(_) => {}
                    Err(err) => tracing::error!(?err, "scheduler tick failed"),
                }
            }
        })
    }
}

/// Namespaces a call's Redis presence key for `services/signaling`'s realtime
/// duplex handler. Kept as a free function since it's pure string formatting,
/// not state the engine owns.
pub fn realtime_session_label(call_sid: &str) -> String {
    format!("ai-session:{call_sid}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn realtime_session_label_is_namespaced() {
        assert_eq!(realtime_session_label("CS1"), "ai-session:CS1");
    }
}
