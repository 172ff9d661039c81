//! Background loops that don't need an HTTP front door: the scheduler tick
//! (spec §4.G), the orphaned-call janitor sweep (spec §4.F), and the daily
//! billing rollup (spec §4.D/§4.H). Runs its own Postgres pool and its own
//! `Engine`, exactly as `services/api` does, since every component here is
//! process-local and none of it is reachable over HTTP.

use std::sync::Arc;
use std::time::Duration;

use engine::bridge::HttpBridgeAdapter;
use engine::store_pg::PgStore;
use engine::telephony::HttpTelephonyGateway;
use engine::{Engine, EngineConfig, Stores};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Sweeps every org's unbilled conversations for the trailing 24h window.
/// Errors for one org are logged and do not prevent the rest from rolling up.
async fn run_billing_cycle(engine: &Engine, orgs: Arc<dyn engine::store::OrgStore>) {
    let window_end = chrono::Utc::now();
    let window_start = window_end - chrono::Duration::hours(24);

    let orgs = match orgs.list_all().await {
        Ok(orgs) => orgs,
        Err(err) => {
            tracing::error!(?err, "failed to list orgs for billing cycle");
            return;
        }
    };

    for org in orgs {
        match engine.billing.roll_up_org(org.id, window_start, window_end).await {
            Ok(Some(summary)) => tracing::info!(
                org_id = %org.id,
                invoice_id = %summary.invoice_id,
                line_items = summary.line_item_count,
                total_cents = summary.total_amount_cents,
                "billing rollup produced an invoice"
            ),
            Ok(None) => {}
            Err(err) => tracing::error!(?err, org_id = %org.id, "billing rollup failed"),
        }
    }
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
        Engine::wire(config, stores, telephony, bridge, callback_url)
            .await
            .expect("failed to wire engine"),
    );

    let _janitor = engine.spawn_janitor(Duration::from_secs(60));
    let _scheduler = engine.spawn_scheduler(Duration::from_secs(30));

    let billing_interval = Duration::from_secs(
        std::env::var("BILLING_CYCLE_SECONDS").ok().and_then(|v| v.parse().ok()).unwrap_or(86_400),
    );
    let billing_engine = engine.clone();
    let billing_orgs: Arc<dyn engine::store::OrgStore> = store;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(billing_interval);
        loop {
            ticker.tick().await;
            run_billing_cycle(&billing_engine, billing_orgs.clone()).await;
        }
    });

    tracing::info!("worker service started: scheduler, janitor, and billing loops running");

    std::future::pending::<()>().await;
}
