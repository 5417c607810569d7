use std::sync::Arc;

use anyhow::Result;
use booking_service::api::{self, AppState};
use booking_service::config::{Args, ProviderSettings};
use booking_service::orchestrator::BookingOrchestrator;
use booking_service::outbox::{KafkaPublisher, OutboxProcessor};
use booking_service::payments::PaymentGatewayAdapter;
use booking_service::poller::{PaymentPoller, PollerRegistry};
use booking_service::promo::PromoCodeValidator;
use booking_service::reconciliation::ReconciliationJob;
use booking_service::store::PgStore;
use clap::Parser;
use diesel::{Connection, PgConnection};
use diesel_async::pooled_connection::bb8::Pool;
use diesel_async::pooled_connection::AsyncDieselConnectionManager;
use diesel_async::AsyncPgConnection;
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use mpesa_gateway::{DarajaClient, MobileMoneyProvider, SimulatedProvider};
use rdkafka::config::ClientConfig;
use rdkafka::producer::FutureProducer;
use shared::{Clock, SystemClock};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let settings = Args::parse().into_settings()?;

    info!("Running database migrations...");
    let mut conn = PgConnection::establish(&settings.database_url)?;
    conn.run_pending_migrations(MIGRATIONS)
        .map_err(|e| anyhow::anyhow!("Migration error: {}", e))?;
    info!("Migrations completed successfully");

    let config = AsyncDieselConnectionManager::<AsyncPgConnection>::new(&settings.database_url);
    let pool = Pool::builder().build(config).await?;
    let store = Arc::new(PgStore::new(pool));

    let producer: FutureProducer = ClientConfig::new()
        .set("bootstrap.servers", &settings.kafka_brokers)
        .set("message.timeout.ms", "5000")
        .create()?;

    let provider: Arc<dyn MobileMoneyProvider> = match settings.provider.clone() {
        ProviderSettings::Daraja(config) => Arc::new(DarajaClient::new(config)?),
        ProviderSettings::Simulated => {
            warn!("No M-Pesa credentials configured; payments are simulated");
            Arc::new(SimulatedProvider::new(0.8, 2))
        }
    };

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let orchestrator = BookingOrchestrator::new(store.clone(), clock.clone(), settings.reservation_ttl());
    let payments = PaymentGatewayAdapter::new(
        store.clone(),
        provider,
        clock.clone(),
        settings.phone_country_prefix.clone(),
    )
    .with_pending_timeout(settings.payment_timeout());
    let pollers = Arc::new(PollerRegistry::new(PaymentPoller::new(
        Arc::new(payments.clone()),
        Arc::new(orchestrator.clone()),
        settings.poller,
    )));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let reconciliation = ReconciliationJob::new(
        orchestrator.clone(),
        clock.clone(),
        settings.reconcile_interval,
        settings.reconcile_batch_size,
    );
    let reconciliation_shutdown = shutdown_rx.clone();
    let reconciliation_task = tokio::spawn(async move {
        reconciliation.run(reconciliation_shutdown).await;
    });

    let outbox_processor = OutboxProcessor::new(
        store.clone(),
        Arc::new(KafkaPublisher::new(producer, settings.booking_events_topic.clone())),
        settings.outbox_interval,
    );
    let outbox_task = tokio::spawn(async move {
        outbox_processor.run(shutdown_rx).await;
    });

    let app_state = AppState {
        orchestrator,
        promos: PromoCodeValidator::new(store.clone(), clock.clone()),
        payments,
        pollers: pollers.clone(),
    };
    let app = api::create_router(app_state);
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", settings.port)).await?;

    info!("Booking service ready to accept HTTP requests on port {}", settings.port);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Shutting down background tasks");
    pollers.cancel_all();
    let _ = shutdown_tx.send(true);
    let _ = tokio::join!(reconciliation_task, outbox_task);

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Could not listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}
