use cos_core::events::{self, EventPublisher};
use cos_core::jobs::{self, WorkerContext};
use cos_core::meta::{self, repos::Repo};
use cos_core::obs::Metrics;
use cos_core::storage::admin::AdminClient;
use cos_core::storage::store::ObjectStore;
use cos_core::util::config::Config;
use cos_core::util::shutdown::shutdown_signal;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load()?;
    init_tracing(&config.log_level);

    let pool = meta::db::connect(&config.postgres_dsn).await?;
    meta::migrate::run_migrations(&pool).await?;

    let conn = events::connect(&config.rabbit_url).await?;
    let ctx = WorkerContext {
        repo: Repo::new(pool),
        store: ObjectStore::new(&config.s3),
        admin: AdminClient::new(&config.admin)?,
        publisher: EventPublisher::new(&config.rabbit_url).await?,
        metrics: Metrics::new(),
    };
    jobs::start_consumers(ctx, &conn).await?;
    tracing::info!("worker consumers running");

    shutdown_signal().await;
    tracing::info!("shutdown signal received");
    Ok(())
}

fn init_tracing(log_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level.to_string()));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
