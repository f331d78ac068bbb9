use cos_core::util::config::Config;
use cos_core::util::shutdown::shutdown_signal;
use cos_core::{api, jobs, meta, obs};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load()?;
    init_tracing(&config.log_level);

    let pool = meta::db::connect(&config.postgres_dsn).await?;
    meta::migrate::run_migrations(&pool).await?;

    let metrics = obs::Metrics::new();
    let state = api::AppState::new(config.clone(), pool, metrics).await?;

    jobs::start_session_sweeper(config.clone(), state.repo.clone(), state.store.clone());

    let router = api::router(state);
    let listener = tokio::net::TcpListener::bind(&config.listen).await?;
    tracing::info!(listen = %config.listen, "api server listening");
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    tracing::info!("api server stopped");
    Ok(())
}

fn init_tracing(log_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level.to_string()));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
