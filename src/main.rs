use fitlog_notify::auth::{self, TokenVerifier};
use fitlog_notify::config::Config;
use fitlog_notify::db::{self, message_listener, pg_store::PgMessageStore};
use fitlog_notify::http::{self, AppState};
use fitlog_notify::message_hub;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::load()?;

    // ── Database ──
    let pool = db::connect(&config.database_url, config.max_connections).await?;
    info!("connected to PostgreSQL");
    db::run_migrations(&pool).await?;
    info!("migrations applied");

    // ── Live feed ──
    let hub = message_hub::new_hub();
    let feed = message_listener::spawn(&pool, hub.clone()).await?;

    let secret = auth::resolve_jwt_secret(config.jwt_secret.as_deref());
    let state = AppState {
        store: Arc::new(PgMessageStore::new(pool, hub)),
        verifier: TokenVerifier::new(&secret, config.jwt_audience.as_deref()),
        tracker_config: config.tracker_config(),
    };

    // ── HTTP ──
    let listener = TcpListener::bind(&config.listen_addr).await?;
    info!(addr = %config.listen_addr, "notification service listening");
    axum::serve(listener, http::router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    feed.abort();
    info!("notification service stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::warn!(%error, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
}
