use peerverify::config::Config;
use peerverify::db;
use peerverify::dispatch::{LogNotifier, Notifier, WebhookNotifier};
use peerverify::engine::Engine;
use peerverify::routes;
use peerverify::state::AppState;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "peerverify=info,tower_http=info".into()),
        )
        .init();

    let config = Arc::new(Config::from_env()?);
    if config.cron_secret.is_none() {
        tracing::warn!("CRON_SECRET is not set; every trigger will answer config_missing");
    }

    let pool = db::create_pool(&config.database_url, config.db_max_connections).await?;
    db::run_migrations(pool.as_ref()).await?;

    let notifier: Arc<dyn Notifier> = match &config.notify_webhook_url {
        Some(url) => Arc::new(WebhookNotifier::new(url.clone(), config.notify_timeout)?),
        None => {
            tracing::warn!("NOTIFY_WEBHOOK_URL is not set; notifications will only be logged");
            Arc::new(LogNotifier)
        }
    };

    let engine = Engine::new(
        Arc::new(db::PgStore::new(pool.clone())),
        Arc::new(db::PgPolicySource::new(pool.clone())),
        notifier,
        Arc::new(db::PgAudit::new(pool)),
    )
    .with_dispatch_timeout(config.notify_timeout);

    let state = Arc::new(AppState {
        engine: Arc::new(engine),
        config: config.clone(),
    });

    let app = routes::router(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let addr = format!("{}:{}", config.host, config.port);
    tracing::info!("Peer verification engine listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
