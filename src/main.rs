use std::sync::Arc;
use std::time::Duration;

use doral_queue_server::{
    config::Config,
    db,
    models::AppState,
    queue::{
        LogNotifier, NotificationService, PgAppointmentStore, PgAuditLog, QueueService, QueueSettings, SystemClock,
        WebhookNotifier,
    },
    routes,
};

use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use axum::http::header;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let cfg = Config::from_env()?;
    let pool = db::connect_pg(&cfg.database_url, cfg.db_max_connections).await?;

    let notifier: Arc<dyn NotificationService> = match &cfg.notify_webhook_url {
        Some(url) => {
            tracing::info!("queue notifications go to webhook");
            Arc::new(WebhookNotifier::new(url.clone())?)
        }
        None => {
            tracing::info!("NOTIFY_WEBHOOK_URL not set; queue notifications are logged only");
            Arc::new(LogNotifier)
        }
    };

    let queue = QueueService::new(
        Arc::new(PgAppointmentStore::new(pool.clone())),
        notifier,
        Arc::new(PgAuditLog::new(pool.clone())),
        Arc::new(SystemClock),
        QueueSettings {
            notify_max_attempts: cfg.notify_max_attempts,
            notify_retry_delay: Duration::from_millis(cfg.notify_retry_delay_ms),
            history_max_days: cfg.history_max_days,
        },
    );

    let state = AppState {
        db: pool,
        queue: Arc::new(queue),
        queue_slot_minutes: cfg.queue_slot_minutes,
    };

    // Front-desk screens are served from a different origin.
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION, header::ACCEPT]);

    let app = routes::router(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    tracing::info!("Listening on http://{}", cfg.bind_addr);
    let listener = tokio::net::TcpListener::bind(&cfg.bind_addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
