use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use pagecraft_core::assembly::init_global_template;
use pagecraft_db::DbPool;
use pagecraft_events::{EventBus, EventLogger};
use pagecraft_llm::{HttpModelClient, RetryingClient};
use pagecraft_pipeline::{
    FixedWindowLimiter, GenerationService, GenerationSettings, PgGenerationStore,
};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pagecraft_api::background;
use pagecraft_api::config::{GenerationConfig, ServerConfig};
use pagecraft_api::router::build_app_router;
use pagecraft_api::state::AppState;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    init_tracing();

    let config = ServerConfig::from_env();
    let gen_config = GenerationConfig::from_env();
    tracing::info!(
        host = %config.host,
        port = config.port,
        model = %gen_config.llm.model,
        brief_model = %gen_config.llm.brief_model,
        "Configuration loaded"
    );

    let pool = connect_database().await;

    // A missing or malformed template means no request could ever be served.
    let template = init_global_template(&gen_config.template_path)
        .expect("Failed to load system prompt template");
    tracing::info!(path = %gen_config.template_path.display(), "System prompt template loaded");

    let event_bus = Arc::new(EventBus::default());
    let background_cancel = CancellationToken::new();
    let logger_handle = tokio::spawn(EventLogger::run(
        event_bus.subscribe(),
        background_cancel.clone(),
    ));

    // Cancelled when shutdown begins; every live session stops resumable.
    let session_shutdown = CancellationToken::new();
    let generation = Arc::new(GenerationService::new(
        Arc::new(PgGenerationStore::new(pool.clone())),
        Arc::new(RetryingClient::new(
            HttpModelClient::new(gen_config.llm.clone()),
            gen_config.llm.retry_delay,
        )),
        Arc::clone(&event_bus),
        Arc::new(FixedWindowLimiter::per_minute(gen_config.rate_limit_per_minute)),
        template.clone(),
        GenerationSettings {
            model: gen_config.llm.model.clone(),
            brief_model: gen_config.llm.brief_model.clone(),
            max_tokens: gen_config.llm.max_tokens,
        },
        session_shutdown.clone(),
    ));

    let recovered = generation
        .recover_orphans()
        .await
        .expect("Failed to recover orphaned generation sessions");
    if recovered > 0 {
        tracing::warn!(recovered, "Sessions from a previous process are now resumable");
    }

    let expiry_handle = tokio::spawn(background::interrupt_expiry::run(
        Arc::clone(&generation),
        gen_config.interrupt_timeout,
        gen_config.sweep_interval,
        background_cancel.clone(),
    ));

    let state = AppState {
        pool,
        config: Arc::new(config.clone()),
        generation: Arc::clone(&generation),
        event_bus,
    };
    let app = build_app_router(state, &config);

    let addr = SocketAddr::new(config.host.parse().expect("Invalid HOST address"), config.port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("Failed to bind to address");
    tracing::info!(%addr, "Listening");

    // SSE responses only finish once their session stops, so sessions are
    // told to stop as soon as the signal arrives rather than after the
    // server has drained.
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            session_shutdown.cancel();
        })
        .await
        .expect("Server error");

    let drain = Duration::from_secs(config.shutdown_timeout_secs);
    match tokio::time::timeout(drain, generation.shutdown()).await {
        Ok(()) => tracing::info!("Generation sessions stopped"),
        Err(_) => tracing::warn!(
            live = generation.hub().live_count(),
            "Generation sessions still running at shutdown timeout"
        ),
    }

    background_cancel.cancel();
    let _ = tokio::time::timeout(Duration::from_secs(5), expiry_handle).await;
    let _ = tokio::time::timeout(Duration::from_secs(5), logger_handle).await;
    tracing::info!("Shutdown complete");
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "pagecraft_api=debug,pagecraft_pipeline=debug,pagecraft_events=info,\
                 tower_http=debug"
                    .into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Connect, verify and migrate. Any failure aborts startup.
async fn connect_database() -> DbPool {
    let database_url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");

    let pool = pagecraft_db::create_pool(&database_url)
        .await
        .expect("Failed to connect to database");
    pagecraft_db::health_check(&pool)
        .await
        .expect("Database health check failed");
    pagecraft_db::run_migrations(&pool)
        .await
        .expect("Failed to run database migrations");
    tracing::info!("Database ready");
    pool
}

/// Resolves on SIGINT, or SIGTERM on Unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl-C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("SIGINT received, shutting down"),
        () = terminate => tracing::info!("SIGTERM received, shutting down"),
    }
}
