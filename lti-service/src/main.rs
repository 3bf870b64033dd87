use lti_service::config::LtiConfig;
use lti_service::models::Team;
use lti_service::services::{
    metrics::init_metrics, Database, Directory, MemoryDirectory, MemoryNonceStore, NonceStore,
    RedisNonceStore, UserStore,
};
use lti_service::{build_router, spawn_sweeper, AppState};
use service_core::observability::init_tracing;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;

const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}

#[tokio::main]
async fn main() -> std::io::Result<()> {
    let config = LtiConfig::from_env().map_err(|e| {
        eprintln!("Failed to load configuration: {}", e);
        std::io::Error::other(format!("Configuration error: {}", e))
    })?;

    init_tracing(
        &config.service_name,
        &config.log_level,
        config.otlp_endpoint.as_deref(),
    )
    .map_err(|e| std::io::Error::other(format!("Tracing initialization error: {}", e)))?;

    init_metrics().map_err(|e| {
        tracing::error!("Failed to initialize metrics: {}", e);
        std::io::Error::other(format!("Metrics initialization error: {}", e))
    })?;

    tracing::info!(
        service = %config.service_name,
        version = %config.service_version,
        lti_enabled = config.lti.enabled,
        "Starting LTI service"
    );

    let (directory, users): (Arc<dyn Directory>, Arc<dyn UserStore>) = match &config.database {
        Some(db_config) => {
            let db = Database::new(
                &db_config.url,
                db_config.max_connections,
                db_config.min_connections,
            )
            .await
            .map_err(|e| {
                tracing::error!("Failed to connect to PostgreSQL: {}", e);
                std::io::Error::other(format!("Database connection error: {}", e))
            })?;

            db.run_migrations().await.map_err(|e| {
                tracing::error!("Failed to run migrations: {}", e);
                std::io::Error::other(format!("Database migration error: {}", e))
            })?;

            let db = Arc::new(db);
            let directory: Arc<dyn Directory> = db.clone();
            let users: Arc<dyn UserStore> = db;
            (directory, users)
        }
        None => {
            tracing::warn!("DATABASE_URL not set, using in-memory directory");
            let memory = Arc::new(MemoryDirectory::new());
            // Mapped course teams exist up front so local launches can onboard.
            for consumer in &config.lti.consumers {
                for slug in consumer.fields.team.teams.values() {
                    memory.insert_team(Team::new(slug.clone(), slug.clone()));
                }
            }
            let directory: Arc<dyn Directory> = memory.clone();
            let users: Arc<dyn UserStore> = memory;
            (directory, users)
        }
    };

    let (nonces, memory_nonces): (Arc<dyn NonceStore>, Option<Arc<MemoryNonceStore>>) =
        match &config.redis {
            Some(redis) => {
                let store = RedisNonceStore::new(&redis.url).await.map_err(|e| {
                    tracing::error!("Failed to connect to Redis: {}", e);
                    std::io::Error::other(format!("Redis connection error: {}", e))
                })?;
                (Arc::new(store), None)
            }
            None => {
                let memory = Arc::new(MemoryNonceStore::new(config.lti.nonce_cache_capacity));
                (memory.clone(), Some(memory))
            }
        };

    let addr = config.common.socket_addr();
    let state = AppState::new(config, directory, users, nonces).map_err(|e| {
        tracing::error!("Failed to build application state: {}", e);
        std::io::Error::other(format!("Startup error: {}", e))
    })?;

    spawn_sweeper(memory_nonces, state.launch_rate_limiter.clone(), SWEEP_INTERVAL);
    let app = build_router(state);

    let listener = TcpListener::bind(addr).await.map_err(|e| {
        tracing::error!("Failed to bind to {}: {}", addr, e);
        e
    })?;
    tracing::info!("LTI service listening on {}", addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    Ok(())
}
