pub mod config;
pub mod handlers;
pub mod models;
pub mod services;

use serde_json::json;
use service_core::axum::{
    extract::State,
    http::StatusCode,
    middleware::{from_fn, from_fn_with_state},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use service_core::error::AppError;
use service_core::middleware::{
    metrics::metrics_middleware,
    rate_limit::{
        create_ip_rate_limiter, ip_rate_limit_middleware, prune_ip_rate_limiter, IpRateLimit,
        IpRateLimiter,
    },
    security_headers::security_headers_middleware,
    tracing::{request_id_middleware, REQUEST_ID_HEADER},
};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;

use crate::config::LtiConfig;
use crate::services::{
    ConsumerRegistry, Directory, LaunchAuthenticator, MemoryNonceStore, NonceStore,
    OnboardingCoordinator, UserResolver, UserStore,
};

#[derive(Clone)]
pub struct AppState {
    pub config: LtiConfig,
    pub authenticator: LaunchAuthenticator,
    pub resolver: UserResolver,
    pub onboarding: OnboardingCoordinator,
    pub directory: Arc<dyn Directory>,
    pub nonces: Arc<dyn NonceStore>,
    pub launch_rate_limiter: IpRateLimiter,
}

impl AppState {
    /// Wire the launch pipeline from configuration and the chosen stores.
    pub fn new(
        config: LtiConfig,
        directory: Arc<dyn Directory>,
        users: Arc<dyn UserStore>,
        nonces: Arc<dyn NonceStore>,
    ) -> Result<Self, AppError> {
        let registry = ConsumerRegistry::from_consumers(config.lti.consumers.clone())
            .map_err(|e| AppError::ConfigError(anyhow::anyhow!(e)))?;
        tracing::info!(consumers = registry.len(), "LTI consumer registry loaded");

        let authenticator = LaunchAuthenticator::new(
            Arc::new(registry),
            nonces.clone(),
            config.lti.freshness_window_seconds,
        );
        let resolver = UserResolver::new(users, config.lti.auto_provision_users);
        let onboarding = OnboardingCoordinator::new(directory.clone());
        let launch_rate_limiter = create_ip_rate_limiter(
            config.rate_limit.launch_attempts,
            config.rate_limit.launch_window_seconds,
        );

        Ok(Self {
            config,
            authenticator,
            resolver,
            onboarding,
            directory,
            nonces,
            launch_rate_limiter,
        })
    }
}

pub fn build_router(state: AppState) -> Router {
    let launch_route = Router::new()
        .route("/login/lti", post(handlers::login_with_lti))
        .layer(from_fn_with_state(
            IpRateLimit::new(
                state.launch_rate_limiter.clone(),
                state.config.rate_limit.trust_forwarded_for,
            ),
            ip_rate_limit_middleware,
        ));

    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(handlers::metrics::metrics))
        .merge(launch_route)
        .with_state(state)
        .layer(from_fn(metrics_middleware))
        .layer(TraceLayer::new_for_http().make_span_with(
            |request: &service_core::axum::http::Request<_>| {
                let request_id = request
                    .headers()
                    .get(REQUEST_ID_HEADER)
                    .and_then(|value| value.to_str().ok())
                    .unwrap_or("-");

                tracing::info_span!(
                    "http_request",
                    request_id = %request_id,
                    method = %request.method(),
                    path = %request.uri().path(),
                )
            },
        ))
        .layer(from_fn(request_id_middleware))
        .layer(from_fn(security_headers_middleware))
}

/// One sweep: purge expired in-process nonces and forget limiter keys whose
/// allowance has replenished.
pub fn sweep(nonces: Option<&MemoryNonceStore>, limiter: &IpRateLimiter, now: i64) {
    if let Some(store) = nonces {
        let purged = store.purge_expired(now);
        if purged > 0 {
            tracing::debug!(purged, remaining = store.len(), "Nonce sweep completed");
        }
    }
    let tracked = prune_ip_rate_limiter(limiter);
    tracing::debug!(tracked, "Rate limiter pruned");
}

/// Run [`sweep`] on a fixed interval for the life of the process.
pub fn spawn_sweeper(
    nonces: Option<Arc<MemoryNonceStore>>,
    limiter: IpRateLimiter,
    every: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            sweep(nonces.as_deref(), &limiter, chrono::Utc::now().timestamp());
        }
    })
}

pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let directory = state.directory.health_check().await;
    let nonces = state.nonces.health_check().await;

    match (directory, nonces) {
        (Ok(()), Ok(())) => (
            StatusCode::OK,
            Json(json!({
                "status": "ok",
                "service": state.config.service_name,
                "version": state.config.service_version,
                "lti_enabled": state.config.lti.enabled,
            })),
        ),
        (directory, nonces) => {
            if let Err(e) = &directory {
                tracing::error!(error = %e, "Directory health check failed");
            }
            if let Err(e) = &nonces {
                tracing::error!(error = %e, "Nonce store health check failed");
            }
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({
                    "status": "unhealthy",
                    "service": state.config.service_name,
                    "directory": if directory.is_ok() { "ok" } else { "unavailable" },
                    "nonce_store": if nonces.is_ok() { "ok" } else { "unavailable" },
                })),
            )
        }
    }
}
