use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::State,
    http::StatusCode,
    middleware,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde_json::json;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tracing::{error, info, warn};

use crate::auth::JwtAuthenticator;
use crate::config::{Config, Route};
use crate::error::{GatewayError, Result};
use crate::middleware::{
    cors::cors_layer,
    logger::logger,
    metrics::track_requests,
    rate_limit::rate_limit,
    recovery::recovery,
    request_id::request_id,
    security::security_headers,
    size_limit::size_limit,
    timeout::write_deadline,
};
use crate::observability::MetricsCollector;
use crate::proxy::{
    cache::ResponseCache,
    circuit_breaker::CircuitBreaker,
    engine::ProxyEngine,
    load_balancer::{LoadBalancer, RoundRobinBalancer, SingleTargetBalancer},
};
use crate::ratelimit::{RateLimiter, TokenBucket};

/// How long in-flight requests get to drain after a shutdown signal.
const DRAIN_DEADLINE: Duration = Duration::from_secs(10);

/// Shared gateway components, passed into handlers as dependencies rather
/// than resolved through process-wide state.
#[derive(Clone)]
pub struct GatewayState {
    pub config: Arc<Config>,
    pub balancer: Arc<dyn LoadBalancer>,
    pub breaker: Arc<CircuitBreaker>,
    pub cache: Arc<ResponseCache>,
    pub limiter: Arc<dyn RateLimiter>,
    pub authenticator: Arc<JwtAuthenticator>,
    pub engine: Arc<ProxyEngine>,
    pub metrics: Arc<MetricsCollector>,
}

/// Construct every shared component from the configuration. With several
/// backends configured the balancer is round-robin; with one it is the
/// single-target balancer.
pub fn build_state(config: Config) -> Result<GatewayState> {
    let balancer: Arc<dyn LoadBalancer> = if config.backends.len() > 1 {
        Arc::new(RoundRobinBalancer::new(&config.backends))
    } else {
        Arc::new(SingleTargetBalancer::new(
            config.backends.first().unwrap_or(&config.default_backend),
        ))
    };

    let limiter: Arc<dyn RateLimiter> = Arc::new(TokenBucket::new(
        config.rate_limit_window,
        config.rate_limit_max_requests,
    ));

    let authenticator = Arc::new(JwtAuthenticator::new(
        &config.jwt_secret,
        &config.jwt_issuer,
        config.jwt_expiration,
    ));

    let engine = Arc::new(ProxyEngine::new(&config)?);
    let metrics = Arc::new(MetricsCollector::new(config.enable_metrics));
    let breaker = Arc::new(CircuitBreaker::new(config.breaker.clone()));
    let cache = Arc::new(ResponseCache::new(config.cache_ttl));

    Ok(GatewayState {
        config: Arc::new(config),
        balancer,
        breaker,
        cache,
        limiter,
        authenticator,
        engine,
        metrics,
    })
}

/// Assemble the full application: the route table, the direct endpoints
/// (`/health`, `/metrics`), and the global middleware stack.
pub fn build_app(state: GatewayState, routes: &[Route]) -> Result<Router> {
    let mut router = crate::routes::build_router(&state, routes)?
        .route("/health", get(health_handler));

    if state.config.enable_metrics {
        router = router.route("/metrics", get(metrics_handler).with_state(state.clone()));
    }

    // Global middleware, outermost first: request id, recovery, logger,
    // security headers, CORS, rate limit, size limit, metrics, write
    // deadline.
    let router = router.layer(
        ServiceBuilder::new()
            .layer(middleware::from_fn(request_id))
            .layer(middleware::from_fn(recovery))
            .layer(middleware::from_fn(logger))
            .layer(middleware::from_fn(security_headers))
            .layer(cors_layer(&state.config))
            .layer(middleware::from_fn_with_state(state.clone(), rate_limit))
            .layer(middleware::from_fn_with_state(state.clone(), size_limit))
            .layer(middleware::from_fn_with_state(state.clone(), track_requests))
            .layer(middleware::from_fn_with_state(state.clone(), write_deadline)),
    );

    Ok(router)
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "time": chrono::Utc::now().to_rfc3339(),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn metrics_handler(State(state): State<GatewayState>) -> impl IntoResponse {
    match state.metrics.render() {
        Some(body) => body.into_response(),
        None => (StatusCode::NOT_FOUND, "metrics collection is disabled").into_response(),
    }
}

/// The gateway server: binds the listener, serves the assembled router,
/// and tears down background workers on shutdown.
pub struct GatewayServer {
    state: GatewayState,
    routes: Vec<Route>,
}

impl GatewayServer {
    pub fn new(state: GatewayState, routes: Vec<Route>) -> Self {
        Self { state, routes }
    }

    pub async fn run(self) -> Result<()> {
        let app = build_app(self.state.clone(), &self.routes)?;
        let addr = SocketAddr::from(([0, 0, 0, 0], self.state.config.port));

        let listener = TcpListener::bind(addr).await.map_err(|e| {
            GatewayError::Config(format!("failed to bind to {}: {}", addr, e))
        })?;
        info!(address = %addr, "gateway listening");

        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
        let server = tokio::spawn(async move {
            axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
        });

        shutdown_signal().await;
        info!("shutdown signal received, draining in-flight requests");
        let _ = shutdown_tx.send(());

        match tokio::time::timeout(DRAIN_DEADLINE, server).await {
            Ok(Ok(Ok(()))) => info!("server drained cleanly"),
            Ok(Ok(Err(e))) => error!(error = %e, "server exited with error"),
            Ok(Err(e)) => error!(error = %e, "server task failed"),
            Err(_) => warn!("drain deadline exceeded, aborting remaining requests"),
        }

        // Stop background workers after the listener is gone.
        self.state.limiter.stop();
        self.state.cache.close();

        info!("gateway shut down");
        Ok(())
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to install SIGINT handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => error!(error = %e, "failed to install SIGTERM handler"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
