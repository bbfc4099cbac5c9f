use std::net::SocketAddr;
use std::time::Instant;

use axum::{
    extract::{ConnectInfo, Request},
    middleware::Next,
    response::Response,
};
use tracing::info;

use crate::middleware::request_id::RequestId;

/// Structured per-request logging. Health probes are not logged.
pub async fn logger(
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    req: Request,
    next: Next,
) -> Response {
    if req.uri().path() == "/health" {
        return next.run(req).await;
    }

    let start = Instant::now();
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let query = req.uri().query().unwrap_or_default().to_string();
    let user_agent = req
        .headers()
        .get("user-agent")
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string();
    let request_id = req
        .extensions()
        .get::<RequestId>()
        .map(|id| id.0.clone())
        .unwrap_or_default();

    let response = next.run(req).await;

    info!(
        request_id = %request_id,
        client_ip = %addr.ip(),
        method = %method,
        path = %path,
        query = %query,
        status = response.status().as_u16(),
        latency_ms = start.elapsed().as_millis() as u64,
        user_agent = %user_agent,
        "request completed"
    );

    response
}
