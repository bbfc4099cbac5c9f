use std::net::SocketAddr;
use std::time::{SystemTime, UNIX_EPOCH};

use axum::{
    extract::{ConnectInfo, Request, State},
    http::HeaderValue,
    middleware::Next,
    response::{IntoResponse, Response},
};
use tracing::warn;

use crate::error::GatewayError;
use crate::server::GatewayState;

/// Admit or reject the request against the keyed rate limiter. Rejections
/// carry `Retry-After` and the `X-RateLimit-*` headers.
pub async fn rate_limit(
    State(state): State<GatewayState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    req: Request,
    next: Next,
) -> Response {
    let path = req.uri().path().to_string();
    let key = format!("{}:{}", addr.ip(), path);

    if state.limiter.allow(&key) {
        return next.run(req).await;
    }

    warn!(client_ip = %addr.ip(), path = %path, "rate limit exceeded");
    state.metrics.record_rate_limited(&path);

    let retry_after = state.limiter.retry_after(&key).as_secs().max(1);
    let (remaining, _) = state.limiter.peek(&key);
    let reset = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|now| now.as_secs() + retry_after)
        .unwrap_or(retry_after);

    let mut response = GatewayError::RateLimited { retry_after }.into_response();
    let headers = response.headers_mut();
    insert_number(headers, "x-ratelimit-limit", state.config.rate_limit_max_requests as u64);
    insert_number(headers, "x-ratelimit-remaining", remaining as u64);
    insert_number(headers, "x-ratelimit-reset", reset);
    response
}

fn insert_number(headers: &mut axum::http::HeaderMap, name: &'static str, value: u64) {
    if let Ok(value) = HeaderValue::from_str(&value.to_string()) {
        headers.insert(name, value);
    }
}
