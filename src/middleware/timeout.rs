use std::time::Duration;

use axum::{
    extract::{Request, State},
    http::header,
    middleware::Next,
    response::{IntoResponse, Response},
};
use tracing::warn;

use crate::error::GatewayError;
use crate::routes::RouteState;
use crate::server::GatewayState;

/// Per-route deadline. Cancelling the handler future also cancels the
/// in-flight upstream call, so sockets are released promptly.
pub async fn route_timeout(State(state): State<RouteState>, req: Request, next: Next) -> Response {
    let deadline = Duration::from_secs(state.route.timeout);
    match tokio::time::timeout(deadline, next.run(req)).await {
        Ok(response) => response,
        Err(_) => {
            warn!(path = %state.route.path, timeout_s = state.route.timeout, "route deadline exceeded");
            GatewayError::Timeout.into_response()
        }
    }
}

/// Server-wide write deadline. Upgrade requests are exempt: a relayed
/// WebSocket is long-lived by design.
pub async fn write_deadline(
    State(state): State<GatewayState>,
    req: Request,
    next: Next,
) -> Response {
    if req.headers().contains_key(header::UPGRADE) {
        return next.run(req).await;
    }

    match tokio::time::timeout(state.config.write_timeout, next.run(req)).await {
        Ok(response) => response,
        Err(_) => GatewayError::Timeout.into_response(),
    }
}
