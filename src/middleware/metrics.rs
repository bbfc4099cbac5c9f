use std::time::Instant;

use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};

use crate::server::GatewayState;

/// Record request count, latency, and the in-flight gauge.
pub async fn track_requests(
    State(state): State<GatewayState>,
    req: Request,
    next: Next,
) -> Response {
    let start = Instant::now();
    let method = req.method().to_string();
    let path = req.uri().path().to_string();

    state.metrics.inc_in_flight();
    let response = next.run(req).await;
    state.metrics.dec_in_flight();

    state
        .metrics
        .record_request(&method, &path, response.status().as_u16(), start.elapsed());

    response
}
