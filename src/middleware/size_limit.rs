use axum::{
    extract::{Request, State},
    http::header,
    middleware::Next,
    response::{IntoResponse, Response},
};
use tracing::warn;

use crate::error::GatewayError;
use crate::server::GatewayState;

/// Reject requests whose declared body size exceeds `MAX_CONTENT_SIZE`.
/// Bodies without a `Content-Length` are capped while being read by the
/// proxy handler.
pub async fn size_limit(
    State(state): State<GatewayState>,
    req: Request,
    next: Next,
) -> Response {
    let declared = req
        .headers()
        .get(header::CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<u64>().ok());

    if let Some(length) = declared {
        if length > state.config.max_content_size as u64 {
            warn!(
                declared = length,
                limit = state.config.max_content_size,
                "request body exceeds size limit"
            );
            return GatewayError::PayloadTooLarge.into_response();
        }
    }

    next.run(req).await
}
