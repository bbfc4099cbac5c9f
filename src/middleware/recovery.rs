use std::any::Any;
use std::panic::AssertUnwindSafe;

use axum::{extract::Request, middleware::Next, response::IntoResponse, response::Response};
use futures_util::FutureExt;
use tracing::error;

use crate::error::GatewayError;
use crate::middleware::request_id::RequestId;

/// Catch panics from the handler chain and turn them into a 500 JSON
/// response instead of tearing down the connection.
pub async fn recovery(req: Request, next: Next) -> Response {
    let request_id = req
        .extensions()
        .get::<RequestId>()
        .map(|id| id.0.clone())
        .unwrap_or_default();

    match AssertUnwindSafe(next.run(req)).catch_unwind().await {
        Ok(response) => response,
        Err(panic) => {
            error!(
                request_id = %request_id,
                panic = %panic_message(panic.as_ref()),
                "handler panicked"
            );
            GatewayError::Internal("unexpected error while handling the request".to_string())
                .into_response()
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
