use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Application-wide error taxonomy.
///
/// Every request-scoped failure is mapped to a well-formed JSON response;
/// configuration errors are fatal at startup.
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("authentication token is required")]
    AuthMissing,

    #[error("invalid authentication format")]
    AuthMalformed,

    #[error("authentication failed: {0}")]
    AuthInvalid(String),

    #[error("token has expired")]
    AuthExpired,

    #[error("insufficient permissions")]
    AuthForbidden,

    #[error("rate limit exceeded")]
    RateLimited { retry_after: u64 },

    #[error("request entity too large")]
    PayloadTooLarge,

    #[error("no available backend servers")]
    NoBackend,

    #[error("circuit breaker is open")]
    CircuitOpen,

    #[error("too many requests in half-open state")]
    TooManyRequests,

    #[error("upstream connection failed: {0}")]
    UpstreamDial(String),

    #[error("upstream request failed: {0}")]
    Upstream(String),

    #[error("request processing timed out")]
    Timeout,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("internal server error: {0}")]
    Internal(String),
}

impl GatewayError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::AuthMissing
            | GatewayError::AuthMalformed
            | GatewayError::AuthInvalid(_)
            | GatewayError::AuthExpired => StatusCode::UNAUTHORIZED,
            GatewayError::AuthForbidden => StatusCode::FORBIDDEN,
            GatewayError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            GatewayError::NoBackend
            | GatewayError::CircuitOpen
            | GatewayError::TooManyRequests => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::UpstreamDial(_) | GatewayError::Upstream(_) => StatusCode::BAD_GATEWAY,
            GatewayError::Timeout => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::Config(_) | GatewayError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        match self {
            GatewayError::RateLimited { retry_after } => {
                let mut response = (
                    StatusCode::TOO_MANY_REQUESTS,
                    Json(json!({ "error": "rate limit exceeded" })),
                )
                    .into_response();
                if let Ok(value) = retry_after.to_string().parse() {
                    response.headers_mut().insert("Retry-After", value);
                }
                response
            }
            other => {
                let status = other.status_code();
                let body = Json(json!({ "error": other.to_string() }));
                (status, body).into_response()
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping_follows_taxonomy() {
        assert_eq!(GatewayError::AuthMissing.status_code(), StatusCode::UNAUTHORIZED);
        assert_eq!(GatewayError::AuthForbidden.status_code(), StatusCode::FORBIDDEN);
        assert_eq!(
            GatewayError::RateLimited { retry_after: 1 }.status_code(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(GatewayError::NoBackend.status_code(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(GatewayError::CircuitOpen.status_code(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            GatewayError::UpstreamDial("refused".into()).status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(GatewayError::Timeout.status_code(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(GatewayError::PayloadTooLarge.status_code(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[test]
    fn rate_limited_response_carries_retry_after() {
        let response = GatewayError::RateLimited { retry_after: 7 }.into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers().get("Retry-After").unwrap(), "7");
    }
}
