use axum::{
    extract::{Request, State},
    http::{header, HeaderMap, HeaderValue},
    middleware::Next,
    response::{IntoResponse, Response},
};
use tracing::debug;

use crate::error::GatewayError;
use crate::routes::RouteState;

/// Verified identity attached to the request after authentication.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub subject: String,
    pub roles: Vec<String>,
}

const TOKEN_COOKIE: &str = "access_token";

/// Promote the `access_token` cookie to an `Authorization: Bearer` header
/// when the header is absent, so browser clients authenticate like API
/// clients.
pub async fn cookie_to_header(mut req: Request, next: Next) -> Response {
    if req.headers().get(header::AUTHORIZATION).is_none() {
        if let Some(token) = cookie_value(req.headers(), TOKEN_COOKIE) {
            if let Ok(value) = HeaderValue::from_str(&format!("Bearer {}", token)) {
                req.headers_mut().insert(header::AUTHORIZATION, value);
            }
        }
    }
    next.run(req).await
}

/// Require a valid bearer token; on success the claims are attached to the
/// request and the header is forwarded upstream unchanged.
pub async fn require_auth(
    State(state): State<RouteState>,
    mut req: Request,
    next: Next,
) -> Response {
    let header_value = match req.headers().get(header::AUTHORIZATION) {
        Some(value) => value,
        None => return GatewayError::AuthMissing.into_response(),
    };

    let token = match header_value.to_str().ok().and_then(|v| v.strip_prefix("Bearer ")) {
        Some(token) if !token.is_empty() => token,
        _ => return GatewayError::AuthMalformed.into_response(),
    };

    match state.gateway.authenticator.verify(token) {
        Ok(claims) => {
            debug!(subject = %claims.sub, "authenticated request");
            req.extensions_mut().insert(AuthContext {
                subject: claims.sub,
                roles: claims.roles,
            });
            next.run(req).await
        }
        Err(err) => GatewayError::from(err).into_response(),
    }
}

fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    for value in headers.get_all(header::COOKIE) {
        let Ok(raw) = value.to_str() else { continue };
        for pair in raw.split(';') {
            let mut parts = pair.trim().splitn(2, '=');
            if parts.next() == Some(name) {
                let token = parts.next().unwrap_or_default();
                if !token.is_empty() {
                    return Some(token.to_string());
                }
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_cookie_among_many() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::COOKIE,
            HeaderValue::from_static("theme=dark; access_token=tok123; lang=en"),
        );
        assert_eq!(cookie_value(&headers, "access_token"), Some("tok123".to_string()));
    }

    #[test]
    fn missing_or_empty_cookie_yields_none() {
        let mut headers = HeaderMap::new();
        headers.insert(header::COOKIE, HeaderValue::from_static("theme=dark"));
        assert_eq!(cookie_value(&headers, "access_token"), None);

        headers.insert(header::COOKIE, HeaderValue::from_static("access_token="));
        assert_eq!(cookie_value(&headers, "access_token"), None);
    }
}
