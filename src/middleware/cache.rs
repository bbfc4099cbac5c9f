use std::time::Duration;

use axum::{
    body::Body,
    extract::{Request, State},
    http::{header, HeaderValue, Method},
    middleware::Next,
    response::{IntoResponse, Response},
};
use tracing::debug;

use crate::error::GatewayError;
use crate::middleware::full_uri;
use crate::proxy::cache::CachedResponse;
use crate::routes::RouteState;

/// Serve GET requests from the cache when possible, otherwise capture the
/// downstream response and store it. Only 2xx responses without
/// `no-store`/`private` in `Cache-Control` are stored; `max-age` overrides
/// the default TTL. Hits are served verbatim plus `X-Cache: HIT`.
pub async fn cache_layer(State(state): State<RouteState>, req: Request, next: Next) -> Response {
    if req.method() != Method::GET {
        return next.run(req).await;
    }

    let uri = full_uri(&req);
    let key = format!("{}:{}:{}", req.method(), uri.path(), uri.query().unwrap_or_default());
    let path = uri.path().to_string();

    if let Some(hit) = state.gateway.cache.get(&key).await {
        debug!(key = %key, "cache hit");
        state.gateway.metrics.record_cache_hit(&path);

        let mut response = Response::new(Body::from(hit.body));
        *response.status_mut() = hit.status;
        *response.headers_mut() = hit.headers;
        response
            .headers_mut()
            .insert("x-cache", HeaderValue::from_static("HIT"));
        return response;
    }

    let response = next.run(req).await;
    let (parts, body) = response.into_parts();

    let bytes = match axum::body::to_bytes(body, usize::MAX).await {
        Ok(bytes) => bytes,
        Err(e) => return GatewayError::Upstream(e.to_string()).into_response(),
    };

    if parts.status.is_success() && cacheable(&parts.headers) {
        let ttl = max_age(&parts.headers)
            .map(Duration::from_secs)
            .unwrap_or(Duration::ZERO);
        state
            .gateway
            .cache
            .set(
                key,
                CachedResponse {
                    status: parts.status,
                    headers: parts.headers.clone(),
                    body: bytes.clone(),
                },
                ttl,
            )
            .await;
    }

    Response::from_parts(parts, Body::from(bytes))
}

fn cacheable(headers: &axum::http::HeaderMap) -> bool {
    let cache_control = headers
        .get(header::CACHE_CONTROL)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    !cache_control.contains("no-store") && !cache_control.contains("private")
}

/// Extract the `max-age` directive, if any.
fn max_age(headers: &axum::http::HeaderMap) -> Option<u64> {
    let cache_control = headers.get(header::CACHE_CONTROL)?.to_str().ok()?;
    for directive in cache_control.split(',') {
        if let Some(value) = directive.trim().strip_prefix("max-age=") {
            if let Ok(seconds) = value.parse() {
                return Some(seconds);
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderMap;

    fn headers_with(value: &'static str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::CACHE_CONTROL, HeaderValue::from_static(value));
        headers
    }

    #[test]
    fn extracts_max_age_directive() {
        assert_eq!(max_age(&headers_with("max-age=120")), Some(120));
        assert_eq!(max_age(&headers_with("public, max-age=60")), Some(60));
        assert_eq!(max_age(&headers_with("public")), None);
        assert_eq!(max_age(&HeaderMap::new()), None);
    }

    #[test]
    fn no_store_and_private_are_not_cacheable() {
        assert!(!cacheable(&headers_with("no-store")));
        assert!(!cacheable(&headers_with("private, max-age=60")));
        assert!(cacheable(&headers_with("public, max-age=60")));
        assert!(cacheable(&HeaderMap::new()));
    }
}
