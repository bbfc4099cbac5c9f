pub mod cache;
pub mod circuit_breaker;
pub mod engine;
pub mod load_balancer;
pub mod websocket;

use std::fmt;
use std::sync::Arc;

use axum::{
    body::Body,
    http::{header::HeaderName, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};

use self::load_balancer::LoadBalancer;

/// Headers that apply to a single transport hop and are stripped before
/// forwarding in either direction.
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "upgrade",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
];

pub(crate) fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP_HEADERS.contains(&name.as_str())
}

/// A response received from an upstream backend, with hop-by-hop headers
/// already removed. The body may still be streaming from the backend.
pub struct ForwardedResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Body,
}

impl fmt::Debug for ForwardedResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ForwardedResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

impl IntoResponse for ForwardedResponse {
    fn into_response(self) -> Response {
        let mut response = Response::new(self.body);
        *response.status_mut() = self.status;
        *response.headers_mut() = self.headers;
        response
    }
}

/// RAII guard for a balancer connection slot: releases exactly once when
/// dropped, including on cancellation or panic.
pub struct ConnGuard {
    balancer: Arc<dyn LoadBalancer>,
    url: String,
}

impl ConnGuard {
    pub fn new(balancer: Arc<dyn LoadBalancer>, url: String) -> Self {
        Self { balancer, url }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl Drop for ConnGuard {
    fn drop(&mut self) {
        self.balancer.release_conn(&self.url);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::load_balancer::RoundRobinBalancer;

    #[test]
    fn hop_by_hop_set_matches_rfc_list() {
        for name in ["connection", "upgrade", "te", "transfer-encoding"] {
            assert!(is_hop_by_hop(&HeaderName::from_static(name)));
        }
        assert!(!is_hop_by_hop(&HeaderName::from_static("content-type")));
        assert!(!is_hop_by_hop(&HeaderName::from_static("x-request-id")));
    }

    #[test]
    fn conn_guard_releases_exactly_once() {
        let balancer: Arc<dyn LoadBalancer> =
            Arc::new(RoundRobinBalancer::new(&["http://a".to_string()]));
        let url = balancer.next_target().unwrap();
        assert_eq!(balancer.targets()[0].active_conns, 1);

        drop(ConnGuard::new(balancer.clone(), url));
        assert_eq!(balancer.targets()[0].active_conns, 0);
    }
}
