pub mod auth;
pub mod cache;
pub mod cors;
pub mod logger;
pub mod metrics;
pub mod rate_limit;
pub mod recovery;
pub mod request_id;
pub mod security;
pub mod size_limit;
pub mod timeout;

use axum::extract::{OriginalUri, Request};
use axum::http::Uri;

/// The inbound URI as the client sent it. Routes registered under a nested
/// router see a stripped path on `req.uri()`; the original is kept in the
/// request extensions.
pub(crate) fn full_uri(req: &Request) -> Uri {
    req.extensions()
        .get::<OriginalUri>()
        .map(|original| original.0.clone())
        .unwrap_or_else(|| req.uri().clone())
}
