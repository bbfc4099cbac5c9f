use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{ws::WebSocketUpgrade, ConnectInfo, Request, State},
    http::{HeaderMap, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::{MethodFilter, MethodRouter},
    Json, Router,
};
use futures_util::StreamExt;
use serde_json::json;
use tracing::{info, warn};

use crate::config::Route;
use crate::error::{GatewayError, Result};
use crate::middleware::{
    auth::{cookie_to_header, require_auth},
    cache::cache_layer,
    full_uri,
    timeout::route_timeout,
};
use crate::proxy::{
    engine::{build_target_url, ForwardContext},
    websocket::{build_ws_target, origin_allowed, proxy_upgrade},
    ConnGuard, ForwardedResponse,
};
use crate::server::GatewayState;

/// Per-route handler state: the shared gateway components plus the route
/// the chain was built for.
#[derive(Clone)]
pub struct RouteState {
    pub gateway: GatewayState,
    pub route: Arc<Route>,
}

/// Routes grouped by registration bucket.
#[derive(Debug, Default)]
pub struct RouteBuckets {
    pub specific: Vec<Route>,
    pub root: Vec<Route>,
    pub api: Vec<Route>,
    pub websocket: Vec<Route>,
    pub catch_all: Option<Route>,
}

/// Classify routes into their registration buckets.
pub fn classify(routes: &[Route]) -> RouteBuckets {
    let mut buckets = RouteBuckets::default();

    for route in routes {
        if route.path.starts_with("/ws") || route.path.starts_with("/websocket") {
            buckets.websocket.push(route.clone());
        } else if route.path == "/" {
            buckets.root.push(route.clone());
        } else if route.path == "/*proxyPath" || route.path == "/*path" {
            if buckets.catch_all.is_some() {
                warn!(path = %route.path, "multiple catch-all routes configured, keeping the last one");
            }
            buckets.catch_all = Some(route.clone());
        } else if route.path.starts_with("/api") {
            buckets.api.push(route.clone());
        } else {
            buckets.specific.push(route.clone());
        }
    }

    buckets
}

/// Assemble the gateway router: specific routes first, then root, the
/// `/api` group, WebSocket routes, and finally the catch-all under the
/// configured static prefixes and as the fallback for unmatched paths.
pub fn build_router(state: &GatewayState, routes: &[Route]) -> Result<Router> {
    let buckets = classify(routes);
    let mut router = Router::new();

    for route in &buckets.specific {
        info!(path = %route.path, target = %route.target_url, "registering route");
        router = router.route(&route.path, http_method_router(state, route)?);
    }

    for route in &buckets.root {
        info!(target = %route.target_url, "registering root route");
        router = router.route("/", http_method_router(state, route)?);
    }

    if !buckets.api.is_empty() {
        let mut api = Router::new();
        for route in &buckets.api {
            let sub_path = match route.path.strip_prefix("/api") {
                Some("") | None => "/",
                Some(rest) => rest,
            };
            info!(path = %route.path, target = %route.target_url, "registering api route");
            api = api.route(sub_path, http_method_router(state, route)?);
        }
        router = router.nest("/api", api);
    }

    for route in &buckets.websocket {
        info!(path = %route.path, target = %route.target_url, "registering websocket route");
        router = router.route(&route.path, ws_method_router(state, route));
    }

    if let Some(route) = &buckets.catch_all {
        info!(target = %route.target_url, "registering catch-all route");
        let method_router = http_method_router(state, route)?;
        for prefix in &state.config.static_prefixes {
            router = router.route(&format!("{}/*path", prefix), method_router.clone());
        }
        router = router.fallback_service(method_router);
    }

    Ok(router)
}

/// Build the per-route handler chain. Layer order, outermost first:
/// timeout, cookie promotion, authentication, cache lookup, proxy.
fn http_method_router(state: &GatewayState, route: &Route) -> Result<MethodRouter> {
    let filter = method_filter(route)?;
    let route_state = RouteState {
        gateway: state.clone(),
        route: Arc::new(route.clone()),
    };

    let mut method_router: MethodRouter<RouteState> =
        MethodRouter::new().on(filter, proxy_route_handler);

    if state.config.enable_caching && route.cacheable {
        method_router = method_router
            .route_layer(middleware::from_fn_with_state(route_state.clone(), cache_layer));
    }
    if route.require_auth {
        method_router = method_router
            .route_layer(middleware::from_fn_with_state(route_state.clone(), require_auth));
    }
    method_router = method_router.route_layer(middleware::from_fn(cookie_to_header));
    if route.timeout > 0 {
        method_router = method_router
            .route_layer(middleware::from_fn_with_state(route_state.clone(), route_timeout));
    }

    Ok(method_router.with_state(route_state))
}

fn ws_method_router(state: &GatewayState, route: &Route) -> MethodRouter {
    let route_state = RouteState {
        gateway: state.clone(),
        route: Arc::new(route.clone()),
    };

    let mut method_router: MethodRouter<RouteState> =
        MethodRouter::new().on(MethodFilter::GET, ws_route_handler);

    if route.require_auth {
        method_router = method_router
            .route_layer(middleware::from_fn_with_state(route_state.clone(), require_auth));
    }

    method_router.with_state(route_state)
}

fn method_filter(route: &Route) -> Result<MethodFilter> {
    let mut filter: Option<MethodFilter> = None;
    for method in &route.methods {
        let next = match method.to_uppercase().as_str() {
            "GET" => MethodFilter::GET,
            "POST" => MethodFilter::POST,
            "PUT" => MethodFilter::PUT,
            "PATCH" => MethodFilter::PATCH,
            "DELETE" => MethodFilter::DELETE,
            "HEAD" => MethodFilter::HEAD,
            "OPTIONS" => MethodFilter::OPTIONS,
            other => {
                return Err(GatewayError::Config(format!(
                    "route {} declares unsupported method {}",
                    route.path, other
                )))
            }
        };
        filter = Some(match filter {
            Some(acc) => acc.or(next),
            None => next,
        });
    }

    filter.ok_or_else(|| {
        GatewayError::Config(format!("route {} declares no methods", route.path))
    })
}

/// Terminal handler of the chain: pick a backend, forward through the
/// circuit breaker, and stream the response back. The balancer slot is
/// released exactly once when the response body completes (or on any error
/// path, via the guard's drop).
async fn proxy_route_handler(
    State(state): State<RouteState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    req: Request,
) -> Response {
    let uri = full_uri(&req);
    let method = req.method().clone();
    let headers = req.headers().clone();

    let body = match axum::body::to_bytes(req.into_body(), state.gateway.config.max_content_size)
        .await
    {
        Ok(bytes) => bytes,
        Err(_) => return GatewayError::PayloadTooLarge.into_response(),
    };

    let picked = match state.gateway.balancer.next_target() {
        Ok(url) => url,
        Err(_) => return GatewayError::NoBackend.into_response(),
    };
    let guard = ConnGuard::new(state.gateway.balancer.clone(), picked.clone());

    let target = match build_target_url(&state.route, &picked, &uri) {
        Ok(url) => url,
        Err(e) => return e.into_response(),
    };

    let metric_path = uri.path().to_string();
    let gateway = &state.gateway;
    let result = gateway
        .breaker
        .execute_classified(
            || async move {
                let forwarded = gateway
                    .engine
                    .forward(ForwardContext {
                        method,
                        headers: &headers,
                        body,
                        client_ip: addr.ip(),
                        target,
                    })
                    .await;

                forwarded.map_err(|e| {
                    match &e {
                        GatewayError::UpstreamDial(_) => {
                            // The backend is unreachable; stop sending it traffic.
                            let _ = gateway.balancer.mark_target_down(&picked);
                            gateway.metrics.record_upstream_error("dial");
                        }
                        GatewayError::Timeout => gateway.metrics.record_upstream_error("timeout"),
                        _ => gateway.metrics.record_upstream_error("io"),
                    }
                    e
                })
            },
            // A 5xx is delivered to the client verbatim but still counts as
            // a breaker failure.
            |forwarded| forwarded.status.is_server_error(),
        )
        .await;

    match result {
        Ok(response) => attach_release(response, guard).into_response(),
        Err(e) => {
            if matches!(e, GatewayError::CircuitOpen | GatewayError::TooManyRequests) {
                gateway.metrics.record_breaker_rejection(&metric_path);
            }
            e.into_response()
        }
    }
}

/// Tie the connection guard to the response body so the balancer slot is
/// held until the last byte is streamed (or the client disconnects).
fn attach_release(response: ForwardedResponse, guard: ConnGuard) -> ForwardedResponse {
    let stream = response.body.into_data_stream().map(move |chunk| {
        let _held = &guard;
        chunk
    });

    ForwardedResponse {
        status: response.status,
        headers: response.headers,
        body: Body::from_stream(stream),
    }
}

async fn ws_route_handler(
    State(state): State<RouteState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    if !origin_allowed(&headers, &state.gateway.config.allowed_origins) {
        warn!(path = %state.route.path, "websocket origin rejected");
        return (StatusCode::FORBIDDEN, Json(json!({ "error": "origin not allowed" })))
            .into_response();
    }

    let picked = match state.gateway.balancer.next_target() {
        Ok(url) => url,
        Err(_) => return GatewayError::NoBackend.into_response(),
    };
    let guard = ConnGuard::new(state.gateway.balancer.clone(), picked.clone());

    let target = build_ws_target(&state.route, &picked);
    proxy_upgrade(ws, &headers, addr.ip(), target, guard, state.gateway.metrics.clone()).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route(path: &str) -> Route {
        Route {
            path: path.to_string(),
            target_url: "http://backend".to_string(),
            methods: vec!["GET".to_string()],
            strip_prefix: String::new(),
            require_auth: false,
            cacheable: false,
            timeout: 0,
        }
    }

    #[test]
    fn classifies_routes_into_buckets() {
        let routes = vec![
            route("/login"),
            route("/"),
            route("/api/users"),
            route("/api/reports/:id"),
            route("/ws/chat"),
            route("/websocket/feed"),
            route("/*proxyPath"),
        ];

        let buckets = classify(&routes);
        assert_eq!(buckets.specific.len(), 1);
        assert_eq!(buckets.root.len(), 1);
        assert_eq!(buckets.api.len(), 2);
        assert_eq!(buckets.websocket.len(), 2);
        assert!(buckets.catch_all.is_some());
    }

    #[test]
    fn last_catch_all_wins() {
        let mut first = route("/*proxyPath");
        first.target_url = "http://first".to_string();
        let mut second = route("/*path");
        second.target_url = "http://second".to_string();

        let buckets = classify(&[first, second]);
        assert_eq!(buckets.catch_all.unwrap().target_url, "http://second");
    }

    #[test]
    fn ws_prefix_beats_api_prefix_ordering() {
        // Paths under /ws are websocket routes even though they are not
        // under /api; ordering of checks must keep them out of `specific`.
        let buckets = classify(&[route("/ws/anything")]);
        assert_eq!(buckets.websocket.len(), 1);
        assert!(buckets.specific.is_empty());
    }

    #[test]
    fn method_filter_accepts_known_methods() {
        let mut r = route("/x");
        r.methods = vec!["GET".to_string(), "post".to_string(), "OPTIONS".to_string()];
        assert!(method_filter(&r).is_ok());
    }

    #[test]
    fn method_filter_rejects_unknown_or_empty() {
        let mut r = route("/x");
        r.methods = vec!["BREW".to_string()];
        assert!(method_filter(&r).is_err());

        r.methods = vec![];
        assert!(method_filter(&r).is_err());
    }
}
