use std::net::IpAddr;

use axum::{
    body::Body,
    http::{header, HeaderMap, HeaderValue, Method, Uri},
};
use bytes::Bytes;
use tracing::{debug, error};
use url::Url;

use crate::config::{Config, Route};
use crate::error::{GatewayError, Result};
use crate::proxy::{is_hop_by_hop, ForwardedResponse};

/// Everything the engine needs to issue one upstream request.
pub struct ForwardContext<'a> {
    pub method: Method,
    pub headers: &'a HeaderMap,
    pub body: Bytes,
    pub client_ip: IpAddr,
    pub target: Url,
}

/// HTTP forwarding engine over a pooled upstream client.
pub struct ProxyEngine {
    client: reqwest::Client,
}

impl ProxyEngine {
    pub fn new(config: &Config) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(10))
            .read_timeout(config.read_timeout)
            .pool_idle_timeout(config.idle_timeout)
            .pool_max_idle_per_host(20)
            .redirect(reqwest::redirect::Policy::none())
            .user_agent(concat!("api-gateway/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| GatewayError::Internal(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self { client })
    }

    /// Forward the request to the target and stream the response back.
    pub async fn forward(&self, ctx: ForwardContext<'_>) -> Result<ForwardedResponse> {
        let headers = build_upstream_headers(ctx.headers, ctx.client_ip);

        debug!(method = %ctx.method, target = %ctx.target, "forwarding request upstream");

        let mut builder = self
            .client
            .request(ctx.method, ctx.target.clone())
            .headers(headers);
        if !ctx.body.is_empty() {
            builder = builder.body(ctx.body);
        }

        let response = builder.send().await.map_err(|e| {
            error!(target = %ctx.target, error = %e, "upstream request failed");
            if e.is_timeout() {
                GatewayError::Timeout
            } else if e.is_connect() {
                GatewayError::UpstreamDial(e.to_string())
            } else {
                GatewayError::Upstream(e.to_string())
            }
        })?;

        let status = response.status();
        let mut headers = HeaderMap::new();
        for (name, value) in response.headers() {
            if !is_hop_by_hop(name) {
                headers.append(name.clone(), value.clone());
            }
        }

        Ok(ForwardedResponse {
            status,
            headers,
            body: Body::from_stream(response.bytes_stream()),
        })
    }
}

/// Build the target URL for a route: absolute targets are used as the
/// upstream base, relative ones are resolved against the balancer's pick.
/// The configured prefix is stripped from the inbound path, target and
/// request paths are joined with exactly one slash, and the raw query is
/// preserved.
pub fn build_target_url(route: &Route, picked: &str, uri: &Uri) -> Result<Url> {
    let base = if route.target_url.starts_with("http://") || route.target_url.starts_with("https://")
    {
        route.target_url.clone()
    } else {
        format!("{}{}", picked.trim_end_matches('/'), route.target_url)
    };

    let mut url = Url::parse(&base)
        .map_err(|e| GatewayError::Internal(format!("invalid upstream url {}: {}", base, e)))?;

    let request_path = uri.path();
    let stripped = if !route.strip_prefix.is_empty() && request_path.starts_with(&route.strip_prefix)
    {
        let rest = &request_path[route.strip_prefix.len()..];
        if rest.starts_with('/') {
            rest.to_string()
        } else {
            format!("/{}", rest)
        }
    } else {
        request_path.to_string()
    };

    let base_path = url.path().trim_end_matches('/').to_string();
    let joined = if base_path.is_empty() {
        stripped
    } else if stripped == "/" {
        // The whole prefix was consumed: the target path IS the endpoint.
        base_path
    } else {
        format!("{}{}", base_path, stripped)
    };

    url.set_path(&joined);
    url.set_query(uri.query());
    Ok(url)
}

/// Copy request headers minus hop-by-hop and `Host` (the client sets the
/// upstream authority), then attach the forwarding headers.
fn build_upstream_headers(incoming: &HeaderMap, client_ip: IpAddr) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in incoming {
        if is_hop_by_hop(name) || name == header::HOST {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }

    let forwarded_for = match incoming.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        Some(existing) => format!("{}, {}", existing, client_ip),
        None => incoming
            .get("x-real-ip")
            .and_then(|v| v.to_str().ok())
            .map(|ip| ip.to_string())
            .unwrap_or_else(|| client_ip.to_string()),
    };
    if let Ok(value) = HeaderValue::from_str(&forwarded_for) {
        headers.insert("x-forwarded-for", value);
    }

    if let Ok(value) = HeaderValue::from_str(&client_ip.to_string()) {
        headers.insert("x-real-ip", value);
    }

    if let Some(host) = incoming.get(header::HOST) {
        headers.insert("x-forwarded-host", host.clone());
    }

    let proto = incoming
        .get("x-forwarded-proto")
        .cloned()
        .unwrap_or_else(|| HeaderValue::from_static("http"));
    headers.insert("x-forwarded-proto", proto);

    headers
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route(target: &str, strip: &str) -> Route {
        Route {
            path: "/api/*rest".to_string(),
            target_url: target.to_string(),
            methods: vec!["GET".to_string()],
            strip_prefix: strip.to_string(),
            require_auth: false,
            cacheable: false,
            timeout: 0,
        }
    }

    #[test]
    fn strips_prefix_and_joins_target_path() {
        let uri: Uri = "/api/users?q=1".parse().unwrap();
        let url = build_target_url(&route("/svc", "/api"), "http://u", &uri).unwrap();
        assert_eq!(url.as_str(), "http://u/svc/users?q=1");
    }

    #[test]
    fn absolute_target_overrides_balancer_pick() {
        let uri: Uri = "/api/users".parse().unwrap();
        let url = build_target_url(&route("http://fixed/svc", "/api"), "http://ignored", &uri)
            .unwrap();
        assert_eq!(url.as_str(), "http://fixed/svc/users");
    }

    #[test]
    fn passes_path_through_without_strip_prefix() {
        let uri: Uri = "/users/7".parse().unwrap();
        let url = build_target_url(&route("", ""), "http://u", &uri).unwrap();
        assert_eq!(url.as_str(), "http://u/users/7");
    }

    #[test]
    fn joins_with_exactly_one_slash() {
        let uri: Uri = "/api/users".parse().unwrap();
        // Trailing slash on the target must not double up.
        let url = build_target_url(&route("http://u/svc/", "/api"), "http://u", &uri).unwrap();
        assert_eq!(url.as_str(), "http://u/svc/users");
    }

    #[test]
    fn exact_route_maps_to_target_endpoint() {
        // Stripping the full path leaves "/": forward to the target's own
        // path without a trailing slash.
        let uri: Uri = "/login".parse().unwrap();
        let url =
            build_target_url(&route("http://u/auth/login", "/login"), "http://u", &uri).unwrap();
        assert_eq!(url.as_str(), "http://u/auth/login");
    }

    #[test]
    fn preserves_raw_query() {
        let uri: Uri = "/api/search?q=a%20b&page=2".parse().unwrap();
        let url = build_target_url(&route("", "/api"), "http://u", &uri).unwrap();
        assert_eq!(url.query(), Some("q=a%20b&page=2"));
    }

    #[test]
    fn non_matching_prefix_is_left_alone() {
        let uri: Uri = "/other/users".parse().unwrap();
        let url = build_target_url(&route("", "/api"), "http://u", &uri).unwrap();
        assert_eq!(url.path(), "/other/users");
    }

    #[test]
    fn forwarded_for_appends_to_existing_chain() {
        let mut incoming = HeaderMap::new();
        incoming.insert("x-forwarded-for", HeaderValue::from_static("10.0.0.1"));

        let headers = build_upstream_headers(&incoming, "10.0.0.2".parse().unwrap());
        assert_eq!(headers.get("x-forwarded-for").unwrap(), "10.0.0.1, 10.0.0.2");
    }

    #[test]
    fn forwarded_for_initialized_from_real_ip() {
        let mut incoming = HeaderMap::new();
        incoming.insert("x-real-ip", HeaderValue::from_static("172.16.0.9"));

        let headers = build_upstream_headers(&incoming, "10.0.0.2".parse().unwrap());
        assert_eq!(headers.get("x-forwarded-for").unwrap(), "172.16.0.9");
    }

    #[test]
    fn forwarded_headers_set_from_remote_addr() {
        let mut incoming = HeaderMap::new();
        incoming.insert(header::HOST, HeaderValue::from_static("gw.example.com"));

        let headers = build_upstream_headers(&incoming, "10.0.0.1".parse().unwrap());
        assert_eq!(headers.get("x-forwarded-for").unwrap(), "10.0.0.1");
        assert_eq!(headers.get("x-forwarded-host").unwrap(), "gw.example.com");
        assert_eq!(headers.get("x-forwarded-proto").unwrap(), "http");
        assert_eq!(headers.get("x-real-ip").unwrap(), "10.0.0.1");
    }

    #[test]
    fn hop_by_hop_and_host_are_not_copied() {
        let mut incoming = HeaderMap::new();
        incoming.insert(header::HOST, HeaderValue::from_static("gw.example.com"));
        incoming.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
        incoming.insert(header::TE, HeaderValue::from_static("trailers"));
        incoming.insert("x-request-id", HeaderValue::from_static("abc"));

        let headers = build_upstream_headers(&incoming, "10.0.0.1".parse().unwrap());
        assert!(headers.get(header::HOST).is_none());
        assert!(headers.get(header::CONNECTION).is_none());
        assert!(headers.get(header::TE).is_none());
        assert_eq!(headers.get("x-request-id").unwrap(), "abc");
    }
}
