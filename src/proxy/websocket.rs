use std::net::IpAddr;
use std::sync::Arc;

use axum::{
    extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
    http::{header, HeaderMap, HeaderValue},
    response::{IntoResponse, Response},
};
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{self, client::IntoClientRequest, protocol::Message as BackendMessage},
};
use tracing::{debug, info, warn};

use crate::config::Route;
use crate::error::GatewayError;
use crate::observability::metrics::MetricsCollector;
use crate::proxy::ConnGuard;

/// Check the client `Origin` against the CORS allow-list. A lone `*`
/// admits every origin; a missing `Origin` header is allowed (non-browser
/// clients).
pub fn origin_allowed(headers: &HeaderMap, allowed_origins: &[String]) -> bool {
    if allowed_origins.len() == 1 && allowed_origins[0] == "*" {
        return true;
    }
    match headers.get(header::ORIGIN).and_then(|v| v.to_str().ok()) {
        Some(origin) => allowed_origins.iter().any(|allowed| allowed == origin),
        None => true,
    }
}

/// Build the backend WebSocket URL: `ws(s)://` targets are used as-is,
/// absolute `http(s)://` targets have their scheme converted, and relative
/// targets are resolved against the balancer's pick (scheme converted).
pub fn build_ws_target(route: &Route, picked: &str) -> String {
    let target = &route.target_url;
    if target.starts_with("ws://") || target.starts_with("wss://") {
        return target.clone();
    }
    if target.starts_with("https://") {
        return format!("wss://{}", target.trim_start_matches("https://"));
    }
    if target.starts_with("http://") {
        return format!("ws://{}", target.trim_start_matches("http://"));
    }

    let base = if picked.starts_with("https://") {
        format!("wss://{}", picked.trim_start_matches("https://"))
    } else {
        format!("ws://{}", picked.trim_start_matches("http://"))
    };
    format!("{}{}", base.trim_end_matches('/'), target)
}

/// Dial the backend, then upgrade the client and relay frames in both
/// directions. The backend is dialed first so a failed dial surfaces as a
/// 502 before the upgrade completes.
pub async fn proxy_upgrade(
    ws: WebSocketUpgrade,
    headers: &HeaderMap,
    client_ip: IpAddr,
    target: String,
    guard: ConnGuard,
    metrics: Arc<MetricsCollector>,
) -> Response {
    let mut request = match target.as_str().into_client_request() {
        Ok(request) => request,
        Err(e) => {
            warn!(target = %target, error = %e, "invalid websocket target");
            return GatewayError::UpstreamDial(e.to_string()).into_response();
        }
    };

    // The dialer regenerates the handshake headers; everything else is
    // carried over from the client.
    for (name, value) in headers {
        let lowered = name.as_str();
        if lowered.starts_with("sec-websocket-")
            || name == header::CONNECTION
            || name == header::UPGRADE
            || name == header::HOST
        {
            continue;
        }
        request.headers_mut().append(name.clone(), value.clone());
    }
    if let Ok(value) = HeaderValue::from_str(&client_ip.to_string()) {
        request.headers_mut().insert("x-forwarded-for", value.clone());
        request.headers_mut().insert("x-real-ip", value);
    }

    info!(target = %target, "dialing backend websocket");
    let backend = match connect_async(request).await {
        Ok((stream, _response)) => stream,
        Err(e) => {
            warn!(target = %target, error = %e, "backend websocket dial failed");
            return GatewayError::UpstreamDial(e.to_string()).into_response();
        }
    };

    metrics.websocket_opened();
    ws.on_upgrade(move |client| async move {
        relay(client, backend).await;
        metrics.websocket_closed();
        debug!("websocket relay finished");
        drop(guard);
    })
}

/// Relay frames until either side closes or errors; the first side to exit
/// cancels the other.
async fn relay(
    client: WebSocket,
    backend: tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
) {
    let (mut backend_sink, mut backend_stream) = backend.split();
    let (mut client_sink, mut client_stream) = client.split();

    let client_to_backend = async {
        while let Some(Ok(message)) = client_stream.next().await {
            if backend_sink.send(to_backend_message(message)).await.is_err() {
                break;
            }
        }
    };

    let backend_to_client = async {
        while let Some(Ok(message)) = backend_stream.next().await {
            let Some(message) = to_client_message(message) else {
                continue;
            };
            if client_sink.send(message).await.is_err() {
                break;
            }
        }
    };

    tokio::select! {
        _ = client_to_backend => {}
        _ = backend_to_client => {}
    }
}

fn to_backend_message(message: Message) -> BackendMessage {
    match message {
        Message::Text(text) => BackendMessage::Text(text),
        Message::Binary(data) => BackendMessage::Binary(data),
        Message::Ping(data) => BackendMessage::Ping(data),
        Message::Pong(data) => BackendMessage::Pong(data),
        Message::Close(frame) => BackendMessage::Close(frame.map(|f| {
            tungstenite::protocol::CloseFrame {
                code: f.code.into(),
                reason: f.reason,
            }
        })),
    }
}

fn to_client_message(message: BackendMessage) -> Option<Message> {
    match message {
        BackendMessage::Text(text) => Some(Message::Text(text)),
        BackendMessage::Binary(data) => Some(Message::Binary(data)),
        BackendMessage::Ping(data) => Some(Message::Ping(data)),
        BackendMessage::Pong(data) => Some(Message::Pong(data)),
        BackendMessage::Close(frame) => Some(Message::Close(frame.map(|f| CloseFrame {
            code: f.code.into(),
            reason: f.reason,
        }))),
        // Raw frames never surface from a read; skip defensively.
        BackendMessage::Frame(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route(target: &str) -> Route {
        Route {
            path: "/ws/chat".to_string(),
            target_url: target.to_string(),
            methods: vec!["GET".to_string()],
            strip_prefix: String::new(),
            require_auth: false,
            cacheable: false,
            timeout: 0,
        }
    }

    #[test]
    fn ws_target_used_verbatim() {
        assert_eq!(build_ws_target(&route("ws://u/chat"), "http://b"), "ws://u/chat");
        assert_eq!(build_ws_target(&route("wss://u/chat"), "http://b"), "wss://u/chat");
    }

    #[test]
    fn absolute_http_target_converts_scheme() {
        assert_eq!(build_ws_target(&route("http://u/chat"), "http://b"), "ws://u/chat");
        assert_eq!(build_ws_target(&route("https://u/chat"), "http://b"), "wss://u/chat");
    }

    #[test]
    fn relative_target_resolves_against_pick() {
        assert_eq!(build_ws_target(&route("/chat"), "http://b:9000"), "ws://b:9000/chat");
        assert_eq!(build_ws_target(&route("/chat"), "https://b"), "wss://b/chat");
    }

    #[test]
    fn wildcard_origin_admits_everyone() {
        let mut headers = HeaderMap::new();
        headers.insert(header::ORIGIN, HeaderValue::from_static("http://evil.example"));
        assert!(origin_allowed(&headers, &["*".to_string()]));
    }

    #[test]
    fn origin_allow_list_is_exact_match() {
        let mut headers = HeaderMap::new();
        headers.insert(header::ORIGIN, HeaderValue::from_static("http://app.example"));

        let allowed = vec!["http://app.example".to_string()];
        assert!(origin_allowed(&headers, &allowed));

        headers.insert(header::ORIGIN, HeaderValue::from_static("http://other.example"));
        assert!(!origin_allowed(&headers, &allowed));
    }

    #[test]
    fn missing_origin_is_allowed() {
        let headers = HeaderMap::new();
        assert!(origin_allowed(&headers, &["http://app.example".to_string()]));
    }
}
