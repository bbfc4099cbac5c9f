use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing::warn;

/// Gateway metrics over the Prometheus exporter. All record methods are
/// no-ops when collection is disabled, and recording never fails a request.
pub struct MetricsCollector {
    enabled: bool,
    handle: Option<PrometheusHandle>,
}

impl MetricsCollector {
    pub fn new(enabled: bool) -> Self {
        let handle = if enabled {
            match PrometheusBuilder::new().install_recorder() {
                Ok(handle) => {
                    register_metrics();
                    Some(handle)
                }
                Err(e) => {
                    // A recorder may already be installed (tests build
                    // several gateways per process); keep recording into it.
                    warn!(error = %e, "failed to install Prometheus recorder");
                    None
                }
            }
        } else {
            None
        };

        Self { enabled, handle }
    }

    /// Render the Prometheus text exposition for `GET /metrics`.
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(|handle| handle.render())
    }

    pub fn record_request(&self, method: &str, path: &str, status: u16, duration: Duration) {
        if !self.enabled {
            return;
        }
        counter!(
            "gateway_requests_total",
            "method" => method.to_string(),
            "path" => path.to_string(),
            "status" => status.to_string()
        )
        .increment(1);
        histogram!(
            "gateway_request_duration_seconds",
            "method" => method.to_string(),
            "path" => path.to_string()
        )
        .record(duration.as_secs_f64());
    }

    pub fn inc_in_flight(&self) {
        if self.enabled {
            gauge!("gateway_in_flight_requests").increment(1.0);
        }
    }

    pub fn dec_in_flight(&self) {
        if self.enabled {
            gauge!("gateway_in_flight_requests").decrement(1.0);
        }
    }

    pub fn record_cache_hit(&self, path: &str) {
        if self.enabled {
            counter!("gateway_cache_hits_total", "path" => path.to_string()).increment(1);
        }
    }

    pub fn record_rate_limited(&self, path: &str) {
        if self.enabled {
            counter!("gateway_rate_limited_total", "path" => path.to_string()).increment(1);
        }
    }

    pub fn record_breaker_rejection(&self, path: &str) {
        if self.enabled {
            counter!("gateway_circuit_breaker_rejections_total", "path" => path.to_string())
                .increment(1);
        }
    }

    pub fn record_upstream_error(&self, kind: &str) {
        if self.enabled {
            counter!("gateway_upstream_errors_total", "kind" => kind.to_string()).increment(1);
        }
    }

    pub fn websocket_opened(&self) {
        if self.enabled {
            gauge!("gateway_websocket_connections").increment(1.0);
        }
    }

    pub fn websocket_closed(&self) {
        if self.enabled {
            gauge!("gateway_websocket_connections").decrement(1.0);
        }
    }
}

fn register_metrics() {
    describe_counter!("gateway_requests_total", "Total number of requests handled");
    describe_histogram!(
        "gateway_request_duration_seconds",
        "Request processing time in seconds"
    );
    describe_gauge!("gateway_in_flight_requests", "Requests currently being processed");
    describe_counter!("gateway_cache_hits_total", "Responses served from the cache");
    describe_counter!("gateway_rate_limited_total", "Requests rejected by the rate limiter");
    describe_counter!(
        "gateway_circuit_breaker_rejections_total",
        "Requests rejected while the circuit breaker is open"
    );
    describe_counter!("gateway_upstream_errors_total", "Upstream transport failures");
    describe_gauge!("gateway_websocket_connections", "Active relayed WebSocket connections");
}
