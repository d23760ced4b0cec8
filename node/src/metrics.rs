//! # Prometheus Metrics
//!
//! Exposes operational metrics for the relay node. Scraped by Prometheus
//! at the `/metrics` HTTP endpoint on the optional metrics port.
//!
//! All metrics are registered in a dedicated [`prometheus::Registry`] so they
//! do not collide with any default global registry consumers.

use std::sync::Arc;
use std::time::Duration;

use axum::http::StatusCode;
use axum::response::IntoResponse;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};

use parley_protocol::rpc::{RelayResponse, RpcMethod};

/// Holds all Prometheus metric handles for the node.
#[derive(Clone)]
pub struct NodeMetrics {
    registry: Registry,
    /// Handled requests by method and outcome (`ok` or the error code).
    pub requests_total: IntCounterVec,
    /// Handler latency by method, in seconds.
    pub request_latency_seconds: HistogramVec,
    /// Open node-to-node channels in the connection pool.
    pub pooled_channels: IntGauge,
    /// Expired mailbox entries removed by the purge task.
    pub mailbox_purged_total: IntCounter,
}

impl NodeMetrics {
    /// Creates and registers all metrics. Call once at startup.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new_custom(Some("parley".into()), None)?;

        let requests_total = IntCounterVec::new(
            Opts::new("relay_requests_total", "Relay requests handled, by method and outcome"),
            &["method", "outcome"],
        )?;
        registry.register(Box::new(requests_total.clone()))?;

        let request_latency_seconds = HistogramVec::new(
            HistogramOpts::new(
                "relay_request_latency_seconds",
                "Relay request handling latency in seconds",
            )
            .buckets(vec![
                0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 30.0,
            ]),
            &["method"],
        )?;
        registry.register(Box::new(request_latency_seconds.clone()))?;

        let pooled_channels = IntGauge::new("pooled_channels", "Open channels to other nodes")?;
        registry.register(Box::new(pooled_channels.clone()))?;

        let mailbox_purged_total = IntCounter::new(
            "mailbox_purged_total",
            "Expired mailbox entries removed by the purge task",
        )?;
        registry.register(Box::new(mailbox_purged_total.clone()))?;

        Ok(Self {
            registry,
            requests_total,
            request_latency_seconds,
            pooled_channels,
            mailbox_purged_total,
        })
    }

    /// Records one handled relay request.
    pub fn observe(&self, method: RpcMethod, response: &RelayResponse, elapsed: Duration) {
        let outcome = match response.error_code {
            _ if response.success => "ok".to_string(),
            Some(code) => code.to_string(),
            None => "error".to_string(),
        };
        self.requests_total
            .with_label_values(&[method.name(), outcome.as_str()])
            .inc();
        self.request_latency_seconds
            .with_label_values(&[method.name()])
            .observe(elapsed.as_secs_f64());
    }

    /// Encodes all registered metrics into the Prometheus text exposition format.
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

/// Shared metrics state passed to axum handlers.
pub type SharedMetrics = Arc<NodeMetrics>;

/// Axum handler that renders `/metrics` in Prometheus text format.
pub async fn metrics_handler(
    axum::extract::State(metrics): axum::extract::State<SharedMetrics>,
) -> impl IntoResponse {
    match metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(e) => {
            tracing::error!("failed to encode metrics: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, "metrics encoding failed").into_response()
        }
    }
}
