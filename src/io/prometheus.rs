//! Scrape endpoint for engine metrics
//!
//! `GET /metrics` returns the text exposition format with every series
//! labelled by the target device name; `GET /health` answers `ok`.
//! Scrapes read a snapshot and never reset the interval histogram.

use crate::infra::metrics::{Metrics, MetricsSummary, METRICS_BUCKET_BOUNDS, METRICS_NUM_BUCKETS};
use bytes::Bytes;
use http_body_util::Full;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::fmt::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};

const TEXT_FORMAT: &str = "text/plain; version=0.0.4; charset=utf-8";

enum MetricType {
    Counter,
    Gauge,
}

impl MetricType {
    fn as_str(&self) -> &'static str {
        match self {
            MetricType::Counter => "counter",
            MetricType::Gauge => "gauge",
        }
    }
}

/// Write a simple metric (counter or gauge) with device label
fn write_metric(
    output: &mut String,
    name: &str,
    help: &str,
    typ: MetricType,
    device: &str,
    val: u64,
) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} {}", typ.as_str());
    let _ = writeln!(output, "{name}{{device=\"{device}\"}} {val}");
}

/// Cumulative `le` buckets plus `_sum` and `_count`
fn write_histogram(
    output: &mut String,
    name: &str,
    help: &str,
    device: &str,
    buckets: &[u64; METRICS_NUM_BUCKETS],
    bounds: &[u64; 10],
    sum: u64,
) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} histogram");

    let mut cumulative = 0u64;
    for (i, &bound) in bounds.iter().enumerate() {
        cumulative += buckets[i];
        let _ = writeln!(output, "{name}_bucket{{device=\"{device}\",le=\"{bound}\"}} {cumulative}");
    }
    cumulative += buckets[METRICS_NUM_BUCKETS - 1];
    let _ = writeln!(output, "{name}_bucket{{device=\"{device}\",le=\"+Inf\"}} {cumulative}");

    let count: u64 = buckets.iter().sum();
    let _ = writeln!(output, "{name}_sum{{device=\"{device}\"}} {sum}");
    let _ = writeln!(output, "{name}_count{{device=\"{device}\"}} {count}");
}

fn format_prometheus_metrics(metrics: &Metrics, device: &str) -> String {
    let summary = metrics.snapshot();
    let mut output = String::with_capacity(4096);

    write_dispatch_metrics(&mut output, device, &summary);
    write_session_metrics(&mut output, device, &summary);
    write_route_metrics(&mut output, device, &summary);

    output
}

fn write_dispatch_metrics(output: &mut String, device: &str, summary: &MetricsSummary) {
    let counters = [
        ("navbeacon_ticks_total", "Dispatcher ticks", summary.ticks_total),
        (
            "navbeacon_ticks_no_position_total",
            "Ticks skipped without a fresh position",
            summary.ticks_no_position,
        ),
        ("navbeacon_positions_total", "Position fixes received", summary.positions_total),
        ("navbeacon_steps_matched_total", "Route steps found due", summary.steps_matched_total),
        (
            "navbeacon_steps_suppressed_total",
            "Due steps suppressed by the repeat guard",
            summary.steps_suppressed_total,
        ),
        (
            "navbeacon_messages_queued_total",
            "Messages handed to the peripheral session",
            summary.messages_queued_total,
        ),
        (
            "navbeacon_messages_rejected_total",
            "Messages the peripheral session refused",
            summary.messages_rejected_total,
        ),
    ];
    for (name, help, val) in counters {
        write_metric(output, name, help, MetricType::Counter, device, val);
    }
}

fn write_session_metrics(output: &mut String, device: &str, summary: &MetricsSummary) {
    let counters = [
        (
            "navbeacon_messages_delivered_total",
            "Writes acknowledged by the peripheral",
            summary.messages_delivered_total,
        ),
        ("navbeacon_write_failures_total", "Failed peripheral writes", summary.write_failures_total),
        (
            "navbeacon_connect_failures_total",
            "Failed peripheral connects",
            summary.connect_failures_total,
        ),
        (
            "navbeacon_discovery_failures_total",
            "Failed peripheral discoveries",
            summary.discovery_failures_total,
        ),
        ("navbeacon_scans_started_total", "Peripheral scans started", summary.scans_started_total),
        ("navbeacon_disconnects_total", "Peripheral link losses", summary.disconnects_total),
    ];
    for (name, help, val) in counters {
        write_metric(output, name, help, MetricType::Counter, device, val);
    }

    write_metric(
        output,
        "navbeacon_session_state",
        "Session state (0=idle 1=scanning 2=connecting 3=connected 4=disconnecting)",
        MetricType::Gauge,
        device,
        summary.session_state,
    );

    write_histogram(
        output,
        "navbeacon_write_latency_ms",
        "Write plus read-back round trip in milliseconds",
        device,
        &summary.write_lat_buckets,
        &METRICS_BUCKET_BOUNDS,
        summary.write_lat_sum_ms,
    );
}

fn write_route_metrics(output: &mut String, device: &str, summary: &MetricsSummary) {
    write_metric(
        output,
        "navbeacon_route_loads_total",
        "Routes loaded into the step table",
        MetricType::Counter,
        device,
        summary.route_loads_total,
    );
    write_metric(
        output,
        "navbeacon_route_failures_total",
        "Route fetches that left the table unchanged",
        MetricType::Counter,
        device,
        summary.route_failures_total,
    );
    write_metric(
        output,
        "navbeacon_route_steps",
        "Steps in the active route",
        MetricType::Gauge,
        device,
        summary.route_steps,
    );
}

fn respond(status: StatusCode, content_type: &'static str, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response.headers_mut().insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

async fn handle_request(
    req: Request<hyper::body::Incoming>,
    metrics: Arc<Metrics>,
    device: Arc<String>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    match (req.method(), req.uri().path()) {
        (&Method::GET, "/metrics") => {
            let body = format_prometheus_metrics(&metrics, &device);
            Ok(respond(StatusCode::OK, TEXT_FORMAT, body))
        }
        (&Method::GET, "/health") => Ok(respond(StatusCode::OK, "text/plain", "ok")),
        _ => Ok(respond(StatusCode::NOT_FOUND, "text/plain", "Not Found")),
    }
}

/// Serve `/metrics` on `0.0.0.0:<port>` until shutdown
pub async fn start_metrics_server(
    port: u16,
    metrics: Arc<Metrics>,
    device: String,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    let device = Arc::new(device);

    info!(port = %port, device = %device, "prometheus_metrics_server_started");

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _addr)) => {
                        let io = TokioIo::new(stream);
                        let metrics = metrics.clone();
                        let device = device.clone();

                        tokio::spawn(async move {
                            let service = service_fn(move |req| {
                                let metrics = metrics.clone();
                                let device = device.clone();
                                async move { handle_request(req, metrics, device).await }
                            });

                            if let Err(e) = http1::Builder::new()
                                .serve_connection(io, service)
                                .await
                            {
                                error!(error = %e, "prometheus_http_error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "prometheus_accept_error");
                    }
                }
            }
            result = shutdown.changed() => {
                if result.is_err() || *shutdown.borrow() {
                    info!("prometheus_metrics_server_shutdown");
                    return Ok(());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::metrics::SESSION_STATE_CONNECTED;

    #[test]
    fn test_exposition_contains_labelled_series() {
        let metrics = Metrics::new();
        metrics.record_tick();
        metrics.record_delivered(15);
        metrics.record_delivered(300);
        metrics.set_session_state(SESSION_STATE_CONNECTED);
        metrics.record_route_loaded(7);

        let output = format_prometheus_metrics(&metrics, "ESP32_BLE");

        assert!(output.contains("navbeacon_ticks_total{device=\"ESP32_BLE\"} 1"));
        assert!(output.contains("navbeacon_messages_delivered_total{device=\"ESP32_BLE\"} 2"));
        assert!(output.contains("navbeacon_session_state{device=\"ESP32_BLE\"} 3"));
        assert!(output.contains("navbeacon_route_steps{device=\"ESP32_BLE\"} 7"));
        assert!(output.contains("navbeacon_write_latency_ms_bucket{device=\"ESP32_BLE\",le=\"20\"} 1"));
        assert!(output.contains("navbeacon_write_latency_ms_bucket{device=\"ESP32_BLE\",le=\"+Inf\"} 2"));
        assert!(output.contains("navbeacon_write_latency_ms_sum{device=\"ESP32_BLE\"} 315"));
    }

    #[test]
    fn test_scrape_does_not_reset_histogram() {
        let metrics = Metrics::new();
        metrics.record_delivered(15);
        let _ = format_prometheus_metrics(&metrics, "d");
        let output = format_prometheus_metrics(&metrics, "d");
        assert!(output.contains("navbeacon_write_latency_ms_count{device=\"d\"} 1"));
    }
}
