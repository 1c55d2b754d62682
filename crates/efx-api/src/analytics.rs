//! ---
//! efx_section: "02-device-connectivity"
//! efx_subsection: "module"
//! efx_type: "source"
//! efx_scope: "code"
//! efx_description: "Device connectivity contract and transport strategies."
//! efx_version: "v0.1.0"
//! efx_owner: "tbd"
//! ---
//! Operational metrics recorded by the transports themselves.
//!
//! These instruments observe the exporter's own plumbing rather than
//! device telemetry: HTTP request outcomes and latency, authentication
//! attempts, bus message/reconnect counters, and the sent/skipped
//! outcome of the quota request suppression rule. The instruments are
//! created unregistered so tests and the factory can construct clients
//! without touching a live registry; the daemon registers them once at
//! startup.

use std::time::Duration;

use prometheus::{Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts};

const HTTP_DURATION_BUCKETS: &[f64] = &[
    0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
];
const AUTH_DURATION_BUCKETS: &[f64] = &[0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0];

/// Self-observation instruments shared by all transport strategies.
#[derive(Clone)]
pub struct TransportMetrics {
    http_requests: IntCounterVec,
    http_request_duration: HistogramVec,
    auth_requests: IntCounterVec,
    auth_duration: Histogram,
    mqtt_messages: IntCounterVec,
    mqtt_message_errors: IntCounter,
    mqtt_reconnections: IntCounter,
    quota_requests: IntCounterVec,
}

impl TransportMetrics {
    /// Create the instruments under the given metric prefix.
    pub fn new(prefix: &str) -> Result<Self, prometheus::Error> {
        Ok(Self {
            http_requests: IntCounterVec::new(
                Opts::new(
                    format!("{prefix}_http_requests_total"),
                    "HTTP requests issued against the vendor API",
                ),
                &["endpoint", "status"],
            )?,
            http_request_duration: HistogramVec::new(
                HistogramOpts::new(
                    format!("{prefix}_http_request_duration_seconds"),
                    "Latency of HTTP requests against the vendor API",
                )
                .buckets(HTTP_DURATION_BUCKETS.to_vec()),
                &["endpoint"],
            )?,
            auth_requests: IntCounterVec::new(
                Opts::new(
                    format!("{prefix}_auth_requests_total"),
                    "Broker credential acquisition attempts",
                ),
                &["status"],
            )?,
            auth_duration: Histogram::with_opts(
                HistogramOpts::new(
                    format!("{prefix}_auth_duration_seconds"),
                    "Duration of login plus certification exchange",
                )
                .buckets(AUTH_DURATION_BUCKETS.to_vec()),
            )?,
            mqtt_messages: IntCounterVec::new(
                Opts::new(
                    format!("{prefix}_mqtt_messages_total"),
                    "Bus payloads received, by encoding",
                ),
                &["type"],
            )?,
            mqtt_message_errors: IntCounter::with_opts(Opts::new(
                format!("{prefix}_mqtt_message_errors_total"),
                "Bus payloads dropped because they could not be decoded",
            ))?,
            mqtt_reconnections: IntCounter::with_opts(Opts::new(
                format!("{prefix}_mqtt_reconnections_total"),
                "Bus reconnection attempts after a lost session",
            ))?,
            quota_requests: IntCounterVec::new(
                Opts::new(
                    format!("{prefix}_quota_requests_total"),
                    "Quota request scheduling outcomes (sent or skipped)",
                ),
                &["status"],
            )?,
        })
    }

    /// Register every instrument in the given registry.
    pub fn register(&self, registry: &prometheus::Registry) -> Result<(), prometheus::Error> {
        registry.register(Box::new(self.http_requests.clone()))?;
        registry.register(Box::new(self.http_request_duration.clone()))?;
        registry.register(Box::new(self.auth_requests.clone()))?;
        registry.register(Box::new(self.auth_duration.clone()))?;
        registry.register(Box::new(self.mqtt_messages.clone()))?;
        registry.register(Box::new(self.mqtt_message_errors.clone()))?;
        registry.register(Box::new(self.mqtt_reconnections.clone()))?;
        registry.register(Box::new(self.quota_requests.clone()))?;
        Ok(())
    }

    /// Record one HTTP request attempt against a vendor endpoint.
    pub fn observe_http_request(&self, endpoint: &str, ok: bool, elapsed: Duration) {
        let status = if ok { "success" } else { "error" };
        self.http_requests
            .with_label_values(&[endpoint, status])
            .inc();
        self.http_request_duration
            .with_label_values(&[endpoint])
            .observe(elapsed.as_secs_f64());
    }

    /// Record one broker credential acquisition.
    pub fn observe_auth(&self, ok: bool, elapsed: Duration) {
        let status = if ok { "success" } else { "error" };
        self.auth_requests.with_label_values(&[status]).inc();
        self.auth_duration.observe(elapsed.as_secs_f64());
    }

    /// Count one decoded bus payload. `kind` is "json" or "binary".
    pub fn inc_mqtt_message(&self, kind: &str) {
        self.mqtt_messages.with_label_values(&[kind]).inc();
    }

    /// Count one undecodable bus payload.
    pub fn inc_mqtt_message_error(&self) {
        self.mqtt_message_errors.inc();
    }

    /// Count one bus reconnection attempt.
    pub fn inc_mqtt_reconnection(&self) {
        self.mqtt_reconnections.inc();
    }

    /// Record one tick of the quota request scheduler.
    pub fn note_quota_request(&self, sent: bool) {
        let status = if sent { "sent" } else { "skipped" };
        self.quota_requests.with_label_values(&[status]).inc();
    }
}
