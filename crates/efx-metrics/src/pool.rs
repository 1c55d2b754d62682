//! ---
//! efx_section: "05-metrics-exposition"
//! efx_subsection: "module"
//! efx_type: "source"
//! efx_scope: "code"
//! efx_description: "Telemetry flattening, gauge pooling, and the /metrics endpoint."
//! efx_version: "v0.1.0"
//! efx_owner: "tbd"
//! ---
//! Process-lifetime gauge pool.
//!
//! Devices report whatever fields their firmware knows about, so gauges
//! cannot be declared up front. The pool get-or-creates a `GaugeVec` per
//! (metric name, label-name set) on first sight and reuses it for every
//! later sample with the same shape.

use std::collections::HashMap;

use parking_lot::Mutex;
use prometheus::{
    GaugeVec, Histogram, HistogramOpts, IntCounter, IntGauge, IntGaugeVec, Opts,
};
use tracing::warn;

use crate::flatten::{DeviceLabels, Sample};
use crate::SharedRegistry;

type PoolKey = (String, Vec<String>);

/// Dynamic gauge registry keyed by metric name and label-name set.
pub struct MetricsPool {
    registry: SharedRegistry,
    gauges: Mutex<HashMap<PoolKey, GaugeVec>>,
}

impl MetricsPool {
    /// Pool backed by the given registry.
    pub fn new(registry: SharedRegistry) -> Self {
        Self {
            registry,
            gauges: Mutex::new(HashMap::new()),
        }
    }

    /// Registry the pooled gauges are registered in.
    pub fn registry(&self) -> SharedRegistry {
        self.registry.clone()
    }

    /// Publish one sample, creating and registering its gauge on first
    /// sight. Registration conflicts (the same name reappearing with a
    /// different label shape) are logged and the sample dropped; one odd
    /// field must not stall the collection tick.
    pub fn set_sample(&self, sample: &Sample) {
        let label_names: Vec<String> =
            sample.labels.iter().map(|(name, _)| name.clone()).collect();
        let key = (sample.name.clone(), label_names);

        let mut gauges = self.gauges.lock();
        if !gauges.contains_key(&key) {
            let names: Vec<&str> = key.1.iter().map(String::as_str).collect();
            let gauge = match GaugeVec::new(
                Opts::new(sample.name.clone(), format!("Telemetry value {}", sample.name)),
                &names,
            ) {
                Ok(gauge) => gauge,
                Err(err) => {
                    warn!(metric = %sample.name, error = %err, "invalid metric shape");
                    return;
                }
            };
            if let Err(err) = self.registry.register(Box::new(gauge.clone())) {
                warn!(metric = %sample.name, error = %err, "metric registration conflict");
                return;
            }
            gauges.insert(key.clone(), gauge);
        }

        if let Some(gauge) = gauges.get(&key) {
            let values: Vec<&str> = sample.labels.iter().map(|(_, v)| v.as_str()).collect();
            gauge.with_label_values(&values).set(sample.value);
        }
    }

    /// Reset every pooled gauge. Used when the device goes offline so
    /// stale values disappear from the scrape instead of freezing.
    pub fn clear(&self) {
        for gauge in self.gauges.lock().values() {
            gauge.reset();
        }
    }

    /// Number of distinct gauge shapes created so far.
    pub fn len(&self) -> usize {
        self.gauges.lock().len()
    }

    /// True when no gauge has been created yet.
    pub fn is_empty(&self) -> bool {
        self.gauges.lock().is_empty()
    }
}

const SCRAPE_DURATION_BUCKETS: &[f64] = &[0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0];

/// Metrics the exporter records about itself.
#[derive(Clone)]
pub struct ExporterMetrics {
    online: IntGaugeVec,
    connection_errors: IntCounter,
    scrape_duration: Histogram,
    metrics_collected: IntGauge,
}

impl ExporterMetrics {
    /// Register the self-observation metrics under the given prefix.
    pub fn new(registry: &SharedRegistry, prefix: &str) -> Result<Self, prometheus::Error> {
        let online = IntGaugeVec::new(
            Opts::new(
                format!("{prefix}_online"),
                "Whether the device currently delivers telemetry (0/1)",
            ),
            &["device", "device_name", "product_name", "device_general_key"],
        )?;
        registry.register(Box::new(online.clone()))?;

        let connection_errors = IntCounter::with_opts(Opts::new(
            format!("{prefix}_connection_errors_total"),
            "Transport errors observed by the collection loop",
        ))?;
        registry.register(Box::new(connection_errors.clone()))?;

        let scrape_duration = Histogram::with_opts(
            HistogramOpts::new(
                format!("{prefix}_scrape_duration_seconds"),
                "Time spent collecting device data per tick",
            )
            .buckets(SCRAPE_DURATION_BUCKETS.to_vec()),
        )?;
        registry.register(Box::new(scrape_duration.clone()))?;

        let metrics_collected = IntGauge::with_opts(Opts::new(
            format!("{prefix}_metrics_collected"),
            "Number of telemetry samples published by the last tick",
        ))?;
        registry.register(Box::new(metrics_collected.clone()))?;

        Ok(Self {
            online,
            connection_errors,
            scrape_duration,
            metrics_collected,
        })
    }

    /// Flag the device as delivering telemetry or not.
    pub fn set_online(&self, labels: &DeviceLabels, online: bool) {
        self.online
            .with_label_values(&[
                &labels.device,
                &labels.device_name,
                &labels.product_name,
                &labels.device_general_key,
            ])
            .set(i64::from(online));
    }

    /// Count one transport error.
    pub fn inc_connection_error(&self) {
        self.connection_errors.inc();
    }

    /// Record how long one collection tick took.
    pub fn observe_scrape(&self, elapsed: std::time::Duration) {
        self.scrape_duration.observe(elapsed.as_secs_f64());
    }

    /// Record how many telemetry samples the last tick published.
    pub fn set_metrics_collected(&self, count: usize) {
        self.metrics_collected.set(count as i64);
    }
}
