//! ---
//! efx_section: "06-collection"
//! efx_subsection: "module"
//! efx_type: "source"
//! efx_scope: "code"
//! efx_description: "Collection loop driving transport reads into the metrics pool."
//! efx_version: "v0.1.0"
//! efx_owner: "tbd"
//! ---
//! The collection loop.
//!
//! Establishes the transport (bounded retries, exhaustion is fatal),
//! then ticks on a fixed interval: read device status and the latest
//! quota snapshot, flatten it into the gauge pool, and track the online
//! gauge. A shutdown signal interrupts any wait promptly and tears the
//! transport down best-effort.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use efx_api::{ApiClient, ApiError, ConnectionState};
use efx_common::TimingConfig;
use efx_devices::DeviceResolver;
use efx_metrics::{flatten, DeviceLabels, ExporterMetrics, MetricsPool};

/// Fatal collection failures. Everything else is logged and survived.
#[derive(Debug, thiserror::Error)]
pub enum CollectorError {
    /// The transport could not be established within the attempt cap.
    #[error("failed to establish transport after {attempts} attempts")]
    EstablishExhausted {
        /// Attempts made before giving up.
        attempts: u32,
        /// Error of the final attempt.
        #[source]
        source: ApiError,
    },
}

/// Periodic collection driver for one device.
pub struct CollectionLoop {
    client: Arc<dyn ApiClient>,
    device_sn: String,
    resolver: DeviceResolver,
    pool: MetricsPool,
    metrics: ExporterMetrics,
    metric_prefix: String,
    timing: TimingConfig,
}

impl CollectionLoop {
    pub fn new(
        client: Arc<dyn ApiClient>,
        device_sn: String,
        resolver: DeviceResolver,
        pool: MetricsPool,
        metrics: ExporterMetrics,
        metric_prefix: String,
        timing: TimingConfig,
    ) -> Self {
        Self {
            client,
            device_sn,
            resolver,
            pool,
            metrics,
            metric_prefix,
            timing,
        }
    }

    /// Run until the shutdown signal flips to true. Returns an error
    /// only when establishment is exhausted; the caller exits non-zero.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), CollectorError> {
        if !self.establish_with_retry(&mut shutdown).await? {
            self.client.disconnect().await;
            return Ok(());
        }

        info!(
            device_sn = %self.device_sn,
            interval_secs = self.timing.collection_interval.as_secs(),
            "collection loop running"
        );
        loop {
            if !self.collect_once(&mut shutdown).await? {
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep(self.timing.collection_interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
            if *shutdown.borrow() {
                break;
            }
        }

        info!("collection loop stopping");
        self.client.disconnect().await;
        Ok(())
    }

    /// Establish the transport with a fixed delay between attempts.
    /// Ok(false) means shutdown was requested while waiting.
    async fn establish_with_retry(
        &self,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<bool, CollectorError> {
        let attempts = self.timing.establish_attempts;
        for attempt in 1..=attempts {
            match self.client.establish().await {
                Ok(()) => {
                    info!(attempt, "transport established");
                    return Ok(true);
                }
                Err(source) if attempt == attempts => {
                    return Err(CollectorError::EstablishExhausted { attempts, source });
                }
                Err(err) => {
                    warn!(
                        attempt,
                        attempts,
                        retry_secs = self.timing.retry_delay.as_secs(),
                        error = %err,
                        "transport establishment failed, retrying"
                    );
                    self.metrics.inc_connection_error();
                    tokio::select! {
                        _ = tokio::time::sleep(self.timing.retry_delay) => {}
                        _ = shutdown.changed() => {
                            if *shutdown.borrow() {
                                return Ok(false);
                            }
                        }
                    }
                }
            }
        }
        Ok(false)
    }

    /// One timed collection tick, with error handling. Transport errors
    /// are logged and counted, never propagated; when the transport
    /// reports its session as gone afterwards, the loop re-establishes
    /// before continuing. Ok(false) means shutdown was requested while
    /// re-establishing.
    async fn collect_once(
        &self,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<bool, CollectorError> {
        let started = Instant::now();
        let result = self.tick().await;
        self.metrics.observe_scrape(started.elapsed());

        let err = match result {
            Ok(()) => return Ok(true),
            Err(err) => err,
        };
        warn!(error = %err, "collection tick failed");
        self.metrics.inc_connection_error();

        let state = self.client.connection_state();
        if state == ConnectionState::Disconnected {
            warn!("transport reports no session, re-establishing");
            return self.establish_with_retry(shutdown).await;
        }
        if state.is_transitioning() {
            // The transport runs its own reconnect with backoff; piling
            // establish calls on top would race it.
            debug!(?state, "transport is recovering on its own");
        }
        Ok(true)
    }

    async fn tick(&self) -> Result<(), ApiError> {
        let device = self.client.get_device(&self.device_sn).await?;
        let snapshot = self.client.get_device_quota(&self.device_sn).await?;

        let api_name = device.as_ref().map(|d| d.name.as_str());
        let labels = DeviceLabels {
            device: self.device_sn.clone(),
            device_name: self.resolver.device_name(&self.device_sn, api_name),
            product_name: device
                .as_ref()
                .and_then(|d| d.product_name.clone())
                .unwrap_or_default(),
            device_general_key: self.resolver.general_key(&self.device_sn),
        };

        match snapshot {
            Some(snapshot) => {
                let samples = flatten(&self.metric_prefix, &labels, &snapshot.values);
                for sample in &samples {
                    self.pool.set_sample(sample);
                }
                self.metrics.set_online(&labels, true);
                self.metrics.set_metrics_collected(samples.len());
                debug!(
                    samples = samples.len(),
                    source = ?snapshot.source,
                    "published telemetry snapshot"
                );
            }
            None => {
                // Stale gauges must not outlive the device; a frozen SoC
                // reading is worse than a gap.
                self.pool.clear();
                self.metrics.set_online(&labels, false);
                self.metrics.set_metrics_collected(0);
                debug!(device_sn = %self.device_sn, "no telemetry, metrics cleared");
            }
        }
        Ok(())
    }
}
