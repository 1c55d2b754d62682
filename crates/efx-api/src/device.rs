//! ---
//! efx_section: "02-device-connectivity"
//! efx_subsection: "module"
//! efx_type: "source"
//! efx_scope: "code"
//! efx_description: "Device connectivity contract and transport strategies."
//! efx_version: "v0.1.0"
//! efx_owner: "tbd"
//! ---
//! Active bus transport: request/reply quota polling over the broker.
//!
//! On top of the shared session this transport periodically publishes a
//! `latestQuotas` request, unless a reply is still outstanding or an
//! unsolicited push already delivered fresher data than the request
//! interval. Replies land in the snapshot cache through the shared
//! receive task.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rand::Rng;
use rumqttc::QoS;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use efx_common::TimingConfig;

use crate::analytics::TransportMetrics;
use crate::auth::MqttAuthentication;
use crate::models::{ConnectionState, DeviceInfo, QuotaSnapshot};
use crate::mqtt::{quota_request_topic, BusCore, BusMode};
use crate::{ApiClient, ApiError};

// Request ids live in a reserved range so replies to foreign apps
// sharing the account are never mistaken for ours.
const REQUEST_ID_BASE: u64 = 999_900_000;
const REQUEST_ID_SPAN: u64 = 100_000;

/// A quota request published to the device, awaiting its reply.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PendingRequest {
    /// Request id echoed back in the reply.
    pub(crate) id: u64,
    /// When the request was published.
    pub(crate) issued_at: Instant,
}

/// Whether a new quota request should be published now.
///
/// Suppressed while a previous request is still within the interval,
/// and while pushed data is fresher than the interval (the device is
/// already talking, asking again is pointless). A pending request older
/// than the interval counts as lost and no longer suppresses.
pub(crate) fn should_request(
    last_data_age: Option<Duration>,
    pending_age: Option<Duration>,
    interval: Duration,
) -> bool {
    if let Some(age) = pending_age {
        if age < interval {
            return false;
        }
    }
    if let Some(age) = last_data_age {
        if age < interval {
            return false;
        }
    }
    true
}

fn pick_request_id() -> u64 {
    REQUEST_ID_BASE + rand::thread_rng().gen_range(0..REQUEST_ID_SPAN)
}

fn build_request_payload(id: u64) -> serde_json::Value {
    serde_json::json!({
        "from": "PrometheusExporter",
        "id": id,
        "version": "1.0",
        "moduleType": 0,
        "operateType": "latestQuotas",
        "params": {},
    })
}

/// Active bus transport for one device.
pub struct DeviceApiClient {
    core: Arc<BusCore>,
    requester: Mutex<Option<JoinHandle<()>>>,
}

impl DeviceApiClient {
    /// Active transport for one device.
    pub fn new(
        device_sn: String,
        auth: MqttAuthentication,
        timing: TimingConfig,
        name_override: Option<String>,
        analytics: TransportMetrics,
    ) -> Self {
        Self {
            core: Arc::new(BusCore::new(
                device_sn,
                auth,
                timing,
                name_override,
                BusMode::Active,
                analytics,
            )),
            requester: Mutex::new(None),
        }
    }
}

/// Evaluate the suppression rule for one scheduler tick and record the
/// sent/skipped outcome.
fn plan_request(core: &BusCore) -> bool {
    let interval = core.timing().quota_request_interval;
    let last_data_age = core
        .last_data_at()
        .and_then(|at| (chrono::Utc::now() - at).to_std().ok());
    let pending_age = core.pending_request().map(|p| p.issued_at.elapsed());
    let fire = should_request(last_data_age, pending_age, interval);
    core.analytics().note_quota_request(fire);
    fire
}

/// Publishes quota requests on a fixed cadence, subject to suppression.
async fn request_loop(core: Arc<BusCore>) {
    let tick = core.timing().collection_interval;
    loop {
        tokio::time::sleep(tick).await;
        if core.state() != ConnectionState::Connected {
            continue;
        }
        if !plan_request(&core) {
            continue;
        }

        let Some((client, user_id)) = core.session_handle().await else {
            continue;
        };
        let id = pick_request_id();
        let topic = quota_request_topic(&user_id, core.device_sn());
        let payload = build_request_payload(id).to_string();
        match client
            .publish(&topic, QoS::AtLeastOnce, false, payload)
            .await
        {
            Ok(()) => {
                debug!(request_id = id, topic, "published quota request");
                core.set_pending(PendingRequest {
                    id,
                    issued_at: Instant::now(),
                });
            }
            Err(err) => {
                warn!(error = %err, topic, "failed to publish quota request");
            }
        }
    }
}

#[async_trait::async_trait]
impl ApiClient for DeviceApiClient {
    async fn establish(&self) -> Result<(), ApiError> {
        self.core.connect().await?;
        let mut requester = self.requester.lock();
        if requester.is_none() {
            *requester = Some(tokio::spawn(request_loop(Arc::clone(&self.core))));
        }
        Ok(())
    }

    async fn list_devices(&self) -> Result<Vec<DeviceInfo>, ApiError> {
        Ok(vec![self.core.device_info()])
    }

    async fn get_device(&self, device_sn: &str) -> Result<Option<DeviceInfo>, ApiError> {
        Ok((device_sn == self.core.device_sn()).then(|| self.core.device_info()))
    }

    async fn get_device_quota(
        &self,
        device_sn: &str,
    ) -> Result<Option<QuotaSnapshot>, ApiError> {
        if device_sn != self.core.device_sn() {
            return Ok(None);
        }
        Ok(self.core.snapshot())
    }

    async fn disconnect(&self) {
        if let Some(requester) = self.requester.lock().take() {
            requester.abort();
        }
        self.core.shutdown().await;
    }

    fn connection_state(&self) -> ConnectionState {
        self.core.state()
    }
}
