//! ---
//! efx_section: "02-device-connectivity"
//! efx_subsection: "module"
//! efx_type: "source"
//! efx_scope: "code"
//! efx_description: "Device connectivity contract and transport strategies."
//! efx_version: "v0.1.0"
//! efx_owner: "tbd"
//! ---
//! Broker session shared by the passive and active bus transports.
//!
//! [`BusCore`] owns the MQTT session, a background receive task that is
//! the sole writer into the snapshot cache, and an idle watchdog that
//! forces a reconnect when the broker goes quiet. [`MqttApiClient`] is
//! the passive transport: it subscribes to the device property topic and
//! never sends anything.

use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS, Transport};
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use efx_common::{QuotaValue, TimingConfig};
use efx_proto::FrameDecoder;

use crate::analytics::TransportMetrics;
use crate::auth::MqttAuthentication;
use crate::backoff::ReconnectBackoff;
use crate::cache::SnapshotCache;
use crate::device::PendingRequest;
use crate::models::{ConnectionState, DeviceInfo, QuotaSnapshot, SnapshotSource};
use crate::{ApiClient, ApiError};

/// Unsolicited property pushes for one device.
pub(crate) fn property_topic(device_sn: &str) -> String {
    format!("/app/device/property/{device_sn}")
}

/// Topic an active quota request is published to.
pub(crate) fn quota_request_topic(user_id: &str, device_sn: &str) -> String {
    format!("/app/{user_id}/{device_sn}/thing/property/get")
}

/// Topic the device answers quota requests on.
pub(crate) fn quota_reply_topic(user_id: &str, device_sn: &str) -> String {
    format!("/app/{user_id}/{device_sn}/thing/property/get_reply")
}

/// Which topics a session subscribes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BusMode {
    /// Property pushes only.
    Passive,
    /// Property pushes plus the request/reply pair.
    Active,
}

struct Session {
    client: AsyncClient,
    user_id: String,
    tasks: Vec<JoinHandle<()>>,
}

/// Connection, ingestion, and lifecycle state shared by both bus
/// transports.
pub(crate) struct BusCore {
    device_sn: String,
    auth: MqttAuthentication,
    timing: TimingConfig,
    name_override: Option<String>,
    mode: BusMode,
    analytics: TransportMetrics,
    decoder: FrameDecoder,
    cache: SnapshotCache,
    state: Mutex<ConnectionState>,
    last_activity: Mutex<Option<Instant>>,
    pending: Mutex<Option<PendingRequest>>,
    session: AsyncMutex<Option<Session>>,
}

impl BusCore {
    pub(crate) fn new(
        device_sn: String,
        auth: MqttAuthentication,
        timing: TimingConfig,
        name_override: Option<String>,
        mode: BusMode,
        analytics: TransportMetrics,
    ) -> Self {
        Self {
            device_sn,
            auth,
            timing,
            name_override,
            mode,
            analytics,
            decoder: FrameDecoder::new(),
            cache: SnapshotCache::new(),
            state: Mutex::new(ConnectionState::Disconnected),
            last_activity: Mutex::new(None),
            pending: Mutex::new(None),
            session: AsyncMutex::new(None),
        }
    }

    pub(crate) fn timing(&self) -> &TimingConfig {
        &self.timing
    }

    pub(crate) fn analytics(&self) -> &TransportMetrics {
        &self.analytics
    }

    pub(crate) fn device_sn(&self) -> &str {
        &self.device_sn
    }

    pub(crate) fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    /// Latest snapshot for the configured device, if any arrived yet.
    pub(crate) fn snapshot(&self) -> Option<QuotaSnapshot> {
        self.cache.get(&self.device_sn)
    }

    /// When telemetry for the device last arrived.
    pub(crate) fn last_data_at(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        self.cache.captured_at(&self.device_sn)
    }

    /// The outstanding quota request, if one is in flight.
    pub(crate) fn pending_request(&self) -> Option<PendingRequest> {
        *self.pending.lock()
    }

    pub(crate) fn set_pending(&self, request: PendingRequest) {
        *self.pending.lock() = Some(request);
    }

    /// Synthesized identity for the single configured device. Bus
    /// sessions have no device registry; a device counts as online once
    /// the session is up and telemetry has been seen.
    pub(crate) fn device_info(&self) -> DeviceInfo {
        let connected = self.state() == ConnectionState::Connected;
        let has_data = self.last_data_at().is_some();
        DeviceInfo {
            sn: self.device_sn.clone(),
            name: self
                .name_override
                .clone()
                .unwrap_or_else(|| self.device_sn.clone()),
            product_name: None,
            online: connected && has_data,
        }
    }

    /// MQTT client and account user id of the live session.
    pub(crate) async fn session_handle(&self) -> Option<(AsyncClient, String)> {
        self.session
            .lock()
            .await
            .as_ref()
            .map(|session| (session.client.clone(), session.user_id.clone()))
    }

    /// Acquire broker credentials, open the session, and wait until the
    /// broker acknowledges the connection. Idempotent while connected.
    pub(crate) async fn connect(self: &Arc<Self>) -> Result<(), ApiError> {
        {
            let mut state = self.state.lock();
            if *state == ConnectionState::Connected {
                return Ok(());
            }
            *state = ConnectionState::Connecting;
        }

        let auth_started = Instant::now();
        let acquired = self.auth.acquire().await;
        self.analytics
            .observe_auth(acquired.is_ok(), auth_started.elapsed());
        let credentials = match acquired {
            Ok(credentials) => credentials,
            Err(err) => {
                *self.state.lock() = ConnectionState::Disconnected;
                return Err(err);
            }
        };

        let mut options = MqttOptions::new(
            credentials.client_id(),
            credentials.broker_host.clone(),
            credentials.broker_port,
        );
        options.set_credentials(
            credentials.certificate_account.clone(),
            credentials.certificate_password.clone(),
        );
        options.set_keep_alive(self.timing.keepalive);
        options.set_transport(Transport::tls_with_default_config());

        let (client, eventloop) = AsyncClient::new(options, 64);
        let topics = self.subscription_topics(&credentials.user_id);
        let receive = tokio::spawn(receive_loop(
            Arc::clone(self),
            client.clone(),
            eventloop,
            topics,
        ));
        let watchdog = tokio::spawn(idle_watchdog(Arc::clone(self), client.clone()));

        *self.session.lock().await = Some(Session {
            client,
            user_id: credentials.user_id,
            tasks: vec![receive, watchdog],
        });

        self.wait_connected().await
    }

    async fn wait_connected(self: &Arc<Self>) -> Result<(), ApiError> {
        let deadline = Instant::now() + self.timing.http_timeout;
        while Instant::now() < deadline {
            if self.state() == ConnectionState::Connected {
                return Ok(());
            }
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        }
        self.shutdown().await;
        Err(ApiError::Transient(
            "broker did not acknowledge the connection in time".to_owned(),
        ))
    }

    /// Stop the background tasks and close the session.
    pub(crate) async fn shutdown(&self) {
        if let Some(session) = self.session.lock().await.take() {
            for task in &session.tasks {
                task.abort();
            }
            let _ = session.client.disconnect().await;
        }
        *self.state.lock() = ConnectionState::Disconnected;
    }

    fn subscription_topics(&self, user_id: &str) -> Vec<String> {
        match self.mode {
            BusMode::Passive => vec![property_topic(&self.device_sn)],
            BusMode::Active => vec![
                property_topic(&self.device_sn),
                quota_reply_topic(user_id, &self.device_sn),
            ],
        }
    }

    fn touch(&self) {
        *self.last_activity.lock() = Some(Instant::now());
    }

    fn idle_for(&self) -> Option<std::time::Duration> {
        self.last_activity.lock().map(|at| at.elapsed())
    }

    /// Route one received payload into the snapshot cache.
    ///
    /// Pure with respect to the session: no network I/O happens here, so
    /// the full ingestion matrix is unit-testable.
    pub(crate) fn ingest_payload(&self, topic: &str, payload: &[u8]) {
        if topic.ends_with("/thing/property/get_reply") {
            self.ingest_reply(payload);
            return;
        }
        self.ingest_push(topic, payload);
    }

    fn ingest_push(&self, topic: &str, payload: &[u8]) {
        // Property pushes are JSON with a params object; some firmware
        // publishes binary envelopes on the same topic instead.
        if let Ok(mut value) = serde_json::from_slice::<serde_json::Value>(payload) {
            self.analytics.inc_mqtt_message("json");
            if let Some(params) = value.get_mut("params").map(serde_json::Value::take) {
                if let Some(values) = QuotaValue::mapping_from_json(params) {
                    self.cache.put(QuotaSnapshot::now(
                        &self.device_sn,
                        values,
                        SnapshotSource::Push,
                    ));
                    return;
                }
            }
            debug!(topic, "push payload carried no params object");
            return;
        }

        match self.decoder.decode(payload) {
            Ok(values) => {
                self.analytics.inc_mqtt_message("binary");
                let empty = values.as_mapping().map_or(true, |m| m.is_empty());
                if empty {
                    debug!(topic, "envelope carried no status frames");
                } else {
                    self.cache.put(QuotaSnapshot::now(
                        &self.device_sn,
                        values,
                        SnapshotSource::Push,
                    ));
                }
            }
            Err(err) => {
                self.analytics.inc_mqtt_message_error();
                warn!(topic, error = %err, "dropping undecodable bus payload");
            }
        }
    }

    fn ingest_reply(&self, payload: &[u8]) {
        let mut value: serde_json::Value = match serde_json::from_slice(payload) {
            Ok(value) => {
                self.analytics.inc_mqtt_message("json");
                value
            }
            Err(err) => {
                self.analytics.inc_mqtt_message_error();
                warn!(error = %err, "dropping unparseable quota reply");
                return;
            }
        };
        if value.get("operateType").and_then(|v| v.as_str()) != Some("latestQuotas") {
            debug!("ignoring reply with foreign operate type");
            return;
        }
        let reply_id = value.get("id").and_then(|v| v.as_u64());

        let Some(data) = value.get_mut("data") else {
            warn!("quota reply carried no data object");
            self.clear_pending(reply_id);
            return;
        };
        if data.get("online").and_then(|v| v.as_i64()) != Some(1) {
            debug!("quota reply reports the device offline");
            self.clear_pending(reply_id);
            return;
        }
        let quota_map = data.get_mut("quotaMap").map(serde_json::Value::take);
        if let Some(values) = quota_map.and_then(QuotaValue::mapping_from_json) {
            self.cache.put(QuotaSnapshot::now(
                &self.device_sn,
                values,
                SnapshotSource::Reply,
            ));
        } else {
            warn!("quota reply carried no quota map");
        }
        self.clear_pending(reply_id);
    }

    /// Clear the outstanding request, unless the reply identifies a
    /// different (stale) request.
    fn clear_pending(&self, reply_id: Option<u64>) {
        let mut pending = self.pending.lock();
        match (*pending, reply_id) {
            (Some(current), Some(id)) if current.id != id => {}
            _ => *pending = None,
        }
    }
}

/// Drives the MQTT event loop. Sole writer into the snapshot cache.
async fn receive_loop(
    core: Arc<BusCore>,
    client: AsyncClient,
    mut eventloop: rumqttc::EventLoop,
    topics: Vec<String>,
) {
    let mut backoff = ReconnectBackoff::new(
        core.timing.retry_delay,
        core.timing.max_reconnect_delay,
    );
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                backoff.reset();
                for topic in &topics {
                    if let Err(err) = client.subscribe(topic, QoS::AtLeastOnce).await {
                        warn!(topic, error = %err, "subscribe failed");
                    }
                }
                *core.state.lock() = ConnectionState::Connected;
                core.touch();
                info!(device_sn = %core.device_sn, "bus session established");
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                core.touch();
                core.ingest_payload(&publish.topic, &publish.payload);
            }
            Ok(_) => {}
            Err(err) => {
                core.analytics.inc_mqtt_reconnection();
                let delay = backoff.next_delay();
                {
                    let mut state = core.state.lock();
                    *state = match *state {
                        ConnectionState::Disconnected | ConnectionState::Connecting => {
                            ConnectionState::Connecting
                        }
                        _ => ConnectionState::Reconnecting,
                    };
                }
                warn!(
                    error = %err,
                    failures = backoff.failures(),
                    delay_secs = delay.as_secs(),
                    "bus connection lost, backing off"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// Forces a reconnect when no traffic arrived within the idle timeout.
/// Stays out of the way while a connect attempt is already in progress.
async fn idle_watchdog(core: Arc<BusCore>, client: AsyncClient) {
    loop {
        tokio::time::sleep(core.timing.idle_check_interval).await;
        let state = core.state();
        if state != ConnectionState::Connected {
            continue;
        }
        let Some(idle) = core.idle_for() else {
            continue;
        };
        if idle >= core.timing.idle_timeout {
            warn!(
                idle_secs = idle.as_secs(),
                "no bus traffic within the idle timeout, forcing reconnect"
            );
            *core.state.lock() = ConnectionState::Reconnecting;
            let _ = client.disconnect().await;
        }
    }
}

/// Passive bus transport: subscribe to property pushes, publish nothing.
pub struct MqttApiClient {
    core: Arc<BusCore>,
}

impl MqttApiClient {
    /// Passive transport for one device.
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
                BusMode::Passive,
                analytics,
            )),
        }
    }
}

#[async_trait::async_trait]
impl ApiClient for MqttApiClient {
    async fn establish(&self) -> Result<(), ApiError> {
        self.core.connect().await
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
        self.core.shutdown().await;
    }

    fn connection_state(&self) -> ConnectionState {
        self.core.state()
    }
}
