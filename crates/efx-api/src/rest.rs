//! ---
//! efx_section: "02-device-connectivity"
//! efx_subsection: "module"
//! efx_type: "source"
//! efx_scope: "code"
//! efx_description: "Device connectivity contract and transport strategies."
//! efx_version: "v0.1.0"
//! efx_owner: "tbd"
//! ---
//! Signed HTTP polling against the developer REST API.
//!
//! Every request carries an HMAC-SHA256 signature over the sorted query
//! parameters plus the access key, a fresh nonce, and a millisecond
//! timestamp. Retryable failures (network errors, 5xx, 429) are retried
//! with exponential backoff; 401/403 and other 4xx are surfaced
//! immediately.

use std::collections::BTreeMap;
use std::time::Instant;

use hmac::{Hmac, Mac};
use parking_lot::Mutex;
use rand::Rng;
use serde::Deserialize;
use sha2::Sha256;
use tracing::{debug, info, warn};

use efx_common::{QuotaValue, TimingConfig};

use crate::analytics::TransportMetrics;
use crate::backoff::http_retry_delay;
use crate::models::{ConnectionState, DeviceInfo, QuotaSnapshot, SnapshotSource};
use crate::{ApiClient, ApiError};

const DEVICE_LIST_PATH: &str = "/iot-open/sign/device/list";
const DEVICE_QUOTA_PATH: &str = "/iot-open/sign/device/quota/all";

/// Polling transport backed by the signed developer REST API.
pub struct RestApiClient {
    http: reqwest::Client,
    base_url: String,
    access_key: String,
    secret_key: String,
    timing: TimingConfig,
    analytics: TransportMetrics,
    state: Mutex<ConnectionState>,
    device_list: Mutex<Option<DeviceListCache>>,
}

struct DeviceListCache {
    fetched_at: Instant,
    devices: Vec<DeviceInfo>,
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(default)]
    code: serde_json::Value,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    data: Option<serde_json::Value>,
}

#[derive(Deserialize)]
struct DeviceEntry {
    sn: String,
    #[serde(default, rename = "deviceName")]
    device_name: Option<String>,
    #[serde(default, rename = "productName")]
    product_name: Option<String>,
    #[serde(default)]
    online: Option<i64>,
}

impl RestApiClient {
    /// Build a client for the given vendor API host.
    pub fn new(
        host: &str,
        access_key: String,
        secret_key: String,
        timing: TimingConfig,
        analytics: TransportMetrics,
    ) -> Result<Self, ApiError> {
        Self::with_base_url(
            format!("https://{host}"),
            access_key,
            secret_key,
            timing,
            analytics,
        )
    }

    /// Build a client against an explicit base URL. Used by tests to
    /// point at a local server.
    pub fn with_base_url(
        base_url: String,
        access_key: String,
        secret_key: String,
        timing: TimingConfig,
        analytics: TransportMetrics,
    ) -> Result<Self, ApiError> {
        let http = reqwest::Client::builder()
            .timeout(timing.http_timeout)
            .build()
            .map_err(|err| ApiError::Transient(format!("http client init: {err}")))?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_owned(),
            access_key,
            secret_key,
            timing,
            analytics,
            state: Mutex::new(ConnectionState::Disconnected),
            device_list: Mutex::new(None),
        })
    }

    /// Fetch a signed endpoint, retrying retryable failures with
    /// exponential backoff. Each attempt is re-signed with a fresh nonce
    /// and timestamp.
    async fn get_signed(
        &self,
        path: &str,
        params: &BTreeMap<String, String>,
    ) -> Result<serde_json::Value, ApiError> {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let started = Instant::now();
            let outcome = self.try_get_signed(path, params).await;
            self.analytics
                .observe_http_request(path, outcome.is_ok(), started.elapsed());
            match outcome {
                Ok(data) => return Ok(data),
                Err(err) if err.is_retryable() && attempt <= self.timing.http_retries => {
                    let delay = http_retry_delay(self.timing.http_backoff_factor, attempt);
                    warn!(
                        path,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "retryable request failure"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn try_get_signed(
        &self,
        path: &str,
        params: &BTreeMap<String, String>,
    ) -> Result<serde_json::Value, ApiError> {
        let nonce = format!("{:06}", rand::thread_rng().gen_range(100_000..1_000_000));
        let timestamp = chrono::Utc::now().timestamp_millis().to_string();
        let signature = sign_request(
            &self.secret_key,
            params,
            &self.access_key,
            &nonce,
            &timestamp,
        );

        let url = format!("{}{}", self.base_url, path);
        let response = self
            .http
            .get(&url)
            .query(params)
            .header("accessKey", &self.access_key)
            .header("nonce", &nonce)
            .header("timestamp", &timestamp)
            .header("sign", &signature)
            .send()
            .await
            .map_err(|err| ApiError::Transient(format!("request to {path}: {err}")))?;

        let status = response.status();
        if status.is_server_error() || status.as_u16() == 429 {
            return Err(ApiError::Transient(format!("{path} answered {status}")));
        }
        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(ApiError::Authentication(format!("{path} answered {status}")));
        }
        if !status.is_success() {
            return Err(ApiError::Api {
                code: status.as_u16().to_string(),
                message: format!("unexpected status from {path}"),
            });
        }

        let envelope: Envelope = response
            .json()
            .await
            .map_err(|err| ApiError::Transient(format!("decoding {path} body: {err}")))?;
        let code = envelope_code(&envelope.code);
        if code != "0" {
            return Err(ApiError::Api {
                code,
                message: envelope.message.unwrap_or_default(),
            });
        }
        envelope.data.ok_or(ApiError::MalformedResponse("data"))
    }

    /// Fetch the device list from the API and refresh the cache,
    /// carrying over previously known devices as offline when the new
    /// list no longer mentions them.
    async fn refresh_device_list(&self) -> Result<Vec<DeviceInfo>, ApiError> {
        let data = self.get_signed(DEVICE_LIST_PATH, &BTreeMap::new()).await?;
        let entries: Vec<DeviceEntry> = serde_json::from_value(data)
            .map_err(|_| ApiError::MalformedResponse("device list entries"))?;
        let fetched = entries
            .into_iter()
            .map(|entry| DeviceInfo {
                name: entry.device_name.unwrap_or_else(|| entry.sn.clone()),
                product_name: entry.product_name,
                online: entry.online.unwrap_or(0) == 1,
                sn: entry.sn,
            })
            .collect::<Vec<_>>();

        let mut guard = self.device_list.lock();
        let previous = guard
            .as_ref()
            .map(|cache| cache.devices.clone())
            .unwrap_or_default();
        let merged = merge_refreshed(&previous, fetched);
        *guard = Some(DeviceListCache {
            fetched_at: Instant::now(),
            devices: merged.clone(),
        });
        Ok(merged)
    }

    fn cached_device_list(&self) -> Option<Vec<DeviceInfo>> {
        let guard = self.device_list.lock();
        guard.as_ref().and_then(|cache| {
            (cache.fetched_at.elapsed() < self.timing.device_list_cache_ttl)
                .then(|| cache.devices.clone())
        })
    }
}

#[async_trait::async_trait]
impl ApiClient for RestApiClient {
    async fn establish(&self) -> Result<(), ApiError> {
        if *self.state.lock() == ConnectionState::Connected {
            return Ok(());
        }
        *self.state.lock() = ConnectionState::Connecting;
        match self.refresh_device_list().await {
            Ok(devices) => {
                info!(device_count = devices.len(), "rest transport established");
                *self.state.lock() = ConnectionState::Connected;
                Ok(())
            }
            Err(err) => {
                *self.state.lock() = ConnectionState::Disconnected;
                Err(err)
            }
        }
    }

    async fn list_devices(&self) -> Result<Vec<DeviceInfo>, ApiError> {
        if let Some(devices) = self.cached_device_list() {
            return Ok(devices);
        }
        self.refresh_device_list().await
    }

    async fn get_device(&self, device_sn: &str) -> Result<Option<DeviceInfo>, ApiError> {
        let devices = self.list_devices().await?;
        Ok(devices.into_iter().find(|d| d.sn == device_sn))
    }

    async fn get_device_quota(
        &self,
        device_sn: &str,
    ) -> Result<Option<QuotaSnapshot>, ApiError> {
        match self.get_device(device_sn).await? {
            Some(device) if device.online => {}
            _ => {
                debug!(device_sn, "device absent or offline, skipping quota poll");
                return Ok(None);
            }
        }

        let mut params = BTreeMap::new();
        params.insert("sn".to_owned(), device_sn.to_owned());
        let data = self.get_signed(DEVICE_QUOTA_PATH, &params).await?;
        let values = QuotaValue::mapping_from_json(data)
            .ok_or(ApiError::MalformedResponse("quota mapping"))?;
        Ok(Some(QuotaSnapshot::now(
            device_sn,
            values,
            SnapshotSource::RestPoll,
        )))
    }

    async fn disconnect(&self) {
        *self.state.lock() = ConnectionState::Disconnected;
        *self.device_list.lock() = None;
    }

    fn connection_state(&self) -> ConnectionState {
        *self.state.lock()
    }
}

/// Merge a freshly fetched device list over the previously known one.
/// Devices the API stopped listing are retained but flagged offline, so
/// the collector reports them as absent rather than forgetting them.
fn merge_refreshed(previous: &[DeviceInfo], fetched: Vec<DeviceInfo>) -> Vec<DeviceInfo> {
    let mut merged = fetched;
    for known in previous {
        if !merged.iter().any(|d| d.sn == known.sn) {
            let mut gone = known.clone();
            gone.online = false;
            merged.push(gone);
        }
    }
    merged
}

/// Canonical string the vendor signature covers: the sorted request
/// parameters followed by accessKey, nonce, and timestamp.
fn canonical_query(
    params: &BTreeMap<String, String>,
    access_key: &str,
    nonce: &str,
    timestamp: &str,
) -> String {
    let mut parts: Vec<String> = params.iter().map(|(k, v)| format!("{k}={v}")).collect();
    parts.push(format!("accessKey={access_key}"));
    parts.push(format!("nonce={nonce}"));
    parts.push(format!("timestamp={timestamp}"));
    parts.join("&")
}

fn hmac_sha256_hex(secret: &str, message: &str) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
        .expect("hmac accepts any key length");
    mac.update(message.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

fn sign_request(
    secret_key: &str,
    params: &BTreeMap<String, String>,
    access_key: &str,
    nonce: &str,
    timestamp: &str,
) -> String {
    hmac_sha256_hex(
        secret_key,
        &canonical_query(params, access_key, nonce, timestamp),
    )
}

fn envelope_code(code: &serde_json::Value) -> String {
    match code {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Number(n) => n.to_string(),
        _ => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::State;
    use axum::routing::get;
    use axum::{Json, Router};
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn canonical_query_sorts_params_and_appends_identity() {
        let mut params = BTreeMap::new();
        params.insert("sn".to_owned(), "R331ZEB4ZEAL0528".to_owned());
        params.insert("cmd".to_owned(), "1".to_owned());
        let canonical = canonical_query(&params, "AK", "123456", "1700000000000");
        assert_eq!(
            canonical,
            "cmd=1&sn=R331ZEB4ZEAL0528&accessKey=AK&nonce=123456&timestamp=1700000000000"
        );
    }

    #[test]
    fn hmac_matches_rfc4231_test_vector() {
        // RFC 4231, test case 2.
        assert_eq!(
            hmac_sha256_hex("Jefe", "what do ya want for nothing?"),
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }

    #[test]
    fn merge_keeps_vanished_devices_as_offline() {
        let previous = vec![
            DeviceInfo {
                sn: "A".into(),
                name: "alpha".into(),
                product_name: None,
                online: true,
            },
            DeviceInfo {
                sn: "B".into(),
                name: "bravo".into(),
                product_name: None,
                online: true,
            },
        ];
        let fetched = vec![DeviceInfo {
            sn: "A".into(),
            name: "alpha".into(),
            product_name: None,
            online: true,
        }];
        let merged = merge_refreshed(&previous, fetched);
        assert_eq!(merged.len(), 2);
        let bravo = merged.iter().find(|d| d.sn == "B").unwrap();
        assert!(!bravo.online);
    }

    async fn spawn_mock(router: Router) -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        addr
    }

    fn client_for(addr: SocketAddr) -> RestApiClient {
        let mut timing = TimingConfig::default();
        timing.http_backoff_factor = 0.01;
        RestApiClient::with_base_url(
            format!("http://{addr}"),
            "ak".into(),
            "sk".into(),
            timing,
            TransportMetrics::new("ecoflow").unwrap(),
        )
        .unwrap()
    }

    fn device_list_body() -> serde_json::Value {
        serde_json::json!({
            "code": "0",
            "message": "Success",
            "data": [
                {"sn": "R331ZEB4ZEAL0528", "deviceName": "river-2", "productName": "RIVER 2", "online": 1}
            ]
        })
    }

    #[tokio::test]
    async fn establish_primes_the_device_list() {
        let router = Router::new().route(
            DEVICE_LIST_PATH,
            get(|| async { Json(device_list_body()) }),
        );
        let addr = spawn_mock(router).await;
        let client = client_for(addr);

        client.establish().await.unwrap();
        assert_eq!(client.connection_state(), ConnectionState::Connected);

        let device = client.get_device("R331ZEB4ZEAL0528").await.unwrap().unwrap();
        assert_eq!(device.name, "river-2");
        assert!(device.online);
    }

    #[tokio::test]
    async fn quota_poll_produces_a_snapshot() {
        let router = Router::new()
            .route(DEVICE_LIST_PATH, get(|| async { Json(device_list_body()) }))
            .route(
                DEVICE_QUOTA_PATH,
                get(|| async {
                    Json(serde_json::json!({
                        "code": "0",
                        "message": "Success",
                        "data": {"bms_bmsStatus.soc": 87, "inv.inputWatts": 240}
                    }))
                }),
            );
        let addr = spawn_mock(router).await;
        let client = client_for(addr);

        let snapshot = client
            .get_device_quota("R331ZEB4ZEAL0528")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(snapshot.source, SnapshotSource::RestPoll);
        let map = snapshot.values.as_mapping().unwrap();
        assert_eq!(map["bms_bmsStatus.soc"], QuotaValue::UInt(87));
    }

    #[tokio::test]
    async fn offline_device_yields_unavailable_without_a_quota_request() {
        let router = Router::new()
            .route(
                DEVICE_LIST_PATH,
                get(|| async {
                    Json(serde_json::json!({
                        "code": "0",
                        "data": [{"sn": "R331ZEB4ZEAL0528", "deviceName": "river-2", "online": 0}]
                    }))
                }),
            )
            .route(
                DEVICE_QUOTA_PATH,
                get(|| async { Json(serde_json::json!({"code": "0", "data": {}})) }),
            );
        let addr = spawn_mock(router).await;
        let client = client_for(addr);

        let snapshot = client.get_device_quota("R331ZEB4ZEAL0528").await.unwrap();
        assert!(snapshot.is_none());
    }

    #[tokio::test]
    async fn non_success_envelope_code_is_an_api_error() {
        let router = Router::new().route(
            DEVICE_LIST_PATH,
            get(|| async {
                Json(serde_json::json!({"code": "6012", "message": "device not bound"}))
            }),
        );
        let addr = spawn_mock(router).await;
        let client = client_for(addr);

        match client.list_devices().await {
            Err(ApiError::Api { code, message }) => {
                assert_eq!(code, "6012");
                assert_eq!(message, "device not bound");
            }
            other => panic!("expected api error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let hits = Arc::new(AtomicU32::new(0));
        let router = Router::new()
            .route(
                DEVICE_LIST_PATH,
                get(|State(hits): State<Arc<AtomicU32>>| async move {
                    if hits.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(axum::http::StatusCode::INTERNAL_SERVER_ERROR)
                    } else {
                        Ok(Json(device_list_body()))
                    }
                }),
            )
            .with_state(Arc::clone(&hits));
        let addr = spawn_mock(router).await;
        let client = client_for(addr);

        let devices = client.list_devices().await.unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn every_request_attempt_is_observed() {
        let hits = Arc::new(AtomicU32::new(0));
        let router = Router::new()
            .route(
                DEVICE_LIST_PATH,
                get(|State(hits): State<Arc<AtomicU32>>| async move {
                    if hits.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(axum::http::StatusCode::INTERNAL_SERVER_ERROR)
                    } else {
                        Ok(Json(device_list_body()))
                    }
                }),
            )
            .with_state(Arc::clone(&hits));
        let addr = spawn_mock(router).await;

        let registry = prometheus::Registry::new();
        let analytics = TransportMetrics::new("ecoflow").unwrap();
        analytics.register(&registry).unwrap();
        let mut timing = TimingConfig::default();
        timing.http_backoff_factor = 0.01;
        let client = RestApiClient::with_base_url(
            format!("http://{addr}"),
            "ak".into(),
            "sk".into(),
            timing,
            analytics,
        )
        .unwrap();

        client.list_devices().await.unwrap();

        let requests = registry
            .gather()
            .iter()
            .find(|f| f.get_name() == "ecoflow_http_requests_total")
            .map(|f| {
                f.get_metric()
                    .iter()
                    .map(|m| m.get_counter().get_value())
                    .sum::<f64>()
            });
        // One failed attempt plus the successful retry.
        assert_eq!(requests, Some(2.0));
        let latency = registry
            .gather()
            .iter()
            .find(|f| f.get_name() == "ecoflow_http_request_duration_seconds")
            .map(|f| f.get_metric()[0].get_histogram().get_sample_count());
        assert_eq!(latency, Some(2));
    }
}
