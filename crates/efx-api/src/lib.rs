//! ---
//! efx_section: "02-device-connectivity"
//! efx_subsection: "module"
//! efx_type: "source"
//! efx_scope: "code"
//! efx_description: "Device connectivity contract and transport strategies."
//! efx_version: "v0.1.0"
//! efx_owner: "tbd"
//! ---
//! Device connectivity layer for the EcoFlow exporter.
//!
//! Three transport strategies sit behind the [`ApiClient`] contract:
//! signed REST polling ([`RestApiClient`]), passive broker push
//! ([`MqttApiClient`]), and active request/reply over the same broker
//! ([`DeviceApiClient`]). Exactly one implementation is chosen at
//! startup by [`create_client`], keyed on the configured credential set
//! and transport selector.

pub mod analytics;
pub mod auth;
pub mod backoff;
pub mod cache;
pub mod device;
pub mod models;
pub mod mqtt;
pub mod rest;

use std::sync::Arc;

use async_trait::async_trait;
use efx_common::{ConfigError, Credentials, ExporterConfig, TransportKind};

pub use analytics::TransportMetrics;
pub use auth::{MqttAuthentication, MqttCredentials};
pub use backoff::{http_retry_delay, ReconnectBackoff};
pub use cache::SnapshotCache;
pub use device::DeviceApiClient;
pub use models::{ConnectionState, DeviceInfo, QuotaSnapshot, SnapshotSource};
pub use mqtt::MqttApiClient;
pub use rest::RestApiClient;

/// Errors surfaced by the connectivity layer.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// Invalid or conflicting configuration; fatal before any network use.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// Credentials rejected. Non-retryable for REST, retried with
    /// backoff by the bus transports (a credential refresh may resolve it).
    #[error("authentication rejected: {0}")]
    Authentication(String),
    /// Timeouts, 5xx responses, unreachable broker. Retried with bounded
    /// exponential backoff.
    #[error("transient network failure: {0}")]
    Transient(String),
    /// The vendor API answered with a non-success envelope code.
    #[error("api error (code={code}): {message}")]
    Api {
        /// Vendor status code ("0" is success).
        code: String,
        /// Vendor-supplied diagnostic.
        message: String,
    },
    /// A response was syntactically valid but missing required fields.
    #[error("malformed response: missing {0}")]
    MalformedResponse(&'static str),
}

impl ApiError {
    /// Whether the polling transport may retry the failed request.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ApiError::Transient(_))
    }
}

/// Capability contract shared by all transport strategies.
///
/// `get_device_quota` is bounded: past its internal timeout it resolves
/// to `Ok(None)` (Unavailable) rather than hanging or raising.
#[async_trait]
pub trait ApiClient: Send + Sync {
    /// Establish connectivity. Idempotent: calling while already
    /// connected is a no-op.
    async fn establish(&self) -> Result<(), ApiError>;

    /// Devices visible to this transport. Bus transports synthesize the
    /// single configured device.
    async fn list_devices(&self) -> Result<Vec<DeviceInfo>, ApiError>;

    /// Metadata for one device, or None when unknown.
    async fn get_device(&self, device_sn: &str) -> Result<Option<DeviceInfo>, ApiError>;

    /// Latest telemetry snapshot, or None when unavailable.
    async fn get_device_quota(&self, device_sn: &str)
        -> Result<Option<QuotaSnapshot>, ApiError>;

    /// Best-effort teardown: unsubscribe, disconnect, stop timers.
    async fn disconnect(&self);

    /// Current connection lifecycle state.
    fn connection_state(&self) -> ConnectionState;
}

/// Instantiate the transport selected by the configuration.
///
/// Developer credentials select signed REST polling; account credentials
/// select the passive or active bus transport per `config.transport`.
/// Conflicting credential sets have already been rejected by
/// `ExporterConfig::validate`, but the check is repeated here so the
/// factory is safe on its own.
pub fn create_client(
    config: &ExporterConfig,
    analytics: TransportMetrics,
) -> Result<Arc<dyn ApiClient>, ApiError> {
    let device_sn = config.device_sn()?.to_owned();
    match config.credentials()? {
        Credentials::Developer {
            access_key,
            secret_key,
        } => Ok(Arc::new(RestApiClient::new(
            &config.rest_api_host,
            access_key,
            secret_key,
            config.timing.clone(),
            analytics,
        )?)),
        Credentials::Account { user, password } => {
            let auth = MqttAuthentication::new(user, password, &config.auth_api_host);
            match config.transport {
                TransportKind::MqttPassive => Ok(Arc::new(MqttApiClient::new(
                    device_sn,
                    auth,
                    config.timing.clone(),
                    config.devices.name_override.clone(),
                    analytics,
                ))),
                TransportKind::MqttActive => Ok(Arc::new(DeviceApiClient::new(
                    device_sn,
                    auth,
                    config.timing.clone(),
                    config.devices.name_override.clone(),
                    analytics,
                ))),
                TransportKind::RestPolling => Err(ApiError::Config(ConfigError::InvalidValue(
                    "transport rest-polling requires access_key/secret_key credentials"
                        .to_owned(),
                ))),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn analytics() -> TransportMetrics {
        TransportMetrics::new("ecoflow").unwrap()
    }

    fn account_config() -> ExporterConfig {
        ExporterConfig {
            device_sn: Some("R331ZEB4ZEAL0528".to_owned()),
            account_user: Some("user@example.com".to_owned()),
            account_password: Some("hunter2".to_owned()),
            ..ExporterConfig::default()
        }
    }

    #[test]
    fn factory_rejects_conflicting_credentials_without_io() {
        let mut config = account_config();
        config.access_key = Some("ak".into());
        config.secret_key = Some("sk".into());
        assert!(matches!(
            create_client(&config, analytics()),
            Err(ApiError::Config(ConfigError::ConflictingCredentials))
        ));
    }

    #[test]
    fn factory_rejects_rest_selector_for_account_credentials() {
        let mut config = account_config();
        config.transport = TransportKind::RestPolling;
        assert!(matches!(
            create_client(&config, analytics()),
            Err(ApiError::Config(ConfigError::InvalidValue(_)))
        ));
    }

    #[test]
    fn factory_builds_each_transport() {
        let mut config = account_config();
        assert!(create_client(&config, analytics()).is_ok());

        config.transport = TransportKind::MqttActive;
        assert!(create_client(&config, analytics()).is_ok());

        config.account_user = None;
        config.account_password = None;
        config.access_key = Some("ak".into());
        config.secret_key = Some("sk".into());
        assert!(create_client(&config, analytics()).is_ok());
    }
}
