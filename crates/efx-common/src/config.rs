//! ---
//! efx_section: "01-core-functionality"
//! efx_subsection: "module"
//! efx_type: "source"
//! efx_scope: "code"
//! efx_description: "Shared primitives and utilities for the exporter runtime."
//! efx_version: "v0.1.0"
//! efx_owner: "tbd"
//! ---
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationSeconds};
use tracing::debug;

use crate::logging::LogFormat;

fn default_rest_api_host() -> String {
    "api-e.ecoflow.com".to_owned()
}

fn default_auth_api_host() -> String {
    "api.ecoflow.com".to_owned()
}

fn default_exporter_listen() -> SocketAddr {
    "0.0.0.0:9090"
        .parse()
        .expect("valid default exporter address")
}

fn default_metric_prefix() -> String {
    "ecoflow".to_owned()
}

fn default_collection_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_quota_request_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_retry_delay() -> Duration {
    Duration::from_secs(30)
}

fn default_establish_attempts() -> u32 {
    3
}

fn default_http_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_http_retries() -> u32 {
    3
}

fn default_http_backoff_factor() -> f64 {
    0.5
}

fn default_device_list_cache_ttl() -> Duration {
    Duration::from_secs(60)
}

fn default_idle_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_keepalive() -> Duration {
    Duration::from_secs(60)
}

fn default_idle_check_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_max_reconnect_delay() -> Duration {
    Duration::from_secs(300)
}

fn default_device_table_path() -> PathBuf {
    PathBuf::from("devices.json")
}

fn default_name_precedence() -> Vec<NameSource> {
    vec![
        NameSource::Override,
        NameSource::Api,
        NameSource::Table,
        NameSource::Serial,
    ]
}

fn default_logging_directory() -> PathBuf {
    PathBuf::from("target/logs")
}

fn default_log_format() -> LogFormat {
    LogFormat::StructuredJson
}

/// Errors raised while loading or validating exporter configuration.
///
/// All of these are fatal and must be surfaced before any network
/// activity takes place.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Both the developer key pair and the account credentials were set.
    #[error(
        "both developer and account credentials provided; \
         use either access_key/secret_key or account_user/account_password, not both"
    )]
    ConflictingCredentials,
    /// Neither credential set was supplied.
    #[error(
        "missing credentials; provide access_key/secret_key (REST polling) \
         or account_user/account_password (MQTT)"
    )]
    MissingCredentials,
    /// One half of a credential pair was supplied without the other.
    #[error("incomplete credential pair: {0}")]
    IncompleteCredentials(&'static str),
    /// The mandatory device serial number is absent.
    #[error("device_sn must be configured (or set ECOFLOW_DEVICE_SN)")]
    MissingDeviceSn,
    /// Structural problem with a numeric/timing parameter.
    #[error("invalid configuration value: {0}")]
    InvalidValue(String),
    /// The configuration file could not be read.
    #[error("unable to read config file {path}")]
    Io {
        /// Offending path.
        path: PathBuf,
        /// Underlying I/O failure.
        #[source]
        source: std::io::Error,
    },
    /// The configuration file could not be parsed.
    #[error("failed to parse config file {path}")]
    Parse {
        /// Offending path.
        path: PathBuf,
        /// Underlying TOML error.
        #[source]
        source: toml::de::Error,
    },
    /// No candidate configuration file exists.
    #[error("no configuration files found. inspected: {0}")]
    NotFound(String),
}

/// Transport strategy selected at startup. Exactly one concrete
/// implementation is instantiated per process; there is no runtime mixing.
#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum TransportKind {
    /// Signed HTTP polling against the developer REST API.
    RestPolling,
    /// Passive push subscription over the vendor MQTT broker.
    #[default]
    MqttPassive,
    /// Request/reply over the vendor MQTT broker.
    MqttActive,
}

impl std::str::FromStr for TransportKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "rest" | "rest-polling" => Ok(TransportKind::RestPolling),
            "mqtt" | "mqtt-passive" => Ok(TransportKind::MqttPassive),
            "device" | "mqtt-active" => Ok(TransportKind::MqttActive),
            other => Err(format!("unknown transport kind: {}", other)),
        }
    }
}

/// Resolved credential set. The two sets are mutually exclusive and the
/// set in use decides which transport family is available.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credentials {
    /// Developer access/secret key pair used for signed REST polling.
    Developer {
        /// Public access key attached to each request.
        access_key: String,
        /// Secret key feeding the HMAC signature.
        secret_key: String,
    },
    /// Account email/password used for MQTT credential acquisition.
    Account {
        /// Account email address.
        user: String,
        /// Account password (base64-encoded on the wire during login).
        password: String,
    },
}

/// Primary configuration object for the exporter daemon.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ExporterConfig {
    /// Serial number of the device this process collects for.
    #[serde(default)]
    pub device_sn: Option<String>,
    /// Developer access key (credential set A).
    #[serde(default)]
    pub access_key: Option<String>,
    /// Developer secret key (credential set A).
    #[serde(default)]
    pub secret_key: Option<String>,
    /// Account email (credential set B).
    #[serde(default)]
    pub account_user: Option<String>,
    /// Account password (credential set B).
    #[serde(default)]
    pub account_password: Option<String>,
    /// Bus transport selector; only consulted for credential set B.
    #[serde(default)]
    pub transport: TransportKind,
    /// Host for the signed developer REST API.
    #[serde(default = "default_rest_api_host")]
    pub rest_api_host: String,
    /// Host for account login and MQTT certification.
    #[serde(default = "default_auth_api_host")]
    pub auth_api_host: String,
    /// Metrics exposition settings.
    #[serde(default)]
    pub exporter: ExporterEndpointConfig,
    /// Timing, timeout, and retry knobs.
    #[serde(default)]
    pub timing: TimingConfig,
    /// Static device table and naming overrides.
    #[serde(default)]
    pub devices: DeviceTableConfig,
    /// Structured logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Metadata describing where an [`ExporterConfig`] was loaded from.
#[derive(Debug, Clone)]
pub struct LoadedExporterConfig {
    /// Parsed and validated configuration.
    pub config: ExporterConfig,
    /// Path of the file the configuration came from.
    pub source: PathBuf,
}

impl ExporterConfig {
    /// Environment variable overriding the config file path.
    pub const ENV_CONFIG_PATH: &'static str = "EFX_CONFIG";

    /// Load configuration from disk, respecting the `EFX_CONFIG` override,
    /// then apply environment overrides and validate.
    pub fn load<P: AsRef<Path>>(candidates: &[P]) -> Result<Self, ConfigError> {
        Ok(Self::load_with_source(candidates)?.config)
    }

    /// Load configuration from disk together with the effective source path.
    pub fn load_with_source<P: AsRef<Path>>(
        candidates: &[P],
    ) -> Result<LoadedExporterConfig, ConfigError> {
        if let Ok(env_path) = std::env::var(Self::ENV_CONFIG_PATH) {
            if !env_path.trim().is_empty() {
                let path = PathBuf::from(env_path);
                let config = Self::from_path(path.clone())?;
                return Ok(LoadedExporterConfig {
                    config,
                    source: path,
                });
            }
        }

        for candidate in candidates {
            if candidate.as_ref().exists() {
                let path = candidate.as_ref().to_path_buf();
                let config = Self::from_path(path.clone())?;
                return Ok(LoadedExporterConfig {
                    config,
                    source: path,
                });
            }
        }

        Err(ConfigError::NotFound(
            candidates
                .iter()
                .map(|p| p.as_ref().display().to_string())
                .collect::<Vec<_>>()
                .join(", "),
        ))
    }

    fn from_path(path: PathBuf) -> Result<Self, ConfigError> {
        debug!(config_path = %path.display(), "loading configuration");
        let contents = fs::read_to_string(&path).map_err(|source| ConfigError::Io {
            path: path.clone(),
            source,
        })?;
        let mut config =
            toml::from_str::<ExporterConfig>(&contents).map_err(|source| ConfigError::Parse {
                path: path.clone(),
                source,
            })?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Overlay process environment variables on top of file values.
    ///
    /// The variable names mirror the historical deployment contract, so
    /// existing container setups keep working without a config file.
    pub fn apply_env_overrides(&mut self) {
        overlay(&mut self.device_sn, "ECOFLOW_DEVICE_SN");
        overlay(&mut self.access_key, "ECOFLOW_ACCESS_KEY");
        overlay(&mut self.secret_key, "ECOFLOW_SECRET_KEY");
        overlay(&mut self.account_user, "ECOFLOW_ACCOUNT_USER");
        overlay(&mut self.account_password, "ECOFLOW_ACCOUNT_PASSWORD");
        overlay(&mut self.devices.name_override, "ECOFLOW_DEVICE_NAME");
        overlay(
            &mut self.devices.general_key_override,
            "ECOFLOW_DEVICE_GENERAL_KEY",
        );
        if let Ok(value) = std::env::var("ECOFLOW_DEVICES_JSON") {
            if !value.trim().is_empty() {
                self.devices.table_path = PathBuf::from(value);
            }
        }
        if let Ok(value) = std::env::var("ECOFLOW_API_TYPE") {
            if let Ok(kind) = value.parse() {
                self.transport = kind;
            }
        }
    }

    /// Resolve the effective credential set, rejecting conflicts.
    ///
    /// This runs before any network activity; supplying both sets is a
    /// configuration error, never a silent preference.
    pub fn credentials(&self) -> Result<Credentials, ConfigError> {
        let has_developer = self.access_key.is_some() || self.secret_key.is_some();
        let has_account = self.account_user.is_some() || self.account_password.is_some();

        if has_developer && has_account {
            return Err(ConfigError::ConflictingCredentials);
        }

        if has_developer {
            let access_key = self
                .access_key
                .clone()
                .ok_or(ConfigError::IncompleteCredentials("access_key missing"))?;
            let secret_key = self
                .secret_key
                .clone()
                .ok_or(ConfigError::IncompleteCredentials("secret_key missing"))?;
            return Ok(Credentials::Developer {
                access_key,
                secret_key,
            });
        }

        if has_account {
            let user = self
                .account_user
                .clone()
                .ok_or(ConfigError::IncompleteCredentials("account_user missing"))?;
            let password = self.account_password.clone().ok_or(
                ConfigError::IncompleteCredentials("account_password missing"),
            )?;
            return Ok(Credentials::Account { user, password });
        }

        Err(ConfigError::MissingCredentials)
    }

    /// Serial number of the configured device.
    pub fn device_sn(&self) -> Result<&str, ConfigError> {
        self.device_sn
            .as_deref()
            .filter(|sn| !sn.trim().is_empty())
            .ok_or(ConfigError::MissingDeviceSn)
    }

    /// Validate structural invariants. Credential conflicts and the
    /// missing serial number are caught here, before any connection is
    /// attempted.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.device_sn()?;
        self.credentials()?;
        self.timing.validate()?;
        if self.devices.name_precedence.is_empty() {
            return Err(ConfigError::InvalidValue(
                "devices.name_precedence must not be empty".to_owned(),
            ));
        }
        Ok(())
    }
}

fn overlay(slot: &mut Option<String>, var: &str) {
    if let Ok(value) = std::env::var(var) {
        if !value.trim().is_empty() {
            *slot = Some(value);
        }
    }
}

/// Metrics exposition endpoint settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExporterEndpointConfig {
    /// Listen address for the pull-based `/metrics` endpoint.
    #[serde(default = "default_exporter_listen")]
    pub listen: SocketAddr,
    /// Prefix prepended to every exported metric name.
    #[serde(default = "default_metric_prefix")]
    pub metric_prefix: String,
}

impl Default for ExporterEndpointConfig {
    fn default() -> Self {
        Self {
            listen: default_exporter_listen(),
            metric_prefix: default_metric_prefix(),
        }
    }
}

/// Timing, timeout, and retry parameters. All durations are whole
/// seconds in the file to match the deployment contract.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingConfig {
    /// Interval between collection ticks.
    #[serde(default = "default_collection_interval")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub collection_interval: Duration,
    /// Interval between active quota requests (mqtt-active only).
    #[serde(default = "default_quota_request_interval")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub quota_request_interval: Duration,
    /// Fixed delay between establishment attempts.
    #[serde(default = "default_retry_delay")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub retry_delay: Duration,
    /// Establishment attempts before the process gives up.
    #[serde(default = "default_establish_attempts")]
    pub establish_attempts: u32,
    /// Per-request HTTP timeout.
    #[serde(default = "default_http_timeout")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub http_timeout: Duration,
    /// Retry attempts for retryable HTTP failures.
    #[serde(default = "default_http_retries")]
    pub http_retries: u32,
    /// Base factor for the HTTP exponential backoff, in seconds.
    #[serde(default = "default_http_backoff_factor")]
    pub http_backoff_factor: f64,
    /// TTL of the REST device-list cache.
    #[serde(default = "default_device_list_cache_ttl")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub device_list_cache_ttl: Duration,
    /// Bus idle timeout before a forced reconnect.
    #[serde(default = "default_idle_timeout")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub idle_timeout: Duration,
    /// MQTT keepalive interval.
    #[serde(default = "default_keepalive")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub keepalive: Duration,
    /// How often the idle watchdog wakes up.
    #[serde(default = "default_idle_check_interval")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub idle_check_interval: Duration,
    /// Upper bound for the reconnect backoff.
    #[serde(default = "default_max_reconnect_delay")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub max_reconnect_delay: Duration,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            collection_interval: default_collection_interval(),
            quota_request_interval: default_quota_request_interval(),
            retry_delay: default_retry_delay(),
            establish_attempts: default_establish_attempts(),
            http_timeout: default_http_timeout(),
            http_retries: default_http_retries(),
            http_backoff_factor: default_http_backoff_factor(),
            device_list_cache_ttl: default_device_list_cache_ttl(),
            idle_timeout: default_idle_timeout(),
            keepalive: default_keepalive(),
            idle_check_interval: default_idle_check_interval(),
            max_reconnect_delay: default_max_reconnect_delay(),
        }
    }
}

impl TimingConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.establish_attempts == 0 {
            return Err(ConfigError::InvalidValue(
                "timing.establish_attempts must be at least 1".to_owned(),
            ));
        }
        if self.http_backoff_factor <= 0.0 {
            return Err(ConfigError::InvalidValue(
                "timing.http_backoff_factor must be positive".to_owned(),
            ));
        }
        if self.max_reconnect_delay < self.idle_check_interval {
            return Err(ConfigError::InvalidValue(
                "timing.max_reconnect_delay must not undercut idle_check_interval".to_owned(),
            ));
        }
        Ok(())
    }
}

/// Sources consulted when deriving the friendly device name, in order.
///
/// The vendor's own precedence is heuristic and undocumented upstream,
/// so it is kept configurable instead of being hard-coded.
#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum NameSource {
    /// Explicit operator-supplied name.
    Override,
    /// Name reported by the API, used only when it differs from the SN.
    Api,
    /// Friendly name from the static device table plus an SN suffix.
    Table,
    /// The bare serial number.
    Serial,
}

/// Static device table location and naming overrides.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceTableConfig {
    /// Path to the JSON device table.
    #[serde(default = "default_device_table_path")]
    pub table_path: PathBuf,
    /// Operator override for the friendly device name.
    #[serde(default)]
    pub name_override: Option<String>,
    /// Operator override for the device general key.
    #[serde(default)]
    pub general_key_override: Option<String>,
    /// Ordered precedence chain for friendly-name resolution.
    #[serde(default = "default_name_precedence")]
    pub name_precedence: Vec<NameSource>,
}

impl Default for DeviceTableConfig {
    fn default() -> Self {
        Self {
            table_path: default_device_table_path(),
            name_override: None,
            general_key_override: None,
            name_precedence: default_name_precedence(),
        }
    }
}

/// Structured logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Directory receiving the rolling log files.
    #[serde(default = "default_logging_directory")]
    pub directory: PathBuf,
    /// Stdout log format.
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
    /// Optional file name prefix for rolled logs.
    #[serde(default)]
    pub file_prefix: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: default_logging_directory(),
            format: default_log_format(),
            file_prefix: None,
        }
    }
}

impl std::str::FromStr for ExporterConfig {
    type Err = ConfigError;

    fn from_str(content: &str) -> Result<Self, Self::Err> {
        let config: ExporterConfig =
            toml::from_str(content).map_err(|source| ConfigError::Parse {
                path: PathBuf::from("<inline>"),
                source,
            })?;
        config.validate()?;
        Ok(config)
    }
}
