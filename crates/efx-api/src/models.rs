//! ---
//! efx_section: "02-device-connectivity"
//! efx_subsection: "module"
//! efx_type: "source"
//! efx_scope: "code"
//! efx_description: "Device connectivity contract and transport strategies."
//! efx_version: "v0.1.0"
//! efx_owner: "tbd"
//! ---
use chrono::{DateTime, Utc};
use efx_common::QuotaValue;
use serde::{Deserialize, Serialize};

/// Identity and display metadata for one device.
///
/// Created on discovery/connect; refreshed by REST device-list polling,
/// otherwise static for the process lifetime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Device serial number.
    pub sn: String,
    /// Display name as reported by the vendor API.
    pub name: String,
    /// Product/model name, when the transport can know it.
    pub product_name: Option<String>,
    /// Whether the vendor currently considers the device reachable.
    pub online: bool,
}

/// Where a snapshot's values came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotSource {
    /// Signed REST quota poll.
    RestPoll,
    /// Unsolicited broker push on the property topic.
    Push,
    /// Reply to an active quota request.
    Reply,
}

/// Latest known telemetry state of one device.
///
/// Replaced wholly on each successful fetch or push; never merged
/// field-by-field.
#[derive(Debug, Clone, PartialEq)]
pub struct QuotaSnapshot {
    /// Device this snapshot belongs to.
    pub device_sn: String,
    /// Wall-clock instant the values were captured/received.
    pub captured_at: DateTime<Utc>,
    /// Decoded value tree (always a mapping at the top level).
    pub values: QuotaValue,
    /// Producing transport path.
    pub source: SnapshotSource,
}

impl QuotaSnapshot {
    /// Stamp a value tree as the current snapshot for `device_sn`.
    pub fn now(device_sn: impl Into<String>, values: QuotaValue, source: SnapshotSource) -> Self {
        Self {
            device_sn: device_sn.into(),
            captured_at: Utc::now(),
            values,
            source,
        }
    }
}

/// Connection lifecycle of one transport instance.
///
/// Transitions happen only on connect attempts, connect success,
/// idle-timeout expiry, and send/receive failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// No session; nothing in flight.
    #[default]
    Disconnected,
    /// First connection attempt in progress.
    Connecting,
    /// Session established and subscribed.
    Connected,
    /// Recovering after an idle timeout or receive failure.
    Reconnecting,
}

impl ConnectionState {
    /// True while a (re)connect attempt owns the transport. The
    /// collection loop leaves recovery to the transport in these phases
    /// instead of stacking establish calls on top.
    pub fn is_transitioning(&self) -> bool {
        matches!(self, ConnectionState::Connecting | ConnectionState::Reconnecting)
    }
}
