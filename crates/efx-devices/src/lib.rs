//! ---
//! efx_section: "03-device-identity"
//! efx_subsection: "module"
//! efx_type: "source"
//! efx_scope: "code"
//! efx_description: "Static device key/name table and friendly-name resolution."
//! efx_version: "v0.1.0"
//! efx_owner: "tbd"
//! ---
//! Device identity resolution.
//!
//! Serial numbers encode the product family in their leading characters.
//! A static JSON table maps those prefixes to a metric-friendly general
//! key and a human-readable product name; on top of that sits the
//! configurable precedence chain deciding which friendly name a device
//! gets on the metrics endpoint.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::{debug, warn};

use efx_common::{DeviceTableConfig, NameSource};

/// Fallback general key when no table entry matches the serial number.
pub const UNKNOWN_GENERAL_KEY: &str = "unknown";

/// Errors raised while loading the device table.
#[derive(Debug, thiserror::Error)]
pub enum DeviceTableError {
    /// The table file exists but could not be read.
    #[error("unable to read device table {path}")]
    Io {
        /// Offending path.
        path: PathBuf,
        /// Underlying I/O failure.
        #[source]
        source: std::io::Error,
    },
    /// The table file is not valid JSON of the expected shape.
    #[error("failed to parse device table {path}")]
    Parse {
        /// Offending path.
        path: PathBuf,
        /// Underlying JSON error.
        #[source]
        source: serde_json::Error,
    },
}

/// One row of the static device table.
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceTableEntry {
    /// Serial-number prefix identifying the product family.
    #[serde(alias = "sn")]
    pub prefix: String,
    /// Human-readable product name.
    pub name: String,
    /// Metric label key for the family.
    #[serde(rename = "generalKey", default)]
    pub general_key: Option<String>,
}

/// The loaded table. Read-only after load.
#[derive(Debug, Clone, Default)]
pub struct DeviceTable {
    entries: Vec<DeviceTableEntry>,
}

impl DeviceTable {
    /// Empty table; every lookup misses.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Load the table from a JSON array file.
    pub fn load(path: &Path) -> Result<Self, DeviceTableError> {
        let contents =
            std::fs::read_to_string(path).map_err(|source| DeviceTableError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        let entries: Vec<DeviceTableEntry> =
            serde_json::from_str(&contents).map_err(|source| DeviceTableError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        debug!(entries = entries.len(), path = %path.display(), "device table loaded");
        Ok(Self { entries })
    }

    /// Longest-prefix match against the serial number.
    pub fn lookup(&self, device_sn: &str) -> Option<&DeviceTableEntry> {
        self.entries
            .iter()
            .filter(|entry| device_sn.starts_with(&entry.prefix))
            .max_by_key(|entry| entry.prefix.len())
    }
}

/// Resolves the general key and friendly name for devices.
#[derive(Debug, Clone)]
pub struct DeviceResolver {
    table: DeviceTable,
    name_override: Option<String>,
    general_key_override: Option<String>,
    precedence: Vec<NameSource>,
}

impl DeviceResolver {
    /// Build a resolver from the device-table configuration.
    ///
    /// A missing table file is tolerated (the table is optional in
    /// deployments that only run one device); a present but broken file
    /// is an error.
    pub fn from_config(config: &DeviceTableConfig) -> Result<Self, DeviceTableError> {
        let table = if config.table_path.exists() {
            DeviceTable::load(&config.table_path)?
        } else {
            warn!(
                path = %config.table_path.display(),
                "device table not found, general keys fall back to \"{}\"",
                UNKNOWN_GENERAL_KEY
            );
            DeviceTable::empty()
        };
        Ok(Self {
            table,
            name_override: config.name_override.clone(),
            general_key_override: config.general_key_override.clone(),
            precedence: config.name_precedence.clone(),
        })
    }

    /// Resolver over an explicit table, bypassing the filesystem.
    pub fn with_table(
        table: DeviceTable,
        name_override: Option<String>,
        general_key_override: Option<String>,
        precedence: Vec<NameSource>,
    ) -> Self {
        Self {
            table,
            name_override,
            general_key_override,
            precedence,
        }
    }

    /// General key for a serial number: explicit override, then the
    /// table's longest prefix match, then the unknown fallback.
    pub fn general_key(&self, device_sn: &str) -> String {
        if let Some(key) = &self.general_key_override {
            return key.clone();
        }
        self.table
            .lookup(device_sn)
            .and_then(|entry| entry.general_key.clone())
            .unwrap_or_else(|| UNKNOWN_GENERAL_KEY.to_owned())
    }

    /// Friendly name for a device, walking the configured precedence
    /// chain. Falls back to the serial number when no source yields a
    /// name, whatever the chain says.
    pub fn device_name(&self, device_sn: &str, api_name: Option<&str>) -> String {
        for source in &self.precedence {
            match source {
                NameSource::Override => {
                    if let Some(name) = &self.name_override {
                        return name.clone();
                    }
                }
                NameSource::Api => {
                    // The vendor fills the name with the SN when the user
                    // never renamed the device; that carries no signal.
                    if let Some(name) = api_name.filter(|n| !n.is_empty() && *n != device_sn) {
                        return name.to_owned();
                    }
                }
                NameSource::Table => {
                    if let Some(entry) = self.table.lookup(device_sn) {
                        return format!("{}-{}", entry.name, sn_suffix(device_sn));
                    }
                }
                NameSource::Serial => return device_sn.to_owned(),
            }
        }
        device_sn.to_owned()
    }
}

/// Last four characters of the serial number, or the whole serial when
/// it is shorter than that.
fn sn_suffix(device_sn: &str) -> &str {
    device_sn
        .char_indices()
        .rev()
        .nth(3)
        .map_or(device_sn, |(idx, _)| &device_sn[idx..])
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn table() -> DeviceTable {
        DeviceTable {
            entries: vec![
                DeviceTableEntry {
                    prefix: "R3".into(),
                    name: "RIVER".into(),
                    general_key: Some("river".into()),
                },
                DeviceTableEntry {
                    prefix: "R331".into(),
                    name: "RIVER 2 Max".into(),
                    general_key: Some("river2max".into()),
                },
            ],
        }
    }

    fn resolver(
        name_override: Option<&str>,
        general_key_override: Option<&str>,
    ) -> DeviceResolver {
        DeviceResolver::with_table(
            table(),
            name_override.map(str::to_owned),
            general_key_override.map(str::to_owned),
            vec![
                NameSource::Override,
                NameSource::Api,
                NameSource::Table,
                NameSource::Serial,
            ],
        )
    }

    #[test]
    fn longest_prefix_wins() {
        let resolver = resolver(None, None);
        assert_eq!(resolver.general_key("R331ZEB4ZEAL0528"), "river2max");
        assert_eq!(resolver.general_key("R351AAAA"), "river");
        assert_eq!(resolver.general_key("HW52ZZZZ"), UNKNOWN_GENERAL_KEY);
    }

    #[test]
    fn general_key_override_beats_the_table() {
        let resolver = resolver(None, Some("custom"));
        assert_eq!(resolver.general_key("R331ZEB4ZEAL0528"), "custom");
    }

    #[test]
    fn name_override_wins_the_chain() {
        let resolver = resolver(Some("garage-battery"), None);
        assert_eq!(
            resolver.device_name("R331ZEB4ZEAL0528", Some("My River")),
            "garage-battery"
        );
    }

    #[test]
    fn api_name_is_ignored_when_it_echoes_the_sn() {
        let resolver = resolver(None, None);
        assert_eq!(
            resolver.device_name("R331ZEB4ZEAL0528", Some("R331ZEB4ZEAL0528")),
            "RIVER 2 Max-0528"
        );
        assert_eq!(
            resolver.device_name("R331ZEB4ZEAL0528", Some("My River")),
            "My River"
        );
    }

    #[test]
    fn unmatched_device_falls_back_to_the_serial() {
        let resolver = resolver(None, None);
        assert_eq!(resolver.device_name("HW52ZZZZ", None), "HW52ZZZZ");
    }

    #[test]
    fn custom_precedence_is_honored() {
        let resolver = DeviceResolver::with_table(
            table(),
            Some("garage-battery".into()),
            None,
            vec![NameSource::Table, NameSource::Override],
        );
        assert_eq!(
            resolver.device_name("R331ZEB4ZEAL0528", None),
            "RIVER 2 Max-0528"
        );
    }

    #[test]
    fn sn_suffix_handles_short_and_multibyte_serials() {
        assert_eq!(sn_suffix("R331ZEB4ZEAL0528"), "0528");
        assert_eq!(sn_suffix("R33"), "R33");
        assert_eq!(sn_suffix(""), "");
        // Multi-byte characters near the tail must not split a char.
        assert_eq!(sn_suffix("R331ZXé8"), "ZXé8");
        assert_eq!(sn_suffix("ßßß"), "ßßß");
    }

    #[test]
    fn table_loads_from_json_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"[{{"sn": "R331", "name": "RIVER 2 Max", "generalKey": "river2max"}}]"#
        )
        .unwrap();

        let table = DeviceTable::load(file.path()).unwrap();
        let entry = table.lookup("R331ZEB4ZEAL0528").unwrap();
        assert_eq!(entry.name, "RIVER 2 Max");
        assert_eq!(entry.general_key.as_deref(), Some("river2max"));
    }

    #[test]
    fn missing_table_file_is_tolerated_by_the_resolver() {
        let config = DeviceTableConfig {
            table_path: PathBuf::from("/nonexistent/devices.json"),
            ..DeviceTableConfig::default()
        };
        let resolver = DeviceResolver::from_config(&config).unwrap();
        assert_eq!(resolver.general_key("R331ZEB4ZEAL0528"), UNKNOWN_GENERAL_KEY);
    }

    #[test]
    fn broken_table_file_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();
        assert!(matches!(
            DeviceTable::load(file.path()),
            Err(DeviceTableError::Parse { .. })
        ));
    }
}
