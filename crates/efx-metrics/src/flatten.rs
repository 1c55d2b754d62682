//! ---
//! efx_section: "05-metrics-exposition"
//! efx_subsection: "module"
//! efx_type: "source"
//! efx_scope: "code"
//! efx_description: "Telemetry flattening, gauge pooling, and the /metrics endpoint."
//! efx_version: "v0.1.0"
//! efx_owner: "tbd"
//! ---
//! Flattening of telemetry value trees into gauge samples.
//!
//! The walk is deterministic: identical trees always produce identical
//! sample sets. Mappings extend the dotted path, sequences contribute
//! positional `index_N` labels, and only numeric (or boolean) leaves
//! become samples. Strings and raw bytes carry no gauge value and are
//! skipped with a debug log.

use efx_common::QuotaValue;
use tracing::debug;

/// Base label set attached to every sample of a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceLabels {
    /// Serial number.
    pub device: String,
    /// Resolved friendly name.
    pub device_name: String,
    /// Product/model name, empty when unknown.
    pub product_name: String,
    /// General key from the device table.
    pub device_general_key: String,
}

impl DeviceLabels {
    /// Label pairs in exposition order.
    pub fn pairs(&self) -> Vec<(String, String)> {
        vec![
            ("device".to_owned(), self.device.clone()),
            ("device_name".to_owned(), self.device_name.clone()),
            ("product_name".to_owned(), self.product_name.clone()),
            (
                "device_general_key".to_owned(),
                self.device_general_key.clone(),
            ),
        ]
    }
}

/// One gauge sample produced by the flattener.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    /// Full metric name including the configured prefix.
    pub name: String,
    /// Label pairs: the device base labels plus positional indices.
    pub labels: Vec<(String, String)>,
    /// Gauge value.
    pub value: f64,
}

/// Flatten a telemetry value tree into gauge samples.
pub fn flatten(prefix: &str, base: &DeviceLabels, values: &QuotaValue) -> Vec<Sample> {
    let mut samples = Vec::new();
    let mut path: Vec<&str> = Vec::new();
    let mut indices: Vec<usize> = Vec::new();
    walk(prefix, base, values, &mut path, &mut indices, &mut samples);
    samples
}

fn walk<'a>(
    prefix: &str,
    base: &DeviceLabels,
    value: &'a QuotaValue,
    path: &mut Vec<&'a str>,
    indices: &mut Vec<usize>,
    samples: &mut Vec<Sample>,
) {
    match value {
        QuotaValue::Mapping(map) => {
            for (key, child) in map {
                path.push(key);
                walk(prefix, base, child, path, indices, samples);
                path.pop();
            }
        }
        QuotaValue::Sequence(seq) => {
            for (index, child) in seq.iter().enumerate() {
                indices.push(index);
                walk(prefix, base, child, path, indices, samples);
                indices.pop();
            }
        }
        leaf => {
            let dotted = path.join(".");
            match leaf.as_f64() {
                Some(value) => {
                    let mut labels = base.pairs();
                    for (depth, index) in indices.iter().enumerate() {
                        labels.push((format!("index_{depth}"), index.to_string()));
                    }
                    samples.push(Sample {
                        name: format!("{prefix}_{}", snake_case(&dotted)),
                        labels,
                        value,
                    });
                }
                None => {
                    debug!(path = %dotted, "skipping non-numeric telemetry leaf");
                }
            }
        }
    }
}

/// Lower a dotted camelCase path into a metric-safe snake_case name.
/// Separators and other non-alphanumeric characters become single
/// underscores.
pub fn snake_case(input: &str) -> String {
    let mut out = String::with_capacity(input.len() + 8);
    let mut prev_separator = true;
    for ch in input.chars() {
        if ch.is_ascii_uppercase() {
            if !prev_separator {
                out.push('_');
            }
            out.push(ch.to_ascii_lowercase());
            prev_separator = false;
        } else if ch.is_ascii_alphanumeric() {
            out.push(ch);
            prev_separator = false;
        } else if !prev_separator {
            out.push('_');
            prev_separator = true;
        }
    }
    out.trim_end_matches('_').to_owned()
}
