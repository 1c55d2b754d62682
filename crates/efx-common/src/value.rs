//! ---
//! efx_section: "01-core-functionality"
//! efx_subsection: "module"
//! efx_type: "source"
//! efx_scope: "code"
//! efx_description: "Shared primitives and utilities for the exporter runtime."
//! efx_version: "v0.1.0"
//! efx_owner: "tbd"
//! ---
use indexmap::IndexMap;
use serde::Serialize;

/// Telemetry value tree shared by the wire decoder, the snapshot cache,
/// and the metric flattener.
///
/// Quota payloads arrive either as JSON objects or as schema-less binary
/// frames; both are normalised into this tagged representation so that
/// downstream consumers can match exhaustively instead of probing types
/// at runtime.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum QuotaValue {
    /// Explicit absence of a value.
    Null,
    /// Boolean scalar, exported as 0/1.
    Bool(bool),
    /// Signed integer scalar.
    Int(i64),
    /// Unsigned integer scalar (varints decode here).
    UInt(u64),
    /// Floating point scalar.
    Float(f64),
    /// UTF-8 text leaf. Not exportable as a gauge.
    String(String),
    /// Raw bytes that were neither a nested message nor UTF-8.
    Bytes(Vec<u8>),
    /// Ordered sequence, flattened with positional labels.
    Sequence(Vec<QuotaValue>),
    /// Keyed mapping, flattened into dotted metric paths.
    Mapping(IndexMap<String, QuotaValue>),
}

impl QuotaValue {
    /// Empty mapping, the identity element for snapshot contents.
    pub fn empty_mapping() -> Self {
        QuotaValue::Mapping(IndexMap::new())
    }

    /// Numeric view of a scalar leaf, if it has one.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            QuotaValue::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            QuotaValue::Int(v) => Some(*v as f64),
            QuotaValue::UInt(v) => Some(*v as f64),
            QuotaValue::Float(v) => Some(*v),
            _ => None,
        }
    }

    /// True for leaves that terminate the flattening recursion.
    pub fn is_scalar(&self) -> bool {
        !matches!(self, QuotaValue::Sequence(_) | QuotaValue::Mapping(_))
    }

    /// Borrow the inner mapping when this value is one.
    pub fn as_mapping(&self) -> Option<&IndexMap<String, QuotaValue>> {
        match self {
            QuotaValue::Mapping(map) => Some(map),
            _ => None,
        }
    }

    /// Convert an arbitrary JSON document into the value tree.
    ///
    /// Numbers prefer the narrowest lossless representation: u64, then
    /// i64, then f64. Object key order is preserved.
    pub fn from_json(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => QuotaValue::Null,
            serde_json::Value::Bool(b) => QuotaValue::Bool(b),
            serde_json::Value::Number(num) => {
                if let Some(v) = num.as_u64() {
                    QuotaValue::UInt(v)
                } else if let Some(v) = num.as_i64() {
                    QuotaValue::Int(v)
                } else {
                    QuotaValue::Float(num.as_f64().unwrap_or(f64::NAN))
                }
            }
            serde_json::Value::String(s) => QuotaValue::String(s),
            serde_json::Value::Array(items) => {
                QuotaValue::Sequence(items.into_iter().map(QuotaValue::from_json).collect())
            }
            serde_json::Value::Object(entries) => QuotaValue::Mapping(
                entries
                    .into_iter()
                    .map(|(key, value)| (key, QuotaValue::from_json(value)))
                    .collect(),
            ),
        }
    }

    /// Convert a JSON object into a mapping, or None for non-objects.
    pub fn mapping_from_json(value: serde_json::Value) -> Option<Self> {
        match QuotaValue::from_json(value) {
            mapping @ QuotaValue::Mapping(_) => Some(mapping),
            _ => None,
        }
    }
}
