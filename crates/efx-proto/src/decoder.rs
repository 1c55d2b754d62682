//! ---
//! efx_section: "04-wire-decoding"
//! efx_subsection: "module"
//! efx_type: "source"
//! efx_scope: "code"
//! efx_description: "Telemetry envelope and generic tag-stream decoding."
//! efx_version: "v0.1.0"
//! efx_owner: "tbd"
//! ---
use base64::Engine;
use efx_common::QuotaValue;
use indexmap::IndexMap;
use tracing::{debug, warn};

use crate::wire::{self, TagReader, WireType};

/// The (command-function, command-id) pair carrying the authoritative
/// device status upload. Every other pair is discarded after logging.
pub const STATUS_UPLOAD: (u64, u64) = (254, 21);

// Header field numbers of the vendor envelope scheme.
const HDR_PDATA: u32 = 1;
const HDR_SRC: u32 = 2;
const HDR_ENC_TYPE: u32 = 6;
const HDR_CMD_FUNC: u32 = 8;
const HDR_CMD_ID: u32 = 9;
const HDR_DATA_LEN: u32 = 10;
const HDR_SEQ: u32 = 14;

// Sources >= this value publish unobfuscated payloads regardless of the
// enc_type flag.
const SRC_PLAINTEXT: u64 = 32;

/// Failure while decoding one binary frame.
///
/// These are always scoped to the offending frame: callers log and drop
/// the frame, they never tear down the connection.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    /// The stream ended in the middle of the named element.
    #[error("truncated frame while reading {0}")]
    Truncated(&'static str),
    /// The stream is structurally invalid.
    #[error("malformed frame: {0}")]
    Malformed(&'static str),
    /// A tag used a wire type outside the supported scheme.
    #[error("unsupported wire type {0}")]
    UnsupportedWireType(u8),
    /// The envelope contained no headers at all.
    #[error("envelope carried no headers")]
    EmptyEnvelope,
}

/// One frame decoded out of an envelope, before command filtering.
#[derive(Debug, Clone)]
pub struct DecodedFrame {
    /// Command function selecting the message family.
    pub cmd_func: u64,
    /// Command id within the family.
    pub cmd_id: u64,
    /// De-obfuscated payload bytes.
    pub pdata: Vec<u8>,
}

#[derive(Debug, Default)]
struct HeaderFields {
    pdata: Vec<u8>,
    src: u64,
    enc_type: u64,
    cmd_func: u64,
    cmd_id: u64,
    data_len: Option<u64>,
    seq: u64,
}

/// Decoder for binary telemetry envelopes.
///
/// Stateless; one instance serves every frame of a connection.
#[derive(Debug, Default, Clone)]
pub struct FrameDecoder;

impl FrameDecoder {
    /// Create a decoder.
    pub fn new() -> Self {
        Self
    }

    /// Decode a raw bus payload into a telemetry value tree.
    ///
    /// Some devices wrap the envelope in base64; that layer is peeled
    /// off first when the payload strictly decodes as base64. Frames
    /// whose command pair is not [`STATUS_UPLOAD`] are logged and
    /// skipped; a malformed payload inside one matching frame drops that
    /// frame only. The returned mapping is empty when no authoritative
    /// frame was present.
    pub fn decode(&self, raw: &[u8]) -> Result<QuotaValue, DecodeError> {
        let unwrapped = base64::engine::general_purpose::STANDARD
            .decode(raw)
            .ok()
            .filter(|decoded| !decoded.is_empty());
        let envelope = unwrapped.as_deref().unwrap_or(raw);

        let headers = parse_envelope(envelope)?;
        if headers.is_empty() {
            return Err(DecodeError::EmptyEnvelope);
        }

        let mut result: IndexMap<String, QuotaValue> = IndexMap::new();
        for header in headers {
            let frame = into_frame(header);
            if (frame.cmd_func, frame.cmd_id) != STATUS_UPLOAD {
                debug!(
                    cmd_func = frame.cmd_func,
                    cmd_id = frame.cmd_id,
                    payload = %hex::encode(&frame.pdata),
                    "skipping non-status frame"
                );
                continue;
            }
            match wire::decode_fields(&frame.pdata) {
                Ok(fields) => {
                    debug!(fields = fields.len(), "decoded status upload");
                    result.extend(fields);
                }
                Err(err) => {
                    warn!(
                        error = %err,
                        payload = %hex::encode(&frame.pdata),
                        "dropping undecodable status frame"
                    );
                }
            }
        }

        Ok(QuotaValue::Mapping(result))
    }
}

/// Walk the outer envelope: every field-1 block is one header.
fn parse_envelope(data: &[u8]) -> Result<Vec<HeaderFields>, DecodeError> {
    let mut reader = TagReader::new(data);
    let mut headers = Vec::new();

    while !reader.is_empty() {
        let (field, wire) = reader.read_tag()?;
        match (field, wire) {
            (1, WireType::LengthDelimited) => {
                headers.push(parse_header(reader.read_bytes()?)?);
            }
            (_, WireType::Varint) => {
                reader.read_varint()?;
            }
            (_, WireType::Fixed32) => {
                reader.read_fixed32()?;
            }
            (_, WireType::Fixed64) => {
                reader.read_fixed64()?;
            }
            (_, WireType::LengthDelimited) => {
                reader.read_bytes()?;
            }
        }
    }

    Ok(headers)
}

fn parse_header(data: &[u8]) -> Result<HeaderFields, DecodeError> {
    let mut reader = TagReader::new(data);
    let mut header = HeaderFields::default();

    while !reader.is_empty() {
        let (field, wire) = reader.read_tag()?;
        match (field, wire) {
            (HDR_PDATA, WireType::LengthDelimited) => {
                header.pdata = reader.read_bytes()?.to_vec();
            }
            (HDR_SRC, WireType::Varint) => header.src = reader.read_varint()?,
            (HDR_ENC_TYPE, WireType::Varint) => header.enc_type = reader.read_varint()?,
            (HDR_CMD_FUNC, WireType::Varint) => header.cmd_func = reader.read_varint()?,
            (HDR_CMD_ID, WireType::Varint) => header.cmd_id = reader.read_varint()?,
            (HDR_DATA_LEN, WireType::Varint) => header.data_len = Some(reader.read_varint()?),
            (HDR_SEQ, WireType::Varint) => header.seq = reader.read_varint()?,
            (_, WireType::Varint) => {
                reader.read_varint()?;
            }
            (_, WireType::Fixed32) => {
                reader.read_fixed32()?;
            }
            (_, WireType::Fixed64) => {
                reader.read_fixed64()?;
            }
            (_, WireType::LengthDelimited) => {
                reader.read_bytes()?;
            }
        }
    }

    if let Some(expected) = header.data_len {
        if expected != header.pdata.len() as u64 {
            return Err(DecodeError::Malformed("payload length mismatch"));
        }
    }

    Ok(header)
}

/// Apply the XOR de-obfuscation rule and strip header bookkeeping.
fn into_frame(header: HeaderFields) -> DecodedFrame {
    let pdata = if header.enc_type == 1 && header.src != SRC_PLAINTEXT {
        let key = (header.seq & 0xff) as u8;
        header.pdata.iter().map(|byte| byte ^ key).collect()
    } else {
        header.pdata
    };
    DecodedFrame {
        cmd_func: header.cmd_func,
        cmd_id: header.cmd_id,
        pdata,
    }
}
