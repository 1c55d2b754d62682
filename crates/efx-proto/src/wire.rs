//! ---
//! efx_section: "04-wire-decoding"
//! efx_subsection: "module"
//! efx_type: "source"
//! efx_scope: "code"
//! efx_description: "Telemetry envelope and generic tag-stream decoding."
//! efx_version: "v0.1.0"
//! efx_owner: "tbd"
//! ---
use efx_common::QuotaValue;
use indexmap::IndexMap;

use crate::decoder::DecodeError;

/// Recursion limit while probing length-delimited fields for nested
/// messages. Real telemetry nests two or three levels deep.
const MAX_DEPTH: usize = 16;

/// Wire types of the external binary tagging scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireType {
    /// Variable-length integer.
    Varint,
    /// Little-endian 64-bit value.
    Fixed64,
    /// Length-prefixed byte block.
    LengthDelimited,
    /// Little-endian 32-bit value.
    Fixed32,
}

impl WireType {
    fn from_raw(raw: u8) -> Result<Self, DecodeError> {
        match raw {
            0 => Ok(WireType::Varint),
            1 => Ok(WireType::Fixed64),
            2 => Ok(WireType::LengthDelimited),
            5 => Ok(WireType::Fixed32),
            other => Err(DecodeError::UnsupportedWireType(other)),
        }
    }
}

/// Cursor over a raw tag stream.
pub(crate) struct TagReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> TagReader<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.pos >= self.buf.len()
    }

    pub(crate) fn read_varint(&mut self) -> Result<u64, DecodeError> {
        let mut value: u64 = 0;
        let mut shift = 0u32;
        loop {
            let byte = *self
                .buf
                .get(self.pos)
                .ok_or(DecodeError::Truncated("varint"))?;
            self.pos += 1;
            if shift >= 64 {
                return Err(DecodeError::Malformed("varint exceeds 64 bits"));
            }
            value |= u64::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
            shift += 7;
        }
    }

    /// Read the next (field-number, wire-type) tag.
    pub(crate) fn read_tag(&mut self) -> Result<(u32, WireType), DecodeError> {
        let key = self.read_varint()?;
        let field = (key >> 3) as u32;
        if field == 0 {
            return Err(DecodeError::Malformed("field number zero"));
        }
        let wire = WireType::from_raw((key & 0x07) as u8)?;
        Ok((field, wire))
    }

    pub(crate) fn read_fixed32(&mut self) -> Result<u32, DecodeError> {
        let end = self
            .pos
            .checked_add(4)
            .filter(|end| *end <= self.buf.len())
            .ok_or(DecodeError::Truncated("fixed32"))?;
        let mut raw = [0u8; 4];
        raw.copy_from_slice(&self.buf[self.pos..end]);
        self.pos = end;
        Ok(u32::from_le_bytes(raw))
    }

    pub(crate) fn read_fixed64(&mut self) -> Result<u64, DecodeError> {
        let end = self
            .pos
            .checked_add(8)
            .filter(|end| *end <= self.buf.len())
            .ok_or(DecodeError::Truncated("fixed64"))?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&self.buf[self.pos..end]);
        self.pos = end;
        Ok(u64::from_le_bytes(raw))
    }

    pub(crate) fn read_bytes(&mut self) -> Result<&'a [u8], DecodeError> {
        let len = self.read_varint()?;
        let len = usize::try_from(len).map_err(|_| DecodeError::Malformed("length overflow"))?;
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.buf.len())
            .ok_or(DecodeError::Truncated("length-delimited block"))?;
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }
}

/// Decode a raw tag stream into a mapping keyed by field number.
///
/// Field numbers are rendered as decimal strings so unknown fields stay
/// addressable and forward-compatible. A field number seen more than
/// once accumulates into a sequence, preserving arrival order.
pub fn decode_message(data: &[u8]) -> Result<QuotaValue, DecodeError> {
    decode_fields(data).map(QuotaValue::Mapping)
}

/// Decode a raw tag stream into its field map.
pub(crate) fn decode_fields(data: &[u8]) -> Result<IndexMap<String, QuotaValue>, DecodeError> {
    decode_fields_inner(data, 0)
}

fn decode_message_inner(data: &[u8], depth: usize) -> Result<QuotaValue, DecodeError> {
    decode_fields_inner(data, depth).map(QuotaValue::Mapping)
}

fn decode_fields_inner(
    data: &[u8],
    depth: usize,
) -> Result<IndexMap<String, QuotaValue>, DecodeError> {
    if depth > MAX_DEPTH {
        return Err(DecodeError::Malformed("nesting too deep"));
    }
    let mut reader = TagReader::new(data);
    let mut fields: IndexMap<String, QuotaValue> = IndexMap::new();

    while !reader.is_empty() {
        let (field, wire) = reader.read_tag()?;
        let value = match wire {
            WireType::Varint => QuotaValue::UInt(reader.read_varint()?),
            WireType::Fixed64 => QuotaValue::UInt(reader.read_fixed64()?),
            WireType::Fixed32 => QuotaValue::UInt(u64::from(reader.read_fixed32()?)),
            WireType::LengthDelimited => decode_block(reader.read_bytes()?, depth),
        };
        insert_field(&mut fields, field, value);
    }

    Ok(fields)
}

/// Interpret a length-delimited block without a schema: nested message
/// first, then UTF-8 text, then raw bytes.
fn decode_block(data: &[u8], depth: usize) -> QuotaValue {
    if !data.is_empty() {
        if let Ok(nested) = decode_message_inner(data, depth + 1) {
            return nested;
        }
    }
    match std::str::from_utf8(data) {
        Ok(text) => QuotaValue::String(text.to_owned()),
        Err(_) => QuotaValue::Bytes(data.to_vec()),
    }
}

fn insert_field(fields: &mut IndexMap<String, QuotaValue>, field: u32, value: QuotaValue) {
    let key = field.to_string();
    match fields.get_mut(&key) {
        None => {
            fields.insert(key, value);
        }
        Some(QuotaValue::Sequence(items)) => items.push(value),
        Some(existing) => {
            let first = existing.clone();
            *existing = QuotaValue::Sequence(vec![first, value]);
        }
    }
}

/// Append a varint to an output buffer.
pub fn put_varint(out: &mut Vec<u8>, mut value: u64) {
    loop {
        let mut byte = (value & 0x7f) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if value == 0 {
            return;
        }
    }
}

/// Append a (field-number, wire-type) tag.
pub fn put_tag(out: &mut Vec<u8>, field: u32, wire: WireType) {
    let raw = match wire {
        WireType::Varint => 0,
        WireType::Fixed64 => 1,
        WireType::LengthDelimited => 2,
        WireType::Fixed32 => 5,
    };
    put_varint(out, (u64::from(field) << 3) | raw);
}

/// Append a varint-valued field.
pub fn put_varint_field(out: &mut Vec<u8>, field: u32, value: u64) {
    put_tag(out, field, WireType::Varint);
    put_varint(out, value);
}

/// Append a length-delimited field.
pub fn put_bytes_field(out: &mut Vec<u8>, field: u32, data: &[u8]) {
    put_tag(out, field, WireType::LengthDelimited);
    put_varint(out, data.len() as u64);
    out.extend_from_slice(data);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn varint_round_trip() {
        for value in [0u64, 1, 127, 128, 300, u32::MAX as u64, u64::MAX] {
            let mut buf = Vec::new();
            put_varint(&mut buf, value);
            let mut reader = TagReader::new(&buf);
            assert_eq!(reader.read_varint().unwrap(), value);
            assert!(reader.is_empty());
        }
    }

    #[test]
    fn synthetic_stream_round_trips() {
        let mut buf = Vec::new();
        put_varint_field(&mut buf, 1, 85);
        put_tag(&mut buf, 2, WireType::Fixed32);
        buf.extend_from_slice(&52u32.to_le_bytes());
        put_tag(&mut buf, 3, WireType::Fixed64);
        buf.extend_from_slice(&1234u64.to_le_bytes());
        // Field 900 is unknown to every schema; it must be preserved.
        put_varint_field(&mut buf, 900, 7);

        let decoded = decode_message(&buf).unwrap();
        let map = decoded.as_mapping().unwrap();
        assert_eq!(map["1"], QuotaValue::UInt(85));
        assert_eq!(map["2"], QuotaValue::UInt(52));
        assert_eq!(map["3"], QuotaValue::UInt(1234));
        assert_eq!(map["900"], QuotaValue::UInt(7));
    }

    #[test]
    fn repeated_fields_accumulate_into_sequence() {
        let mut buf = Vec::new();
        put_varint_field(&mut buf, 4, 10);
        put_varint_field(&mut buf, 4, 20);
        put_varint_field(&mut buf, 4, 30);

        let decoded = decode_message(&buf).unwrap();
        let map = decoded.as_mapping().unwrap();
        assert_eq!(
            map["4"],
            QuotaValue::Sequence(vec![
                QuotaValue::UInt(10),
                QuotaValue::UInt(20),
                QuotaValue::UInt(30)
            ])
        );
    }

    #[test]
    fn nested_message_recovers_structure() {
        let mut inner = Vec::new();
        put_varint_field(&mut inner, 1, 85);
        put_varint_field(&mut inner, 2, 42);
        let mut outer = Vec::new();
        put_bytes_field(&mut outer, 7, &inner);

        let decoded = decode_message(&outer).unwrap();
        let map = decoded.as_mapping().unwrap();
        let nested = map["7"].as_mapping().expect("nested mapping");
        assert_eq!(nested["1"], QuotaValue::UInt(85));
        assert_eq!(nested["2"], QuotaValue::UInt(42));
    }

    #[test]
    fn non_message_block_falls_back_to_string_then_bytes() {
        let mut buf = Vec::new();
        put_bytes_field(&mut buf, 5, "DELTA".as_bytes());
        let decoded = decode_message(&buf).unwrap();
        assert_eq!(
            decoded.as_mapping().unwrap()["5"],
            QuotaValue::String("DELTA".into())
        );

        // 0xff 0xfe is neither a valid tag stream nor UTF-8.
        let mut buf = Vec::new();
        put_bytes_field(&mut buf, 5, &[0xff, 0xfe]);
        let decoded = decode_message(&buf).unwrap();
        assert_eq!(
            decoded.as_mapping().unwrap()["5"],
            QuotaValue::Bytes(vec![0xff, 0xfe])
        );
    }

    #[test]
    fn truncated_prefixes_fail_locally_without_panic() {
        let mut buf = Vec::new();
        put_varint_field(&mut buf, 1, 300);
        let mut inner = Vec::new();
        put_varint_field(&mut inner, 2, 99);
        put_bytes_field(&mut buf, 3, &inner);

        for cut in 0..buf.len() {
            // Every strict prefix either decodes (when it happens to end
            // on a field boundary) or errors; it must never panic.
            let _ = decode_message(&buf[..cut]);
        }
        assert!(decode_message(&buf[..buf.len() - 1]).is_err());
    }

    #[test]
    fn rejects_field_number_zero_and_bad_wire_types() {
        // key = 0 encodes field 0 / varint.
        assert!(matches!(
            decode_message(&[0x00, 0x01]),
            Err(DecodeError::Malformed(_))
        ));
        // wire type 3 (group start) is not part of the scheme.
        assert!(matches!(
            decode_message(&[0x0b]),
            Err(DecodeError::UnsupportedWireType(3))
        ));
    }
}
