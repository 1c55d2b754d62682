//! ---
//! efx_section: "04-wire-decoding"
//! efx_subsection: "module"
//! efx_type: "source"
//! efx_scope: "code"
//! efx_description: "Telemetry envelope and generic tag-stream decoding."
//! efx_version: "v0.1.0"
//! efx_owner: "tbd"
//! ---
//! Schema-less decoder for binary EcoFlow telemetry frames.
//!
//! Devices publish envelopes carrying one or more headers, each selecting
//! message semantics through a command-function/command-id pair and
//! wrapping a payload encoded as a generic protobuf-style tag stream.
//! No compiled schema is available, so the decoder walks tags
//! generically and recovers nested structure by attempting recursive
//! decoding of length-delimited fields.
//!
//! Only the status-upload pair (`cmd_func=254, cmd_id=21`) is treated as
//! authoritative telemetry; every other frame is logged and discarded
//! without raising an error.

pub mod decoder;
pub mod wire;

pub use decoder::{DecodedFrame, DecodeError, FrameDecoder, STATUS_UPLOAD};
pub use wire::{decode_message, WireType};
