//! Conversion between characteristic wire values and plain bytes.
//!
//! Depending on the platform binding a characteristic value arrives either
//! as a base64 string or as a native byte buffer. Both decode to the same
//! byte sequence. Writes always go out base64 encoded.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use bytes::Bytes;
use tracing::warn;

/// Platform representation of a characteristic value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireValue {
    /// Base64 encoded string.
    Base64(String),
    /// Native byte buffer.
    Buffer(Bytes),
    /// A value shape the binding could not classify, described by its kind.
    Unrecognized(String),
}

impl From<Vec<u8>> for WireValue {
    fn from(value: Vec<u8>) -> Self {
        Self::Buffer(Bytes::from(value))
    }
}

impl From<String> for WireValue {
    fn from(value: String) -> Self {
        Self::Base64(value)
    }
}

/// Encode bytes into the wire value expected by the write API.
pub fn bytes_to_wire(bytes: &[u8]) -> WireValue {
    WireValue::Base64(STANDARD.encode(bytes))
}

/// Decode a wire value into bytes.
///
/// Never fails: malformed base64 and unrecognized shapes yield an empty
/// sequence.
pub fn wire_to_bytes(value: &WireValue) -> Vec<u8> {
    match value {
        WireValue::Base64(text) => match STANDARD.decode(text.trim()) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Discarding malformed base64 value ({} chars): {}", text.len(), e);
                Vec::new()
            }
        },
        WireValue::Buffer(buffer) => buffer.to_vec(),
        WireValue::Unrecognized(kind) => {
            warn!("Unknown characteristic value type: {}", kind);
            Vec::new()
        }
    }
}
