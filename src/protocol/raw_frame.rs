//! Codec that treats the first byte of a frame as its command id.
//!
//! Useful as a stand-in when no vendor codec is available: inbound frames
//! are tagged with their command byte, outbound commands are a hex command
//! id followed by the argument bytes.

use serde_json::json;

use crate::protocol::{DecodedMessage, ProtocolCodec, ProtocolError};
use crate::utils::parse_hex_bytes;

/// Largest frame the tracker accepts in a single write.
pub const MAX_FRAME_LEN: usize = 512;

/// Pass-through codec keyed on the leading command byte.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawFrameCodec;

impl RawFrameCodec {
    /// Data type tag for a command byte, e.g. `cmd_0a`.
    pub fn data_type_for(cmd: u8) -> String {
        format!("cmd_{:02x}", cmd)
    }
}

impl ProtocolCodec for RawFrameCodec {
    fn decode(&self, bytes: &[u8]) -> Result<DecodedMessage, ProtocolError> {
        let (&cmd, payload) = bytes.split_first().ok_or(ProtocolError::EmptyFrame)?;

        Ok(DecodedMessage::new(
            Self::data_type_for(cmd),
            json!({ "cmd": cmd, "payload": payload }),
        ))
    }

    fn encode(&self, command: &str, args: &[u8]) -> Result<Vec<Vec<u8>>, ProtocolError> {
        let id = match parse_hex_bytes(command).as_deref() {
            Some([id]) => *id,
            _ => {
                return Err(ProtocolError::UnknownCommand {
                    command: command.to_string(),
                })
            }
        };

        if args.len() + 1 > MAX_FRAME_LEN {
            return Err(ProtocolError::Malformed {
                context: format!("{} argument bytes exceed frame size", args.len()),
            });
        }

        let mut frame = Vec::with_capacity(args.len() + 1);
        frame.push(id);
        frame.extend_from_slice(args);
        Ok(vec![frame])
    }
}
