//! Boundary to the tracker's command/response protocol.
//!
//! The manager never interprets payloads. It hands inbound bytes to a
//! [`ProtocolCodec`] and forwards whatever comes back, and it asks the codec
//! to turn a named command into the frames to send.

pub mod raw_frame;

use thiserror::Error;

pub use raw_frame::RawFrameCodec;

/// A decoded protocol message tagged with its data type.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedMessage {
    /// Discriminator identifying the semantic type of the message.
    pub data_type: String,
    /// Decoded payload.
    pub payload: serde_json::Value,
}

impl DecodedMessage {
    /// Create a new decoded message.
    pub fn new(data_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            data_type: data_type.into(),
            payload,
        }
    }
}

/// Errors reported by a protocol codec.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// The frame carried no bytes.
    #[error("empty frame")]
    EmptyFrame,

    /// The command name is not known to the codec.
    #[error("unknown command: {command}")]
    UnknownCommand {
        /// The command that was requested.
        command: String,
    },

    /// The frame or arguments are structurally invalid.
    #[error("malformed data: {context}")]
    Malformed {
        /// What was wrong.
        context: String,
    },

    /// The decoder failed internally.
    #[error("decoder failure: {0}")]
    Decoder(String),
}

/// Encoder/decoder for the tracker protocol.
#[cfg_attr(test, mockall::automock)]
pub trait ProtocolCodec: Send + Sync {
    /// Decode one inbound frame.
    fn decode(&self, bytes: &[u8]) -> Result<DecodedMessage, ProtocolError>;

    /// Encode a command into one or more frames, in send order.
    fn encode(&self, command: &str, args: &[u8]) -> Result<Vec<Vec<u8>>, ProtocolError>;
}
