//! Pluggable serialization of envelopes.
//!
//! The orchestration layer only relies on the envelope fields, so the text
//! form can be swapped without touching anything above the transport.
use thiserror::Error;

use crate::envelope::Message;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("failed to encode message: {0}")]
    Encode(String),
    #[error("failed to decode message: {0}")]
    Decode(String),
}

pub trait Codec: Send + Sync + 'static {
    fn name(&self) -> &'static str;
    fn encode(&self, msg: &Message) -> Result<Vec<u8>, CodecError>;
    fn decode(&self, bytes: &[u8]) -> Result<Message, CodecError>;
}

/// YAML text envelopes, the default wire form.
#[derive(Debug, Clone, Copy, Default)]
pub struct YamlCodec;

impl Codec for YamlCodec {
    fn name(&self) -> &'static str {
        "yaml"
    }

    fn encode(&self, msg: &Message) -> Result<Vec<u8>, CodecError> {
        serde_yaml_bw::to_string(msg)
            .map(String::into_bytes)
            .map_err(|e| CodecError::Encode(e.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> Result<Message, CodecError> {
        let text = std::str::from_utf8(bytes).map_err(|e| CodecError::Decode(e.to_string()))?;
        serde_yaml_bw::from_str(text).map_err(|e| CodecError::Decode(e.to_string()))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn name(&self) -> &'static str {
        "json"
    }

    fn encode(&self, msg: &Message) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(msg).map_err(|e| CodecError::Encode(e.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> Result<Message, CodecError> {
        serde_json::from_slice(bytes).map_err(|e| CodecError::Decode(e.to_string()))
    }
}
