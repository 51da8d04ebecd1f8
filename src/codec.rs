//! Envelope encoding for request and response messages.
//!
//! Two formats are supported:
//!
//! - [`MessageFormat::Json`] via `serde_json`: human readable, used for debugging and
//!   for clients outside Rust.
//! - [`MessageFormat::Binary`] via `bincode`: compact, the default between Rust peers.
//!
//! An [`Envelope`] records the message type and the format alongside the payload, so a
//! receiver can route a message without knowing in advance what it holds.

use crate::error::{AppResult, CacheError};
use crate::messages::Message;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Payload encoding.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageFormat {
    /// `serde_json` text.
    Json,
    /// `bincode` bytes.
    #[default]
    Binary,
}

impl fmt::Display for MessageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageFormat::Json => f.write_str("json"),
            MessageFormat::Binary => f.write_str("binary"),
        }
    }
}

impl FromStr for MessageFormat {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "json" => Ok(MessageFormat::Json),
            "binary" | "bincode" => Ok(MessageFormat::Binary),
            other => Err(CacheError::Configuration(format!(
                "Invalid message format '{other}'. Must be one of: json, binary"
            ))),
        }
    }
}

/// An encoded message tagged with its type and format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// [`Message::MESSAGE_TYPE`] of the payload
    pub message_type: String,
    /// Encoding of the payload
    pub format: MessageFormat,
    /// Encoded message
    pub payload: Vec<u8>,
}

impl Envelope {
    /// Encodes a message.
    pub fn encode<M: Message>(message: &M, format: MessageFormat) -> AppResult<Self> {
        let payload = match format {
            MessageFormat::Json => serde_json::to_vec(message)?,
            MessageFormat::Binary => bincode::serialize(message)?,
        };
        Ok(Self {
            message_type: M::MESSAGE_TYPE.to_string(),
            format,
            payload,
        })
    }

    /// Decodes the payload as `M`, failing if the envelope carries another type.
    pub fn decode<M: Message>(&self) -> AppResult<M> {
        if !self.is::<M>() {
            return Err(CacheError::Codec(format!(
                "expected {}, found {}",
                M::MESSAGE_TYPE,
                self.message_type
            )));
        }
        let message = match self.format {
            MessageFormat::Json => serde_json::from_slice(&self.payload)?,
            MessageFormat::Binary => bincode::deserialize(&self.payload)?,
        };
        Ok(message)
    }

    /// True when the envelope carries an `M`.
    pub fn is<M: Message>(&self) -> bool {
        self.message_type == M::MESSAGE_TYPE
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{DataRequest, SensorRequest};
    use crate::packet::ChannelId;

    fn request() -> DataRequest {
        let channel = ChannelId::new("UU", "FORK", "HHZ", "01").unwrap();
        DataRequest::new(channel, 1_000, 2_000).with_identifier(7)
    }

    #[test]
    fn test_json_payload_is_readable() {
        let envelope = Envelope::encode(&request(), MessageFormat::Json).unwrap();
        let text = String::from_utf8(envelope.payload.clone()).unwrap();
        assert!(text.contains("\"identifier\":7"));
        assert_eq!(envelope.decode::<DataRequest>().unwrap(), request());
    }

    #[test]
    fn test_binary_payload_decodes() {
        let envelope = Envelope::encode(&request(), MessageFormat::Binary).unwrap();
        assert!(envelope.is::<DataRequest>());
        assert_eq!(envelope.decode::<DataRequest>().unwrap(), request());
    }

    #[test]
    fn test_wrong_type_is_rejected() {
        let envelope = Envelope::encode(&request(), MessageFormat::Json).unwrap();
        assert!(matches!(
            envelope.decode::<SensorRequest>(),
            Err(CacheError::Codec(_))
        ));
    }

    #[test]
    fn test_corrupt_payload_is_rejected() {
        let mut envelope = Envelope::encode(&request(), MessageFormat::Binary).unwrap();
        envelope.payload.truncate(3);
        assert!(matches!(
            envelope.decode::<DataRequest>(),
            Err(CacheError::Binary(_))
        ));
    }

    #[test]
    fn test_format_parsing() {
        assert_eq!("JSON".parse::<MessageFormat>().unwrap(), MessageFormat::Json);
        assert_eq!("bincode".parse::<MessageFormat>().unwrap(), MessageFormat::Binary);
        assert!("xml".parse::<MessageFormat>().is_err());
    }
}
