//! Request and response messages exchanged with the cache service.
//!
//! Every message carries a caller-chosen `u64` identifier that the matching response
//! echoes, and a stable type string ([`Message::MESSAGE_TYPE`]) used to route encoded
//! envelopes. Absence of data is reported through [`ReturnCode`], never as an error.

use crate::packet::ChannelId;
use crate::waveform::{SingleComponentWaveform, ThreeComponentWaveform};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A routable, serializable message.
pub trait Message: Serialize + DeserializeOwned + Send + 'static {
    /// Stable type string carried by the envelope.
    const MESSAGE_TYPE: &'static str;

    /// Caller-chosen identifier echoed by the response.
    fn identifier(&self) -> u64;
}

/// Outcome reported by every response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReturnCode {
    /// The request was satisfied.
    Success,
    /// The channel is not in the cache.
    NoSensor,
    /// The channel is cached but has nothing in the requested window.
    NoData,
    /// The service does not handle this message type.
    InvalidMessageType,
    /// The message could not be decoded or is inconsistent.
    InvalidMessage,
    /// The time window is malformed (start after end).
    InvalidTimeQuery,
    /// Cached packets do not match the requested output rate.
    IncompatibleSamplingRate,
    /// An internal failure while processing the request.
    AlgorithmicFailure,
}

impl ReturnCode {
    /// True for [`ReturnCode::Success`].
    pub fn is_success(self) -> bool {
        self == ReturnCode::Success
    }

    /// True when the request was valid but nothing could be returned.
    pub fn is_no_data(self) -> bool {
        matches!(self, ReturnCode::NoSensor | ReturnCode::NoData)
    }
}

impl fmt::Display for ReturnCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ReturnCode::Success => "success",
            ReturnCode::NoSensor => "no sensor",
            ReturnCode::NoData => "no data",
            ReturnCode::InvalidMessageType => "invalid message type",
            ReturnCode::InvalidMessage => "invalid message",
            ReturnCode::InvalidTimeQuery => "invalid time query",
            ReturnCode::IncompatibleSamplingRate => "incompatible sampling rate",
            ReturnCode::AlgorithmicFailure => "algorithmic failure",
        };
        f.write_str(text)
    }
}

/// Asks for the list of cached channels.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SensorRequest {
    /// Request identifier
    pub identifier: u64,
}

impl SensorRequest {
    /// Creates a request with the given identifier.
    pub fn new(identifier: u64) -> Self {
        Self { identifier }
    }
}

impl Message for SensorRequest {
    const MESSAGE_TYPE: &'static str = "PacketCache::SensorRequest";

    fn identifier(&self) -> u64 {
        self.identifier
    }
}

/// Cached channels, sorted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SensorResponse {
    /// Identifier of the request being answered
    pub identifier: u64,
    /// Channels with retained packets
    pub sensors: Vec<ChannelId>,
    /// Outcome
    pub return_code: ReturnCode,
}

impl Message for SensorResponse {
    const MESSAGE_TYPE: &'static str = "PacketCache::SensorResponse";

    fn identifier(&self) -> u64 {
        self.identifier
    }
}

/// Asks for one channel over `[start_time, end_time)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataRequest {
    /// Request identifier
    pub identifier: u64,
    /// Channel to read
    pub channel: ChannelId,
    /// Window start (microseconds since the epoch)
    pub start_time: i64,
    /// Window end (microseconds since the epoch, exclusive)
    pub end_time: i64,
    /// Output rate; falls back to the configured rate for the channel
    #[serde(default)]
    pub sampling_rate: Option<f64>,
}

impl DataRequest {
    /// Creates a request with identifier zero and no rate override.
    pub fn new(channel: ChannelId, start_time: i64, end_time: i64) -> Self {
        Self {
            identifier: 0,
            channel,
            start_time,
            end_time,
            sampling_rate: None,
        }
    }

    /// Sets the identifier.
    pub fn with_identifier(mut self, identifier: u64) -> Self {
        self.identifier = identifier;
        self
    }

    /// Overrides the output sampling rate.
    pub fn with_sampling_rate(mut self, sampling_rate: f64) -> Self {
        self.sampling_rate = Some(sampling_rate);
        self
    }
}

impl Message for DataRequest {
    const MESSAGE_TYPE: &'static str = "PacketCache::DataRequest";

    fn identifier(&self) -> u64 {
        self.identifier
    }
}

/// One channel's waveform, present only on success.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataResponse {
    /// Identifier of the request being answered
    pub identifier: u64,
    /// Channel that was requested
    pub channel: ChannelId,
    /// Outcome
    pub return_code: ReturnCode,
    /// Reconstructed waveform
    pub waveform: Option<SingleComponentWaveform>,
}

impl DataResponse {
    /// Response carrying a waveform.
    pub fn success(identifier: u64, waveform: SingleComponentWaveform) -> Self {
        Self {
            identifier,
            channel: waveform.channel().clone(),
            return_code: ReturnCode::Success,
            waveform: Some(waveform),
        }
    }

    /// Response without a waveform.
    pub fn failure(identifier: u64, channel: ChannelId, return_code: ReturnCode) -> Self {
        Self {
            identifier,
            channel,
            return_code,
            waveform: None,
        }
    }
}

impl Message for DataResponse {
    const MESSAGE_TYPE: &'static str = "PacketCache::DataResponse";

    fn identifier(&self) -> u64 {
        self.identifier
    }
}

/// Asks for three components of one station on a shared grid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreeComponentDataRequest {
    /// Request identifier
    pub identifier: u64,
    /// Vertical channel
    pub vertical: ChannelId,
    /// North (or first horizontal) channel
    pub north: ChannelId,
    /// East (or second horizontal) channel
    pub east: ChannelId,
    /// Window start (microseconds since the epoch)
    pub start_time: i64,
    /// Window end (microseconds since the epoch, exclusive)
    pub end_time: i64,
    /// Output rate; falls back to the configured rate for the vertical channel
    #[serde(default)]
    pub sampling_rate: Option<f64>,
}

impl ThreeComponentDataRequest {
    /// Creates a request with identifier zero and no rate override.
    pub fn new(
        vertical: ChannelId,
        north: ChannelId,
        east: ChannelId,
        start_time: i64,
        end_time: i64,
    ) -> Self {
        Self {
            identifier: 0,
            vertical,
            north,
            east,
            start_time,
            end_time,
            sampling_rate: None,
        }
    }

    /// Sets the identifier.
    pub fn with_identifier(mut self, identifier: u64) -> Self {
        self.identifier = identifier;
        self
    }

    /// Overrides the output sampling rate.
    pub fn with_sampling_rate(mut self, sampling_rate: f64) -> Self {
        self.sampling_rate = Some(sampling_rate);
        self
    }

    /// The three channels in vertical, north, east order.
    pub fn channels(&self) -> [&ChannelId; 3] {
        [&self.vertical, &self.north, &self.east]
    }
}

impl Message for ThreeComponentDataRequest {
    const MESSAGE_TYPE: &'static str = "PacketCache::ThreeComponentDataRequest";

    fn identifier(&self) -> u64 {
        self.identifier
    }
}

/// Three aligned components, present only on success.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreeComponentDataResponse {
    /// Identifier of the request being answered
    pub identifier: u64,
    /// Outcome
    pub return_code: ReturnCode,
    /// Reconstructed waveforms
    pub waveform: Option<ThreeComponentWaveform>,
}

impl Message for ThreeComponentDataResponse {
    const MESSAGE_TYPE: &'static str = "PacketCache::ThreeComponentDataResponse";

    fn identifier(&self) -> u64 {
        self.identifier
    }
}

/// Several single-channel requests answered together.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BulkDataRequest {
    /// Request identifier
    pub identifier: u64,
    /// Individual requests, answered in this order
    pub requests: Vec<DataRequest>,
}

impl BulkDataRequest {
    /// Bundles requests under one identifier.
    pub fn new(identifier: u64, requests: Vec<DataRequest>) -> Self {
        Self {
            identifier,
            requests,
        }
    }
}

impl Message for BulkDataRequest {
    const MESSAGE_TYPE: &'static str = "PacketCache::BulkDataRequest";

    fn identifier(&self) -> u64 {
        self.identifier
    }
}

/// Per-request responses in request order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BulkDataResponse {
    /// Identifier of the request being answered
    pub identifier: u64,
    /// Outcome of the bundle as a whole
    pub return_code: ReturnCode,
    /// One response per request
    pub responses: Vec<DataResponse>,
}

impl Message for BulkDataResponse {
    const MESSAGE_TYPE: &'static str = "PacketCache::BulkDataResponse";

    fn identifier(&self) -> u64 {
        self.identifier
    }
}

/// Sent instead of a typed response when a request cannot be answered at all.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureResponse {
    /// Identifier of the request being answered, zero when it could not be decoded
    pub identifier: u64,
    /// Why the request failed
    pub return_code: ReturnCode,
    /// Human-readable detail
    pub details: String,
}

impl Message for FailureResponse {
    const MESSAGE_TYPE: &'static str = "PacketCache::FailureResponse";

    fn identifier(&self) -> u64 {
        self.identifier
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id() -> ChannelId {
        ChannelId::new("UU", "FORK", "HHZ", "01").unwrap()
    }

    #[test]
    fn test_message_types_are_distinct() {
        let types = [
            SensorRequest::MESSAGE_TYPE,
            SensorResponse::MESSAGE_TYPE,
            DataRequest::MESSAGE_TYPE,
            DataResponse::MESSAGE_TYPE,
            ThreeComponentDataRequest::MESSAGE_TYPE,
            ThreeComponentDataResponse::MESSAGE_TYPE,
            BulkDataRequest::MESSAGE_TYPE,
            BulkDataResponse::MESSAGE_TYPE,
            FailureResponse::MESSAGE_TYPE,
        ];
        let unique: std::collections::HashSet<_> = types.iter().collect();
        assert_eq!(unique.len(), types.len());
    }

    #[test]
    fn test_data_request_builder() {
        let request = DataRequest::new(id(), 0, 10)
            .with_identifier(42)
            .with_sampling_rate(40.0);
        assert_eq!(request.identifier(), 42);
        assert_eq!(request.sampling_rate, Some(40.0));
    }

    #[test]
    fn test_missing_sampling_rate_defaults_to_none() {
        let json = r#"{
            "identifier": 1,
            "channel": {"network": "UU", "station": "FORK", "channel": "HHZ", "location": "01"},
            "start_time": 0,
            "end_time": 5
        }"#;
        let request: DataRequest = serde_json::from_str(json).unwrap();
        assert_eq!(request.sampling_rate, None);
        assert_eq!(request.channel, id());
    }

    #[test]
    fn test_return_code_classification() {
        assert!(ReturnCode::Success.is_success());
        assert!(ReturnCode::NoData.is_no_data());
        assert!(ReturnCode::NoSensor.is_no_data());
        assert!(!ReturnCode::InvalidTimeQuery.is_no_data());
        assert_eq!(ReturnCode::NoSensor.to_string(), "no sensor");
    }
}
