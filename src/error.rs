//! Custom error types for the packet cache.
//!
//! This module defines the primary error type, `CacheError`, for the whole crate.
//! Using the `thiserror` crate, it provides a centralized and consistent way to handle
//! the different kinds of errors that can occur, from malformed packets and invalid
//! query windows to lifecycle misuse and request timeouts.
//!
//! ## Error Hierarchy
//!
//! `CacheError` falls into four broad groups:
//!
//! - **Setup errors** (`NotInitialized`, `InvalidCapacity`, `InvalidState`,
//!   `Configuration`, `Config`): the caller used a component before it was ready or
//!   handed it impossible settings. Fatal to the call, never to the process.
//! - **Input errors** (`InvalidPacket`, `ChannelMismatch`, `InvalidTimeWindow`,
//!   `WindowTooLarge`, `InvalidWaveform`): the packet, query or component set is
//!   malformed. The offending operation is rejected and logged; ingestion continues.
//! - **Query errors** (`IncompatibleSamplingRate`): the query cannot be satisfied as
//!   asked. Surfaced to the caller and never retried internally.
//! - **Transport errors** (`RequestTimedOut`, `ServiceUnavailable`, `RemoteFailure`,
//!   `Json`, `Binary`, `Codec`): only seen at the requestor boundary. The caller decides
//!   whether to retry.
//!
//! Absence of data is *not* an error. Unknown channels and empty windows are reported
//! through [`crate::messages::ReturnCode`].

use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type AppResult<T> = std::result::Result<T, CacheError>;

/// Primary error type for the packet cache.
#[derive(Error, Debug)]
pub enum CacheError {
    /// A component was used before `initialize` was called.
    #[error("{0} not initialized")]
    NotInitialized(&'static str),

    /// The packet failed validation (bad sampling rate, no samples, bad codes).
    #[error("Invalid packet: {0}")]
    InvalidPacket(String),

    /// The packet was routed to a buffer owned by another channel.
    #[error("Packet for {packet} does not belong in buffer for {buffer}")]
    ChannelMismatch {
        /// Channel of the rejected packet
        packet: String,
        /// Channel the buffer was initialized for
        buffer: String,
    },

    /// Waveform components do not form a consistent set.
    #[error("Invalid waveform: {0}")]
    InvalidWaveform(String),

    /// A capacity of zero was requested.
    #[error("Invalid capacity: {0}")]
    InvalidCapacity(String),

    /// Start time exceeds end time.
    #[error("Invalid time window: start {start} exceeds end {end}")]
    InvalidTimeWindow {
        /// Window start in microseconds since the epoch
        start: i64,
        /// Window end in microseconds since the epoch
        end: i64,
    },

    /// The window would produce more output samples than allowed.
    #[error("Time window {start}..{end} exceeds the limit of {limit} output samples")]
    WindowTooLarge {
        /// Window start in microseconds since the epoch
        start: i64,
        /// Window end in microseconds since the epoch
        end: i64,
        /// Largest number of grid points a query may produce
        limit: usize,
    },

    /// Stored packets do not share the requested output sampling rate.
    #[error("Incompatible sampling rate: expected {expected} Hz, found {actual} Hz")]
    IncompatibleSamplingRate {
        /// Requested output rate
        expected: f64,
        /// Offending packet rate
        actual: f64,
    },

    /// A lifecycle transition was requested from the wrong state.
    #[error("Invalid service state: cannot {operation} while {state}")]
    InvalidState {
        /// The attempted operation
        operation: &'static str,
        /// The state the service was in
        state: String,
    },

    /// The requestor did not receive a reply in time.
    #[error("Request timed out after {0:?}")]
    RequestTimedOut(Duration),

    /// The service is not accepting requests.
    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    /// The service answered with a failure message.
    #[error("Remote failure: {0}")]
    RemoteFailure(String),

    /// JSON encoding or decoding failed.
    #[error("JSON codec error: {0}")]
    Json(#[from] serde_json::Error),

    /// Binary encoding or decoding failed.
    #[error("Binary codec error: {0}")]
    Binary(#[from] bincode::Error),

    /// A message could not be interpreted (wrong type, wrong payload).
    #[error("Codec error: {0}")]
    Codec(String),

    /// Configuration file or environment could not be parsed.
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// Configuration parsed but is semantically invalid.
    #[error("Configuration validation error: {0}")]
    Configuration(String),
}

impl From<figment::Error> for CacheError {
    fn from(value: figment::Error) -> Self {
        CacheError::Config(Box::new(value))
    }
}

impl CacheError {
    /// True when the error came from the requestor boundary and the caller may retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CacheError::RequestTimedOut(_) | CacheError::ServiceUnavailable(_)
        )
    }
}
